use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use salvo_core::{Depot, Request, Response, Router, handler, http::{HeaderValue, StatusCode}};

use crate::{
    CT_OFFSET_OCTET_STREAM, H_CONTENT_LENGTH, H_CONTENT_TYPE, H_TUS_RESUMABLE, H_TUS_VERSION,
    H_UPLOAD_CONCAT, H_UPLOAD_DEFER_LENGTH, H_UPLOAD_DRAFT_INTEROP_VERSION, H_UPLOAD_EXPIRES,
    H_UPLOAD_LENGTH, H_UPLOAD_METADATA, H_UPLOAD_OFFSET, TUS_VERSION, Tus,
    body::{BodyReaderError, CountingBodyReader, classify_short_write, into_byte_stream},
    error::{ProtocolError, TusError}, events::TusEvent,
    handlers::{Metadata, apply_common_headers, rufh, write_error},
    stores::{Extension, UploadInfo},
    utils::{check_tus_version, parse_u64},
};

/// Parsed form of the `Upload-Concat` request header.
enum UploadConcat {
    Partial,
    Final(Vec<String>),
}

fn parse_upload_concat(raw: &str) -> Result<UploadConcat, ProtocolError> {
    let raw = raw.trim();
    if raw == "partial" {
        return Ok(UploadConcat::Partial);
    }
    let Some(rest) = raw.strip_prefix("final;") else {
        return Err(ProtocolError::InvalidConcat);
    };
    let urls: Vec<String> = rest
        .split_whitespace()
        .map(|s| s.trim_end_matches('/').rsplit('/').next().unwrap_or(s).to_string())
        .collect();
    if urls.is_empty() {
        return Err(ProtocolError::InvalidConcat);
    }
    Ok(UploadConcat::Final(urls))
}

/// `201 Created`, `Location: <abs-file-url>`, `Tus-Resumable: 1.0.0`.
#[handler]
async fn create(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = depot.obtain::<Arc<Tus>>().expect("missing tus state");

    if state.options.rufh_enabled
        && let Some(interop_version) = req
            .headers()
            .get(H_UPLOAD_DRAFT_INTEROP_VERSION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    {
        rufh::create_draft(req, depot, res, interop_version).await;
        return;
    }

    let store = &state.store;
    let opts = &state.options;
    apply_common_headers(res);

    if let Err(e) = check_tus_version(
        req.headers()
            .get(H_TUS_RESUMABLE)
            .and_then(|v| v.to_str().ok()),
    ) {
        if matches!(e, ProtocolError::UnsupportedTusVersion(_)) {
            res.headers_mut()
                .insert(H_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
        }
        res.status_code(TusError::Protocol(e).status());
        return;
    }

    let upload_concat = match req
        .headers()
        .get(H_UPLOAD_CONCAT)
        .map(|v| v.to_str().map_err(|_| ProtocolError::InvalidConcat))
        .transpose()
        .and_then(|v| v.map(parse_upload_concat).transpose())
    {
        Ok(v) => v,
        Err(e) => {
            res.status_code(TusError::Protocol(e).status());
            return;
        }
    };

    if upload_concat.is_some() && !store.has_extension(Extension::Concatenation) {
        res.status_code(TusError::Protocol(ProtocolError::UnsupportedConcatenationExtension).status());
        return;
    }

    let content_type = req.headers().get(H_CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let creation_with_upload = match content_type {
        Some(value) if value == CT_OFFSET_OCTET_STREAM => true,
        Some(_) => {
            res.status_code(TusError::Protocol(ProtocolError::InvalidContentType).status());
            return;
        }
        None => false,
    };

    // A final upload carries no chunk of its own, only references.
    if matches!(&upload_concat, Some(UploadConcat::Final(_))) && creation_with_upload {
        res.status_code(TusError::Protocol(ProtocolError::ModifyFinal).status());
        return;
    }
    if creation_with_upload && !store.has_extension(Extension::CreationWithUpload) {
        res.status_code(
            TusError::Protocol(ProtocolError::UnsupportedCreationWithUploadExtension).status(),
        );
        return;
    }

    let upload_length = req.headers().get(H_UPLOAD_LENGTH);
    let upload_defer_length = req.headers().get(H_UPLOAD_DEFER_LENGTH);
    let upload_metadata = req.headers().get(H_UPLOAD_METADATA);
    let is_final = matches!(&upload_concat, Some(UploadConcat::Final(_)));

    if !is_final {
        if upload_defer_length.is_some() && !store.has_extension(Extension::CreationDeferLength) {
            res.status_code(
                TusError::Protocol(ProtocolError::UnsupportedCreationDeferLengthExtension).status(),
            );
            return;
        }
        if let Some(value) = upload_defer_length
            && !matches!(value.to_str(), Ok("1"))
        {
            res.status_code(TusError::Protocol(ProtocolError::InvalidDeferLength).status());
            return;
        }
        if upload_length.is_some() && upload_defer_length.is_some() {
            res.status_code(TusError::Protocol(ProtocolError::AmbiguousLength).status());
            return;
        }
        if upload_length.is_none() && upload_defer_length.is_none() {
            res.status_code(TusError::Protocol(ProtocolError::InvalidLength).status());
            return;
        }
    }

    let metadata = match upload_metadata
        .map(|v| {
            v.to_str()
                .map_err(|_| ProtocolError::InvalidMetadata)
                .and_then(Metadata::parse_metadata)
        })
        .transpose()
    {
        Ok(m) => m,
        Err(e) => {
            res.status_code(TusError::Protocol(e).status());
            return;
        }
    };

    let upload_id = match (opts.upload_id_naming_function)(req, metadata.clone()).await {
        Ok(id) => id,
        Err(err) => {
            res.status_code(err.status());
            return;
        }
    };

    // Size for a final upload is the sum of its (already-finished) partials;
    // resolved after validating each referenced partial below.
    let partial_ids = match &upload_concat {
        Some(UploadConcat::Final(ids)) => ids.clone(),
        _ => Vec::new(),
    };

    let mut upload_length_value = match upload_length {
        Some(value) => match value.to_str() {
            Ok(v) => match parse_u64(Some(v), H_UPLOAD_LENGTH) {
                Ok(size) => Some(size),
                Err(e) => {
                    res.status_code(TusError::Protocol(e).status());
                    return;
                }
            },
            Err(_) => {
                res.status_code(TusError::Protocol(ProtocolError::InvalidInt(H_UPLOAD_LENGTH)).status());
                return;
            }
        },
        None => None,
    };

    if is_final {
        let mut total = 0u64;
        for partial_id in &partial_ids {
            let info = match store.get_upload_file_info(partial_id).await {
                Ok(info) => info,
                Err(e) => {
                    res.status_code(e.status());
                    return;
                }
            };
            if !info.is_complete() {
                res.status_code(TusError::Protocol(ProtocolError::UploadNotFinished).status());
                return;
            }
            total += info.size.unwrap_or(0);
        }
        upload_length_value = Some(total);
    }

    let max_file_size = opts.get_configured_max_size(req, Some(upload_id.clone())).await;
    if let Some(size) = upload_length_value
        && max_file_size > 0
        && size > max_file_size
    {
        res.status_code(TusError::Protocol(ProtocolError::ErrMaxSizeExceeded).status());
        return;
    }

    if let Some(on_incoming_request) = &opts.on_incoming_request {
        on_incoming_request(req, upload_id.clone()).await;
    }

    let mut upload = UploadInfo {
        id: upload_id.clone(),
        size: upload_length_value,
        offset: Some(0),
        metadata,
        is_partial: matches!(&upload_concat, Some(UploadConcat::Partial)),
        is_final,
        creation_date: chrono::Utc::now().to_rfc3339(),
        ..Default::default()
    };

    if let Some(on_upload_create) = &opts.on_upload_create {
        match on_upload_create(req, upload.clone()).await {
            Ok(patch) => {
                if let Some(metadata) = patch.metadata {
                    upload.metadata = Some(metadata);
                }
            }
            Err(e) => {
                res.status_code(e.status());
                return;
            }
        }
    }

    if let Err(e) = store.create(upload.clone()).await {
        res.status_code(e.status());
        return;
    }
    upload = match store.get_upload_file_info(&upload_id).await {
        Ok(info) => info,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    let url = match opts.generate_upload_url(req, &upload_id) {
        Ok(url) => url,
        Err(_) => {
            res.status_code(TusError::GenerateUploadURLError.status());
            return;
        }
    };
    tracing::info!("Generated file url: {}", &url);
    state.events().publish(TusEvent::Created(upload.clone()));

    if is_final {
        match store.concat_uploads(&upload_id, &partial_ids).await {
            Ok(info) => upload = info,
            Err(e) => {
                res.status_code(e.status());
                return;
            }
        }
        state.events().publish(TusEvent::Completed(upload.clone()));
    } else if creation_with_upload {
        let content_length = match req.headers().get(H_CONTENT_LENGTH) {
            Some(value) => match value.to_str() {
                Ok(v) => match parse_u64(Some(v), H_CONTENT_LENGTH) {
                    Ok(size) => Some(size),
                    Err(e) => {
                        res.status_code(TusError::Protocol(e).status());
                        return;
                    }
                },
                Err(_) => {
                    res.status_code(
                        TusError::Protocol(ProtocolError::InvalidInt(H_CONTENT_LENGTH)).status(),
                    );
                    return;
                }
            },
            None => None,
        };

        let max_allowed = match (upload.size, max_file_size) {
            (Some(size), max) if max > 0 => size.min(max),
            (Some(size), _) => size,
            (None, max) if max > 0 => max,
            (None, _) => u64::MAX,
        };
        if let Some(incoming) = content_length
            && incoming > max_allowed
        {
            res.status_code(TusError::Protocol(ProtocolError::ErrMaxSizeExceeded).status());
            return;
        }

        let ctx = state.new_request_context(tracing::info_span!("tus.post.chunk", upload_id = %upload_id));
        let _lock = match opts.acquire_lock(req, &upload_id, &ctx).await {
            Ok(lock) => lock,
            Err(e) => {
                res.status_code(e.status());
                return;
            }
        };

        let events = state.events().clone();
        let event_id = upload_id.clone();
        let declared_size = upload.size;
        let progress_interval = Duration::from_millis(opts.post_receive_interval.unwrap_or(0));
        let last_progress = Arc::new(Mutex::new((Instant::now(), None::<u64>)));

        let body = req.take_body();
        let mut reader =
            CountingBodyReader::new(body, max_allowed).with_read_timeout(opts.network_timeout);
        let bytes_read = reader.bytes_read();
        let on_read_done: crate::body::OnReadDone = Arc::new(move |_bytes| {
            let current = bytes_read.load(Ordering::Acquire);
            let mut last = last_progress.lock().unwrap();
            if last.1 == Some(current) {
                return;
            }
            if last.0.elapsed() < progress_interval && last.1.is_some() {
                return;
            }
            *last = (Instant::now(), Some(current));
            drop(last);
            events.publish(TusEvent::Progress {
                id: event_id.clone(),
                offset: current,
                size: declared_size,
            });
        });
        reader = reader.with_on_read_done(on_read_done);
        let error_handle = reader.error_handle();
        let close_handle = reader.close_handle();
        let stream = into_byte_stream(reader);

        let mut cancel_signal = ctx.cause.signal.clone();
        let write_fut = store.write(&upload_id, 0, stream);
        tokio::pin!(write_fut);
        let (written, write_result) = tokio::select! {
            outcome = &mut write_fut => outcome,
            reason = cancel_signal.cancelled() => {
                let close_reason = match reason {
                    crate::CancellationReason::Abort => BodyReaderError::Closed,
                    crate::CancellationReason::Cancel => BodyReaderError::StoppedByServer,
                };
                close_handle.close(close_reason);
                write_fut.await
            }
        };

        res.headers_mut().insert(
            H_UPLOAD_OFFSET,
            HeaderValue::from_str(&written.to_string()).unwrap(),
        );

        if let Err(e) = write_result {
            write_error(e, req, depot, res).await;
            return;
        }
        if let Err(e) = classify_short_write(error_handle.borrow().clone()) {
            write_error(e, req, depot, res).await;
            return;
        }

        upload.offset = Some(written);

        if upload.is_complete() {
            if let Err(e) = store.finish_upload(&upload_id).await {
                res.status_code(e.status());
                return;
            }
            if let Ok(finished) = store.get_upload_file_info(&upload_id).await {
                upload = finished;
            }
            state.events().publish(TusEvent::Completed(upload.clone()));
        }
    } else if upload.size.is_some_and(|x| x == 0) && !upload.get_size_is_deferred() {
        if let Err(e) = store.finish_upload(&upload_id).await {
            res.status_code(e.status());
            return;
        }
        if let Ok(finished) = store.get_upload_file_info(&upload_id).await {
            upload = finished;
        }
        state.events().publish(TusEvent::Completed(upload.clone()));
    }

    if let Some(expires_at) = &upload.expires_at
        && !upload.is_complete()
        && let Ok(expires) = chrono::DateTime::parse_from_rfc3339(expires_at)
    {
        let expires_value = expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        res.headers_mut().insert(
            H_UPLOAD_EXPIRES,
            HeaderValue::from_str(&expires_value).unwrap(),
        );
    }

    res.status_code(StatusCode::CREATED);

    if let Some(on_upload_finish) = &opts.on_upload_finish
        && upload.is_complete()
    {
        match on_upload_finish(req, upload.clone()).await {
            Ok(patch) => {
                if let Some(status) = patch.status_code {
                    res.status_code(status);
                }
                if let Some(body) = patch.body
                    && res.write_body(body).is_err()
                {
                    res.status_code(
                        TusError::Internal("failed to write response body".into()).status(),
                    );
                    return;
                }
                if let Some(headers) = patch.headers {
                    for (key, value) in headers {
                        if let Some(key) = key
                            && !res.headers_mut().contains_key(&key)
                        {
                            res.headers_mut().insert(key, value);
                        }
                    }
                }
            }
            Err(e) => {
                res.status_code(e.status());
                return;
            }
        }
    }

    let status = res.status_code.unwrap_or(StatusCode::OK);
    if status == StatusCode::CREATED || status.is_redirection() {
        res.headers_mut()
            .insert("Location", HeaderValue::from_str(&url).unwrap());
    }

    if res.body.is_none()
        && !status.is_client_error()
        && !status.is_server_error()
        && !status.is_redirection()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::SWITCHING_PROTOCOLS
    {
        res.render("");
    }
}

pub fn post_handler() -> Router {
    Router::new().post(create)
}
