//! IETF "Resumable Uploads for HTTP" draft interop (versions 3-5), layered
//! on the same store/locker/event plumbing as the tus-v1 `POST` handler.
//!
//! Triggered only when `Upload-Draft-Interop-Version` is present on the
//! request and [`crate::options::TusOptions::rufh_enabled`] is set; the
//! tus-v1 `create` handler in `post.rs` delegates here before doing any of
//! its own header parsing. Size and metadata come from plain HTTP headers
//! instead of `Upload-Length`/`Upload-Metadata`, and there is exactly one
//! request: the chunk rides along with the upload's creation.
//!
//! The draft specifies a `104 Early Hints`-style informational response
//! carrying `Location` before the body is read. `salvo_core`'s response
//! model has no hook for sending an informational response ahead of the
//! final one, so this implementation skips it and returns `Location` only
//! on the final `201`; a client relying on the early hint still completes
//! correctly, just without the latency benefit.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use salvo_core::{Depot, Request, Response, http::{HeaderValue, StatusCode}};

use crate::{
    H_CONTENT_DISPOSITION, H_CONTENT_LENGTH, H_CONTENT_TYPE, H_UPLOAD_COMPLETE,
    H_UPLOAD_DRAFT_INTEROP_VERSION, H_UPLOAD_INCOMPLETE, H_UPLOAD_OFFSET,
    Tus,
    body::{BodyReaderError, CountingBodyReader, classify_short_write, into_byte_stream},
    error::TusError,
    events::TusEvent,
    handlers::{Metadata, write_error},
    stores::UploadInfo,
    utils::parse_u64,
};

/// Parses an RFC 8941 structured-field boolean: `?1` / `?0`.
fn parse_sf_boolean(raw: &str) -> Option<bool> {
    match raw.trim() {
        "?1" => Some(true),
        "?0" => Some(false),
        _ => None,
    }
}

/// Pulls the `filename` parameter out of a `Content-Disposition` header,
/// e.g. `attachment; filename="notes.txt"`.
fn filename_from_content_disposition(raw: &str) -> Option<String> {
    raw.split(';').skip(1).find_map(|part| {
        let part = part.trim();
        let value = part.strip_prefix("filename=")?;
        Some(value.trim_matches('"').to_string())
    })
}

fn metadata_from_headers(req: &Request) -> Option<Metadata> {
    let mut map = std::collections::HashMap::new();

    if let Some(filename) = req
        .headers()
        .get(H_CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_content_disposition)
    {
        map.insert("filename".to_string(), filename);
    }

    if let Some(content_type) = req.headers().get(H_CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        map.insert("filetype".to_string(), content_type.to_string());
    }

    if map.is_empty() { None } else { Some(Metadata(map)) }
}

/// Whether this request declares the upload complete, per the interop
/// version's header convention. `3` uses `Upload-Incomplete`, `4` and later
/// use `Upload-Complete`. Absence of the flag defaults to complete: a
/// single-shot upload that doesn't say otherwise is assumed to be the whole
/// thing.
fn is_complete(req: &Request, interop_version: &str) -> bool {
    if interop_version == "3" {
        req.headers()
            .get(H_UPLOAD_INCOMPLETE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_sf_boolean)
            .map(|incomplete| !incomplete)
            .unwrap_or(true)
    } else {
        req.headers()
            .get(H_UPLOAD_COMPLETE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_sf_boolean)
            .unwrap_or(true)
    }
}

pub(crate) async fn create_draft(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
    interop_version: String,
) {
    let state = depot.obtain::<Arc<Tus>>().expect("missing tus state");
    let store = &state.store;
    let opts = &state.options;

    res.headers_mut().insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    if let Ok(v) = HeaderValue::from_str(&interop_version) {
        res.headers_mut().insert(H_UPLOAD_DRAFT_INTEROP_VERSION, v);
    }

    let content_length = match req.headers().get(H_CONTENT_LENGTH) {
        Some(value) => match value.to_str() {
            Ok(v) => match parse_u64(Some(v), H_CONTENT_LENGTH) {
                Ok(size) => size,
                Err(e) => {
                    res.status_code(TusError::Protocol(e).status());
                    return;
                }
            },
            Err(_) => {
                res.status_code(StatusCode::BAD_REQUEST);
                return;
            }
        },
        None => {
            res.status_code(StatusCode::LENGTH_REQUIRED);
            return;
        }
    };

    let complete = is_complete(req, &interop_version);
    let upload_length = if complete { Some(content_length) } else { None };

    let metadata = metadata_from_headers(req);

    let upload_id = match (opts.upload_id_naming_function)(req, metadata.clone()).await {
        Ok(id) => id,
        Err(err) => {
            res.status_code(err.status());
            return;
        }
    };

    let max_file_size = opts
        .get_configured_max_size(req, Some(upload_id.clone()))
        .await;
    if max_file_size > 0 && content_length > max_file_size {
        res.status_code(
            TusError::Protocol(crate::error::ProtocolError::ErrMaxSizeExceeded).status(),
        );
        return;
    }

    if let Some(on_incoming_request) = &opts.on_incoming_request {
        on_incoming_request(req, upload_id.clone()).await;
    }

    let mut upload = UploadInfo {
        id: upload_id.clone(),
        size: upload_length,
        offset: Some(0),
        metadata,
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
    state.events().publish(TusEvent::Created(upload.clone()));

    let ctx = state.new_request_context(tracing::info_span!(
        "tus.rufh.create",
        upload_id = %upload_id
    ));
    let _lock = match opts.acquire_lock(req, &upload_id, &ctx).await {
        Ok(lock) => lock,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    let events = state.events().clone();
    let event_id = upload_id.clone();
    let progress_interval = Duration::from_millis(opts.post_receive_interval.unwrap_or(0));
    let last_progress = Arc::new(Mutex::new((Instant::now(), None::<u64>)));

    let body = req.take_body();
    let mut reader =
        CountingBodyReader::new(body, content_length).with_read_timeout(opts.network_timeout);
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
            size: upload_length,
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

    if complete {
        if let Err(e) = store.finish_upload(&upload_id).await {
            res.status_code(e.status());
            return;
        }
        if let Ok(finished) = store.get_upload_file_info(&upload_id).await {
            upload = finished;
        }
        state.events().publish(TusEvent::Completed(upload.clone()));
    }

    if interop_version == "3" {
        res.headers_mut().insert(
            H_UPLOAD_INCOMPLETE,
            HeaderValue::from_static(if complete { "?0" } else { "?1" }),
        );
    } else {
        res.headers_mut().insert(
            H_UPLOAD_COMPLETE,
            HeaderValue::from_static(if complete { "?1" } else { "?0" }),
        );
    }

    res.status_code(StatusCode::CREATED);
    if let Ok(v) = HeaderValue::from_str(&url) {
        res.headers_mut().insert("location", v);
    }
}
