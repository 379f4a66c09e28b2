use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use salvo_core::{Depot, Request, Response, Router, handler, http::{HeaderValue, StatusCode}};

use crate::{
    CT_OFFSET_OCTET_STREAM, H_CONTENT_TYPE, H_TUS_RESUMABLE, H_UPLOAD_LENGTH, H_UPLOAD_OFFSET,
    Tus, body::{BodyReaderError, CountingBodyReader, classify_short_write, into_byte_stream},
    error::{ProtocolError, TusError}, events::TusEvent,
    handlers::{apply_common_headers, write_error},
    stores::Extension, utils::{check_tus_version, parse_u64},
};

#[handler]
async fn patch(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = depot.obtain::<Arc<Tus>>().expect("missing tus state");
    let opts = &state.options;
    let store = &state.store;
    apply_common_headers(res);

    let id = match opts.get_file_id_from_request(req) {
        Ok(id) => id,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    // 1. Tus-Resumable must equal 1.0.0.
    if let Err(e) = check_tus_version(
        req.headers()
            .get(H_TUS_RESUMABLE)
            .and_then(|v| v.to_str().ok()),
    ) {
        res.status_code(TusError::Protocol(e).status());
        return;
    }

    // 2. Content-Type must be application/offset+octet-stream.
    let content_type = req.headers().get(H_CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type != Some(CT_OFFSET_OCTET_STREAM) {
        res.status_code(TusError::Protocol(ProtocolError::InvalidContentType).status());
        return;
    }

    // 3. Upload-Offset is required.
    let offset = match parse_u64(
        req.headers().get(H_UPLOAD_OFFSET).and_then(|v| v.to_str().ok()),
        H_UPLOAD_OFFSET,
    ) {
        Ok(offset) => offset,
        Err(e) => {
            res.status_code(TusError::Protocol(e).status());
            return;
        }
    };

    if let Some(on_incoming_request) = &opts.on_incoming_request {
        on_incoming_request(req, id.clone()).await;
    }

    let max_file_size = opts.get_configured_max_size(req, Some(id.clone())).await;

    let ctx = state.new_request_context(tracing::info_span!("tus.patch", upload_id = %id));
    let _lock = match opts.acquire_lock(req, &id, &ctx).await {
        Ok(lock) => lock,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    let mut already_uploaded_info = match store.get_upload_file_info(&id).await {
        Ok(info) => info,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    // A final (concatenated) upload is immutable.
    if already_uploaded_info.is_final {
        res.status_code(TusError::Protocol(ProtocolError::ModifyFinal).status());
        return;
    }

    let uploaded_info_offset = already_uploaded_info.offset.unwrap_or(0);

    // Already complete: a retransmitted PATCH for a finished upload is
    // idempotent, not an error.
    if already_uploaded_info.is_complete() {
        res.status_code(StatusCode::NO_CONTENT);
        res.headers_mut().insert(
            H_UPLOAD_OFFSET,
            HeaderValue::from_str(&uploaded_info_offset.to_string()).unwrap(),
        );
        return;
    }

    // 4. Offset mismatch.
    if uploaded_info_offset != offset {
        tracing::info!(
            "mismatched offset: client sent {}, upload is at {}",
            offset,
            uploaded_info_offset
        );
        res.status_code(
            TusError::OffsetMismatch {
                expected: uploaded_info_offset,
                got: offset,
            }
            .status(),
        );
        return;
    }

    if let Some(raw_length) = req.headers().get(H_UPLOAD_LENGTH) {
        let size = match raw_length.to_str() {
            Ok(value) => match parse_u64(Some(value), H_UPLOAD_LENGTH) {
                Ok(size) => size,
                Err(e) => {
                    res.status_code(TusError::Protocol(e).status());
                    return;
                }
            },
            Err(_) => {
                res.status_code(TusError::Protocol(ProtocolError::InvalidInt(H_UPLOAD_LENGTH)).status());
                return;
            }
        };

        if !store.has_extension(Extension::CreationDeferLength) {
            res.status_code(
                TusError::Protocol(ProtocolError::UnsupportedCreationDeferLengthExtension).status(),
            );
            return;
        }
        if already_uploaded_info.size.is_some() {
            res.status_code(TusError::Protocol(ProtocolError::InvalidLength).status());
            return;
        }
        if size < uploaded_info_offset {
            res.status_code(TusError::Protocol(ProtocolError::InvalidLength).status());
            return;
        }
        if max_file_size > 0 && size > max_file_size {
            res.status_code(TusError::Protocol(ProtocolError::ErrMaxSizeExceeded).status());
            return;
        }

        if let Err(e) = store.declare_upload_length(&id, size).await {
            res.status_code(e.status());
            return;
        }
        already_uploaded_info.size = Some(size);
    }

    let remaining = already_uploaded_info.size.map(|size| size.saturating_sub(offset));
    let ceiling = match (remaining, max_file_size) {
        (Some(remaining), max) if max > 0 => remaining.min(max.saturating_sub(offset)),
        (Some(remaining), _) => remaining,
        (None, max) if max > 0 => max.saturating_sub(offset),
        (None, _) => u64::MAX,
    };

    let events = state.events().clone();
    let event_id = id.clone();
    let declared_size = already_uploaded_info.size;
    let progress_interval = Duration::from_millis(opts.post_receive_interval.unwrap_or(0));
    let last_progress = Arc::new(Mutex::new((Instant::now(), None::<u64>)));

    let body = req.take_body();
    let mut reader =
        CountingBodyReader::new(body, ceiling).with_read_timeout(opts.network_timeout);
    let bytes_read = reader.bytes_read();
    let on_read_done: crate::body::OnReadDone = Arc::new(move |_bytes| {
        let current = offset + bytes_read.load(Ordering::Acquire);
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
    let write_fut = store.write(&id, offset, stream);
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

    let new_offset = offset + written;
    res.headers_mut().insert(
        H_UPLOAD_OFFSET,
        HeaderValue::from_str(&new_offset.to_string()).unwrap(),
    );

    if let Err(e) = write_result {
        write_error(e, req, depot, res).await;
        return;
    }
    if let Err(e) = classify_short_write(error_handle.borrow().clone()) {
        write_error(e, req, depot, res).await;
        return;
    }

    let is_complete = already_uploaded_info
        .size
        .is_some_and(|size| size == new_offset);

    if is_complete {
        if let Err(e) = store.finish_upload(&id).await {
            write_error(e, req, depot, res).await;
            return;
        }
        if let Ok(finished) = store.get_upload_file_info(&id).await {
            state.events().publish(TusEvent::Completed(finished));
        }
    }

    // The server MUST acknowledge successful PATCH requests with 204 and the
    // new offset, which is the sum of the pre-request offset and the number
    // of bytes actually received and stored during this request.
    res.status_code(StatusCode::NO_CONTENT);
}

pub fn patch_handler() -> Router {
    Router::with_path("{id}").patch(patch)
}
