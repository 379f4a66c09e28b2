use std::sync::Arc;

use salvo_core::{Depot, Request, Response, Router, handler, http::{HeaderValue, StatusCode}};

use crate::{
    H_TUS_RESUMABLE, H_TUS_VERSION, H_UPLOAD_EXPIRES, TUS_VERSION, Tus,
    error::{ProtocolError, TusError}, handlers::apply_common_headers,
    utils::check_tus_version,
};

#[handler]
async fn head(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = depot.obtain::<Arc<Tus>>().expect("missing tus state");
    let opts = &state.options;
    let store = &state.store;
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

    let id = match opts.get_file_id_from_request(req) {
        Ok(id) => id,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    if let Some(on_incoming_request) = &opts.on_incoming_request {
        on_incoming_request(req, id.clone()).await;
    }

    let ctx = state.new_request_context(tracing::info_span!("tus.head", upload_id = %id));
    let _lock = match opts.acquire_lock(req, &id, &ctx).await {
        Ok(lock) => lock,
        Err(e) => {
            res.status_code(e.status());
            return;
        }
    };

    let upload_info = match store.get_upload_file_info(&id).await {
        Ok(info) => info,
        Err(e) => {
            // If a client resumes an upload the server has since removed, the
            // server SHOULD respond 404 (deleted) or 410 (expired, if the
            // server tracks expiration).
            res.status_code(e.status());
            return;
        }
    };

    if let Some(expires_at) = &upload_info.expires_at
        && let Ok(expires) = chrono::DateTime::parse_from_rfc3339(expires_at)
        && chrono::Utc::now() > expires
    {
        res.status_code(TusError::FileNoLongerExists.status());
        return;
    }

    res.status_code(StatusCode::OK);
    res.headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-store"));

    let Some(offset) = upload_info.offset else {
        res.status_code(TusError::Internal("Upload file's offset value not found!".into()).status());
        return;
    };
    res.headers_mut().insert(
        "Upload-Offset",
        HeaderValue::from_str(&offset.to_string()).unwrap(),
    );

    if upload_info.get_size_is_deferred() {
        res.headers_mut()
            .insert("Upload-Defer-Length", HeaderValue::from_static("1"));
    } else if let Some(size) = upload_info.size {
        res.headers_mut().insert(
            "Upload-Length",
            HeaderValue::from_str(&size.to_string()).unwrap(),
        );
    }

    if upload_info.is_partial {
        res.headers_mut()
            .insert("Upload-Concat", HeaderValue::from_static("partial"));
    } else if upload_info.is_final {
        let value = format!(
            "final;{}",
            upload_info
                .partial_uploads
                .iter()
                .map(|id| opts.generate_upload_url(req, id).unwrap_or_else(|_| id.clone()))
                .collect::<Vec<_>>()
                .join(" ")
        );
        if let Ok(v) = HeaderValue::from_str(&value) {
            res.headers_mut().insert("Upload-Concat", v);
        }
    }

    if let Some(metadata) = &upload_info.metadata
        && let Ok(v) = HeaderValue::from_str(&metadata.stringify())
    {
        res.headers_mut().insert("Upload-Metadata", v);
    }

    if !upload_info.is_complete()
        && let Some(expires_at) = &upload_info.expires_at
        && let Ok(expires) = chrono::DateTime::parse_from_rfc3339(expires_at)
    {
        let expires_value = expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        res.headers_mut().insert(
            H_UPLOAD_EXPIRES,
            HeaderValue::from_str(&expires_value).unwrap(),
        );
    }
}

pub fn head_handler() -> Router {
    Router::with_path("{id}").head(head)
}
