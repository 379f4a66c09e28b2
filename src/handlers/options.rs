use std::sync::Arc;

use salvo_core::{Depot, Request, Response, handler, http::{HeaderValue, StatusCode}};

use crate::stores::Extension;
use crate::{H_TUS_EXTENSION, H_TUS_MAX_SIZE, H_TUS_RESUMABLE, H_TUS_VERSION, TUS_VERSION, Tus};

/// `200 OK` rather than `204 No Content`: some legacy browsers mishandle an
/// empty-body preflight response.
#[handler]
pub async fn options_handler(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let state = depot.obtain::<Arc<Tus>>().expect("missing tus state");
    let opts = &state.options;
    let store = &state.store;

    res.status_code(StatusCode::OK);

    res.headers_mut()
        .insert(H_TUS_VERSION, HeaderValue::from_static(TUS_VERSION));
    res.headers_mut()
        .insert(H_TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));

    if let Some(value) = Extension::to_header_value(&store.extensions()) {
        res.headers_mut().insert(H_TUS_EXTENSION, value);
    }

    if let Some(crate::options::MaxSize::Fixed(size)) = &opts.max_size
        && *size > 0
        && let Ok(value) = HeaderValue::from_str(&size.to_string())
    {
        res.headers_mut().insert(H_TUS_MAX_SIZE, value);
    }

    // `access-control-allow-origin` / `vary` are set per-request by the
    // version/method middleware (see `cors::apply`), run as a hoop ahead of
    // this handler.
    if opts.allowed_credentials {
        res.headers_mut().insert(
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        );
    }

    res.headers_mut().insert(
        "access-control-allow-methods",
        HeaderValue::from_static("OPTIONS, POST, HEAD, PATCH, DELETE, GET"),
    );

    if let Some(h) = req
        .headers()
        .get("access-control-request-headers")
        .and_then(|v| v.to_str().ok())
        && let Ok(v) = HeaderValue::from_str(h)
    {
        res.headers_mut()
            .insert("access-control-allow-headers", v);
    } else {
        let mut allowed =
            "Tus-Resumable, Upload-Length, Upload-Offset, Upload-Metadata, Upload-Concat, \
             Upload-Defer-Length, Content-Type, Content-Length"
                .to_string();
        for extra in &opts.allowed_headers {
            allowed.push_str(", ");
            allowed.push_str(extra);
        }
        if let Ok(v) = HeaderValue::from_str(&allowed) {
            res.headers_mut().insert("access-control-allow-headers", v);
        }
    }

    res.headers_mut()
        .insert("access-control-max-age", HeaderValue::from_static("86400"));

    let mut exposed =
        "Location, Upload-Offset, Upload-Length, Upload-Metadata, Upload-Expires, \
         Tus-Resumable, Tus-Version, Tus-Extension, Tus-Max-Size"
            .to_string();
    for extra in &opts.exposed_headers {
        exposed.push_str(", ");
        exposed.push_str(extra);
    }
    if let Ok(v) = HeaderValue::from_str(&exposed) {
        res.headers_mut().insert("access-control-expose-headers", v);
    }

    res.headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-store"));
}
