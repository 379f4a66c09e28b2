//! Origin policy enforced by the version/method middleware.
//!
//! Every request passes through [`apply`] before reaching a verb handler. An
//! empty `allowed_origins` list means "no restriction": any origin is echoed
//! back. A non-empty list requires the `Origin` header to match one of the
//! configured patterns, each compiled as a regular expression.

use regex::Regex;
use salvo_core::http::{HeaderValue, header};
use salvo_core::{Request, Response};

use crate::error::{ProtocolError, TusError};
use crate::handlers::apply_common_headers;
use crate::options::TusOptions;

/// Applies the CORS origin check and, on success, sets
/// `Access-Control-Allow-Origin` / `Vary: Origin`. Returns `Err(())` after
/// writing a `403 ERR_ORIGIN_NOT_ALLOWED` response when the origin is
/// present but matches none of `opts.allowed_origins`.
pub fn apply(opts: &TusOptions, req: &Request, res: &mut Response) -> Result<(), ()> {
    let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());

    let Some(origin) = origin else {
        return Ok(());
    };

    if !opts.allowed_origins.is_empty() {
        let allowed = opts.allowed_origins.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(origin))
                .unwrap_or(false)
        });
        if !allowed {
            let err = TusError::Protocol(ProtocolError::OriginNotAllowed);
            res.status_code(err.status());
            apply_common_headers(res);
            res.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            res.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            if let Ok(v) = HeaderValue::from_str(&format!("{}: {err}\n", err.code())) {
                let _ = res.write_body(v.as_bytes().to_vec());
            }
            return Err(());
        }
    }

    if let Ok(v) = HeaderValue::from_str(origin) {
        res.headers_mut().insert("access-control-allow-origin", v);
    }
    res.headers_mut()
        .insert("vary", HeaderValue::from_static("origin"));

    Ok(())
}
