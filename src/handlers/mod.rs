mod delete;
mod get;
mod head;
mod options;
mod patch;
mod post;
mod rufh;

use std::collections::HashMap;
use std::ops::Deref;

use base64::Engine;
pub use delete::delete_handler;
pub use get::get_handler;
pub use head::head_handler;
pub use options::options_handler;
pub use patch::patch_handler;
pub use post::post_handler;
use salvo_core::http::{HeaderValue, header};
use salvo_core::{Response, Writer};

use crate::error::ProtocolError;
use crate::{H_TUS_RESUMABLE, TUS_VERSION};

#[derive(Clone, Debug, Default)]
pub struct Metadata(pub HashMap<String, String>);

impl Deref for Metadata {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Metadata {
    /// Parses the `Upload-Metadata` header grammar: comma-separated
    /// `key base64value` pairs. A value-less key maps to the empty string.
    /// Later duplicate keys override earlier ones.
    pub fn parse_metadata(raw: &str) -> Result<Metadata, ProtocolError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Metadata(HashMap::new()));
        }

        let mut map = HashMap::new();

        for item in raw.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }

            let (key, b64) = match item.split_once(' ') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (item, ""),
            };

            if key.is_empty() || key.contains(' ') || key.contains(',') {
                return Err(ProtocolError::InvalidMetadata);
            }

            let value = if b64.is_empty() {
                String::new()
            } else {
                match base64::engine::general_purpose::STANDARD.decode(b64) {
                    Ok(decoded) => String::from_utf8(decoded).unwrap_or_default(),
                    // Invalid base64 values are silently skipped.
                    Err(_) => continue,
                }
            };

            map.insert(key.to_string(), value);
        }

        Ok(Metadata(map))
    }

    /// The inverse of [`Metadata::parse_metadata`]: renders the map back
    /// into the wire grammar for the `Upload-Metadata` response header.
    pub fn stringify(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| {
                let encoded = base64::engine::general_purpose::STANDARD.encode(v.as_bytes());
                format!("{k} {encoded}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GenerateUrlCtx<'a> {
    pub proto: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub id: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct HostProto<'a> {
    pub proto: &'a str,
    pub host: &'a str,
}

/// Headers common to every tus-v1 response: `Tus-Resumable` and
/// `X-Content-Type-Options: nosniff`. Applied by every verb handler right
/// before returning, success or failure alike.
pub fn apply_common_headers(res: &mut Response) {
    res.headers_mut().insert(
        H_TUS_RESUMABLE,
        HeaderValue::from_static(TUS_VERSION),
    );
    res.headers_mut().insert(
        header::HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
}

/// Writes an error response and ensures the common headers are present
/// regardless of the error path taken.
pub async fn write_error(
    err: crate::error::TusError,
    req: &mut salvo_core::Request,
    depot: &mut salvo_core::Depot,
    res: &mut Response,
) {
    err.write(req, depot, res).await;
    apply_common_headers(res);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_basic() {
        let raw = "filename d29ybGQudHh0"; // "world.txt"
        let meta = Metadata::parse_metadata(raw).unwrap();
        assert_eq!(meta.get("filename"), Some(&"world.txt".to_string()));
    }

    #[test]
    fn test_parse_metadata_value_less_key() {
        let meta = Metadata::parse_metadata("is_confidential").unwrap();
        assert_eq!(meta.get("is_confidential"), Some(&String::new()));
    }

    #[test]
    fn test_parse_metadata_skips_invalid_base64() {
        let meta = Metadata::parse_metadata("ok aGVsbG8=,bad ###,also_ok d29ybGQ=").unwrap();
        assert_eq!(meta.get("ok"), Some(&"hello".to_string()));
        assert!(meta.get("bad").is_none());
        assert_eq!(meta.get("also_ok"), Some(&"world".to_string()));
    }

    #[test]
    fn test_parse_metadata_duplicate_last_wins() {
        let meta = Metadata::parse_metadata("k aGk=,k d29ybGQ=").unwrap();
        assert_eq!(meta.get("k"), Some(&"world".to_string()));
    }

    #[test]
    fn test_parse_metadata_empty_is_empty_map() {
        let meta = Metadata::parse_metadata("").unwrap();
        assert!(meta.0.is_empty());
    }

    #[test]
    fn test_parse_metadata_rejects_malformed_key() {
        assert!(Metadata::parse_metadata("bad key aGk=").is_err());
    }

    #[test]
    fn test_stringify_roundtrip() {
        let mut map = HashMap::new();
        map.insert("filename".to_string(), "world.txt".to_string());
        let meta = Metadata(map);
        let wire = meta.stringify();
        let reparsed = Metadata::parse_metadata(&wire).unwrap();
        assert_eq!(reparsed.get("filename"), Some(&"world.txt".to_string()));
    }
}
