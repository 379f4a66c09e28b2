use salvo_core::http::{HeaderValue, StatusCode, header};
use salvo_core::{Depot, Request, Response, Writer, async_trait};

pub type TusResult<T> = Result<T, TusError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing tus-resumable")]
    MissingTusResumable,
    #[error("unsupported tus version: {0}")]
    UnsupportedTusVersion(String),
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid integer header: {0}")]
    InvalidInt(&'static str),
    #[error("invalid content-type")]
    InvalidContentType,
    #[error("origin not allowed")]
    OriginNotAllowed,

    #[error(
        "Concatenation extension is not (yet) supported. Disable parallel uploads in the tus client."
    )]
    UnsupportedConcatenationExtension,
    #[error("creation-defer-length extension is not (yet) supported.")]
    UnsupportedCreationDeferLengthExtension,
    #[error("creation-with-upload extension is not (yet) supported.")]
    UnsupportedCreationWithUploadExtension,
    #[error("termination extension is not (yet) supported.")]
    UnsupportedTerminationExtension,

    #[error("Upload-Length or Upload-Defer-Length header required.")]
    InvalidLength,
    #[error("Upload-Length and Upload-Defer-Length are mutually exclusive.")]
    AmbiguousLength,
    #[error("invalid Upload-Defer-Length value, only '1' is accepted.")]
    InvalidDeferLength,
    #[error(
        "Upload-Metadata is invalid. It MUST consist of one or more comma-separated key-value pairs. The key and value MUST be separated by a space. The key MUST NOT contain spaces and commas and MUST NOT be empty. The key SHOULD be ASCII encoded and the value MUST be Base64 encoded. All keys MUST be unique"
    )]
    InvalidMetadata,
    #[error("Maximum size exceeded")]
    ErrMaxSizeExceeded,
    #[error("invalid Upload-Concat header")]
    InvalidConcat,
    #[error("cannot modify a final (concatenated) upload")]
    ModifyFinal,
    #[error("referenced partial upload(s) are not finished")]
    UploadNotFinished,
}

#[derive(Debug, thiserror::Error)]
pub enum TusError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("upload not found")]
    NotFound,

    #[error("Upload-Offset conflict")]
    InvalidOffset,

    #[error("offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("upload is locked by another request")]
    Locked,

    #[error("timed out waiting to acquire the upload lock")]
    LockTimeout,

    #[error("failed to generate upload id")]
    GenerateIdError,

    #[error("failed to generate upload url, check your generate url function")]
    GenerateUploadURLError,

    #[error("failed to get file id")]
    FileIdError,

    #[error("file no longer exists")]
    FileNoLongerExists,

    #[error("upload was stopped by a server-side hook: {0}")]
    UploadStopped(String),

    #[error("the incoming upload was rejected by a server-side hook: {0}")]
    UploadRejected(String),

    #[error("the request was interrupted by a competing request for the same upload")]
    UploadInterrupted,

    #[error("the server is shutting down")]
    ServerShutdown,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("timed out waiting for the next chunk of the request body")]
    ReadTimeout,

    #[error("internal: {0}")]
    Internal(String),
}

impl TusError {
    pub fn status(&self) -> StatusCode {
        match self {
            TusError::Protocol(ProtocolError::MissingTusResumable) => {
                StatusCode::PRECONDITION_FAILED
            } // 412
            TusError::Protocol(ProtocolError::UnsupportedTusVersion(_)) => {
                StatusCode::PRECONDITION_FAILED
            } // 412

            TusError::Protocol(ProtocolError::UnsupportedConcatenationExtension) => {
                StatusCode::NOT_IMPLEMENTED
            } // 501
            TusError::Protocol(ProtocolError::UnsupportedCreationDeferLengthExtension) => {
                StatusCode::NOT_IMPLEMENTED
            } // 501
            TusError::Protocol(ProtocolError::UnsupportedCreationWithUploadExtension) => {
                StatusCode::NOT_IMPLEMENTED
            } // 501
            TusError::Protocol(ProtocolError::UnsupportedTerminationExtension) => {
                StatusCode::NOT_IMPLEMENTED
            } // 501
            TusError::Protocol(ProtocolError::InvalidLength) => StatusCode::BAD_REQUEST, // 400
            TusError::Protocol(ProtocolError::AmbiguousLength) => StatusCode::BAD_REQUEST, // 400
            TusError::Protocol(ProtocolError::InvalidDeferLength) => StatusCode::BAD_REQUEST, // 400
            TusError::Protocol(ProtocolError::InvalidMetadata) => StatusCode::BAD_REQUEST, // 400
            TusError::Protocol(ProtocolError::ErrMaxSizeExceeded) => StatusCode::PAYLOAD_TOO_LARGE, /* 413 */
            TusError::Protocol(ProtocolError::InvalidContentType) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            } /* 415 */
            TusError::Protocol(ProtocolError::OriginNotAllowed) => StatusCode::FORBIDDEN, // 403
            TusError::Protocol(ProtocolError::ModifyFinal) => StatusCode::FORBIDDEN,      // 403
            TusError::Protocol(ProtocolError::InvalidConcat) => StatusCode::BAD_REQUEST,  // 400
            TusError::Protocol(ProtocolError::UploadNotFinished) => StatusCode::BAD_REQUEST, // 400
            TusError::Protocol(_) => StatusCode::BAD_REQUEST, // 400

            TusError::FileNoLongerExists => StatusCode::GONE, // 410
            TusError::FileIdError => StatusCode::BAD_REQUEST, // 400
            TusError::NotFound => StatusCode::NOT_FOUND,
            TusError::Locked => StatusCode::LOCKED, // 423
            TusError::LockTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            TusError::OffsetMismatch { .. } => StatusCode::CONFLICT, // 409
            TusError::InvalidOffset => StatusCode::CONFLICT,         // 409
            TusError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE, // 413
            TusError::GenerateIdError => StatusCode::INTERNAL_SERVER_ERROR, // 500
            TusError::GenerateUploadURLError => StatusCode::INTERNAL_SERVER_ERROR, // 500
            TusError::UploadStopped(_) => StatusCode::BAD_REQUEST,
            TusError::UploadRejected(_) => StatusCode::BAD_REQUEST,
            TusError::UploadInterrupted => StatusCode::BAD_REQUEST,
            TusError::ServerShutdown => StatusCode::INTERNAL_SERVER_ERROR,
            TusError::ConnectionReset => StatusCode::INTERNAL_SERVER_ERROR,
            TusError::ReadTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            TusError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The well-known `ERR_<CODE>` wire identifier for this error, per the
    /// plain-text error body format.
    pub fn code(&self) -> &'static str {
        match self {
            TusError::Protocol(ProtocolError::MissingTusResumable) => "ERR_UNSUPPORTED_VERSION",
            TusError::Protocol(ProtocolError::UnsupportedTusVersion(_)) => {
                "ERR_UNSUPPORTED_VERSION"
            }
            TusError::Protocol(ProtocolError::MissingHeader(_)) => "ERR_INVALID_UPLOAD_LENGTH",
            TusError::Protocol(ProtocolError::InvalidInt(_)) => "ERR_INVALID_UPLOAD_LENGTH",
            TusError::Protocol(ProtocolError::InvalidContentType) => "ERR_INVALID_CONTENT_TYPE",
            TusError::Protocol(ProtocolError::OriginNotAllowed) => "ERR_ORIGIN_NOT_ALLOWED",
            TusError::Protocol(ProtocolError::UnsupportedConcatenationExtension) => {
                "ERR_NOT_IMPLEMENTED"
            }
            TusError::Protocol(ProtocolError::UnsupportedCreationDeferLengthExtension) => {
                "ERR_NOT_IMPLEMENTED"
            }
            TusError::Protocol(ProtocolError::UnsupportedCreationWithUploadExtension) => {
                "ERR_NOT_IMPLEMENTED"
            }
            TusError::Protocol(ProtocolError::UnsupportedTerminationExtension) => {
                "ERR_NOT_IMPLEMENTED"
            }
            TusError::Protocol(ProtocolError::InvalidLength) => "ERR_INVALID_UPLOAD_LENGTH",
            TusError::Protocol(ProtocolError::AmbiguousLength) => "ERR_AMBIGUOUS_UPLOAD_LENGTH",
            TusError::Protocol(ProtocolError::InvalidDeferLength) => {
                "ERR_INVALID_UPLOAD_LENGTH_DEFER"
            }
            TusError::Protocol(ProtocolError::InvalidMetadata) => "ERR_INVALID_UPLOAD_LENGTH",
            TusError::Protocol(ProtocolError::ErrMaxSizeExceeded) => "ERR_MAX_SIZE_EXCEEDED",
            TusError::Protocol(ProtocolError::InvalidConcat) => "ERR_INVALID_CONCAT",
            TusError::Protocol(ProtocolError::ModifyFinal) => "ERR_MODIFY_FINAL",
            TusError::Protocol(ProtocolError::UploadNotFinished) => "ERR_UPLOAD_NOT_FINISHED",

            TusError::NotFound => "ERR_UPLOAD_NOT_FOUND",
            TusError::FileNoLongerExists => "ERR_UPLOAD_NOT_FOUND",
            TusError::Locked => "ERR_UPLOAD_LOCKED",
            TusError::LockTimeout => "ERR_LOCK_TIMEOUT",
            TusError::OffsetMismatch { .. } => "ERR_MISMATCHED_OFFSET",
            TusError::InvalidOffset => "ERR_MISMATCHED_OFFSET",
            TusError::PayloadTooLarge => "ERR_UPLOAD_SIZE_EXCEEDED",
            TusError::GenerateIdError => "ERR_INTERNAL_SERVER_ERROR",
            TusError::GenerateUploadURLError => "ERR_INTERNAL_SERVER_ERROR",
            TusError::FileIdError => "ERR_UPLOAD_NOT_FOUND",
            TusError::UploadStopped(_) => "ERR_UPLOAD_STOPPED",
            TusError::UploadRejected(_) => "ERR_UPLOAD_REJECTED",
            TusError::UploadInterrupted => "ERR_UPLOAD_INTERRUPTED",
            TusError::ServerShutdown => "ERR_SERVER_SHUTDOWN",
            TusError::ConnectionReset => "ERR_CONNECTION_RESET",
            TusError::ReadTimeout => "ERR_READ_TIMEOUT",
            TusError::Internal(_) => "ERR_INTERNAL_SERVER_ERROR",
        }
    }
}

/// Renders the error in the plain-text wire format: `Content-Type:
/// text/plain; charset=utf-8`, `Connection: close`, body `ERR_<CODE>:
/// <message>\n`. The HEAD handler strips the body back out after calling
/// this, since HEAD responses must never carry one and the error path is
/// shared across every verb.
#[async_trait]
impl Writer for TusError {
    async fn write(self, _req: &mut Request, _depot: &mut Depot, res: &mut Response) {
        let status = self.status();
        let code = self.code();
        if let TusError::Protocol(ProtocolError::UnsupportedTusVersion(_))
        | TusError::Protocol(ProtocolError::MissingTusResumable) = &self
        {
            res.headers_mut().insert(
                crate::H_TUS_VERSION,
                HeaderValue::from_static(crate::TUS_VERSION),
            );
        }
        let body = format!("{code}: {self}\n");
        res.status_code(status);
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        res.headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        let _ = res.write_body(body);
    }
}
