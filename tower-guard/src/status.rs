use std::fmt;

use crate::context::ContextError;
use crate::error::GuardError;

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "Canceled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::OutOfRange => "OutOfRange",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DataLoss => "DataLoss",
            Code::Unauthenticated => "Unauthenticated",
        }
    }

    /// `Cancelled` or `DeadlineExceeded`: the call ended because a context did.
    pub fn is_context(&self) -> bool {
        matches!(self, Code::Cancelled | Code::DeadlineExceeded)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error result of a call: a code, a message and, when the middleware produced it,
/// the [`GuardError`] that caused it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rpc error: code = {code} desc = {message}")]
pub struct Status {
    code: Code,
    message: String,
    #[source]
    cause: Option<GuardError>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The middleware condition behind this status, if any.
    pub fn cause(&self) -> Option<&GuardError> {
        self.cause.as_ref()
    }
}

impl From<GuardError> for Status {
    fn from(err: GuardError) -> Self {
        let code = match &err {
            GuardError::Context(ContextError::Cancelled) => Code::Cancelled,
            GuardError::Context(ContextError::DeadlineExceeded) => Code::DeadlineExceeded,
            GuardError::AttemptDeadlineExceeded => Code::DeadlineExceeded,
            GuardError::RateLimited { .. } => Code::ResourceExhausted,
            GuardError::Throttled(reason) => reason.code(),
            GuardError::Panicked(_) => Code::Internal,
        };
        Self {
            code,
            message: err.to_string(),
            cause: Some(err),
        }
    }
}

impl From<ContextError> for Status {
    fn from(err: ContextError) -> Self {
        GuardError::Context(err).into()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ThrottleReason;

    #[test]
    fn guard_errors_map_to_codes() {
        let cases = [
            (GuardError::Context(ContextError::Cancelled), Code::Cancelled),
            (
                GuardError::Context(ContextError::DeadlineExceeded),
                Code::DeadlineExceeded,
            ),
            (GuardError::AttemptDeadlineExceeded, Code::DeadlineExceeded),
            (
                GuardError::RateLimited {
                    retry_after: Duration::from_secs(1),
                },
                Code::ResourceExhausted,
            ),
            (
                GuardError::Throttled(ThrottleReason::BacklogTimeout),
                Code::ResourceExhausted,
            ),
            (
                GuardError::Throttled(ThrottleReason::Context(ContextError::Cancelled)),
                Code::Cancelled,
            ),
            (GuardError::Panicked("boom".into()), Code::Internal),
        ];

        for (err, code) in cases {
            let status = Status::from(err.clone());
            assert_eq!(status.code(), code, "{err}");
            assert_eq!(status.cause(), Some(&err));
        }
    }

    #[test]
    fn backlog_timeout_message() {
        let status = Status::from(GuardError::Throttled(ThrottleReason::BacklogTimeout));
        assert_eq!(status.message(), "concurrent call limit exceeded");
        assert_eq!(
            status.to_string(),
            "rpc error: code = ResourceExhausted desc = concurrent call limit exceeded"
        );
    }
}
