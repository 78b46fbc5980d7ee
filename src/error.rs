//! Error taxonomy for the middleware.
//!
//! Every failure the core can produce is one of the kinds below. Nothing in
//! the core recovers from an error: validation failures never reach the
//! dispatcher, sub-query failures are collected and surfaced by the merger,
//! and everything else bubbles straight to the RPC boundary where it is
//! translated into a wire [`Status`](crate::pb::Status).

use thiserror::Error;

use crate::pb;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShardError {
    /// A request parameter violated its bounds or could not be parsed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named table is missing from the metadata store.
    #[error("not found: {0}")]
    NotFound(String),

    /// A backend or the metadata store could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request was canceled before a result could be produced.
    #[error("canceled: {0}")]
    Canceled(String),

    /// An invariant inside the core was violated.
    #[error("internal: {0}")]
    Internal(String),

    /// The operation is reserved and intentionally not served here.
    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

pub type ShardResult<T> = Result<T, ShardError>;

impl ShardError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::Canceled(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented(message.into())
    }

    /// The wire error code for this error kind.
    pub fn code(&self) -> pb::ErrorCode {
        match self {
            Self::InvalidArgument(_) => pb::ErrorCode::InvalidArgument,
            Self::NotFound(_) => pb::ErrorCode::NotFound,
            Self::Unavailable(_) => pb::ErrorCode::Unavailable,
            Self::Canceled(_) => pb::ErrorCode::Canceled,
            Self::Internal(_) => pb::ErrorCode::Internal,
            Self::Unimplemented(_) => pb::ErrorCode::Unimplemented,
        }
    }

    /// The wire status for this error: `(code, reason)`.
    pub fn status(&self) -> pb::Status {
        pb::Status {
            error_code: self.code() as i32,
            reason: self.to_string(),
        }
    }

    /// Reconstruct an error kind from a wire status produced by a backend.
    ///
    /// Unknown codes collapse to [`ShardError::Internal`]; the reason string
    /// is carried through either way.
    pub fn from_wire(error_code: i32, reason: String) -> Self {
        match pb::ErrorCode::try_from(error_code) {
            Ok(pb::ErrorCode::InvalidArgument) => Self::InvalidArgument(reason),
            Ok(pb::ErrorCode::NotFound) => Self::NotFound(reason),
            Ok(pb::ErrorCode::Unavailable) => Self::Unavailable(reason),
            Ok(pb::ErrorCode::Canceled) => Self::Canceled(reason),
            Ok(pb::ErrorCode::Unimplemented) => Self::Unimplemented(reason),
            Ok(pb::ErrorCode::Internal) | Ok(pb::ErrorCode::Success) | Err(_) => {
                Self::Internal(reason)
            }
        }
    }
}

/// The wire status every successful reply carries.
pub fn success_status() -> pb::Status {
    pb::Status {
        error_code: pb::ErrorCode::Success as i32,
        reason: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_carries_code_and_reason() {
        let err = ShardError::not_found("table 'vectors' does not exist");
        let status = err.status();
        assert_eq!(status.error_code, pb::ErrorCode::NotFound as i32);
        assert!(
            status.reason.contains("vectors"),
            "reason was: {}",
            status.reason
        );
    }

    #[test]
    fn wire_round_trip_preserves_kind() {
        let cases = [
            ShardError::invalid_argument("k"),
            ShardError::not_found("t"),
            ShardError::unavailable("b"),
            ShardError::canceled("c"),
            ShardError::internal("i"),
            ShardError::unimplemented("u"),
        ];
        for err in cases {
            let status = err.status();
            let back = ShardError::from_wire(status.error_code, status.reason);
            assert_eq!(back.code(), err.code());
        }
    }

    #[test]
    fn unknown_wire_code_maps_to_internal() {
        let err = ShardError::from_wire(999, "mystery".to_string());
        assert_eq!(err.code(), pb::ErrorCode::Internal);
    }

    #[test]
    fn success_status_is_code_zero() {
        assert_eq!(success_status().error_code, pb::ErrorCode::Success as i32);
    }
}
