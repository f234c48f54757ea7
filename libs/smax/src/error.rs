//! Error type shared by all SMA-X operations.

use thiserror::Error;

/// Error kinds returned by the public API.
///
/// Variants carry rendered messages rather than source errors so that a
/// failure can be latched (e.g. by the pull queue) and handed to several
/// waiters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmaxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not connected")]
    NotInitialized,

    #[error("already connected")]
    AlreadyOpen,

    #[error("no service: {0}")]
    NoService(String),

    #[error("timed out")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("no such entry: {0}")]
    NameInvalid(String),

    #[error("server script missing: {0}")]
    ScriptMissing(String),

    #[error("invalid size: {0}")]
    SizeInvalid(String),

    #[error("incomplete data range")]
    Incomplete,
}

pub type Result<T> = std::result::Result<T, SmaxError>;

impl SmaxError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SmaxError::InvalidArgument(msg.into())
    }

    pub(crate) fn no_service(msg: impl Into<String>) -> Self {
        SmaxError::NoService(msg.into())
    }

    /// Whether the error came from a lost connection rather than from the
    /// request itself.
    pub fn is_no_service(&self) -> bool {
        matches!(self, SmaxError::NoService(_) | SmaxError::NotInitialized)
    }

    /// Whether the error means the server-side scripts need reloading.
    pub fn is_script_missing(&self) -> bool {
        matches!(self, SmaxError::ScriptMissing(_))
    }
}

impl From<redis::RedisError> for SmaxError {
    fn from(e: redis::RedisError) -> Self {
        if e.kind() == redis::ErrorKind::NoScriptError || e.code() == Some("NOSCRIPT") {
            return SmaxError::ScriptMissing(e.to_string());
        }
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            return SmaxError::NoService(e.to_string());
        }
        match e.kind() {
            redis::ErrorKind::TypeError | redis::ErrorKind::ResponseError => {
                SmaxError::Parse(e.to_string())
            }
            _ => SmaxError::NoService(e.to_string()),
        }
    }
}

impl From<smax_driver::DriverError> for SmaxError {
    fn from(e: smax_driver::DriverError) -> Self {
        match e {
            smax_driver::DriverError::NotConnected => SmaxError::no_service("not connected"),
            smax_driver::DriverError::Config(msg) => SmaxError::InvalidArgument(msg),
            smax_driver::DriverError::Redis(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            SmaxError::invalid("table is empty").to_string(),
            "invalid argument: table is empty"
        );
        assert_eq!(SmaxError::Timeout.to_string(), "timed out");
        assert_eq!(
            SmaxError::TypeMismatch {
                expected: "int32".into(),
                got: "string".into()
            }
            .to_string(),
            "type mismatch: expected int32, got string"
        );
    }

    #[test]
    fn test_driver_not_connected_maps_to_no_service() {
        let e: SmaxError = smax_driver::DriverError::NotConnected.into();
        assert!(e.is_no_service());
    }

    #[test]
    fn test_errors_are_clonable_for_latching() {
        let e = SmaxError::no_service("pipe lost");
        let latched = e.clone();
        assert_eq!(e, latched);
    }
}
