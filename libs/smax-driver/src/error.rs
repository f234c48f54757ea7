//! Error type for the driver layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Whether the error indicates a lost or unusable connection, as opposed
    /// to a server-side reply error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            DriverError::NotConnected => true,
            DriverError::Config(_) => false,
            DriverError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_display() {
        assert_eq!(DriverError::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn test_config_error_is_not_connection_error() {
        assert!(!DriverError::Config("bad port".into()).is_connection_error());
        assert!(DriverError::NotConnected.is_connection_error());
    }
}
