//! Bridge errors

use crate::data::StartError;

use super::config::ConfigError;

/// Errors that can occur starting or driving the bridge
#[derive(Debug)]
pub enum BridgeError {
    /// Configuration rejected before anything started
    Config(ConfigError),
    /// Database could not be opened
    Database(StartError),
    /// Bridge is not running
    NotRunning,
    /// Input from a producer could not be used
    InvalidInput(String),
    /// IO error
    Io(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "invalid configuration: {}", e),
            BridgeError::Database(e) => write!(f, "failed to open database: {}", e),
            BridgeError::NotRunning => write!(f, "bridge is not running"),
            BridgeError::InvalidInput(e) => write!(f, "invalid input: {}", e),
            BridgeError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}

impl From<StartError> for BridgeError {
    fn from(e: StartError) -> Self {
        BridgeError::Database(e)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}
