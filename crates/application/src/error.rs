use domain::DispatchId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown dispatch: {0}")]
    UnknownDispatch(DispatchId),
}

impl From<config::ConfigError> for ApplicationError {
    fn from(value: config::ConfigError) -> Self {
        ApplicationError::Configuration(value.to_string())
    }
}
