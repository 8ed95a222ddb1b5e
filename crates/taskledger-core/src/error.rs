use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Task execution not found: {0}")]
    NotFound(i64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task with name {0} is already running")]
    LockUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
