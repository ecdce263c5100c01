use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] shellgate_core::CoreError),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid JSON for --args: {0}")]
    Args(serde_json::Error),

    #[error("Timed out waiting for the backend connection")]
    ConnectTimeout,

    #[error("Timed out waiting for the web session announcement")]
    SessionTimeout,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidUrl(_) | Self::Args(_) => 2,
            Self::ConnectTimeout | Self::SessionTimeout => 3,
            Self::Core(_) => 1,
        }
    }
}
