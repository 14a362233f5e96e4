use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    /// A check that must pass before anything is changed on the host.
    #[error("{0}")]
    Precondition(String),

    /// An external tool ran but reported failure.
    #[error("{what} failed: {detail}")]
    Tool { what: String, detail: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid version string: {0}")]
    InvalidVersion(String),

    /// The operator declined a prompt.
    #[error("Abort. No changes were made.")]
    Aborted,
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn tool(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Tool {
            what: what.into(),
            detail: detail.into(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
