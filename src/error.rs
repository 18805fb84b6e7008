/// Error surface shared by every layer of the engine.
///
/// `Corruption` is reserved for bytes that failed a checksum or structural
/// check. `NotFound` is a normal lookup outcome and is never treated as
/// corruption.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
