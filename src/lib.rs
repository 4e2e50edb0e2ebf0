pub mod cache;
pub mod storage;

pub use cache::{Cache, CacheOptions};

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Serialization(bincode::Error),
    Deserialization(bincode::Error),
    // A non-tail log record or a checkpoint body failed validation.
    // Not recoverable automatically; operator intervention required.
    Corruption(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            Error::Corruption(s) => write!(f, "Corruption detected: {}", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Deserialization(e) => Some(e),
            Error::Corruption(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
