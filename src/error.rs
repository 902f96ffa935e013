use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader(&'static str),
    Decode(&'static str, io::Error),
    ReadError(&'static str, io::Error),
    WriteError(&'static str, io::Error),
    ChecksumMismatch(&'static str),
    IndexCorruption(String),
    /// A writer received a key that does not sort after the previous one.
    OutOfOrderKey {
        previous: Vec<u8>,
        key: Vec<u8>,
    },
    /// A shard directory is missing one of its finalized artifacts.
    IncompleteShard(PathBuf),
    DatasetNotFound(String),
    /// The reader was closed before the call.
    Closed,
    MutexPoisoned,
    InvalidOperation(String),
    InvalidConfig(String),
}

impl Error {
    /// True for errors that mean "nothing there" rather than "something broke".
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::DatasetNotFound(_) => true,
            Error::IoError(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader(artifact) => write!(f, "Invalid {} header", artifact),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::ChecksumMismatch(artifact) => write!(f, "Checksum mismatch in {}", artifact),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::OutOfOrderKey { previous, key } => write!(
                f,
                "Out of order key: {:?} does not sort after {:?}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(previous)
            ),
            Error::IncompleteShard(dir) => {
                write!(f, "Shard is not finalized: {}", dir.display())
            }
            Error::DatasetNotFound(name) => write!(f, "Dataset directory does not exist: {}", name),
            Error::Closed => write!(f, "Shard reader is closed"),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err)
            | Error::Decode(_, err)
            | Error::ReadError(_, err)
            | Error::WriteError(_, err) => Some(err),
            _ => None,
        }
    }
}
