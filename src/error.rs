use core::fmt;
use std::io;

/// Error enum with all errors that can be returned by functions from this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The backing file returned an error during an input/output operation.
    Io(io::Error),
    /// A parameter was incorrect.
    InvalidInput,
    /// The provided entry key is either too long or empty.
    InvalidKeyLength,
    /// A store is already open in this process, or an entry with the same key already exists.
    AlreadyExists,
    /// A requested entry has not been found, or the handle refers to an erased entry.
    NotFound,
    /// The file does not pass open-time validation as an evfs store.
    BadFormat,
    /// There is not enough free space on the storage to finish the requested operation.
    NotEnoughSpace,
    /// Store internal structures are corrupted/invalid.
    CorruptedFileSystem,
    /// The store is not in a usable state.
    NotReady,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(io_error) => write!(f, "IO error: {}", io_error),
            Error::InvalidInput => write!(f, "Invalid input"),
            Error::InvalidKeyLength => write!(f, "Invalid entry key length"),
            Error::AlreadyExists => write!(f, "Store or entry already exists"),
            Error::NotFound => write!(f, "No such entry"),
            Error::BadFormat => write!(f, "Not an evfs store"),
            Error::NotEnoughSpace => write!(f, "Not enough space"),
            Error::CorruptedFileSystem => write!(f, "Corrupted file system"),
            Error::NotReady => write!(f, "Store is not ready"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Io(io_error) = self {
            Some(io_error)
        } else {
            None
        }
    }
}
