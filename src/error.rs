use std::io;
use std::path::Path;

use pcap_file::PcapError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Open, read or write failure on the underlying resource.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Malformed capture header or record.
    #[error("invalid capture: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's buffer must be strictly larger than the payload.
    #[error("buffer too small: need at least {needed} bytes, got {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("no current packet; call next_packet_info first")]
    NoCurrentPacket,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a failure to open `path`, keeping "does not exist" distinct.
    pub(crate) fn open(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path.display().to_string())
        } else {
            Error::Io(err)
        }
    }
}

impl From<PcapError> for Error {
    fn from(err: PcapError) -> Self {
        match err {
            PcapError::IoError(e) if e.kind() != io::ErrorKind::UnexpectedEof => Error::Io(e),
            other => Error::Format(other.to_string()),
        }
    }
}
