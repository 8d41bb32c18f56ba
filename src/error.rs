//! Error handling utils.
//!
//! The hook layer keeps errno semantics: a hooked call that times out fails
//! with an [`io::Error`] carrying `ETIMEDOUT`, a peer close surfaces as a zero
//! read, and `WouldBlock`/`Interrupted` never escape (they are converted into
//! suspension and retry respectively). Everything above the hooks uses this
//! crate-level [`Error`].

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("http parse error: {0}")]
    HttpParse(#[from] crate::http::parser::ParseError),

    #[error("failed to decode value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("buffer out of data: {0}")]
    OutOfData(#[from] crate::bytes::OutOfData),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// `true` if the error is the `ETIMEDOUT` sentinel produced by the
    /// cancel-on-timeout path of the hook layer.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::IO(e) => {
                e.kind() == io::ErrorKind::TimedOut
                    || e.raw_os_error() == Some(libc::ETIMEDOUT)
            }
            _ => false,
        }
    }
}

/// Converts a `-1`-style libc return into `io::Error::last_os_error`.
#[inline(always)]
pub(crate) fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}
