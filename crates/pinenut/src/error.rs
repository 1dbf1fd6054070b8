/// Every fallible operation in this crate surfaces this error type.
///
/// `Io`, `Codec`, `Compression`, `InvalidKey`, `Decrypt`, `Config` and
/// `State` are expected failures a caller can act on. `Panic` marks a broken
/// internal invariant; callers should treat it as a bug in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed record frame: {0}")]
    Codec(String),
    #[error("compression stream failed")]
    Compression(#[source] std::io::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    State(&'static str),
    #[error("internal invariant violated: {0}")]
    Panic(String),
}

impl Error {
    /// True for unrecoverable internal bugs, false for expected failures.
    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panic(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
