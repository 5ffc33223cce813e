use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The machine or a restored checkpoint is in a state that cannot be evaluated.
    InvalidState(String),
    /// A configuration error occurred.
    Config(String),
    /// A persistence layer error (database, file system, etc.).
    Persistence(String),
    /// A zone snapshot could not be read from the source.
    Sensor { zone: String, details: String },
    /// An unexpected failure while evaluating a tick.
    Processing(String),
    /// A generic system or unknown error.
    System(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
            Error::Config(msg) => write!(f, "Configuration error: {msg}"),
            Error::Persistence(msg) => write!(f, "Persistence error: {msg}"),
            Error::Sensor { zone, details } => {
                write!(f, "Sensor read failed for zone {zone}: {details}")
            }
            Error::Processing(msg) => write!(f, "Processing error: {msg}"),
            Error::System(msg) => write!(f, "System error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
