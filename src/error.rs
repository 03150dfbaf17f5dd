use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// Malformed caller input. Raised before any state is touched.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("no addresses available")]
    PoolExhausted,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A kernel request was rejected.
    #[error("netfilter {op} on {map} failed: {source}")]
    Netfilter {
        op: &'static str,
        map: String,
        #[source]
        source: io::Error,
    },

    #[error("map {table} {map} does not exist")]
    MapNotFound { table: String, map: String },

    #[error("element not found in {map}")]
    ElementNotFound { map: String },

    /// Listing a map failed in a way known to affect concatenated key types.
    #[error("map {map} cannot be enumerated: {reason}")]
    EnumerationUnsupported { map: String, reason: String },

    #[error("netlink protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Errors that only mean a read-back could not be performed.
    pub fn is_enumeration_quirk(&self) -> bool {
        matches!(self, Error::EnumerationUnsupported { .. })
    }

    pub fn is_kernel_sync(&self) -> bool {
        matches!(
            self,
            Error::Netfilter { .. }
                | Error::MapNotFound { .. }
                | Error::ElementNotFound { .. }
                | Error::EnumerationUnsupported { .. }
                | Error::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
