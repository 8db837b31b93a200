//! Error types for the metadata service core.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Callers branch on the variant
//! rather than on message text: [`Error::NotFound`] maps to a 404-style
//! response, [`Error::Validation`] and [`Error::Conflict`] to client errors,
//! and [`Error::Storage`] to an internal failure.

/// Errors that can occur while managing networks, leases and machines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity does not exist.
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    /// A required field is missing or malformed, or the request combines
    /// options that are mutually exclusive.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The write collides with an existing record (duplicate name or address).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The network has no DHCP ranges to allocate from.
    #[error("No DHCP ranges configured for network {0}")]
    NoRanges(i64),

    /// Every address in every range of the network is in use.
    ///
    /// Addresses held by a lease on the network or assigned statically to
    /// any machine count as in use.
    #[error("No available IP addresses in network {0}")]
    Exhausted(i64),

    /// The underlying store failed.
    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// File system I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid service configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Returns true if this error means the entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A specialized Result type for metadata service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Attaches operation context to storage errors.
pub(crate) trait StorageContext<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, sqlx::Error> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|source| Error::Storage {
            context: context.to_string(),
            source,
        })
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|database_error| database_error.is_foreign_key_violation())
}
