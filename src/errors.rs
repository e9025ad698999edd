use thiserror::Error;

/// Startup-only failures. Anything here aborts the process before the
/// server starts accepting traffic.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid {which} pattern {pattern:?}: {source}")]
    Regex {
        which: &'static str,
        pattern: String,
        source: regex::Error,
    },

    #[error("unknown time zone {zone:?}: {reason}")]
    TimeZone { zone: String, reason: String },

    #[error("tls: {0}")]
    Tls(String),
}

/// Name resolution failures. Transient database errors drop the event with a
/// log line; a non-positive id means the names table handed back something
/// that can never be a valid key.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("connection pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("names database: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("name {name:?} resolved to non-positive id {id}")]
    InvalidId { name: String, id: i32 },

    #[error("name {0:?} missing after insert")]
    MissingAfterInsert(String),
}

/// Database failures on the flush path. Logged and skipped; the in-memory
/// side never rolls back.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("query: {0}")]
    Query(#[from] tokio_postgres::Error),
}
