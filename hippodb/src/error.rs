use thiserror::Error;

#[derive(Error, Debug)]
pub enum HippoDbError {
    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Insert error: {0}")]
    Insert(String),

    #[error("Dependency cycle while mounting: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Anything that is not a lookup or insert problem.
    Failure,
    /// Unknown table, malformed or missing search criteria, update target not found.
    Lookup,
    /// Duplicate explicit id, column type mismatch, malformed table rows.
    Insert,
}

impl HippoDbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HippoDbError::Lookup(_) => ErrorKind::Lookup,
            HippoDbError::Insert(_) => ErrorKind::Insert,
            _ => ErrorKind::Failure,
        }
    }
}

pub type Result<T> = std::result::Result<T, HippoDbError>;
