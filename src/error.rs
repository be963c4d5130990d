use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The database was unreachable or a statement failed.
    #[error("store error: {0}")]
    Store(#[from] tokio_postgres::Error),

    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// Release called by a thread that does not own the lock.
    #[error("lock [{name}] is not held by the current thread")]
    NotOwner { name: String },

    #[error("maximum lock count exceeded for [{name}]")]
    Overflow { name: String },

    /// The lock record vanished even though it was created at construction.
    #[error("lock record [{name}] not found")]
    MissingRecord { name: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn not_owner(name: &str) -> Self {
        Error::NotOwner {
            name: name.to_string(),
        }
    }

    pub(crate) fn missing(name: &str) -> Self {
        Error::MissingRecord {
            name: name.to_string(),
        }
    }
}
