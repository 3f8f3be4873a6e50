use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    Io(std::io::Error),

    #[from]
    Metrics(prometheus::Error),

    /// The first full list failed; the informer never became synced
    InitialSync(Box<Error>),

    /// The requested resource version is older than the source remembers
    Expired(String),

    /// Transport failure while listing or watching
    Watch(String),

    /// `list` was asked for an index that was never registered
    UnknownIndex(String),

    /// `add_index` was called twice with the same name
    IndexExists(String),

    AlreadyStarted(String),

    Cancelled,

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Transport errors are retried by the watch loop; everything else is surfaced.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Kube(_) | Self::Io(_) | Self::Expired(_) | Self::Watch(_)
        )
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::InitialSync(inner) => write!(fmt, "initial sync failed: {inner}"),
            Self::Expired(rv) => write!(fmt, "resource version {rv} expired"),
            Self::Watch(msg) => write!(fmt, "watch failed: {msg}"),
            Self::UnknownIndex(name) => write!(fmt, "unknown index {name}"),
            Self::IndexExists(name) => write!(fmt, "index {name} already registered"),
            Self::AlreadyStarted(name) => write!(fmt, "informer {name} already started"),
            Self::Cancelled => write!(fmt, "cancelled"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Watch("connection reset".to_string()).is_transient());
        assert!(Error::Expired("42".to_string()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::InitialSync(Box::new(Error::Watch("x".to_string()))).is_transient());
    }

    #[test]
    fn test_display_wraps_initial_sync_cause() {
        let err = Error::InitialSync(Box::new(Error::Watch("refused".to_string())));
        assert_eq!(err.to_string(), "initial sync failed: watch failed: refused");
    }
}
