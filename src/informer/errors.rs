/**
 * Helper functions for creating common informer error types
 */
use crate::error::Error;

/// Create an `AlreadyStarted` error for an informer `name`
#[must_use]
pub fn already_started_error(name: &str) -> Error {
    Error::AlreadyStarted(name.to_string())
}

/// Wrap the cause of a failed first list
#[must_use]
pub fn initial_sync_error(cause: Error) -> Error {
    Error::InitialSync(Box::new(cause))
}

#[must_use]
pub fn unknown_index_error(name: &str) -> Error {
    Error::UnknownIndex(name.to_string())
}

#[must_use]
pub fn index_exists_error(name: &str) -> Error {
    Error::IndexExists(name.to_string())
}

/// Create a `Watch` error for a stream that reported a transport failure
#[must_use]
pub fn watch_error(message: impl Into<String>) -> Error {
    Error::Watch(message.into())
}
