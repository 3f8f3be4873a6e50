pub mod error;
pub mod informer;
pub mod k8s;
pub mod manager;
pub mod metrics;

pub use error::{Error, Result};
