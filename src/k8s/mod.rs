pub mod client;
pub mod source;

pub use source::KubeSource;

/// Default user agent, derived from the package name and version.
///
/// Can be overridden at runtime through `INFORMER_USER_AGENT`.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
