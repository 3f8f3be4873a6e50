use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::{debug, error, warn};

/// Environment variable that overrides the user agent sent to the API server
pub const USER_AGENT_ENV: &str = "INFORMER_USER_AGENT";

/// Create a client for the cluster found in the usual places (kubeconfig,
/// in-cluster service account), identifying itself with `user_agent`.
///
/// # Errors
///
/// Will return `Err` if no cluster configuration can be inferred or the client
/// cannot be built from it
pub async fn new(user_agent: Option<&str>) -> Result<Client> {
    debug!("📄 Loading cluster configuration");
    let mut config = Config::infer().await.map_err(|e| {
        error!("❌ Failed to infer cluster configuration: {}", e);
        e
    })?;

    let from_env = std::env::var(USER_AGENT_ENV).ok();
    add_user_agent_header(&mut config, from_env.as_deref().or(user_agent));

    Ok(Client::try_from(config)?)
}

/// Attach a `user-agent` header to `config`. Invalid values are skipped with a
/// warning and the default agent is used.
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) {
    let Some(user_agent) = user_agent else {
        return;
    };
    match user_agent_header(user_agent) {
        Some(value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), value)),
        None => warn!("Ignoring invalid user agent {:?}", user_agent),
    }
}

#[must_use]
pub fn user_agent_header(user_agent: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(user_agent).ok()
}
