//! Node configuration.

use std::time::Duration;

use blobcache::Cache;
use camino::Utf8PathBuf;
use serde::Deserialize;
use transit::{Session, SessionConfig};

use crate::error::NodeResult;
use crate::transport::NodeTransport;

const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

fn default_http() -> bool {
    true
}

/// Everything needed to build a [`NodeTransport`].
///
/// ```
/// let config: node::NodeConfig = serde_json::from_str(r#"{
///     "name": "localhost",
///     "ttl": "30m",
///     "session": { "minimum-cooldown": "250ms" }
/// }"#).unwrap();
/// assert_eq!(config.ttl, std::time::Duration::from_secs(30 * 60));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// The cache name, which is also the host of `cache://` URLs.
    pub name: String,

    /// Directory holding the cache. Defaults to the user cache directory.
    #[serde(default)]
    pub cache_root: Option<Utf8PathBuf>,

    /// How long cached content stays visible.
    #[serde(default = "default_ttl", with = "transit::duration")]
    pub ttl: Duration,

    /// Deliver `http` and `https` requests over TCP.
    #[serde(default = "default_http")]
    pub http: bool,

    /// Cooldown and stability tunables.
    #[serde(default)]
    pub session: SessionConfig,
}

impl NodeConfig {
    /// A configuration with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache_root: None,
            ttl: DEFAULT_TTL,
            http: true,
            session: SessionConfig::default(),
        }
    }

    /// Open the cache and build the transport.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.name))]
    pub async fn build(self) -> NodeResult<NodeTransport> {
        let cache = match self.cache_root {
            Some(root) => Cache::new(root, &self.name, self.ttl).await?,
            None => Cache::in_user_cache_dir(&self.name, self.ttl).await?,
        };
        let transport = NodeTransport::new(Session::new(self.session), cache);
        Ok(if self.http {
            transport.with_default_http()
        } else {
            transport
        })
    }
}
