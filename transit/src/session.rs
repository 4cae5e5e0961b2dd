//! Process-wide transfer tunables and the shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{IncompleteKind, IncompleteTransition, TransitError};
use crate::scope::Scope;

/// Environment variable overriding [`SessionConfig::minimum_cooldown`].
pub const MINIMUM_COOLDOWN_ENV: &str = "MINIMUM_COOLDOWN";

/// Environment variable overriding [`SessionConfig::minimum_stability`].
pub const MINIMUM_STABILITY_ENV: &str = "MINIMUM_STABILITY";

/// Smallest cooldown an interruption may ask for, unless configured otherwise.
pub const DEFAULT_MINIMUM_COOLDOWN: Duration = Duration::from_millis(100);

/// How long a stable descriptor stays valid when its scope has no deadline.
pub const DEFAULT_MINIMUM_STABILITY: Duration = Duration::from_secs(48 * 60 * 60);

/// Tunables for a [`Session`].
///
/// Durations are written the way [`humantime`] parses them, e.g. `"250ms"` or `"2days"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionConfig {
    /// Floor for interruption cooldowns.
    #[serde(with = "crate::duration")]
    pub minimum_cooldown: Duration,

    /// Default stability window for stable descriptors.
    #[serde(with = "crate::duration")]
    pub minimum_stability: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            minimum_cooldown: DEFAULT_MINIMUM_COOLDOWN,
            minimum_stability: DEFAULT_MINIMUM_STABILITY,
        }
    }
}

impl SessionConfig {
    /// Defaults, overridden by `MINIMUM_COOLDOWN` and `MINIMUM_STABILITY` when they parse
    /// to a positive duration.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SessionConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(cooldown) = positive_duration(MINIMUM_COOLDOWN_ENV, lookup(MINIMUM_COOLDOWN_ENV))
        {
            config.minimum_cooldown = cooldown;
        }
        if let Some(stability) =
            positive_duration(MINIMUM_STABILITY_ENV, lookup(MINIMUM_STABILITY_ENV))
        {
            config.minimum_stability = stability;
        }
        config
    }
}

fn positive_duration(key: &str, value: Option<String>) -> Option<Duration> {
    let value = value?;
    match humantime::parse_duration(value.trim()) {
        Ok(duration) if !duration.is_zero() => Some(duration),
        Ok(_) => {
            tracing::debug!(%key, "ignoring zero duration");
            None
        }
        Err(error) => {
            tracing::warn!(%key, %value, %error, "ignoring unparseable duration");
            None
        }
    }
}

/// Shared transfer settings plus the signal which ends every cooldown at shutdown.
///
/// Cloning a session is cheap and all clones share the same shutdown signal.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    config: SessionConfig,
    token: CancellationToken,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    /// Create a session with explicit settings.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Create a session configured from the environment.
    pub fn from_env() -> Self {
        Self::new(SessionConfig::from_env())
    }

    /// The session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Floor for interruption cooldowns.
    pub fn minimum_cooldown(&self) -> Duration {
        self.inner.config.minimum_cooldown
    }

    /// Default stability window.
    pub fn minimum_stability(&self) -> Duration {
        self.inner.config.minimum_stability
    }

    /// A root scope for work in this session.
    pub fn scope(&self) -> Scope {
        Scope::new(self.clone(), self.inner.token.child_token())
    }

    /// Signal shutdown: cancels every scope and ends every pending cooldown.
    pub fn shutdown(&self) {
        if !self.inner.token.is_cancelled() {
            tracing::debug!("transfer session shutting down");
        }
        self.inner.token.cancel();
    }

    /// Has [`Session::shutdown`] been called?
    pub fn is_shutdown(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the session shuts down.
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }

    /// Record that a source went away after `current` bytes.
    pub fn temporary_outage(&self, current: u64, cooldown: Duration) -> IncompleteTransition {
        IncompleteTransition::new(
            current,
            cooldown,
            IncompleteKind::Outage,
            self.inner.token.clone(),
        )
    }

    /// Record that a transition stopped after `current` bytes.
    ///
    /// The cooldown must be at least [`Session::minimum_cooldown`].
    pub fn interrupted_transition(
        &self,
        current: u64,
        cooldown: Duration,
    ) -> Result<IncompleteTransition, TransitError> {
        let minimum = self.minimum_cooldown();
        if cooldown < minimum {
            return Err(TransitError::CooldownTooShort {
                requested: cooldown,
                minimum,
            });
        }
        Ok(IncompleteTransition::new(
            current,
            cooldown,
            IncompleteKind::Interrupted,
            self.inner.token.clone(),
        ))
    }
}
