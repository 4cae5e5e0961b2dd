//! Resumable transfers between a stable source and a destination.
//!
//! The moving parts:
//!
//! - [`Session`] holds process-wide tunables and the shutdown signal.
//! - [`Scope`] carries cancellation and an optional deadline for one piece of work.
//! - [`StableDescriptor`] is content which can be re-read, guarded by a stability deadline
//!   and health checks, and which resumes after temporary outages.
//! - [`TransientDescriptor`] moves a stable source to a destination with a pluggable
//!   transition function, tracking progress and allowing one active transition at a time.

mod error;
mod scope;
mod session;
mod stable;
mod transient;

pub use self::error::{IncompleteKind, IncompleteTransition, TransitError};
pub use self::scope::Scope;
pub use self::session::{
    Session, SessionConfig, DEFAULT_MINIMUM_COOLDOWN, DEFAULT_MINIMUM_STABILITY,
    MINIMUM_COOLDOWN_ENV, MINIMUM_STABILITY_ENV,
};
pub use self::stable::{
    health_check, producer, BoxReader, HealthCheck, Producer, StableDescriptor, StableReader,
};
pub use self::transient::{
    Activity, Position, TransientDescriptor, TransitionFn, TransitionFuture, TransitionHandle,
};

/// Serde helpers for durations written in [`humantime`] format.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize a duration such as `"100ms"` or `"3h"`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        humantime::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}
