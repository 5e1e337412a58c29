//! Configuration surface consumed by the core (spec §6.4).
//!
//! These types are `Deserialize` so an external loader can build them from
//! whatever file format it speaks; this crate performs no file I/O of its
//! own. Validation beyond what serde's `#[serde(default)]` machinery gives
//! for free (e.g. rejecting an empty `id`) belongs to that external loader
//! too — the core only enforces the invariants in spec §3 at the point a
//! server is actually added to a pool.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Immutable server configuration, accepted once by [`crate::pool::PoolManager::add_server`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Unique identifier within a pool.
    pub id: String,
    /// Human-readable name, not required to be unique.
    #[serde(default)]
    pub name: String,
    /// The executable to spawn.
    pub command: String,
    /// Arguments passed to `command`, in order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables added to (not replacing) the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// When `false`, `add_server` accepts the config but never creates an entry.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Tunables for the pool manager and every transport it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Per-request deadline, armed by the transport on every `send_request`.
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,
    /// Connect/initialize attempts before an entry lands in `ERROR`.
    pub max_retries: u32,
    /// Delay between retry attempts.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Interval of the background health-check loop.
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
