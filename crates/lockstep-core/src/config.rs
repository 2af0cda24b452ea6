//! Service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a Lockstep service instance.
///
/// These are operational settings, not protocol-correctness constraints;
/// the defaults suit a store with single-digit-millisecond round trips.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockServiceConfig {
    /// Root key prefix in the coordination store.
    pub key_prefix: String,
    /// TTL of the store lease backing this service's liveness key.
    pub service_ttl: Duration,
    /// TTL of the lease guarding the propose lock, so a crashed proposer
    /// cannot wedge acquisition forever.
    pub propose_lock_ttl: Duration,
    /// How long to contend for the propose lock before giving up.
    pub propose_lock_timeout: Duration,
    /// Delay between propose-lock attempts.
    pub propose_retry_delay: Duration,
    /// How long a proposal waits for the local replica to catch up to the
    /// global index before reporting an infrastructure error.
    pub catch_up_timeout: Duration,
    /// Scan interval of the client-level lease monitor.
    pub lease_tick: Duration,
    /// Base delay before retrying failed releases.
    pub release_retry_base: Duration,
    /// Upper bound of the random jitter added to the release retry delay.
    pub release_retry_jitter: Duration,
    /// Acquire wait budget when the caller specifies none.
    pub default_acquire_timeout: Duration,
    /// Delay between resynchronization attempts after a failed one.
    pub resync_retry_delay: Duration,
}

impl Default for LockServiceConfig {
    fn default() -> Self {
        Self {
            key_prefix: "/lockstep".to_string(),
            service_ttl: Duration::from_secs(10),
            propose_lock_ttl: Duration::from_secs(5),
            propose_lock_timeout: Duration::from_secs(10),
            propose_retry_delay: Duration::from_millis(50),
            catch_up_timeout: Duration::from_secs(30),
            lease_tick: Duration::from_secs(1),
            release_retry_base: Duration::from_millis(200),
            release_retry_jitter: Duration::from_millis(800),
            default_acquire_timeout: Duration::from_secs(30),
            resync_retry_delay: Duration::from_secs(1),
        }
    }
}
