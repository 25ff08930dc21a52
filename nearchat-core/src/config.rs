//! Protocol tunables. Every field has a default so a partial TOML table is enough.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Overlay degree K.
    pub neighbor_degree: usize,
    /// Hop budget N for new broadcasts.
    pub broadcast_ttl: u8,
    /// Broadcast ids remembered for de-duplication.
    pub seen_capacity: usize,
    pub chunk_size: usize,
    /// Stop sending chunks while a channel has more than this many bytes buffered.
    pub buffered_high_water: usize,
    /// Threshold the host arms for the channel's buffered-amount-low signal.
    pub buffered_low_water: usize,
    /// Soft cap on profile/avatar payloads.
    pub payload_cap: usize,
    pub ice_check_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub prune_interval_ms: u64,
    pub stale_after_ms: u64,
    pub location_refresh_ms: u64,
    pub credential_refresh_margin_ms: u64,
    pub credential_min_refresh_ms: u64,
    /// An incoming transfer with no chunk for this long is abandoned.
    pub transfer_idle_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            neighbor_degree: 7,
            broadcast_ttl: 3,
            seen_capacity: 2048,
            chunk_size: 16 * 1024,
            buffered_high_water: 256 * 1024,
            buffered_low_water: 64 * 1024,
            payload_cap: 16 * 1024,
            ice_check_timeout_ms: 7_000,
            disconnect_grace_ms: 1_500,
            heartbeat_interval_ms: 25_000,
            prune_interval_ms: 30_000,
            stale_after_ms: 60_000,
            location_refresh_ms: 120_000,
            credential_refresh_margin_ms: 60_000,
            credential_min_refresh_ms: 30_000,
            transfer_idle_ms: 60_000,
        }
    }
}

impl MeshConfig {
    pub fn ice_check_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_check_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn location_refresh(&self) -> Duration {
        Duration::from_millis(self.location_refresh_ms)
    }

    pub fn credential_refresh_margin(&self) -> Duration {
        Duration::from_millis(self.credential_refresh_margin_ms)
    }

    pub fn credential_min_refresh(&self) -> Duration {
        Duration::from_millis(self.credential_min_refresh_ms)
    }

    pub fn transfer_idle(&self) -> Duration {
        Duration::from_millis(self.transfer_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let cfg: MeshConfig = serde_json::from_str(r#"{"neighbor_degree": 4}"#).unwrap();
        assert_eq!(cfg.neighbor_degree, 4);
        assert_eq!(cfg.chunk_size, 16 * 1024);
        assert_eq!(cfg.ice_check_timeout(), Duration::from_secs(7));
        assert_eq!(cfg.transfer_idle(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(serde_json::from_str::<MeshConfig>(r#"{"fanout": 3}"#).is_err());
    }
}
