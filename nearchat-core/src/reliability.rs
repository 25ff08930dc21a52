//! Maintenance timers: relay heartbeat, link pruning, location re-send and relay credential
//! refresh. Deadlines only; the coordinator decides what each one does when it fires.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MeshConfig;

/// Relay (TURN) credential from the credential endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredential {
    pub username: String,
    pub credential: String,
    /// Lifetime in seconds.
    pub ttl: u64,
}

impl TurnCredential {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// When to fetch a new credential: `ttl - margin`, but never sooner than `floor`.
pub fn refresh_delay(ttl: Duration, margin: Duration, floor: Duration) -> Duration {
    ttl.saturating_sub(margin).max(floor)
}

/// Timer that fired during `due`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Heartbeat,
    Prune,
    Location,
    Credential,
}

pub struct ReliabilityManager {
    heartbeat_interval: Duration,
    prune_interval: Duration,
    location_interval: Duration,
    credential_margin: Duration,
    credential_floor: Duration,
    heartbeat_at: Option<Instant>,
    prune_at: Option<Instant>,
    location_at: Option<Instant>,
    credential_at: Option<Instant>,
}

impl ReliabilityManager {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            prune_interval: config.prune_interval(),
            location_interval: config.location_refresh(),
            credential_margin: config.credential_refresh_margin(),
            credential_floor: config.credential_min_refresh(),
            heartbeat_at: None,
            prune_at: None,
            location_at: None,
            credential_at: None,
        }
    }

    /// Relay is up: (re)arm the maintenance timers.
    pub fn on_relay_connected(&mut self, now: Instant) {
        self.heartbeat_at = Some(now + self.heartbeat_interval);
        self.prune_at = Some(now + self.prune_interval);
        self.location_at = Some(now + self.location_interval);
    }

    /// Relay lost: maintenance waits for the reconnect. Credential refresh keeps running.
    pub fn on_relay_lost(&mut self) {
        self.heartbeat_at = None;
        self.prune_at = None;
        self.location_at = None;
    }

    pub fn on_credential(&mut self, credential: &TurnCredential, now: Instant) -> Duration {
        let delay = refresh_delay(credential.ttl(), self.credential_margin, self.credential_floor);
        debug!(ttl = credential.ttl, refresh_in = ?delay, "relay credential stored");
        self.credential_at = Some(now + delay);
        delay
    }

    /// Fetch failed: try again after the floor delay.
    pub fn on_credential_failed(&mut self, now: Instant) {
        self.credential_at = Some(now + self.credential_floor);
    }

    /// Timers whose deadline passed, re-armed for their next period. Credential is one-shot.
    pub fn due(&mut self, now: Instant) -> Vec<Timer> {
        let mut fired = Vec::new();
        if fire(&mut self.heartbeat_at, now, Some(self.heartbeat_interval)) {
            fired.push(Timer::Heartbeat);
        }
        if fire(&mut self.prune_at, now, Some(self.prune_interval)) {
            fired.push(Timer::Prune);
        }
        if fire(&mut self.location_at, now, Some(self.location_interval)) {
            fired.push(Timer::Location);
        }
        if fire(&mut self.credential_at, now, None) {
            fired.push(Timer::Credential);
        }
        fired
    }

    /// Earliest pending deadline, for the host's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.heartbeat_at,
            self.prune_at,
            self.location_at,
            self.credential_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn is_idle(&self) -> bool {
        self.next_deadline().is_none()
    }

    pub fn shutdown(&mut self) {
        self.on_relay_lost();
        self.credential_at = None;
    }
}

fn fire(slot: &mut Option<Instant>, now: Instant, period: Option<Duration>) -> bool {
    match *slot {
        Some(at) if at <= now => {
            *slot = period.map(|p| now + p);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(ttl: u64) -> TurnCredential {
        TurnCredential {
            username: "u".into(),
            credential: "c".into(),
            ttl,
        }
    }

    #[test]
    fn refresh_delay_has_floor() {
        let margin = Duration::from_secs(60);
        let floor = Duration::from_secs(30);
        assert_eq!(
            refresh_delay(Duration::from_secs(3600), margin, floor),
            Duration::from_secs(3540)
        );
        assert_eq!(refresh_delay(Duration::from_secs(70), margin, floor), floor);
        assert_eq!(refresh_delay(Duration::ZERO, margin, floor), floor);
    }

    #[test]
    fn timers_fire_and_rearm() {
        let mut r = ReliabilityManager::new(&MeshConfig::default());
        let t0 = Instant::now();
        r.on_relay_connected(t0);
        assert!(r.due(t0 + Duration::from_secs(24)).is_empty());
        let fired = r.due(t0 + Duration::from_secs(25));
        assert_eq!(fired, vec![Timer::Heartbeat]);
        let fired = r.due(t0 + Duration::from_secs(30));
        assert_eq!(fired, vec![Timer::Prune]);
        assert_eq!(r.due(t0 + Duration::from_secs(50)), vec![Timer::Heartbeat]);
        assert!(r.due(t0 + Duration::from_secs(119)).contains(&Timer::Prune));
        assert!(r.due(t0 + Duration::from_secs(120)).contains(&Timer::Location));
    }

    #[test]
    fn relay_loss_suspends_maintenance_only() {
        let mut r = ReliabilityManager::new(&MeshConfig::default());
        let t0 = Instant::now();
        r.on_relay_connected(t0);
        r.on_credential(&cred(3600), t0);
        r.on_relay_lost();
        assert_eq!(r.next_deadline(), Some(t0 + Duration::from_secs(3540)));
        assert!(r.due(t0 + Duration::from_secs(100)).is_empty());
        assert_eq!(r.due(t0 + Duration::from_secs(3540)), vec![Timer::Credential]);
        assert!(r.is_idle());
    }

    #[test]
    fn shutdown_clears_everything() {
        let mut r = ReliabilityManager::new(&MeshConfig::default());
        let t0 = Instant::now();
        r.on_relay_connected(t0);
        r.on_credential(&cred(10), t0);
        r.shutdown();
        assert!(r.is_idle());
        assert!(r.due(t0 + Duration::from_secs(10_000)).is_empty());
    }

    #[test]
    fn failed_fetch_retries_after_floor() {
        let mut r = ReliabilityManager::new(&MeshConfig::default());
        let t0 = Instant::now();
        r.on_credential_failed(t0);
        assert_eq!(r.next_deadline(), Some(t0 + Duration::from_secs(30)));
    }
}
