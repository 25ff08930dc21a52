//! Location strategy: race the device sources under a hard timeout, fall back to the
//! last-known-good fix on disk, then to IP geolocation. `None` means the caller asks the relay
//! for LAN discovery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use nearchat_core::location::{better_fix, from_ip_lookup, FixSource, LocationFix, ACCURATE_ENOUGH_M};
use nearchat_core::{unix_ms, GeoPosition};
use tracing::{debug, info, warn};

use crate::rest::RestClient;

/// Upper bound on one location attempt across all sources.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll every attempt concurrently and keep the most accurate fix. Returns early once a fix is
/// accurate enough; gives up waiting at `hard_timeout`.
pub async fn race_fixes(
    attempts: Vec<BoxFuture<'static, Option<LocationFix>>>,
    hard_timeout: Duration,
) -> Option<LocationFix> {
    let mut pending: FuturesUnordered<_> = attempts.into_iter().collect();
    let mut best: Option<LocationFix> = None;
    let deadline = tokio::time::sleep(hard_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            next = pending.next() => match next {
                Some(fix) => {
                    best = better_fix(best, fix);
                    if best.as_ref().is_some_and(LocationFix::is_accurate_enough) {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut deadline => {
                debug!(outstanding = pending.len(), "location race hit hard timeout");
                break;
            }
        }
    }
    best
}

/// Coarse position from the caller's public IP address.
pub trait IpLookup: Send + Sync {
    fn ip_fix(&self) -> BoxFuture<'static, Option<LocationFix>>;
}

impl IpLookup for RestClient {
    fn ip_fix(&self) -> BoxFuture<'static, Option<LocationFix>> {
        let rest = self.clone();
        async move {
            match rest.coarse_location().await {
                Ok(loc) => {
                    debug!(city = ?loc.city_name, country = ?loc.country_name, "ip location");
                    Some(from_ip_lookup(loc.latitude, loc.longitude, loc.accuracy_km, unix_ms()))
                }
                Err(e) => {
                    warn!(error = %e, "ip location failed");
                    None
                }
            }
        }
        .boxed()
    }
}

pub struct Locator {
    ip: Arc<dyn IpLookup>,
    static_position: Option<GeoPosition>,
    cache_path: PathBuf,
}

impl Locator {
    pub fn new(ip: Arc<dyn IpLookup>, static_position: Option<GeoPosition>, cache_path: PathBuf) -> Self {
        Self {
            ip,
            static_position,
            cache_path,
        }
    }

    /// Best fix available now, or `None` when no source produced one.
    ///
    /// Order: race the device sources, then a cached fix younger than a day, then the IP lookup.
    pub async fn locate(&self) -> Option<LocationFix> {
        let mut attempts: Vec<BoxFuture<'static, Option<LocationFix>>> = Vec::new();
        if let Some(position) = self.static_position.clone() {
            let fix = LocationFix {
                source: if position.accuracy_m <= ACCURATE_ENOUGH_M {
                    FixSource::Precise
                } else {
                    FixSource::Fast
                },
                position,
                taken_at_unix_ms: unix_ms(),
            };
            attempts.push(async move { Some(fix) }.boxed());
        }

        if let Some(fix) = race_fixes(attempts, HARD_TIMEOUT).await {
            self.store(&fix).await;
            info!(source = ?fix.source, accuracy_m = fix.position.accuracy_m, "location acquired");
            return Some(fix);
        }
        if let Some(fix) = self.cached().await {
            return Some(fix);
        }
        match tokio::time::timeout(HARD_TIMEOUT, self.ip.ip_fix()).await {
            Ok(Some(fix)) => {
                info!(accuracy_m = fix.position.accuracy_m, "using ip location");
                Some(fix)
            }
            Ok(None) => None,
            Err(_) => {
                warn!("ip location timed out");
                None
            }
        }
    }

    async fn cached(&self) -> Option<LocationFix> {
        let text = tokio::fs::read_to_string(&self.cache_path).await.ok()?;
        let mut fix: LocationFix = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "ignoring corrupt location cache");
                return None;
            }
        };
        if !fix.cached_fix_usable(unix_ms()) {
            debug!("cached location too old");
            return None;
        }
        fix.source = FixSource::Cached;
        info!("using last known location");
        Some(fix)
    }

    async fn store(&self, fix: &LocationFix) {
        let text = match serde_json::to_string(fix) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot encode location cache");
                return;
            }
        };
        if let Some(dir) = self.cache_path.parent() {
            let _ = tokio::fs::create_dir_all(dir).await;
        }
        if let Err(e) = tokio::fs::write(&self.cache_path, text).await {
            warn!(error = %e, path = %self.cache_path.display(), "cannot write location cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fix(accuracy_m: f64, source: FixSource) -> LocationFix {
        LocationFix {
            position: GeoPosition {
                latitude: 1.0,
                longitude: 2.0,
                accuracy_m,
            },
            source,
            taken_at_unix_ms: unix_ms(),
        }
    }

    fn after(delay: Duration, f: Option<LocationFix>) -> BoxFuture<'static, Option<LocationFix>> {
        async move {
            tokio::time::sleep(delay).await;
            f
        }
        .boxed()
    }

    #[tokio::test]
    async fn accurate_fix_wins_without_waiting_for_slow_source() {
        let started = std::time::Instant::now();
        let best = race_fixes(
            vec![
                after(Duration::from_millis(5), Some(fix(30.0, FixSource::Precise))),
                after(Duration::from_secs(30), Some(fix(10.0, FixSource::Fast))),
            ],
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(best.source, FixSource::Precise);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn coarse_fix_kept_when_timeout_hits() {
        let best = race_fixes(
            vec![
                after(Duration::from_millis(1), Some(fix(25_000.0, FixSource::IpLookup))),
                after(Duration::from_secs(30), Some(fix(10.0, FixSource::Precise))),
            ],
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(best.source, FixSource::IpLookup);
    }

    #[tokio::test]
    async fn all_sources_failing_yields_none() {
        let best = race_fixes(
            vec![after(Duration::from_millis(1), None), after(Duration::from_millis(2), None)],
            Duration::from_secs(1),
        )
        .await;
        assert!(best.is_none());
    }

    /// Counts lookups and answers with a fixed result.
    struct CountingIp {
        calls: AtomicUsize,
        answer: Option<LocationFix>,
    }

    impl CountingIp {
        fn new(answer: Option<LocationFix>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IpLookup for CountingIp {
        fn ip_fix(&self) -> BoxFuture<'static, Option<LocationFix>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer.clone();
            async move { answer }.boxed()
        }
    }

    #[tokio::test]
    async fn stored_fix_is_reused_as_cached() {
        let dir = tempfile::tempdir().unwrap();
        let locator = Locator::new(CountingIp::new(None), None, dir.path().join("loc.json"));
        locator.store(&fix(40.0, FixSource::Precise)).await;
        let cached = locator.cached().await.unwrap();
        assert_eq!(cached.source, FixSource::Cached);
        assert_eq!(cached.position.accuracy_m, 40.0);
    }

    #[tokio::test]
    async fn stale_cache_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let locator = Locator::new(CountingIp::new(None), None, dir.path().join("loc.json"));
        let mut old = fix(40.0, FixSource::Precise);
        old.taken_at_unix_ms = 0;
        locator.store(&old).await;
        assert!(locator.cached().await.is_none());
    }

    #[tokio::test]
    async fn fresh_cache_preferred_over_ip_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let ip = CountingIp::new(Some(fix(25_000.0, FixSource::IpLookup)));
        let locator = Locator::new(ip.clone(), None, dir.path().join("loc.json"));
        locator.store(&fix(40.0, FixSource::Precise)).await;

        let got = locator.locate().await.unwrap();
        assert_eq!(got.source, FixSource::Cached);
        assert_eq!(got.position.accuracy_m, 40.0);
        assert_eq!(ip.calls(), 0);
    }

    #[tokio::test]
    async fn ip_lookup_used_when_nothing_else_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loc.json");
        let ip = CountingIp::new(Some(fix(25_000.0, FixSource::IpLookup)));
        let locator = Locator::new(ip.clone(), None, path.clone());

        let got = locator.locate().await.unwrap();
        assert_eq!(got.source, FixSource::IpLookup);
        assert_eq!(ip.calls(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn static_position_is_stored_and_skips_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loc.json");
        let ip = CountingIp::new(Some(fix(25_000.0, FixSource::IpLookup)));
        let position = GeoPosition {
            latitude: 48.1,
            longitude: 11.6,
            accuracy_m: 20.0,
        };
        let locator = Locator::new(ip.clone(), Some(position), path.clone());

        let got = locator.locate().await.unwrap();
        assert_eq!(got.source, FixSource::Precise);
        assert_eq!(ip.calls(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn every_source_failing_means_lan_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let ip = CountingIp::new(None);
        let locator = Locator::new(ip.clone(), None, dir.path().join("loc.json"));
        assert!(locator.locate().await.is_none());
        assert_eq!(ip.calls(), 1);
    }
}
