//! Location selection policy. Acquisition happens in the host; these helpers decide which fix
//! wins and whether a cached one may still be used.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::GeoPosition;

/// A fix is good enough to stop waiting when its accuracy radius is at most this.
pub const ACCURATE_ENOUGH_M: f64 = 500.0;
/// Last-known-good fixes older than this are ignored.
pub const CACHED_FIX_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixSource {
    /// Low-accuracy, quick fix.
    Fast,
    /// High-accuracy fix.
    Precise,
    Cached,
    IpLookup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationFix {
    pub position: GeoPosition,
    pub source: FixSource,
    pub taken_at_unix_ms: u64,
}

impl LocationFix {
    pub fn is_accurate_enough(&self) -> bool {
        self.position.accuracy_m <= ACCURATE_ENOUGH_M
    }

    /// Usable as a fallback at `now_unix_ms`.
    pub fn cached_fix_usable(&self, now_unix_ms: u64) -> bool {
        let age = now_unix_ms.saturating_sub(self.taken_at_unix_ms);
        Duration::from_millis(age) < CACHED_FIX_MAX_AGE
    }
}

/// Pick the more accurate of two fixes; ties keep the newer one.
pub fn better_fix(a: Option<LocationFix>, b: Option<LocationFix>) -> Option<LocationFix> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if a.position.accuracy_m < b.position.accuracy_m {
                Some(a)
            } else if b.position.accuracy_m < a.position.accuracy_m {
                Some(b)
            } else if a.taken_at_unix_ms >= b.taken_at_unix_ms {
                Some(a)
            } else {
                Some(b)
            }
        }
        (a, None) => a,
        (None, b) => b,
    }
}

/// Convert a coarse IP lookup (accuracy given in kilometers) into a fix.
pub fn from_ip_lookup(latitude: f64, longitude: f64, accuracy_km: f64, now_unix_ms: u64) -> LocationFix {
    LocationFix {
        position: GeoPosition {
            latitude,
            longitude,
            accuracy_m: accuracy_km * 1000.0,
        },
        source: FixSource::IpLookup,
        taken_at_unix_ms: now_unix_ms,
    }
}
