//! Load config from file and environment.

use nearchat_core::protocol::GeoPosition;
use nearchat_core::MeshConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Daemon configuration. File: ~/.config/nearchat/config.toml or /etc/nearchat/config.toml.
/// Env overrides: NEARCHAT_RELAY_URL, NEARCHAT_CREDENTIAL_URL, NEARCHAT_GEO_URL, NEARCHAT_NAME,
/// NEARCHAT_RADIUS_KM, NEARCHAT_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Signaling relay websocket URL.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// REST endpoint returning `{username, credential, ttl}`.
    #[serde(default = "default_credential_url")]
    pub credential_url: String,
    /// REST endpoint for coarse IP geolocation.
    #[serde(default = "default_geo_url")]
    pub geo_url: String,
    /// STUN/TURN URLs handed to every peer connection.
    #[serde(default = "default_ice_urls")]
    pub ice_urls: Vec<String>,
    /// Display name announced to peers.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub gender: Option<String>,
    /// Optional avatar thumbnail file.
    #[serde(default)]
    pub avatar: Option<PathBuf>,
    /// Discovery radius in kilometers.
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
    /// Fixed position for stationary installs; skips the network lookups when accurate enough.
    #[serde(default)]
    pub position: Option<GeoPosition>,
    /// Identity, location cache and received files live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_relay_url() -> String {
    "wss://relay.nearchat.app/ws".into()
}
fn default_credential_url() -> String {
    "https://relay.nearchat.app/turn-credentials".into()
}
fn default_geo_url() -> String {
    "https://relay.nearchat.app/geo".into()
}
fn default_ice_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".into()]
}
fn default_name() -> String {
    "anonymous".into()
}
fn default_radius_km() -> f64 {
    5.0
}
fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".local/share/nearchat"))
        .unwrap_or_else(|| PathBuf::from(".nearchat"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            credential_url: default_credential_url(),
            geo_url: default_geo_url(),
            ice_urls: default_ice_urls(),
            name: default_name(),
            age: None,
            gender: None,
            avatar: None,
            radius_km: default_radius_km(),
            position: None,
            data_dir: default_data_dir(),
            mesh: MeshConfig::default(),
        }
    }
}

impl Config {
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.json")
    }

    pub fn location_cache_path(&self) -> PathBuf {
        self.data_dir.join("last-location.json")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("received")
    }
}

/// Load config: merge default, then config file (explicit path or first found), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = match explicit {
        Some(p) => read_file(p).unwrap_or_default(),
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NEARCHAT_RELAY_URL") {
        c.relay_url = s;
    }
    if let Some(s) = var("NEARCHAT_CREDENTIAL_URL") {
        c.credential_url = s;
    }
    if let Some(s) = var("NEARCHAT_GEO_URL") {
        c.geo_url = s;
    }
    if let Some(s) = var("NEARCHAT_NAME") {
        c.name = s;
    }
    if let Some(s) = var("NEARCHAT_RADIUS_KM") {
        match s.parse::<f64>() {
            Ok(r) if r > 0.0 => c.radius_km = r,
            _ => warn!(value = %s, "ignoring NEARCHAT_RADIUS_KM"),
        }
    }
    if let Some(s) = var("NEARCHAT_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    config_paths()
        .into_iter()
        .find(|p| p.exists())
        .and_then(|p| read_file(&p))
}

fn read_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_with_mesh_table() {
        let c: Config = toml::from_str(
            r#"
            name = "ana"
            radius_km = 2.5

            [mesh]
            neighbor_degree = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.name, "ana");
        assert_eq!(c.radius_km, 2.5);
        assert_eq!(c.mesh.neighbor_degree, 5);
        assert_eq!(c.mesh.broadcast_ttl, 3);
        assert_eq!(c.relay_url, default_relay_url());
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(toml::from_str::<Config>("listen_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("NEARCHAT_NAME", "bo"),
            ("NEARCHAT_RADIUS_KM", "-1"),
            ("NEARCHAT_DATA_DIR", "/tmp/nc"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.name, "bo");
        assert_eq!(c.radius_km, default_radius_km());
        assert_eq!(c.identity_path(), PathBuf::from("/tmp/nc/identity.json"));
    }

    #[test]
    fn explicit_missing_file_falls_back() {
        let c = load(Some(Path::new("/nonexistent/nearchat.toml")));
        assert!(!c.relay_url.is_empty());
    }
}
