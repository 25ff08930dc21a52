//! Persistent node identity: `{ "id": "<uuid>", "secretKey": "<base64>" }`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use nearchat_core::{Identity, Keypair, PeerId};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    id: Uuid,
    secret_key: String,
}

/// Read the identity at `path`, or create and save a fresh one.
pub fn load_or_create(path: &Path) -> Result<Identity> {
    if path.exists() {
        return load(path);
    }
    let identity = Identity::generate();
    save(path, &identity)?;
    info!(id = %identity.id(), path = %path.display(), "created identity");
    Ok(identity)
}

pub fn load(path: &Path) -> Result<Identity> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading identity {}", path.display()))?;
    let stored: StoredIdentity =
        serde_json::from_str(&text).with_context(|| format!("parsing identity {}", path.display()))?;
    let bytes = STANDARD
        .decode(stored.secret_key.as_bytes())
        .context("identity secret is not base64")?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("identity secret has {} bytes, want 32", b.len()))?;
    Ok(Identity::from_parts(
        PeerId::from_uuid(stored.id),
        Keypair::from_secret_bytes(secret),
    ))
}

pub fn save(path: &Path, identity: &Identity) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let stored = StoredIdentity {
        id: *identity.id().as_uuid(),
        secret_key: STANDARD.encode(identity.keypair().secret_bytes()),
    };
    let text = serde_json::to_string_pretty(&stored)?;
    std::fs::write(path, text).with_context(|| format!("writing identity {}", path.display()))?;
    Ok(())
}
