use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use libp2p::{PeerId, identity::Keypair};
use serde::{Deserialize, Serialize};

use crate::types::{Contact, Protocol};

/// Load a keypair from a protobuf-encoded file, or generate a new Ed25519
/// keypair and persist it for future runs.
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    match path.exists() {
        true => {
            let bytes = fs::read(path)
                .with_context(|| format!("reading node key from {}", path.display()))?;
            let keypair = Keypair::from_protobuf_encoding(&bytes)
                .with_context(|| format!("decoding node key from {}", path.display()))?;
            tracing::info!(node_id = %keypair.public().to_peer_id(), "loaded node key");
            Ok(keypair)
        }
        false => {
            let keypair = Keypair::generate_ed25519();
            let bytes = keypair
                .to_protobuf_encoding()
                .context("encoding node key")?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
            fs::write(path, &bytes)
                .with_context(|| format!("writing node key to {}", path.display()))?;
            tracing::info!(node_id = %keypair.public().to_peer_id(), "generated new node key");
            Ok(keypair)
        }
    }
}

pub fn software_version() -> String {
    format!(
        "{} {}-{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// The contact list this node advertises, highest priority first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub version: String,
    pub contacts: Vec<Contact>,
}

impl NodeIdentity {
    pub fn empty(node_id: &PeerId) -> Self {
        Self {
            node_id: node_id.to_string(),
            version: software_version(),
            contacts: Vec::new(),
        }
    }

    pub fn order(&self) -> Vec<Protocol> {
        self.contacts.iter().map(|c| c.protocol).collect()
    }
}

pub fn identity_path(data_dir: &Path, node_id: &PeerId) -> PathBuf {
    data_dir.join(format!("identity-{node_id}.json"))
}

pub fn load_identity(path: &Path) -> Result<Option<NodeIdentity>> {
    match path.exists() {
        false => Ok(None),
        true => {
            let bytes = fs::read(path)
                .with_context(|| format!("reading identity from {}", path.display()))?;
            let identity = serde_json::from_slice(&bytes)
                .with_context(|| format!("decoding identity from {}", path.display()))?;
            Ok(Some(identity))
        }
    }
}

/// Write via a sibling temp file and rename so readers never observe a
/// partially written identity.
pub fn save_identity(path: &Path, identity: &NodeIdentity) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(identity).context("encoding identity")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
