use libp2p::{
    PeerId,
    identity::{Keypair, PublicKey},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{identity::NodeIdentity, protocol::MAX_FRAME_LEN, types::Contact};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("public key does not decode")]
    InvalidKey,
    #[error("public key does not belong to node {0}")]
    KeyMismatch(String),
    #[error("signature does not verify")]
    BadSignature,
}

// ─── Announcement ───────────────────────────────────────────────────────────

/// A node's signed contact list, as sent to peers and the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: String,
    pub version: String,
    pub contacts: Vec<Contact>,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    node_id: &'a str,
    version: &'a str,
    contacts: &'a [Contact],
}

fn signing_payload(node_id: &str, version: &str, contacts: &[Contact]) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(&SignedFields {
        node_id,
        version,
        contacts,
    })?)
}

impl Announcement {
    pub fn sign(identity: &NodeIdentity, keypair: &Keypair) -> Result<Self, WireError> {
        let payload = signing_payload(&identity.node_id, &identity.version, &identity.contacts)?;
        let signature = keypair
            .sign(&payload)
            .map_err(|e| WireError::Signing(e.to_string()))?;
        Ok(Self {
            node_id: identity.node_id.clone(),
            version: identity.version.clone(),
            contacts: identity.contacts.clone(),
            public_key: keypair.public().encode_protobuf(),
            signature,
        })
    }

    /// Check that the embedded key owns `node_id` and signed the contents.
    pub fn verify(&self) -> Result<(), WireError> {
        let key = PublicKey::try_decode_protobuf(&self.public_key).map_err(|_| WireError::InvalidKey)?;
        let owner = PeerId::from_public_key(&key).to_string();
        if owner != self.node_id {
            return Err(WireError::KeyMismatch(self.node_id.clone()));
        }
        let payload = signing_payload(&self.node_id, &self.version, &self.contacts)?;
        match key.verify(&payload, &self.signature) {
            true => Ok(()),
            false => Err(WireError::BadSignature),
        }
    }
}

// ─── Relay frames ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client → relay: claim the mailbox for `node_id`.
    Register { node_id: String },
    /// Client → relay: forward `announcement` to the node registered as `to`.
    Announce {
        to: String,
        announcement: Announcement,
    },
    /// Relay → client: an announcement addressed to this node.
    Deliver { announcement: Announcement },
}

// ─── Framing ────────────────────────────────────────────────────────────────

/// Write a length-prefixed JSON message.
pub async fn write_message<T: Serialize>(
    stream: &mut (impl AsyncWrite + Unpin),
    msg: &T,
) -> Result<(), WireError> {
    let data = serde_json::to_vec(msg)?;
    let len = u32::try_from(data.len())
        .ok()
        .filter(|_| data.len() <= MAX_FRAME_LEN)
        .ok_or(WireError::FrameTooLarge(data.len()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a length-prefixed JSON message.
pub async fn read_message<T: DeserializeOwned>(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<T, WireError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Datagram encoding for UDP: the bare JSON body.
pub fn encode_datagram<T: Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let data = serde_json::to_vec(msg)?;
    match data.len() <= MAX_FRAME_LEN {
        true => Ok(data),
        false => Err(WireError::FrameTooLarge(data.len())),
    }
}

pub fn decode_datagram<T: DeserializeOwned>(data: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(data)?)
}
