use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use libp2p::PeerId;
use thiserror::Error;

use crate::{
    identity::{self, NodeIdentity},
    types::{Contact, Protocol},
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("refusing to publish an empty contact list")]
    EmptyContacts,
    #[error("protocol {0} has no published contact")]
    NotPublished(Protocol),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// Sole writer of [`NodeIdentity`]. Every mutation is persisted before it
/// becomes visible to readers.
pub struct IdentityPublisher {
    path: PathBuf,
    priority: Vec<Protocol>,
    current: NodeIdentity,
}

impl IdentityPublisher {
    pub fn open(data_dir: &Path, node_id: &PeerId, priority: Vec<Protocol>) -> anyhow::Result<Self> {
        let path = identity::identity_path(data_dir, node_id);
        let current = match identity::load_identity(&path)? {
            Some(previous) if previous.node_id == node_id.to_string() => {
                tracing::info!(
                    path = %path.display(),
                    contacts = previous.contacts.len(),
                    "loaded persisted identity"
                );
                previous
            }
            Some(_) | None => NodeIdentity::empty(node_id),
        };
        Ok(Self {
            path,
            priority,
            current,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the contact list. Protocols keep their previous relative
    /// order, new ones are appended by priority, and `demote` entries are
    /// pushed to the back rather than removed.
    pub fn publish(
        &mut self,
        contacts: Vec<Contact>,
        demote: &BTreeSet<Protocol>,
    ) -> Result<&NodeIdentity, PublishError> {
        if contacts.is_empty() {
            return Err(PublishError::EmptyContacts);
        }

        let order = order_contacts(&self.current.order(), &contacts, demote, &self.priority);
        let next = NodeIdentity {
            node_id: self.current.node_id.clone(),
            version: identity::software_version(),
            contacts: order
                .into_iter()
                .filter_map(|p| contacts.iter().find(|c| c.protocol == p).cloned())
                .collect(),
        };

        self.commit(next)
    }

    /// Move `protocol` to the front of the contact list.
    pub fn promote(&mut self, protocol: Protocol) -> Result<&NodeIdentity, PublishError> {
        let position = self
            .current
            .contacts
            .iter()
            .position(|c| c.protocol == protocol)
            .ok_or(PublishError::NotPublished(protocol))?;

        let mut next = self.current.clone();
        let contact = next.contacts.remove(position);
        next.contacts.insert(0, contact);
        self.commit(next)
    }

    fn commit(&mut self, next: NodeIdentity) -> Result<&NodeIdentity, PublishError> {
        identity::save_identity(&self.path, &next)?;
        tracing::info!(
            contacts = %next
                .contacts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            version = %next.version,
            "identity published"
        );
        self.current = next;
        Ok(&self.current)
    }
}

fn rank(priority: &[Protocol], protocol: Protocol) -> usize {
    priority
        .iter()
        .position(|p| *p == protocol)
        .unwrap_or(priority.len())
}

pub fn order_contacts(
    previous: &[Protocol],
    contacts: &[Contact],
    demote: &BTreeSet<Protocol>,
    priority: &[Protocol],
) -> Vec<Protocol> {
    let present: BTreeSet<Protocol> = contacts.iter().map(|c| c.protocol).collect();

    let mut fresh: Vec<Protocol> = present
        .iter()
        .copied()
        .filter(|p| !previous.contains(p))
        .collect();
    fresh.sort_by_key(|p| rank(priority, *p));

    let (kept, pushed): (Vec<Protocol>, Vec<Protocol>) = previous
        .iter()
        .copied()
        .filter(|p| present.contains(p))
        .chain(fresh)
        .partition(|p| !demote.contains(p));

    kept.into_iter().chain(pushed).collect()
}
