//! Connected contexts and the owner slot

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{ContextId, HubMessage};

/// One connected context
#[derive(Debug)]
pub struct ContextEntry {
    pub id: ContextId,
    pub tx: mpsc::Sender<HubMessage>,
    pub connected_at: DateTime<Utc>,

    /// Set once this context has been elected; cleared only by disconnecting
    pub elected_at: Option<DateTime<Utc>>,
}

/// What a disconnect changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub was_owner: bool,
}

/// Tracks connected contexts and which one owns the resource
///
/// Election picks the lowest connected id, i.e. the context that has been
/// connected the longest. The owner slot only ever names a connected context.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: ContextId,
    contexts: BTreeMap<ContextId, ContextEntry>,
    owner: Option<ContextId>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Register a channel under a fresh id
    pub fn connect(&mut self, tx: mpsc::Sender<HubMessage>) -> ContextId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        self.contexts.insert(
            id,
            ContextEntry {
                id,
                tx,
                connected_at: Utc::now(),
                elected_at: None,
            },
        );
        debug!(context_id = id, connected = self.contexts.len(), "Registry::connect");
        id
    }

    /// Remove a context, vacating the owner slot if it held it
    ///
    /// Returns None for ids that are not connected.
    pub fn disconnect(&mut self, id: ContextId) -> Option<Departure> {
        let entry = self.contexts.remove(&id)?;
        let connected_secs = (Utc::now() - entry.connected_at).num_seconds();
        let was_owner = self.owner == Some(id);
        if was_owner {
            let owned_secs = entry.elected_at.map(|at| (Utc::now() - at).num_seconds());
            info!(context_id = id, connected_secs, ?owned_secs, "Owner disconnected");
            self.owner = None;
        }
        debug!(context_id = id, connected_secs, connected = self.contexts.len(), "Registry::disconnect");
        Some(Departure { was_owner })
    }

    /// Fill an empty owner slot
    ///
    /// Returns the newly elected context, which must receive exactly one
    /// ElectionNotice. Returns None if there already is an owner or nobody is
    /// connected.
    pub fn elect(&mut self) -> Option<ContextId> {
        if self.owner.is_some() {
            return None;
        }

        let Some(entry) = self.contexts.values_mut().next() else {
            debug!("Registry::elect: no connected contexts, owner slot stays empty");
            return None;
        };

        if entry.elected_at.is_some() {
            // Ownership only ends by disconnecting, so this cannot be reached
            warn!(context_id = entry.id, "Registry::elect: context already elected");
            return None;
        }

        entry.elected_at = Some(Utc::now());
        self.owner = Some(entry.id);
        info!(context_id = entry.id, "Elected owner");
        Some(entry.id)
    }

    pub fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// When the current owner was elected
    pub fn owner_since(&self) -> Option<DateTime<Utc>> {
        self.owner
            .and_then(|id| self.contexts.get(&id))
            .and_then(|entry| entry.elected_at)
    }

    pub fn is_owner(&self, id: ContextId) -> bool {
        self.owner == Some(id)
    }

    pub fn get(&self, id: ContextId) -> Option<&ContextEntry> {
        self.contexts.get(&id)
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.contexts.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
