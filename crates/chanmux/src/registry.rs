//! Bijective name-to-channel lookup table

use std::collections::HashMap;

use chanmux_proto::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelId};

/// Book-keeping for one registered channel.
pub(crate) struct ChannelEntry {
    /// Registered identity, the key of the inverse map
    pub(crate) id: ChannelId,
    /// Send side of the channel queue; inbound `Data` is delivered here
    pub(crate) queue_tx: mpsc::Sender<Message>,
    /// Send side of the delivery queue the application receives from
    pub(crate) delivery_tx: mpsc::Sender<Message>,
    /// Handle cloned out to the application
    pub(crate) handle: Channel,
    /// Forwarding task feeding the manager's shared fan-in queue
    pub(crate) forward: JoinHandle<()>,
}

/// Name-to-channel map and its inverse, kept consistent on every mutation.
/// Not internally synchronized: all access happens under the owning
/// manager's lock.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    by_name: HashMap<String, ChannelEntry>,
    names: HashMap<ChannelId, String>,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert into both directions. The caller must have checked uniqueness.
    pub(crate) fn add(&mut self, name: String, entry: ChannelEntry) {
        self.names.insert(entry.id, name.clone());
        self.by_name.insert(name, entry);
    }

    /// Remove from both directions, returning the entry if it existed.
    pub(crate) fn remove(&mut self, name: &str) -> Option<ChannelEntry> {
        let entry = self.by_name.remove(name)?;
        self.names.remove(&entry.id);
        Some(entry)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub(crate) fn channel(&self, name: &str) -> Option<&ChannelEntry> {
        self.by_name.get(name)
    }

    pub(crate) fn name_of(&self, id: &ChannelId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Delivery-queue sender for the channel with the given identity.
    pub(crate) fn delivery_for(&self, id: &ChannelId) -> Option<mpsc::Sender<Message>> {
        let name = self.names.get(id)?;
        self.by_name.get(name).map(|entry| entry.delivery_tx.clone())
    }

    /// Sorted snapshot of the registered names.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every channel and discard both maps. Terminal.
    pub(crate) fn close_all(&mut self) {
        for (_, entry) in self.by_name.drain() {
            entry.forward.abort();
        }
        self.names.clear();
    }
}
