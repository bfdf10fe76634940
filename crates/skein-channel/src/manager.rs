//! Process-local channel registry.
//!
//! The engine keeps its channels here: a bounded, name-keyed map handing
//! out reference-counted handles. The registry never touches buffers; it
//! only manages handle lifetime. Destroying an entry drops the registry's
//! reference, while live handles keep the channel mapped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{Channel, CreateError};
use crate::layout::ChannelConfig;

/// Maximum number of channels a single registry will hold.
pub const MAX_CHANNELS: usize = 32;

/// Errors from [`ChannelManager::add_channel`].
#[derive(Debug)]
pub enum AddChannelError {
    /// The registry already holds [`MAX_CHANNELS`] channels.
    TooManyChannels,
    /// A channel with this name already exists in the registry.
    DuplicateName,
    Create(CreateError),
}

impl std::fmt::Display for AddChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddChannelError::TooManyChannels => write!(f, "too many channels"),
            AddChannelError::DuplicateName => write!(f, "channel name already exists"),
            AddChannelError::Create(e) => write!(f, "channel creation failed: {e}"),
        }
    }
}

impl std::error::Error for AddChannelError {}

/// A bounded registry of channels keyed by name.
///
/// All operations take a short-held mutex around the map; none of them
/// touch the data path.
#[derive(Default)]
pub struct ChannelManager {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new channel and register it under `name`.
    pub fn add_channel(
        &self,
        name: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<Channel>, AddChannelError> {
        let mut channels = self.channels.lock();

        if channels.len() >= MAX_CHANNELS {
            tracing::warn!(channel = name, "too many channels");
            return Err(AddChannelError::TooManyChannels);
        }
        if channels.contains_key(name) {
            tracing::warn!(channel = name, "channel already exists");
            return Err(AddChannelError::DuplicateName);
        }

        let channel = Arc::new(Channel::create(name, config).map_err(AddChannelError::Create)?);
        channels.insert(name.to_owned(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Drop the registry's reference to `name`. Outstanding handles keep
    /// the channel alive; removing an unknown name is a no-op.
    pub fn destroy_channel(&self, name: &str) {
        self.channels.lock().remove(name);
    }

    /// Look up a channel by name.
    pub fn get_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(name).cloned()
    }

    /// All channels currently registered.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// Number of channels currently registered.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("skein-mgr-{}-{}-{}", std::process::id(), tag, n)
    }

    fn test_config() -> ChannelConfig {
        ChannelConfig {
            engine_ring_slots: 16,
            app_ring_slots: 16,
            buf_ring_slots: 8,
            buffer_size: 1024,
            pin_memory: false,
        }
    }

    #[test]
    fn add_get_destroy_roundtrip() {
        let manager = ChannelManager::new();
        let name = unique_name("basic");

        let created = manager.add_channel(&name, &test_config()).expect("add");
        assert_eq!(manager.channel_count(), 1);

        let looked_up = manager.get_channel(&name).expect("lookup");
        assert!(Arc::ptr_eq(&created, &looked_up));
        assert_eq!(manager.channels().len(), 1);

        manager.destroy_channel(&name);
        assert_eq!(manager.channel_count(), 0);
        assert!(manager.get_channel(&name).is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let manager = ChannelManager::new();
        let name = unique_name("dup");

        manager.add_channel(&name, &test_config()).expect("first");
        assert!(matches!(
            manager.add_channel(&name, &test_config()),
            Err(AddChannelError::DuplicateName)
        ));
        assert_eq!(manager.channel_count(), 1);
    }

    #[test]
    fn live_handles_outlive_registry_entry() {
        let manager = ChannelManager::new();
        let name = unique_name("live");

        let handle = manager.add_channel(&name, &test_config()).expect("add");
        manager.destroy_channel(&name);

        // The channel is still fully usable through the surviving handle.
        let index = handle.alloc_msgbuf().expect("alloc");
        assert!(handle.free_msgbuf(index));
    }

    #[test]
    fn registry_is_bounded() {
        let manager = ChannelManager::new();
        let base = unique_name("cap");

        for i in 0..MAX_CHANNELS {
            manager
                .add_channel(&format!("{base}-{i}"), &test_config())
                .expect("add within bound");
        }
        assert!(matches!(
            manager.add_channel(&format!("{base}-overflow"), &test_config()),
            Err(AddChannelError::TooManyChannels)
        ));
    }

    #[test]
    fn failed_creation_is_not_registered() {
        let manager = ChannelManager::new();
        let name = unique_name("fail");
        let mut config = test_config();
        config.buf_ring_slots = 6;

        assert!(matches!(
            manager.add_channel(&name, &config),
            Err(AddChannelError::Create(_))
        ));
        assert_eq!(manager.channel_count(), 0);
    }
}
