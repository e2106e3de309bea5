//! Key-value mailbox the two peers use to exchange connection offers before the channel exists.

use async_trait::async_trait;
use p2ptun_core::TimeoutCache;

use crate::config::RendezvousConfig;
use crate::error::Result;

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Store `value` under `key`. Returns false if the store refused or could not be reached.
    async fn write(&self, key: &str, value: &str) -> bool;
    /// `None` when nothing is stored or the entry expired.
    async fn read(&self, key: &str) -> Option<String>;
}

/// In-process mailbox. Entries expire between one and two `mailbox_ttl` after they were
/// written; reads do not extend them.
#[derive(Clone)]
pub struct MemoryRendezvous {
    mailbox: TimeoutCache<String, String>,
}

impl MemoryRendezvous {
    pub fn new(config: &RendezvousConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            mailbox: TimeoutCache::new(config.mailbox_ttl),
        })
    }
    pub fn len(&self) -> usize {
        self.mailbox.len()
    }
    pub fn is_empty(&self) -> bool {
        self.mailbox.is_empty()
    }
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn write(&self, key: &str, value: &str) -> bool {
        if key.is_empty() || value.is_empty() {
            return false;
        }
        self.mailbox.set(key.to_string(), value.to_string());
        true
    }

    async fn read(&self, key: &str) -> Option<String> {
        self.mailbox.get(&key.to_string(), false)
    }
}
