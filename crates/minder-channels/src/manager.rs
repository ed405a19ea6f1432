use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelStatus};
use crate::error::{ChannelError, Result};

/// Owns the registered channel adapters by name and drives their lifecycle
/// in registration order. Shutdown stops channels in reverse order.
pub struct ChannelManager {
    channels: Vec<Arc<dyn Channel>>,
    by_name: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a channel adapter. A channel with the same name replaces
    /// the previous registration.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.channel_type().to_string();
        info!(channel = %name, "registering channel adapter");
        if self.by_name.insert(name.clone(), channel.clone()).is_some() {
            self.channels
                .retain(|c| c.channel_type() != name.as_str());
        }
        self.channels.push(channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.by_name.get(name).cloned()
    }

    /// Start all registered channels. A channel that fails to start is
    /// logged and skipped; the rest still come up.
    pub async fn start_all(&self) {
        for channel in &self.channels {
            let name = channel.channel_type();
            info!(channel = %name, "starting channel");
            if let Err(e) = channel.start().await {
                error!(channel = %name, error = %e, "channel failed to start");
            }
        }
    }

    /// Stop all channels, newest registration first. Errors are logged but
    /// do not abort the remaining stops.
    pub async fn stop_all(&self) {
        for channel in self.channels.iter().rev() {
            let name = channel.channel_type();
            info!(channel = %name, "stopping channel");
            if let Err(e) = channel.stop().await {
                warn!(channel = %name, error = %e, "error while stopping channel");
            }
        }
    }

    /// Restart one channel: stop, then start with a fresh settings read.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let channel = self
            .get(name)
            .ok_or_else(|| ChannelError::Config(format!("unknown channel: {name}")))?;
        info!(channel = %name, "restarting channel");
        channel.stop().await?;
        channel.start().await
    }

    /// Current status of every channel, sorted by name.
    pub fn statuses(&self) -> Vec<(String, ChannelStatus)> {
        let mut result: Vec<(String, ChannelStatus)> = self
            .channels
            .iter()
            .map(|c| (c.channel_type().to_string(), c.status()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InboundHandler;
    use async_trait::async_trait;
    use minder_core::OutboundMessage;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeChannel {
        name: &'static str,
        running: AtomicBool,
        starts: AtomicU32,
    }

    impl FakeChannel {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                running: AtomicBool::new(false),
                starts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        fn channel_type(&self) -> &str {
            self.name
        }
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn status(&self) -> ChannelStatus {
            if self.is_running() {
                ChannelStatus::Running
            } else {
                ChannelStatus::Stopped
            }
        }
        fn on_message(&self, _handler: Arc<dyn InboundHandler>) {}
        async fn send_message(&self, _: &str, _: &OutboundMessage) -> Result<()> {
            Ok(())
        }
        async fn send_voice(&self, _: &str, _: &[u8], _: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn send_photo(&self, _: &str, _: &[u8], _: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn send_document(
            &self,
            _: &str,
            _: &[u8],
            _: &str,
            _: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn show_typing(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn is_authorized(&self, _: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn start_all_then_stop_all() {
        let mut manager = ChannelManager::new();
        let a = FakeChannel::new("alpha");
        let b = FakeChannel::new("beta");
        manager.register(a.clone());
        manager.register(b.clone());

        manager.start_all().await;
        assert!(a.is_running() && b.is_running());

        manager.stop_all().await;
        assert!(!a.is_running() && !b.is_running());
    }

    #[tokio::test]
    async fn restart_stops_then_starts() {
        let mut manager = ChannelManager::new();
        let a = FakeChannel::new("alpha");
        manager.register(a.clone());
        manager.start_all().await;

        manager.restart("alpha").await.unwrap();
        assert!(a.is_running());
        assert_eq!(a.starts.load(Ordering::SeqCst), 2);

        assert!(manager.restart("ghost").await.is_err());
    }

    #[tokio::test]
    async fn statuses_are_sorted_by_name() {
        let mut manager = ChannelManager::new();
        manager.register(FakeChannel::new("zulu"));
        manager.register(FakeChannel::new("alpha"));
        let statuses = manager.statuses();
        assert_eq!(statuses[0].0, "alpha");
        assert_eq!(statuses[1].0, "zulu");
    }

    #[tokio::test]
    async fn reregistering_replaces_by_name() {
        let mut manager = ChannelManager::new();
        let first = FakeChannel::new("alpha");
        let second = FakeChannel::new("alpha");
        manager.register(first);
        manager.register(second.clone());
        manager.start_all().await;
        assert_eq!(manager.statuses().len(), 1);
        assert!(second.is_running());
    }
}
