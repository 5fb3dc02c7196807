//! In-process message fabric standing in for the host's cross-frame
//! messaging. Each subscriber owns the receiving end of a channel; dropping
//! its `Subscription` deregisters it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::notification::Notification;
use crate::error::ChannelError;

/// One outgoing delivery path for notifications
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers `notice`, returning how many receivers got it
    fn deliver(&self, notice: &Notification) -> Result<usize, ChannelError>;
}

#[derive(Default)]
struct FabricInner {
    next_id: u64,
    closed: bool,
    subscribers: Vec<(u64, Sender<Notification>)>,
}

/// Shared pub/sub hub. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct Fabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FabricInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a listener. Messages arrive on the returned receiver until
    /// the `Subscription` is dropped.
    pub fn subscribe(&self) -> (Subscription, Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push((id, tx));
        (
            Subscription {
                id,
                fabric: Arc::downgrade(&self.inner),
            },
            rx,
        )
    }

    /// Sends `notice` to every live subscriber and prunes dead ones
    pub fn broadcast(&self, notice: &Notification) -> Result<usize, ChannelError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ChannelError::Closed("fabric".to_string()));
        }
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(notice.clone()).is_ok());
        Ok(inner.subscribers.len())
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Shuts the fabric down; later broadcasts fail
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

/// Registration handle returned by [`Fabric::subscribe`]
pub struct Subscription {
    id: u64,
    fabric: Weak<Mutex<FabricInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.fabric.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Named [`Channel`] over a [`Fabric`]
pub struct FabricChannel {
    name: String,
    fabric: Fabric,
}

impl FabricChannel {
    pub fn new(name: impl Into<String>, fabric: Fabric) -> Self {
        Self {
            name: name.into(),
            fabric,
        }
    }
}

impl Channel for FabricChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, notice: &Notification) -> Result<usize, ChannelError> {
        self.fabric
            .broadcast(notice)
            .map_err(|_| ChannelError::Closed(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::notification::RefreshHint;

    fn hint(count: usize) -> Notification {
        Notification::Refresh(RefreshHint {
            action: "test".to_string(),
            count,
            timestamp: 0,
        })
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let fabric = Fabric::new();
        let (_a, rx_a) = fabric.subscribe();
        let (_b, rx_b) = fabric.subscribe();

        assert_eq!(fabric.broadcast(&hint(1)).unwrap(), 2);
        assert_eq!(rx_a.try_recv().unwrap(), hint(1));
        assert_eq!(rx_b.try_recv().unwrap(), hint(1));
    }

    #[test]
    fn test_dropping_subscription_deregisters() {
        let fabric = Fabric::new();
        let (sub, rx) = fabric.subscribe();
        assert_eq!(fabric.subscriber_count(), 1);

        drop(sub);
        assert_eq!(fabric.subscriber_count(), 0);
        assert_eq!(fabric.broadcast(&hint(1)).unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_receivers_are_pruned() {
        let fabric = Fabric::new();
        let (_sub, rx) = fabric.subscribe();
        drop(rx);
        assert_eq!(fabric.broadcast(&hint(1)).unwrap(), 0);
    }

    #[test]
    fn test_closed_channel_reports_error() {
        let fabric = Fabric::new();
        let channel = FabricChannel::new("parent", fabric.clone());
        fabric.close();
        assert_eq!(
            channel.deliver(&hint(1)),
            Err(ChannelError::Closed("parent".to_string()))
        );
    }
}
