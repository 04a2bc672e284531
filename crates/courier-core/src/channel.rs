//! In-process named broadcast channels.
//!
//! A [`Hub`] is the shared medium. Opening a [`Channel`] subscribes to a
//! name; posting delivers a JSON value to every *other* subscriber currently
//! open on that name. A post nobody else is listening for is dropped. Each
//! subscriber receives messages in the order they were posted.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Shared channel medium. Cheap to clone.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to `name`.
    pub fn open(&self, name: impl Into<String>) -> Channel {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state
            .subscribers
            .entry(name.clone())
            .or_default()
            .push(Subscriber { id, tx });

        Channel {
            name,
            id,
            hub: self.clone(),
            rx,
        }
    }

    /// Post once without subscribing. Returns the number of receivers.
    pub fn post<T: Serialize>(&self, name: &str, msg: &T) -> Result<usize, ChannelError> {
        let value = serde_json::to_value(msg).map_err(ChannelError::Encode)?;
        Ok(self.deliver(name, None, value))
    }

    /// Number of subscribers open on `name`.
    pub fn listeners(&self, name: &str) -> usize {
        self.state().subscribers.get(name).map_or(0, Vec::len)
    }

    fn is_open(&self, name: &str, id: u64) -> bool {
        self.state()
            .subscribers
            .get(name)
            .is_some_and(|subs| subs.iter().any(|s| s.id == id))
    }

    fn deliver(&self, name: &str, from: Option<u64>, value: Value) -> usize {
        let mut state = self.state();
        let Some(subs) = state.subscribers.get_mut(name) else {
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|sub| {
            if Some(sub.id) == from {
                return true;
            }
            match sub.tx.send(value.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    fn close(&self, name: &str, id: u64) {
        let mut state = self.state();
        if let Some(subs) = state.subscribers.get_mut(name) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                state.subscribers.remove(name);
            }
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Hub")
            .field("channels", &state.subscribers.len())
            .finish()
    }
}

/// A subscription to one channel name. Unsubscribes on drop.
pub struct Channel {
    name: String,
    id: u64,
    hub: Hub,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver `msg` to every other subscriber on this name.
    pub fn post<T: Serialize>(&self, msg: &T) -> Result<usize, ChannelError> {
        let value = serde_json::to_value(msg).map_err(ChannelError::Encode)?;
        Ok(self.hub.deliver(&self.name, Some(self.id), value))
    }

    /// Next message. Pending until one arrives.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Next message, decoded.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<Result<T, ChannelError>> {
        let value = self.rx.recv().await?;
        Some(serde_json::from_value(value).map_err(ChannelError::Decode))
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// A post-only handle sharing this subscription's identity.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            name: self.name.clone(),
            id: self.id,
            hub: self.hub.clone(),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.hub.close(&self.name, self.id);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Post-only handle to an open [`Channel`].
///
/// Posting fails with [`ChannelError::Closed`] once the channel is dropped.
#[derive(Clone)]
pub struct ChannelSender {
    name: String,
    id: u64,
    hub: Hub,
}

impl ChannelSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post<T: Serialize>(&self, msg: &T) -> Result<usize, ChannelError> {
        if !self.hub.is_open(&self.name, self.id) {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        let value = serde_json::to_value(msg).map_err(ChannelError::Encode)?;
        Ok(self.hub.deliver(&self.name, Some(self.id), value))
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn post_reaches_other_subscribers_only() {
        let hub = Hub::new();
        let mut a = hub.open("radio");
        let mut b = hub.open("radio");
        let mut c = hub.open("radio");

        assert_eq!(a.post(&json!("hello")).unwrap(), 2);
        assert_eq!(b.recv().await, Some(json!("hello")));
        assert_eq!(c.recv().await, Some(json!("hello")));
        assert_eq!(a.try_recv(), None);
    }

    #[tokio::test]
    async fn preserves_send_order() {
        let hub = Hub::new();
        let tx = hub.open("ordered");
        let mut rx = hub.open("ordered");

        for i in 0..5 {
            tx.post(&i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(json!(i)));
        }
    }

    #[test]
    fn names_are_isolated_and_unheard_posts_drop() {
        let hub = Hub::new();
        let mut a = hub.open("a");
        assert_eq!(hub.post("b", &1).unwrap(), 0);
        assert_eq!(a.try_recv(), None);
        assert_eq!(hub.post("a", &1).unwrap(), 1);
        assert_eq!(a.try_recv(), Some(json!(1)));
    }

    #[test]
    fn drop_unsubscribes_and_closes_senders() {
        let hub = Hub::new();
        let channel = hub.open("client");
        let sender = channel.sender();
        assert_eq!(hub.listeners("client"), 1);

        drop(channel);
        assert_eq!(hub.listeners("client"), 0);
        assert!(matches!(sender.post(&1), Err(ChannelError::Closed(_))));
    }

    #[tokio::test]
    async fn recv_as_decodes() {
        let hub = Hub::new();
        let mut rx = hub.open("typed");
        hub.post("typed", &json!({ "n": 3 })).unwrap();
        hub.post("typed", &json!("oops")).unwrap();

        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct N {
            n: u32,
        }

        assert_eq!(rx.recv_as::<N>().await.unwrap().unwrap(), N { n: 3 });
        assert!(matches!(rx.recv_as::<N>().await, Some(Err(ChannelError::Decode(_)))));
    }
}
