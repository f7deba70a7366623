//! Pub/sub collaborator: topics, push subscriptions, publish
//!
//! The queue dispatcher provisions one topic and one push subscription
//! per queue through this seam and publishes work onto topics. Delivery
//! back into the process happens over HTTP push, not through this
//! trait, so the trait stays narrow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("pubsub: topic {0:?} not found")]
    TopicNotFound(String),
    #[error("pubsub: subscription {0:?} not found")]
    SubscriptionNotFound(String),
    #[error("pubsub: {0}")]
    Backend(String),
}

/// Push delivery settings of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    pub endpoint: String,
}

pub trait PubSub: Send + Sync {
    fn topic_exists(&self, ctx: &Context, name: &str) -> Result<bool, PubSubError>;
    fn create_topic(&self, ctx: &Context, name: &str) -> Result<(), PubSubError>;
    fn subscription_exists(&self, ctx: &Context, name: &str) -> Result<bool, PubSubError>;
    fn create_subscription(
        &self,
        ctx: &Context,
        name: &str,
        topic: &str,
        ack_deadline: Duration,
        push: PushConfig,
    ) -> Result<(), PubSubError>;
    fn push_config(&self, ctx: &Context, name: &str) -> Result<PushConfig, PubSubError>;
    fn set_push_config(&self, ctx: &Context, name: &str, push: PushConfig)
        -> Result<(), PubSubError>;
    /// Returns the assigned message id
    fn publish(&self, ctx: &Context, topic: &str, data: Vec<u8>) -> Result<String, PubSubError>;
}

#[derive(Debug, Clone)]
struct Subscription {
    topic: String,
    ack_deadline: Duration,
    push: PushConfig,
}

#[derive(Default)]
struct Inner {
    topics: Vec<String>,
    subscriptions: HashMap<String, Subscription>,
    published: Vec<(String, Vec<u8>)>,
    next_message_id: u64,
}

/// In-memory [`PubSub`] for tests and dev servers
///
/// Published messages accumulate in a log that tests can drain and
/// hand-deliver through the push endpoint.
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the published-message log: (topic, payload) pairs in
    /// publish order.
    pub fn take_published(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().unwrap().published)
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().unwrap().topics.clone()
    }

    /// Topic a subscription is bound to
    pub fn subscription_topic(&self, name: &str) -> Option<String> {
        self.inner.lock().unwrap().subscriptions.get(name).map(|s| s.topic.clone())
    }

    /// Ack deadline a subscription was created with
    pub fn subscription_deadline(&self, name: &str) -> Option<Duration> {
        self.inner.lock().unwrap().subscriptions.get(name).map(|s| s.ack_deadline)
    }
}

impl PubSub for MemoryPubSub {
    fn topic_exists(&self, _ctx: &Context, name: &str) -> Result<bool, PubSubError> {
        Ok(self.inner.lock().unwrap().topics.iter().any(|t| t == name))
    }

    fn create_topic(&self, _ctx: &Context, name: &str) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.topics.iter().any(|t| t == name) {
            inner.topics.push(name.to_string());
        }
        Ok(())
    }

    fn subscription_exists(&self, _ctx: &Context, name: &str) -> Result<bool, PubSubError> {
        Ok(self.inner.lock().unwrap().subscriptions.contains_key(name))
    }

    fn create_subscription(
        &self,
        _ctx: &Context,
        name: &str,
        topic: &str,
        ack_deadline: Duration,
        push: PushConfig,
    ) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.topics.iter().any(|t| t == topic) {
            return Err(PubSubError::TopicNotFound(topic.to_string()));
        }
        inner.subscriptions.insert(
            name.to_string(),
            Subscription { topic: topic.to_string(), ack_deadline, push },
        );
        Ok(())
    }

    fn push_config(&self, _ctx: &Context, name: &str) -> Result<PushConfig, PubSubError> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .get(name)
            .map(|s| s.push.clone())
            .ok_or_else(|| PubSubError::SubscriptionNotFound(name.to_string()))
    }

    fn set_push_config(
        &self,
        _ctx: &Context,
        name: &str,
        push: PushConfig,
    ) -> Result<(), PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.subscriptions.get_mut(name) {
            Some(sub) => {
                sub.push = push;
                Ok(())
            }
            None => Err(PubSubError::SubscriptionNotFound(name.to_string())),
        }
    }

    fn publish(&self, _ctx: &Context, topic: &str, data: Vec<u8>) -> Result<String, PubSubError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.topics.iter().any(|t| t == topic) {
            return Err(PubSubError::TopicNotFound(topic.to_string()));
        }
        inner.next_message_id += 1;
        let id = inner.next_message_id.to_string();
        inner.published.push((topic.to_string(), data));
        Ok(id)
    }
}
