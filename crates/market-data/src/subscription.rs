//! Subscription bookkeeping.
//!
//! The registry is the set of streams the application wants, independent of
//! whether a socket is open. The connection manager reads it after every
//! (re)connect and never clears it.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// One requested stream: a channel, optionally scoped to a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Subscription {
    pub channel: String,
    pub symbol: Option<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, symbol: Option<&str>) -> Self {
        Self {
            channel: channel.into(),
            symbol: symbol.map(str::to_string),
        }
    }

    /// Identity key, which is also the exchange topic: `channel.symbol`, or
    /// the bare channel when there is no symbol.
    pub fn key(&self) -> String {
        subscription_key(&self.channel, self.symbol.as_deref())
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Build the identity key / topic for a channel and optional symbol.
pub fn subscription_key(channel: &str, symbol: Option<&str>) -> String {
    match symbol {
        Some(symbol) if !symbol.is_empty() => format!("{channel}.{symbol}"),
        _ => channel.to_string(),
    }
}

/// Idempotent set of subscriptions keyed by topic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns `false` if the key was already present.
    pub fn subscribe(&mut self, channel: &str, symbol: Option<&str>) -> bool {
        let sub = Subscription::new(channel, symbol);
        let key = sub.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, sub);
        true
    }

    /// Remove a subscription. Returns `false` if the key was absent.
    pub fn unsubscribe(&mut self, channel: &str, symbol: Option<&str>) -> bool {
        self.entries
            .remove(&subscription_key(channel, symbol))
            .is_some()
    }

    pub fn contains(&self, channel: &str, symbol: Option<&str>) -> bool {
        self.entries.contains_key(&subscription_key(channel, symbol))
    }

    /// Lookup by topic string rather than by parts.
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    /// Snapshot of every subscription, for re-application after a reconnect.
    pub fn list_all(&self) -> Vec<Subscription> {
        self.entries.values().cloned().collect()
    }

    /// Topic strings of every subscription.
    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
