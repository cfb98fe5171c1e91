//! # Subscription Registry
//!
//! Per-enqueuer table of `(cwd, handler) -> subscription`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::Serialize;

use super::errors::{EnqueuerError, EnqueuerResult};
use crate::queue::{Target, TargetKey};

/// Health of a subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    /// The subscription will not emit events
    pub closed: bool,

    /// Why the subscription closed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SubscriptionStatus {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            closed: true,
            error_message: Some(message.into()),
        }
    }
}

/// A target bound to trigger options and the resource serving it
#[derive(Debug)]
pub struct Subscription<O, H> {
    pub target: Target,
    pub options: O,
    pub status: SubscriptionStatus,
    pub handle: H,
}

/// Subscriptions of one enqueuer
#[derive(Debug)]
pub struct SubscriptionRegistry<O, H> {
    entries: RwLock<BTreeMap<TargetKey, Subscription<O, H>>>,
}

impl<O, H> Default for SubscriptionRegistry<O, H> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<O: Clone + PartialEq, H> SubscriptionRegistry<O, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of an identical subscription if one exists
    pub fn identical(&self, target: &Target, options: &O) -> EnqueuerResult<Option<SubscriptionStatus>> {
        let entries = self.entries.read().map_err(|_| EnqueuerError::poisoned())?;
        Ok(entries
            .get(&target.key())
            .filter(|sub| sub.target == *target && sub.options == *options)
            .map(|sub| sub.status.clone()))
    }

    /// Store a subscription, returning the one it displaced
    pub fn insert(&self, subscription: Subscription<O, H>) -> EnqueuerResult<Option<Subscription<O, H>>> {
        let mut entries = self.entries.write().map_err(|_| EnqueuerError::poisoned())?;
        Ok(entries.insert(subscription.target.key(), subscription))
    }

    pub fn take(&self, key: &TargetKey) -> EnqueuerResult<Option<Subscription<O, H>>> {
        let mut entries = self.entries.write().map_err(|_| EnqueuerError::poisoned())?;
        Ok(entries.remove(key))
    }

    /// Remove every subscription `selector` covers
    pub fn remove_matching(&self, selector: &Target) -> EnqueuerResult<Vec<Subscription<O, H>>> {
        let mut entries = self.entries.write().map_err(|_| EnqueuerError::poisoned())?;
        let keys: Vec<TargetKey> = entries
            .values()
            .filter(|sub| selector.covers(&sub.target))
            .map(|sub| sub.target.key())
            .collect();
        Ok(keys.iter().filter_map(|key| entries.remove(key)).collect())
    }

    /// Mark a subscription closed, e.g. when its stream ended
    pub fn close(&self, key: &TargetKey, message: impl Into<String>) -> EnqueuerResult<()> {
        let mut entries = self.entries.write().map_err(|_| EnqueuerError::poisoned())?;
        if let Some(sub) = entries.get_mut(key) {
            sub.status = SubscriptionStatus::failed(message);
        }
        Ok(())
    }

    /// Collect whatever `f` extracts from each subscription
    pub fn collect<R, F>(&self, mut f: F) -> EnqueuerResult<Vec<R>>
    where
        F: FnMut(&Subscription<O, H>) -> Option<R>,
    {
        let entries = self.entries.read().map_err(|_| EnqueuerError::poisoned())?;
        Ok(entries.values().filter_map(|sub| f(sub)).collect())
    }

    /// First value `f` extracts, in key order
    pub fn find_map<R, F>(&self, f: F) -> EnqueuerResult<Option<R>>
    where
        F: FnMut(&Subscription<O, H>) -> Option<R>,
    {
        let entries = self.entries.read().map_err(|_| EnqueuerError::poisoned())?;
        Ok(entries.values().find_map(f))
    }

    /// Targets, options and statuses of every subscription
    pub fn snapshot(&self) -> EnqueuerResult<Vec<(Target, O, SubscriptionStatus)>> {
        self.collect(|sub| Some((sub.target.clone(), sub.options.clone(), sub.status.clone())))
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
