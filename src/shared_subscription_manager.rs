// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use crate::packet::SubscriptionOptions;
use crate::subscription_store::{topic_matches_filter, ClientId};

/// Subscription details stored per share-group member.
#[derive(Debug, Clone, Copy)]
pub struct SharedSubscriptionDetails {
    pub options: SubscriptionOptions,
    pub sub_id: Option<u32>,
}

/// Entry for each client in a share group
#[derive(Debug, Clone)]
struct ClientEntry {
    /// topic_filter -> subscription details
    subscriptions: HashMap<String, SharedSubscriptionDetails>,
    /// Counter representing when this client last received a message.
    /// Lower value = older = higher priority for next delivery.
    last_delivery_counter: u64,
}

/// A group of clients sharing the same share name
#[derive(Debug, Default)]
struct ShareGroup {
    clients: HashMap<ClientId, ClientEntry>,
}

/// A shared-subscription delivery target chosen for one publish.
#[derive(Debug, Clone)]
pub struct SharedDelivery {
    pub client_id: ClientId,
    pub topic_filter: String,
    pub details: SharedSubscriptionDetails,
}

/// Shared Subscription Manager
///
/// Manages `$share/{ShareName}/{filter}` subscriptions with LRU-based
/// round-robin at share-name level: for each group with a matching filter,
/// the member with the smallest last_delivery_counter receives the message.
/// Group selection is node-local.
#[derive(Debug, Default)]
pub struct SharedSubscriptionManager {
    /// share_name -> ShareGroup
    groups: HashMap<String, ShareGroup>,
    /// Logical timestamp incremented on each delivery, for LRU tracking
    global_counter: u64,
}

/// Split a `$share/{ShareName}/{filter}` subscription into share name and
/// plain filter. The share name must be non-empty and wildcard-free; the
/// remaining filter must be non-empty.
pub fn parse_share(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (share_name, topic_filter) = rest.split_once('/')?;
    if share_name.is_empty()
        || share_name.contains('+')
        || share_name.contains('#')
        || topic_filter.is_empty()
    {
        return None;
    }
    Some((share_name, topic_filter))
}

impl SharedSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription for a client. The filter is the plain part,
    /// without the `$share/{ShareName}/` prefix.
    pub fn insert(
        &mut self,
        share_name: &str,
        topic_filter: &str,
        client_id: &str,
        details: SharedSubscriptionDetails,
    ) {
        let group = self.groups.entry(share_name.to_string()).or_default();

        tracing::debug!(
            "shared subscription insert: share_name={share_name}, client_id={client_id}, topic_filter={topic_filter}"
        );

        if let Some(client_entry) = group.clients.get_mut(client_id) {
            client_entry
                .subscriptions
                .insert(topic_filter.to_string(), details);
        } else {
            let mut subscriptions = HashMap::new();
            subscriptions.insert(topic_filter.to_string(), details);
            group.clients.insert(
                client_id.to_string(),
                ClientEntry {
                    subscriptions,
                    last_delivery_counter: 0,
                },
            );
        }
    }

    /// Remove one member subscription. Returns true when it existed.
    pub fn remove(&mut self, share_name: &str, topic_filter: &str, client_id: &str) -> bool {
        let Some(group) = self.groups.get_mut(share_name) else {
            return false;
        };
        let Some(client_entry) = group.clients.get_mut(client_id) else {
            return false;
        };
        let removed = client_entry.subscriptions.remove(topic_filter).is_some();
        if client_entry.subscriptions.is_empty() {
            group.clients.remove(client_id);
        }
        if group.clients.is_empty() {
            self.groups.remove(share_name);
        }
        removed
    }

    /// Remove a client from every share group.
    pub fn remove_client(&mut self, client_id: &str) {
        self.groups.retain(|_, group| {
            group.clients.remove(client_id);
            !group.clients.is_empty()
        });
    }

    /// Every share-group membership a client holds, as
    /// (share_name, topic_filter, details) triples. Session snapshots
    /// persist these alongside the plain-trie subscriptions.
    pub fn client_memberships(
        &self,
        client_id: &str,
    ) -> Vec<(String, String, SharedSubscriptionDetails)> {
        let mut memberships = Vec::new();
        for (share_name, group) in &self.groups {
            if let Some(entry) = group.clients.get(client_id) {
                for (filter, details) in &entry.subscriptions {
                    memberships.push((share_name.clone(), filter.clone(), *details));
                }
            }
        }
        memberships
    }

    /// Whether a client holds the given shared subscription.
    pub fn is_member(&self, share_name: &str, topic_filter: &str, client_id: &str) -> bool {
        self.groups
            .get(share_name)
            .and_then(|group| group.clients.get(client_id))
            .is_some_and(|entry| entry.subscriptions.contains_key(topic_filter))
    }

    /// Pick one delivery target per share group whose filter matches the
    /// topic, bumping the chosen member's delivery counter.
    pub fn select(&mut self, topic: &str) -> Vec<SharedDelivery> {
        let mut deliveries = Vec::new();

        for group in self.groups.values_mut() {
            let mut best: Option<(&ClientId, &str, SharedSubscriptionDetails, u64)> = None;
            for (client_id, entry) in &group.clients {
                for (filter, details) in &entry.subscriptions {
                    if !topic_matches_filter(filter, topic) {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((_, _, _, counter)) => entry.last_delivery_counter < counter,
                    };
                    if better {
                        best = Some((
                            client_id,
                            filter.as_str(),
                            *details,
                            entry.last_delivery_counter,
                        ));
                    }
                }
            }

            if let Some((client_id, filter, details, _)) = best {
                deliveries.push(SharedDelivery {
                    client_id: client_id.clone(),
                    topic_filter: filter.to_string(),
                    details,
                });
            }
        }

        // Bump counters outside the borrow of the iteration above.
        for delivery in &deliveries {
            self.global_counter += 1;
            for group in self.groups.values_mut() {
                if let Some(entry) = group.clients.get_mut(&delivery.client_id) {
                    entry.last_delivery_counter = self.global_counter;
                }
            }
        }

        deliveries
    }
}
