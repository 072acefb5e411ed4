// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::collections::HashMap;

use tracing::trace;

use crate::packet::SubscriptionOptions;

/// Simple error type for subscription operations
#[derive(Debug, Clone)]
pub enum SubscriptionError {
    InvalidTopicFilter,
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionError::InvalidTopicFilter => write!(f, "Invalid topic filter"),
        }
    }
}

impl std::error::Error for SubscriptionError {}

pub type ClientId = String;

/// A subscription matched against a published topic.
#[derive(Debug, Clone)]
pub struct MatchedSubscription {
    pub client_id: ClientId,
    pub topic_filter: String,
    pub options: SubscriptionOptions,
    pub sub_id: Option<u32>,
}

/// Subscription entry in trie node
#[derive(Debug, Clone)]
struct SubscriptionEntry {
    client_id: ClientId,
    topic_filter: String,
    options: SubscriptionOptions,
    sub_id: Option<u32>,
}

impl SubscriptionEntry {
    fn matched(&self) -> MatchedSubscription {
        MatchedSubscription {
            client_id: self.client_id.clone(),
            topic_filter: self.topic_filter.clone(),
            options: self.options,
            sub_id: self.sub_id,
        }
    }
}

/// Trie node containing subscription information
#[derive(Debug, Clone, Default)]
struct TrieNode {
    /// Subscriptions to this exact path
    exact_subscribers: Vec<SubscriptionEntry>,
    /// Subscriptions with single-level wildcard at this position
    single_wildcard_subscribers: Vec<SubscriptionEntry>,
    /// Subscriptions with multi-level wildcard from this position
    multi_wildcard_subscribers: Vec<SubscriptionEntry>,
    /// Child nodes for each segment
    children: HashMap<String, TrieNode>,
    /// Special child for single-level wildcard (+)
    wildcard_child: Option<Box<TrieNode>>,
}

/// Subscription store using a trie over `/`-separated topic segments.
///
/// Owned by the broker core; all access goes through `&mut self` on the one
/// broker thread.
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    root: TrieNode,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription for a client to a topic filter.
    /// Returns Ok(is_new) where is_new is true if this is a new subscription,
    /// false if updating an existing one.
    pub fn subscribe(
        &mut self,
        client_id: &str,
        topic_filter: &str,
        options: SubscriptionOptions,
        sub_id: Option<u32>,
    ) -> Result<bool, SubscriptionError> {
        Self::validate_topic_filter(topic_filter)?;

        let segments: Vec<&str> = topic_filter.split('/').collect();
        let is_new = Self::insert_subscription(
            &mut self.root,
            &segments,
            client_id,
            topic_filter,
            options,
            sub_id,
            0,
        );

        trace!(
            "Subscribed '{client_id}' to topic filter '{topic_filter}' with {options:?}, sub_id {sub_id:?}, is_new: {is_new}"
        );
        Ok(is_new)
    }

    /// Recursively insert subscription into trie
    fn insert_subscription(
        node: &mut TrieNode,
        segments: &[&str],
        client_id: &str,
        topic_filter: &str,
        options: SubscriptionOptions,
        sub_id: Option<u32>,
        depth: usize,
    ) -> bool {
        if depth >= segments.len() {
            // End of path - add to exact subscribers
            return Self::upsert_subscription(
                &mut node.exact_subscribers,
                client_id,
                topic_filter,
                options,
                sub_id,
            );
        }

        let segment = segments[depth];

        match segment {
            "#" => {
                // Multi-level wildcard - matches everything from this point
                Self::upsert_subscription(
                    &mut node.multi_wildcard_subscribers,
                    client_id,
                    topic_filter,
                    options,
                    sub_id,
                )
            }
            "+" => {
                let wildcard_child = node
                    .wildcard_child
                    .get_or_insert_with(|| Box::new(TrieNode::default()));
                if depth + 1 >= segments.len() {
                    // This is the last segment
                    Self::upsert_subscription(
                        &mut wildcard_child.single_wildcard_subscribers,
                        client_id,
                        topic_filter,
                        options,
                        sub_id,
                    )
                } else {
                    Self::insert_subscription(
                        wildcard_child,
                        segments,
                        client_id,
                        topic_filter,
                        options,
                        sub_id,
                        depth + 1,
                    )
                }
            }
            _ => {
                // Exact segment
                let child = node.children.entry(segment.to_string()).or_default();
                Self::insert_subscription(
                    child,
                    segments,
                    client_id,
                    topic_filter,
                    options,
                    sub_id,
                    depth + 1,
                )
            }
        }
    }

    /// Insert or update subscription entry (same client and filter overwrites)
    fn upsert_subscription(
        subscribers: &mut Vec<SubscriptionEntry>,
        client_id: &str,
        topic_filter: &str,
        options: SubscriptionOptions,
        sub_id: Option<u32>,
    ) -> bool {
        if let Some(existing) = subscribers
            .iter_mut()
            .find(|s| s.client_id == client_id && s.topic_filter == topic_filter)
        {
            existing.options = options;
            existing.sub_id = sub_id;
            false
        } else {
            subscribers.push(SubscriptionEntry {
                client_id: client_id.to_string(),
                topic_filter: topic_filter.to_string(),
                options,
                sub_id,
            });
            true
        }
    }

    /// Remove a subscription for a client from a topic filter
    pub fn unsubscribe(
        &mut self,
        client_id: &str,
        topic_filter: &str,
    ) -> Result<bool, SubscriptionError> {
        Self::validate_topic_filter(topic_filter)?;

        let segments: Vec<&str> = topic_filter.split('/').collect();
        Ok(Self::remove_subscription(
            &mut self.root,
            &segments,
            client_id,
            0,
        ))
    }

    /// Recursively remove subscription from trie
    fn remove_subscription(
        node: &mut TrieNode,
        segments: &[&str],
        client_id: &str,
        depth: usize,
    ) -> bool {
        if depth >= segments.len() {
            return Self::remove_from_vec(&mut node.exact_subscribers, client_id);
        }

        let segment = segments[depth];

        match segment {
            "#" => Self::remove_from_vec(&mut node.multi_wildcard_subscribers, client_id),
            "+" => {
                if let Some(ref mut wildcard_child) = node.wildcard_child {
                    if depth + 1 >= segments.len() {
                        Self::remove_from_vec(
                            &mut wildcard_child.single_wildcard_subscribers,
                            client_id,
                        )
                    } else {
                        Self::remove_subscription(wildcard_child, segments, client_id, depth + 1)
                    }
                } else {
                    false
                }
            }
            _ => {
                if let Some(child) = node.children.get_mut(segment) {
                    Self::remove_subscription(child, segments, client_id, depth + 1)
                } else {
                    false
                }
            }
        }
    }

    /// Remove client from subscription vector
    fn remove_from_vec(subscribers: &mut Vec<SubscriptionEntry>, client_id: &str) -> bool {
        if let Some(pos) = subscribers.iter().position(|s| s.client_id == client_id) {
            subscribers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&mut self, client_id: &str) {
        Self::remove_all_subscriptions(&mut self.root, client_id);
    }

    /// Recursively remove all subscriptions for a client
    fn remove_all_subscriptions(node: &mut TrieNode, client_id: &str) {
        node.exact_subscribers.retain(|s| s.client_id != client_id);
        node.single_wildcard_subscribers
            .retain(|s| s.client_id != client_id);
        node.multi_wildcard_subscribers
            .retain(|s| s.client_id != client_id);

        // Recursively clean children
        for child in node.children.values_mut() {
            Self::remove_all_subscriptions(child, client_id);
        }

        if let Some(ref mut wildcard_child) = node.wildcard_child {
            Self::remove_all_subscriptions(wildcard_child, client_id);
        }
    }

    /// Find all subscriptions matching a given published topic.
    ///
    /// Topics whose first segment begins with `$` are excluded from `#` and
    /// `+` at the root, so `#` never matches `$SYS/...`.
    pub fn find_subscribers(&self, topic: &str) -> Vec<MatchedSubscription> {
        let mut all_subscribers = Vec::new();
        let segments: Vec<&str> = topic.split('/').collect();
        let system_topic = topic.starts_with('$');

        Self::collect_subscribers(
            &self.root,
            &segments,
            0,
            system_topic,
            &mut all_subscribers,
        );

        all_subscribers
    }

    /// Recursively collect all matching subscribers
    fn collect_subscribers(
        node: &TrieNode,
        topic_segments: &[&str],
        depth: usize,
        system_topic: bool,
        subscribers: &mut Vec<MatchedSubscription>,
    ) {
        let skip_root_wildcards = system_topic && depth == 0;

        // Multi-level wildcards match everything from this point
        if !skip_root_wildcards {
            for entry in &node.multi_wildcard_subscribers {
                subscribers.push(entry.matched());
            }
        }

        if depth >= topic_segments.len() {
            // End of topic path - collect exact subscribers
            for entry in &node.exact_subscribers {
                subscribers.push(entry.matched());
            }
            return;
        }

        let current_segment = topic_segments[depth];

        // 1. Check exact match
        if let Some(child) = node.children.get(current_segment) {
            Self::collect_subscribers(child, topic_segments, depth + 1, system_topic, subscribers);
        }

        // 2. Check single-level wildcard match
        if !skip_root_wildcards {
            if let Some(ref wildcard_child) = node.wildcard_child {
                if depth + 1 >= topic_segments.len() {
                    // This is the last segment - collect single wildcard subscribers
                    for entry in &wildcard_child.single_wildcard_subscribers {
                        subscribers.push(entry.matched());
                    }
                } else {
                    // Continue to next level
                    Self::collect_subscribers(
                        wildcard_child,
                        topic_segments,
                        depth + 1,
                        system_topic,
                        subscribers,
                    );
                }
            }
        }
    }

    /// Check if a client is subscribed to a specific topic filter
    pub fn is_subscribed(&self, client_id: &str, topic_filter: &str) -> bool {
        let segments: Vec<&str> = topic_filter.split('/').collect();
        Self::check_subscription(&self.root, &segments, client_id, 0)
    }

    /// Recursively check if a subscription exists
    fn check_subscription(
        node: &TrieNode,
        segments: &[&str],
        client_id: &str,
        depth: usize,
    ) -> bool {
        if depth >= segments.len() {
            return node
                .exact_subscribers
                .iter()
                .any(|s| s.client_id == client_id);
        }

        let segment = segments[depth];

        match segment {
            "#" => node
                .multi_wildcard_subscribers
                .iter()
                .any(|s| s.client_id == client_id),
            "+" => {
                if let Some(ref wildcard_child) = node.wildcard_child {
                    if depth + 1 >= segments.len() {
                        wildcard_child
                            .single_wildcard_subscribers
                            .iter()
                            .any(|s| s.client_id == client_id)
                    } else {
                        Self::check_subscription(wildcard_child, segments, client_id, depth + 1)
                    }
                } else {
                    false
                }
            }
            _ => {
                if let Some(child) = node.children.get(segment) {
                    Self::check_subscription(child, segments, client_id, depth + 1)
                } else {
                    false
                }
            }
        }
    }

    /// All subscriptions held by a client (session resumption, snapshots)
    pub fn client_subscriptions(&self, client_id: &str) -> Vec<MatchedSubscription> {
        let mut subscriptions = Vec::new();
        Self::collect_client_subscriptions(&self.root, client_id, &mut subscriptions);
        subscriptions
    }

    fn collect_client_subscriptions(
        node: &TrieNode,
        client_id: &str,
        subscriptions: &mut Vec<MatchedSubscription>,
    ) {
        for entry in node
            .exact_subscribers
            .iter()
            .chain(&node.single_wildcard_subscribers)
            .chain(&node.multi_wildcard_subscribers)
        {
            if entry.client_id == client_id {
                subscriptions.push(entry.matched());
            }
        }

        for child in node.children.values() {
            Self::collect_client_subscriptions(child, client_id, subscriptions);
        }
        if let Some(ref wildcard_child) = node.wildcard_child {
            Self::collect_client_subscriptions(wildcard_child, client_id, subscriptions);
        }
    }

    /// Every distinct filter anybody is subscribed to (cluster replay)
    pub fn all_filters(&self) -> Vec<String> {
        let mut filters = Vec::new();
        Self::collect_filters(&self.root, &mut filters);
        filters.sort();
        filters.dedup();
        filters
    }

    fn collect_filters(node: &TrieNode, filters: &mut Vec<String>) {
        for entry in node
            .exact_subscribers
            .iter()
            .chain(&node.single_wildcard_subscribers)
            .chain(&node.multi_wildcard_subscribers)
        {
            filters.push(entry.topic_filter.clone());
        }
        for child in node.children.values() {
            Self::collect_filters(child, filters);
        }
        if let Some(ref wildcard_child) = node.wildcard_child {
            Self::collect_filters(wildcard_child, filters);
        }
    }

    /// Validate MQTT topic filter according to spec
    pub fn validate_topic_filter(topic_filter: &str) -> Result<(), SubscriptionError> {
        if topic_filter.is_empty() || topic_filter.contains('\0') {
            return Err(SubscriptionError::InvalidTopicFilter);
        }

        let count = topic_filter.split('/').count();
        for (i, segment) in topic_filter.split('/').enumerate() {
            // Check for multi-level wildcard
            if segment == "#" {
                // # must be the last segment
                if i != count - 1 {
                    return Err(SubscriptionError::InvalidTopicFilter);
                }
            }
            // Check for single-level wildcard
            else if segment == "+" {
                // + is valid as a complete segment
            }
            // Check for invalid wildcard usage
            else if segment.contains('+') || segment.contains('#') {
                return Err(SubscriptionError::InvalidTopicFilter);
            }
        }

        Ok(())
    }
}

/// MQTT topic filter matching for filters kept outside the trie
/// (shared-subscription groups, cluster peer interest).
pub fn topic_matches_filter(filter: &str, topic: &str) -> bool {
    // Wildcards at the root never match $-prefixed topics.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (Some(_), Some(_)) => return false,
            // `sport/#` matches `sport`: `#` also covers the empty suffix.
            (Some(f), None) => return f == "#" && filter_segments.next().is_none(),
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}
