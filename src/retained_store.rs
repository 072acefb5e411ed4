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
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::packet::property::Property;
use crate::packet::Qos;

/// Retained message information
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic_name: String,
    pub qos: Qos,
    pub payload: Bytes,
    pub properties: Vec<Property>,
    /// Time when message was stored
    pub stored_at: Instant,
    /// Absolute deadline derived from MessageExpiryInterval, if present
    pub expires_at: Option<Instant>,
}

/// Trie node for retained messages (simpler than subscription trie)
#[derive(Debug, Default)]
struct RetainedTrieNode {
    /// Retained message at this exact topic name (if any)
    message: Option<RetainedMessage>,
    /// Child nodes for each segment
    children: HashMap<String, RetainedTrieNode>,
}

/// Retained message store using a trie keyed by topic segments. Expiry is
/// deadline-based: expired entries are skipped on read and pruned by the
/// cleanup tick.
#[derive(Debug, Default)]
pub struct RetainedStore {
    root: RetainedTrieNode,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a retained message for a topic name, replacing any existing one.
    pub fn store(
        &mut self,
        topic_name: &str,
        qos: Qos,
        payload: Bytes,
        properties: Vec<Property>,
        now: Instant,
    ) {
        let message_expiry_interval = properties.iter().find_map(|prop| match prop {
            Property::MessageExpiryInterval(secs) => Some(*secs),
            _ => None,
        });
        let expires_at =
            message_expiry_interval.map(|secs| now + Duration::from_secs(u64::from(secs)));

        let segments: Vec<&str> = topic_name.split('/').collect();
        let node = Self::get_or_create_node(&mut self.root, &segments, 0);
        node.message = Some(RetainedMessage {
            topic_name: topic_name.to_string(),
            qos,
            payload,
            properties,
            stored_at: now,
            expires_at,
        });
        trace!("Stored retained message for topic '{topic_name}'");
    }

    fn get_or_create_node<'a>(
        node: &'a mut RetainedTrieNode,
        segments: &[&str],
        depth: usize,
    ) -> &'a mut RetainedTrieNode {
        if depth >= segments.len() {
            return node;
        }
        let child = node
            .children
            .entry(segments[depth].to_string())
            .or_default();
        Self::get_or_create_node(child, segments, depth + 1)
    }

    /// Remove the retained message for a topic name. Returns true when an
    /// entry existed.
    pub fn remove(&mut self, topic_name: &str) -> bool {
        let segments: Vec<&str> = topic_name.split('/').collect();
        if let Some(node) = Self::find_node_mut(&mut self.root, &segments, 0) {
            let existed = node.message.take().is_some();
            if existed {
                trace!("Removed retained message for topic '{topic_name}'");
            }
            existed
        } else {
            false
        }
    }

    fn find_node_mut<'a>(
        node: &'a mut RetainedTrieNode,
        segments: &[&str],
        depth: usize,
    ) -> Option<&'a mut RetainedTrieNode> {
        if depth >= segments.len() {
            return Some(node);
        }
        let child = node.children.get_mut(segments[depth])?;
        Self::find_node_mut(child, segments, depth + 1)
    }

    /// Collect retained messages matching a topic filter (wildcards allowed).
    /// Expired entries are skipped. Wildcards at the root do not match
    /// `$`-prefixed topic names.
    pub fn get_matching(&self, topic_filter: &str, now: Instant) -> Vec<&RetainedMessage> {
        let segments: Vec<&str> = topic_filter.split('/').collect();
        let mut messages = Vec::new();
        Self::collect_matching(&self.root, &segments, 0, now, &mut messages);
        messages
    }

    fn collect_matching<'a>(
        node: &'a RetainedTrieNode,
        filter_segments: &[&str],
        depth: usize,
        now: Instant,
        messages: &mut Vec<&'a RetainedMessage>,
    ) {
        if depth >= filter_segments.len() {
            if let Some(ref message) = node.message {
                if !Self::expired(message, now) {
                    messages.push(message);
                }
            }
            return;
        }

        match filter_segments[depth] {
            "#" => {
                Self::collect_subtree(node, depth == 0, now, messages);
            }
            "+" => {
                for (segment, child) in &node.children {
                    if depth == 0 && segment.starts_with('$') {
                        continue;
                    }
                    Self::collect_matching(child, filter_segments, depth + 1, now, messages);
                }
            }
            segment => {
                if let Some(child) = node.children.get(segment) {
                    Self::collect_matching(child, filter_segments, depth + 1, now, messages);
                }
            }
        }
    }

    /// Collect every message at or below this node. `at_root` keeps `#` from
    /// sweeping up `$`-prefixed topic names.
    fn collect_subtree<'a>(
        node: &'a RetainedTrieNode,
        at_root: bool,
        now: Instant,
        messages: &mut Vec<&'a RetainedMessage>,
    ) {
        if let Some(ref message) = node.message {
            if !Self::expired(message, now) {
                messages.push(message);
            }
        }
        for (segment, child) in &node.children {
            if at_root && segment.starts_with('$') {
                continue;
            }
            Self::collect_subtree(child, false, now, messages);
        }
    }

    fn expired(message: &RetainedMessage, now: Instant) -> bool {
        message.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Drop expired entries and prune empty branches. Called from the
    /// cleanup tick.
    pub fn prune_expired(&mut self, now: Instant) {
        Self::prune_node(&mut self.root, now);
    }

    fn prune_node(node: &mut RetainedTrieNode, now: Instant) {
        if let Some(message) = node.message.as_ref() {
            if Self::expired(message, now) {
                trace!("Expired retained message for topic '{}'", message.topic_name);
                node.message = None;
            }
        }
        for child in node.children.values_mut() {
            Self::prune_node(child, now);
        }
        node.children
            .retain(|_, child| child.message.is_some() || !child.children.is_empty());
    }
}
