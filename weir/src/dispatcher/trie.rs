// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Subscription trie with per-node retained messages.

use codec::{PublishPacket, QoS};
use std::collections::HashMap;

use codec::topic::{LEVEL_SEPARATOR, MULTI_WILDCARD, SINGLE_WILDCARD};

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Granted QoS per subscribed client id.
    subscribers: HashMap<String, QoS>,
    retained: Option<PublishPacket>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty() && self.retained.is_none()
    }
}

/// Topic filters are stored one trie node per level; a concrete topic is
/// matched by walking literal, `+` and `#` children in parallel.
///
/// Topics whose first level begins with `$` are only matched by filters that
/// share that first level literally, never by `+` or `#` at the root.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default)]
pub struct SubTrie {
    root: TrieNode,
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a subscription; a duplicate filter of the same
    /// client overwrites the granted QoS.
    pub fn subscribe(&mut self, client_id: &str, filter: &str, qos: QoS) {
        let mut node = &mut self.root;
        for level in filter.split(LEVEL_SEPARATOR) {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.subscribers.insert(client_id.to_string(), qos);
    }

    /// Remove a subscription, pruning nodes left empty. Idempotent.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) -> bool {
        fn walk(node: &mut TrieNode, levels: &[&str], client_id: &str) -> bool {
            let Some((level, rest)) = levels.split_first() else {
                return node.subscribers.remove(client_id).is_some();
            };
            let Some(child) = node.children.get_mut(*level) else {
                return false;
            };
            let removed = walk(child, rest, client_id);
            if removed && child.is_empty() {
                node.children.remove(*level);
            }
            removed
        }

        let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
        walk(&mut self.root, &levels, client_id)
    }

    /// Collect subscribers whose filter matches the concrete `topic`.
    ///
    /// A client matching through several filters appears once, at the
    /// highest granted QoS among its matches.
    #[must_use]
    pub fn matches(&self, topic: &str) -> Vec<(String, QoS)> {
        let levels: Vec<&str> = topic.split(LEVEL_SEPARATOR).collect();
        let internal = topic.starts_with('$');
        let mut acc: HashMap<String, QoS> = HashMap::new();
        Self::collect(&self.root, &levels, true, internal, &mut acc);
        acc.into_iter().collect()
    }

    fn collect(
        node: &TrieNode,
        levels: &[&str],
        at_root: bool,
        internal: bool,
        acc: &mut HashMap<String, QoS>,
    ) {
        let Some((level, rest)) = levels.split_first() else {
            Self::merge(&node.subscribers, acc);
            // "a/b" also matches the filter "a/b/#".
            if let Some(hash) = node.children.get(MULTI_WILDCARD) {
                Self::merge(&hash.subscribers, acc);
            }
            return;
        };

        // Wildcards at the root never match `$`-prefixed topics.
        if !(at_root && internal) {
            if let Some(hash) = node.children.get(MULTI_WILDCARD) {
                Self::merge(&hash.subscribers, acc);
            }
            if let Some(plus) = node.children.get(SINGLE_WILDCARD) {
                Self::collect(plus, rest, false, internal, acc);
            }
        }
        if let Some(child) = node.children.get(*level) {
            Self::collect(child, rest, false, internal, acc);
        }
    }

    fn merge(subscribers: &HashMap<String, QoS>, acc: &mut HashMap<String, QoS>) {
        for (client_id, qos) in subscribers {
            acc.entry(client_id.clone())
                .and_modify(|granted| {
                    if qos > granted {
                        *granted = *qos;
                    }
                })
                .or_insert(*qos);
        }
    }

    /// Store `packet` as the retained message of its topic; an empty payload
    /// clears the slot.
    pub fn retain(&mut self, packet: &PublishPacket) {
        fn walk(node: &mut TrieNode, levels: &[&str], packet: &PublishPacket) {
            let Some((level, rest)) = levels.split_first() else {
                if packet.message().is_empty() {
                    node.retained = None;
                } else {
                    node.retained = Some(packet.clone());
                }
                return;
            };
            if packet.message().is_empty() {
                // Clearing must not create nodes; prune on the way out.
                if let Some(child) = node.children.get_mut(*level) {
                    walk(child, rest, packet);
                    if child.is_empty() {
                        node.children.remove(*level);
                    }
                }
            } else {
                let child = node.children.entry((*level).to_string()).or_default();
                walk(child, rest, packet);
            }
        }

        let levels: Vec<&str> = packet.topic().split(LEVEL_SEPARATOR).collect();
        walk(&mut self.root, &levels, packet);
    }

    /// Collect retained messages on topics matched by a new subscription's
    /// `filter`, for delivery after the SubscribeAck.
    #[must_use]
    pub fn retained_matches(&self, filter: &str) -> Vec<PublishPacket> {
        let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
        let mut acc = Vec::new();
        Self::collect_retained(&self.root, &levels, true, &mut acc);
        acc
    }

    fn collect_retained(
        node: &TrieNode,
        levels: &[&str],
        at_root: bool,
        acc: &mut Vec<PublishPacket>,
    ) {
        let Some((level, rest)) = levels.split_first() else {
            if let Some(packet) = &node.retained {
                acc.push(packet.clone());
            }
            return;
        };

        match *level {
            // `#` stands for zero or more levels, including the parent level
            // itself.
            MULTI_WILDCARD => Self::collect_subtree_retained(node, at_root, acc),
            SINGLE_WILDCARD => {
                for (key, child) in &node.children {
                    if at_root && key.starts_with('$') {
                        continue;
                    }
                    Self::collect_retained(child, rest, false, acc);
                }
            }
            _ => {
                if let Some(child) = node.children.get(*level) {
                    Self::collect_retained(child, rest, false, acc);
                }
            }
        }
    }

    fn collect_subtree_retained(node: &TrieNode, skip_internal: bool, acc: &mut Vec<PublishPacket>) {
        if let Some(packet) = &node.retained {
            acc.push(packet.clone());
        }
        for (key, child) in &node.children {
            if skip_internal && key.starts_with('$') {
                continue;
            }
            Self::collect_subtree_retained(child, false, acc);
        }
    }
}
