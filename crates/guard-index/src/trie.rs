//! Reverse-label trie. `ads.example.com` is stored along the path
//! `com -> example -> ads`; wildcard rules set the wildcard bit on the node
//! of their base name.

use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<Box<str>, u32>,
    end: bool,
    wildcard: bool,
    end_tag: Option<Arc<str>>,
    wildcard_tag: Option<Arc<str>>,
}

#[derive(Debug)]
pub struct DomainTrie {
    nodes: Vec<TrieNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrieMatch {
    Exact(Option<Arc<str>>),
    Wildcard(Option<Arc<str>>),
    None,
}

impl Default for DomainTrie {
    fn default() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }
}

impl DomainTrie {
    pub fn insert(&mut self, name: &str, wildcard: bool, tag: Option<Arc<str>>) {
        let mut node = 0_usize;
        for label in name.split('.').rev() {
            node = self.child_or_insert(node, label);
        }

        let entry = &mut self.nodes[node];
        if wildcard {
            entry.wildcard = true;
            if entry.wildcard_tag.is_none() {
                entry.wildcard_tag = tag;
            }
        } else {
            entry.end = true;
            if entry.end_tag.is_none() {
                entry.end_tag = tag;
            }
        }
    }

    fn child_or_insert(&mut self, parent: usize, label: &str) -> usize {
        if let Some(&child) = self.nodes[parent].children.get(label) {
            return child as usize;
        }
        let child = self.nodes.len() as u32;
        self.nodes.push(TrieNode::default());
        self.nodes[parent]
            .children
            .insert(Box::from(label), child);
        child as usize
    }

    /// Walks the labels of `name` in reverse. The deepest ancestor carrying
    /// the wildcard bit (with at least one label still to consume) is
    /// remembered; an exact terminal match wins over it.
    pub fn lookup(&self, name: &str) -> TrieMatch {
        let labels: Vec<&str> = name.split('.').collect();
        let mut node = 0_usize;
        let mut wildcard_hit: Option<Option<Arc<str>>> = None;

        for (depth, label) in labels.iter().rev().enumerate() {
            let remaining = labels.len() - depth;
            let entry = &self.nodes[node];
            // `*.base` requires a strict subdomain: at least one label below.
            if entry.wildcard && remaining >= 1 && depth > 0 {
                wildcard_hit = Some(entry.wildcard_tag.clone());
            }
            match entry.children.get(*label) {
                Some(&child) => node = child as usize,
                None => {
                    return match wildcard_hit {
                        Some(tag) => TrieMatch::Wildcard(tag),
                        None => TrieMatch::None,
                    }
                }
            }
        }

        let entry = &self.nodes[node];
        if entry.end {
            return TrieMatch::Exact(entry.end_tag.clone());
        }
        match wildcard_hit {
            Some(tag) => TrieMatch::Wildcard(tag),
            None => TrieMatch::None,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
