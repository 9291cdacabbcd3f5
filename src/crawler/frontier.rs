//! Crawl frontier for a single run
//!
//! The frontier is a priority queue ordered by depth, so the crawl proceeds
//! breadth-first from the root, and by discovery order within one depth.
//! Every URL is normalized before it is queued and is queued at most once.

use crate::url::{normalize_parsed, same_host, UrlScope};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use url::Url;

/// A URL waiting to be fetched
#[derive(Debug, Clone)]
pub struct QueuedUrl {
    pub url: Url,
    /// Link distance from the root
    pub depth: u32,
    sequence: u64,
}

// BinaryHeap is a max-heap: invert so the shallowest, oldest entry pops first
impl Ord for QueuedUrl {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .depth
            .cmp(&self.depth)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedUrl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedUrl {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.sequence == other.sequence
    }
}

impl Eq for QueuedUrl {}

pub struct Frontier {
    root: Url,
    scope: UrlScope,
    max_depth: u32,
    queue: BinaryHeap<QueuedUrl>,
    /// Normalized URLs ever queued in this run
    offered: HashSet<String>,
    next_sequence: u64,
}

impl Frontier {
    /// Creates a frontier seeded with `root` at depth 0
    ///
    /// The root is queued even when the include patterns do not match it.
    pub fn new(root: Url, scope: UrlScope, max_depth: u32) -> Self {
        let mut frontier = Self {
            root: root.clone(),
            scope,
            max_depth,
            queue: BinaryHeap::new(),
            offered: HashSet::new(),
            next_sequence: 0,
        };
        frontier.push(root, 0);
        frontier
    }

    /// Queues a discovered link
    ///
    /// # Returns
    ///
    /// `true` if the link was queued; `false` if it is off-site, out of
    /// scope, too deep, unparseable, or already seen
    pub fn offer(&mut self, url: &Url, depth: u32) -> bool {
        if depth > self.max_depth {
            return false;
        }
        let Ok(normalized) = normalize_parsed(url.clone()) else {
            return false;
        };
        if !self.in_scope(&normalized) || self.offered.contains(normalized.as_str()) {
            return false;
        }
        self.push(normalized, depth);
        true
    }

    /// Same host as the root and admitted by the include/exclude patterns
    pub fn in_scope(&self, url: &Url) -> bool {
        same_host(&self.root, url) && self.scope.allows(url)
    }

    pub fn pop(&mut self) -> Option<QueuedUrl> {
        self.queue.pop()
    }

    pub fn was_offered(&self, url: &str) -> bool {
        self.offered.contains(url)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn push(&mut self, url: Url, depth: u32) {
        self.offered.insert(url.as_str().to_string());
        self.queue.push(QueuedUrl {
            url,
            depth,
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
    }
}
