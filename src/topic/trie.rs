//! Filter trie for subscription matching
//!
//! A prefix tree keyed by topic levels, supporting the `+` and `#`
//! wildcards. Values live at filter terminals; matching a topic visits every
//! value whose filter covers it.
//!
//! Topics whose first level starts with `$` are shielded from wildcards at
//! the root, so `#` and `+/...` never observe `$SYS` traffic.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct Node<V> {
    /// Value for a filter terminating at this level
    value: Option<V>,
    /// Literal next levels (CompactString keeps short levels inline)
    children: AHashMap<CompactString, Node<V>>,
    /// Subtree behind a `+` at this position
    plus: Option<Box<Node<V>>>,
    /// Value for a filter ending in `#` at this position
    hash: Option<V>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::with_capacity(4),
            plus: None,
            hash: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.hash.is_none()
            && self.plus.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wildcard-aware filter trie.
///
/// Branches emptied by removals are pruned so long-lived brokers with high
/// subscribe/unsubscribe churn do not accumulate dead nodes.
#[derive(Debug)]
pub struct FilterTrie<V> {
    root: Node<V>,
    len: usize,
}

impl<V> FilterTrie<V> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Number of filters currently holding a value
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value at a filter, returning the displaced value if the
    /// filter was already present.
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            // Validation guarantees `#` only terminates a filter
            if level == "#" {
                let displaced = node.hash.replace(value);
                if displaced.is_none() {
                    self.len += 1;
                }
                return displaced;
            }

            node = if level == "+" {
                node.plus.get_or_insert_with(|| Box::new(Node::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                let displaced = node.value.replace(value);
                if displaced.is_none() {
                    self.len += 1;
                }
                return displaced;
            }
        }

        None
    }

    /// Mutable access to the value stored at an exact filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                return node.hash.as_mut();
            }

            node = if level == "+" {
                node.plus.as_deref_mut()?
            } else {
                node.children.get_mut(level)?
            };

            if levels.peek().is_none() {
                return node.value.as_mut();
            }
        }

        None
    }

    /// Remove the value at an exact filter, pruning emptied branches
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let removed = Self::remove_at(&mut self.root, &levels);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_at(node: &mut Node<V>, levels: &[&str]) -> Option<V> {
        match levels.split_first() {
            None => node.value.take(),
            Some((&"#", _)) => node.hash.take(),
            Some((&"+", rest)) => {
                let child = node.plus.as_deref_mut()?;
                let removed = if rest.is_empty() {
                    child.value.take()
                } else {
                    Self::remove_at(child, rest)
                };
                if removed.is_some() && child.is_empty() {
                    node.plus = None;
                }
                removed
            }
            Some((level, rest)) => {
                let child = node.children.get_mut(*level)?;
                let removed = if rest.is_empty() {
                    child.value.take()
                } else {
                    Self::remove_at(child, rest)
                };
                if removed.is_some() && child.is_empty() {
                    node.children.remove(*level);
                }
                removed
            }
        }
    }

    /// Keep only values for which the predicate returns true, pruning
    /// emptied branches.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        let removed = Self::retain_at(&mut self.root, &mut keep);
        self.len -= removed;
    }

    fn retain_at<F>(node: &mut Node<V>, keep: &mut F) -> usize
    where
        F: FnMut(&mut V) -> bool,
    {
        let mut removed = 0;

        if let Some(v) = node.value.as_mut() {
            if !keep(v) {
                node.value = None;
                removed += 1;
            }
        }
        if let Some(v) = node.hash.as_mut() {
            if !keep(v) {
                node.hash = None;
                removed += 1;
            }
        }
        if let Some(child) = node.plus.as_deref_mut() {
            removed += Self::retain_at(child, keep);
            if child.is_empty() {
                node.plus = None;
            }
        }
        node.children.retain(|_, child| {
            removed += Self::retain_at(child, keep);
            !child.is_empty()
        });

        removed
    }

    /// Visit every value whose filter matches the topic
    pub fn matches<F>(&self, topic: &str, mut visit: F)
    where
        F: FnMut(&V),
    {
        let shielded = topic.starts_with('$');
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::walk(&self.root, &levels, 0, shielded, &mut visit);
    }

    fn walk<F>(node: &Node<V>, levels: &[&str], depth: usize, shielded: bool, visit: &mut F)
    where
        F: FnMut(&V),
    {
        let wildcards_apply = !(shielded && depth == 0);

        if wildcards_apply {
            // `#` also covers its parent level, so this fires even when the
            // topic ends here
            if let Some(v) = &node.hash {
                visit(v);
            }
            if depth < levels.len() {
                if let Some(child) = &node.plus {
                    Self::walk(child, levels, depth + 1, shielded, visit);
                }
            }
        }

        if depth == levels.len() {
            if let Some(v) = &node.value {
                visit(v);
            }
            return;
        }

        if let Some(child) = node.children.get(levels[depth]) {
            Self::walk(child, levels, depth + 1, shielded, visit);
        }
    }
}

impl<V> Default for FilterTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
