//! Identity-keyed deduplication
//!
//! First occurrence wins; later duplicates are dropped silently. Pure and
//! synchronous.

use crate::legislation::SecondaryResult;
use crate::retrieval::PrimaryResult;
use std::collections::HashSet;
use std::hash::Hash;

/// Entity with a canonical identity key
pub trait Identified {
    type Key: Eq + Hash + Clone;

    fn identity(&self) -> Self::Key;
}

impl Identified for PrimaryResult {
    type Key = (i64, i64);

    fn identity(&self) -> Self::Key {
        self.key()
    }
}

impl Identified for SecondaryResult {
    type Key = String;

    /// Different section rows may share a URL; the URL is canonical.
    fn identity(&self) -> Self::Key {
        self.url.clone()
    }
}

/// Incremental record of identities already admitted
#[derive(Debug)]
pub struct SeenSet<T: Identified> {
    seen: HashSet<T::Key>,
}

impl<T: Identified> Default for SeenSet<T> {
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
        }
    }
}

impl<T: Identified> SeenSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time an identity is offered
    pub fn admit(&mut self, item: &T) -> bool {
        self.seen.insert(item.identity())
    }

    pub fn contains(&self, item: &T) -> bool {
        self.seen.contains(&item.identity())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Merge batches in iteration order, keeping the first item per identity
pub fn merge_batches<T, I>(batches: I) -> Vec<T>
where
    T: Identified,
    I: IntoIterator<Item = Vec<T>>,
{
    let mut seen = SeenSet::new();
    batches
        .into_iter()
        .flatten()
        .filter(|item| seen.admit(item))
        .collect()
}
