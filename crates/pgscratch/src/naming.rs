//! Scratch database names.

use std::collections::HashSet;

/// Hands out `<prefix>1`, `<prefix>2`, ... for one cluster.
///
/// Names already present in the catalog when the allocator was created are
/// leftovers from an earlier run; [`NameAllocator::next`] flags them so the
/// caller can drop the stale database before reusing the name.
#[derive(Debug, Clone)]
pub(crate) struct NameAllocator {
    prefix: String,
    counter: u64,
    leftovers: HashSet<String>,
}

/// A freshly allocated name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Allocated {
    pub name: String,
    pub stale: bool,
}

impl NameAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
            leftovers: HashSet::new(),
        }
    }

    /// Records catalog names; only those carrying the prefix are kept.
    pub fn with_existing<I, S>(mut self, existing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let owned: Vec<String> = existing
            .into_iter()
            .map(Into::into)
            .filter(|name| self.owns(name))
            .collect();
        self.leftovers.extend(owned);
        self
    }

    pub fn next(&mut self) -> Allocated {
        self.counter += 1;
        let name = format!("{}{}", self.prefix, self.counter);
        let stale = self.leftovers.remove(&name);
        Allocated { name, stale }
    }

    /// Whether `name` looks like one of ours.
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(self.prefix.as_str())
            .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn forget(&mut self, name: &str) {
        self.leftovers.remove(name);
    }
}
