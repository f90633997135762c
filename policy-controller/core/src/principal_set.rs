use std::collections::{btree_set, BTreeSet};

/// A deduplicated set of principals that always iterates in ascending lexicographic order,
/// independent of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PrincipalSet(BTreeSet<String>);

// === impl PrincipalSet ===

impl PrincipalSet {
    /// Adds a principal. Returns `false` if it was already present.
    pub fn insert(&mut self, principal: impl Into<String>) -> bool {
        self.0.insert(principal.into())
    }

    pub fn contains(&self, principal: &str) -> bool {
        self.0.contains(principal)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Returns the principals as a sorted, duplicate-free sequence.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for PrincipalSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>> Extend<S> for PrincipalSet {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        self.0.extend(iter.into_iter().map(Into::into))
    }
}

impl IntoIterator for PrincipalSet {
    type Item = String;
    type IntoIter = btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<PrincipalSet> for Vec<String> {
    fn from(set: PrincipalSet) -> Self {
        set.0.into_iter().collect()
    }
}
