//! Resolution of inserts that hit an existing key.

/// Outcome of merging a new value into an existing entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MergeResult<V> {
    /// Keep the stored value.
    Unchanged,
    /// Store this value instead.
    Replaced(V),
    /// Delete the entry.
    Removed,
}

/// Decides what happens when an inserted key already exists.
///
/// Closures with the same signature implement the trait.
pub trait ValueMerger<K, V> {
    /// Merges `new_value` into the entry currently holding `existing_value`.
    fn merge(&self, existing_key: &K, new_key: &K, existing_value: &V, new_value: &V)
        -> MergeResult<V>;
}

/// Replaces the stored value. The default for plain puts.
#[derive(Clone, Copy, Debug, Default)]
pub struct Overwrite;

impl<K, V: Clone> ValueMerger<K, V> for Overwrite {
    fn merge(&self, _: &K, _: &K, _: &V, new_value: &V) -> MergeResult<V> {
        MergeResult::Replaced(new_value.clone())
    }
}

/// Keeps whatever is stored.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepExisting;

impl<K, V> ValueMerger<K, V> for KeepExisting {
    fn merge(&self, _: &K, _: &K, _: &V, _: &V) -> MergeResult<V> {
        MergeResult::Unchanged
    }
}

impl<K, V, F> ValueMerger<K, V> for F
where
    F: Fn(&K, &K, &V, &V) -> MergeResult<V>,
{
    fn merge(&self, existing_key: &K, new_key: &K, existing_value: &V, new_value: &V)
        -> MergeResult<V> {
        self(existing_key, new_key, existing_value, new_value)
    }
}
