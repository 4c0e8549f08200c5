use std::marker::PhantomData;

use crate::primitives::concurrency::WriterSession;
use crate::types::Result;

use super::super::codecs::{encode_key, encode_val, KeyCodec, ValCodec};
use super::super::merger::{MergeResult, Overwrite, ValueMerger};
use super::mutation::{HitAction, LeafOp, Mutation};
use super::types::TreeCore;

/// The single mutation session of a tree.
///
/// Only one writer exists at a time; checkpoints wait until it is closed or
/// dropped. Changes are visible to new seeks immediately and become durable
/// at the next checkpoint.
pub struct Writer<'t, K: KeyCodec, V: ValCodec> {
    core: &'t TreeCore,
    _session: WriterSession<'t>,
    split_ratio: f64,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'t, K: KeyCodec, V: ValCodec> Writer<'t, K, V> {
    pub(crate) fn new(core: &'t TreeCore, session: WriterSession<'t>, split_ratio: f64) -> Self {
        Self {
            core,
            _session: session,
            split_ratio,
            _marker: PhantomData,
        }
    }

    /// Inserts `value` under `key`, replacing any stored value.
    pub fn put(&mut self, key: &K, value: &V) -> Result<()>
    where
        V: Clone,
    {
        self.put_with(key, value, &Overwrite)
    }

    /// Inserts `value` under `key`; when the key exists `merger` decides
    /// whether the stored value is kept, replaced, or removed.
    pub fn put_with<M>(&mut self, key: &K, value: &V, merger: &M) -> Result<()>
    where
        M: ValueMerger<K, V> + ?Sized,
    {
        let key_bytes = encode_key(key);
        let value_bytes = encode_val(value);
        self.core.codec.check_entry_size(&key_bytes, &value_bytes)?;
        let mut on_hit = |stored_key: &[u8], stored_value: &[u8]| -> Result<HitAction> {
            let existing_key = K::decode_key(stored_key)?;
            let existing_value = V::decode_val(stored_value)?;
            Ok(match merger.merge(&existing_key, key, &existing_value, value) {
                MergeResult::Unchanged => HitAction::Keep,
                MergeResult::Replaced(merged) => HitAction::Replace(encode_val(&merged)),
                MergeResult::Removed => HitAction::Remove,
            })
        };
        let mut op = LeafOp::Put {
            value: &value_bytes,
            on_hit: &mut on_hit,
        };
        self.apply(&key_bytes, &mut op)?;
        Ok(())
    }

    /// Removes `key`, returning the value it held.
    pub fn remove(&mut self, key: &K) -> Result<Option<V>> {
        let key_bytes = encode_key(key);
        let removed = self.apply(&key_bytes, &mut LeafOp::Remove)?;
        removed.map(|bytes| V::decode_val(&bytes)).transpose()
    }

    /// Split ratio this writer uses when a node overflows.
    pub fn split_ratio(&self) -> f64 {
        self.split_ratio
    }

    /// Ends the session, letting checkpoints proceed.
    pub fn close(self) {}

    fn apply(&mut self, key: &[u8], op: &mut LeafOp<'_>) -> Result<Option<Vec<u8>>> {
        self.core.ensure_open()?;
        let mut m = self.core.mutable.lock();
        let gens = self.core.generations();
        let mut mutation = Mutation::new(self.core, &mut m.free, gens, self.split_ratio);
        let outcome = mutation.apply(key, op);
        if mutation.touched() {
            m.changed = true;
        }
        outcome
    }
}
