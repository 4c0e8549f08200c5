//! Lock-free ordered range scans.
//!
//! A [`SeekCursor`] never takes a lock the writer could wait on. It copies
//! pages through a [`PageCursor`], validates what it read against page
//! versions and sibling back pointers, and starts over from the root (after
//! the last key it returned) whenever the tree moved underneath it.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Bound;

use crate::primitives::pager::PageCursor;
use crate::types::{GbpTreeError, PageId, Result};

use super::codecs::{encode_key, KeyCodec, ValCodec};
use super::gspp::{Generations, Pointer, PointerFault};
use super::node::{LeafEntry, NodeCodec};
use super::page::{self, Link};
use super::tree::TreeCore;

/// Successor hops allowed during one descent.
const TRIP_LIMIT: u32 = 1_000;
/// Consecutive restarts from the root before the scan gives up.
const RESEEK_LIMIT: u32 = 10_000;
/// Re-reads of a crashed child pointer before it is treated as damage.
const CRASHED_CHILD_LIMIT: u32 = 100;

#[derive(Clone, Debug)]
enum EncodedBound {
    Unbounded,
    Included(Vec<u8>),
    Excluded(Vec<u8>),
}

impl EncodedBound {
    fn from_bound<K: KeyCodec>(bound: Bound<&K>) -> Self {
        match bound {
            Bound::Unbounded => EncodedBound::Unbounded,
            Bound::Included(key) => EncodedBound::Included(encode_key(key)),
            Bound::Excluded(key) => EncodedBound::Excluded(encode_key(key)),
        }
    }

    fn key_bytes(&self) -> Option<&[u8]> {
        match self {
            EncodedBound::Unbounded => None,
            EncodedBound::Included(bytes) | EncodedBound::Excluded(bytes) => Some(bytes.as_slice()),
        }
    }

    /// Whether `key` lies on the near side of a start bound, given the scan
    /// direction.
    fn start_allows<K: KeyCodec>(&self, key: &[u8], descending: bool) -> bool {
        let toward = if descending {
            Ordering::Less
        } else {
            Ordering::Greater
        };
        match self {
            EncodedBound::Unbounded => true,
            EncodedBound::Included(bound) => {
                let ord = K::compare_encoded(key, bound);
                ord == toward || ord == Ordering::Equal
            }
            EncodedBound::Excluded(bound) => K::compare_encoded(key, bound) == toward,
        }
    }

    /// Whether `key` lies beyond an end bound, given the scan direction.
    fn is_past_end<K: KeyCodec>(&self, key: &[u8], descending: bool) -> bool {
        let beyond = if descending {
            Ordering::Less
        } else {
            Ordering::Greater
        };
        match self {
            EncodedBound::Unbounded => false,
            EncodedBound::Included(bound) => K::compare_encoded(key, bound) == beyond,
            EncodedBound::Excluded(bound) => K::compare_encoded(key, bound) != beyond.reverse(),
        }
    }

    /// Equal bounds select nothing unless both include the key.
    fn range_is_empty<K: KeyCodec>(from: &EncodedBound, to: &EncodedBound) -> bool {
        let (Some(lo), Some(hi)) = (from.key_bytes(), to.key_bytes()) else {
            return false;
        };
        K::compare_encoded(lo, hi) == Ordering::Equal
            && !matches!(
                (from, to),
                (EncodedBound::Included(_), EncodedBound::Included(_))
            )
    }
}

/// How a traversal step ended.
enum Step {
    /// Positioned and buffered; carry on.
    Ready,
    /// The tree moved; descend again from the root.
    Reseek,
}

/// A forward-only scan over a key range.
///
/// Call [`SeekCursor::next`] and read the entry through [`SeekCursor::key`]
/// and [`SeekCursor::value`], or consume the cursor with
/// [`SeekCursor::entries`].
pub struct SeekCursor<'t, K: KeyCodec, V: ValCodec> {
    core: &'t TreeCore,
    page: PageCursor<'t>,
    lookahead: PageCursor<'t>,
    from: EncodedBound,
    to: EncodedBound,
    descending: bool,
    gens: Generations,
    prev: Option<Vec<u8>>,
    current: Option<(K, V)>,
    buffer: VecDeque<LeafEntry>,
    next_leaf: Pointer,
    needs_seek: bool,
    done: bool,
    reseeks: u32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<'t, K: KeyCodec, V: ValCodec> SeekCursor<'t, K, V> {
    /// `[from, to)` ascending, or descending when `from > to`.
    pub(crate) fn new(core: &'t TreeCore, from: &K, to: &K) -> Result<Self> {
        let from = EncodedBound::Included(encode_key(from));
        let to = EncodedBound::Excluded(encode_key(to));
        let descending = matches!(
            (from.key_bytes(), to.key_bytes()),
            (Some(lo), Some(hi)) if K::compare_encoded(lo, hi) == Ordering::Greater
        );
        Self::build(core, from, to, descending)
    }

    /// Explicit bounds. Descending only when both bounds are present and
    /// `from` orders after `to`.
    pub(crate) fn with_bounds(core: &'t TreeCore, from: Bound<&K>, to: Bound<&K>) -> Result<Self> {
        let from = EncodedBound::from_bound::<K>(from);
        let to = EncodedBound::from_bound::<K>(to);
        let descending = matches!(
            (from.key_bytes(), to.key_bytes()),
            (Some(lo), Some(hi)) if K::compare_encoded(lo, hi) == Ordering::Greater
        );
        Self::build(core, from, to, descending)
    }

    /// Ascending `[from, to)` over already encoded keys.
    pub(crate) fn between(core: &'t TreeCore, from: Vec<u8>, to: Vec<u8>) -> Result<Self> {
        Self::build(
            core,
            EncodedBound::Included(from),
            EncodedBound::Excluded(to),
            false,
        )
    }

    fn build(
        core: &'t TreeCore,
        from: EncodedBound,
        to: EncodedBound,
        descending: bool,
    ) -> Result<Self> {
        core.ensure_open()?;
        let done = EncodedBound::range_is_empty::<K>(&from, &to);
        Ok(Self {
            core,
            page: core.pager.cursor(),
            lookahead: core.pager.cursor(),
            from,
            to,
            descending,
            gens: core.generations(),
            prev: None,
            current: None,
            buffer: VecDeque::new(),
            next_leaf: Pointer::NULL,
            needs_seek: true,
            done,
            reseeks: 0,
            _marker: PhantomData,
        })
    }

    /// Moves to the next entry. Returns `false` once the range is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            if let Some((key, value)) = self.buffer.pop_front() {
                let decoded = (K::decode_key(&key)?, V::decode_val(&value)?);
                self.prev = Some(key);
                self.current = Some(decoded);
                return Ok(true);
            }
            if self.done {
                self.current = None;
                return Ok(false);
            }
            let step = if self.needs_seek {
                self.seek_from_root()?
            } else {
                self.step_to_sibling()?
            };
            match step {
                Step::Ready => {
                    self.needs_seek = false;
                    self.reseeks = 0;
                }
                Step::Reseek => {
                    self.needs_seek = true;
                    self.reseeks += 1;
                    self.core.stats.inc_seek_reseeks();
                    if self.reseeks > RESEEK_LIMIT {
                        return Err(GbpTreeError::TreeInconsistency(format!(
                            "seek restarted {RESEEK_LIMIT} times without progress"
                        )));
                    }
                }
            }
        }
    }

    /// Key of the current entry.
    pub fn key(&self) -> Option<&K> {
        self.current.as_ref().map(|(key, _)| key)
    }

    /// Value of the current entry.
    pub fn value(&self) -> Option<&V> {
        self.current.as_ref().map(|(_, value)| value)
    }

    /// Turns the cursor into an iterator of owned entries.
    pub fn entries(self) -> Entries<'t, K, V> {
        Entries {
            cursor: self,
            failed: false,
        }
    }

    fn codec(&self) -> &'t dyn NodeCodec {
        self.core.codec.as_ref()
    }

    fn gens_changed(&self) -> bool {
        self.core.generations() != self.gens
    }

    /// Key the descent aims for: strictly after the last returned key, or
    /// the start bound.
    fn target(&self) -> Option<&[u8]> {
        self.prev.as_deref().or_else(|| self.from.key_bytes())
    }

    fn wanted(&self, key: &[u8]) -> bool {
        match &self.prev {
            Some(prev) => {
                let ord = K::compare_encoded(key, prev);
                if self.descending {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                }
            }
            None => self.from.start_allows::<K>(key, self.descending),
        }
    }

    /// Resolves a sibling or successor link. Crashed pairs read as null;
    /// `None` asks for a reseek.
    fn resolve(&self, data: &[u8], id: PageId, link: Link) -> Result<Option<Pointer>> {
        match page::link(data, link, self.gens) {
            Ok(pointer) => Ok(Some(pointer)),
            Err(PointerFault::Crashed) => Ok(Some(Pointer::NULL)),
            Err(PointerFault::Broken(reason)) => {
                if self.gens_changed() {
                    Ok(None)
                } else {
                    Err(GbpTreeError::inconsistent(
                        id,
                        &format!("broken {link:?} pointer: {reason:?}"),
                    ))
                }
            }
        }
    }

    fn seek_from_root(&mut self) -> Result<Step> {
        let mut crashed_children = 0u32;
        'descend: loop {
            self.gens = self.core.generations();
            self.buffer.clear();
            let mut pointer = self.core.root();
            let mut trips = 0u32;
            loop {
                self.page.next(pointer.id)?;
                let data = self.page.data();
                if !page::is_node(data) || page::generation(data) > pointer.generation {
                    return Ok(Step::Reseek);
                }
                let Some(successor) = self.resolve(data, pointer.id, Link::Successor)? else {
                    return Ok(Step::Reseek);
                };
                if !successor.is_null() {
                    trips += 1;
                    if trips > TRIP_LIMIT {
                        return Err(GbpTreeError::inconsistent(
                            pointer.id,
                            "successor chain exceeds trip limit",
                        ));
                    }
                    pointer = successor;
                    continue;
                }
                if page::is_leaf(data) {
                    break;
                }
                let codec = self.codec();
                let pos = match self.target() {
                    Some(key) => codec.child_index(data, key)?,
                    None if self.descending => codec.key_count(data)?,
                    None => 0,
                };
                match codec.child_at(data, pos, self.gens) {
                    Ok(child) if !child.is_null() => pointer = child,
                    Ok(_) => {
                        if self.gens_changed() || self.page.should_retry()? {
                            return Ok(Step::Reseek);
                        }
                        return Err(GbpTreeError::inconsistent(pointer.id, "null child pointer"));
                    }
                    Err(PointerFault::Crashed) => {
                        crashed_children += 1;
                        self.core.stats.inc_seek_retries();
                        if crashed_children > CRASHED_CHILD_LIMIT {
                            return Err(GbpTreeError::inconsistent(
                                pointer.id,
                                "child pointer stays crashed",
                            ));
                        }
                        continue 'descend;
                    }
                    Err(PointerFault::Broken(reason)) => {
                        if self.gens_changed() {
                            return Ok(Step::Reseek);
                        }
                        return Err(GbpTreeError::inconsistent(
                            pointer.id,
                            &format!("broken child pointer {pos}: {reason:?}"),
                        ));
                    }
                }
            }
            if let Step::Reseek = self.land()? {
                return Ok(Step::Reseek);
            }
            return self.read_ahead();
        }
    }

    /// Makes sure no wanted key sits in the neighbour behind the landing
    /// leaf, which happens when keys moved while the descent was under way.
    fn land(&mut self) -> Result<Step> {
        let (behind, ahead) = if self.descending {
            (Link::Right, Link::Left)
        } else {
            (Link::Left, Link::Right)
        };
        loop {
            let codec = self.codec();
            let data = self.page.data();
            let count = codec.key_count(data)?;
            let edge = if self.descending { count.wrapping_sub(1) } else { 0 };
            if count > 0 && !self.wanted(codec.key_at(data, edge)?) {
                return Ok(Step::Ready);
            }
            let leaf = self.page.id();
            let Some(neighbour) = self.resolve(data, leaf, behind)? else {
                return Ok(Step::Reseek);
            };
            if neighbour.is_null() {
                return Ok(Step::Ready);
            }
            self.lookahead.next(neighbour.id)?;
            let lookahead = self.lookahead.data();
            if !page::is_node(lookahead) || !page::is_leaf(lookahead) {
                return Ok(Step::Reseek);
            }
            match (
                self.resolve(lookahead, neighbour.id, ahead)?,
                self.resolve(lookahead, neighbour.id, Link::Successor)?,
            ) {
                (Some(back), Some(successor)) if back.id == leaf && successor.is_null() => {}
                _ => return Ok(Step::Reseek),
            }
            if self.page.should_retry()? {
                return Ok(Step::Reseek);
            }
            let ahead_count = codec.key_count(lookahead)?;
            if ahead_count == 0 {
                return Ok(Step::Ready);
            }
            let ahead_edge = if self.descending { 0 } else { ahead_count - 1 };
            if !self.wanted(codec.key_at(lookahead, ahead_edge)?) {
                return Ok(Step::Ready);
            }
            std::mem::swap(&mut self.page, &mut self.lookahead);
        }
    }

    /// Buffers every wanted entry of the current leaf and remembers where
    /// the scan continues.
    fn read_ahead(&mut self) -> Result<Step> {
        let codec = self.codec();
        let data = self.page.data();
        let count = codec.key_count(data)?;
        let mut ended = false;
        for step in 0..count {
            let pos = if self.descending { count - 1 - step } else { step };
            let key = codec.key_at(data, pos)?;
            if !self.wanted(key) {
                continue;
            }
            if self.to.is_past_end::<K>(key, self.descending) {
                ended = true;
                break;
            }
            self.buffer
                .push_back((key.to_vec(), codec.value_at(data, pos)?.to_vec()));
        }
        if ended {
            self.done = true;
            return Ok(Step::Ready);
        }
        let link = if self.descending {
            Link::Left
        } else {
            Link::Right
        };
        let Some(next) = self.resolve(data, self.page.id(), link)? else {
            self.buffer.clear();
            return Ok(Step::Reseek);
        };
        self.next_leaf = next;
        if next.is_null() {
            self.done = true;
        }
        Ok(Step::Ready)
    }

    /// Moves to the sibling in scan direction, accepting it only when the
    /// leaf just read is unchanged and the sibling still links back to it.
    fn step_to_sibling(&mut self) -> Result<Step> {
        let leaf = self.page.id();
        let next = self.next_leaf;
        self.lookahead.next(next.id)?;
        let lookahead = self.lookahead.data();
        if self.page.should_retry()?
            || !page::is_node(lookahead)
            || !page::is_leaf(lookahead)
            || page::generation(lookahead) > next.generation
        {
            return Ok(Step::Reseek);
        }
        let back = if self.descending {
            Link::Right
        } else {
            Link::Left
        };
        match (
            self.resolve(lookahead, next.id, back)?,
            self.resolve(lookahead, next.id, Link::Successor)?,
        ) {
            (Some(back), Some(successor)) if back.id == leaf && successor.is_null() => {}
            _ => return Ok(Step::Reseek),
        }
        std::mem::swap(&mut self.page, &mut self.lookahead);
        self.read_ahead()
    }
}

/// Iterator over the remaining entries of a [`SeekCursor`].
///
/// Yields each error once and then stops.
pub struct Entries<'t, K: KeyCodec, V: ValCodec> {
    cursor: SeekCursor<'t, K, V>,
    failed: bool,
}

impl<K: KeyCodec, V: ValCodec> Iterator for Entries<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.cursor.next() {
            Ok(true) => self.cursor.current.take().map(Ok),
            Ok(false) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(key: u64) -> Vec<u8> {
        encode_key(&key)
    }

    #[test]
    fn bounds_follow_scan_direction() {
        let from = EncodedBound::Included(enc(10));
        assert!(from.start_allows::<u64>(&enc(10), false));
        assert!(from.start_allows::<u64>(&enc(11), false));
        assert!(!from.start_allows::<u64>(&enc(9), false));
        assert!(from.start_allows::<u64>(&enc(9), true));
        assert!(!from.start_allows::<u64>(&enc(11), true));

        let to = EncodedBound::Excluded(enc(5));
        assert!(to.is_past_end::<u64>(&enc(5), true));
        assert!(to.is_past_end::<u64>(&enc(4), true));
        assert!(!to.is_past_end::<u64>(&enc(6), true));
        assert!(to.is_past_end::<u64>(&enc(5), false));
        assert!(!to.is_past_end::<u64>(&enc(4), false));

        let inclusive = EncodedBound::Included(enc(5));
        assert!(!inclusive.is_past_end::<u64>(&enc(5), false));
        assert!(inclusive.is_past_end::<u64>(&enc(6), false));
        assert!(!inclusive.is_past_end::<u64>(&enc(5), true));
    }

    #[test]
    fn equal_bounds_are_empty_unless_both_inclusive() {
        let a = EncodedBound::Included(enc(3));
        let b = EncodedBound::Excluded(enc(3));
        assert!(EncodedBound::range_is_empty::<u64>(&a, &b));
        assert!(!EncodedBound::range_is_empty::<u64>(&a, &a.clone()));
        assert!(!EncodedBound::range_is_empty::<u64>(
            &a,
            &EncodedBound::Unbounded
        ));
        assert!(!EncodedBound::range_is_empty::<u64>(
            &EncodedBound::Included(enc(4)),
            &b
        ));
    }
}
