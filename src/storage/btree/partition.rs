//! Range partitioning and entry-count estimates read off the upper levels.
//!
//! Both walk page copies the way a seek does, without taking any lock the
//! writer could wait on. Splitter keys only steer where one partition ends
//! and the next begins, so a view that raced with the writer still yields
//! adjacent, non-overlapping ranges; it may just be less even.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::primitives::pager::PageCursor;
use crate::types::{GbpTreeError, PageId, Result};

use super::gspp::{Generations, Pointer, PointerFault};
use super::node::NodeCodec;
use super::page::{self, Link};
use super::tree::TreeCore;

/// Passes over the tree before falling back or giving up.
const ATTEMPTS: u32 = 10;
/// Successor hops allowed while loading one node.
const TRIP_LIMIT: u32 = 1_000;
/// Root-to-leaf paths sampled by the entry estimate.
const SAMPLE_PATHS: usize = 100;

/// How one level walk ended.
enum Level {
    /// The level holds leaves; nothing was collected.
    Leaves,
    /// Internal level; carries the child on the path to the start key.
    Internal(Pointer),
}

/// Loads node copies for one pass over the tree.
struct LevelReader<'t> {
    core: &'t TreeCore,
    gens: Generations,
    page: PageCursor<'t>,
    node_limit: u64,
}

impl<'t> LevelReader<'t> {
    fn new(core: &'t TreeCore) -> Result<Self> {
        let page_size = core.pager.page_size() as u64;
        Ok(Self {
            core,
            gens: core.generations(),
            page: core.pager.cursor(),
            node_limit: core.pager.io().len()? / page_size + 1,
        })
    }

    fn codec(&self) -> &'t dyn NodeCodec {
        self.core.codec.as_ref()
    }

    /// Copies the newest version of the node `pointer` leads to. `None`
    /// when the copy is not a node this view can trust.
    fn load(&mut self, mut pointer: Pointer) -> Result<Option<PageId>> {
        for _ in 0..=TRIP_LIMIT {
            self.page.next(pointer.id)?;
            let data = self.page.data();
            if !page::is_node(data) || page::generation(data) > pointer.generation {
                return Ok(None);
            }
            match page::link(data, Link::Successor, self.gens) {
                Ok(successor) if successor.is_null() => return Ok(Some(pointer.id)),
                Ok(successor) => pointer = successor,
                Err(PointerFault::Crashed) => return Ok(Some(pointer.id)),
                Err(PointerFault::Broken(_)) => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Collects the separators of one level that lie strictly inside
    /// `(from, to)`, starting at the node `start` and moving right.
    fn level_keys(
        &mut self,
        start: Pointer,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<Option<Level>> {
        if self.load(start)?.is_none() {
            return Ok(None);
        }
        if page::is_leaf(self.page.data()) {
            return Ok(Some(Level::Leaves));
        }
        let codec = self.codec();
        let cmp = codec.comparator();
        let data = self.page.data();
        let pos = match from {
            Some(key) => codec.child_index(data, key)?,
            None => 0,
        };
        let down = match codec.child_at(data, pos, self.gens) {
            Ok(child) if !child.is_null() => child,
            _ => return Ok(None),
        };
        let mut walked = 0u64;
        loop {
            let data = self.page.data();
            for pos in 0..codec.key_count(data)? {
                let key = codec.key_at(data, pos)?;
                if to.is_some_and(|to| cmp(key, to) != Ordering::Less) {
                    return Ok(Some(Level::Internal(down)));
                }
                if from.map_or(true, |from| cmp(key, from) == Ordering::Greater) {
                    out.push(key.to_vec());
                }
            }
            let right = match page::link(data, Link::Right, self.gens) {
                Ok(right) => right,
                Err(PointerFault::Crashed) => Pointer::NULL,
                Err(PointerFault::Broken(_)) => return Ok(None),
            };
            if right.is_null() {
                return Ok(Some(Level::Internal(down)));
            }
            walked += 1;
            if walked > self.node_limit || self.load(right)?.is_none() {
                return Ok(None);
            }
            if page::is_leaf(self.page.data()) {
                return Ok(None);
            }
        }
    }

    /// Separators of the shallowest internal level that yields enough keys
    /// for `desired` partitions, or of the level right above the leaves.
    fn splitters(
        &mut self,
        from: Option<&[u8]>,
        to: Option<&[u8]>,
        desired: usize,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        let mut pointer = self.core.root();
        let mut best = Vec::new();
        loop {
            let mut keys = Vec::new();
            match self.level_keys(pointer, from, to, &mut keys)? {
                None => return Ok(None),
                Some(Level::Leaves) => return Ok(Some(best)),
                Some(Level::Internal(down)) => {
                    best = keys;
                    if best.len() + 1 >= desired {
                        return Ok(Some(best));
                    }
                    pointer = down;
                }
            }
        }
    }

    /// Descends to every target, recording per level the fan-out of each
    /// distinct node seen and, at the bottom, each leaf's key count.
    fn estimate(&mut self, targets: &[Vec<u8>]) -> Result<Option<u64>> {
        let codec = self.codec();
        let mut levels: Vec<HashMap<PageId, usize>> = Vec::new();
        let mut depth = None;
        let paths = std::iter::once(None).chain(targets.iter().map(|key| Some(key.as_slice())));
        for target in paths {
            let mut pointer = self.core.root();
            let mut level = 0usize;
            loop {
                let Some(id) = self.load(pointer)? else {
                    return Ok(None);
                };
                let data = self.page.data();
                let count = codec.key_count(data)?;
                let leaf = page::is_leaf(data);
                if levels.len() == level {
                    levels.push(HashMap::new());
                }
                levels[level].insert(id, if leaf { count } else { count + 1 });
                if leaf {
                    break;
                }
                let pos = match target {
                    Some(key) => codec.child_index(data, key)?,
                    None => 0,
                };
                pointer = match codec.child_at(data, pos, self.gens) {
                    Ok(child) if !child.is_null() => child,
                    _ => return Ok(None),
                };
                level += 1;
            }
            if *depth.get_or_insert(level) != level {
                return Ok(None);
            }
        }
        let Some((leaves, internal)) = levels.split_last() else {
            return Ok(Some(0));
        };
        let nodes: f64 = internal.iter().map(average).product();
        Ok(Some((nodes * average(leaves)).round() as u64))
    }
}

fn average(level: &HashMap<PageId, usize>) -> f64 {
    if level.is_empty() {
        return 0.0;
    }
    level.values().sum::<usize>() as f64 / level.len() as f64
}

/// Picks `desired - 1` evenly spaced keys, or all of them when there are
/// too few.
fn pick_evenly(mut keys: Vec<Vec<u8>>, desired: usize) -> Vec<Vec<u8>> {
    let partitions = desired.min(keys.len() + 1);
    let slots = keys.len() + 1;
    (1..partitions)
        .map(|i| std::mem::take(&mut keys[i * slots / partitions - 1]))
        .collect()
}

/// Encoded keys splitting `(from, to)` into at most `desired` ranges,
/// ascending and strictly inside the range.
pub(crate) fn splitter_keys(
    core: &TreeCore,
    from: Option<&[u8]>,
    to: Option<&[u8]>,
    desired: usize,
) -> Result<Vec<Vec<u8>>> {
    core.ensure_open()?;
    if desired <= 1 {
        return Ok(Vec::new());
    }
    let cmp = core.codec.comparator();
    for attempt in 1..=ATTEMPTS {
        let mut reader = LevelReader::new(core)?;
        if let Some(mut keys) = reader.splitters(from, to, desired)? {
            keys.sort_by(|a, b| cmp(a, b));
            keys.dedup_by(|a, b| cmp(a, b) == Ordering::Equal);
            return Ok(pick_evenly(keys, desired));
        }
        debug!(target: "gbptree::seek", attempt, "gbptree.partition.retry");
    }
    debug!(target: "gbptree::seek", desired, "gbptree.partition.single");
    Ok(Vec::new())
}

/// Estimated entry count, extrapolated from sampled root-to-leaf paths.
pub(crate) fn estimate_entries(core: &TreeCore) -> Result<u64> {
    for attempt in 1..=ATTEMPTS {
        let targets = splitter_keys(core, None, None, SAMPLE_PATHS)?;
        let mut reader = LevelReader::new(core)?;
        if let Some(estimate) = reader.estimate(&targets)? {
            return Ok(estimate);
        }
        debug!(target: "gbptree::seek", attempt, "gbptree.estimate.retry");
    }
    Err(GbpTreeError::TreeInconsistency(
        "tree shape kept changing while sampling paths".into(),
    ))
}
