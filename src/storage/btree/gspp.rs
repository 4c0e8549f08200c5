//! Generation-safe pointer pairs.
//!
//! Every node reference is stored twice. Each slot carries the generation it
//! was written in, a 48-bit page id, and a CRC-32 over both. Writers never
//! touch the slot holding the newest stable value, so a crash in the middle of
//! a write leaves at least one intact slot behind.

use crate::primitives::bytes::be;
use crate::types::{Checksum, Crc32Fast, GbpTreeError, PageId, Result};

/// Bytes in one slot: generation, page id, checksum.
pub const SLOT_LEN: usize = 14;
/// Bytes in a slot pair.
pub const GSPP_LEN: usize = 2 * SLOT_LEN;
/// Lowest generation ever written; 0 marks an empty slot.
pub const MIN_GENERATION: u32 = 1;

const GEN: usize = 0;
const ID: usize = 4;
const CRC: usize = 10;

/// The stable/unstable generation pair a reader or writer works against.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct Generations {
    /// Generation of the last completed checkpoint.
    pub stable: u32,
    /// Generation new writes are stamped with.
    pub unstable: u32,
}

impl Generations {
    /// Builds a pair; `stable` must be lower than `unstable`.
    pub fn new(stable: u32, unstable: u32) -> Result<Self> {
        if stable < MIN_GENERATION || stable >= unstable {
            return Err(GbpTreeError::Corruption("stable generation not below unstable"));
        }
        Ok(Self { stable, unstable })
    }

    /// Packs both generations into one word for atomic publication.
    pub fn pack(self) -> u64 {
        ((self.stable as u64) << 32) | self.unstable as u64
    }

    /// Inverse of [`Generations::pack`].
    pub fn unpack(word: u64) -> Self {
        Self {
            stable: (word >> 32) as u32,
            unstable: word as u32,
        }
    }

    /// The pair a successful checkpoint moves to.
    pub fn after_checkpoint(self) -> Self {
        Self {
            stable: self.unstable,
            unstable: self.unstable + 1,
        }
    }

    /// Generations strictly between stable and unstable belong to sessions
    /// that ended without a checkpoint.
    pub fn is_crashed(self, generation: u32) -> bool {
        generation > self.stable && generation < self.unstable
    }
}

/// Classification of one slot relative to a generation pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum SlotState {
    /// Never written.
    Empty,
    /// Checksum matches and the generation is stable or current.
    Valid {
        /// Generation the slot was written in.
        generation: u32,
        /// Referenced page.
        pointer: PageId,
    },
    /// Checksum matches but the write belongs to a crashed session.
    Crashed {
        /// Generation the slot was written in.
        generation: u32,
    },
    /// Checksum mismatch, typically a torn write.
    Torn,
    /// Generation newer than the reader's unstable generation.
    Future {
        /// Generation the slot was written in.
        generation: u32,
    },
}

/// Why a slot pair cannot be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum BrokenReason {
    /// Both slots fail their checksum.
    BothTorn,
    /// Both slots are valid and carry the same generation.
    SameGeneration,
    /// A slot carries a generation above the reader's unstable generation.
    FutureGeneration,
}

/// A pointer pair that could not be resolved to a page id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub enum PointerFault {
    /// No intact slot, but the damage is what an interrupted session leaves
    /// behind; recovery cleanup repairs it.
    Crashed,
    /// The pair matches no legal write sequence.
    Broken(BrokenReason),
}

/// A resolved pointer together with the generation of the slot it came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Pointer {
    /// Target page, or [`PageId::NULL`].
    pub id: PageId,
    /// Generation the winning slot was written in; 0 for a never-written pair.
    pub generation: u32,
}

impl Pointer {
    /// The never-written pointer.
    pub const NULL: Pointer = Pointer {
        id: PageId::NULL,
        generation: 0,
    };

    /// Returns true when the pointer references no page.
    pub fn is_null(self) -> bool {
        self.id.is_null()
    }
}

fn slot_checksum(generation: u32, pointer: u64) -> u32 {
    let mut crc = Crc32Fast::default();
    crc.update(&generation.to_be_bytes());
    crc.update(&pointer.to_be_bytes()[2..]);
    crc.finalize()
}

/// Classifies the slot starting at `off`.
pub fn decode_slot(page: &[u8], off: usize, gens: Generations) -> SlotState {
    let raw = &page[off..off + SLOT_LEN];
    if raw.iter().all(|b| *b == 0) {
        return SlotState::Empty;
    }
    let generation = be::get_u32(page, off + GEN);
    let pointer = be::get_u48(page, off + ID);
    if be::get_u32(page, off + CRC) != slot_checksum(generation, pointer) {
        return SlotState::Torn;
    }
    if generation > gens.unstable {
        SlotState::Future { generation }
    } else if gens.is_crashed(generation) || generation < MIN_GENERATION {
        SlotState::Crashed { generation }
    } else {
        SlotState::Valid {
            generation,
            pointer: PageId(pointer),
        }
    }
}

/// Both slots of the pair at `off`.
pub fn inspect(page: &[u8], off: usize, gens: Generations) -> [SlotState; 2] {
    [
        decode_slot(page, off, gens),
        decode_slot(page, off + SLOT_LEN, gens),
    ]
}

/// Resolves the pair at `off` to the valid slot with the highest generation.
pub fn read(page: &[u8], off: usize, gens: Generations) -> std::result::Result<Pointer, PointerFault> {
    let slots = inspect(page, off, gens);
    if slots
        .iter()
        .any(|slot| matches!(slot, SlotState::Future { .. }))
    {
        return Err(PointerFault::Broken(BrokenReason::FutureGeneration));
    }
    match slots {
        [SlotState::Valid {
            generation: a,
            pointer: pa,
        }, SlotState::Valid {
            generation: b,
            pointer: pb,
        }] => match a.cmp(&b) {
            std::cmp::Ordering::Equal => Err(PointerFault::Broken(BrokenReason::SameGeneration)),
            std::cmp::Ordering::Greater => Ok(Pointer {
                id: pa,
                generation: a,
            }),
            std::cmp::Ordering::Less => Ok(Pointer {
                id: pb,
                generation: b,
            }),
        },
        [SlotState::Valid {
            generation,
            pointer,
        }, _]
        | [_, SlotState::Valid {
            generation,
            pointer,
        }] => Ok(Pointer {
            id: pointer,
            generation,
        }),
        [SlotState::Empty, SlotState::Empty] => Ok(Pointer::NULL),
        [SlotState::Torn, SlotState::Torn] => Err(PointerFault::Broken(BrokenReason::BothTorn)),
        _ => Err(PointerFault::Crashed),
    }
}

/// Writes `pointer` into the pair at `off`, stamped with the unstable generation.
///
/// A slot already written in the unstable generation is overwritten in place;
/// otherwise the slot not holding the newest stable value is used, which
/// replaces crashed and torn slots rather than stacking on top of them.
pub fn write(page: &mut [u8], off: usize, pointer: PageId, gens: Generations) -> Result<()> {
    if pointer > PageId::MAX {
        return Err(GbpTreeError::Invalid("page id exceeds pointer width"));
    }
    let slots = inspect(page, off, gens);
    let current = |slot: &SlotState| {
        matches!(slot, SlotState::Valid { generation, .. } if *generation == gens.unstable)
    };
    let target = if current(&slots[0]) {
        0
    } else if current(&slots[1]) {
        1
    } else {
        match slots {
            [SlotState::Future { .. }, _] | [_, SlotState::Future { .. }] => {
                return Err(GbpTreeError::TreeInconsistency(
                    "pointer slot written in a future generation".into(),
                ))
            }
            [SlotState::Valid { generation: a, .. }, SlotState::Valid { generation: b, .. }] => {
                match a.cmp(&b) {
                    std::cmp::Ordering::Equal => {
                        return Err(GbpTreeError::TreeInconsistency(
                            "pointer slots share one generation".into(),
                        ))
                    }
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Less => 0,
                }
            }
            [SlotState::Valid { .. }, _] => 1,
            _ => 0,
        }
    };
    write_slot(page, off + target * SLOT_LEN, gens.unstable, pointer.0);
    Ok(())
}

fn write_slot(page: &mut [u8], off: usize, generation: u32, pointer: u64) {
    be::put_u32(page, off + GEN, generation);
    be::put_u48(page, off + ID, pointer);
    be::put_u32(page, off + CRC, slot_checksum(generation, pointer));
}

/// Zeroes both slots of the pair at `off`.
pub fn clear(page: &mut [u8], off: usize) {
    page[off..off + GSPP_LEN].fill(0);
}

/// Zeroes crashed and torn slots in the pair at `off`, leaving a pair that
/// is both torn untouched. Returns the number of slots cleaned.
pub fn clean_crashed(page: &mut [u8], off: usize, gens: Generations) -> usize {
    let slots = inspect(page, off, gens);
    if slots == [SlotState::Torn, SlotState::Torn] {
        return 0;
    }
    let mut cleaned = 0;
    for (idx, slot) in slots.iter().enumerate() {
        if matches!(slot, SlotState::Crashed { .. } | SlotState::Torn) {
            let start = off + idx * SLOT_LEN;
            page[start..start + SLOT_LEN].fill(0);
            cleaned += 1;
        }
    }
    cleaned
}
