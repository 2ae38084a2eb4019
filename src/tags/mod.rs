//! Per-chunk tags: what is stored in a page's spare area, and how it is protected.
//!
//! Spare layout, by byte:
//!
//! ```text
//!  0      bad-block marker, always left 0xFF
//!  1      deletion byte: bit 7 cleared means the chunk is deleted
//!  2..10  word A (little-endian u64)
//! 10      ECC over word A
//! 11..19  word B (little-endian u64)
//! 19      ECC over word B
//! ```
//!
//! Word A holds the object id (bits 0..18), chunk id (18..38), byte count (38..54), serial number
//! (54..56), the "header extra available" flag (56) and a must-be-zero bit (57) that keeps a
//! written word from ever reading back as erased. Word B holds the sequence number (0..32) and, for
//! header chunks, the parent id (32..50), object type (50..53), shrink flag (53) and shadows flag
//! (54).
//!
//! The deletion byte lies outside of both ECC regions. Deleting a chunk re-programs its spare with
//! a pattern that is all-1s except for the deletion bit, which only clears that bit of whatever is
//! already there.

mod ecc;

pub use ecc::CorrectionResult;

use crate::header::ObjectType;
use crate::nand::PageUtil;

/// Number of spare bytes used by the tags
pub const TAGS_SPARE_SIZE: usize = 20;

const DELETION_BYTE: usize = 1;
const DELETION_BIT: u8 = 7;
const WORD_A: usize = 2;
const ECC_A: usize = 10;
const WORD_B: usize = 11;
const ECC_B: usize = 19;

const OBJ_ID: (u32, u32) = (0, 18);
const CHUNK_ID: (u32, u32) = (18, 20);
const N_BYTES: (u32, u32) = (38, 16);
const SERIAL: (u32, u32) = (54, 2);
const EXTRA_AVAILABLE: (u32, u32) = (56, 1);
const WRITTEN: (u32, u32) = (57, 1);

const SEQ_NUMBER: (u32, u32) = (0, 32);
const EXTRA_PARENT: (u32, u32) = (32, 18);
const EXTRA_TYPE: (u32, u32) = (50, 3);
const EXTRA_SHRINK: (u32, u32) = (53, 1);
const EXTRA_SHADOWS: (u32, u32) = (54, 1);

fn get_field(word: u64, (shift, width): (u32, u32)) -> u32 {
    ((word >> shift) & ((1u64 << width) - 1)) as u32
}

fn put_field(word: &mut u64, (shift, width): (u32, u32), value: u32) {
    let mask = ((1u64 << width) - 1) << shift;
    *word = (*word & !mask) | ((u64::from(value) << shift) & mask);
}

/// Header metadata mirrored into the tags of an object header chunk, so that a scan can learn an
/// object's type and parent without reading the chunk data
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct HeaderExtra {
    pub parent_id: u32,
    pub obj_type: ObjectType,

    /// The header was written by a truncation
    pub is_shrink: bool,

    /// The header replaces (by rename) another object, whose id is in the header body
    pub shadows: bool,
}

/// The in-memory form of a chunk's tags
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct ExtendedTags {
    /// False for a chunk that was never written (or whose tags could not be trusted)
    pub chunk_used: bool,
    pub obj_id: u32,

    /// 0 for the object header, `n + 1` for the data chunk at logical index `n`
    pub chunk_id: u32,

    /// Valid bytes in the chunk
    pub n_bytes: u32,

    /// Incremented each time the same `(obj_id, chunk_id)` is rewritten
    pub serial_number: u8,
    pub is_deleted: bool,

    /// Sequence number of the block this chunk was written into
    pub seq_number: u32,
    pub extra: Option<HeaderExtra>,
}

impl ExtendedTags {
    /// Tags for a freshly written chunk
    pub fn new(obj_id: u32, chunk_id: u32, n_bytes: u32, serial_number: u8) -> Self {
        Self {
            chunk_used: true,
            obj_id,
            chunk_id,
            n_bytes,
            serial_number: serial_number & 3,
            ..Default::default()
        }
    }

    /// Attach header metadata
    pub fn extra(mut self, extra: HeaderExtra) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Tags that, when written over a chunk, mark it deleted
    pub fn deleted() -> Self {
        Self {
            chunk_used: true,
            is_deleted: true,
            ..Default::default()
        }
    }

    /// Is this a live, usable chunk?
    pub fn is_live(&self) -> bool {
        self.chunk_used && !self.is_deleted
    }
}

/// Tags as laid out in the spare area
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct PackedTags([u8; TAGS_SPARE_SIZE]);

impl PackedTags {
    /// Take the tags from the start of a spare area
    pub fn from_bytes(spare: &[u8]) -> Self {
        let mut bytes = [0xFF; TAGS_SPARE_SIZE];
        bytes.copy_from_slice(&spare[..TAGS_SPARE_SIZE]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The all-1s pattern with only the deletion bit cleared
    pub fn deletion_marker() -> Self {
        let mut bytes = [0xFF; TAGS_SPARE_SIZE];
        bytes[DELETION_BYTE] &= !(1 << DELETION_BIT);
        Self(bytes)
    }

    /// Was anything ever programmed into these tags?
    pub fn is_erased(&self) -> bool {
        self.0.is_erased()
    }

    /// Is the deletion bit cleared?
    pub fn is_deleted(&self) -> bool {
        self.0[DELETION_BYTE] & (1 << DELETION_BIT) == 0
    }

    fn word(&self, at: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    fn set_word(&mut self, at: usize, word: u64) {
        self.0[at..at + 8].copy_from_slice(&word.to_le_bytes());
    }

    /// Are both protected words still erased (i.e. only the deletion byte could be programmed)?
    fn words_erased(&self) -> bool {
        self.0[WORD_A..].is_erased()
    }
}

/// Lay out tags for the spare area, computing their ECC
pub fn pack(tags: &ExtendedTags) -> PackedTags {
    if tags.is_deleted {
        return PackedTags::deletion_marker();
    }

    let mut a = 0u64;
    put_field(&mut a, OBJ_ID, tags.obj_id);
    put_field(&mut a, CHUNK_ID, tags.chunk_id);
    put_field(&mut a, N_BYTES, tags.n_bytes);
    put_field(&mut a, SERIAL, tags.serial_number.into());
    put_field(&mut a, EXTRA_AVAILABLE, tags.extra.is_some().into());
    put_field(&mut a, WRITTEN, 0);

    let mut b = 0u64;
    put_field(&mut b, SEQ_NUMBER, tags.seq_number);
    if let Some(extra) = tags.extra {
        put_field(&mut b, EXTRA_PARENT, extra.parent_id);
        put_field(&mut b, EXTRA_TYPE, u8::from(extra.obj_type).into());
        put_field(&mut b, EXTRA_SHRINK, extra.is_shrink.into());
        put_field(&mut b, EXTRA_SHADOWS, extra.shadows.into());
    }

    let mut packed = PackedTags([0xFF; TAGS_SPARE_SIZE]);
    packed.set_word(WORD_A, a);
    packed.0[ECC_A] = ecc::calc_ecc(a);
    packed.set_word(WORD_B, b);
    packed.0[ECC_B] = ecc::calc_ecc(b);
    packed
}

/// Decode tags from the spare area, without any ECC checking
pub fn unpack(packed: &PackedTags) -> ExtendedTags {
    if packed.is_erased() {
        return ExtendedTags::default();
    }

    let is_deleted = packed.is_deleted();
    if packed.words_erased() {
        // A deletion marker on a page that never got tags
        return ExtendedTags {
            chunk_used: is_deleted,
            is_deleted,
            ..Default::default()
        };
    }

    let a = packed.word(WORD_A);
    let b = packed.word(WORD_B);

    let extra = match get_field(a, EXTRA_AVAILABLE) {
        0 => None,
        _ => Some(HeaderExtra {
            parent_id: get_field(b, EXTRA_PARENT),
            obj_type: ObjectType::from_bits(get_field(b, EXTRA_TYPE) as u8),
            is_shrink: get_field(b, EXTRA_SHRINK) != 0,
            shadows: get_field(b, EXTRA_SHADOWS) != 0,
        }),
    };

    ExtendedTags {
        chunk_used: true,
        obj_id: get_field(a, OBJ_ID),
        chunk_id: get_field(a, CHUNK_ID),
        n_bytes: get_field(a, N_BYTES),
        serial_number: get_field(a, SERIAL) as u8,
        is_deleted,
        seq_number: get_field(b, SEQ_NUMBER),
        extra,
    }
}

/// Verify the ECC of packed tags, returning them corrected where possible
pub fn check_and_correct(packed: &PackedTags) -> (PackedTags, CorrectionResult) {
    let mut fixed = *packed;
    if packed.is_erased() || packed.words_erased() {
        return (fixed, CorrectionResult::NoError);
    }

    let mut a = fixed.word(WORD_A);
    let mut b = fixed.word(WORD_B);
    let result_a = ecc::check_ecc(&mut a, &mut fixed.0[ECC_A]);
    let result_b = ecc::check_ecc(&mut b, &mut fixed.0[ECC_B]);
    fixed.set_word(WORD_A, a);
    fixed.set_word(WORD_B, b);

    (fixed, result_a.max(result_b))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> ExtendedTags {
        ExtendedTags {
            seq_number: 0x1234,
            ..ExtendedTags::new(0x2_1234, 7, 300, 2)
        }
    }

    fn arb_tags() -> impl Strategy<Value = ExtendedTags> {
        (
            0u32..(1 << 18),
            0u32..(1 << 20),
            0u32..(1 << 16),
            0u8..4,
            any::<u32>(),
            proptest::option::of((0u32..(1 << 18), 0u8..6, any::<bool>(), any::<bool>())),
        )
            .prop_map(|(obj_id, chunk_id, n_bytes, serial, seq_number, extra)| {
                ExtendedTags {
                    seq_number,
                    extra: extra.map(|(parent_id, obj_type, is_shrink, shadows)| HeaderExtra {
                        parent_id,
                        obj_type: ObjectType::from_bits(obj_type),
                        is_shrink,
                        shadows,
                    }),
                    ..ExtendedTags::new(obj_id, chunk_id, n_bytes, serial)
                }
            })
    }

    proptest! {
        #[test]
        fn round_trip(tags in arb_tags()) {
            let packed = pack(&tags);
            prop_assert_eq!(check_and_correct(&packed).1, CorrectionResult::NoError);
            prop_assert_eq!(unpack(&packed), tags);
        }

        #[test]
        fn single_flip_is_corrected(tags in arb_tags(), bit in 0usize..144) {
            let packed = pack(&tags);
            let mut damaged = packed;
            // Both protected regions: bytes 2..11 and 11..20
            let byte = WORD_A + bit / 8;
            damaged.0[byte] ^= 1 << (bit % 8);

            let (fixed, result) = check_and_correct(&damaged);
            prop_assert_eq!(result, CorrectionResult::Fixed);
            prop_assert_eq!(unpack(&fixed), tags);
        }

        #[test]
        fn double_flip_in_one_region_is_unfixed(
            tags in arb_tags(),
            region in 0usize..2,
            first in 0usize..72,
            offset in 1usize..72,
        ) {
            let second = (first + offset) % 72;
            let base = if region == 0 { WORD_A } else { WORD_B };
            let mut damaged = pack(&tags);
            for bit in [first, second] {
                damaged.0[base + bit / 8] ^= 1 << (bit % 8);
            }

            prop_assert_eq!(check_and_correct(&damaged).1, CorrectionResult::Unfixed);
        }
    }

    #[test]
    fn test_erased_is_unused() {
        let packed = PackedTags::from_bytes(&[0xFF; TAGS_SPARE_SIZE]);
        assert_eq!(unpack(&packed), ExtendedTags::default());
        assert_eq!(check_and_correct(&packed).1, CorrectionResult::NoError);
    }

    #[test]
    fn test_written_tags_never_look_erased() {
        let tags = ExtendedTags {
            seq_number: u32::MAX,
            ..ExtendedTags::new((1 << 18) - 1, (1 << 20) - 1, u16::MAX.into(), 3)
        };
        assert!(!pack(&tags).is_erased());
    }

    #[test]
    fn test_deletion_marker_clears_one_bit() {
        let marker = pack(&ExtendedTags::deleted());
        let zero_bits: u32 = marker.as_bytes().iter().map(|x| x.count_zeros()).sum();
        assert_eq!(zero_bits, 1);
        assert!(marker.is_deleted());
    }

    #[test]
    fn test_deletion_over_live_tags() {
        let tags = sample();
        let live = pack(&tags);
        let marker = PackedTags::deletion_marker();

        // What programming the marker over the live tags leaves on flash
        let and = |x: &PackedTags, y: &PackedTags| {
            let mut out = *x;
            out.0.iter_mut().zip(y.0).for_each(|(a, b)| *a &= b);
            out
        };
        let once = and(&live, &marker);
        let twice = and(&once, &marker);
        assert_eq!(once, twice);

        let (fixed, result) = check_and_correct(&once);
        assert_eq!(result, CorrectionResult::NoError);
        let unpacked = unpack(&fixed);
        assert!(unpacked.is_deleted);
        assert_eq!(unpacked.obj_id, tags.obj_id);
        assert!(!unpacked.is_live());
    }

    #[test]
    fn test_header_extra() {
        let tags = ExtendedTags::new(0x300, 0, 0, 1).extra(HeaderExtra {
            parent_id: 1,
            obj_type: ObjectType::Directory,
            is_shrink: false,
            shadows: true,
        });
        assert_eq!(unpack(&pack(&tags)), tags);
    }
}
