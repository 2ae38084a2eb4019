//! Tunables, fixed constants and the validated geometry of a managed flash region.

use crate::error::{Result, YaffsError};
use crate::nand::NandLayout;
use crate::tags::TAGS_SPARE_SIZE;

/// Number of distinct object ids (ids are 18 bits wide in the tags)
pub const OBJECT_SPACE: u32 = 0x40000;

/// Number of hash buckets in the object store
pub const N_OBJECT_BUCKETS: usize = 256;

pub const OBJECTID_ROOT: u32 = 1;
pub const OBJECTID_LOSTNFOUND: u32 = 2;
pub const OBJECTID_UNLINKED: u32 = 3;
pub const OBJECTID_DELETED: u32 = 4;

/// Object id carried in the tags of checkpoint chunks
pub const OBJECTID_CHECKPOINT_DATA: u32 = 0x20;

/// First object id handed out to user-created objects
pub const FIRST_USER_OBJECT_ID: u32 = 0x100;

pub const LOWEST_SEQUENCE_NUMBER: u32 = 0x0000_1000;
pub const HIGHEST_SEQUENCE_NUMBER: u32 = 0xEFFF_FF00;

/// Sequence number carried in the tags of checkpoint chunks
pub const SEQUENCE_CHECKPOINT_DATA: u32 = 0x21;

pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_ALIAS_LENGTH: usize = 159;

/// Largest chunk id that fits in the tags
pub const MAX_CHUNK_ID: u32 = (1 << 20) - 1;

/// Most data chunks a file can have: data chunk `i` is tagged with chunk id `i + 1`
pub const MAX_FILE_CHUNKS: u32 = MAX_CHUNK_ID;

/// Smallest page that can hold a maximal object header
pub const MIN_CHUNK_SIZE: usize = 512;

/// Largest page whose byte count fits in the tags
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

/// Caller-supplied parameters for a device instance
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceParams {
    /// First block of the managed region
    pub start_block: u32,

    /// Last block (inclusive) of the managed region; the last block of the NAND if `None`
    pub end_block: Option<u32>,

    /// Erased blocks held back so that GC always has somewhere to copy to
    pub n_reserved_blocks: u32,

    /// How many times a chunk write is attempted (on fresh chunks) before giving up; also the
    /// number of aborted collections after which a GC victim is retired
    pub write_attempts: u32,

    /// Upper bound on chunks examined by one call to `gc_step`
    pub gc_chunks_per_step: u32,

    /// Every this many passive GC calls, collect the oldest dirty block instead
    pub oldest_dirty_period: u32,

    /// ECC events (corrected tags or data, or uncorrectable data) tolerated on one block before it
    /// is retired
    pub ecc_strike_limit: u32,

    /// Number of pooled scratch chunk buffers
    pub n_temp_buffers: usize,

    /// Always do a full scan at mount
    pub skip_checkpoint_read: bool,

    /// Never write a checkpoint
    pub skip_checkpoint_write: bool,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            start_block: 0,
            end_block: None,
            n_reserved_blocks: 5,
            write_attempts: 5,
            gc_chunks_per_step: 8,
            oldest_dirty_period: 8,
            ecc_strike_limit: 3,
            n_temp_buffers: 6,
            skip_checkpoint_read: false,
            skip_checkpoint_write: false,
        }
    }
}

impl DeviceParams {
    /// Check these parameters against a NAND layout, producing the geometry the device runs on
    pub fn validate(&self, layout: NandLayout) -> Result<Geometry> {
        let invalid = |reason: String| Err(YaffsError::InvalidGeometry(reason));

        let end_block = self.end_block.unwrap_or(layout.blocks.saturating_sub(1));
        if end_block >= layout.blocks || self.start_block > end_block {
            return invalid(format!(
                "block range {}..={end_block} outside of {} blocks",
                self.start_block, layout.blocks
            ));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&layout.bytes_per_page) {
            return invalid(format!("unsupported page size {}", layout.bytes_per_page));
        }
        if layout.spare_bytes_per_page < TAGS_SPARE_SIZE {
            return invalid(format!(
                "spare area of {} bytes cannot hold {TAGS_SPARE_SIZE} bytes of tags",
                layout.spare_bytes_per_page
            ));
        }
        if layout.pages_per_block < 2 {
            return invalid("blocks must hold at least two pages".into());
        }
        if self.n_reserved_blocks < 2 {
            return invalid("at least two reserved blocks are required".into());
        }

        let n_blocks = end_block - self.start_block + 1;
        if n_blocks <= self.n_reserved_blocks + 1 {
            return invalid(format!(
                "{n_blocks} blocks leave no room beyond {} reserved",
                self.n_reserved_blocks
            ));
        }
        if self.write_attempts == 0 || self.gc_chunks_per_step == 0 {
            return invalid("write_attempts and gc_chunks_per_step must be nonzero".into());
        }

        Ok(Geometry {
            start_block: self.start_block,
            end_block,
            chunks_per_block: layout.pages_per_block,
            bytes_per_chunk: layout.bytes_per_page,
            spare_bytes: layout.spare_bytes_per_page,
        })
    }
}

/// The validated shape of the managed region
///
/// Chunk numbers are absolute NAND page numbers: `block * chunks_per_block + page`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub start_block: u32,
    pub end_block: u32,
    pub chunks_per_block: u32,
    pub bytes_per_chunk: usize,
    pub spare_bytes: usize,
}

impl Geometry {
    pub fn n_blocks(&self) -> u32 {
        self.end_block - self.start_block + 1
    }

    pub fn blocks(&self) -> std::ops::RangeInclusive<u32> {
        self.start_block..=self.end_block
    }

    pub fn contains_block(&self, block: u32) -> bool {
        self.blocks().contains(&block)
    }

    pub fn block_of(&self, chunk: u32) -> u32 {
        chunk / self.chunks_per_block
    }

    pub fn page_of(&self, chunk: u32) -> u32 {
        chunk % self.chunks_per_block
    }

    pub fn chunk_at(&self, block: u32, page: u32) -> u32 {
        block * self.chunks_per_block + page
    }

    /// Total chunks in the managed region
    pub fn n_chunks(&self) -> u32 {
        self.n_blocks() * self.chunks_per_block
    }
}
