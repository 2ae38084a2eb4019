//! The chunk I/O layer: the only code that talks to the NAND for chunk-granular reads and writes.
//!
//! Errors from the device propagate unchanged. ECC outcomes are classified and handed back; what
//! to do about them (strike counters, retirement) is up to the caller.

use log::{debug, warn};

use crate::block::BlockState;
use crate::config::Geometry;
use crate::error::{Result, YaffsError};
use crate::nand::{IoStatus, Nand, NandBlock};
use crate::tags::{self, CorrectionResult, ExtendedTags, PackedTags, TAGS_SPARE_SIZE};

/// Combined outcome of tag and data ECC for one chunk read
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Copy, Clone)]
pub enum EccResult {
    NoError,
    Fixed,
    Unfixed,
}

/// Everything learned from reading one chunk
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ChunkRead {
    /// Decoded tags; `chunk_used` is false if the tags could not be trusted
    pub tags: ExtendedTags,
    pub tags_ecc: CorrectionResult,
    pub data_ecc: IoStatus,

    /// Whether the device considers the block bad, asked after an uncorrectable data read
    pub block_bad: bool,
}

impl ChunkRead {
    pub fn ecc(&self) -> EccResult {
        let tags = match self.tags_ecc {
            CorrectionResult::NoError => EccResult::NoError,
            CorrectionResult::Fixed => EccResult::Fixed,
            CorrectionResult::Unfixed => EccResult::Unfixed,
        };
        let data = match self.data_ecc {
            IoStatus::Ok => EccResult::NoError,
            IoStatus::EccCorrected => EccResult::Fixed,
            IoStatus::EccUnfixed => EccResult::Unfixed,
        };
        tags.max(data)
    }
}

/// Write a chunk's data and tags.
///
/// With `data` omitted only the spare is programmed; with deleted tags this is the deletion path,
/// which clears the deletion bit of the tags already on flash.
pub fn write_chunk<N: Nand>(
    nand: &mut N,
    geometry: &Geometry,
    chunk: u32,
    data: Option<&[u8]>,
    tags: &ExtendedTags,
) -> Result<()> {
    let block = geometry.block_of(chunk);
    let page = geometry.page_of(chunk);

    let mut nand_block = nand.block(block)?.ok_or(YaffsError::BadBlock { block })?;
    let packed = tags::pack(tags);
    nand_block.program(page, data, packed.as_bytes())?;

    Ok(())
}

/// Read a chunk's tags, and its data into `data` if provided
pub fn read_chunk<N: Nand>(
    nand: &mut N,
    geometry: &Geometry,
    chunk: u32,
    data: Option<&mut [u8]>,
) -> Result<ChunkRead> {
    let block = geometry.block_of(chunk);
    let page = geometry.page_of(chunk);

    let nand_block = nand.block(block)?.ok_or(YaffsError::BadBlock { block })?;
    let mut spare = [0xFFu8; TAGS_SPARE_SIZE];
    let data_ecc = nand_block.read(page, data, &mut spare)?;
    drop(nand_block);

    let (packed, tags_ecc) = tags::check_and_correct(&PackedTags::from_bytes(&spare));
    let tags = match tags_ecc {
        CorrectionResult::Unfixed => {
            warn!("chunk {chunk}: uncorrectable tags");
            ExtendedTags::default()
        }
        CorrectionResult::Fixed => {
            debug!("chunk {chunk}: corrected tags");
            tags::unpack(&packed)
        }
        CorrectionResult::NoError => tags::unpack(&packed),
    };

    // The tags of a chunk with damaged data can't say anything reliable about its block, so ask
    // the device.
    let block_bad = match data_ecc {
        IoStatus::EccUnfixed => {
            warn!("chunk {chunk}: uncorrectable data");
            block_is_bad(nand, block)?
        }
        _ => false,
    };

    Ok(ChunkRead {
        tags,
        tags_ecc,
        data_ecc,
        block_bad,
    })
}

/// Classify a block from the tags of its first chunk, returning its state and sequence number
pub fn query_block<N: Nand>(
    nand: &mut N,
    geometry: &Geometry,
    block: u32,
) -> Result<(BlockState, u32)> {
    if block_is_bad(nand, block)? {
        return Ok((BlockState::Dead, 0));
    }

    let read = read_chunk(nand, geometry, geometry.chunk_at(block, 0), None)?;
    if read.tags_ecc == CorrectionResult::Unfixed {
        return Ok((BlockState::NeedsScanning, 0));
    }

    if read.tags.chunk_used {
        Ok((BlockState::NeedsScanning, read.tags.seq_number))
    } else {
        Ok((BlockState::Empty, 0))
    }
}

/// Erase a block
pub fn erase_block<N: Nand>(nand: &mut N, block: u32) -> Result<()> {
    let mut nand_block = nand.block(block)?.ok_or(YaffsError::BadBlock { block })?;
    nand_block.erase()?;
    Ok(())
}

/// Mark a block bad on the device (a no-op for a block already bad)
pub fn mark_block_bad<N: Nand>(nand: &mut N, block: u32) -> Result<()> {
    if let Some(nand_block) = nand.block(block)? {
        nand_block.mark_bad()?;
    }
    Ok(())
}

/// Ask the device whether a block is bad
pub fn block_is_bad<N: Nand>(nand: &mut N, block: u32) -> Result<bool> {
    Ok(nand.block(block)?.is_none())
}
