//! The per-device context every operation runs against.
//!
//! A [FlashDevice] owns the NAND, the block table, the object store and everything else the
//! filesystem keeps in memory. All operations take `&mut self`, so one device is only ever driven
//! by one caller at a time; wrap it in a `Mutex` to share it between threads.

use log::{debug, info, warn};

use crate::block::{BlockState, BlockTable};
use crate::buffers::BufferPool;
use crate::chunk::{self, ChunkRead, EccResult};
use crate::config::{
    DeviceParams, Geometry, LOWEST_SEQUENCE_NUMBER, OBJECTID_DELETED, OBJECTID_UNLINKED,
};
use crate::error::{Result, YaffsError};
use crate::gc::GcState;
use crate::nand::{IoStatus, Nand};
use crate::object::{ObjectId, ObjectStore, Variant};
use crate::tags::{CorrectionResult, ExtendedTags, HeaderExtra};
use crate::tnode::TnodePool;

/// Counters kept by a device, plus a few figures computed on demand
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DeviceStats {
    pub n_page_reads: u64,
    pub n_page_writes: u64,
    pub n_write_failures: u64,
    pub n_deletions: u64,
    pub n_unmarked_deletions: u64,
    pub n_erasures: u64,
    pub n_erase_failures: u64,
    pub n_retired_blocks: u64,
    pub n_ecc_fixed: u64,
    pub n_ecc_unfixed: u64,
    pub n_tags_ecc_fixed: u64,
    pub n_tags_ecc_unfixed: u64,
    pub n_gc_copies: u64,
    pub n_gc_blocks: u64,
    pub n_gc_aborts: u64,
    pub n_bg_deletions: u64,
    pub n_checkpoint_saves: u64,

    pub n_erased_blocks: u32,
    pub n_free_chunks: u32,
    pub n_objects: usize,
    pub n_tnodes: usize,
    pub n_buffer_overflows: u64,
}

/// A mounted filesystem on a NAND device
#[derive(Debug)]
pub struct FlashDevice<N: Nand> {
    pub(crate) nand: N,
    pub(crate) params: DeviceParams,
    pub(crate) geometry: Geometry,
    pub(crate) blocks: BlockTable,
    pub(crate) objects: ObjectStore,
    pub(crate) tnodes: TnodePool,
    pub(crate) buffers: BufferPool,

    /// Last sequence number handed to a block
    pub(crate) seq_number: u32,

    pub(crate) alloc_block: Option<u32>,
    pub(crate) alloc_page: u32,

    /// Where the search for the next allocation block resumes
    pub(crate) alloc_block_finder: u32,

    pub(crate) gc: GcState,

    /// Checkpoint blocks exist on flash
    pub(crate) checkpoint_on_flash: bool,

    /// ...and they match the in-memory state
    pub(crate) checkpoint_valid: bool,

    pub(crate) stats: DeviceStats,
}

impl<N: Nand> FlashDevice<N> {
    /// Set up an unmounted device context with empty in-memory state
    fn new(nand: N, params: DeviceParams) -> Result<Self> {
        let geometry = params.validate(nand.get_layout())?;
        Ok(Self {
            blocks: BlockTable::new(&geometry),
            objects: ObjectStore::new(),
            tnodes: TnodePool::default(),
            buffers: BufferPool::new(geometry.bytes_per_chunk, params.n_temp_buffers),
            seq_number: LOWEST_SEQUENCE_NUMBER - 1,
            alloc_block: None,
            alloc_page: 0,
            alloc_block_finder: geometry.start_block,
            gc: GcState::default(),
            checkpoint_on_flash: false,
            checkpoint_valid: false,
            stats: DeviceStats::default(),
            nand,
            params,
            geometry,
        })
    }

    /// Forget everything learned about the flash, ready for a fresh scan
    pub(crate) fn reset_state(&mut self) {
        self.blocks = BlockTable::new(&self.geometry);
        self.objects = ObjectStore::new();
        self.tnodes = TnodePool::default();
        self.seq_number = LOWEST_SEQUENCE_NUMBER - 1;
        self.alloc_block = None;
        self.alloc_page = 0;
        self.alloc_block_finder = self.geometry.start_block;
        self.gc = GcState::default();
        self.checkpoint_on_flash = false;
        self.checkpoint_valid = false;
    }

    /// Mount the filesystem on `nand`, from a checkpoint if a valid one exists, otherwise by
    /// scanning every block
    pub fn mount(nand: N, params: DeviceParams) -> Result<Self> {
        let mut dev = Self::new(nand, params)?;

        if !dev.params.skip_checkpoint_read {
            match dev.restore_checkpoint() {
                Ok(()) => {
                    info!("mounted from checkpoint");
                    return Ok(dev);
                }
                Err(YaffsError::StaleCheckpoint(reason)) => {
                    info!("not using checkpoint ({reason}), scanning");
                    dev.reset_state();
                }
                Err(e) => return Err(e),
            }
        }

        dev.scan()?;
        Ok(dev)
    }

    /// Erase every good block in the managed region and mount the resulting empty filesystem
    pub fn format(mut nand: N, params: DeviceParams) -> Result<Self> {
        let geometry = params.validate(nand.get_layout())?;
        let rpt = howudoin::new()
            .label("Erasing blocks")
            .set_len(u64::from(geometry.n_blocks()));

        for block in geometry.blocks() {
            rpt.inc();
            if chunk::block_is_bad(&mut nand, block)? {
                continue;
            }
            if let Err(e) = chunk::erase_block(&mut nand, block) {
                warn!("block {block}: erase failed ({e}), marking bad");
                rpt.add_info(format!("block {block} marked bad"));
                chunk::mark_block_bad(&mut nand, block)?;
            }
        }
        rpt.close();

        Self::mount(nand, params)
    }

    /// Write out everything dirty and a fresh checkpoint, then hand back the NAND
    pub fn unmount(mut self) -> Result<N> {
        // Open references don't outlive the mount
        for id in self.objects.children_of(OBJECTID_UNLINKED) {
            self.destroy_object(id)?;
        }
        self.sync()?;
        Ok(self.nand)
    }

    /// Drop all in-memory state without writing anything, as a power loss would
    pub fn into_nand(self) -> N {
        self.nand
    }

    /// Write headers of all dirty objects, then save a checkpoint if enabled
    pub fn sync(&mut self) -> Result<()> {
        let dirty: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|x| x.dirty && !x.fake)
            .map(|x| x.id)
            .collect();
        for id in dirty {
            self.write_header(id, false, None)?;
        }

        if !self.params.skip_checkpoint_write && !self.checkpoint_valid {
            self.finish_deletions()?;
            self.save_checkpoint()?;
        }
        Ok(())
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn blocks(&self) -> &BlockTable {
        &self.blocks
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Direct access to the NAND, for fault injection in tests
    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    /// Whether a checkpoint matching the current state is on flash
    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_valid
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            n_erased_blocks: self.blocks.n_erased(),
            n_free_chunks: self.n_free_chunks(),
            n_objects: self.objects.len(),
            n_tnodes: self.tnodes.in_use(),
            n_buffer_overflows: self.buffers.overflows(),
            ..self.stats.clone()
        }
    }

    /// Chunks that can still be written without erasing anything
    pub fn n_free_chunks(&self) -> u32 {
        let in_alloc_block = self
            .alloc_block
            .map_or(0, |_| self.geometry.chunks_per_block - self.alloc_page);
        self.blocks.n_erased() * self.geometry.chunks_per_block + in_alloc_block
    }

    /// Read a chunk, keeping the ECC counters and strike bookkeeping up to date
    pub(crate) fn read_chunk(&mut self, chunk: u32, data: Option<&mut [u8]>) -> Result<ChunkRead> {
        let read = chunk::read_chunk(&mut self.nand, &self.geometry, chunk, data)?;
        self.stats.n_page_reads += 1;

        match read.tags_ecc {
            CorrectionResult::NoError => {}
            CorrectionResult::Fixed => self.stats.n_tags_ecc_fixed += 1,
            CorrectionResult::Unfixed => self.stats.n_tags_ecc_unfixed += 1,
        }
        match read.data_ecc {
            IoStatus::Ok => {}
            IoStatus::EccCorrected => self.stats.n_ecc_fixed += 1,
            IoStatus::EccUnfixed => self.stats.n_ecc_unfixed += 1,
        }

        let block = self.geometry.block_of(chunk);
        if read.ecc() != EccResult::NoError {
            self.ecc_strike(block);
        }
        if read.block_bad {
            warn!("block {block} reported bad by the device");
            self.blocks.get_mut(block).needs_retiring = true;
        }

        Ok(read)
    }

    fn ecc_strike(&mut self, block: u32) {
        let limit = self.params.ecc_strike_limit;
        let info = self.blocks.get_mut(block);
        info.ecc_strikes += 1;
        if info.ecc_strikes >= limit && !info.needs_retiring {
            warn!(
                "block {block} had {} ECC events, scheduling retirement",
                info.ecc_strikes
            );
            info.needs_retiring = true;
            info.gc_prioritise = true;
        }
    }

    /// Stop tracking a chunk as live, and mark it deleted on flash where that's useful
    ///
    /// A failure to mark is not fatal: the chunk is already superseded in memory, and the block
    /// is queued for collection so that it disappears from flash too.
    pub(crate) fn delete_chunk(&mut self, chunk: u32) -> Result<()> {
        if !self.blocks.dec_pages_in_use(chunk) {
            return Ok(());
        }
        self.stats.n_deletions += 1;

        let block = self.geometry.block_of(chunk);
        let state = self.blocks.get(block).state;
        if !matches!(state, BlockState::Collecting | BlockState::Dead) {
            self.invalidate_checkpoint()?;
            let marked = chunk::write_chunk(
                &mut self.nand,
                &self.geometry,
                chunk,
                None,
                &ExtendedTags::deleted(),
            );
            if let Err(e) = marked {
                debug!("chunk {chunk}: could not mark deleted ({e})");
                self.stats.n_unmarked_deletions += 1;
                self.blocks.get_mut(block).gc_prioritise = true;
            }
        }

        self.blocks.mark_dirty_if_empty(block);
        Ok(())
    }

    /// Write a fresh header for an object reflecting its in-memory state, then retire the old
    /// one. On failure the object stays dirty.
    pub(crate) fn write_header(
        &mut self,
        id: ObjectId,
        is_shrink: bool,
        shadows: Option<ObjectId>,
    ) -> Result<()> {
        let obj = self.objects.get(id)?;
        if obj.fake {
            return Ok(());
        }

        let header = obj.to_header(is_shrink, shadows);
        let serial = obj.serial.wrapping_add(1) & 3;
        let old_chunk = obj.hdr_chunk;
        let use_reserve = self.gc.active
            || matches!(obj.parent, Some(OBJECTID_UNLINKED | OBJECTID_DELETED));
        let tags = ExtendedTags::new(id, 0, 0, serial).extra(HeaderExtra {
            parent_id: header.parent_id,
            obj_type: header.obj_type,
            is_shrink,
            shadows: shadows.is_some(),
        });

        let mut buf = self.buffers.acquire();
        let result = header
            .encode(&mut buf)
            .and_then(|()| self.write_new_chunk(&buf, tags, use_reserve));
        self.buffers.release(buf);

        let obj = self.objects.get_mut(id)?;
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(e) => {
                obj.dirty = true;
                return Err(e);
            }
        };
        obj.hdr_chunk = Some(chunk);
        obj.serial = serial;
        obj.dirty = false;

        if is_shrink {
            let block = self.geometry.block_of(chunk);
            self.blocks.get_mut(block).has_shrink_header = true;
        }
        if let Some(old_chunk) = old_chunk {
            self.delete_chunk(old_chunk)?;
        }
        Ok(())
    }

    /// Mark a block bad and stop using it
    pub(crate) fn retire_block(&mut self, block: u32) -> Result<()> {
        warn!("retiring block {block}");
        self.invalidate_checkpoint()?;
        if let Err(e) = chunk::mark_block_bad(&mut self.nand, block) {
            warn!("block {block}: could not mark bad ({e})");
        }
        if self.alloc_block == Some(block) {
            self.alloc_block = None;
        }
        self.blocks.transition(block, BlockState::Dead)?;
        self.stats.n_retired_blocks += 1;
        Ok(())
    }

    /// Erase a block with no live chunks left and return it to the pool of empty blocks, or
    /// retire it if it is flagged or the erase fails
    pub(crate) fn erase_and_reclaim(&mut self, block: u32) -> Result<()> {
        let info = self.blocks.get(block);
        if info.pages_in_use != 0 {
            return Err(YaffsError::Corrupt("erasing a block with live chunks"));
        }
        if info.state != BlockState::Collecting {
            self.blocks.transition(block, BlockState::Collecting)?;
        }
        if self.blocks.get(block).needs_retiring {
            return self.retire_block(block);
        }

        self.invalidate_checkpoint()?;
        match chunk::erase_block(&mut self.nand, block) {
            Ok(()) => {
                self.stats.n_erasures += 1;
                self.blocks.transition(block, BlockState::Empty)?;
                Ok(())
            }
            Err(e) => {
                warn!("block {block}: erase failed ({e})");
                self.stats.n_erase_failures += 1;
                self.retire_block(block)
            }
        }
    }

    /// Find the chunk of an object by its tags-level chunk id: 0 is the header
    pub(crate) fn chunk_of(&self, id: ObjectId, chunk_id: u32) -> Option<u32> {
        let obj = self.objects.find(id)?;
        if chunk_id == 0 {
            obj.hdr_chunk
        } else {
            obj.file()?.tree.find(chunk_id - 1)
        }
    }

    /// Find which object (and which chunk id of it) refers to a chunk, by searching everything
    pub(crate) fn find_owner(&self, chunk: u32) -> Option<(ObjectId, u32)> {
        self.objects.iter().find_map(|obj| {
            if obj.hdr_chunk == Some(chunk) {
                return Some((obj.id, 0));
            }
            let mut found = None;
            obj.file()?.tree.for_each(|idx, c| {
                if c == chunk {
                    found = Some(idx + 1);
                }
            });
            found.map(|chunk_id| (obj.id, chunk_id))
        })
    }

    /// Remove an object outright: free its chunks, detach it and drop it from the store
    pub(crate) fn destroy_object(&mut self, id: ObjectId) -> Result<()> {
        if !self.objects.contains(id) {
            return Ok(());
        }
        self.objects.unlink_child(id)?;
        let Some(mut obj) = self.objects.remove(id) else {
            return Ok(());
        };

        if let Variant::Hardlink(equiv) = obj.variant {
            if let Some(target) = self.objects.find_mut(equiv) {
                target.hard_links.retain(|&x| x != id);
            }
        }

        let mut freed = match obj.file_mut() {
            Some(file) => file.tree.free_all(&mut self.tnodes),
            None => Vec::new(),
        };
        freed.extend(obj.hdr_chunk);
        for chunk in freed {
            self.delete_chunk(chunk)?;
        }

        // Whatever was left inside is picked up as orphans
        for child in obj.children().unwrap_or_default() {
            if let Some(child) = self.objects.find_mut(*child) {
                child.parent = None;
            }
        }

        debug!("object {id} ({:?}) destroyed", obj.obj_type());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use crate::nand::{NandLayout, SimNand};

    pub const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 32,
        pages_per_block: 16,
        bytes_per_page: 512,
        spare_bytes_per_page: 32,
    };

    pub fn test_params() -> DeviceParams {
        DeviceParams {
            n_reserved_blocks: 3,
            ..Default::default()
        }
    }

    pub fn fresh() -> FlashDevice<SimNand> {
        FlashDevice::format(SimNand::new(TEST_LAYOUT), test_params()).unwrap()
    }

    #[test]
    fn test_format_and_mount() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.inject_bad_block(7);
        nand.set_fail_erase(9, true);

        let dev = FlashDevice::format(nand, test_params())?;
        assert_eq!(dev.blocks.get(7).state, BlockState::Dead);
        assert_eq!(dev.blocks.get(9).state, BlockState::Dead);
        assert_eq!(dev.blocks.n_erased(), 30);
        assert_eq!(dev.objects.len(), 4);

        let nand = dev.unmount()?;
        let dev = FlashDevice::mount(nand, test_params())?;
        assert_eq!(dev.blocks.get(7).state, BlockState::Dead);
        assert_eq!(dev.blocks.get(9).state, BlockState::Dead);

        Ok(())
    }

    #[test]
    fn test_ecc_strikes_schedule_retirement() -> anyhow::Result<()> {
        let mut dev = fresh();
        let data = vec![0x5A; 512];
        let chunk = dev.write_new_chunk(&data, ExtendedTags::new(0x100, 1, 512, 0), false)?;
        let block = dev.geometry.block_of(chunk);
        let page = dev.geometry.page_of(chunk);
        dev.nand.set_read_status(block, page, IoStatus::EccCorrected);

        for _ in 0..dev.params.ecc_strike_limit {
            dev.read_chunk(chunk, None)?;
        }
        assert!(dev.blocks.get(block).needs_retiring);
        assert_eq!(dev.stats().n_ecc_fixed, 3);

        Ok(())
    }

    #[test]
    fn test_delete_chunk_marks_flash() -> anyhow::Result<()> {
        let mut dev = fresh();
        let data = vec![0x5A; 512];
        let chunk = dev.write_new_chunk(&data, ExtendedTags::new(0x100, 1, 512, 0), false)?;
        assert!(dev.blocks.chunk_in_use(chunk));

        dev.delete_chunk(chunk)?;
        assert!(!dev.blocks.chunk_in_use(chunk));
        assert!(dev.read_chunk(chunk, None)?.tags.is_deleted);

        // Deleting again changes nothing
        let before = dev.stats().n_deletions;
        dev.delete_chunk(chunk)?;
        assert_eq!(dev.stats().n_deletions, before);

        Ok(())
    }
}
