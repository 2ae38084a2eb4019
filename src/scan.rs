//! Rebuilding the in-memory state from the tags on flash.
//!
//! Blocks are replayed oldest first, by sequence number, and chunks within a block in page
//! order, so a later chunk for the same `(object, chunk id)` always supersedes an earlier one.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::block::BlockState;
use crate::chunk;
use crate::config::{
    OBJECTID_DELETED, OBJECTID_LOSTNFOUND, OBJECTID_ROOT, OBJECTID_UNLINKED,
    SEQUENCE_CHECKPOINT_DATA,
};
use crate::device::FlashDevice;
use crate::error::Result;
use crate::header::{Attributes, ObjectHeader, ObjectType};
use crate::nand::{IoStatus, Nand};
use crate::object::{ObjectId, Variant, S_IFDIR, S_IFREG};
use crate::tags::{CorrectionResult, ExtendedTags};

/// Where the replay of one block ended
enum BlockEnd {
    /// Every page was written
    Full,

    /// Pages from this one on are erased
    Partial(u32),
}

/// Working state of a scan
#[derive(Default)]
struct ScanState {
    /// Chunks found to be superseded that weren't marked deleted on flash
    stale: Vec<u32>,

    /// Blocks that were only partly written, with their first erased page
    partial: Vec<(u32, u32)>,

    highest_seq: u32,
}

impl<N: Nand> FlashDevice<N> {
    /// Full-device scan. Expects freshly reset state.
    pub(crate) fn scan(&mut self) -> Result<()> {
        let rpt = howudoin::new()
            .label("Scanning blocks")
            .set_len(u64::from(self.geometry.n_blocks()));

        let mut used = Vec::new();
        for block in self.geometry.blocks() {
            rpt.inc();
            let (state, seq) = chunk::query_block(&mut self.nand, &self.geometry, block)?;
            match state {
                BlockState::NeedsScanning if seq == SEQUENCE_CHECKPOINT_DATA => {
                    self.blocks.transition(block, BlockState::NeedsScanning)?;
                    self.blocks.transition(block, BlockState::Checkpoint)?;
                    self.checkpoint_on_flash = true;
                }
                BlockState::NeedsScanning => {
                    self.blocks.transition(block, BlockState::NeedsScanning)?;
                    self.blocks.get_mut(block).seq_number = seq;
                    used.push((seq, block));
                }
                state => self.blocks.transition(block, state)?,
            }
        }
        rpt.close();

        // A checkpoint found by a scan describes a state we didn't load; it goes as soon as
        // anything is written.
        if self.checkpoint_on_flash {
            debug!("ignoring checkpoint found during scan");
        }

        used.sort_unstable();
        let rpt = howudoin::new()
            .label("Replaying blocks")
            .set_len(used.len() as u64);
        let mut state = ScanState::default();
        for &(seq, block) in &used {
            rpt.inc();
            state.highest_seq = state.highest_seq.max(seq);
            self.scan_block(block, &mut state)?;
        }
        rpt.close();

        self.finish_scan(state)?;
        info!(
            "scan done: {} objects, {} blocks used, {} erased",
            self.objects.len(),
            used.len(),
            self.blocks.n_erased()
        );
        Ok(())
    }

    fn scan_block(&mut self, block: u32, state: &mut ScanState) -> Result<()> {
        self.blocks.transition(block, BlockState::Scanning)?;
        let mut end = BlockEnd::Full;

        for page in 0..self.geometry.chunks_per_block {
            let chunk = self.geometry.chunk_at(block, page);
            let read = self.read_chunk(chunk, None)?;

            if read.tags_ecc == CorrectionResult::Unfixed {
                warn!("chunk {chunk}: tags unreadable, treating as stale");
                continue;
            }
            if !read.tags.chunk_used {
                end = BlockEnd::Partial(page);
                break;
            }
            if !read.tags.is_live() || read.data_ecc == IoStatus::EccUnfixed {
                continue;
            }
            if read.tags.seq_number == SEQUENCE_CHECKPOINT_DATA {
                continue;
            }

            if read.tags.chunk_id == 0 {
                self.scan_header(chunk, &read.tags, state)?;
            } else {
                self.scan_data(chunk, &read.tags, state)?;
            }
        }

        match end {
            BlockEnd::Full => self.blocks.transition(block, BlockState::Full)?,
            BlockEnd::Partial(page) => state.partial.push((block, page)),
        }
        Ok(())
    }

    fn mark_stale(&mut self, chunk: u32, state: &mut ScanState) {
        if self.blocks.dec_pages_in_use(chunk) {
            state.stale.push(chunk);
        }
    }

    fn scan_data(&mut self, chunk: u32, tags: &ExtendedTags, state: &mut ScanState) -> Result<()> {
        let cs = self.geometry.bytes_per_chunk as u64;
        let idx = tags.chunk_id - 1;

        let obj = self.objects.find_or_create(tags.obj_id, ObjectType::File);
        let Some(file) = obj.file_mut() else {
            debug!("chunk {chunk}: data for non-file object {}", tags.obj_id);
            state.stale.push(chunk);
            return Ok(());
        };

        file.size = file
            .size
            .max(u64::from(idx) * cs + u64::from(tags.n_bytes));
        let previous = file.tree.put(&mut self.tnodes, idx, chunk)?;

        self.blocks.inc_pages_in_use(chunk);
        if let Some(previous) = previous {
            self.mark_stale(previous, state);
        }
        Ok(())
    }

    fn scan_header(
        &mut self,
        chunk: u32,
        tags: &ExtendedTags,
        state: &mut ScanState,
    ) -> Result<()> {
        let mut buf = self.buffers.acquire();
        let read = self.read_chunk(chunk, Some(&mut buf[..]));
        let header = ObjectHeader::decode(&buf);
        self.buffers.release(buf);
        read?;

        let Some(header) = header else {
            warn!("chunk {chunk}: header of object {} is corrupt", tags.obj_id);
            state.stale.push(chunk);
            return Ok(());
        };

        let id = tags.obj_id;
        if self.objects.find(id).is_some_and(|x| x.fake) {
            state.stale.push(chunk);
            return Ok(());
        }

        self.blocks.inc_pages_in_use(chunk);
        if header.is_shrink {
            let block = self.geometry.block_of(chunk);
            self.blocks.get_mut(block).has_shrink_header = true;
        }

        // A file shell becoming something else loses its data chunks
        let obj = self.objects.find_or_create(id, header.obj_type);
        let mut freed = Vec::new();
        if header.obj_type != ObjectType::Unknown && obj.obj_type() != header.obj_type {
            if let Some(file) = obj.file_mut() {
                freed = file.tree.free_all(&mut self.tnodes);
            }
            obj.set_type(header.obj_type);
        }

        let previous = obj.hdr_chunk.replace(chunk);
        obj.serial = tags.serial_number;
        obj.name = header.name.clone();
        obj.attrs = header.attrs;

        let cs = self.geometry.bytes_per_chunk as u64;
        match &mut obj.variant {
            Variant::File(file) => {
                file.size = header.file_size;
                let n_chunks = header.file_size.div_ceil(cs).min(u64::from(u32::MAX)) as u32;
                freed.extend(file.tree.resize_down(&mut self.tnodes, n_chunks));
            }
            Variant::Symlink(alias) => *alias = header.alias.clone(),
            Variant::Hardlink(equiv) => *equiv = header.equiv_id,
            Variant::Special(rdev) => *rdev = header.rdev,
            Variant::Directory(_) => {}
        }

        for chunk in previous.into_iter().chain(freed) {
            self.mark_stale(chunk, state);
        }

        let parent = match header.parent_id {
            0 => None,
            parent if parent == id => None,
            parent => {
                let dir = self.objects.find_or_create(parent, ObjectType::Directory);
                dir.children().is_some().then_some(parent)
            }
        };
        match parent {
            Some(parent) => self.objects.link_child(parent, id)?,
            None => self.objects.unlink_child(id)?,
        }

        if let Some(shadowed) = header.shadows_obj.filter(|&x| x != id) {
            if self.objects.find(shadowed).is_some_and(|x| !x.fake) {
                debug!("object {id} shadows {shadowed}");
                self.scan_destroy(shadowed, state)?;
            }
        }
        Ok(())
    }

    /// Drop an object found to be deleted, remembering its chunks as stale
    fn scan_destroy(&mut self, id: ObjectId, state: &mut ScanState) -> Result<()> {
        self.objects.unlink_child(id)?;
        let Some(mut obj) = self.objects.remove(id) else {
            return Ok(());
        };

        let mut freed = match obj.file_mut() {
            Some(file) => file.tree.free_all(&mut self.tnodes),
            None => Vec::new(),
        };
        freed.extend(obj.hdr_chunk);
        for chunk in freed {
            self.mark_stale(chunk, state);
        }
        for child in obj.children().unwrap_or_default() {
            if let Some(child) = self.objects.find_mut(*child) {
                child.parent = None;
            }
        }
        Ok(())
    }

    fn finish_scan(&mut self, state: ScanState) -> Result<()> {
        let mut state = state;

        // Hardlinks find their targets
        let mut broken = Vec::new();
        for id in self.objects.ids() {
            let Some(Variant::Hardlink(equiv)) = self.objects.find(id).map(|x| &x.variant) else {
                continue;
            };
            let equiv = *equiv;
            match self.objects.find_mut(equiv) {
                Some(target) if target.obj_type() != ObjectType::Hardlink => {
                    target.hard_links.push(id)
                }
                _ => broken.push(id),
            }
        }
        for id in broken {
            warn!("hardlink {id} has no target");
            self.scan_destroy(id, &mut state)?;
        }

        // Objects that were on their way out when the device stopped
        let mut doomed = self.objects.children_of(OBJECTID_UNLINKED);
        doomed.extend(self.objects.children_of(OBJECTID_DELETED));
        for id in doomed {
            debug!("finishing deletion of object {id}");
            self.scan_destroy(id, &mut state)?;
        }

        self.adopt_orphans()?;

        // Partly written blocks: the newest one carries on as the allocation block
        let newest = state
            .partial
            .iter()
            .max_by_key(|&&(block, _)| self.blocks.get(block).seq_number)
            .copied();
        for &(block, page) in &state.partial {
            if Some((block, page)) == newest && page > 0 {
                self.blocks.transition(block, BlockState::Allocating)?;
                self.alloc_block = Some(block);
                self.alloc_page = page;
                self.alloc_block_finder = block;
            } else {
                self.blocks.transition(block, BlockState::Full)?;
            }
        }

        let full: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Full)
            .map(|(block, _)| block)
            .collect();
        for block in full {
            self.blocks.mark_dirty_if_empty(block);
        }

        self.seq_number = self.seq_number.max(state.highest_seq);

        // Stale chunks are marked on flash so that nothing can bring them back later
        for chunk in state.stale {
            let block = self.geometry.block_of(chunk);
            if self.blocks.chunk_in_use(chunk) || self.blocks.get(block).state == BlockState::Dead
            {
                continue;
            }
            self.invalidate_checkpoint()?;
            if let Err(e) = chunk::write_chunk(
                &mut self.nand,
                &self.geometry,
                chunk,
                None,
                &ExtendedTags::deleted(),
            ) {
                debug!("chunk {chunk}: could not mark stale chunk deleted ({e})");
                self.stats.n_unmarked_deletions += 1;
            }
        }
        Ok(())
    }

    /// Anything without a header or without a reachable parent goes into lost+found. Such objects
    /// are marked dirty, so they get a header of their own at the next sync.
    fn adopt_orphans(&mut self) -> Result<()> {
        let ids = self.objects.ids();

        for &id in &ids {
            let Some(obj) = self.objects.find_mut(id) else {
                continue;
            };
            if obj.fake || obj.hdr_chunk.is_some() {
                continue;
            }
            if obj.name.is_empty() {
                obj.name = format!("obj{id}");
            }
            let mode = match obj.obj_type() {
                ObjectType::Directory => S_IFDIR | 0o755,
                _ => S_IFREG | 0o644,
            };
            obj.attrs = Attributes::new(mode, 0, 0);
            self.adopt(id)?;
        }

        for &id in &ids {
            let reachable = self
                .objects
                .find(id)
                .map_or(true, |x| x.fake || self.objects.is_ancestor(OBJECTID_ROOT, id));
            if !reachable {
                self.adopt(id)?;
            }
        }
        Ok(())
    }

    fn adopt(&mut self, id: ObjectId) -> Result<()> {
        info!("adopting object {id} into lost+found");
        let name = self.unique_name(OBJECTID_LOSTNFOUND, id)?;
        let obj = self.objects.get_mut(id)?;
        obj.name = name;
        obj.dirty = true;
        self.objects.link_child(OBJECTID_LOSTNFOUND, id)
    }

    /// The object's name, or a variant of it, that no other child of `dir` uses
    fn unique_name(&self, dir: ObjectId, id: ObjectId) -> Result<String> {
        let name = self.objects.get(id)?.name.clone();
        let taken = |candidate: &str| {
            self.objects
                .find_child(dir, candidate)
                .is_some_and(|x| x != id)
        };
        if !taken(&name) {
            return Ok(name);
        }
        let names: HashSet<String> = self
            .objects
            .children_of(dir)
            .into_iter()
            .filter_map(|x| self.objects.find(x).map(|o| o.name.clone()))
            .collect();
        Ok((1..)
            .map(|n| format!("{name}.{n}"))
            .find(|x| !names.contains(x))
            .unwrap_or(name))
    }
}

#[cfg(test)]
mod test {
    use crate::block::{BlockState, VictimPolicy};
    use crate::config::{OBJECTID_LOSTNFOUND, OBJECTID_ROOT};
    use crate::device::test::{test_params, TEST_LAYOUT};
    use crate::device::FlashDevice;
    use crate::nand::SimNand;
    use crate::tags::ExtendedTags;

    fn no_checkpoint() -> crate::config::DeviceParams {
        crate::config::DeviceParams {
            skip_checkpoint_read: true,
            skip_checkpoint_write: true,
            ..test_params()
        }
    }

    #[test]
    fn test_scan_rebuilds_tree() -> anyhow::Result<()> {
        let mut dev = FlashDevice::format(SimNand::new(TEST_LAYOUT), no_checkpoint())?;
        let dir = dev.create_dir(OBJECTID_ROOT, "dir", 0o755, 0, 0)?;
        let file = dev.create_file(dir, "file", 0o644, 0, 0)?;
        dev.write(file, 0, b"hello world", false)?;
        dev.create_symlink(dir, "link", 0o777, 0, 0, "file")?;
        dev.sync()?;

        let mut dev = FlashDevice::mount(dev.unmount()?, no_checkpoint())?;
        let dir = dev.lookup(OBJECTID_ROOT, "dir")?;
        let file = dev.lookup(dir, "file")?;
        assert_eq!(dev.read(file, 0, 100)?, b"hello world");
        let link = dev.lookup(dir, "link")?;
        assert_eq!(dev.get_alias(link)?, "file");

        Ok(())
    }

    #[test]
    fn test_scan_resumes_allocation_block() -> anyhow::Result<()> {
        let mut dev = FlashDevice::format(SimNand::new(TEST_LAYOUT), no_checkpoint())?;
        dev.create_file(OBJECTID_ROOT, "a", 0o644, 0, 0)?;
        let block = dev.alloc_block.unwrap();
        let page = dev.alloc_page;

        let mut dev = FlashDevice::mount(dev.into_nand(), no_checkpoint())?;
        assert_eq!(dev.alloc_block, Some(block));
        assert_eq!(dev.alloc_page, page);
        assert_eq!(dev.blocks.get(block).state, BlockState::Allocating);

        Ok(())
    }

    #[test]
    fn test_headerless_data_goes_to_lost_found() -> anyhow::Result<()> {
        let mut dev = FlashDevice::format(SimNand::new(TEST_LAYOUT), no_checkpoint())?;
        let data = vec![7u8; 512];
        dev.write_new_chunk(&data, ExtendedTags::new(0x345, 1, 100, 0), false)?;

        let mut dev = FlashDevice::mount(dev.into_nand(), no_checkpoint())?;
        let id = dev.lookup(OBJECTID_LOSTNFOUND, "obj837")?;
        assert_eq!(id, 0x345);
        assert_eq!(dev.get_length(id)?, 100);
        assert_eq!(dev.read(id, 0, 100)?, vec![7u8; 100]);

        Ok(())
    }

    #[test]
    fn test_scan_keeps_block_ages() -> anyhow::Result<()> {
        let mut dev = FlashDevice::format(SimNand::new(TEST_LAYOUT), no_checkpoint())?;
        let cs = dev.geometry.bytes_per_chunk;
        let cpb = dev.geometry.chunks_per_block as usize;

        // Two full blocks, each with one stale chunk, and a shrink header after them
        let id = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0)?;
        dev.write(id, 0, &vec![1u8; 2 * cpb * cs], false)?;
        dev.write(id, 0, &[2u8], false)?;
        dev.write(id, (cpb + 4) as u64 * cs as u64, &[3u8], false)?;
        dev.resize(id, (2 * cpb - 1) as u64 * cs as u64)?;

        let ages = |dev: &FlashDevice<SimNand>| -> Vec<(BlockState, u32, u32, bool)> {
            dev.blocks
                .iter()
                .map(|(_, x)| (x.state, x.seq_number, x.pages_in_use, x.has_shrink_header))
                .collect()
        };
        let before = ages(&dev);
        let oldest = dev.blocks.pick_gc_victim(VictimPolicy::OldestDirty);
        assert!(oldest.is_some());

        let dev = FlashDevice::mount(dev.into_nand(), no_checkpoint())?;
        assert_eq!(ages(&dev), before);
        assert!(dev.blocks.iter().any(|(_, x)| x.has_shrink_header));
        assert!(dev
            .blocks
            .iter()
            .filter(|(_, x)| x.state == BlockState::Full)
            .all(|(_, x)| x.seq_number >= crate::config::LOWEST_SEQUENCE_NUMBER));
        assert_eq!(dev.blocks.pick_gc_victim(VictimPolicy::OldestDirty), oldest);

        Ok(())
    }
}
