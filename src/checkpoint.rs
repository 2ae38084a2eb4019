//! Checkpoints: a snapshot of the in-memory state, written to blocks of its own so that a mount
//! can skip the full scan.
//!
//! The snapshot is a stream of little-endian records: a header, the allocator state, one record
//! per block and one per object (carrying the file's chunk map), then an end marker and a CRC-32
//! of everything before it. The stream is cut into chunks tagged with the checkpoint object id
//! and sequence number, numbered from 1 in write order.
//!
//! A checkpoint is only trusted while it matches the flash exactly. Anything written after it
//! was saved erases it first, so finding one on flash means nothing changed since.

use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;
use log::{debug, info, warn};

use crate::block::BlockState;
use crate::chunk;
use crate::config::{
    OBJECTID_CHECKPOINT_DATA, OBJECTID_DELETED, OBJECTID_UNLINKED, SEQUENCE_CHECKPOINT_DATA,
};
use crate::device::FlashDevice;
use crate::error::{self, YaffsError};
use crate::header::{Attributes, ObjectType};
use crate::nand::{IoStatus, Nand};
use crate::object::{Object, ObjectId, Variant};
use crate::tags::ExtendedTags;

pub const CHECKPOINT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CHECKPOINT_VERSION: u32 = 1;
const END_MARKER: u32 = 0x444E_4559;
const NO_BLOCK: u32 = u32::MAX;

const BLOCK_NEEDS_RETIRING: u8 = 1 << 0;
const BLOCK_GC_PRIORITISE: u8 = 1 << 1;
const BLOCK_HAS_SHRINK_HEADER: u8 = 1 << 2;

const OBJECT_DIRTY: u8 = 1 << 0;
const OBJECT_UNLINKED: u8 = 1 << 1;
const OBJECT_SOFT_DELETED: u8 = 1 << 2;

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(magic = b"YCPT", endian = "little")]
struct CheckpointHeader {
    version: u32,
    seq_number: u32,
    n_blocks: u32,
    start_block: u32,
    n_objects: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct AllocRecord {
    alloc_block: u32,
    alloc_page: u32,
    alloc_block_finder: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct BlockRecord {
    state: u8,
    flags: u8,
    pages_in_use: u32,
    seq_number: u32,
    ecc_strikes: u32,
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ObjectRecord {
    id: u32,
    parent_id: u32,
    obj_type: u8,
    flags: u8,
    serial: u8,
    hdr_chunk: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: u32,
    mtime: u32,
    ctime: u32,
    file_size: u64,
    equiv_id: u32,
    rdev: u32,
    name_len: u16,
    #[deku(count = "name_len")]
    name: Vec<u8>,
    alias_len: u16,
    #[deku(count = "alias_len")]
    alias: Vec<u8>,

    /// Flattened `(chunk index, chunk)` pairs of a file
    n_words: u32,
    #[deku(count = "n_words")]
    chunk_map: Vec<u32>,
}

impl From<&Object> for ObjectRecord {
    fn from(obj: &Object) -> Self {
        let mut flags = 0;
        if obj.dirty {
            flags |= OBJECT_DIRTY;
        }
        if obj.unlinked {
            flags |= OBJECT_UNLINKED;
        }
        if obj.soft_deleted {
            flags |= OBJECT_SOFT_DELETED;
        }

        let header = obj.to_header(false, None);
        let mut chunk_map = Vec::new();
        if let Some(file) = obj.file() {
            file.tree.for_each(|idx, chunk| chunk_map.extend([idx, chunk]));
        }

        Self {
            id: obj.id,
            parent_id: header.parent_id,
            obj_type: header.obj_type.into(),
            flags,
            serial: obj.serial,
            hdr_chunk: obj.hdr_chunk.unwrap_or(NO_BLOCK),
            mode: header.attrs.mode,
            uid: header.attrs.uid,
            gid: header.attrs.gid,
            atime: header.attrs.atime,
            mtime: header.attrs.mtime,
            ctime: header.attrs.ctime,
            file_size: header.file_size,
            equiv_id: header.equiv_id,
            rdev: header.rdev,
            name_len: header.name.len() as u16,
            name: header.name.into_bytes(),
            alias_len: header.alias.len() as u16,
            alias: header.alias.into_bytes(),
            n_words: chunk_map.len() as u32,
            chunk_map,
        }
    }
}

impl ObjectRecord {
    /// The object this record describes, without links or file tree
    fn to_object(&self) -> error::Result<Object> {
        let obj_type = ObjectType::try_from(self.obj_type)
            .map_err(|()| YaffsError::StaleCheckpoint("bad object type"))?;
        let name = String::from_utf8(self.name.clone())
            .map_err(|_| YaffsError::StaleCheckpoint("bad object name"))?;

        let mut obj = Object::new(self.id, obj_type);
        obj.name = name;
        obj.attrs = Attributes {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        };
        obj.hdr_chunk = Some(self.hdr_chunk).filter(|&x| x != NO_BLOCK);
        obj.serial = self.serial;
        obj.dirty = self.flags & OBJECT_DIRTY != 0;
        obj.unlinked = self.flags & OBJECT_UNLINKED != 0;
        obj.soft_deleted = self.flags & OBJECT_SOFT_DELETED != 0;

        match &mut obj.variant {
            Variant::File(file) => file.size = self.file_size,
            Variant::Symlink(alias) => {
                *alias = String::from_utf8(self.alias.clone())
                    .map_err(|_| YaffsError::StaleCheckpoint("bad symlink alias"))?
            }
            Variant::Hardlink(equiv) => *equiv = self.equiv_id,
            Variant::Special(rdev) => *rdev = self.rdev,
            Variant::Directory(_) => {}
        }
        Ok(obj)
    }
}

fn serialize_error(_: DekuError) -> YaffsError {
    YaffsError::Corrupt("checkpoint record failed to serialize")
}

/// Parse one record off the front of `input`
fn take<'a, T: DekuContainerRead<'a>>(input: &mut &'a [u8]) -> error::Result<T> {
    let ((rest, _), value) =
        T::from_bytes((*input, 0)).map_err(|_| YaffsError::StaleCheckpoint("truncated record"))?;
    *input = rest;
    Ok(value)
}

impl<N: Nand> FlashDevice<N> {
    /// Erase any checkpoint on flash; it no longer describes the state about to be written
    pub(crate) fn invalidate_checkpoint(&mut self) -> error::Result<()> {
        self.checkpoint_valid = false;
        if !self.checkpoint_on_flash {
            return Ok(());
        }
        self.checkpoint_on_flash = false;

        let blocks: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Checkpoint)
            .map(|(block, _)| block)
            .collect();
        debug!("invalidating checkpoint in {} blocks", blocks.len());
        for block in blocks {
            self.blocks.transition(block, BlockState::Dirty)?;
            self.erase_and_reclaim(block)?;
        }
        Ok(())
    }

    /// Serialize the in-memory state
    fn checkpoint_stream(&self) -> error::Result<Vec<u8>> {
        let mut out = Vec::new();
        let objects: Vec<&Object> = self.objects.iter().filter(|x| !x.fake).collect();

        let header = CheckpointHeader {
            version: CHECKPOINT_VERSION,
            seq_number: self.seq_number,
            n_blocks: self.geometry.n_blocks(),
            start_block: self.geometry.start_block,
            n_objects: objects.len() as u32,
        };
        out.put_slice(&header.to_bytes().map_err(serialize_error)?);

        let alloc = AllocRecord {
            alloc_block: self.alloc_block.unwrap_or(NO_BLOCK),
            alloc_page: self.alloc_page,
            alloc_block_finder: self.alloc_block_finder,
        };
        out.put_slice(&alloc.to_bytes().map_err(serialize_error)?);

        for (_, info) in self.blocks.iter() {
            // A half-collected block resumes as a full one
            let state = match info.state {
                BlockState::Collecting => BlockState::Full,
                state => state,
            };
            let mut flags = 0;
            if info.needs_retiring {
                flags |= BLOCK_NEEDS_RETIRING;
            }
            if info.gc_prioritise {
                flags |= BLOCK_GC_PRIORITISE;
            }
            if info.has_shrink_header {
                flags |= BLOCK_HAS_SHRINK_HEADER;
            }
            let record = BlockRecord {
                state: state.into(),
                flags,
                pages_in_use: info.pages_in_use,
                seq_number: info.seq_number,
                ecc_strikes: info.ecc_strikes,
            };
            out.put_slice(&record.to_bytes().map_err(serialize_error)?);
        }

        for obj in objects {
            out.put_slice(&ObjectRecord::from(obj).to_bytes().map_err(serialize_error)?);
        }

        out.put_u32_le(END_MARKER);
        let crc = CHECKPOINT_CRC.checksum(&out);
        out.put_u32_le(crc);
        Ok(out)
    }

    /// Write a checkpoint of the current state. Running short of space, or failing to write it,
    /// only means the next mount scans.
    pub(crate) fn save_checkpoint(&mut self) -> error::Result<()> {
        self.invalidate_checkpoint()?;

        let cs = self.geometry.bytes_per_chunk;
        let cpb = self.geometry.chunks_per_block as usize;
        let len = self.checkpoint_stream()?.len();
        let n_blocks = len.div_ceil(cs).div_ceil(cpb) as u32;

        if self.blocks.n_erased() < n_blocks + self.params.n_reserved_blocks {
            info!("not enough erased blocks for a checkpoint ({n_blocks} needed)");
            return Ok(());
        }
        let chosen: Vec<u32> = self
            .blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Empty)
            .map(|(block, _)| block)
            .take(n_blocks as usize)
            .collect();
        for &block in &chosen {
            self.blocks.transition(block, BlockState::Checkpoint)?;
        }

        let stream = self.checkpoint_stream()?;
        match self.write_checkpoint_chunks(&chosen, &stream) {
            Ok(()) => {
                self.checkpoint_on_flash = true;
                self.checkpoint_valid = true;
                self.stats.n_checkpoint_saves += 1;
                info!("checkpoint saved: {} bytes in {n_blocks} blocks", stream.len());
                Ok(())
            }
            Err(e) => {
                warn!("checkpoint write failed ({e}), discarding it");
                for block in chosen {
                    self.blocks.transition(block, BlockState::Dirty)?;
                    self.erase_and_reclaim(block)?;
                }
                Ok(())
            }
        }
    }

    fn write_checkpoint_chunks(&mut self, blocks: &[u32], stream: &[u8]) -> error::Result<()> {
        let cs = self.geometry.bytes_per_chunk;
        let cpb = self.geometry.chunks_per_block as usize;
        let mut buf = self.buffers.acquire();

        let mut result = Ok(());
        for (i, piece) in stream.chunks(cs).enumerate() {
            let chunk = self.geometry.chunk_at(blocks[i / cpb], (i % cpb) as u32);
            let tags = ExtendedTags {
                seq_number: SEQUENCE_CHECKPOINT_DATA,
                ..ExtendedTags::new(OBJECTID_CHECKPOINT_DATA, i as u32 + 1, piece.len() as u32, 0)
            };
            buf[..piece.len()].copy_from_slice(piece);
            buf[piece.len()..].fill(0xFF);

            result = chunk::write_chunk(&mut self.nand, &self.geometry, chunk, Some(&buf[..]), &tags);
            if result.is_err() {
                self.stats.n_write_failures += 1;
                break;
            }
            self.stats.n_page_writes += 1;
        }

        self.buffers.release(buf);
        result
    }

    /// Gather the checkpoint stream from flash, in chunk order
    fn read_checkpoint_stream(&mut self, blocks: &[u32]) -> error::Result<Vec<u8>> {
        let mut pieces = Vec::new();
        for &block in blocks {
            for page in 0..self.geometry.chunks_per_block {
                let chunk = self.geometry.chunk_at(block, page);
                let read = self.read_chunk(chunk, None)?;
                if !read.tags.chunk_used {
                    break;
                }
                if read.tags.is_live() && read.tags.obj_id == OBJECTID_CHECKPOINT_DATA {
                    pieces.push((read.tags.chunk_id, chunk, read.tags.n_bytes as usize));
                }
            }
        }
        pieces.sort_unstable();

        let mut stream = Vec::new();
        let mut buf = self.buffers.acquire();
        let mut result = Ok(());
        for (i, &(chunk_id, chunk, n_bytes)) in pieces.iter().enumerate() {
            if chunk_id != i as u32 + 1 || n_bytes > buf.len() {
                result = Err(YaffsError::StaleCheckpoint("checkpoint chunks missing"));
                break;
            }
            match self.read_chunk(chunk, Some(&mut buf[..])) {
                Ok(read) if read.data_ecc == IoStatus::EccUnfixed => {
                    result = Err(YaffsError::StaleCheckpoint("checkpoint chunk unreadable"));
                    break;
                }
                Ok(_) => stream.extend_from_slice(&buf[..n_bytes]),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.buffers.release(buf);
        result.map(|()| stream)
    }

    /// Load the state saved by the last checkpoint, if one is on flash and still describes it
    ///
    /// Any disagreement with the flash is reported as [YaffsError::StaleCheckpoint]; the caller
    /// then discards whatever was loaded and scans.
    pub(crate) fn restore_checkpoint(&mut self) -> error::Result<()> {
        match self.load_checkpoint() {
            Ok(()) => {}
            Err(e @ (YaffsError::StaleCheckpoint(_) | YaffsError::Device(_))) => return Err(e),
            Err(e) => {
                warn!("checkpoint records don't fit together: {e}");
                return Err(YaffsError::StaleCheckpoint("inconsistent records"));
            }
        }

        // Objects still open or mid-deletion when the checkpoint was taken
        let mut doomed = self.objects.children_of(OBJECTID_UNLINKED);
        doomed.extend(self.objects.children_of(OBJECTID_DELETED));
        for id in doomed {
            debug!("finishing deletion of object {id}");
            self.destroy_object(id)?;
        }

        info!(
            "checkpoint restored: {} objects, seq {:#x}",
            self.objects.len(),
            self.seq_number
        );
        Ok(())
    }

    fn load_checkpoint(&mut self) -> error::Result<()> {
        let mut on_flash = Vec::new();
        for block in self.geometry.blocks() {
            on_flash.push(chunk::query_block(&mut self.nand, &self.geometry, block)?);
        }
        let cp_blocks: Vec<u32> = self
            .geometry
            .blocks()
            .zip(&on_flash)
            .filter(|(_, x)| x.0 == BlockState::NeedsScanning && x.1 == SEQUENCE_CHECKPOINT_DATA)
            .map(|(block, _)| block)
            .collect();
        if cp_blocks.is_empty() {
            return Err(YaffsError::StaleCheckpoint("no checkpoint on flash"));
        }

        let stream = self.read_checkpoint_stream(&cp_blocks)?;
        if stream.len() < 8 {
            return Err(YaffsError::StaleCheckpoint("checkpoint too short"));
        }
        let (body, mut trailer) = stream.split_at(stream.len() - 4);
        if trailer.get_u32_le() != CHECKPOINT_CRC.checksum(body) {
            return Err(YaffsError::StaleCheckpoint("checksum mismatch"));
        }

        let mut input = body;
        let header: CheckpointHeader = take(&mut input)?;
        if header.version != CHECKPOINT_VERSION {
            return Err(YaffsError::StaleCheckpoint("unsupported version"));
        }
        if header.n_blocks != self.geometry.n_blocks()
            || header.start_block != self.geometry.start_block
        {
            return Err(YaffsError::StaleCheckpoint("saved with a different geometry"));
        }
        let newest_on_flash = on_flash
            .iter()
            .filter(|&&(state, seq)| {
                state == BlockState::NeedsScanning && seq != SEQUENCE_CHECKPOINT_DATA
            })
            .map(|&(_, seq)| seq)
            .max()
            .unwrap_or(0);
        if newest_on_flash > header.seq_number {
            return Err(YaffsError::StaleCheckpoint("flash written after checkpoint"));
        }

        let alloc: AllocRecord = take(&mut input)?;

        let mut expected_pages = Vec::new();
        for (block, &(flash_state, _)) in self.geometry.blocks().zip(&on_flash) {
            let record: BlockRecord = take(&mut input)?;
            let state = BlockState::try_from(record.state)
                .map_err(|()| YaffsError::StaleCheckpoint("bad block state"))?;
            let is_cp_block = cp_blocks.contains(&block);

            if (state == BlockState::Checkpoint) != is_cp_block {
                return Err(YaffsError::StaleCheckpoint("checkpoint blocks moved"));
            }
            if state == BlockState::Empty && flash_state != BlockState::Empty {
                return Err(YaffsError::StaleCheckpoint("empty block was written"));
            }
            if flash_state == BlockState::Dead && state != BlockState::Dead {
                if record.pages_in_use > 0 {
                    return Err(YaffsError::StaleCheckpoint("block with live data went bad"));
                }
                self.blocks.transition(block, BlockState::Dead)?;
                expected_pages.push(0);
                continue;
            }

            self.blocks.transition(block, state)?;
            let info = self.blocks.get_mut(block);
            info.seq_number = record.seq_number;
            info.ecc_strikes = record.ecc_strikes;
            info.needs_retiring = record.flags & BLOCK_NEEDS_RETIRING != 0;
            info.gc_prioritise = record.flags & BLOCK_GC_PRIORITISE != 0;
            info.has_shrink_header = record.flags & BLOCK_HAS_SHRINK_HEADER != 0;
            expected_pages.push(record.pages_in_use);
        }

        let mut parents = Vec::new();
        for _ in 0..header.n_objects {
            let record: ObjectRecord = take(&mut input)?;
            self.restore_object(&record)?;
            parents.push((record.id, record.parent_id));
        }

        if input.len() != 4 || input.get_u32_le() != END_MARKER {
            return Err(YaffsError::StaleCheckpoint("missing end marker"));
        }

        self.restore_links(&parents)?;

        for ((block, info), &expected) in self.blocks.iter().zip(&expected_pages) {
            if info.pages_in_use != expected {
                warn!(
                    "block {block}: {} live chunks, checkpoint says {expected}",
                    info.pages_in_use
                );
                return Err(YaffsError::StaleCheckpoint("live chunk counts differ"));
            }
        }

        if alloc.alloc_block != NO_BLOCK {
            let block = alloc.alloc_block;
            if !self.geometry.contains_block(block)
                || self.blocks.get(block).state != BlockState::Allocating
                || alloc.alloc_page >= self.geometry.chunks_per_block
            {
                return Err(YaffsError::StaleCheckpoint("bad allocation block"));
            }
            self.alloc_block = Some(block);
            self.alloc_page = alloc.alloc_page;
        }
        if self.geometry.contains_block(alloc.alloc_block_finder) {
            self.alloc_block_finder = alloc.alloc_block_finder;
        }
        self.seq_number = header.seq_number;
        self.checkpoint_on_flash = true;
        self.checkpoint_valid = true;
        Ok(())
    }

    /// Claim a chunk named by a checkpoint record
    fn restore_chunk(&mut self, chunk: u32) -> error::Result<()> {
        let block = self.geometry.block_of(chunk);
        if !self.geometry.contains_block(block)
            || self.blocks.chunk_in_use(chunk)
            || matches!(
                self.blocks.get(block).state,
                BlockState::Empty | BlockState::Dead | BlockState::Checkpoint
            )
        {
            return Err(YaffsError::StaleCheckpoint("bad chunk reference"));
        }
        self.blocks.inc_pages_in_use(chunk);
        Ok(())
    }

    fn restore_object(&mut self, record: &ObjectRecord) -> error::Result<()> {
        if self.objects.contains(record.id) {
            return Err(YaffsError::StaleCheckpoint("duplicate object"));
        }
        let mut obj = record.to_object()?;

        if let Some(chunk) = obj.hdr_chunk {
            self.restore_chunk(chunk)?;
        }
        if let Some(file) = obj.file_mut() {
            if record.chunk_map.len() % 2 != 0 {
                return Err(YaffsError::StaleCheckpoint("bad chunk map"));
            }
            for pair in record.chunk_map.chunks_exact(2) {
                let (idx, chunk) = (pair[0], pair[1]);
                if file.tree.put(&mut self.tnodes, idx, chunk)?.is_some() {
                    return Err(YaffsError::StaleCheckpoint("duplicate chunk index"));
                }
            }
            for pair in record.chunk_map.chunks_exact(2) {
                self.restore_chunk(pair[1])?;
            }
        }

        self.objects.insert(obj);
        Ok(())
    }

    /// Rebuild directory membership and hardlink lists once every object is loaded
    fn restore_links(&mut self, parents: &[(ObjectId, ObjectId)]) -> error::Result<()> {
        for &(id, parent) in parents {
            if parent == 0 {
                continue;
            }
            self.objects
                .link_child(parent, id)
                .map_err(|_| YaffsError::StaleCheckpoint("bad parent"))?;
        }

        for &(id, _) in parents {
            let Some(Variant::Hardlink(equiv)) = self.objects.find(id).map(|x| &x.variant) else {
                continue;
            };
            let equiv = *equiv;
            self.objects
                .find_mut(equiv)
                .ok_or(YaffsError::StaleCheckpoint("hardlink without target"))?
                .hard_links
                .push(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::OBJECTID_ROOT;
    use crate::device::test::{fresh, test_params};
    use crate::nand::SimNand;

    fn checkpoint_blocks(dev: &FlashDevice<SimNand>) -> Vec<u32> {
        dev.blocks
            .iter()
            .filter(|(_, info)| info.state == BlockState::Checkpoint)
            .map(|(block, _)| block)
            .collect()
    }

    #[test]
    fn test_save_and_restore() -> anyhow::Result<()> {
        let mut dev = fresh();
        let dir = dev.create_dir(OBJECTID_ROOT, "etc", 0o755, 0, 0)?;
        let file = dev.create_file(dir, "hosts", 0o644, 0, 0)?;
        let data: Vec<u8> = (0..3000).map(|x| (x % 253) as u8).collect();
        dev.write(file, 0, &data, false)?;
        dev.create_hardlink(OBJECTID_ROOT, "hosts.link", file)?;
        dev.sync()?;
        assert!(dev.has_checkpoint());
        assert!(!checkpoint_blocks(&dev).is_empty());
        let blocks_before = dev.blocks.clone();

        let mut dev = FlashDevice::mount(dev.unmount()?, test_params())?;
        assert!(dev.has_checkpoint());
        assert_eq!(dev.lookup_path("/etc/hosts")?, file);
        assert_eq!(dev.read(file, 0, data.len())?, data);
        assert_eq!(dev.get_link_count(file)?, 2);
        for ((_, a), (_, b)) in dev.blocks.iter().zip(blocks_before.iter()) {
            assert_eq!(a.state, b.state);
            assert_eq!(a.pages_in_use, b.pages_in_use);
        }

        Ok(())
    }

    #[test]
    fn test_write_invalidates() -> anyhow::Result<()> {
        let mut dev = fresh();
        let file = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0)?;
        dev.sync()?;
        assert!(dev.has_checkpoint());

        dev.write(file, 0, b"more", false)?;
        assert!(!dev.has_checkpoint());
        assert!(checkpoint_blocks(&dev).is_empty());

        Ok(())
    }

    #[test]
    fn test_unreadable_checkpoint_falls_back_to_scan() -> anyhow::Result<()> {
        let mut dev = fresh();
        let file = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0)?;
        dev.write(file, 0, b"still here", false)?;
        dev.sync()?;
        let block = checkpoint_blocks(&dev)[0];

        let mut nand = dev.unmount()?;
        nand.set_read_status(block, 0, IoStatus::EccUnfixed);

        let mut dev = FlashDevice::mount(nand, test_params())?;
        assert!(!dev.has_checkpoint());
        assert_eq!(dev.read(dev.lookup(OBJECTID_ROOT, "f")?, 0, 100)?, b"still here");

        Ok(())
    }

    #[test]
    fn test_no_room_for_checkpoint() -> anyhow::Result<()> {
        let mut dev = fresh();
        let reserved = dev.params.n_reserved_blocks;
        while dev.blocks.n_erased() > reserved || dev.alloc_block.is_some() {
            dev.alloc_chunk(false)?;
        }

        dev.sync()?;
        assert!(!dev.has_checkpoint());
        assert_eq!(dev.blocks.n_erased(), reserved);

        Ok(())
    }

    #[test]
    fn test_pending_deletions_finish_before_save() -> anyhow::Result<()> {
        let mut dev = fresh();
        let data = vec![0x5A; 3000];
        let gone = dev.create_file(OBJECTID_ROOT, "gone", 0o644, 0, 0)?;
        dev.write(gone, 0, &data, false)?;
        let open = dev.create_file(OBJECTID_ROOT, "open", 0o644, 0, 0)?;
        dev.write(open, 0, &data, false)?;
        dev.open(open)?;

        dev.unlink(OBJECTID_ROOT, "gone")?;
        dev.unlink(OBJECTID_ROOT, "open")?;
        assert_eq!(dev.objects.get(gone)?.parent, Some(OBJECTID_DELETED));
        assert_eq!(dev.objects.get(open)?.parent, Some(OBJECTID_UNLINKED));

        let dev = FlashDevice::mount(dev.unmount()?, test_params())?;
        assert!(dev.has_checkpoint());
        assert!(!dev.objects.contains(gone));
        assert!(!dev.objects.contains(open));
        assert!(dev.objects.children_of(OBJECTID_DELETED).is_empty());

        Ok(())
    }

    #[test]
    fn test_inconsistent_records_fall_back_to_scan() -> anyhow::Result<()> {
        let mut dev = fresh();
        let file = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0)?;
        dev.write(file, 0, b"from the scan", false)?;
        dev.sync()?;
        let blocks = checkpoint_blocks(&dev);
        let chunk = dev.find_chunk(file, 0)?.unwrap();

        // Send the file's only chunk map entry beyond any file, with a matching CRC
        let mut stream = dev.read_checkpoint_stream(&blocks)?;
        let mut entry = Vec::new();
        entry.put_u32_le(2);
        entry.put_u32_le(0);
        entry.put_u32_le(chunk);
        let body_len = stream.len() - 4;
        let at: Vec<usize> = stream[..body_len]
            .windows(entry.len())
            .enumerate()
            .filter(|(_, x)| *x == &entry[..])
            .map(|(i, _)| i)
            .collect();
        assert_eq!(at.len(), 1);
        stream[at[0] + 4..at[0] + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        let crc = CHECKPOINT_CRC.checksum(&stream[..body_len]);
        stream[body_len..].copy_from_slice(&crc.to_le_bytes());

        for &block in &blocks {
            chunk::erase_block(&mut dev.nand, block)?;
        }
        dev.write_checkpoint_chunks(&blocks, &stream)?;

        let mut dev = FlashDevice::mount(dev.into_nand(), test_params())?;
        assert!(!dev.has_checkpoint());
        assert_eq!(dev.read(file, 0, 100)?, b"from the scan");

        Ok(())
    }
}
