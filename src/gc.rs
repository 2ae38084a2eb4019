//! Garbage collection and deferred deletion.
//!
//! Collection is incremental: a victim block is picked, then each call to
//! [FlashDevice::gc_step] copies at most `gc_chunks_per_step` of its live chunks elsewhere. Once
//! nothing live is left the block is erased (or retired).

use log::{debug, info, warn};

use crate::block::{BlockState, VictimPolicy};
use crate::chunk;
use crate::config::OBJECTID_DELETED;
use crate::device::FlashDevice;
use crate::error::{Result, YaffsError};
use crate::nand::Nand;
use crate::object::ObjectId;
use crate::tags::{CorrectionResult, ExtendedTags};

/// How hard the collector should try
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum GcUrgency {
    /// Only collect blocks that are mostly stale (and, periodically, the oldest dirty block)
    Passive,

    /// Collect the block with the fewest live chunks, however many that is
    Aggressive,

    /// Collect the block with the oldest sequence number that has anything stale
    Oldest,
}

/// What a call to [FlashDevice::gc_step] achieved
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum GcResult {
    /// No block was worth collecting
    Idle,

    /// Copied some chunks out of the victim; more remain
    InProgress { block: u32, copied: u32 },

    /// The victim was erased and is empty again
    Reclaimed { block: u32, copied: u32 },

    /// A copy failed; the victim is left as it is and collection resumes on a later call
    Aborted { block: u32 },

    /// The victim went bad, or failed too often, and is now dead
    Retired { block: u32 },
}

/// Collector bookkeeping kept between steps
#[derive(Debug, Default)]
pub struct GcState {
    /// The block being collected
    pub block: Option<u32>,

    /// Next page of the victim to look at
    pub next_page: u32,

    /// Aborted attempts on the current victim
    pub attempts: u32,

    /// Passive calls so far, to schedule oldest-dirty collection
    pub passive_calls: u32,

    /// Set while chunks are being copied, so writes may dip into the reserve
    pub active: bool,
}

impl<N: Nand> FlashDevice<N> {
    fn pick_victim(&mut self, urgency: GcUrgency) -> Option<u32> {
        let cpb = self.geometry.chunks_per_block;
        let policy = match urgency {
            GcUrgency::Passive => {
                self.gc.passive_calls += 1;
                if self.gc.passive_calls % self.params.oldest_dirty_period.max(1) == 0 {
                    VictimPolicy::OldestDirty
                } else {
                    VictimPolicy::LeastLive { max_live: cpb / 4 }
                }
            }
            GcUrgency::Aggressive => VictimPolicy::LeastLive { max_live: cpb - 1 },
            GcUrgency::Oldest => VictimPolicy::OldestDirty,
        };
        self.blocks.pick_gc_victim(policy)
    }

    /// Do a bounded amount of garbage collection
    pub fn gc_step(&mut self, urgency: GcUrgency) -> Result<GcResult> {
        let block = match self.gc.block {
            Some(block) => block,
            None => {
                let Some(block) = self.pick_victim(urgency) else {
                    return Ok(GcResult::Idle);
                };
                debug!(
                    "collecting block {block} ({} live)",
                    self.blocks.get(block).pages_in_use
                );
                self.blocks.transition(block, BlockState::Collecting)?;
                self.gc.block = Some(block);
                self.gc.next_page = 0;
                self.gc.attempts = 0;
                block
            }
        };

        self.gc.active = true;
        let result = self.collect(block);
        self.gc.active = false;
        result
    }

    fn collect(&mut self, block: u32) -> Result<GcResult> {
        let cpb = self.geometry.chunks_per_block;
        let mut copied = 0;
        let mut examined = 0;

        if self.blocks.get(block).pages_in_use == 0 {
            self.gc.next_page = cpb;
        }
        while self.gc.next_page < cpb && examined < self.params.gc_chunks_per_step {
            let chunk = self.geometry.chunk_at(block, self.gc.next_page);
            if self.blocks.chunk_in_use(chunk) {
                if let Err(e) = self.gc_copy_chunk(chunk) {
                    return self.abort_collection(block, e);
                }
                copied += 1;
            }
            self.gc.next_page += 1;
            examined += 1;
        }

        if self.gc.next_page < cpb {
            return Ok(GcResult::InProgress { block, copied });
        }

        self.gc.block = None;
        self.stats.n_gc_blocks += 1;
        self.erase_and_reclaim(block)?;
        if self.blocks.get(block).state == BlockState::Dead {
            Ok(GcResult::Retired { block })
        } else {
            Ok(GcResult::Reclaimed { block, copied })
        }
    }

    /// A copy out of the victim failed; leave it for a later attempt unless it can't be saved
    fn abort_collection(&mut self, block: u32, error: YaffsError) -> Result<GcResult> {
        warn!("collection of block {block} aborted: {error}");
        self.stats.n_gc_aborts += 1;

        if chunk::block_is_bad(&mut self.nand, block)? {
            warn!("block {block} went bad during collection");
            self.gc.block = None;
            self.blocks.transition(block, BlockState::Dead)?;
            self.stats.n_retired_blocks += 1;
            return Ok(GcResult::Retired { block });
        }

        self.gc.attempts += 1;
        if self.gc.attempts >= self.params.write_attempts {
            warn!(
                "giving up on block {block} after {} attempts",
                self.gc.attempts
            );
            self.gc.block = None;
            self.retire_block(block)?;
            return Ok(GcResult::Retired { block });
        }

        Ok(GcResult::Aborted { block })
    }

    /// Move one live chunk out of the victim
    fn gc_copy_chunk(&mut self, chunk: u32) -> Result<()> {
        let mut buf = self.buffers.acquire();
        let result = self.gc_copy_chunk_with(chunk, &mut buf);
        self.buffers.release(buf);
        result
    }

    fn gc_copy_chunk_with(&mut self, chunk: u32, buf: &mut [u8]) -> Result<()> {
        let read = self.read_chunk(chunk, Some(&mut *buf))?;

        let owner = if read.tags_ecc != CorrectionResult::Unfixed && read.tags.is_live() {
            Some((read.tags.obj_id, read.tags.chunk_id))
                .filter(|&(id, chunk_id)| self.chunk_of(id, chunk_id) == Some(chunk))
                .or_else(|| self.find_owner(chunk))
        } else {
            self.find_owner(chunk)
        };
        let Some((id, chunk_id)) = owner else {
            debug!("chunk {chunk} has no owner, dropping");
            return self.delete_chunk(chunk);
        };

        let soft_deleted = self.objects.get(id)?.soft_deleted;
        if chunk_id == 0 {
            let is_shrink = read.tags.extra.is_some_and(|x| x.is_shrink);
            return self.write_header(id, is_shrink, None);
        }

        let idx = chunk_id - 1;
        if soft_deleted {
            if let Some(file) = self.objects.get_mut(id)?.file_mut() {
                file.tree.remove(&mut self.tnodes, idx);
            }
            return self.delete_chunk(chunk);
        }

        let tags = ExtendedTags::new(
            id,
            chunk_id,
            read.tags.n_bytes,
            read.tags.serial_number.wrapping_add(1),
        );
        let new_chunk = self.write_new_chunk(buf, tags, true)?;
        if let Some(file) = self.objects.get_mut(id)?.file_mut() {
            file.tree.put(&mut self.tnodes, idx, new_chunk)?;
        }
        self.stats.n_gc_copies += 1;
        self.delete_chunk(chunk)
    }

    /// Free up to `budget` chunks of files waiting in the deleted directory; returns how many
    /// were freed
    pub(crate) fn deferred_delete_step(&mut self, budget: u32) -> Result<u32> {
        let mut freed = 0;

        for id in self.objects.children_of(OBJECTID_DELETED) {
            if freed >= budget {
                break;
            }
            freed += self.delete_some_chunks(id, budget - freed)?;
        }
        self.stats.n_bg_deletions += u64::from(freed);
        Ok(freed)
    }

    /// Complete every deferred deletion now, so that no checkpoint records a half-deleted file
    pub(crate) fn finish_deletions(&mut self) -> Result<()> {
        if !self.objects.children_of(OBJECTID_DELETED).is_empty() {
            let freed = self.deferred_delete_step(u32::MAX)?;
            debug!("finished pending deletions, {freed} chunks freed");
        }
        Ok(())
    }

    /// Free the last `budget` data chunks of a soft-deleted file, destroying it once none are
    /// left
    fn delete_some_chunks(&mut self, id: ObjectId, budget: u32) -> Result<u32> {
        if self.objects.get(id)?.file().is_none() {
            self.destroy_object(id)?;
            return Ok(0);
        }
        let Some(file) = self.objects.get_mut(id)?.file_mut() else {
            return Ok(0);
        };

        let mut entries = Vec::new();
        file.tree.for_each(|idx, chunk| entries.push((idx, chunk)));
        let from = entries.len().saturating_sub(budget as usize);
        let tail = &entries[from..];

        for &(idx, _) in tail {
            file.tree.remove(&mut self.tnodes, idx);
        }
        for &(_, chunk) in tail {
            self.delete_chunk(chunk)?;
        }

        if from == 0 {
            info!("object {id} fully deleted");
            self.destroy_object(id)?;
        }
        Ok(u32::try_from(tail.len()).unwrap_or(u32::MAX))
    }

    /// Housekeeping for idle time: some deferred deletion and a passive collection step.
    /// Returns whether anything was done.
    pub fn background_step(&mut self) -> Result<bool> {
        let freed = self.deferred_delete_step(self.params.gc_chunks_per_step)?;
        let gc = self.gc_step(GcUrgency::Passive)?;
        Ok(freed > 0 || gc != GcResult::Idle)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::device::test::fresh;

    #[test]
    fn test_gc_moves_live_chunks() -> anyhow::Result<()> {
        let mut dev = fresh();
        let cs = dev.geometry.bytes_per_chunk;
        let cpb = dev.geometry.chunks_per_block as usize;
        let root = crate::config::OBJECTID_ROOT;

        let id = dev.create_file(root, "f", 0o644, 0, 0)?;
        let data: Vec<u8> = (0..cs * cpb).map(|x| (x % 251) as u8).collect();
        dev.write(id, 0, &data, false)?;
        // Overwrite most of it, so the first block is mostly stale
        dev.write(id, cs as u64 * 2, &data[..cs * (cpb - 4)], false)?;

        let tree_chunk = |dev: &FlashDevice<_>, idx| {
            dev.objects.get(id).unwrap().file().unwrap().tree.find(idx)
        };
        let before = tree_chunk(&dev, 0).unwrap();
        let victim = dev.geometry.block_of(before);

        let mut result = dev.gc_step(GcUrgency::Aggressive)?;
        while let GcResult::InProgress { .. } = result {
            result = dev.gc_step(GcUrgency::Aggressive)?;
        }
        assert!(matches!(result, GcResult::Reclaimed { block, .. } if block == victim));
        assert_eq!(dev.blocks.get(victim).state, BlockState::Empty);

        let after = tree_chunk(&dev, 0).unwrap();
        assert_ne!(dev.geometry.block_of(after), victim);

        let mut expected = data.clone();
        expected[cs * 2..cs * 2 + cs * (cpb - 4)].copy_from_slice(&data[..cs * (cpb - 4)]);
        assert_eq!(dev.read(id, 0, data.len())?, expected);

        Ok(())
    }

    #[test]
    fn test_dirty_block_reclaimed_first() -> anyhow::Result<()> {
        let mut dev = fresh();
        let root = crate::config::OBJECTID_ROOT;
        let cs = dev.geometry.bytes_per_chunk;
        let cpb = dev.geometry.chunks_per_block as usize;

        let id = dev.create_file(root, "f", 0o644, 0, 0)?;
        dev.write(id, 0, &vec![1; cs * cpb * 2], false)?;
        dev.resize(id, 0)?;

        let dirty: Vec<u32> = dev
            .blocks
            .iter()
            .filter(|(_, x)| x.state == BlockState::Dirty)
            .map(|(b, _)| b)
            .collect();
        assert!(!dirty.is_empty());

        assert_eq!(
            dev.gc_step(GcUrgency::Passive)?,
            GcResult::Reclaimed {
                block: dirty[0],
                copied: 0
            }
        );
        Ok(())
    }

    #[test]
    fn test_deferred_deletion_respects_budget() -> anyhow::Result<()> {
        let mut dev = fresh();
        let root = crate::config::OBJECTID_ROOT;
        let cs = dev.geometry.bytes_per_chunk;

        let id = dev.create_file(root, "f", 0o644, 0, 0)?;
        dev.write(id, 0, &vec![1; cs * 5], false)?;
        dev.unlink(root, "f")?;
        assert_eq!(dev.objects.get(id)?.parent, Some(OBJECTID_DELETED));
        let before = dev.stats.n_bg_deletions;

        assert_eq!(dev.deferred_delete_step(2)?, 2);
        assert!(dev.objects.contains(id));
        assert_eq!(dev.objects.get(id)?.file().map(|x| x.tree.len()), Some(3));

        dev.finish_deletions()?;
        assert!(!dev.objects.contains(id));
        assert_eq!(dev.stats.n_bg_deletions - before, 5);
        assert_eq!(dev.deferred_delete_step(u32::MAX)?, 0);
        Ok(())
    }
}
