//! Chunk allocation: picking the block new chunks go into, and writing them with retries.

use log::{debug, warn};
use retry::{delay::NoDelay, retry, OperationResult};

use crate::block::BlockState;
use crate::chunk;
use crate::config::HIGHEST_SEQUENCE_NUMBER;
use crate::device::FlashDevice;
use crate::error::{Result, YaffsError};
use crate::gc::{GcResult, GcUrgency};
use crate::nand::Nand;
use crate::tags::ExtendedTags;

impl<N: Nand> FlashDevice<N> {
    /// Round-robin search for an empty block, starting after the last one picked
    fn find_alloc_block(&mut self) -> Option<u32> {
        let n_blocks = self.geometry.n_blocks();
        let start = self.geometry.start_block;

        for _ in 0..n_blocks {
            self.alloc_block_finder += 1;
            if !self.geometry.contains_block(self.alloc_block_finder) {
                self.alloc_block_finder = start;
            }
            if self.blocks.get(self.alloc_block_finder).state == BlockState::Empty {
                return Some(self.alloc_block_finder);
            }
        }
        None
    }

    /// Hand out the next chunk of the allocation block, opening a new block if needed
    ///
    /// Unless `use_reserve` is set, a new block is only opened while more than
    /// `n_reserved_blocks` erased blocks remain, so garbage collection always has room to copy
    /// into.
    pub(crate) fn alloc_chunk(&mut self, use_reserve: bool) -> Result<u32> {
        self.invalidate_checkpoint()?;

        let block = match self.alloc_block {
            Some(block) => block,
            None => {
                if !use_reserve && self.blocks.n_erased() <= self.params.n_reserved_blocks {
                    return Err(YaffsError::OutOfSpace);
                }
                let block = self.find_alloc_block().ok_or(YaffsError::OutOfSpace)?;
                if self.seq_number >= HIGHEST_SEQUENCE_NUMBER {
                    warn!("sequence numbers exhausted");
                    return Err(YaffsError::OutOfSpace);
                }

                self.seq_number += 1;
                self.blocks.transition(block, BlockState::Allocating)?;
                self.blocks.get_mut(block).seq_number = self.seq_number;
                self.alloc_block = Some(block);
                self.alloc_page = 0;
                debug!("allocating from block {block}, seq {:#x}", self.seq_number);
                block
            }
        };

        let chunk = self.geometry.chunk_at(block, self.alloc_page);
        self.alloc_page += 1;
        if self.alloc_page == self.geometry.chunks_per_block {
            self.close_alloc_block()?;
        }
        Ok(chunk)
    }

    /// The allocation block is done with: it becomes full (and dirty right away if nothing in it
    /// survived)
    fn close_alloc_block(&mut self) -> Result<()> {
        if let Some(block) = self.alloc_block.take() {
            self.blocks.transition(block, BlockState::Full)?;
            self.blocks.mark_dirty_if_empty(block);
        }
        Ok(())
    }

    /// A write into `chunk` failed; give up on the rest of its block
    fn abandon_block(&mut self, chunk: u32, error: &YaffsError) -> Result<()> {
        let block = self.geometry.block_of(chunk);
        self.stats.n_write_failures += 1;
        warn!("chunk {chunk}: write failed ({error}), abandoning block {block}");

        if self.alloc_block == Some(block) {
            self.close_alloc_block()?;
        }

        if chunk::block_is_bad(&mut self.nand, block)? {
            // Nothing in it can be read back any more
            self.blocks.transition(block, BlockState::Dead)?;
            self.stats.n_retired_blocks += 1;
        } else {
            let info = self.blocks.get_mut(block);
            info.needs_retiring = true;
            info.gc_prioritise = true;
        }
        Ok(())
    }

    /// Make sure a fresh block is available to ordinary writes, collecting garbage if needed
    fn ensure_free_space(&mut self) -> Result<()> {
        let reserved = self.params.n_reserved_blocks;
        let max_steps = self.geometry.n_blocks()
            * (self.geometry.chunks_per_block / self.params.gc_chunks_per_step + 2);

        for _ in 0..max_steps {
            if self.alloc_block.is_some() || self.blocks.n_erased() > reserved {
                return Ok(());
            }
            if self.gc_step(GcUrgency::Aggressive)? == GcResult::Idle {
                break;
            }
        }
        Ok(())
    }

    /// Allocate a chunk and write `data` with `tags` into it, returning its number
    ///
    /// A failed write abandons the chunk (and its block) and tries a fresh chunk, up to
    /// `write_attempts` times. The sequence number is filled in from the block written to.
    pub(crate) fn write_new_chunk(
        &mut self,
        data: &[u8],
        tags: ExtendedTags,
        use_reserve: bool,
    ) -> Result<u32> {
        if !use_reserve {
            self.ensure_free_space()?;
        }

        let retries = self.params.write_attempts.saturating_sub(1) as usize;
        let result = retry(NoDelay.take(retries), || {
            let chunk = match self.alloc_chunk(use_reserve) {
                Ok(chunk) => chunk,
                Err(e) => return OperationResult::Err(e),
            };

            let block = self.geometry.block_of(chunk);
            let tags = ExtendedTags {
                seq_number: self.blocks.get(block).seq_number,
                ..tags
            };

            match chunk::write_chunk(&mut self.nand, &self.geometry, chunk, Some(data), &tags) {
                Ok(()) => {
                    self.blocks.inc_pages_in_use(chunk);
                    self.stats.n_page_writes += 1;
                    OperationResult::Ok(chunk)
                }
                Err(e) => match self.abandon_block(chunk, &e) {
                    Ok(()) => OperationResult::Retry(e),
                    Err(fatal) => OperationResult::Err(fatal),
                },
            }
        });

        result.map_err(|e| match e.error {
            YaffsError::Device(_) | YaffsError::BadBlock { .. } => YaffsError::WriteFailed {
                attempts: e.tries as u32,
            },
            other => other,
        })
    }
}
