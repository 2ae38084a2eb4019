//! The block info table: per-erase-block state machine and utilization counters.

use crate::config::Geometry;
use crate::error::{Result, YaffsError};

/// These are the states an erase block moves through
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, Hash)]
pub enum BlockState {
    /// Not yet looked at during mount
    #[default]
    Unknown,

    /// First chunk is in use (or unreadable); the whole block must be scanned
    NeedsScanning,

    /// Being scanned right now
    Scanning,

    /// Erased and ready for allocation
    Empty,

    /// The block new chunks are written into
    Allocating,

    /// Every page written; some may be stale
    Full,

    /// Every page stale; waiting for erase
    Dirty,

    /// Holds checkpoint data
    Checkpoint,

    /// Chosen as GC victim; live chunks are being copied out
    Collecting,

    /// Bad or retired; never used again
    Dead,
}

impl BlockState {
    /// Is `self -> to` a legal transition?
    pub fn can_transition_to(self, to: BlockState) -> bool {
        use BlockState::*;

        if self == to {
            return true;
        }

        match self {
            Dead => false,
            _ if to == Dead => true,

            // Mount-time classification, from a scan or a checkpoint
            Unknown => true,
            NeedsScanning => matches!(to, Scanning | Checkpoint),
            Scanning => matches!(to, Empty | Allocating | Full | Dirty),

            // The normal life cycle
            Empty => matches!(to, Allocating | Checkpoint),
            Allocating => to == Full,
            Full => matches!(to, Dirty | Collecting),
            Dirty => to == Collecting,
            Collecting => to == Empty,

            Checkpoint => to == Dirty,
        }
    }
}

impl From<BlockState> for u8 {
    fn from(value: BlockState) -> Self {
        match value {
            BlockState::Unknown => 0,
            BlockState::NeedsScanning => 1,
            BlockState::Scanning => 2,
            BlockState::Empty => 3,
            BlockState::Allocating => 4,
            BlockState::Full => 5,
            BlockState::Dirty => 6,
            BlockState::Checkpoint => 7,
            BlockState::Collecting => 8,
            BlockState::Dead => 9,
        }
    }
}

impl TryFrom<u8> for BlockState {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => BlockState::Unknown,
            1 => BlockState::NeedsScanning,
            2 => BlockState::Scanning,
            3 => BlockState::Empty,
            4 => BlockState::Allocating,
            5 => BlockState::Full,
            6 => BlockState::Dirty,
            7 => BlockState::Checkpoint,
            8 => BlockState::Collecting,
            9 => BlockState::Dead,
            _ => return Err(()),
        })
    }
}

/// What is known about one erase block
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    pub state: BlockState,

    /// Chunks in the block that are still live
    pub pages_in_use: u32,

    /// Sequence number given to the block when it started allocating
    pub seq_number: u32,

    /// Retire (mark bad) instead of erasing, next time it would be erased
    pub needs_retiring: bool,

    /// Collect this block ahead of others
    pub gc_prioritise: bool,

    /// Holds a header written by a truncation
    pub has_shrink_header: bool,

    /// ECC events seen on this block
    pub ecc_strikes: u32,
}

/// How `pick_gc_victim` should choose
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum VictimPolicy {
    /// The block with the fewest live pages, provided it has at most `max_live`
    LeastLive { max_live: u32 },

    /// The block with the lowest sequence number that has at least one stale page
    OldestDirty,
}

/// The per-device table of [BlockInfo]s, plus a bitmap of in-use chunks
#[derive(Debug, Clone)]
pub struct BlockTable {
    start_block: u32,
    chunks_per_block: u32,
    words_per_block: usize,
    infos: Box<[BlockInfo]>,
    chunk_bits: Box<[u64]>,
}

impl BlockTable {
    pub fn new(geometry: &Geometry) -> Self {
        let words_per_block = (geometry.chunks_per_block as usize).div_ceil(64);
        let n_blocks = geometry.n_blocks() as usize;

        Self {
            start_block: geometry.start_block,
            chunks_per_block: geometry.chunks_per_block,
            words_per_block,
            infos: vec![BlockInfo::default(); n_blocks].into_boxed_slice(),
            chunk_bits: vec![0; n_blocks * words_per_block].into_boxed_slice(),
        }
    }

    fn index(&self, block: u32) -> usize {
        (block - self.start_block) as usize
    }

    pub fn get(&self, block: u32) -> &BlockInfo {
        &self.infos[self.index(block)]
    }

    pub fn get_mut(&mut self, block: u32) -> &mut BlockInfo {
        let index = self.index(block);
        &mut self.infos[index]
    }

    /// Iterate over `(block number, info)`
    pub fn iter(&self) -> impl Iterator<Item = (u32, &BlockInfo)> + '_ {
        (self.start_block..).zip(self.infos.iter())
    }

    /// Move a block to a new state, refusing illegal transitions
    pub fn transition(&mut self, block: u32, to: BlockState) -> Result<()> {
        let info = self.get_mut(block);
        let from = info.state;
        if !from.can_transition_to(to) {
            return Err(YaffsError::IllegalTransition { block, from, to });
        }
        info.state = to;

        if matches!(to, BlockState::Empty | BlockState::Dead) {
            self.clear_block_bits(block);
            let info = self.get_mut(block);
            info.pages_in_use = 0;
            info.seq_number = 0;
            info.has_shrink_header = false;
            info.gc_prioritise = false;
        }
        Ok(())
    }

    fn bit_position(&self, chunk: u32) -> (usize, u64) {
        let block = chunk / self.chunks_per_block;
        let page = (chunk % self.chunks_per_block) as usize;
        let word = self.index(block) * self.words_per_block + page / 64;
        (word, 1 << (page % 64))
    }

    /// Is the chunk marked in use?
    pub fn chunk_in_use(&self, chunk: u32) -> bool {
        let (word, mask) = self.bit_position(chunk);
        self.chunk_bits[word] & mask != 0
    }

    /// Record a chunk as live
    pub fn inc_pages_in_use(&mut self, chunk: u32) {
        let (word, mask) = self.bit_position(chunk);
        if self.chunk_bits[word] & mask == 0 {
            self.chunk_bits[word] |= mask;
            self.get_mut(chunk / self.chunks_per_block).pages_in_use += 1;
        }
    }

    /// Record a chunk as stale; returns whether it had been live
    pub fn dec_pages_in_use(&mut self, chunk: u32) -> bool {
        let (word, mask) = self.bit_position(chunk);
        if self.chunk_bits[word] & mask == 0 {
            return false;
        }
        self.chunk_bits[word] &= !mask;
        let info = self.get_mut(chunk / self.chunks_per_block);
        info.pages_in_use = info.pages_in_use.saturating_sub(1);
        true
    }

    /// The live pages of a block, in order
    pub fn live_pages(&self, block: u32) -> impl Iterator<Item = u32> + '_ {
        let first = self.index(block) * self.words_per_block;
        let words = &self.chunk_bits[first..first + self.words_per_block];
        (0..self.chunks_per_block).filter(move |&page| {
            words[page as usize / 64] & (1 << (page % 64)) != 0
        })
    }

    fn clear_block_bits(&mut self, block: u32) {
        let first = self.index(block) * self.words_per_block;
        self.chunk_bits[first..first + self.words_per_block].fill(0);
    }

    /// A full block whose last live chunk went away becomes dirty; returns whether it did
    pub fn mark_dirty_if_empty(&mut self, block: u32) -> bool {
        let info = self.get(block);
        if info.state == BlockState::Full && info.pages_in_use == 0 {
            self.get_mut(block).state = BlockState::Dirty;
            true
        } else {
            false
        }
    }

    /// Number of blocks ready for allocation
    pub fn n_erased(&self) -> u32 {
        self.infos
            .iter()
            .filter(|x| x.state == BlockState::Empty)
            .count() as u32
    }

    /// Number of blocks in a given state
    pub fn count(&self, state: BlockState) -> u32 {
        self.infos.iter().filter(|x| x.state == state).count() as u32
    }

    /// Highest sequence number of any block
    pub fn highest_seq(&self) -> u32 {
        self.infos.iter().map(|x| x.seq_number).max().unwrap_or(0)
    }

    /// Choose a block for garbage collection, if any is worth collecting
    ///
    /// Dirty blocks are always taken first since they cost nothing to copy, then blocks flagged
    /// for priority collection or retirement. A block holding a shrink header is only eligible
    /// once it is the oldest candidate, since the header may still be needed to prune stale data
    /// in older blocks.
    pub fn pick_gc_victim(&self, policy: VictimPolicy) -> Option<u32> {
        if let Some((block, _)) = self
            .iter()
            .find(|(_, info)| info.state == BlockState::Dirty)
        {
            return Some(block);
        }

        let mut full = self
            .iter()
            .filter(|(_, info)| info.state == BlockState::Full)
            .peekable();
        full.peek()?;

        if let Some((block, _)) = self.iter().find(|(_, info)| {
            info.state == BlockState::Full && (info.gc_prioritise || info.needs_retiring)
        }) {
            return Some(block);
        }

        let oldest_seq = full.map(|(_, info)| info.seq_number).min()?;
        let eligible = |info: &BlockInfo| {
            info.state == BlockState::Full
                && info.pages_in_use < self.chunks_per_block
                && (!info.has_shrink_header || info.seq_number == oldest_seq)
        };

        match policy {
            VictimPolicy::LeastLive { max_live } => self
                .iter()
                .filter(|(_, info)| eligible(info) && info.pages_in_use <= max_live)
                .min_by_key(|(_, info)| (info.pages_in_use, info.seq_number))
                .map(|(block, _)| block),

            VictimPolicy::OldestDirty => self
                .iter()
                .filter(|(_, info)| eligible(info))
                .min_by_key(|(_, info)| info.seq_number)
                .map(|(block, _)| block),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::DeviceParams;
    use crate::nand::NandLayout;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 512,
        spare_bytes_per_page: 32,
    };

    fn table() -> BlockTable {
        let geometry = DeviceParams {
            n_reserved_blocks: 2,
            ..Default::default()
        }
        .validate(TEST_LAYOUT)
        .unwrap();
        BlockTable::new(&geometry)
    }

    #[test]
    fn test_life_cycle() -> anyhow::Result<()> {
        use BlockState::*;

        let mut table = table();
        table.transition(1, Empty)?;
        for state in [Allocating, Full, Dirty, Collecting, Empty] {
            table.transition(1, state)?;
        }

        // Skipping ahead is not allowed
        assert!(table.transition(1, Full).is_err());
        assert!(table.transition(1, Collecting).is_err());
        Ok(())
    }

    #[test]
    fn test_dead_is_terminal() {
        use BlockState::*;

        let all = [
            Unknown,
            NeedsScanning,
            Scanning,
            Empty,
            Allocating,
            Full,
            Dirty,
            Checkpoint,
            Collecting,
        ];
        for from in all {
            assert!(from.can_transition_to(Dead));
        }
        for to in all {
            assert!(!Dead.can_transition_to(to));
        }

        let mut table = table();
        table.transition(2, Dead).unwrap();
        assert!(matches!(
            table.transition(2, Empty),
            Err(YaffsError::IllegalTransition { block: 2, .. })
        ));
    }

    #[test]
    fn test_pages_in_use() {
        let mut table = table();
        table.transition(1, BlockState::Empty).unwrap();
        table.transition(1, BlockState::Allocating).unwrap();

        table.inc_pages_in_use(16);
        table.inc_pages_in_use(17);
        table.inc_pages_in_use(17);
        assert_eq!(table.get(1).pages_in_use, 2);
        assert_eq!(table.live_pages(1).collect::<Vec<_>>(), [0, 1]);

        assert!(table.dec_pages_in_use(16));
        assert!(!table.dec_pages_in_use(16));
        assert_eq!(table.get(1).pages_in_use, 1);

        table.transition(1, BlockState::Full).unwrap();
        assert!(!table.mark_dirty_if_empty(1));
        table.dec_pages_in_use(17);
        assert!(table.mark_dirty_if_empty(1));
        assert_eq!(table.get(1).state, BlockState::Dirty);
    }

    fn fill(table: &mut BlockTable, block: u32, seq: u32, live: u32) {
        table.transition(block, BlockState::Empty).unwrap();
        table.transition(block, BlockState::Allocating).unwrap();
        table.get_mut(block).seq_number = seq;
        for page in 0..live {
            table.inc_pages_in_use(block * 16 + page);
        }
        table.transition(block, BlockState::Full).unwrap();
    }

    #[test]
    fn test_pick_gc_victim() {
        let mut table = table();
        fill(&mut table, 0, 0x1000, 10);
        fill(&mut table, 1, 0x1001, 3);
        fill(&mut table, 2, 0x1002, 16);
        fill(&mut table, 3, 0x1003, 2);

        let least = VictimPolicy::LeastLive { max_live: 4 };
        assert_eq!(table.pick_gc_victim(least), Some(3));
        assert_eq!(
            table.pick_gc_victim(VictimPolicy::LeastLive { max_live: 1 }),
            None
        );
        assert_eq!(table.pick_gc_victim(VictimPolicy::OldestDirty), Some(0));

        table.get_mut(3).has_shrink_header = true;
        assert_eq!(table.pick_gc_victim(least), Some(1));

        table.get_mut(2).gc_prioritise = true;
        assert_eq!(table.pick_gc_victim(least), Some(2));

        for page in 0..10 {
            table.dec_pages_in_use(page);
        }
        table.mark_dirty_if_empty(0);
        assert_eq!(table.pick_gc_victim(least), Some(0));
    }
}
