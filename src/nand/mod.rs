//! Abstractions and code to access NAND flash

use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_bytes_per_page: usize,
}

impl NandLayout {
    /// Bytes occupied by one page and its spare area in an image file
    pub fn raw_page_size(&self) -> usize {
        self.bytes_per_page + self.spare_bytes_per_page
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTESxSPARE"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page, spare_bytes_per_page]: [&str; 4] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let spare_bytes_per_page = spare_bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_bytes_per_page,
        })
    }
}

/// Outcome of a page read, as reported by the device's own data ECC
///
/// A device error (the read did not happen at all) is reported as `Err` instead.
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum IoStatus {
    /// The data came back clean
    #[default]
    Ok,

    /// The device found bit errors in the data and corrected them
    EccCorrected,

    /// The data contains more bit errors than the device ECC can correct
    EccUnfixed,
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// How many spare (out-of-band) bytes per page?
    fn spare_size(&self) -> usize;

    /// Read one page and its spare area.
    ///
    /// `data` may be omitted to read only the spare; `spare` may be shorter than the spare area,
    /// in which case only its leading bytes are read.
    fn read(&self, page: u32, data: Option<&mut [u8]>, spare: &mut [u8])
        -> anyhow::Result<IoStatus>;

    /// Program one page and/or its spare area.
    ///
    /// Programming can only clear bits: the content ends up as the bitwise AND of what was there
    /// and what was written. This is what allows a spare area to be re-programmed with a marker
    /// that differs from the erased state in only one bit.
    fn program(&mut self, page: u32, data: Option<&[u8]>, spare: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a program() results in error
    /// and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,

    /// Number of programs that will still land before the simulated power cut, if armed
    program_budget: Option<u32>,

    /// Total successful programs, for tests that want to count flash traffic
    programs: u64,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all pages (empty while the block is erased)
    data: Vec<u8>,

    /// All spare bytes of all pages (empty while the block is erased)
    spare: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// How many spare bytes per page
    spare_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// How many times the block was erased
    erase_count: u32,

    /// Forced ECC outcomes for particular pages
    read_status: HashMap<u32, IoStatus>,

    /// Make every erase of this block fail
    fail_erase: bool,

    /// Make every program of this block fail
    fail_program: bool,
}

/// Borrowed handle to a block of SimNand
pub struct SimBlockMut<'a> {
    block: &'a mut SimBlock,
    program_budget: &'a mut Option<u32>,
    programs: &'a mut u64,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            program_budget: None,
            programs: 0,
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// The stream holds, for every page in order, the page data followed by its spare area. A
    /// block whose first spare byte is not 0xFF is considered marked bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let size = self.layout.raw_page_size() * self.layout.pages_per_block as usize;
        let mut buf = vec![0; size];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.spare.clear();
            block.marked_bad = buf[self.layout.bytes_per_page] != 0xFF;
            if block.marked_bad || buf.is_erased() {
                continue;
            }

            for (page, raw) in buf.chunks_exact(self.layout.raw_page_size()).enumerate() {
                let (data, spare) = raw.split_at(self.layout.bytes_per_page);
                block.program_page(page as u32, Some(data), spare)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut data = vec![0; self.layout.bytes_per_page];
        let mut spare = vec![0; self.layout.spare_bytes_per_page];

        for block in self.blocks.iter() {
            for page in 0..self.layout.pages_per_block {
                if block.marked_bad {
                    data.fill(0xBD);
                    spare.fill(0xBD);
                    spare[0] = 0;
                } else {
                    block.read_page(page, Some(&mut data), &mut spare)?;
                }

                write.write_all(&data)?;
                write.write_all(&spare)?;
            }
        }

        Ok(())
    }

    /// Arm (or disarm, with `None`) a simulated power cut: after `budget` more programs, every
    /// program fails without changing the flash.
    pub fn set_program_budget(&mut self, budget: Option<u32>) {
        self.program_budget = budget;
    }

    /// How many programs have landed since creation
    pub fn program_count(&self) -> u64 {
        self.programs
    }

    /// Make a block go bad, leaving its content in place (as if the chip had worn out)
    pub fn inject_bad_block(&mut self, index: u32) {
        self.blocks[index as usize].marked_bad = true;
    }

    /// Force the data ECC outcome reported when reading a page
    pub fn set_read_status(&mut self, block: u32, page: u32, status: IoStatus) {
        let block = &mut self.blocks[block as usize];
        if status == IoStatus::Ok {
            block.read_status.remove(&page);
        } else {
            block.read_status.insert(page, status);
        }
    }

    /// Make erases of a block fail
    pub fn set_fail_erase(&mut self, block: u32, fail: bool) {
        self.blocks[block as usize].fail_erase = fail;
    }

    /// Make programs of a block fail
    pub fn set_fail_program(&mut self, block: u32, fail: bool) {
        self.blocks[block as usize].fail_program = fail;
    }

    /// Flip one bit of a page's spare area, bypassing programming rules
    pub fn flip_spare_bit(&mut self, block: u32, page: u32, byte: usize, bit: u8) {
        let block = &mut self.blocks[block as usize];
        block.materialize();
        block.spare[page as usize * block.spare_size + byte] ^= 1 << bit;
    }

    /// Flip one bit of a page's data, bypassing programming rules
    pub fn flip_data_bit(&mut self, block: u32, page: u32, byte: usize, bit: u8) {
        let block = &mut self.blocks[block as usize];
        block.materialize();
        block.data[page as usize * block.page_size + byte] ^= 1 << bit;
    }

    /// A copy of a page's raw spare area
    pub fn raw_spare(&self, block: u32, page: u32) -> Vec<u8> {
        let block = &self.blocks[block as usize];
        let mut spare = vec![0xFF; block.spare_size];
        if !block.spare.is_empty() {
            let begin = page as usize * block.spare_size;
            spare.copy_from_slice(&block.spare[begin..begin + block.spare_size]);
        }
        spare
    }

    /// How many times a block was erased
    pub fn erase_count(&self, block: u32) -> u32 {
        self.blocks[block as usize].erase_count
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            spare: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            spare_size: layout.spare_bytes_per_page,
            marked_bad: false,
            erase_count: 0,
            read_status: Default::default(),
            fail_erase: false,
            fail_program: false,
        }
    }

    /// Back an erased block with real (all-1s) storage
    fn materialize(&mut self) {
        if self.data.is_empty() {
            self.data = vec![0xFF; self.page_size * self.page_count as usize];
            self.spare = vec![0xFF; self.spare_size * self.page_count as usize];
        }
    }

    fn program_page(&mut self, index: u32, data: Option<&[u8]>, spare: &[u8]) -> anyhow::Result<()> {
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(spare.len() <= self.spare_size, "spare content too large");
        if let Some(data) = data {
            ensure!(data.len() == self.page_size, "content not page-sized");
        }

        // Writing fully-erased content is a no-op.
        if data.map_or(true, |x| x.is_erased()) && spare.is_erased() {
            return Ok(());
        }

        self.materialize();

        if let Some(data) = data {
            let begin = index as usize * self.page_size;
            for (cell, &byte) in self.data[begin..].iter_mut().zip(data) {
                *cell &= byte;
            }
        }

        let begin = index as usize * self.spare_size;
        for (cell, &byte) in self.spare[begin..].iter_mut().zip(spare) {
            *cell &= byte;
        }

        Ok(())
    }

    fn read_page(
        &self,
        index: u32,
        data: Option<&mut [u8]>,
        spare: &mut [u8],
    ) -> anyhow::Result<IoStatus> {
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(spare.len() <= self.spare_size, "spare buffer too large");

        if let Some(data) = data {
            ensure!(data.len() == self.page_size, "content not page-sized");
            if self.data.is_empty() {
                data.fill(0xFF);
            } else {
                let begin = index as usize * self.page_size;
                data.copy_from_slice(&self.data[begin..begin + self.page_size]);
            }
        }

        if self.spare.is_empty() {
            spare.fill(0xFF);
        } else {
            let begin = index as usize * self.spare_size;
            spare.copy_from_slice(&self.spare[begin..begin + spare.len()]);
        }

        Ok(self.read_status.get(&index).copied().unwrap_or_default())
    }
}

impl Nand for SimNand {
    type Block<'a> = SimBlockMut<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        let program_budget = &mut self.program_budget;
        let programs = &mut self.programs;
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|block| {
                Some(block)
                    .filter(|y| !y.marked_bad)
                    .map(|block| SimBlockMut {
                        block,
                        program_budget,
                        programs,
                    })
            })
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for SimBlockMut<'_> {
    fn page_count(&self) -> u32 {
        self.block.page_count
    }
    fn page_size(&self) -> usize {
        self.block.page_size
    }
    fn spare_size(&self) -> usize {
        self.block.spare_size
    }

    fn read(
        &self,
        page: u32,
        data: Option<&mut [u8]>,
        spare: &mut [u8],
    ) -> anyhow::Result<IoStatus> {
        self.block.read_page(page, data, spare)
    }

    fn program(&mut self, page: u32, data: Option<&[u8]>, spare: &[u8]) -> anyhow::Result<()> {
        if let Some(budget) = self.program_budget {
            ensure!(*budget > 0, "simulated power loss");
            *budget -= 1;
        }
        ensure!(!self.block.fail_program, "simulated program failure");

        self.block.program_page(page, data, spare)?;
        *self.programs += 1;
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        ensure!(!self.block.fail_erase, "simulated erase failure");

        self.block.data.clear();
        self.block.spare.clear();
        self.block.read_status.clear();
        self.block.erase_count += 1;

        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        // A failing erase doesn't stop the block from being marked.
        let _ = self.erase();
        self.block.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    spare_bytes_per_page: 32,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let spare_in = [0x00u8, 0x5A];
    let mut data_out = data_in.clone();
    let mut spare_out = [0u8; 4];

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, Some(&data_in), &spare_in).unwrap();

    block.read(1, Some(&mut data_out), &mut spare_out).unwrap();
    assert!(data_out.is_erased());
    assert!(spare_out.is_erased());

    block.read(2, Some(&mut data_out), &mut spare_out).unwrap();
    assert_eq!(data_out, data_in);
    assert_eq!(spare_out, [0x00, 0x5A, 0xFF, 0xFF]);
}

#[test]
fn test_sim_program_only_clears_bits() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut block = nand.block(1).unwrap().unwrap();

    block.program(0, None, &[0xF0]).unwrap();
    block.program(0, None, &[0x3C]).unwrap();

    let mut spare = [0u8; 1];
    block.read(0, None, &mut spare).unwrap();
    assert_eq!(spare, [0x30]);

    block.erase().unwrap();
    block.read(0, None, &mut spare).unwrap();
    assert_eq!(spare, [0xFF]);
}

#[test]
fn test_sim_power_cut() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0u8; TEST_LAYOUT.bytes_per_page];
    nand.set_program_budget(Some(1));

    let mut block = nand.block(0).unwrap().unwrap();
    assert!(block.program(0, Some(&page), &[]).is_ok());
    assert!(block.program(1, Some(&page), &[]).is_err());

    let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];
    block.read(1, Some(&mut out), &mut []).unwrap();
    assert!(out.is_erased());
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x55u8; TEST_LAYOUT.bytes_per_page];
    nand.block(2)?.unwrap().program(3, Some(&page), &[0xFF, 0x12])?;
    nand.block(5)?.unwrap().mark_bad()?;

    let mut image = Vec::new();
    nand.save(&mut image)?;

    let mut loaded = SimNand::new(TEST_LAYOUT);
    loaded.load(&mut &image[..])?;
    assert!(loaded.block(5)?.is_none());

    let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut spare = [0u8; 2];
    loaded.block(2)?.unwrap().read(3, Some(&mut out), &mut spare)?;
    assert_eq!(out, page);
    assert_eq!(spare, [0xFF, 0x12]);

    Ok(())
}
