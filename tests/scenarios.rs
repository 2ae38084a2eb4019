//! End-to-end scenarios against a simulated NAND: truncation, power cuts, blocks failing during
//! garbage collection, and remounting.

use anyhow::Result;

use yaffs2::block::BlockState;
use yaffs2::config::{MAX_FILE_CHUNKS, OBJECTID_ROOT};
use yaffs2::nand::{NandLayout, SimNand};
use yaffs2::{DeviceParams, FlashDevice, GcResult, GcUrgency, YaffsError};

const LAYOUT: NandLayout = NandLayout {
    blocks: 24,
    pages_per_block: 16,
    bytes_per_page: 512,
    spare_bytes_per_page: 32,
};
const CS: usize = 512;

fn params() -> DeviceParams {
    DeviceParams {
        n_reserved_blocks: 3,
        ..Default::default()
    }
}

fn scan_only() -> DeviceParams {
    DeviceParams {
        skip_checkpoint_read: true,
        skip_checkpoint_write: true,
        ..params()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|x| (x as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn test_shrink_drops_tail_chunks() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), params())?;
    let id = dev.create_file(OBJECTID_ROOT, "three", 0o644, 0, 0)?;
    let data = pattern(3 * CS, 1);
    dev.write(id, 0, &data, true)?;
    let first = dev.find_chunk(id, 0)?;
    assert!(first.is_some());

    dev.resize(id, CS as u64)?;
    assert_eq!(dev.find_chunk(id, 0)?, first);
    assert_eq!(dev.find_chunk(id, 1)?, None);
    assert_eq!(dev.find_chunk(id, 2)?, None);
    assert_eq!(dev.read(id, 0, 3 * CS)?, &data[..CS]);

    // The shrink survives a scan
    let mut dev = FlashDevice::mount(dev.into_nand(), scan_only())?;
    let id = dev.lookup(OBJECTID_ROOT, "three")?;
    assert_eq!(dev.get_length(id)?, CS as u64);
    assert_eq!(dev.find_chunk(id, 1)?, None);
    assert_eq!(dev.read(id, 0, 3 * CS)?, &data[..CS]);
    Ok(())
}

#[test]
fn test_file_size_limit() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), scan_only())?;
    let id = dev.create_file(OBJECTID_ROOT, "sparse", 0o644, 0, 0)?;
    let last = u64::from(MAX_FILE_CHUNKS - 1) * CS as u64;
    let limit = u64::from(MAX_FILE_CHUNKS) * CS as u64;

    dev.write(id, 0, b"A", false)?;
    assert_eq!(dev.write(id, last, b"X", false)?, 1);
    assert!(matches!(
        dev.write(id, limit, b"Y", false),
        Err(YaffsError::FileTooBig)
    ));
    assert!(matches!(
        dev.write(id, limit - 1, b"YZ", false),
        Err(YaffsError::FileTooBig)
    ));
    assert!(matches!(
        dev.write(id, u64::MAX, b"Y", false),
        Err(YaffsError::FileTooBig)
    ));
    assert!(matches!(
        dev.resize(id, limit + 1),
        Err(YaffsError::FileTooBig)
    ));
    assert_eq!(dev.get_length(id)?, last + 1);

    // Neither end of the file may alias the other on flash
    let mut dev = FlashDevice::mount(dev.into_nand(), scan_only())?;
    let id = dev.lookup(OBJECTID_ROOT, "sparse")?;
    assert_eq!(dev.get_length(id)?, last + 1);
    assert_eq!(dev.read(id, 0, 1)?, b"A");
    assert_eq!(dev.read(id, last, 1)?, b"X");
    assert_eq!(dev.find_chunk(id, 1)?, None);
    Ok(())
}

#[test]
fn test_power_cut_mid_write() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), scan_only())?;
    let id = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0)?;
    let data = pattern(2 * CS, 7);

    // Only the first of the two chunk programs lands
    dev.nand_mut().set_program_budget(Some(1));
    assert!(dev.write(id, 0, &data, true).is_err());

    let mut nand = dev.into_nand();
    nand.set_program_budget(None);
    let mut dev = FlashDevice::mount(nand, scan_only())?;

    let id = dev.lookup(OBJECTID_ROOT, "f")?;
    assert_eq!(dev.get_length(id)?, CS as u64);
    assert_eq!(dev.read(id, 0, 2 * CS)?, &data[..CS]);
    Ok(())
}

#[test]
fn test_block_goes_bad_during_collection() -> Result<()> {
    let params = DeviceParams {
        gc_chunks_per_step: 2,
        ..scan_only()
    };
    let cpb = LAYOUT.pages_per_block as usize;
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), params)?;

    // Header and 15 data chunks fill the first block; overwriting most of them leaves it with
    // only a few live chunks
    let id = dev.create_file(OBJECTID_ROOT, "f", 0o644, 0, 0)?;
    let data = pattern(cpb * CS, 3);
    dev.write(id, 0, &data, false)?;
    let fresh = pattern(12 * CS, 9);
    dev.write(id, 0, &fresh, false)?;

    let victim = dev.geometry().block_of(dev.find_chunk(id, 12)?.unwrap_or_default());
    let erases = dev.nand().erase_count(victim);

    // Collect until chunk 12 has been moved out
    for _ in 0..cpb {
        let moved = dev
            .find_chunk(id, 12)?
            .is_some_and(|x| dev.geometry().block_of(x) != victim);
        if moved {
            break;
        }
        assert!(matches!(
            dev.gc_step(GcUrgency::Aggressive)?,
            GcResult::InProgress { block, .. } if block == victim
        ));
    }
    assert_eq!(dev.blocks().get(victim).state, BlockState::Collecting);

    dev.nand_mut().inject_bad_block(victim);
    let mut result = dev.gc_step(GcUrgency::Aggressive)?;
    while let GcResult::InProgress { .. } = result {
        result = dev.gc_step(GcUrgency::Aggressive)?;
    }
    assert_eq!(result, GcResult::Retired { block: victim });
    assert_eq!(dev.blocks().get(victim).state, BlockState::Dead);
    assert_eq!(dev.nand().erase_count(victim), erases);

    // What was copied out before the failure is intact
    assert_eq!(dev.read(id, 0, 12 * CS)?, fresh);
    assert_eq!(dev.read(id, 12 * CS as u64, CS)?, &data[12 * CS..13 * CS]);
    Ok(())
}

#[test]
fn test_gc_keeps_data_under_churn() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), scan_only())?;
    let files: Vec<_> = (0..3)
        .map(|i| dev.create_file(OBJECTID_ROOT, &format!("f{i}"), 0o644, 0, 0))
        .collect::<yaffs2::Result<_>>()?;

    // Far more is written than the device holds, so collection has to keep up
    let mut expected = vec![Vec::new(); files.len()];
    for round in 0..40u8 {
        for (i, &id) in files.iter().enumerate() {
            let data = pattern(4 * CS + 100 * i, round ^ i as u8);
            dev.resize(id, 0)?;
            dev.write(id, 0, &data, round % 3 == 0)?;
            expected[i] = data;
        }
        dev.background_step()?;
    }
    assert!(dev.stats().n_gc_blocks > 0);

    for (&id, data) in files.iter().zip(&expected) {
        assert_eq!(&dev.read(id, 0, data.len() + 10)?, data);
    }

    let mut dev = FlashDevice::mount(dev.unmount()?, scan_only())?;
    for (i, data) in expected.iter().enumerate() {
        let id = dev.lookup(OBJECTID_ROOT, &format!("f{i}"))?;
        assert_eq!(&dev.read(id, 0, data.len() + 10)?, data);
    }
    Ok(())
}

fn populate(dev: &mut FlashDevice<SimNand>) -> Result<Vec<u8>> {
    let dir = dev.create_dir(OBJECTID_ROOT, "dir", 0o755, 1000, 1000)?;
    let file = dev.create_file(dir, "file", 0o600, 1000, 1000)?;
    let data = pattern(5 * CS + 17, 42);
    dev.write(file, 0, &data, false)?;
    dev.create_symlink(OBJECTID_ROOT, "link", 0o777, 0, 0, "dir/file")?;
    dev.create_hardlink(OBJECTID_ROOT, "hard", file)?;
    dev.create_special(dir, "null", 0o020666, 0, 0, 0x0103)?;
    let doomed = dev.create_file(OBJECTID_ROOT, "doomed", 0o644, 0, 0)?;
    dev.write(doomed, 0, &data, false)?;
    dev.unlink(OBJECTID_ROOT, "doomed")?;
    Ok(data)
}

fn check(dev: &mut FlashDevice<SimNand>, data: &[u8]) -> Result<()> {
    let file = dev.lookup_path("/dir/file")?;
    assert_eq!(dev.read(file, 0, data.len() + 1)?, data);
    assert_eq!(dev.get_attributes(file)?.uid, 1000);
    assert_eq!(dev.get_link_count(file)?, 2);

    let hard = dev.lookup(OBJECTID_ROOT, "hard")?;
    assert_eq!(dev.get_inode_number(hard)?, file);
    let link = dev.lookup(OBJECTID_ROOT, "link")?;
    assert_eq!(dev.get_alias(link)?, "dir/file");
    assert!(dev.lookup(OBJECTID_ROOT, "doomed").is_err());

    let names: Vec<String> = dev
        .read_dir(OBJECTID_ROOT)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, ["dir", "hard", "link", "lost+found"]);
    Ok(())
}

#[test]
fn test_remount_from_checkpoint() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), params())?;
    let data = populate(&mut dev)?;
    let nand = dev.unmount()?;

    let mut dev = FlashDevice::mount(nand, params())?;
    assert!(dev.has_checkpoint());
    assert!(dev
        .blocks()
        .iter()
        .any(|(_, x)| x.state == BlockState::Checkpoint));
    check(&mut dev, &data)?;

    // A change and another remount still agree
    let file = dev.lookup_path("/dir/file")?;
    dev.write(file, 0, b"changed", true)?;
    assert!(!dev.has_checkpoint());
    let mut expected = data.clone();
    expected[..7].copy_from_slice(b"changed");

    let mut dev = FlashDevice::mount(dev.unmount()?, params())?;
    assert!(dev.has_checkpoint());
    check(&mut dev, &expected)?;
    Ok(())
}

#[test]
fn test_remount_by_scan() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), params())?;
    let data = populate(&mut dev)?;
    let nand = dev.unmount()?;

    let mut dev = FlashDevice::mount(nand, scan_only())?;
    assert!(!dev.has_checkpoint());
    check(&mut dev, &data)?;

    // Without syncing first: the file size comes from its data chunks
    let file = dev.lookup_path("/dir/file")?;
    dev.write(file, data.len() as u64, b"tail", false)?;
    let mut dev = FlashDevice::mount(dev.into_nand(), scan_only())?;
    let file = dev.lookup_path("/dir/file")?;
    assert_eq!(dev.get_length(file)?, data.len() as u64 + 4);
    Ok(())
}

#[test]
fn test_image_round_trip() -> Result<()> {
    let mut dev = FlashDevice::format(SimNand::new(LAYOUT), params())?;
    let data = populate(&mut dev)?;
    let nand = dev.unmount()?;

    let mut image = tempfile::tempfile()?;
    nand.save(&mut image)?;
    std::io::Seek::rewind(&mut image)?;
    let mut nand = SimNand::new(LAYOUT);
    nand.load(&mut image)?;

    let mut dev = FlashDevice::mount(nand, params())?;
    check(&mut dev, &data)?;
    Ok(())
}
