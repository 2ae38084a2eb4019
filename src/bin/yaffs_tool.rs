//! A tool for inspecting and manipulating a filesystem on NAND, either a simulated one backed by
//! an image file or (on Linux) a real MTD device.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use yaffs2::nand::mtd::MtdNand;
use yaffs2::{
    nand::{Nand, NandLayout, SimNand},
    util::{copy_in, copy_out, open_or_create},
    DeviceParams, FlashDevice, GcResult, GcUrgency, ObjectId, ObjectType,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)?;
                }
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                NandImpl::Mtd(mtd)
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

impl NandImpl {
    fn run(self, cmd: Command, params: DeviceParams) -> Result<Self> {
        Ok(match self {
            NandImpl::Sim(nand) => NandImpl::Sim(cmd.execute(nand, params)?),

            #[cfg(target_os = "linux")]
            NandImpl::Mtd(nand) => NandImpl::Mtd(cmd.execute(nand, params)?),
        })
    }
}

#[derive(Args, Debug)]
struct MountOptions {
    /// First block of the filesystem
    #[clap(long, default_value_t = 0)]
    start_block: u32,

    /// Last block of the filesystem; defaults to the last block of the NAND
    #[clap(long)]
    end_block: Option<u32>,

    /// Neither read nor write a checkpoint
    #[clap(long)]
    no_checkpoint: bool,
}

impl From<&MountOptions> for DeviceParams {
    fn from(value: &MountOptions) -> Self {
        DeviceParams {
            start_block: value.start_block,
            end_block: value.end_block,
            skip_checkpoint_read: value.no_checkpoint,
            skip_checkpoint_write: value.no_checkpoint,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Erase every good block, leaving an empty filesystem
    Format,

    /// Print the state of every block and the device counters
    Overview,

    /// List a directory
    Ls { path: String },

    /// Copy a host file in
    Put { source: PathBuf, dest: String },

    /// Copy a file out to the host
    Get { source: String, dest: PathBuf },

    /// Create a directory
    Mkdir { path: String },

    /// Remove a file or an empty directory
    Rm { path: String },

    /// Rename or move an entry
    Mv { from: String, to: String },

    /// Create a link at `path` to `target`
    Ln {
        target: String,
        path: String,

        /// Make a symbolic link instead of a hard one
        #[clap(short, long)]
        symbolic: bool,
    },

    /// Change the length of a file
    Truncate { path: String, size: u64 },

    /// Run garbage collection steps
    Gc {
        /// Maximum number of steps
        #[clap(long, default_value_t = 100)]
        steps: u32,

        /// Collect any block with stale chunks, not just mostly-stale ones
        #[clap(long)]
        aggressive: bool,
    },

    /// Show an object's attributes
    Stat { path: String },
}

/// Split a path into its parent directory and final component
fn split_path(path: &str) -> Result<(&str, &str)> {
    let path = path.trim_end_matches('/');
    match path.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        None if !path.is_empty() => Ok(("", path)),
        _ => Err(anyhow!("{path:?} has no final component")),
    }
}

fn parent_and_name<N: Nand>(dev: &FlashDevice<N>, path: &str) -> Result<(ObjectId, String)> {
    let (parent, name) = split_path(path)?;
    Ok((dev.lookup_path(parent)?, name.to_string()))
}

impl Command {
    fn execute<N: Nand>(self, nand: N, params: DeviceParams) -> Result<N> {
        if let Command::Format = self {
            let dev = FlashDevice::format(nand, params)?;
            println!("{} blocks erased", dev.blocks().n_erased());
            return Ok(dev.unmount()?);
        }

        let mut dev = FlashDevice::mount(nand, params)?;
        match self {
            Command::Format => unreachable!(),

            Command::Overview => {
                for (block, info) in dev.blocks().iter() {
                    println!(
                        "{block:4} => {:?} seq={:#x} live={}{}",
                        info.state,
                        info.seq_number,
                        info.pages_in_use,
                        if info.needs_retiring { " (retiring)" } else { "" }
                    );
                }
                println!("{:#?}", dev.stats());
                println!("checkpoint: {}", dev.has_checkpoint());
            }

            Command::Ls { path } => {
                let dir = dev.lookup_path(&path)?;
                for (name, id) in dev.read_dir(dir)? {
                    let obj_type = dev.get_type(id)?;
                    let length = dev.get_length(id)?;
                    match obj_type {
                        ObjectType::Symlink => {
                            println!("{id:6} {obj_type:?} {name} -> {}", dev.get_alias(id)?)
                        }
                        _ => println!("{id:6} {obj_type:?} {length:10} {name}"),
                    }
                }
            }

            Command::Put { source, dest } => {
                let (parent, name) = parent_and_name(&dev, &dest)?;
                let id = open_or_create(&mut dev, parent, &name)?;
                let copied = copy_in(&mut dev, id, &mut File::open(source)?)?;
                println!("{copied} bytes written");
            }

            Command::Get { source, dest } => {
                let id = dev.lookup_path(&source)?;
                let copied = copy_out(&mut dev, id, &mut File::create(dest)?)?;
                println!("{copied} bytes read");
            }

            Command::Mkdir { path } => {
                let (parent, name) = parent_and_name(&dev, &path)?;
                dev.create_dir(parent, &name, 0o755, 0, 0)?;
            }

            Command::Rm { path } => {
                let (parent, name) = parent_and_name(&dev, &path)?;
                dev.unlink(parent, &name)?;
            }

            Command::Mv { from, to } => {
                let (old_dir, old_name) = parent_and_name(&dev, &from)?;
                let (new_dir, new_name) = parent_and_name(&dev, &to)?;
                dev.rename(old_dir, &old_name, new_dir, &new_name)?;
            }

            Command::Ln {
                target,
                path,
                symbolic,
            } => {
                let (parent, name) = parent_and_name(&dev, &path)?;
                if symbolic {
                    dev.create_symlink(parent, &name, 0o777, 0, 0, &target)?;
                } else {
                    let target = dev.lookup_path(&target)?;
                    dev.create_hardlink(parent, &name, target)?;
                }
            }

            Command::Truncate { path, size } => {
                let id = dev.lookup_path(&path)?;
                dev.resize(id, size)?;
            }

            Command::Gc { steps, aggressive } => {
                let urgency = match aggressive {
                    true => GcUrgency::Aggressive,
                    false => GcUrgency::Passive,
                };
                for _ in 0..steps {
                    match dev.gc_step(urgency)? {
                        GcResult::Idle => break,
                        result => println!("{result:?}"),
                    }
                }
            }

            Command::Stat { path } => {
                let id = dev.lookup_path(&path)?;
                let attrs = dev.get_attributes(id)?;
                println!("name:   {}", dev.get_name(id)?);
                println!("inode:  {}", dev.get_inode_number(id)?);
                println!("type:   {:?}", dev.get_type(id)?);
                println!("length: {}", dev.get_length(id)?);
                println!("links:  {}", dev.get_link_count(id)?);
                println!("mode:   {:o}", attrs.mode);
                println!("owner:  {}:{}", attrs.uid, attrs.gid);
                println!(
                    "times:  a={} m={} c={}",
                    attrs.atime, attrs.mtime, attrs.ctime
                );
            }
        };

        Ok(dev.unmount()?)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    mount: MountOptions,

    /// The command to run against the filesystem
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let nand = nand.run(args.cmd, DeviceParams::from(&args.mount))?;
    args.nand.cleanup(nand)?;
    Ok(())
}

#[test]
fn test_split_path() -> Result<()> {
    assert_eq!(split_path("/a/b")?, ("/a", "b"));
    assert_eq!(split_path("b")?, ("", "b"));
    assert_eq!(split_path("/a/")?, ("", "a"));
    assert!(split_path("/").is_err());
    Ok(())
}
