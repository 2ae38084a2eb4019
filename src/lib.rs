//! A YAFFS2-style log-structured filesystem over raw NAND flash.
//!
//! Objects (files, directories, symlinks, hardlinks and special files) live in chunks tagged with
//! their owner, so the whole tree can be rebuilt from flash by a scan, or loaded from a
//! checkpoint when one is current. [FlashDevice] is the entry point.

pub mod alloc;
pub mod block;
pub mod buffers;
pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod gc;
pub mod header;
pub mod nand;
pub mod object;
pub mod scan;
pub mod tags;
pub mod tnode;
pub mod util;

pub use config::{DeviceParams, Geometry};
pub use device::{DeviceStats, FlashDevice};
pub use error::{Result, YaffsError};
pub use gc::{GcResult, GcUrgency};
pub use header::{Attributes, ObjectType};
pub use object::ObjectId;
