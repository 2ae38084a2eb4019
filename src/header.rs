//! This module contains the code necessary to read and write object headers, with CRC
//! verification/computation.
//!
//! An object header is the data of the chunk with chunk id 0 of an object. It is self-describing:
//! type, parent, name, attributes, size and the variant-specific fields all live in it, so a scan
//! can rebuild the object from its newest header alone.

use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use crate::config::{MAX_ALIAS_LENGTH, MAX_NAME_LENGTH};
use crate::error::{self, YaffsError};

pub const HEADER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The kinds of filesystem object
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone, Hash)]
pub enum ObjectType {
    /// An object seen only through its data chunks, before any header was read
    #[default]
    Unknown,
    File,
    Symlink,
    Directory,
    Hardlink,
    Special,
}

impl From<ObjectType> for u8 {
    fn from(value: ObjectType) -> Self {
        match value {
            ObjectType::Unknown => 0,
            ObjectType::File => 1,
            ObjectType::Symlink => 2,
            ObjectType::Directory => 3,
            ObjectType::Hardlink => 4,
            ObjectType::Special => 5,
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::File),
            2 => Ok(Self::Symlink),
            3 => Ok(Self::Directory),
            4 => Ok(Self::Hardlink),
            5 => Ok(Self::Special),
            _ => Err(()),
        }
    }
}

impl ObjectType {
    /// Decode a type field, treating out-of-range values as `Unknown`
    pub fn from_bits(value: u8) -> Self {
        value.try_into().unwrap_or_default()
    }
}

/// POSIX-ish attributes carried by every object
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Attributes {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl Attributes {
    /// Attributes for a new object, with all timestamps set to now
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = now();
        Self {
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Seconds since the epoch, as stored in headers
pub fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |x| x.as_secs() as u32)
}

/// The raw on-flash layout of an object header
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(magic = b"YOH1", endian = "little")]
struct RawObjectHeader {
    obj_type: u8,
    parent_id: u32,
    name_len: u16,
    #[deku(count = "name_len")]
    name: Vec<u8>,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: u32,
    mtime: u32,
    ctime: u32,
    file_size: u64,
    equiv_id: u32,
    rdev: u32,
    is_shrink: u8,
    shadows_obj: u32,
    alias_len: u16,
    #[deku(count = "alias_len")]
    alias: Vec<u8>,
    hdr_crc: u32,
}

/// Computes the CRC of a raw record, which covers everything but the trailing CRC field
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        let bytes = self.to_bytes().unwrap_or_default();
        let len = bytes.len().saturating_sub(std::mem::size_of::<u32>());
        HEADER_CRC.checksum(&bytes[..len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for RawObjectHeader {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// This represents an object header as the rest of the crate works with it
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct ObjectHeader {
    pub obj_type: ObjectType,
    pub parent_id: u32,
    pub name: String,
    pub attrs: Attributes,

    /// File size; 0 for everything but files
    pub file_size: u64,

    /// For hardlinks, the object linked to
    pub equiv_id: u32,

    /// For specials, the device number
    pub rdev: u32,

    /// For symlinks, the target
    pub alias: String,

    /// Written by a truncation
    pub is_shrink: bool,

    /// Id of an object this header replaces by rename
    pub shadows_obj: Option<u32>,
}

impl ObjectHeader {
    /// Convert from a chunk's data
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, raw) = RawObjectHeader::from_bytes((bytes, 0)).ok()?;
        if !raw.check_crc() {
            return None;
        }
        raw.try_into().ok()
    }

    /// Write into a chunk's data buffer; the rest of the buffer is filled with 0xFF
    pub fn encode(&self, out_bytes: &mut [u8]) -> error::Result<()> {
        if self.name.len() > MAX_NAME_LENGTH {
            return Err(YaffsError::NameTooLong);
        }
        if self.alias.len() > MAX_ALIAS_LENGTH {
            return Err(YaffsError::NameTooLong);
        }

        let bytes = RawObjectHeader::from(self)
            .to_bytes()
            .map_err(|_| YaffsError::Corrupt("object header failed to serialize"))?;
        out_bytes
            .get_mut(..bytes.len())
            .ok_or(YaffsError::NameTooLong)?
            .copy_from_slice(&bytes);
        out_bytes[bytes.len()..].fill(0xFF);
        Ok(())
    }
}

impl TryFrom<RawObjectHeader> for ObjectHeader {
    type Error = ();

    fn try_from(value: RawObjectHeader) -> std::result::Result<Self, Self::Error> {
        let RawObjectHeader {
            obj_type,
            parent_id,
            name,
            mode,
            uid,
            gid,
            atime,
            mtime,
            ctime,
            file_size,
            equiv_id,
            rdev,
            is_shrink,
            shadows_obj,
            alias,
            ..
        } = value;

        let obj_type = obj_type.try_into()?;
        let name = String::from_utf8(name).map_err(|_| ())?;
        let alias = String::from_utf8(alias).map_err(|_| ())?;
        let shadows_obj = Some(shadows_obj).filter(|&x| x != 0);

        Ok(Self {
            obj_type,
            parent_id,
            name,
            attrs: Attributes {
                mode,
                uid,
                gid,
                atime,
                mtime,
                ctime,
            },
            file_size,
            equiv_id,
            rdev,
            alias,
            is_shrink: is_shrink != 0,
            shadows_obj,
        })
    }
}

impl From<&ObjectHeader> for RawObjectHeader {
    fn from(value: &ObjectHeader) -> RawObjectHeader {
        let ObjectHeader {
            obj_type,
            parent_id,
            name,
            attrs,
            file_size,
            equiv_id,
            rdev,
            alias,
            is_shrink,
            shadows_obj,
        } = value;

        let mut target = Self {
            obj_type: (*obj_type).into(),
            parent_id: *parent_id,
            name_len: name.len() as u16,
            name: name.as_bytes().to_vec(),
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            file_size: *file_size,
            equiv_id: *equiv_id,
            rdev: *rdev,
            is_shrink: (*is_shrink).into(),
            shadows_obj: shadows_obj.unwrap_or(0),
            alias_len: alias.len() as u16,
            alias: alias.as_bytes().to_vec(),
            hdr_crc: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let header = ObjectHeader {
        obj_type: ObjectType::Symlink,
        parent_id: 1,
        name: "example".to_string(),
        attrs: Attributes::new(0o120777, 1000, 1000),
        alias: "/some/where".to_string(),
        shadows_obj: Some(0x321),
        ..Default::default()
    };

    let mut buf = vec![0u8; 512];
    header.encode(&mut buf)?;
    assert_eq!(ObjectHeader::decode(&buf), Some(header));
    assert_eq!(buf[511], 0xFF);

    Ok(())
}

#[test]
fn test_decode_rejects_damage() -> anyhow::Result<()> {
    let header = ObjectHeader {
        obj_type: ObjectType::File,
        parent_id: 1,
        name: "file".to_string(),
        file_size: 12345,
        ..Default::default()
    };

    let mut buf = vec![0u8; 512];
    header.encode(&mut buf)?;
    buf[12] ^= 0x10;
    assert_eq!(ObjectHeader::decode(&buf), None);

    assert_eq!(ObjectHeader::decode(&[0xFF; 512]), None);
    Ok(())
}

#[test]
fn test_encode_rejects_long_names() {
    let header = ObjectHeader {
        name: "x".repeat(MAX_NAME_LENGTH + 1),
        ..Default::default()
    };
    let mut buf = vec![0u8; 512];
    assert!(matches!(
        header.encode(&mut buf),
        Err(YaffsError::NameTooLong)
    ));
}
