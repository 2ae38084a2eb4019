//! Useful traits and other utilities that don't really belong anywhere else, mostly for moving
//! files between the host and a [FlashDevice].

use std::io::{self, Read, Write};

use crate::device::FlashDevice;
use crate::error::Result;
use crate::nand::Nand;
use crate::object::ObjectId;

/// How much is moved per call when copying files in and out
const COPY_CHUNK: usize = 65536;

pub trait ReadExt {
    /// Tries to read exactly `read_len` bytes, like `read_exact`, but unlike `read_exact`, is
    /// forgiving of unexpected EOF.
    ///
    /// The returned vector will have exactly `read_len` bytes appended, unless an EOF was
    /// encountered, in which case it will have strictly shorter than `read_len` new bytes added.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        while cursor < read_len {
            vec.resize(read_len, 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                // EOF: the final size is `cursor`
                Ok(0) => break,

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }
        vec.truncate(cursor);
        Ok(())
    }
}

/// Copy everything `image` yields into file `id`, starting at offset 0. Returns the number of
/// bytes copied.
pub fn copy_in<N: Nand, R: Read>(
    dev: &mut FlashDevice<N>,
    id: ObjectId,
    image: &mut R,
) -> anyhow::Result<u64> {
    let mut offset = 0;
    let mut data = Vec::with_capacity(COPY_CHUNK);
    loop {
        data.clear();
        image.read_to_vec(&mut data, COPY_CHUNK)?;
        if data.is_empty() {
            break;
        }
        offset += dev.write(id, offset, &data, false)? as u64;
    }
    dev.flush(id, false, false)?;
    Ok(offset)
}

/// Copy the whole of file `id` to `out`. Returns the number of bytes copied.
pub fn copy_out<N: Nand, W: Write>(
    dev: &mut FlashDevice<N>,
    id: ObjectId,
    out: &mut W,
) -> anyhow::Result<u64> {
    let length = dev.get_length(id)?;
    let mut offset = 0;
    while offset < length {
        let data = dev.read(id, offset, COPY_CHUNK)?;
        if data.is_empty() {
            break;
        }
        out.write_all(&data)?;
        offset += data.len() as u64;
    }
    Ok(offset)
}

/// Find `name` in `dir`, creating it as an empty file if it doesn't exist
pub fn open_or_create<N: Nand>(
    dev: &mut FlashDevice<N>,
    dir: ObjectId,
    name: &str,
) -> Result<ObjectId> {
    match dev.lookup(dir, name) {
        Ok(id) => {
            dev.resize(id, 0)?;
            Ok(id)
        }
        Err(crate::error::YaffsError::NotFound) => dev.create_file(dir, name, 0o644, 0, 0),
        Err(e) => Err(e),
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_copy_in_and_out() -> anyhow::Result<()> {
    let mut dev = crate::device::test::fresh();
    let root = crate::config::OBJECTID_ROOT;
    let image: Vec<u8> = (0..5000u32).map(|x| (x * 7) as u8).collect();

    let id = open_or_create(&mut dev, root, "image")?;
    assert_eq!(copy_in(&mut dev, id, &mut &image[..])?, 5000);

    let mut out = Vec::new();
    assert_eq!(copy_out(&mut dev, id, &mut out)?, 5000);
    assert_eq!(out, image);

    // Copying in again replaces the content
    let id = open_or_create(&mut dev, root, "image")?;
    copy_in(&mut dev, id, &mut &b"short"[..])?;
    assert_eq!(dev.get_length(id)?, 5);
    Ok(())
}
