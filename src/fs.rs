//! The filesystem-facing API: what a VFS shim would call.
//!
//! Every call that changes durable state writes a fresh header for the object it changes. File
//! data goes straight to flash; only the header (size, times) may lag behind until the next
//! [FlashDevice::flush] or [FlashDevice::sync], and a scan recovers the size from the data
//! chunks in that case.

use log::debug;

use crate::config::{
    MAX_ALIAS_LENGTH, MAX_FILE_CHUNKS, MAX_NAME_LENGTH, OBJECTID_DELETED, OBJECTID_ROOT,
    OBJECTID_UNLINKED,
};
use crate::device::FlashDevice;
use crate::error::{Result, YaffsError};
use crate::header::{now, Attributes, ObjectType};
use crate::nand::{IoStatus, Nand};
use crate::object::{Object, ObjectId, Variant, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::tags::ExtendedTags;

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(YaffsError::InvalidName);
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(YaffsError::NameTooLong);
    }
    Ok(())
}

impl<N: Nand> FlashDevice<N> {
    /// A directory to create in or look up from
    fn dir(&self, id: ObjectId) -> Result<&Object> {
        let obj = self.objects.get(id)?;
        match obj.children() {
            Some(_) => Ok(obj),
            None => Err(YaffsError::NotDirectory),
        }
    }

    /// Refuse to let a file reach `end` bytes if its last chunk id wouldn't fit in the tags
    fn check_extent(&self, end: u64) -> Result<()> {
        let cs = self.geometry.bytes_per_chunk as u64;
        if end.div_ceil(cs) > u64::from(MAX_FILE_CHUNKS) {
            return Err(YaffsError::FileTooBig);
        }
        Ok(())
    }

    /// The file behind `id`, following a hardlink
    fn file_target(&self, id: ObjectId) -> Result<ObjectId> {
        let id = self.objects.resolve(id)?;
        match self.objects.get(id)?.variant {
            Variant::File(_) => Ok(id),
            Variant::Directory(_) => Err(YaffsError::IsDirectory),
            _ => Err(YaffsError::NotPermitted),
        }
    }

    fn create_object(
        &mut self,
        parent: ObjectId,
        name: &str,
        attrs: Attributes,
        variant: Variant,
    ) -> Result<ObjectId> {
        check_name(name)?;
        self.dir(parent)?;
        if self.objects.find_child(parent, name).is_some() {
            return Err(YaffsError::Exists);
        }

        let id = self.objects.new_object_id()?;
        let mut obj = Object::new(id, variant.obj_type());
        obj.name = name.to_string();
        obj.attrs = attrs;
        obj.variant = variant;
        self.objects.insert(obj);
        self.objects.link_child(parent, id)?;

        if let Err(e) = self.write_header(id, false, None) {
            self.objects.unlink_child(id)?;
            self.objects.remove(id);
            return Err(e);
        }
        debug!("created object {id} {name:?} in {parent}");
        Ok(id)
    }

    pub fn create_file(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<ObjectId> {
        let attrs = Attributes::new(S_IFREG | (mode & !S_IFMT), uid, gid);
        self.create_object(parent, name, attrs, Variant::for_type(ObjectType::File))
    }

    pub fn create_dir(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<ObjectId> {
        let attrs = Attributes::new(S_IFDIR | (mode & !S_IFMT), uid, gid);
        self.create_object(parent, name, attrs, Variant::for_type(ObjectType::Directory))
    }

    pub fn create_symlink(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        alias: &str,
    ) -> Result<ObjectId> {
        if alias.len() > MAX_ALIAS_LENGTH {
            return Err(YaffsError::NameTooLong);
        }
        let attrs = Attributes::new(S_IFLNK | (mode & !S_IFMT), uid, gid);
        self.create_object(parent, name, attrs, Variant::Symlink(alias.to_string()))
    }

    /// Create a device node, FIFO or socket; `mode` carries the type bits
    pub fn create_special(
        &mut self,
        parent: ObjectId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
    ) -> Result<ObjectId> {
        let attrs = Attributes::new(mode, uid, gid);
        self.create_object(parent, name, attrs, Variant::Special(rdev))
    }

    /// Give `target` another name. Directories can't be hardlinked.
    pub fn create_hardlink(
        &mut self,
        parent: ObjectId,
        name: &str,
        target: ObjectId,
    ) -> Result<ObjectId> {
        let target = self.objects.resolve(target)?;
        let target_obj = self.objects.get(target)?;
        if target_obj.children().is_some() || target_obj.fake {
            return Err(YaffsError::NotPermitted);
        }

        let attrs = target_obj.attrs;
        let id = self.create_object(parent, name, attrs, Variant::Hardlink(target))?;
        self.objects.get_mut(target)?.hard_links.push(id);
        Ok(id)
    }

    /// Write `data` at `offset`, returning the number of bytes written. With `sync` the header is
    /// brought up to date as well.
    pub fn write(&mut self, id: ObjectId, offset: u64, data: &[u8], sync: bool) -> Result<usize> {
        let id = self.file_target(id)?;
        let cs = self.geometry.bytes_per_chunk;
        if !data.is_empty() {
            let end = offset
                .checked_add(data.len() as u64)
                .ok_or(YaffsError::FileTooBig)?;
            self.check_extent(end)?;
        }

        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let idx = u32::try_from(pos / cs as u64).map_err(|_| YaffsError::FileTooBig)?;
            let start = (pos % cs as u64) as usize;
            let n = (cs - start).min(data.len() - done);

            let mut buf = self.buffers.acquire();
            let result = self.write_data_chunk(id, idx, start, &data[done..done + n], &mut buf);
            self.buffers.release(buf);
            result?;

            done += n;
        }

        let obj = self.objects.get_mut(id)?;
        obj.attrs.mtime = now();
        obj.dirty = true;
        if sync {
            self.write_header(id, false, None)?;
        }
        Ok(done)
    }

    /// Replace chunk `idx` of a file with one carrying `piece` at `start`, merging in the bytes of
    /// the old chunk around it
    fn write_data_chunk(
        &mut self,
        id: ObjectId,
        idx: u32,
        start: usize,
        piece: &[u8],
        buf: &mut [u8],
    ) -> Result<()> {
        let cs = self.geometry.bytes_per_chunk;
        let (size, existing) = match self.objects.get(id)?.file() {
            Some(file) => (file.size, file.tree.find(idx)),
            None => return Err(YaffsError::NotPermitted),
        };
        let chunk_base = u64::from(idx) * cs as u64;
        let old_len = size.saturating_sub(chunk_base).min(cs as u64) as usize;

        if let Some(chunk) = existing.filter(|_| start > 0 || piece.len() < old_len) {
            let read = self.read_chunk(chunk, Some(&mut *buf))?;
            if read.data_ecc == IoStatus::EccUnfixed {
                return Err(YaffsError::EccUnfixed { chunk });
            }
            buf[old_len..].fill(0);
        }

        buf[start..start + piece.len()].copy_from_slice(piece);
        let n_bytes = old_len.max(start + piece.len());
        let tags = ExtendedTags::new(id, idx + 1, n_bytes as u32, 0);
        let chunk = self.write_new_chunk(buf, tags, false)?;

        let file = self
            .objects
            .get_mut(id)?
            .file_mut()
            .ok_or(YaffsError::NotPermitted)?;
        let previous = file.tree.put(&mut self.tnodes, idx, chunk)?;
        file.size = file.size.max(chunk_base + n_bytes as u64);
        if let Some(previous) = previous {
            self.delete_chunk(previous)?;
        }
        Ok(())
    }

    /// Read up to `len` bytes from `offset`. Reads stop at the end of the file; holes read as
    /// zeros.
    pub fn read(&mut self, id: ObjectId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let id = self.file_target(id)?;
        let cs = self.geometry.bytes_per_chunk as u64;
        let size = self.objects.get(id)?.size();

        let end = size.min(offset.saturating_add(len as u64));
        if offset >= end {
            return Ok(Vec::new());
        }
        let mut out = vec![0; (end - offset) as usize];

        let mut buf = self.buffers.acquire();
        let mut result = Ok(());
        let mut pos = offset;
        while pos < end {
            let idx = (pos / cs) as u32;
            let start = (pos % cs) as usize;
            let n = (cs - start as u64).min(end - pos) as usize;
            let at = (pos - offset) as usize;

            let chunk = self
                .objects
                .find(id)
                .and_then(|x| x.file())
                .and_then(|x| x.tree.find(idx));
            if let Some(chunk) = chunk {
                match self.read_chunk(chunk, Some(&mut buf[..])) {
                    Ok(read) if read.data_ecc == IoStatus::EccUnfixed => {
                        result = Err(YaffsError::EccUnfixed { chunk });
                        break;
                    }
                    Ok(_) => out[at..at + n].copy_from_slice(&buf[start..start + n]),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            pos += n as u64;
        }
        self.buffers.release(buf);

        result.map(|()| out)
    }

    /// Truncate or extend a file. Shrinking writes a shrink header, so a scan knows to drop the
    /// chunks beyond the new end.
    pub fn resize(&mut self, id: ObjectId, new_size: u64) -> Result<()> {
        let id = self.file_target(id)?;
        let cs = self.geometry.bytes_per_chunk as u64;
        let size = self.objects.get(id)?.size();
        self.check_extent(new_size)?;

        if new_size < size {
            let n_chunks =
                u32::try_from(new_size.div_ceil(cs)).map_err(|_| YaffsError::FileTooBig)?;
            let freed = match self.objects.get_mut(id)?.file_mut() {
                Some(file) => {
                    file.size = new_size;
                    file.tree.resize_down(&mut self.tnodes, n_chunks)
                }
                None => Vec::new(),
            };
            for chunk in freed {
                self.delete_chunk(chunk)?;
            }

            // The tail of a partial last chunk must read as zeros if the file grows again
            let tail = (new_size % cs) as usize;
            let last = self
                .objects
                .get(id)?
                .file()
                .and_then(|x| x.tree.find(n_chunks.saturating_sub(1)));
            if tail != 0 && last.is_some() {
                let mut buf = self.buffers.acquire();
                let result = self.rewrite_tail(id, n_chunks - 1, tail, &mut buf);
                self.buffers.release(buf);
                result?;
            }
        } else if let Some(file) = self.objects.get_mut(id)?.file_mut() {
            file.size = new_size;
        }

        let obj = self.objects.get_mut(id)?;
        obj.attrs.mtime = now();
        obj.dirty = true;
        self.write_header(id, new_size < size, None)
    }

    fn rewrite_tail(&mut self, id: ObjectId, idx: u32, len: usize, buf: &mut [u8]) -> Result<()> {
        let Some(chunk) = self.chunk_of(id, idx + 1) else {
            return Ok(());
        };
        let read = self.read_chunk(chunk, Some(&mut *buf))?;
        if read.data_ecc == IoStatus::EccUnfixed {
            return Err(YaffsError::EccUnfixed { chunk });
        }
        buf[len..].fill(0);

        let tags = ExtendedTags::new(id, idx + 1, len as u32, 0);
        let new_chunk = self.write_new_chunk(buf, tags, false)?;
        if let Some(file) = self.objects.get_mut(id)?.file_mut() {
            file.tree.put(&mut self.tnodes, idx, new_chunk)?;
        }
        self.delete_chunk(chunk)
    }

    /// Remove the entry `name` from `dir`
    pub fn unlink(&mut self, dir: ObjectId, name: &str) -> Result<()> {
        self.dir(dir)?;
        let id = self
            .objects
            .find_child(dir, name)
            .ok_or(YaffsError::NotFound)?;
        self.remove_entry(id)
    }

    /// Take an object out of the namespace, deleting it unless something still refers to it
    fn remove_entry(&mut self, id: ObjectId) -> Result<()> {
        let obj = self.objects.get(id)?;
        if obj.fake {
            return Err(YaffsError::NotPermitted);
        }
        if obj.children().is_some_and(|x| !x.is_empty()) {
            return Err(YaffsError::NotEmpty);
        }
        if let Variant::Hardlink(_) = obj.variant {
            return self.destroy_object(id);
        }
        if let Some(&link) = obj.hard_links.first() {
            return self.take_over_hardlink(id, link);
        }

        if obj.open_refs > 0 {
            debug!("object {id} unlinked while open");
            let obj = self.objects.get_mut(id)?;
            obj.unlinked = true;
            self.objects.link_child(OBJECTID_UNLINKED, id)?;
            return self.write_header(id, false, None);
        }
        self.delete_unreferenced(id)
    }

    /// The object's own name goes away, but a hardlink to it remains: the object moves into the
    /// hardlink's place, and the header written there shadows the hardlink
    fn take_over_hardlink(&mut self, id: ObjectId, link: ObjectId) -> Result<()> {
        let link_obj = self.objects.get(link)?;
        let parent = link_obj.parent.ok_or(YaffsError::Corrupt("hardlink has no parent"))?;
        let name = link_obj.name.clone();

        self.objects.unlink_child(link)?;
        let link_obj = self.objects.remove(link).ok_or(YaffsError::NotFound)?;
        let obj = self.objects.get_mut(id)?;
        obj.hard_links.retain(|&x| x != link);
        obj.name = name;
        self.objects.link_child(parent, id)?;

        self.write_header(id, false, Some(link))?;
        if let Some(chunk) = link_obj.hdr_chunk {
            self.delete_chunk(chunk)?;
        }
        Ok(())
    }

    /// Delete an object nothing refers to any more. Files with data are soft-deleted: moved to
    /// the deleted directory, with their chunks freed in the background.
    fn delete_unreferenced(&mut self, id: ObjectId) -> Result<()> {
        let has_data = self
            .objects
            .get(id)?
            .file()
            .is_some_and(|x| !x.tree.is_empty());
        if !has_data {
            return self.destroy_object(id);
        }

        debug!("soft-deleting object {id}");
        let obj = self.objects.get_mut(id)?;
        obj.unlinked = true;
        obj.soft_deleted = true;
        self.objects.link_child(OBJECTID_DELETED, id)?;
        self.write_header(id, false, None)
    }

    /// Move (and rename) an entry. An existing entry at the destination is replaced, the new
    /// header shadowing it.
    pub fn rename(
        &mut self,
        old_dir: ObjectId,
        old_name: &str,
        new_dir: ObjectId,
        new_name: &str,
    ) -> Result<()> {
        check_name(new_name)?;
        self.dir(old_dir)?;
        self.dir(new_dir)?;
        let id = self
            .objects
            .find_child(old_dir, old_name)
            .ok_or(YaffsError::NotFound)?;
        let obj = self.objects.get(id)?;
        if obj.fake {
            return Err(YaffsError::NotPermitted);
        }
        let is_dir = obj.children().is_some();
        if is_dir && self.objects.is_ancestor(id, new_dir) {
            return Err(YaffsError::InvalidName);
        }

        let existing = self.objects.find_child(new_dir, new_name);
        if existing == Some(id) {
            return Ok(());
        }
        if let Some(existing) = existing {
            let existing = self.objects.get(existing)?;
            match (is_dir, existing.children()) {
                (_, Some(children)) if !children.is_empty() => return Err(YaffsError::NotEmpty),
                (false, Some(_)) => return Err(YaffsError::IsDirectory),
                (true, None) => return Err(YaffsError::NotDirectory),
                _ => {}
            }
            if existing.fake {
                return Err(YaffsError::NotPermitted);
            }
        }

        let obj = self.objects.get_mut(id)?;
        obj.name = new_name.to_string();
        obj.attrs.ctime = now();
        self.objects.link_child(new_dir, id)?;
        self.write_header(id, false, existing)?;

        if let Some(existing) = existing {
            debug!("rename of {id} replaces {existing}");
            self.remove_entry(existing)?;
        }
        Ok(())
    }

    /// Bring an object's header up to date if it has changed. With `data_sync` only the data
    /// matters, and that is on flash already.
    pub fn flush(&mut self, id: ObjectId, update_time: bool, data_sync: bool) -> Result<()> {
        let id = self.objects.resolve(id)?;
        let obj = self.objects.get_mut(id)?;
        if !obj.dirty || data_sync {
            return Ok(());
        }
        if update_time {
            obj.attrs.mtime = now();
        }
        self.write_header(id, false, None)
    }

    /// Take a reference on an object, keeping it alive if it is unlinked
    pub fn open(&mut self, id: ObjectId) -> Result<()> {
        let id = self.objects.resolve(id)?;
        self.objects.get_mut(id)?.open_refs += 1;
        Ok(())
    }

    /// Drop a reference taken by [Self::open]; an unlinked object goes with its last reference
    pub fn release(&mut self, id: ObjectId) -> Result<()> {
        let id = self.objects.resolve(id)?;
        let obj = self.objects.get_mut(id)?;
        obj.open_refs = obj.open_refs.saturating_sub(1);
        if obj.open_refs == 0 && obj.parent == Some(OBJECTID_UNLINKED) {
            self.delete_unreferenced(id)?;
        }
        Ok(())
    }

    pub fn get_name(&self, id: ObjectId) -> Result<String> {
        Ok(self.objects.get(id)?.name.clone())
    }

    /// Length in bytes: file size, or symlink target length
    pub fn get_length(&self, id: ObjectId) -> Result<u64> {
        let id = self.objects.resolve(id)?;
        Ok(self.objects.get(id)?.size())
    }

    /// The id of the object behind `id`, hardlinks resolved
    pub fn get_inode_number(&self, id: ObjectId) -> Result<ObjectId> {
        self.objects.resolve(id)
    }

    pub fn get_type(&self, id: ObjectId) -> Result<ObjectType> {
        let id = self.objects.resolve(id)?;
        Ok(self.objects.get(id)?.obj_type())
    }

    /// Number of names the object is reachable by
    pub fn get_link_count(&self, id: ObjectId) -> Result<u32> {
        let id = self.objects.resolve(id)?;
        let obj = self.objects.get(id)?;
        Ok(u32::from(!obj.unlinked) + obj.hard_links.len() as u32)
    }

    pub fn lookup(&self, dir: ObjectId, name: &str) -> Result<ObjectId> {
        self.dir(dir)?;
        self.objects
            .find_child(dir, name)
            .ok_or(YaffsError::NotFound)
    }

    /// Resolve a `/`-separated path from the root
    pub fn lookup_path(&self, path: &str) -> Result<ObjectId> {
        path.split('/')
            .filter(|x| !x.is_empty())
            .try_fold(OBJECTID_ROOT, |dir, name| {
                let dir = self.objects.resolve(dir)?;
                self.lookup(dir, name)
            })
    }

    /// Entries of a directory as `(name, id)`, sorted by name
    pub fn read_dir(&self, dir: ObjectId) -> Result<Vec<(String, ObjectId)>> {
        let mut entries: Vec<(String, ObjectId)> = self
            .dir(dir)?
            .children()
            .unwrap_or_default()
            .iter()
            .filter_map(|&id| self.objects.find(id).map(|x| (x.name.clone(), id)))
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// The chunk holding data chunk `chunk_idx` of a file, if there is one
    pub fn find_chunk(&self, id: ObjectId, chunk_idx: u32) -> Result<Option<u32>> {
        let id = self.file_target(id)?;
        Ok(self
            .objects
            .get(id)?
            .file()
            .and_then(|x| x.tree.find(chunk_idx)))
    }

    /// Target of a symlink
    pub fn get_alias(&self, id: ObjectId) -> Result<String> {
        match &self.objects.get(id)?.variant {
            Variant::Symlink(alias) => Ok(alias.clone()),
            _ => Err(YaffsError::InvalidName),
        }
    }

    pub fn get_attributes(&self, id: ObjectId) -> Result<Attributes> {
        let id = self.objects.resolve(id)?;
        Ok(self.objects.get(id)?.attrs)
    }

    /// Set mode, owner and times. The type bits of the mode can't be changed.
    pub fn set_attributes(&mut self, id: ObjectId, attrs: Attributes) -> Result<()> {
        let id = self.objects.resolve(id)?;
        let obj = self.objects.get_mut(id)?;
        let type_bits = obj.attrs.mode & S_IFMT;
        obj.attrs = Attributes {
            mode: type_bits | (attrs.mode & !S_IFMT),
            ..attrs
        };
        obj.dirty = true;
        self.write_header(id, false, None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::device::test::fresh;

    const ROOT: ObjectId = OBJECTID_ROOT;

    #[test]
    fn test_names() -> anyhow::Result<()> {
        let mut dev = fresh();
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(
                dev.create_file(ROOT, name, 0o644, 0, 0),
                Err(YaffsError::InvalidName)
            ));
        }
        assert!(matches!(
            dev.create_file(ROOT, &"n".repeat(256), 0o644, 0, 0),
            Err(YaffsError::NameTooLong)
        ));

        dev.create_file(ROOT, "a", 0o644, 0, 0)?;
        assert!(matches!(
            dev.create_dir(ROOT, "a", 0o755, 0, 0),
            Err(YaffsError::Exists)
        ));
        assert_eq!(dev.objects.len(), 5);
        Ok(())
    }

    #[test]
    fn test_write_and_read_back() -> anyhow::Result<()> {
        let mut dev = fresh();
        let cs = dev.geometry.bytes_per_chunk;
        let id = dev.create_file(ROOT, "f", 0o644, 0, 0)?;

        assert_eq!(dev.write(id, 100, b"hello", false)?, 5);
        assert_eq!(dev.get_length(id)?, 105);
        let data = dev.read(id, 0, 200)?;
        assert_eq!(data.len(), 105);
        assert!(data[..100].iter().all(|&x| x == 0));
        assert_eq!(&data[100..], b"hello");

        // Overwrite across a chunk boundary
        let big = vec![0xA5; cs + 10];
        dev.write(id, cs as u64 - 5, &big, false)?;
        assert_eq!(dev.get_length(id)?, 2 * cs as u64 + 5);
        assert_eq!(&dev.read(id, 100, 5)?, b"hello");
        assert_eq!(dev.read(id, cs as u64 - 5, big.len())?, big);

        // A hole past the end reads as zeros
        dev.write(id, 5 * cs as u64, b"x", true)?;
        assert!(dev.read(id, 3 * cs as u64, cs)?.iter().all(|&x| x == 0));
        assert_eq!(dev.objects.get(id)?.file().unwrap().tree.len(), 4);
        Ok(())
    }

    #[test]
    fn test_resize() -> anyhow::Result<()> {
        let mut dev = fresh();
        let cs = dev.geometry.bytes_per_chunk;
        let id = dev.create_file(ROOT, "f", 0o644, 0, 0)?;
        dev.write(id, 0, &vec![0x11; 3 * cs], false)?;

        dev.resize(id, cs as u64 + 10)?;
        assert_eq!(dev.get_length(id)?, cs as u64 + 10);
        dev.resize(id, 2 * cs as u64)?;
        let data = dev.read(id, 0, 2 * cs)?;
        assert!(data[..cs + 10].iter().all(|&x| x == 0x11));
        assert!(data[cs + 10..].iter().all(|&x| x == 0));
        Ok(())
    }

    #[test]
    fn test_unlink_and_soft_delete() -> anyhow::Result<()> {
        let mut dev = fresh();
        let dir = dev.create_dir(ROOT, "d", 0o755, 0, 0)?;
        let id = dev.create_file(dir, "f", 0o644, 0, 0)?;
        dev.write(id, 0, &[1; 2000], false)?;

        assert!(matches!(dev.unlink(ROOT, "d"), Err(YaffsError::NotEmpty)));
        dev.unlink(dir, "f")?;
        assert!(matches!(dev.lookup(dir, "f"), Err(YaffsError::NotFound)));
        assert_eq!(dev.objects.get(id)?.parent, Some(OBJECTID_DELETED));

        for _ in 0..100 {
            if !dev.background_step()? {
                break;
            }
        }
        assert!(!dev.objects.contains(id));

        dev.unlink(ROOT, "d")?;
        assert!(!dev.objects.contains(dir));
        assert!(matches!(
            dev.unlink(ROOT, "lost+found"),
            Err(YaffsError::NotPermitted)
        ));
        Ok(())
    }

    #[test]
    fn test_unlink_while_open() -> anyhow::Result<()> {
        let mut dev = fresh();
        let id = dev.create_file(ROOT, "f", 0o644, 0, 0)?;
        dev.write(id, 0, b"data", false)?;
        dev.open(id)?;

        dev.unlink(ROOT, "f")?;
        assert_eq!(dev.objects.get(id)?.parent, Some(OBJECTID_UNLINKED));
        assert_eq!(dev.get_link_count(id)?, 0);
        assert_eq!(dev.read(id, 0, 10)?, b"data");

        dev.release(id)?;
        assert_eq!(dev.objects.get(id)?.parent, Some(OBJECTID_DELETED));
        Ok(())
    }

    #[test]
    fn test_hardlinks() -> anyhow::Result<()> {
        let mut dev = fresh();
        let dir = dev.create_dir(ROOT, "d", 0o755, 0, 0)?;
        let id = dev.create_file(ROOT, "f", 0o644, 0, 0)?;
        dev.write(id, 0, b"shared", false)?;
        let link = dev.create_hardlink(dir, "g", id)?;

        assert_eq!(dev.get_inode_number(link)?, id);
        assert_eq!(dev.get_link_count(id)?, 2);
        assert_eq!(dev.read(link, 0, 10)?, b"shared");
        assert!(matches!(
            dev.create_hardlink(ROOT, "dd", dir),
            Err(YaffsError::NotPermitted)
        ));

        // The file takes over the hardlink's name
        dev.unlink(ROOT, "f")?;
        assert_eq!(dev.lookup(dir, "g")?, id);
        assert!(!dev.objects.contains(link));
        assert_eq!(dev.get_link_count(id)?, 1);
        assert_eq!(dev.read(id, 0, 10)?, b"shared");
        Ok(())
    }

    #[test]
    fn test_rename() -> anyhow::Result<()> {
        let mut dev = fresh();
        let a = dev.create_dir(ROOT, "a", 0o755, 0, 0)?;
        let b = dev.create_dir(a, "b", 0o755, 0, 0)?;
        let f = dev.create_file(ROOT, "f", 0o644, 0, 0)?;
        let g = dev.create_file(b, "g", 0o644, 0, 0)?;

        assert!(matches!(
            dev.rename(ROOT, "a", b, "a"),
            Err(YaffsError::InvalidName)
        ));
        assert!(matches!(
            dev.rename(ROOT, "f", ROOT, "a"),
            Err(YaffsError::NotEmpty)
        ));

        dev.rename(ROOT, "f", b, "g")?;
        assert_eq!(dev.lookup(b, "g")?, f);
        assert!(!dev.objects.contains(g));
        assert_eq!(dev.get_name(f)?, "g");
        assert_eq!(dev.lookup_path("/a/b/g")?, f);
        assert_eq!(
            dev.read_dir(ROOT)?,
            vec![("a".to_string(), a), ("lost+found".to_string(), 2)]
        );
        Ok(())
    }

    #[test]
    fn test_attributes_and_flush() -> anyhow::Result<()> {
        let mut dev = fresh();
        let id = dev.create_file(ROOT, "f", 0o600, 10, 20)?;
        let attrs = dev.get_attributes(id)?;
        assert_eq!(attrs.mode, S_IFREG | 0o600);
        assert_eq!((attrs.uid, attrs.gid), (10, 20));

        dev.set_attributes(
            id,
            Attributes {
                mode: 0o755,
                ..attrs
            },
        )?;
        assert_eq!(dev.get_attributes(id)?.mode, S_IFREG | 0o755);
        assert_eq!(dev.get_type(id)?, ObjectType::File);

        dev.write(id, 0, b"abc", false)?;
        let header = dev.objects.get(id)?.hdr_chunk;
        dev.flush(id, false, true)?;
        assert_eq!(dev.objects.get(id)?.hdr_chunk, header);
        dev.flush(id, true, false)?;
        assert_ne!(dev.objects.get(id)?.hdr_chunk, header);
        assert!(!dev.objects.get(id)?.dirty);
        Ok(())
    }

    #[test]
    fn test_specials_and_symlinks() -> anyhow::Result<()> {
        let mut dev = fresh();
        let dev_node = dev.create_special(ROOT, "null", 0o020666, 0, 0, 0x0103)?;
        assert_eq!(dev.get_type(dev_node)?, ObjectType::Special);
        assert!(matches!(
            dev.write(dev_node, 0, b"x", false),
            Err(YaffsError::NotPermitted)
        ));

        let link = dev.create_symlink(ROOT, "l", 0o777, 0, 0, "/null")?;
        assert_eq!(dev.get_alias(link)?, "/null");
        assert_eq!(dev.get_length(link)?, 5);
        assert!(matches!(
            dev.create_symlink(ROOT, "m", 0o777, 0, 0, &"x".repeat(MAX_ALIAS_LENGTH + 1)),
            Err(YaffsError::NameTooLong)
        ));
        Ok(())
    }
}
