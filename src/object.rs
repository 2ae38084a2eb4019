//! The object store: every live filesystem object, hashed into buckets by id.
//!
//! Directories own a vector of child ids, and every child records its parent, so the tree can
//! be walked both ways without intrusive lists.

use crate::config::{
    FIRST_USER_OBJECT_ID, N_OBJECT_BUCKETS, OBJECTID_DELETED, OBJECTID_LOSTNFOUND, OBJECTID_ROOT,
    OBJECTID_UNLINKED, OBJECT_SPACE,
};
use crate::error::{Result, YaffsError};
use crate::header::{Attributes, ObjectHeader, ObjectType};
use crate::tnode::FileTree;

pub type ObjectId = u32;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Default)]
pub struct FileVar {
    /// Length in bytes
    pub size: u64,
    pub tree: FileTree,
}

#[derive(Debug, Default)]
pub struct DirVar {
    pub children: Vec<ObjectId>,
}

/// The type-specific part of an object
#[derive(Debug)]
pub enum Variant {
    File(FileVar),
    Directory(DirVar),
    /// Symlink target
    Symlink(String),
    /// The object this hardlink stands for
    Hardlink(ObjectId),
    /// Device number
    Special(u32),
}

impl Variant {
    /// An empty variant of the given type; unknown types are treated as files, since only data
    /// chunks can reveal an object before its header
    pub fn for_type(obj_type: ObjectType) -> Self {
        match obj_type {
            ObjectType::Unknown | ObjectType::File => Variant::File(FileVar::default()),
            ObjectType::Directory => Variant::Directory(DirVar::default()),
            ObjectType::Symlink => Variant::Symlink(String::new()),
            ObjectType::Hardlink => Variant::Hardlink(0),
            ObjectType::Special => Variant::Special(0),
        }
    }

    pub fn obj_type(&self) -> ObjectType {
        match self {
            Variant::File(_) => ObjectType::File,
            Variant::Directory(_) => ObjectType::Directory,
            Variant::Symlink(_) => ObjectType::Symlink,
            Variant::Hardlink(_) => ObjectType::Hardlink,
            Variant::Special(_) => ObjectType::Special,
        }
    }
}

/// One filesystem object
#[derive(Debug)]
pub struct Object {
    pub id: ObjectId,
    pub parent: Option<ObjectId>,
    pub name: String,
    pub attrs: Attributes,
    pub variant: Variant,

    /// Where the newest header lives, if one was ever written
    pub hdr_chunk: Option<u32>,

    /// Serial number of the newest header
    pub serial: u8,

    /// In-memory state newer than the header on flash
    pub dirty: bool,

    /// Reserved directory that exists only in memory
    pub fake: bool,

    /// Removed from the namespace while still open
    pub unlinked: bool,

    /// Waiting in the deleted directory for its chunks to be freed
    pub soft_deleted: bool,

    /// Open handles
    pub open_refs: u32,

    /// Hardlink objects pointing at this one
    pub hard_links: Vec<ObjectId>,
}

impl Object {
    pub fn new(id: ObjectId, obj_type: ObjectType) -> Self {
        Self {
            id,
            parent: None,
            name: String::new(),
            attrs: Attributes::default(),
            variant: Variant::for_type(obj_type),
            hdr_chunk: None,
            serial: 0,
            dirty: false,
            fake: false,
            unlinked: false,
            soft_deleted: false,
            open_refs: 0,
            hard_links: Vec::new(),
        }
    }

    fn fake_dir(id: ObjectId, name: &str) -> Self {
        Self {
            name: name.to_string(),
            attrs: Attributes::new(S_IFDIR | 0o755, 0, 0),
            fake: true,
            ..Self::new(id, ObjectType::Directory)
        }
    }

    pub fn obj_type(&self) -> ObjectType {
        self.variant.obj_type()
    }

    /// Change the variant if the type differs, keeping the file tree of a file
    pub fn set_type(&mut self, obj_type: ObjectType) {
        let unchanged = self.obj_type() == obj_type
            || (obj_type == ObjectType::Unknown && self.obj_type() == ObjectType::File);
        if !unchanged {
            self.variant = Variant::for_type(obj_type);
        }
    }

    pub fn file(&self) -> Option<&FileVar> {
        match &self.variant {
            Variant::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileVar> {
        match &mut self.variant {
            Variant::File(file) => Some(file),
            _ => None,
        }
    }

    pub fn children(&self) -> Option<&[ObjectId]> {
        match &self.variant {
            Variant::Directory(dir) => Some(&dir.children),
            _ => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<ObjectId>> {
        match &mut self.variant {
            Variant::Directory(dir) => Some(&mut dir.children),
            _ => None,
        }
    }

    /// Bytes of data this object has
    pub fn size(&self) -> u64 {
        match &self.variant {
            Variant::File(file) => file.size,
            Variant::Symlink(alias) => alias.len() as u64,
            _ => 0,
        }
    }

    /// The header describing this object's current state
    pub fn to_header(&self, is_shrink: bool, shadows_obj: Option<ObjectId>) -> ObjectHeader {
        let mut header = ObjectHeader {
            obj_type: self.obj_type(),
            parent_id: self.parent.unwrap_or(0),
            name: self.name.clone(),
            attrs: self.attrs,
            is_shrink,
            shadows_obj,
            ..Default::default()
        };
        match &self.variant {
            Variant::File(file) => header.file_size = file.size,
            Variant::Symlink(alias) => header.alias = alias.clone(),
            Variant::Hardlink(equiv) => header.equiv_id = *equiv,
            Variant::Special(rdev) => header.rdev = *rdev,
            Variant::Directory(_) => {}
        }
        header
    }
}

/// Bucketed table of objects
#[derive(Debug)]
pub struct ObjectStore {
    buckets: Box<[Vec<Object>]>,
    count: usize,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    /// A store holding only the reserved directories
    pub fn new() -> Self {
        let mut store = Self {
            buckets: (0..N_OBJECT_BUCKETS).map(|_| Vec::new()).collect(),
            count: 0,
        };

        store.insert(Object::fake_dir(OBJECTID_ROOT, ""));
        store.insert(Object::fake_dir(OBJECTID_UNLINKED, "unlinked"));
        store.insert(Object::fake_dir(OBJECTID_DELETED, "deleted"));
        store.insert(Object::fake_dir(OBJECTID_LOSTNFOUND, "lost+found"));
        // Always succeeds: both are directories
        let _ = store.link_child(OBJECTID_ROOT, OBJECTID_LOSTNFOUND);

        store
    }

    fn bucket(id: ObjectId) -> usize {
        id as usize % N_OBJECT_BUCKETS
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn find(&self, id: ObjectId) -> Option<&Object> {
        self.buckets[Self::bucket(id)].iter().find(|x| x.id == id)
    }

    pub fn find_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.buckets[Self::bucket(id)]
            .iter_mut()
            .find(|x| x.id == id)
    }

    /// Like [Self::find], but missing objects are an error
    pub fn get(&self, id: ObjectId) -> Result<&Object> {
        self.find(id).ok_or(YaffsError::NotFound)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.find_mut(id).ok_or(YaffsError::NotFound)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.find(id).is_some()
    }

    /// Add an object; an object with the same id is replaced
    pub fn insert(&mut self, object: Object) {
        let bucket = &mut self.buckets[Self::bucket(object.id)];
        match bucket.iter_mut().find(|x| x.id == object.id) {
            Some(existing) => *existing = object,
            None => {
                bucket.push(object);
                self.count += 1;
            }
        }
    }

    /// Take an object out of the table. The caller is responsible for its links.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let bucket = &mut self.buckets[Self::bucket(id)];
        let pos = bucket.iter().position(|x| x.id == id)?;
        self.count -= 1;
        Some(bucket.swap_remove(pos))
    }

    /// Look up an object, creating an empty shell of the given type if it doesn't exist
    pub fn find_or_create(&mut self, id: ObjectId, obj_type: ObjectType) -> &mut Object {
        if !self.contains(id) {
            self.insert(Object::new(id, obj_type));
        }

        let bucket = &mut self.buckets[Self::bucket(id)];
        let pos = bucket.iter().position(|x| x.id == id).unwrap_or_default();
        &mut bucket[pos]
    }

    /// Pick an unused id from the least-populated bucket
    pub fn new_object_id(&self) -> Result<ObjectId> {
        let (bucket, _) = self
            .buckets
            .iter()
            .enumerate()
            .min_by_key(|(_, objects)| objects.len())
            .ok_or(YaffsError::OutOfSpace)?;

        (bucket as u32..OBJECT_SPACE)
            .step_by(N_OBJECT_BUCKETS)
            .find(|&id| id >= FIRST_USER_OBJECT_ID && !self.contains(id))
            .ok_or(YaffsError::OutOfSpace)
    }

    /// Iterate over all objects, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Object> + '_ {
        self.buckets.iter().flatten()
    }

    /// Ids of all objects
    pub fn ids(&self) -> Vec<ObjectId> {
        self.iter().map(|x| x.id).collect()
    }

    /// Make `child` a child of `dir`, detaching it from any previous parent
    pub fn link_child(&mut self, dir: ObjectId, child: ObjectId) -> Result<()> {
        if !matches!(self.get(dir)?.variant, Variant::Directory(_)) {
            return Err(YaffsError::NotDirectory);
        }
        self.unlink_child(child)?;

        self.get_mut(child)?.parent = Some(dir);
        if let Some(children) = self.get_mut(dir)?.children_mut() {
            children.push(child);
        }
        Ok(())
    }

    /// Detach `child` from its parent
    pub fn unlink_child(&mut self, child: ObjectId) -> Result<()> {
        let Some(parent) = self.get_mut(child)?.parent.take() else {
            return Ok(());
        };
        if let Some(children) = self.find_mut(parent).and_then(Object::children_mut) {
            children.retain(|&x| x != child);
        }
        Ok(())
    }

    /// Find a child of `dir` by name
    pub fn find_child(&self, dir: ObjectId, name: &str) -> Option<ObjectId> {
        self.find(dir)?
            .children()?
            .iter()
            .copied()
            .find(|&id| self.find(id).is_some_and(|x| x.name == name))
    }

    /// Ids of the children of `dir`, empty if it isn't a directory
    pub fn children_of(&self, dir: ObjectId) -> Vec<ObjectId> {
        self.find(dir)
            .and_then(Object::children)
            .map(<[ObjectId]>::to_vec)
            .unwrap_or_default()
    }

    /// The object a hardlink stands for, or the object itself
    pub fn resolve(&self, id: ObjectId) -> Result<ObjectId> {
        match self.get(id)?.variant {
            Variant::Hardlink(equiv) if self.contains(equiv) => Ok(equiv),
            Variant::Hardlink(_) => Err(YaffsError::NotFound),
            _ => Ok(id),
        }
    }

    /// Is `ancestor` on the parent chain of `id` (or `id` itself)?
    pub fn is_ancestor(&self, ancestor: ObjectId, id: ObjectId) -> bool {
        let mut cursor = Some(id);
        // Bounded by the number of objects, in case of a cycle in damaged metadata
        for _ in 0..=self.count {
            match cursor {
                Some(x) if x == ancestor => return true,
                Some(x) => cursor = self.find(x).and_then(|o| o.parent),
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reserved_directories() {
        let store = ObjectStore::new();
        assert_eq!(store.len(), 4);
        for id in [
            OBJECTID_ROOT,
            OBJECTID_LOSTNFOUND,
            OBJECTID_UNLINKED,
            OBJECTID_DELETED,
        ] {
            let obj = store.find(id).unwrap();
            assert!(obj.fake);
            assert_eq!(obj.obj_type(), ObjectType::Directory);
        }
        assert_eq!(
            store.find_child(OBJECTID_ROOT, "lost+found"),
            Some(OBJECTID_LOSTNFOUND)
        );
    }

    #[test]
    fn test_new_object_id_spreads_buckets() -> anyhow::Result<()> {
        let mut store = ObjectStore::new();
        let mut seen = Vec::new();
        for _ in 0..300 {
            let id = store.new_object_id()?;
            assert!(id >= FIRST_USER_OBJECT_ID);
            assert!(!seen.contains(&id));
            seen.push(id);
            store.insert(Object::new(id, ObjectType::File));
        }

        let max = store.buckets.iter().map(Vec::len).max().unwrap();
        let min = store.buckets.iter().map(Vec::len).min().unwrap();
        assert!(max - min <= 1);
        Ok(())
    }

    #[test]
    fn test_links() -> anyhow::Result<()> {
        let mut store = ObjectStore::new();
        store.insert(Object::new(0x100, ObjectType::Directory));
        store.insert(Object {
            name: "a".into(),
            ..Object::new(0x101, ObjectType::File)
        });

        store.link_child(OBJECTID_ROOT, 0x100)?;
        store.link_child(0x100, 0x101)?;
        assert_eq!(store.find_child(0x100, "a"), Some(0x101));
        assert!(store.is_ancestor(OBJECTID_ROOT, 0x101));

        store.link_child(OBJECTID_ROOT, 0x101)?;
        assert_eq!(store.children_of(0x100), []);
        assert_eq!(store.find(0x101).unwrap().parent, Some(OBJECTID_ROOT));

        assert!(matches!(
            store.link_child(0x101, 0x100),
            Err(YaffsError::NotDirectory)
        ));
        Ok(())
    }

    #[test]
    fn test_find_or_create_keeps_existing() {
        let mut store = ObjectStore::new();
        store.find_or_create(0x200, ObjectType::File).name = "x".into();
        let obj = store.find_or_create(0x200, ObjectType::Directory);
        assert_eq!(obj.name, "x");
        assert_eq!(obj.obj_type(), ObjectType::File);

        obj.set_type(ObjectType::Directory);
        assert!(obj.children().is_some());
        assert_eq!(store.len(), 5);
    }
}
