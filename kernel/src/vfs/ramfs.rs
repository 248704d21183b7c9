//! RAM filesystem
//!
//! In-memory tree backend for the VFS, used for /dev placeholders and as
//! the root when no disk is present. Nodes live in an arena and refer to
//! each other by index (parent / first child / next sibling); the root's
//! parent is itself.
//!
//! Open fds hold no reference on a node: unlinking an open file simply
//! invalidates it. Acceptable for the device-node use this backend serves.

use super::{DirEntry, FileKind, FileSystem, Handle, Stat, VfsError, VfsResult};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;

/// Sentinel for "no node"
const NONE: u32 = u32::MAX;

/// Minimum data-buffer capacity granted on first write
const MIN_CAPACITY: usize = 4096;

struct Node {
    name: String,
    kind: FileKind,
    data: Vec<u8>,
    parent: u32,
    first_child: u32,
    next_sibling: u32,
}

impl Node {
    fn new(name: &str, kind: FileKind, parent: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            data: Vec::new(),
            parent,
            first_child: NONE,
            next_sibling: NONE,
        }
    }
}

struct Arena {
    nodes: Vec<Option<Node>>,
}

impl Arena {
    fn new() -> Self {
        let mut nodes = Vec::new();
        let mut root = Node::new("/", FileKind::Directory, 0);
        root.parent = 0; // root's parent is itself
        nodes.push(Some(root));
        Self { nodes }
    }

    fn get(&self, idx: u32) -> VfsResult<&Node> {
        self.nodes
            .get(idx as usize)
            .and_then(|n| n.as_ref())
            .ok_or(VfsError::NotFound)
    }

    fn get_mut(&mut self, idx: u32) -> VfsResult<&mut Node> {
        self.nodes
            .get_mut(idx as usize)
            .and_then(|n| n.as_mut())
            .ok_or(VfsError::NotFound)
    }

    /// Insert a node, reusing a freed slot when one exists
    fn insert(&mut self, node: Node) -> u32 {
        for (i, slot) in self.nodes.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(node);
                return i as u32;
            }
        }
        self.nodes.push(Some(node));
        (self.nodes.len() - 1) as u32
    }

    /// Find a direct child of `dir` by name
    fn find_child(&self, dir: u32, name: &str) -> VfsResult<u32> {
        let d = self.get(dir)?;
        if d.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory);
        }
        let mut cur = d.first_child;
        while cur != NONE {
            let n = self.get(cur)?;
            if n.name == name {
                return Ok(cur);
            }
            cur = n.next_sibling;
        }
        Err(VfsError::NotFound)
    }

    /// Walk an absolute path to a node index
    fn lookup(&self, path: &str) -> VfsResult<u32> {
        let mut cur = 0u32; // root
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = self.find_child(cur, part)?;
        }
        Ok(cur)
    }

    /// Link `child` into `dir`'s child list
    fn attach(&mut self, dir: u32, child: u32) -> VfsResult<()> {
        let head = self.get(dir)?.first_child;
        self.get_mut(child)?.next_sibling = head;
        self.get_mut(dir)?.first_child = child;
        Ok(())
    }

    /// Unlink `child` from `dir`'s child list
    fn detach(&mut self, dir: u32, child: u32) -> VfsResult<()> {
        let first = self.get(dir)?.first_child;
        if first == child {
            let next = self.get(child)?.next_sibling;
            self.get_mut(dir)?.first_child = next;
            return Ok(());
        }

        let mut cur = first;
        while cur != NONE {
            let next = self.get(cur)?.next_sibling;
            if next == child {
                let after = self.get(child)?.next_sibling;
                self.get_mut(cur)?.next_sibling = after;
                return Ok(());
            }
            cur = next;
        }
        Err(VfsError::NotFound)
    }

    /// Resolve the parent directory of `path` and the final component
    fn parent_and_name<'p>(&self, path: &'p str) -> VfsResult<(u32, &'p str)> {
        let name = super::basename(path);
        if name.is_empty() {
            return Err(VfsError::InvalidPath);
        }
        let parent = self.lookup(&super::parent_of(path))?;
        if self.get(parent)?.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory);
        }
        Ok((parent, name))
    }
}

/// RAM filesystem instance
pub struct RamFs {
    arena: Mutex<Arena>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::new()),
        }
    }
}

impl FileSystem for RamFs {
    fn fs_name(&self) -> &'static str {
        "ramfs"
    }

    fn open(&self, path: &str) -> VfsResult<(Handle, bool)> {
        let arena = self.arena.lock();
        let idx = arena.lookup(path)?;
        let is_dir = arena.get(idx)?.kind == FileKind::Directory;
        Ok((idx as Handle, is_dir))
    }

    fn create(&self, path: &str) -> VfsResult<Handle> {
        let mut arena = self.arena.lock();
        if arena.lookup(path).is_ok() {
            return Err(VfsError::AlreadyExists);
        }

        let (parent, name) = arena.parent_and_name(path)?;
        let idx = arena.insert(Node::new(name, FileKind::File, parent));
        arena.attach(parent, idx)?;
        Ok(idx as Handle)
    }

    fn close(&self, _handle: Handle) -> VfsResult<()> {
        Ok(())
    }

    fn read(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let arena = self.arena.lock();
        let node = arena.get(handle as u32)?;
        if node.kind != FileKind::File {
            return Err(VfsError::IsDirectory);
        }

        let size = node.data.len() as u64;
        if offset >= size {
            return Ok(0); // read past EOF yields 0 bytes
        }

        let n = ((size - offset) as usize).min(buf.len());
        buf[..n].copy_from_slice(&node.data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn write(&self, handle: Handle, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let mut arena = self.arena.lock();
        let node = arena.get_mut(handle as u32)?;
        if node.kind != FileKind::File {
            return Err(VfsError::IsDirectory);
        }

        let end = offset as usize + buf.len();

        // Grow capacity by doubling, never below MIN_CAPACITY
        if end > node.data.capacity() {
            let mut cap = node.data.capacity().max(MIN_CAPACITY);
            while cap < end {
                cap *= 2;
            }
            node.data.reserve(cap - node.data.len());
        }

        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, handle: Handle) -> VfsResult<()> {
        let mut arena = self.arena.lock();
        let node = arena.get_mut(handle as u32)?;
        if node.kind != FileKind::File {
            return Err(VfsError::IsDirectory);
        }
        node.data.clear();
        Ok(())
    }

    fn size(&self, handle: Handle) -> VfsResult<u64> {
        let arena = self.arena.lock();
        Ok(arena.get(handle as u32)?.data.len() as u64)
    }

    fn mkdir(&self, path: &str) -> VfsResult<()> {
        let mut arena = self.arena.lock();
        if arena.lookup(path).is_ok() {
            return Err(VfsError::AlreadyExists);
        }

        let (parent, name) = arena.parent_and_name(path)?;
        let idx = arena.insert(Node::new(name, FileKind::Directory, parent));
        arena.attach(parent, idx)?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        let mut arena = self.arena.lock();
        let idx = arena.lookup(path)?;
        if idx == 0 {
            return Err(VfsError::InvalidPath);
        }
        if arena.get(idx)?.kind != FileKind::File {
            return Err(VfsError::IsDirectory);
        }

        let parent = arena.get(idx)?.parent;
        arena.detach(parent, idx)?;
        arena.nodes[idx as usize] = None;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        let mut arena = self.arena.lock();
        let idx = arena.lookup(path)?;
        if idx == 0 {
            return Err(VfsError::Busy); // never remove the root
        }

        let node = arena.get(idx)?;
        if node.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory);
        }
        if node.first_child != NONE {
            return Err(VfsError::NotEmpty);
        }

        let parent = node.parent;
        arena.detach(parent, idx)?;
        arena.nodes[idx as usize] = None;
        Ok(())
    }

    fn stat(&self, path: &str) -> VfsResult<Stat> {
        let arena = self.arena.lock();
        let idx = arena.lookup(path)?;
        let node = arena.get(idx)?;
        Ok(Stat {
            ino: idx as u64,
            kind: node.kind,
            size: node.data.len() as u64,
        })
    }

    fn readdir(&self, handle: Handle, index: usize) -> VfsResult<Option<DirEntry>> {
        let arena = self.arena.lock();
        let dir = arena.get(handle as u32)?;
        if dir.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory);
        }

        // Entries 0 and 1 are synthetic . and ..
        if index == 0 {
            return Ok(Some(DirEntry {
                name: ".".to_string(),
                ino: handle,
                kind: FileKind::Directory,
            }));
        }
        if index == 1 {
            return Ok(Some(DirEntry {
                name: "..".to_string(),
                ino: dir.parent as u64,
                kind: FileKind::Directory,
            }));
        }

        let mut cur = dir.first_child;
        let mut i = 2usize;
        while cur != NONE {
            let node = arena.get(cur)?;
            if i == index {
                return Ok(Some(DirEntry {
                    name: node.name.clone(),
                    ino: cur as u64,
                    kind: node.kind,
                }));
            }
            i += 1;
            cur = node.next_sibling;
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_roundtrip() {
        let fs = RamFs::new();
        let h = fs.create("/hello").unwrap();
        assert_eq!(fs.write(h, 0, b"abcdef").unwrap(), 6);

        let (h2, is_dir) = fs.open("/hello").unwrap();
        assert!(!is_dir);
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(h2, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");

        // Read past EOF returns 0
        assert_eq!(fs.read(h2, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn mkdir_and_nesting() {
        let fs = RamFs::new();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.create("/a/b/f").unwrap();

        assert_eq!(fs.stat("/a").unwrap().kind, FileKind::Directory);
        assert_eq!(fs.stat("/a/b/f").unwrap().kind, FileKind::File);
        assert_eq!(fs.rmdir("/a"), Err(VfsError::NotEmpty));

        fs.unlink("/a/b/f").unwrap();
        fs.rmdir("/a/b").unwrap();
        fs.rmdir("/a").unwrap();
        assert!(matches!(fs.stat("/a"), Err(VfsError::NotFound)));
    }

    #[test]
    fn unlink_detaches() {
        let fs = RamFs::new();
        fs.create("/x").unwrap();
        fs.create("/y").unwrap();
        fs.unlink("/x").unwrap();
        assert!(fs.open("/x").is_err());
        assert!(fs.open("/y").is_ok());
    }

    #[test]
    fn readdir_lists_dot_entries_first() {
        let fs = RamFs::new();
        fs.create("/f1").unwrap();
        let (h, is_dir) = fs.open("/").unwrap();
        assert!(is_dir);
        assert_eq!(fs.readdir(h, 0).unwrap().unwrap().name, ".");
        assert_eq!(fs.readdir(h, 1).unwrap().unwrap().name, "..");
        assert_eq!(fs.readdir(h, 2).unwrap().unwrap().name, "f1");
        assert!(fs.readdir(h, 3).unwrap().is_none());
    }
}
