//! ext2 filesystem driver (read/write)
//!
//! Byte-exact rev 0/1 on-disk structures: superblock at byte offset 1024 of
//! the partition, group descriptors in the block after it, inode tables and
//! block/inode bitmaps per group, variable-length directory records, and the
//! 12 direct + single/double/triple indirect block map per inode.
//!
//! The superblock and the full group-descriptor table are cached in memory
//! and written back after every metadata-mutating operation. Scratch block
//! buffers come from the shared pool in `block_cache`.

use super::{block_cache, DirEntry, FileKind, FileSystem, FsDriver, Handle, Stat, VfsError, VfsResult};
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// ext2 magic
const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Superblock lives at byte 1024 of the partition
const SUPERBLOCK_OFFSET: u64 = 1024;

/// Root directory inode
const EXT2_ROOT_INO: u32 = 2;

/// Sector size of the underlying block device
const SECTOR_SIZE: u64 = 512;

/// Direct block pointers per inode
const NDIR_BLOCKS: u32 = 12;
const IND_SLOT: usize = 12;
const DIND_SLOT: usize = 13;
const TIND_SLOT: usize = 14;

/// Inode mode bits
const S_IFMT: u16 = 0xF000;
const S_IFREG: u16 = 0x8000;
const S_IFDIR: u16 = 0x4000;

/// Directory-entry file type tags
const FT_REG_FILE: u8 = 1;
const FT_DIR: u8 = 2;

/// ext2 superblock, fields through the rev-1 extension we use.
/// The tail of the 1024-byte on-disk area is preserved verbatim in
/// `Volume::sb_raw`.
#[repr(C)]
#[derive(Clone, Copy)]
struct Superblock {
    s_inodes_count: u32,
    s_blocks_count: u32,
    s_r_blocks_count: u32,
    s_free_blocks_count: u32,
    s_free_inodes_count: u32,
    s_first_data_block: u32,
    s_log_block_size: u32,
    s_log_frag_size: u32,
    s_blocks_per_group: u32,
    s_frags_per_group: u32,
    s_inodes_per_group: u32,
    s_mtime: u32,
    s_wtime: u32,
    s_mnt_count: u16,
    s_max_mnt_count: u16,
    s_magic: u16,
    s_state: u16,
    s_errors: u16,
    s_minor_rev_level: u16,
    s_lastcheck: u32,
    s_checkinterval: u32,
    s_creator_os: u32,
    s_rev_level: u32,
    s_def_resuid: u16,
    s_def_resgid: u16,
    // rev 1 fields
    s_first_ino: u32,
    s_inode_size: u16,
    s_block_group_nr: u16,
    s_feature_compat: u32,
    s_feature_incompat: u32,
    s_feature_ro_compat: u32,
}

/// Block group descriptor (32 bytes on disk)
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct GroupDesc {
    bg_block_bitmap: u32,
    bg_inode_bitmap: u32,
    bg_inode_table: u32,
    bg_free_blocks_count: u16,
    bg_free_inodes_count: u16,
    bg_used_dirs_count: u16,
    bg_pad: u16,
    bg_reserved: [u8; 12],
}

const GROUP_DESC_SIZE: usize = 32;

/// On-disk inode (128 bytes)
#[repr(C)]
#[derive(Clone, Copy)]
struct DiskInode {
    i_mode: u16,
    i_uid: u16,
    i_size: u32,
    i_atime: u32,
    i_ctime: u32,
    i_mtime: u32,
    i_dtime: u32,
    i_gid: u16,
    i_links_count: u16,
    /// Disk sectors (512-byte units) charged to this inode
    i_blocks: u32,
    i_flags: u32,
    i_osd1: u32,
    /// 12 direct, then single/double/triple indirect
    i_block: [u32; 15],
    i_generation: u32,
    i_file_acl: u32,
    i_dir_acl: u32,
    i_faddr: u32,
    i_osd2: [u8; 12],
}

impl DiskInode {
    fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }

    fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    fn is_file(&self) -> bool {
        self.i_mode & S_IFMT == S_IFREG
    }
}

/// Directory record header; the name follows inline
#[derive(Clone, Copy, Debug)]
struct DirRec {
    inode: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
}

impl DirRec {
    const HEADER: usize = 8;

    fn parse(buf: &[u8], pos: usize) -> Option<DirRec> {
        if pos + Self::HEADER > buf.len() {
            return None;
        }
        Some(DirRec {
            inode: u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]),
            rec_len: u16::from_le_bytes([buf[pos + 4], buf[pos + 5]]),
            name_len: buf[pos + 6],
            file_type: buf[pos + 7],
        })
    }

    fn store(&self, buf: &mut [u8], pos: usize) {
        buf[pos..pos + 4].copy_from_slice(&self.inode.to_le_bytes());
        buf[pos + 4..pos + 6].copy_from_slice(&self.rec_len.to_le_bytes());
        buf[pos + 6] = self.name_len;
        buf[pos + 7] = self.file_type;
    }

    /// Bytes a live record with this name length actually occupies
    fn used_len(name_len: usize) -> usize {
        (Self::HEADER + name_len + 3) & !3
    }
}

/// In-memory volume state
struct Volume {
    drive: usize,
    part_lba: u64,
    block_size: u32,
    inode_size: u32,
    groups_count: u32,
    sb: Superblock,
    /// Raw 1024-byte superblock area; unknown tail bytes survive rewrites
    sb_raw: Vec<u8>,
    groups: Vec<GroupDesc>,
}

impl Volume {
    fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / SECTOR_SIZE
    }

    /// Pointers per indirect block
    fn ptrs_per_block(&self) -> u32 {
        self.block_size / 4
    }

    fn read_block(&self, block: u32, buf: &mut [u8]) -> VfsResult<()> {
        let lba = self.part_lba + block as u64 * self.sectors_per_block();
        crate::drivers::ata::read(self.drive, lba, self.sectors_per_block() as usize, buf)
            .map_err(|_| VfsError::IoError)
    }

    fn write_block(&self, block: u32, buf: &[u8]) -> VfsResult<()> {
        let lba = self.part_lba + block as u64 * self.sectors_per_block();
        crate::drivers::ata::write(self.drive, lba, self.sectors_per_block() as usize, buf)
            .map_err(|_| VfsError::IoError)
    }

    /// First block of the group descriptor table
    fn gdt_block(&self) -> u32 {
        self.sb.s_first_data_block + 1
    }

    /// Write the cached superblock and group descriptors back to disk
    fn flush_metadata(&mut self) -> VfsResult<()> {
        // Serialize the cached superblock over the raw area's head
        unsafe {
            core::ptr::write_unaligned(self.sb_raw.as_mut_ptr() as *mut Superblock, self.sb);
        }
        let sb_lba = self.part_lba + SUPERBLOCK_OFFSET / SECTOR_SIZE;
        crate::drivers::ata::write(self.drive, sb_lba, 2, &self.sb_raw)
            .map_err(|_| VfsError::IoError)?;

        // Serialize the group descriptor table
        let table_bytes = self.groups.len() * GROUP_DESC_SIZE;
        let table_blocks = (table_bytes + self.block_size as usize - 1) / self.block_size as usize;
        let mut raw = alloc::vec![0u8; table_blocks * self.block_size as usize];
        for (i, g) in self.groups.iter().enumerate() {
            unsafe {
                core::ptr::write_unaligned(
                    raw[i * GROUP_DESC_SIZE..].as_mut_ptr() as *mut GroupDesc,
                    *g,
                );
            }
        }
        for b in 0..table_blocks {
            let range = b * self.block_size as usize..(b + 1) * self.block_size as usize;
            self.write_block(self.gdt_block() + b as u32, &raw[range])?;
        }

        Ok(())
    }

    // -- inodes ------------------------------------------------------------

    /// Locate an inode on disk: (block, byte offset within block)
    fn inode_location(&self, ino: u32) -> VfsResult<(u32, usize)> {
        if ino == 0 || ino > self.sb.s_inodes_count {
            return Err(VfsError::NotFound);
        }
        let group = (ino - 1) / self.sb.s_inodes_per_group;
        let index = (ino - 1) % self.sb.s_inodes_per_group;
        let desc = self.groups.get(group as usize).ok_or(VfsError::IoError)?;

        let byte_off = index as u64 * self.inode_size as u64;
        let block = desc.bg_inode_table + (byte_off / self.block_size as u64) as u32;
        let offset = (byte_off % self.block_size as u64) as usize;
        Ok((block, offset))
    }

    fn read_inode(&self, ino: u32) -> VfsResult<DiskInode> {
        let (block, offset) = self.inode_location(ino)?;
        let mut buf = block_cache::get(self.block_size as usize);
        self.read_block(block, &mut buf)?;
        Ok(unsafe { core::ptr::read_unaligned(buf[offset..].as_ptr() as *const DiskInode) })
    }

    fn write_inode(&self, ino: u32, inode: &DiskInode) -> VfsResult<()> {
        let (block, offset) = self.inode_location(ino)?;
        let mut buf = block_cache::get(self.block_size as usize);
        self.read_block(block, &mut buf)?;
        unsafe {
            core::ptr::write_unaligned(buf[offset..].as_mut_ptr() as *mut DiskInode, *inode);
        }
        self.write_block(block, &buf)
    }

    /// Block group an inode belongs to
    fn group_of_inode(&self, ino: u32) -> u32 {
        (ino - 1) / self.sb.s_inodes_per_group
    }

    // -- bitmap allocation -------------------------------------------------

    /// Scan a bitmap block for the first clear bit below `limit`; sets it.
    fn bitmap_alloc(&self, bitmap_block: u32, limit: u32) -> VfsResult<Option<u32>> {
        let mut buf = block_cache::get(self.block_size as usize);
        self.read_block(bitmap_block, &mut buf)?;

        for bit in 0..limit {
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            if buf[byte] & mask == 0 {
                buf[byte] |= mask;
                self.write_block(bitmap_block, &buf)?;
                return Ok(Some(bit));
            }
        }
        Ok(None)
    }

    /// Clear one bit in a bitmap block
    fn bitmap_free(&self, bitmap_block: u32, bit: u32) -> VfsResult<()> {
        let mut buf = block_cache::get(self.block_size as usize);
        self.read_block(bitmap_block, &mut buf)?;
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        if buf[byte] & mask != 0 {
            buf[byte] &= !mask;
            self.write_block(bitmap_block, &buf)?;
        }
        Ok(())
    }

    /// Number of blocks in a given group (last group may be short)
    fn blocks_in_group(&self, group: u32) -> u32 {
        let total = self.sb.s_blocks_count - self.sb.s_first_data_block;
        let full = self.sb.s_blocks_per_group;
        if group + 1 < self.groups_count {
            full
        } else {
            total - (self.groups_count - 1) * full
        }
    }

    /// Allocate a data block, preferring `preferred_group`, falling back to
    /// a linear scan of the other groups. The new block is zero-filled.
    fn alloc_block(&mut self, preferred_group: u32) -> VfsResult<u32> {
        let order =
            (0..self.groups_count).map(|i| (preferred_group + i) % self.groups_count);

        for group in order {
            if self.groups[group as usize].bg_free_blocks_count == 0 {
                continue;
            }
            let bitmap = self.groups[group as usize].bg_block_bitmap;
            if let Some(bit) = self.bitmap_alloc(bitmap, self.blocks_in_group(group))? {
                self.groups[group as usize].bg_free_blocks_count -= 1;
                self.sb.s_free_blocks_count -= 1;

                let block =
                    self.sb.s_first_data_block + group * self.sb.s_blocks_per_group + bit;

                // Fresh blocks must not leak stale contents
                let zero = block_cache::get(self.block_size as usize);
                self.write_block(block, &zero)?;

                self.flush_metadata()?;
                return Ok(block);
            }
        }

        Err(VfsError::NoSpace)
    }

    fn free_block(&mut self, block: u32) -> VfsResult<()> {
        if block < self.sb.s_first_data_block || block >= self.sb.s_blocks_count {
            return Ok(());
        }
        let rel = block - self.sb.s_first_data_block;
        let group = rel / self.sb.s_blocks_per_group;
        let bit = rel % self.sb.s_blocks_per_group;

        self.bitmap_free(self.groups[group as usize].bg_block_bitmap, bit)?;
        self.groups[group as usize].bg_free_blocks_count += 1;
        self.sb.s_free_blocks_count += 1;
        Ok(())
    }

    /// Allocate an inode, preferring `preferred_group`
    fn alloc_inode(&mut self, preferred_group: u32, is_dir: bool) -> VfsResult<u32> {
        let order =
            (0..self.groups_count).map(|i| (preferred_group + i) % self.groups_count);

        for group in order {
            if self.groups[group as usize].bg_free_inodes_count == 0 {
                continue;
            }
            let bitmap = self.groups[group as usize].bg_inode_bitmap;
            if let Some(bit) = self.bitmap_alloc(bitmap, self.sb.s_inodes_per_group)? {
                self.groups[group as usize].bg_free_inodes_count -= 1;
                self.sb.s_free_inodes_count -= 1;
                if is_dir {
                    self.groups[group as usize].bg_used_dirs_count += 1;
                }
                self.flush_metadata()?;
                return Ok(group * self.sb.s_inodes_per_group + bit + 1);
            }
        }

        Err(VfsError::NoSpace)
    }

    fn free_inode(&mut self, ino: u32, was_dir: bool) -> VfsResult<()> {
        let group = self.group_of_inode(ino);
        let bit = (ino - 1) % self.sb.s_inodes_per_group;

        self.bitmap_free(self.groups[group as usize].bg_inode_bitmap, bit)?;
        self.groups[group as usize].bg_free_inodes_count += 1;
        self.sb.s_free_inodes_count += 1;
        if was_dir && self.groups[group as usize].bg_used_dirs_count > 0 {
            self.groups[group as usize].bg_used_dirs_count -= 1;
        }
        Ok(())
    }

    // -- block map ---------------------------------------------------------

    /// Read one u32 entry of an indirect block
    fn indirect_entry(&self, block: u32, index: u32) -> VfsResult<u32> {
        let mut buf = block_cache::get(self.block_size as usize);
        self.read_block(block, &mut buf)?;
        let off = index as usize * 4;
        Ok(u32::from_le_bytes([
            buf[off],
            buf[off + 1],
            buf[off + 2],
            buf[off + 3],
        ]))
    }

    fn set_indirect_entry(&self, block: u32, index: u32, value: u32) -> VfsResult<()> {
        let mut buf = block_cache::get(self.block_size as usize);
        self.read_block(block, &mut buf)?;
        let off = index as usize * 4;
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.write_block(block, &buf)
    }

    /// Map a file block index to a disk block. Returns 0 for a hole unless
    /// `alloc` is set, in which case missing pointer blocks and the data
    /// block itself are allocated on the way down.
    ///
    /// `inode` is updated in memory (i_block, i_blocks); the caller writes
    /// it back.
    fn bmap(&mut self, ino: u32, inode: &mut DiskInode, file_block: u32, alloc: bool) -> VfsResult<u32> {
        let p = self.ptrs_per_block();
        let group = self.group_of_inode(ino);
        let charge = self.sectors_per_block() as u32;

        // Direct
        if file_block < NDIR_BLOCKS {
            let slot = file_block as usize;
            if inode.i_block[slot] == 0 && alloc {
                inode.i_block[slot] = self.alloc_block(group)?;
                inode.i_blocks += charge;
            }
            return Ok(inode.i_block[slot]);
        }

        // Resolve the chain of indirect levels to walk
        let mut rest = file_block - NDIR_BLOCKS;
        let (slot, levels) = if rest < p {
            (IND_SLOT, 1)
        } else {
            rest -= p;
            if rest < p * p {
                (DIND_SLOT, 2)
            } else {
                rest -= p * p;
                if rest < p * p * p {
                    (TIND_SLOT, 3)
                } else {
                    return Err(VfsError::NoSpace); // beyond triple indirect
                }
            }
        };

        // Root pointer block
        if inode.i_block[slot] == 0 {
            if !alloc {
                return Ok(0);
            }
            inode.i_block[slot] = self.alloc_block(group)?;
            inode.i_blocks += charge;
        }
        let mut block = inode.i_block[slot];

        // Walk down; index at each level is rest / p^(level-1) % p
        for level in (1..=levels).rev() {
            let stride = p.pow(level as u32 - 1);
            let index = (rest / stride) % p;

            let next = self.indirect_entry(block, index)?;
            if level == 1 {
                if next == 0 && alloc {
                    let data = self.alloc_block(group)?;
                    self.set_indirect_entry(block, index, data)?;
                    inode.i_blocks += charge;
                    return Ok(data);
                }
                return Ok(next);
            }

            if next == 0 {
                if !alloc {
                    return Ok(0);
                }
                let ptr_block = self.alloc_block(group)?;
                self.set_indirect_entry(block, index, ptr_block)?;
                inode.i_blocks += charge;
                block = ptr_block;
            } else {
                block = next;
            }
        }

        Err(VfsError::IoError) // unreachable
    }

    // -- file data ---------------------------------------------------------

    /// Read file contents; holes read as zeros, reads past EOF return 0.
    fn read_data(&mut self, ino: u32, inode: &mut DiskInode, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let size = inode.i_size as u64;
        if offset >= size {
            return Ok(0);
        }

        let want = ((size - offset) as usize).min(buf.len());
        let bs = self.block_size as u64;
        let mut done = 0usize;

        while done < want {
            let pos = offset + done as u64;
            let fb = (pos / bs) as u32;
            let in_block = (pos % bs) as usize;
            let chunk = (bs as usize - in_block).min(want - done);

            let block = self.bmap(ino, inode, fb, false)?;
            if block == 0 {
                // Hole
                buf[done..done + chunk].fill(0);
            } else {
                let mut scratch = block_cache::get(self.block_size as usize);
                self.read_block(block, &mut scratch)?;
                buf[done..done + chunk].copy_from_slice(&scratch[in_block..in_block + chunk]);
            }

            done += chunk;
        }

        Ok(want)
    }

    /// Write file contents, allocating blocks (and pointer blocks) as
    /// needed. Extends i_size when the write ends past it.
    fn write_data(&mut self, ino: u32, inode: &mut DiskInode, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let bs = self.block_size as u64;
        let mut done = 0usize;

        while done < buf.len() {
            let pos = offset + done as u64;
            let fb = (pos / bs) as u32;
            let in_block = (pos % bs) as usize;
            let chunk = (bs as usize - in_block).min(buf.len() - done);

            let block = self.bmap(ino, inode, fb, true)?;

            if chunk == bs as usize {
                self.write_block(block, &buf[done..done + chunk])?;
            } else {
                let mut scratch = block_cache::get(self.block_size as usize);
                self.read_block(block, &mut scratch)?;
                scratch[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.write_block(block, &scratch)?;
            }

            done += chunk;
        }

        let end = offset + buf.len() as u64;
        if end > inode.i_size as u64 {
            inode.i_size = end as u32;
        }
        self.write_inode(ino, inode)?;

        Ok(buf.len())
    }

    /// Free an indirect tree rooted at `block`, `level` levels deep
    fn free_tree(&mut self, block: u32, level: u32) -> VfsResult<()> {
        if block == 0 {
            return Ok(());
        }

        if level > 0 {
            let p = self.ptrs_per_block();
            for i in 0..p {
                let child = self.indirect_entry(block, i)?;
                if child != 0 {
                    self.free_tree(child, level - 1)?;
                }
            }
        }

        self.free_block(block)
    }

    /// Release every data and pointer block of an inode
    fn free_all_blocks(&mut self, inode: &mut DiskInode) -> VfsResult<()> {
        for slot in 0..NDIR_BLOCKS as usize {
            if inode.i_block[slot] != 0 {
                self.free_block(inode.i_block[slot])?;
            }
        }
        self.free_tree(inode.i_block[IND_SLOT], 1)?;
        self.free_tree(inode.i_block[DIND_SLOT], 2)?;
        self.free_tree(inode.i_block[TIND_SLOT], 3)?;

        inode.i_block = [0; 15];
        inode.i_blocks = 0;
        Ok(())
    }

    // -- directories -------------------------------------------------------

    /// Find `name` in a directory. Returns (inode number, file block index,
    /// byte offset of the record in that block).
    fn dir_find(&mut self, dir_ino: u32, dir: &mut DiskInode, name: &str) -> VfsResult<(u32, u32, usize)> {
        let bs = self.block_size as usize;
        let blocks = (dir.i_size as u64 / bs as u64) as u32;

        for fb in 0..blocks {
            let block = self.bmap(dir_ino, dir, fb, false)?;
            if block == 0 {
                continue; // sparse directory block, skip
            }

            let mut buf = block_cache::get(bs);
            self.read_block(block, &mut buf)?;

            let mut pos = 0usize;
            while pos < bs {
                let Some(rec) = DirRec::parse(&buf, pos) else { break };
                if rec.rec_len == 0 {
                    break; // corrupt block, stop scanning it
                }
                if rec.inode != 0 && rec.name_len as usize == name.len() {
                    let nstart = pos + DirRec::HEADER;
                    if &buf[nstart..nstart + rec.name_len as usize] == name.as_bytes() {
                        return Ok((rec.inode, fb, pos));
                    }
                }
                pos += rec.rec_len as usize;
            }
        }

        Err(VfsError::NotFound)
    }

    /// Add a directory entry, reusing free suffix space inside an existing
    /// record when it fits, otherwise appending a fresh directory block.
    fn dir_add(&mut self, dir_ino: u32, dir: &mut DiskInode, name: &str, ino: u32, file_type: u8) -> VfsResult<()> {
        if name.len() > 255 {
            return Err(VfsError::InvalidPath);
        }

        let bs = self.block_size as usize;
        let needed = DirRec::used_len(name.len());
        let blocks = (dir.i_size as u64 / bs as u64) as u32;

        for fb in 0..blocks {
            let block = self.bmap(dir_ino, dir, fb, false)?;
            if block == 0 {
                continue;
            }

            let mut buf = block_cache::get(bs);
            self.read_block(block, &mut buf)?;

            let mut pos = 0usize;
            while pos < bs {
                let Some(mut rec) = DirRec::parse(&buf, pos) else { break };
                if rec.rec_len == 0 {
                    break;
                }

                if rec.inode == 0 && rec.rec_len as usize >= needed {
                    // Take over a deleted record wholesale
                    let new = DirRec {
                        inode: ino,
                        rec_len: rec.rec_len,
                        name_len: name.len() as u8,
                        file_type,
                    };
                    new.store(&mut buf, pos);
                    buf[pos + DirRec::HEADER..pos + DirRec::HEADER + name.len()]
                        .copy_from_slice(name.as_bytes());
                    return self.write_block(block, &buf);
                }

                let used = if rec.inode == 0 {
                    0
                } else {
                    DirRec::used_len(rec.name_len as usize)
                };

                if rec.inode != 0 && rec.rec_len as usize - used >= needed {
                    // Split: shrink the live record, append ours after it
                    let new_pos = pos + used;
                    let new = DirRec {
                        inode: ino,
                        rec_len: (rec.rec_len as usize - used) as u16,
                        name_len: name.len() as u8,
                        file_type,
                    };
                    rec.rec_len = used as u16;
                    rec.store(&mut buf, pos);
                    new.store(&mut buf, new_pos);
                    buf[new_pos + DirRec::HEADER..new_pos + DirRec::HEADER + name.len()]
                        .copy_from_slice(name.as_bytes());
                    return self.write_block(block, &buf);
                }

                pos += rec.rec_len as usize;
            }
        }

        // No room anywhere: grow the directory by one block
        let fb = blocks;
        let block = self.bmap(dir_ino, dir, fb, true)?;

        let mut buf = block_cache::get(bs);
        let rec = DirRec {
            inode: ino,
            rec_len: bs as u16,
            name_len: name.len() as u8,
            file_type,
        };
        rec.store(&mut buf, 0);
        buf[DirRec::HEADER..DirRec::HEADER + name.len()].copy_from_slice(name.as_bytes());
        self.write_block(block, &buf)?;

        dir.i_size += bs as u32;
        self.write_inode(dir_ino, dir)?;
        Ok(())
    }

    /// Remove `name` from a directory: zero its inode when it leads a
    /// block, otherwise merge its length into the preceding record.
    fn dir_remove(&mut self, dir_ino: u32, dir: &mut DiskInode, name: &str) -> VfsResult<u32> {
        let (target_ino, fb, rec_pos) = self.dir_find(dir_ino, dir, name)?;
        let bs = self.block_size as usize;

        let block = self.bmap(dir_ino, dir, fb, false)?;
        let mut buf = block_cache::get(bs);
        self.read_block(block, &mut buf)?;

        if rec_pos == 0 {
            let mut rec = DirRec::parse(&buf, 0).ok_or(VfsError::IoError)?;
            rec.inode = 0;
            rec.store(&mut buf, 0);
        } else {
            // Find the record immediately before rec_pos
            let mut pos = 0usize;
            loop {
                let rec = DirRec::parse(&buf, pos).ok_or(VfsError::IoError)?;
                if rec.rec_len == 0 {
                    return Err(VfsError::IoError);
                }
                let next = pos + rec.rec_len as usize;
                if next == rec_pos {
                    let victim = DirRec::parse(&buf, rec_pos).ok_or(VfsError::IoError)?;
                    let mut prev = rec;
                    prev.rec_len += victim.rec_len;
                    prev.store(&mut buf, pos);
                    break;
                }
                pos = next;
            }
        }

        self.write_block(block, &buf)?;
        Ok(target_ino)
    }

    /// A directory is empty when its only live entries are . and ..
    fn dir_is_empty(&mut self, dir_ino: u32, dir: &mut DiskInode) -> VfsResult<bool> {
        let bs = self.block_size as usize;
        let blocks = (dir.i_size as u64 / bs as u64) as u32;

        for fb in 0..blocks {
            let block = self.bmap(dir_ino, dir, fb, false)?;
            if block == 0 {
                continue;
            }

            let mut buf = block_cache::get(bs);
            self.read_block(block, &mut buf)?;

            let mut pos = 0usize;
            while pos < bs {
                let Some(rec) = DirRec::parse(&buf, pos) else { break };
                if rec.rec_len == 0 {
                    break;
                }
                if rec.inode != 0 {
                    let nstart = pos + DirRec::HEADER;
                    let name = &buf[nstart..nstart + rec.name_len as usize];
                    if name != b"." && name != b".." {
                        return Ok(false);
                    }
                }
                pos += rec.rec_len as usize;
            }
        }

        Ok(true)
    }

    /// The `index`-th live directory entry, in block order
    fn dir_entry_at(&mut self, dir_ino: u32, dir: &mut DiskInode, index: usize) -> VfsResult<Option<DirEntry>> {
        let bs = self.block_size as usize;
        let blocks = (dir.i_size as u64 / bs as u64) as u32;
        let mut live = 0usize;

        for fb in 0..blocks {
            let block = self.bmap(dir_ino, dir, fb, false)?;
            if block == 0 {
                continue;
            }

            let mut buf = block_cache::get(bs);
            self.read_block(block, &mut buf)?;

            let mut pos = 0usize;
            while pos < bs {
                let Some(rec) = DirRec::parse(&buf, pos) else { break };
                if rec.rec_len == 0 {
                    break;
                }
                if rec.inode != 0 {
                    if live == index {
                        let nstart = pos + DirRec::HEADER;
                        let name =
                            core::str::from_utf8(&buf[nstart..nstart + rec.name_len as usize])
                                .unwrap_or("")
                                .to_string();
                        let kind = if rec.file_type == FT_DIR {
                            FileKind::Directory
                        } else {
                            FileKind::File
                        };
                        return Ok(Some(DirEntry {
                            name,
                            ino: rec.inode as u64,
                            kind,
                        }));
                    }
                    live += 1;
                }
                pos += rec.rec_len as usize;
            }
        }

        Ok(None)
    }

    // -- path resolution ---------------------------------------------------

    /// Walk an absolute in-volume path from the root inode
    fn resolve(&mut self, path: &str) -> VfsResult<u32> {
        let mut cur = EXT2_ROOT_INO;

        for part in path.split('/').filter(|p| !p.is_empty()) {
            let mut inode = self.read_inode(cur)?;
            if !inode.is_dir() {
                return Err(VfsError::NotDirectory);
            }
            cur = self.dir_find(cur, &mut inode, part)?.0;
        }

        Ok(cur)
    }

    /// Resolve the parent directory of `path`; returns (parent ino, name)
    fn resolve_parent<'p>(&mut self, path: &'p str) -> VfsResult<(u32, &'p str)> {
        let name = super::basename(path);
        if name.is_empty() || name == "." || name == ".." {
            return Err(VfsError::InvalidPath);
        }
        let parent = self.resolve(&super::parent_of(path))?;
        if !self.read_inode(parent)?.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        Ok((parent, name))
    }

    // -- high-level operations ---------------------------------------------

    fn do_create(&mut self, path: &str) -> VfsResult<u32> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let mut parent = self.read_inode(parent_ino)?;

        if self.dir_find(parent_ino, &mut parent, name).is_ok() {
            return Err(VfsError::AlreadyExists);
        }

        let ino = self.alloc_inode(self.group_of_inode(parent_ino), false)?;

        let mut inode = DiskInode::zeroed();
        inode.i_mode = S_IFREG | 0o644;
        inode.i_links_count = 1;
        self.write_inode(ino, &inode)?;

        if let Err(e) = self.dir_add(parent_ino, &mut parent, name, ino, FT_REG_FILE) {
            // Unwind the fresh inode before surfacing the error
            self.free_inode(ino, false)?;
            self.flush_metadata()?;
            return Err(e);
        }

        self.flush_metadata()?;
        Ok(ino)
    }

    fn do_mkdir(&mut self, path: &str) -> VfsResult<()> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let mut parent = self.read_inode(parent_ino)?;

        if self.dir_find(parent_ino, &mut parent, name).is_ok() {
            return Err(VfsError::AlreadyExists);
        }

        let group = self.group_of_inode(parent_ino);
        let ino = self.alloc_inode(group, true)?;

        let block = match self.alloc_block(group) {
            Ok(b) => b,
            Err(e) => {
                self.free_inode(ino, true)?;
                self.flush_metadata()?;
                return Err(e);
            }
        };

        // Seed the new directory with . and ..
        let bs = self.block_size as usize;
        let mut buf = block_cache::get(bs);
        let dot = DirRec {
            inode: ino,
            rec_len: 12,
            name_len: 1,
            file_type: FT_DIR,
        };
        dot.store(&mut buf, 0);
        buf[DirRec::HEADER] = b'.';
        let dotdot = DirRec {
            inode: parent_ino,
            rec_len: (bs - 12) as u16,
            name_len: 2,
            file_type: FT_DIR,
        };
        dotdot.store(&mut buf, 12);
        buf[12 + DirRec::HEADER..12 + DirRec::HEADER + 2].copy_from_slice(b"..");
        self.write_block(block, &buf)?;

        let mut inode = DiskInode::zeroed();
        inode.i_mode = S_IFDIR | 0o755;
        inode.i_size = self.block_size;
        inode.i_links_count = 2; // itself + its own "."
        inode.i_block[0] = block;
        inode.i_blocks = self.sectors_per_block() as u32;
        self.write_inode(ino, &inode)?;

        if let Err(e) = self.dir_add(parent_ino, &mut parent, name, ino, FT_DIR) {
            self.free_block(block)?;
            self.free_inode(ino, true)?;
            self.flush_metadata()?;
            return Err(e);
        }

        // ".." in the child points back at the parent
        parent.i_links_count += 1;
        self.write_inode(parent_ino, &parent)?;

        self.flush_metadata()?;
        Ok(())
    }

    fn do_unlink(&mut self, path: &str) -> VfsResult<()> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let mut parent = self.read_inode(parent_ino)?;

        let (ino, _, _) = self.dir_find(parent_ino, &mut parent, name)?;
        let mut inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(VfsError::IsDirectory);
        }

        self.dir_remove(parent_ino, &mut parent, name)?;

        inode.i_links_count = inode.i_links_count.saturating_sub(1);
        if inode.i_links_count == 0 {
            self.free_all_blocks(&mut inode)?;
            inode.i_size = 0;
            inode.i_mode = 0;
            self.write_inode(ino, &inode)?;
            self.free_inode(ino, false)?;
        } else {
            self.write_inode(ino, &inode)?;
        }

        self.flush_metadata()?;
        Ok(())
    }

    fn do_rmdir(&mut self, path: &str) -> VfsResult<()> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let mut parent = self.read_inode(parent_ino)?;

        let (ino, _, _) = self.dir_find(parent_ino, &mut parent, name)?;
        if ino == EXT2_ROOT_INO {
            return Err(VfsError::Busy);
        }

        let mut inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        if !self.dir_is_empty(ino, &mut inode)? {
            return Err(VfsError::NotEmpty);
        }

        self.dir_remove(parent_ino, &mut parent, name)?;

        // The child's ".." no longer references the parent
        parent.i_links_count = parent.i_links_count.saturating_sub(1);
        self.write_inode(parent_ino, &parent)?;

        self.free_all_blocks(&mut inode)?;
        inode.i_size = 0;
        inode.i_mode = 0;
        inode.i_links_count = 0;
        self.write_inode(ino, &inode)?;
        self.free_inode(ino, true)?;

        self.flush_metadata()?;
        Ok(())
    }

    fn do_truncate(&mut self, ino: u32) -> VfsResult<()> {
        let mut inode = self.read_inode(ino)?;
        if !inode.is_file() {
            return Err(VfsError::IsDirectory);
        }
        self.free_all_blocks(&mut inode)?;
        inode.i_size = 0;
        self.write_inode(ino, &inode)?;
        self.flush_metadata()?;
        Ok(())
    }
}

/// Mounted ext2 filesystem
pub struct Ext2Fs {
    vol: Mutex<Volume>,
}

impl Ext2Fs {
    /// Acquire the volume, yielding while another process holds it.
    /// The holder may be blocked in a DMA wait, so a plain spin would
    /// starve it of the CPU it needs to finish.
    fn vol(&self) -> spin::MutexGuard<'_, Volume> {
        loop {
            if let Some(guard) = self.vol.try_lock() {
                return guard;
            }
            crate::scheduler::yield_now();
        }
    }
}

impl FileSystem for Ext2Fs {
    fn fs_name(&self) -> &'static str {
        "ext2"
    }

    fn open(&self, path: &str) -> VfsResult<(Handle, bool)> {
        let mut vol = self.vol();
        let ino = vol.resolve(path)?;
        let inode = vol.read_inode(ino)?;
        Ok((ino as Handle, inode.is_dir()))
    }

    fn create(&self, path: &str) -> VfsResult<Handle> {
        let mut vol = self.vol();
        Ok(vol.do_create(path)? as Handle)
    }

    fn close(&self, _handle: Handle) -> VfsResult<()> {
        Ok(())
    }

    fn read(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let mut vol = self.vol();
        let ino = handle as u32;
        let mut inode = vol.read_inode(ino)?;
        if inode.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        vol.read_data(ino, &mut inode, offset, buf)
    }

    fn write(&self, handle: Handle, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let mut vol = self.vol();
        let ino = handle as u32;
        let mut inode = vol.read_inode(ino)?;
        if inode.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        vol.write_data(ino, &mut inode, offset, buf)
    }

    fn truncate(&self, handle: Handle) -> VfsResult<()> {
        let mut vol = self.vol();
        vol.do_truncate(handle as u32)
    }

    fn size(&self, handle: Handle) -> VfsResult<u64> {
        let vol = self.vol();
        Ok(vol.read_inode(handle as u32)?.i_size as u64)
    }

    fn mkdir(&self, path: &str) -> VfsResult<()> {
        let mut vol = self.vol();
        vol.do_mkdir(path)
    }

    fn unlink(&self, path: &str) -> VfsResult<()> {
        let mut vol = self.vol();
        vol.do_unlink(path)
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        let mut vol = self.vol();
        vol.do_rmdir(path)
    }

    fn stat(&self, path: &str) -> VfsResult<Stat> {
        let mut vol = self.vol();
        let ino = vol.resolve(path)?;
        let inode = vol.read_inode(ino)?;
        Ok(Stat {
            ino: ino as u64,
            kind: if inode.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            },
            size: inode.i_size as u64,
        })
    }

    fn readdir(&self, handle: Handle, index: usize) -> VfsResult<Option<DirEntry>> {
        let mut vol = self.vol();
        let ino = handle as u32;
        let mut inode = vol.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        vol.dir_entry_at(ino, &mut inode, index)
    }
}

/// Driver registration for `mount`
pub struct Ext2Driver;

pub static DRIVER: Ext2Driver = Ext2Driver;

impl FsDriver for Ext2Driver {
    fn driver_name(&self) -> &'static str {
        "ext2"
    }

    fn mount(&self, drive: usize, part_lba: u64) -> VfsResult<Arc<dyn FileSystem>> {
        Ok(mount(drive, part_lba)?)
    }
}

/// Mount an ext2 volume from `drive` at partition offset `part_lba`
pub fn mount(drive: usize, part_lba: u64) -> VfsResult<Arc<Ext2Fs>> {
    // Superblock occupies bytes 1024..2048 of the partition
    let mut sb_raw = alloc::vec![0u8; 1024];
    let sb_lba = part_lba + SUPERBLOCK_OFFSET / SECTOR_SIZE;
    crate::drivers::ata::read(drive, sb_lba, 2, &mut sb_raw).map_err(|_| VfsError::IoError)?;

    let sb = unsafe { core::ptr::read_unaligned(sb_raw.as_ptr() as *const Superblock) };

    if sb.s_magic != EXT2_SUPER_MAGIC {
        return Err(VfsError::NotSupported);
    }

    let block_size = 1024u32 << sb.s_log_block_size;
    if block_size as usize > block_cache::MAX_BLOCK_SIZE {
        crate::log_warn!("[EXT2] Block size {} unsupported", block_size);
        return Err(VfsError::NotSupported);
    }

    let inode_size = if sb.s_rev_level >= 1 {
        sb.s_inode_size as u32
    } else {
        128
    };

    let groups_count =
        (sb.s_blocks_count - sb.s_first_data_block + sb.s_blocks_per_group - 1)
            / sb.s_blocks_per_group;

    let mut vol = Volume {
        drive,
        part_lba,
        block_size,
        inode_size,
        groups_count,
        sb,
        sb_raw,
        groups: Vec::new(),
    };

    // Load the group descriptor table
    let table_bytes = groups_count as usize * GROUP_DESC_SIZE;
    let table_blocks = (table_bytes + block_size as usize - 1) / block_size as usize;
    let mut raw = alloc::vec![0u8; table_blocks * block_size as usize];
    for b in 0..table_blocks {
        let mut scratch = block_cache::get(block_size as usize);
        vol.read_block(vol.gdt_block() + b as u32, &mut scratch)?;
        raw[b * block_size as usize..(b + 1) * block_size as usize]
            .copy_from_slice(&scratch);
    }
    for i in 0..groups_count as usize {
        let desc = unsafe {
            core::ptr::read_unaligned(raw[i * GROUP_DESC_SIZE..].as_ptr() as *const GroupDesc)
        };
        vol.groups.push(desc);
    }

    crate::log!(
        "[EXT2] Mounted drive {}: {} blocks of {} bytes, {} groups, {} free inodes",
        drive,
        vol.sb.s_blocks_count,
        block_size,
        groups_count,
        vol.sb.s_free_inodes_count
    );

    Ok(Arc::new(Ext2Fs {
        vol: Mutex::new(vol),
    }))
}

/// Quick probe: does this drive carry an ext2 superblock?
pub fn probe(drive: usize, part_lba: u64) -> bool {
    let mut raw = [0u8; 1024];
    let sb_lba = part_lba + SUPERBLOCK_OFFSET / SECTOR_SIZE;
    if crate::drivers::ata::read(drive, sb_lba, 2, &mut raw).is_err() {
        return false;
    }
    u16::from_le_bytes([raw[56], raw[57]]) == EXT2_SUPER_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_match_disk_layout() {
        assert_eq!(core::mem::size_of::<DiskInode>(), 128);
        assert_eq!(core::mem::size_of::<GroupDesc>(), GROUP_DESC_SIZE);
        // magic sits at byte 56 of the superblock
        assert_eq!(core::mem::offset_of!(Superblock, s_magic), 56);
        assert_eq!(core::mem::offset_of!(Superblock, s_inode_size), 88);
    }

    #[test]
    fn dir_rec_roundtrip_and_alignment() {
        let mut buf = [0u8; 64];
        let rec = DirRec {
            inode: 42,
            rec_len: 24,
            name_len: 9,
            file_type: FT_REG_FILE,
        };
        rec.store(&mut buf, 8);
        let back = DirRec::parse(&buf, 8).unwrap();
        assert_eq!(back.inode, 42);
        assert_eq!(back.rec_len, 24);
        assert_eq!(back.name_len, 9);

        // Records round up to 4-byte boundaries
        assert_eq!(DirRec::used_len(1), 12);
        assert_eq!(DirRec::used_len(4), 12);
        assert_eq!(DirRec::used_len(5), 16);
        assert_eq!(DirRec::used_len(255), 264);
    }

    #[test]
    fn block_index_split_points() {
        // With 1 KiB blocks: 256 pointers per indirect block
        let p = 1024u64 / 4;
        assert_eq!(12, NDIR_BLOCKS as u64);
        // single indirect covers [12, 12+256)
        assert!(12 + p == 268);
        // double indirect covers the next 256^2 blocks
        assert!(12 + p + p * p == 65804);
    }
}
