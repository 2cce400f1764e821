use bytemuck::{Pod, Zeroable};

use crate::disk::BlockPtr;
use crate::error::FsError;
use crate::fs::Fsm;
use crate::indirect::IndexBlock;
use crate::inode::{InodeRecord, write_inode};
use crate::param::{DIR_ENTRY_SIZE, INODE_DIRECT_PTRS};

/// Entry slot is free
pub const ENTRY_FREE: u32 = 0;
/// Entry slot is allocated
pub const ENTRY_IN_USE: u32 = 1;

/// On-disk directory entry: two name words, the inode number, and the in-use
/// flag. Names are at most 8 bytes, zero-padded.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DirEntry {
    pub name: [u32; 2],
    pub inum: u32,
    pub in_use: u32,
}

impl DirEntry {
    pub fn new(name: &str, inum: u32) -> Self {
        Self {
            name: pack_name(name),
            inum,
            in_use: ENTRY_IN_USE,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use == ENTRY_IN_USE
    }

    /// Decodes the name words, dropping the zero padding.
    pub fn name_str(&self) -> String {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.name[0].to_le_bytes());
        bytes[4..].copy_from_slice(&self.name[1].to_le_bytes());
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

/// Packs a name into the two entry words, truncating past 8 bytes.
pub fn pack_name(name: &str) -> [u32; 2] {
    let mut bytes = [0u8; 8];
    let raw = name.as_bytes();
    let len = raw.len().min(8);
    bytes[..len].copy_from_slice(&raw[..len]);
    [
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    ]
}

pub(crate) fn entry_at(block: &[u8], slot: usize) -> DirEntry {
    let off = slot * DIR_ENTRY_SIZE as usize;
    bytemuck::pod_read_unaligned(&block[off..off + DIR_ENTRY_SIZE as usize])
}

fn put_entry(block: &mut [u8], slot: usize, entry: &DirEntry) {
    let off = slot * DIR_ENTRY_SIZE as usize;
    block[off..off + DIR_ENTRY_SIZE as usize].copy_from_slice(bytemuck::bytes_of(entry));
}

fn has_live_entries(block: &[u8], entries_per_block: usize) -> bool {
    (0..entries_per_block).any(|slot| entry_at(block, slot).is_in_use())
}

/// What a removal descent through an index tree found.
enum Descent {
    NotFound,
    /// The entry was removed; `self_freed` reports whether the index block
    /// the call was rooted at became empty and was deallocated.
    Removed { self_freed: bool },
}

impl Fsm {
    /// Inserts `(name, child)` into the parent directory.
    ///
    /// The placement ladder tries, in order: a free slot in an existing
    /// direct block; a free slot anywhere in the existing index trees; a
    /// fresh direct block; the existing trees once more; the trees again but
    /// growing them; and finally brand-new single, double and triple trees.
    /// The second no-growth tree scan looks redundant but is part of the
    /// on-disk behavior this format ships with.
    pub fn insert_entry(&mut self, child: u32, name: &str, parent: u32) -> Result<(), FsError> {
        let mut dir = self.open_file(parent)?;

        if self.insert_in_direct_avail(parent, &mut dir, name, child)? {
            return Ok(());
        }
        if self.insert_in_trees(parent, &mut dir, name, child, false)? {
            return Ok(());
        }
        if self.insert_in_direct_new(parent, &mut dir, name, child)? {
            return Ok(());
        }
        if self.insert_in_trees(parent, &mut dir, name, child, false)? {
            return Ok(());
        }
        if self.insert_in_trees(parent, &mut dir, name, child, true)? {
            return Ok(());
        }
        for depth in 1..=3u8 {
            if dir.tree_root(depth).is_nil()
                && self.insert_in_new_tree(parent, &mut dir, name, child, depth)?
            {
                return Ok(());
            }
        }

        Err(FsError::OutOfSpace)
    }

    /// Ladder step 1: free slot in an already-allocated direct block.
    fn insert_in_direct_avail(
        &mut self,
        parent: u32,
        dir: &mut InodeRecord,
        name: &str,
        child: u32,
    ) -> Result<bool, FsError> {
        let entries = self.geo.entries_per_block() as usize;
        for i in 0..INODE_DIRECT_PTRS {
            let Some(off) = dir.direct_ptr(i).offset() else {
                continue;
            };
            let mut block = self.disk.read_block_vec(off)?;
            for slot in 0..entries {
                if entry_at(&block, slot).in_use == ENTRY_FREE {
                    put_entry(&mut block, slot, &DirEntry::new(name, child));
                    dir.link_count += 1;
                    self.disk.write_block(off, &block)?;
                    write_inode(&self.disk, &self.geo, parent, dir)?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Ladder step 3: claim the first unused direct pointer with a fresh
    /// zeroed block, entry in slot 0.
    fn insert_in_direct_new(
        &mut self,
        parent: u32,
        dir: &mut InodeRecord,
        name: &str,
        child: u32,
    ) -> Result<bool, FsError> {
        let bs = self.geo.block_size;
        for i in 0..INODE_DIRECT_PTRS {
            if !dir.direct_ptr(i).is_nil() {
                continue;
            }
            let BlockPtr::Offset(off) = self.smap.allocate_sectors(1)? else {
                return Ok(false);
            };
            dir.set_direct_ptr(i, BlockPtr::Offset(off));
            let mut block = vec![0u8; bs as usize];
            put_entry(&mut block, 0, &DirEntry::new(name, child));
            dir.link_count += 1;
            dir.file_size += bs;
            dir.data_blocks = dir.file_size / bs;
            self.disk.write_block(off, &block)?;
            write_inode(&self.disk, &self.geo, parent, dir)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Ladder steps 2, 4 and 5: walk the existing trees, optionally growing
    /// them with new data blocks.
    fn insert_in_trees(
        &mut self,
        parent: u32,
        dir: &mut InodeRecord,
        name: &str,
        child: u32,
        allocate: bool,
    ) -> Result<bool, FsError> {
        for depth in 1..=3u8 {
            if let Some(root) = dir.tree_root(depth).offset() {
                if self.insert_tree(depth, root, parent, dir, name, child, allocate)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Ladder steps 6 and 7: the tree of this depth does not exist yet;
    /// allocate its null-filled index block, persist the root in the inode,
    /// then insert with growth enabled.
    fn insert_in_new_tree(
        &mut self,
        parent: u32,
        dir: &mut InodeRecord,
        name: &str,
        child: u32,
        depth: u8,
    ) -> Result<bool, FsError> {
        let BlockPtr::Offset(root) = self.smap.allocate_sectors(1)? else {
            return Ok(false);
        };
        IndexBlock::nil_filled(&self.geo).store(&self.disk, root)?;
        dir.set_tree_root(depth, BlockPtr::Offset(root));
        write_inode(&self.disk, &self.geo, parent, dir)?;
        self.insert_tree(depth, root, parent, dir, name, child, true)
    }

    fn insert_tree(
        &mut self,
        depth: u8,
        root: u32,
        parent: u32,
        dir: &mut InodeRecord,
        name: &str,
        child: u32,
        allocate: bool,
    ) -> Result<bool, FsError> {
        let bs = self.geo.block_size;
        let entries = self.geo.entries_per_block() as usize;
        let mut index = IndexBlock::load(&self.disk, &self.geo, root)?;

        if depth == 1 {
            if !allocate {
                for slot in index.iter() {
                    let Some(off) = slot.offset() else { continue };
                    let mut block = self.disk.read_block_vec(off)?;
                    for e in 0..entries {
                        if entry_at(&block, e).in_use == ENTRY_FREE {
                            put_entry(&mut block, e, &DirEntry::new(name, child));
                            dir.link_count += 1;
                            self.disk.write_block(off, &block)?;
                            write_inode(&self.disk, &self.geo, parent, dir)?;
                            return Ok(true);
                        }
                    }
                }
                return Ok(false);
            }

            for i in 0..index.len() {
                if !index.slot(i).is_nil() {
                    continue;
                }
                let BlockPtr::Offset(off) = self.smap.allocate_sectors(1)? else {
                    return Ok(false);
                };
                index.set_slot(i, BlockPtr::Offset(off));
                index.store(&self.disk, root)?;
                let mut block = vec![0u8; bs as usize];
                put_entry(&mut block, 0, &DirEntry::new(name, child));
                dir.link_count += 1;
                dir.file_size += bs;
                dir.data_blocks = dir.file_size / bs;
                self.disk.write_block(off, &block)?;
                write_inode(&self.disk, &self.geo, parent, dir)?;
                return Ok(true);
            }
            return Ok(false);
        }

        for slot in index.iter() {
            if let Some(off) = slot.offset() {
                if self.insert_tree(depth - 1, off, parent, dir, name, child, allocate)? {
                    return Ok(true);
                }
            }
        }

        if allocate {
            for i in 0..index.len() {
                if !index.slot(i).is_nil() {
                    continue;
                }
                let BlockPtr::Offset(off) = self.smap.allocate_sectors(1)? else {
                    return Ok(false);
                };
                index.set_slot(i, BlockPtr::Offset(off));
                index.store(&self.disk, root)?;
                IndexBlock::nil_filled(&self.geo).store(&self.disk, off)?;
                if self.insert_tree(depth - 1, off, parent, dir, name, child, allocate)? {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Removes the entry whose inode number is `child` from the parent
    /// directory. Returns false when the parent is not a live directory or
    /// holds no such entry.
    pub fn remove_entry(&mut self, child: u32, parent: u32) -> Result<bool, FsError> {
        let mut dir = match self.open_file(parent) {
            Ok(dir) => dir,
            Err(FsError::NotFound | FsError::InvalidArgument) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !dir.is_dir() {
            return Ok(false);
        }

        let bs = self.geo.block_size;
        let entries = self.geo.entries_per_block() as usize;

        for i in 0..INODE_DIRECT_PTRS {
            let Some(off) = dir.direct_ptr(i).offset() else {
                continue;
            };
            let mut block = self.disk.read_block_vec(off)?;
            for e in 0..entries {
                let entry = entry_at(&block, e);
                if !entry.is_in_use() || entry.inum != child {
                    continue;
                }
                put_entry(&mut block, e, &DirEntry::zeroed());
                dir.link_count -= 1;
                if dir.link_count == 0 {
                    // nothing left in the directory
                    dir.file_size = 0;
                    dir.init_ptrs();
                }
                self.disk.write_block(off, &block)?;
                if !has_live_entries(&block, entries) {
                    self.smap.deallocate_sectors(off / bs)?;
                    dir.set_direct_ptr(i, BlockPtr::Nil);
                    dir.data_blocks = dir.data_blocks.saturating_sub(1);
                }
                write_inode(&self.disk, &self.geo, parent, &dir)?;
                return Ok(true);
            }
        }

        for depth in 1..=3u8 {
            if let Some(root) = dir.tree_root(depth).offset() {
                if let Descent::Removed { self_freed } =
                    self.remove_entry_tree(depth, root, parent, &mut dir, child)?
                {
                    if self_freed {
                        dir.set_tree_root(depth, BlockPtr::Nil);
                        write_inode(&self.disk, &self.geo, parent, &dir)?;
                    }
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Removal descent through one index tree. Empty data blocks and index
    /// blocks are freed on the way back up; the caller clears the slot (or
    /// the inode field) for a level that freed itself.
    fn remove_entry_tree(
        &mut self,
        depth: u8,
        root: u32,
        parent: u32,
        dir: &mut InodeRecord,
        child: u32,
    ) -> Result<Descent, FsError> {
        let bs = self.geo.block_size;
        let entries = self.geo.entries_per_block() as usize;
        let mut index = IndexBlock::load(&self.disk, &self.geo, root)?;

        if depth == 1 {
            for i in 0..index.len() {
                let Some(off) = index.slot(i).offset() else {
                    continue;
                };
                let mut block = self.disk.read_block_vec(off)?;
                for e in 0..entries {
                    let entry = entry_at(&block, e);
                    if !entry.is_in_use() || entry.inum != child {
                        continue;
                    }
                    put_entry(&mut block, e, &DirEntry::zeroed());
                    dir.link_count -= 1;
                    self.disk.write_block(off, &block)?;

                    let mut self_freed = false;
                    if !has_live_entries(&block, entries) {
                        self.smap.deallocate_sectors(off / bs)?;
                        dir.data_blocks = dir.data_blocks.saturating_sub(1);
                        index.set_slot(i, BlockPtr::Nil);
                        index.store(&self.disk, root)?;
                        if index.is_all_nil() {
                            self.smap.deallocate_sectors(root / bs)?;
                            self_freed = true;
                        }
                    }
                    write_inode(&self.disk, &self.geo, parent, dir)?;
                    return Ok(Descent::Removed { self_freed });
                }
            }
            return Ok(Descent::NotFound);
        }

        for i in 0..index.len() {
            let Some(off) = index.slot(i).offset() else {
                continue;
            };
            if let Descent::Removed { self_freed } =
                self.remove_entry_tree(depth - 1, off, parent, dir, child)?
            {
                let mut freed = false;
                if self_freed {
                    index.set_slot(i, BlockPtr::Nil);
                    index.store(&self.disk, root)?;
                    if index.is_all_nil() {
                        self.smap.deallocate_sectors(root / bs)?;
                        freed = true;
                    }
                }
                return Ok(Descent::Removed { self_freed: freed });
            }
        }
        Ok(Descent::NotFound)
    }

    /// Overwrites the name words of the entry for `child`, leaving the inode
    /// number and flag untouched. Returns false when no entry matches.
    pub fn rename_entry(
        &mut self,
        child: u32,
        new_name: &str,
        parent: u32,
    ) -> Result<bool, FsError> {
        let dir = self.open_file(parent)?;
        if !dir.is_dir() {
            return Ok(false);
        }

        let entries = self.geo.entries_per_block() as usize;
        let words = pack_name(new_name);

        for i in 0..INODE_DIRECT_PTRS {
            let Some(off) = dir.direct_ptr(i).offset() else {
                continue;
            };
            if self.rename_in_block(off, entries, child, words)? {
                return Ok(true);
            }
        }

        for depth in 1..=3u8 {
            if let Some(root) = dir.tree_root(depth).offset() {
                if self.rename_tree(depth, root, child, words)? {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    fn rename_in_block(
        &mut self,
        off: u32,
        entries: usize,
        child: u32,
        words: [u32; 2],
    ) -> Result<bool, FsError> {
        let mut block = self.disk.read_block_vec(off)?;
        for e in 0..entries {
            let mut entry = entry_at(&block, e);
            if entry.is_in_use() && entry.inum == child {
                entry.name = words;
                put_entry(&mut block, e, &entry);
                self.disk.write_block(off, &block)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn rename_tree(
        &mut self,
        depth: u8,
        root: u32,
        child: u32,
        words: [u32; 2],
    ) -> Result<bool, FsError> {
        let entries = self.geo.entries_per_block() as usize;
        let index = IndexBlock::load(&self.disk, &self.geo, root)?;
        for slot in index.iter() {
            let Some(off) = slot.offset() else { continue };
            let found = if depth == 1 {
                self.rename_in_block(off, entries, child, words)?
            } else {
                self.rename_tree(depth - 1, off, child, words)?
            };
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
