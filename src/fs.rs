use std::path::Path;

use bytemuck::{Pod, Zeroable};
use log::{error, warn};

use crate::dir::DirEntry;
use crate::disk::{BlockPtr, DiskImage, NIL};
use crate::error::FsError;
use crate::indirect::IndexBlock;
use crate::inode::{FT_DIR, FT_FILE, FT_FREE, InodeMap, InodeRecord, read_inode, write_inode};
use crate::param::{Geometry, HARD_DISK, INODE_DIRECT_PTRS};
use crate::ssm::SectorMap;

/// File system magic number
pub const FS_MAGIC: u32 = 0x1040_2030;

/// On-disk super block, written at sector 1 when the image is formatted.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SuperBlock {
    /// Must be `FS_MAGIC`
    pub magic: u32,
    /// Size of the disk image (bytes)
    pub disk_size: u32,
    /// Size of one sector (bytes)
    pub block_size: u32,
    /// Size of one inode table slot (bytes)
    pub inode_size: u32,
    /// Sectors occupied by the inode table
    pub inode_blocks: u32,
    /// Number of inodes
    pub inode_count: u32,
}

impl SuperBlock {
    fn for_geometry(geo: &Geometry) -> Self {
        Self {
            magic: FS_MAGIC,
            disk_size: geo.disk_size,
            block_size: geo.block_size,
            inode_size: geo.inode_size,
            inode_blocks: geo.inode_blocks,
            inode_count: geo.inode_count,
        }
    }
}

/// The file sector manager.
///
/// One value owns the disk handle, the geometry and both allocation bitmaps;
/// every operation threads through it. All I/O is synchronous and
/// single-owner: a successful operation's effects are fully on disk before
/// the next call begins.
#[derive(Debug)]
pub struct Fsm {
    pub(crate) geo: Geometry,
    pub(crate) disk: DiskImage,
    pub(crate) smap: SectorMap,
    pub(crate) imap: InodeMap,
    opened: Option<u32>,
}

impl Fsm {
    /// Formats a fresh image in `dir` and returns a handle to it.
    ///
    /// Zeroes the disk, resets both bitmaps (the sector map only when
    /// `init_ssm_map` is set), reserves the boot and super sectors plus the
    /// inode table, then creates inode 0 (boot block), inode 1 (super block)
    /// and inode 2 (the root directory with its `.` and `..` entries).
    pub fn make(dir: &Path, geo: Geometry, init_ssm_map: bool) -> Result<Self, FsError> {
        geo.validate()?;

        let disk = DiskImage::create(&dir.join(HARD_DISK), geo.disk_size, geo.block_size)?;
        let imap = InodeMap::init(dir, &geo, true)?;
        let smap = SectorMap::init(dir, &geo, init_ssm_map)?;

        let mut fsm = Self {
            geo,
            disk,
            smap,
            imap,
            opened: None,
        };

        // boot and super sectors
        if fsm.smap.allocate_sectors(2)?.is_nil() {
            return Err(FsError::OutOfSpace);
        }
        // inode table, 32 sectors at a time plus the remainder
        for _ in 0..geo.inode_blocks / 32 {
            if fsm.smap.allocate_sectors(32)?.is_nil() {
                return Err(FsError::OutOfSpace);
            }
        }
        let rem = geo.inode_blocks % 32;
        if rem > 0 && fsm.smap.allocate_sectors(rem)?.is_nil() {
            return Err(FsError::OutOfSpace);
        }

        let blank = InodeRecord::new();
        for inum in 0..geo.inode_count {
            write_inode(&fsm.disk, &geo, inum, &blank)?;
        }

        let sb = SuperBlock::for_geometry(&geo);
        fsm.disk
            .write_at(geo.block_size as u64, bytemuck::bytes_of(&sb))?;

        // inode 0 names the boot sector
        let boot = fsm.create_file(false, "", None)?;
        if boot != 0 {
            error!("corruption during file system creation: boot inode {boot}");
        }
        let mut rec = fsm.open_file(boot)?;
        rec.set_direct_ptr(0, BlockPtr::Offset(0));
        write_inode(&fsm.disk, &fsm.geo, boot, &rec)?;

        // inode 1 names the super sector
        let sup = fsm.create_file(false, "", None)?;
        if sup != 1 {
            error!("corruption during file system creation: super inode {sup}");
        }
        let mut rec = fsm.open_file(sup)?;
        rec.set_direct_ptr(0, BlockPtr::Offset(fsm.geo.block_size));
        write_inode(&fsm.disk, &fsm.geo, sup, &rec)?;

        // inode 2 is the root directory
        let root = fsm.create_file(true, "", None)?;
        if root != 2 {
            error!("corruption during file system creation: root inode {root}");
        }

        Ok(fsm)
    }

    /// Reopens an existing image, checking the super block against the
    /// caller's geometry.
    pub fn open(dir: &Path, geo: Geometry) -> Result<Self, FsError> {
        geo.validate()?;

        let disk = DiskImage::open(&dir.join(HARD_DISK), geo.block_size)?;
        let mut buf = [0u8; size_of::<SuperBlock>()];
        disk.read_at(geo.block_size as u64, &mut buf)?;
        let sb: SuperBlock = bytemuck::pod_read_unaligned(&buf);
        if sb != SuperBlock::for_geometry(&geo) {
            return Err(FsError::InvalidArgument);
        }

        let imap = InodeMap::init(dir, &geo, false)?;
        let smap = SectorMap::init(dir, &geo, false)?;

        Ok(Self {
            geo,
            disk,
            smap,
            imap,
            opened: None,
        })
    }

    /// Flushes and closes the image. A failure here is only reported.
    pub fn close(self) {
        if let Err(e) = self.disk.sync() {
            warn!("error closing disk image: {e}");
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Whether the sector holding the given byte offset is allocated.
    pub fn sector_allocated(&self, offset: u32) -> bool {
        self.smap.is_allocated(offset / self.geo.block_size)
    }

    /// Number of free sectors left on the image.
    pub fn free_sectors(&self) -> u32 {
        self.smap.free_sectors()
    }

    /// Creates a file or directory and inserts it into the parent.
    ///
    /// The inode number comes from the bitmap scan before the bit is
    /// claimed, which is what hands out inodes 0, 1, 2 in order during
    /// formatting. A new directory gets its `.` and `..` entries first; the
    /// root stores the null sentinel as its parent. Returns the new inode
    /// number.
    pub fn create_file(
        &mut self,
        is_directory: bool,
        name: &str,
        parent: Option<u32>,
    ) -> Result<u32, FsError> {
        let Some(inum) = self.imap.peek_free() else {
            return Err(FsError::OutOfInodes);
        };

        let mut rec = read_inode(&self.disk, &self.geo, inum)?;
        rec.init();
        rec.file_type = if is_directory { FT_DIR } else { FT_FILE };
        write_inode(&self.disk, &self.geo, inum, &rec)?;
        self.imap.allocate()?;

        if is_directory {
            self.insert_entry(inum, ".", inum)?;
            let parent_word = parent.unwrap_or(NIL);
            self.insert_entry(parent_word, "..", inum)?;
        }
        if let Some(parent) = parent {
            self.insert_entry(inum, name, parent)?;
        }

        Ok(inum)
    }

    /// Loads an inode, failing with `NotFound` when the slot is free.
    pub fn open_file(&mut self, inum: u32) -> Result<InodeRecord, FsError> {
        if inum == NIL {
            return Err(FsError::InvalidArgument);
        }
        let rec = read_inode(&self.disk, &self.geo, inum)?;
        if rec.file_type == FT_FREE {
            self.opened = None;
            return Err(FsError::NotFound);
        }
        self.opened = Some(inum);
        Ok(rec)
    }

    /// Forgets the currently open inode.
    pub fn close_file(&mut self) {
        self.opened = None;
    }

    /// The inode number most recently opened, if any.
    pub fn opened_file(&self) -> Option<u32> {
        self.opened
    }

    /// Removes a file or directory.
    ///
    /// Directories are torn down depth first: every child named by entry
    /// slots past `.` and `..` is removed before the blocks holding them are
    /// freed. A child that fails to go away is reported and skipped. The
    /// inode is then cleared and returned to the allocator, and the entry is
    /// dropped from the parent directory.
    pub fn remove_file(&mut self, inum: u32, parent: u32) -> Result<(), FsError> {
        let rec = self.open_file(inum)?;
        let file_type = rec.file_type;
        let bs = self.geo.block_size;

        for i in 0..INODE_DIRECT_PTRS {
            if let Some(off) = rec.direct_ptr(i).offset() {
                if file_type == FT_DIR {
                    self.remove_children(off, inum)?;
                }
                self.smap.deallocate_sectors(off / bs)?;
            }
        }

        for depth in 1..=3u8 {
            if let Some(root) = rec.tree_root(depth).offset() {
                let dir_ctx = if file_type == FT_DIR { inum } else { parent };
                self.remove_tree_blocks(depth, root, file_type, dir_ctx)?;
            }
        }

        // the children rewrote the table, so reload before clearing
        let mut rec = read_inode(&self.disk, &self.geo, inum)?;
        rec.init();
        write_inode(&self.disk, &self.geo, inum, &rec)?;
        self.imap.deallocate(inum)?;

        self.remove_entry(inum, parent)?;
        Ok(())
    }

    /// Removes every child named by a directory data block, skipping the
    /// first two entry slots (`.` and `..` in the directory's first block).
    fn remove_children(&mut self, block_off: u32, dir_inum: u32) -> Result<(), FsError> {
        let block = self.disk.read_block_vec(block_off)?;
        let entries = self.geo.entries_per_block() as usize;
        for slot in 2..entries {
            let entry = crate::dir::entry_at(&block, slot);
            if entry.is_in_use() {
                if let Err(e) = self.remove_file(entry.inum, dir_inum) {
                    warn!("failed to remove child inode {}: {e}", entry.inum);
                }
            }
        }
        Ok(())
    }

    /// Frees every block reachable from one indirect tree, recursing into
    /// directory children at the leaves first.
    fn remove_tree_blocks(
        &mut self,
        depth: u8,
        root: u32,
        file_type: u32,
        dir_inum: u32,
    ) -> Result<(), FsError> {
        let bs = self.geo.block_size;
        let index = IndexBlock::load(&self.disk, &self.geo, root)?;
        for slot in index.iter() {
            if let Some(off) = slot.offset() {
                if depth == 1 {
                    if file_type == FT_DIR {
                        self.remove_children(off, dir_inum)?;
                    }
                    self.smap.deallocate_sectors(off / bs)?;
                } else {
                    self.remove_tree_blocks(depth - 1, off, file_type, dir_inum)?;
                }
            }
        }
        self.smap.deallocate_sectors(root / bs)
    }

    /// Gives the entry for `inum` in the parent directory a new name.
    pub fn rename_file(&mut self, inum: u32, new_name: &str, parent: u32) -> Result<(), FsError> {
        if self.rename_entry(inum, new_name, parent)? {
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }

    /// Collects the live entries of a directory, direct blocks first, then
    /// each indirect tree in depth order.
    pub fn read_dir(&mut self, inum: u32) -> Result<Vec<DirEntry>, FsError> {
        let rec = self.open_file(inum)?;
        if !rec.is_dir() {
            return Err(FsError::InvalidArgument);
        }

        let mut blocks = Vec::new();
        for i in 0..INODE_DIRECT_PTRS {
            if let Some(off) = rec.direct_ptr(i).offset() {
                blocks.push(off);
            }
        }
        for depth in 1..=3u8 {
            if let Some(root) = rec.tree_root(depth).offset() {
                self.collect_leaf_blocks(depth, root, &mut blocks)?;
            }
        }

        let entries = self.geo.entries_per_block() as usize;
        let mut out = Vec::new();
        for off in blocks {
            let block = self.disk.read_block_vec(off)?;
            for slot in 0..entries {
                let entry = crate::dir::entry_at(&block, slot);
                if entry.is_in_use() {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }
}
