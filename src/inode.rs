use std::fs;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};

use crate::disk::{BlockPtr, DiskImage, NIL};
use crate::error::FsError;
use crate::param::{FSM_INODE_MAP, Geometry, INODE_DIRECT_PTRS};

/// Inode slot is unused
pub const FT_FREE: u32 = 0;
/// Regular file
pub const FT_FILE: u32 = 1;
/// Directory
pub const FT_DIR: u32 = 2;

/// On-disk inode record.
///
/// Stored at `2 * block_size + inum * inode_size`; the tail of each table
/// slot beyond this record is padding. Pointer fields hold byte offsets or
/// the null sentinel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InodeRecord {
    /// 0 = free, 1 = regular file, 2 = directory
    pub file_type: u32,
    /// Size of file (bytes)
    pub file_size: u32,
    /// Count of data blocks attributed to the file
    pub data_blocks: u32,
    /// For directories, the number of live entries; for files, the hard-link
    /// count
    pub link_count: u32,
    /// Direct data block addresses
    pub direct: [u32; INODE_DIRECT_PTRS],
    /// Top of the single-indirect tree
    pub s_indirect: u32,
    /// Top of the double-indirect tree
    pub d_indirect: u32,
    /// Top of the triple-indirect tree
    pub t_indirect: u32,
}

impl InodeRecord {
    /// Blank record: zeroed counters, every pointer slot null.
    pub fn new() -> Self {
        let mut rec = Self::zeroed();
        rec.init();
        rec
    }

    /// Zeroes the metadata and resets every pointer slot.
    pub fn init(&mut self) {
        self.file_type = FT_FREE;
        self.file_size = 0;
        self.data_blocks = 0;
        self.link_count = 0;
        self.init_ptrs();
    }

    /// Resets only the pointer slots, used when a directory runs out of
    /// entries.
    pub fn init_ptrs(&mut self) {
        self.direct = [NIL; INODE_DIRECT_PTRS];
        self.s_indirect = NIL;
        self.d_indirect = NIL;
        self.t_indirect = NIL;
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == FT_DIR
    }

    pub fn direct_ptr(&self, i: usize) -> BlockPtr {
        BlockPtr::from_raw(self.direct[i])
    }

    pub fn set_direct_ptr(&mut self, i: usize, ptr: BlockPtr) {
        self.direct[i] = ptr.to_raw();
    }

    /// Root of the indirect tree of the given depth (1, 2 or 3).
    pub fn tree_root(&self, depth: u8) -> BlockPtr {
        let raw = match depth {
            1 => self.s_indirect,
            2 => self.d_indirect,
            3 => self.t_indirect,
            _ => unreachable!("indirect depth out of range"),
        };
        BlockPtr::from_raw(raw)
    }

    pub fn set_tree_root(&mut self, depth: u8, ptr: BlockPtr) {
        let raw = ptr.to_raw();
        match depth {
            1 => self.s_indirect = raw,
            2 => self.d_indirect = raw,
            3 => self.t_indirect = raw,
            _ => unreachable!("indirect depth out of range"),
        }
    }
}

impl Default for InodeRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the inode record with number `inum` from the table.
pub fn read_inode(disk: &DiskImage, geo: &Geometry, inum: u32) -> Result<InodeRecord, FsError> {
    if inum >= geo.inode_count {
        return Err(FsError::InvalidArgument);
    }
    let mut buf = [0u8; size_of::<InodeRecord>()];
    disk.read_at(geo.inode_offset(inum), &mut buf)?;
    Ok(bytemuck::pod_read_unaligned(&buf))
}

/// Writes the inode record with number `inum` back to the table.
pub fn write_inode(
    disk: &DiskImage,
    geo: &Geometry,
    inum: u32,
    rec: &InodeRecord,
) -> Result<(), FsError> {
    if inum >= geo.inode_count {
        return Err(FsError::InvalidArgument);
    }
    disk.write_at(geo.inode_offset(inum), bytemuck::bytes_of(rec))
}

/// Inode allocation bitmap.
///
/// `inode_blocks` bytes backed by its own file. The bit convention is
/// preserved from existing images bit-for-bit: a fresh map is all 0xFF, a set
/// bit means the inode is free, and allocation clears the first set bit. Bit
/// `b` of byte `B` addresses inode `8 * B + b`, LSB first.
#[derive(Debug)]
pub struct InodeMap {
    map: Vec<u8>,
    path: PathBuf,
    inode_count: u32,
}

impl InodeMap {
    /// Creates a fresh all-free map, or loads the existing one when `fresh`
    /// is false.
    pub fn init(dir: &Path, geo: &Geometry, fresh: bool) -> Result<Self, FsError> {
        let path = dir.join(FSM_INODE_MAP);
        let bytes = geo.inode_blocks as usize;

        let map = if fresh {
            let map = vec![0xffu8; bytes];
            fs::write(&path, &map)?;
            map
        } else {
            let map = fs::read(&path)?;
            if map.len() != bytes {
                return Err(FsError::InvalidArgument);
            }
            map
        };

        Ok(Self {
            map,
            path,
            inode_count: geo.inode_count,
        })
    }

    fn sync(&self) -> Result<(), FsError> {
        fs::write(&self.path, &self.map)?;
        Ok(())
    }

    /// First free inode number, without claiming it.
    pub fn peek_free(&self) -> Option<u32> {
        for inum in 0..self.inode_count {
            if self.map[inum as usize / 8] & (1 << (inum % 8)) != 0 {
                return Some(inum);
            }
        }
        None
    }

    /// Claims the first free inode number.
    pub fn allocate(&mut self) -> Result<Option<u32>, FsError> {
        match self.peek_free() {
            Some(inum) => {
                self.map[inum as usize / 8] &= !(1 << (inum % 8));
                self.sync()?;
                Ok(Some(inum))
            }
            None => Ok(None),
        }
    }

    /// Returns an inode number to the free pool.
    pub fn deallocate(&mut self, inum: u32) -> Result<(), FsError> {
        if inum >= self.inode_count {
            return Err(FsError::InvalidArgument);
        }
        self.map[inum as usize / 8] |= 1 << (inum % 8);
        self.sync()
    }
}
