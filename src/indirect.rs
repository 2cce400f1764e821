use crate::disk::{BlockPtr, DiskImage, NIL};
use crate::error::FsError;
use crate::fs::Fsm;
use crate::param::Geometry;

/// An index block: `ptrs_per_block` pointer slots, unused slots null.
#[derive(Debug, Clone)]
pub struct IndexBlock {
    slots: Vec<u32>,
}

impl IndexBlock {
    /// Fresh index block with every slot null.
    pub fn nil_filled(geo: &Geometry) -> Self {
        Self {
            slots: vec![NIL; geo.ptrs_per_block() as usize],
        }
    }

    pub fn load(disk: &DiskImage, geo: &Geometry, offset: u32) -> Result<Self, FsError> {
        let raw = disk.read_block_vec(offset)?;
        let slots = raw
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(Self { slots })
    }

    pub fn store(&self, disk: &DiskImage, offset: u32) -> Result<(), FsError> {
        let mut raw = Vec::with_capacity(self.slots.len() * 4);
        for slot in &self.slots {
            raw.extend_from_slice(&slot.to_le_bytes());
        }
        disk.write_block(offset, &raw)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, i: usize) -> BlockPtr {
        BlockPtr::from_raw(self.slots[i])
    }

    pub fn set_slot(&mut self, i: usize, ptr: BlockPtr) {
        self.slots[i] = ptr.to_raw();
    }

    /// True when no slot points anywhere, meaning the block must be freed.
    pub fn is_all_nil(&self) -> bool {
        self.slots.iter().all(|&s| s == NIL)
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockPtr> + '_ {
        self.slots.iter().map(|&s| BlockPtr::from_raw(s))
    }
}

impl Fsm {
    /// Allocates an index tree of the given depth holding up to `count` data
    /// blocks.
    ///
    /// The index block is written null-filled first, then populated in slot
    /// order. A data sector the map cannot provide leaves its slot null and
    /// the loop carries on; partial trees are kept, there is no rollback.
    pub fn alloc_tree(&mut self, depth: u8, count: i64) -> Result<BlockPtr, FsError> {
        let root = match self.smap.allocate_sectors(1)? {
            BlockPtr::Offset(off) => off,
            BlockPtr::Nil => return Ok(BlockPtr::Nil),
        };

        let mut index = IndexBlock::nil_filled(&self.geo);
        index.store(&self.disk, root)?;

        if depth == 1 {
            let limit = (count.max(0) as u64).min(self.geo.ptrs_per_block() as u64);
            let mut next = 0;
            for _ in 0..limit {
                if let BlockPtr::Offset(addr) = self.smap.allocate_sectors(1)? {
                    index.set_slot(next, BlockPtr::Offset(addr));
                    next += 1;
                }
            }
        } else {
            let child_cap = self.geo.level_blocks(depth - 1) as i64;
            let mut remaining = count;
            for i in 0..index.len() {
                let child = self.alloc_tree(depth - 1, remaining)?;
                index.set_slot(i, child);
                remaining -= child_cap;
                if remaining < 0 {
                    break;
                }
            }
        }

        index.store(&self.disk, root)?;
        Ok(BlockPtr::Offset(root))
    }

    /// Writes `data` into an already-allocated tree, block by block, stopping
    /// at the first null slot or when the data runs out. Returns the number
    /// of data blocks written; the tail block is zero-padded.
    pub fn write_tree(&mut self, depth: u8, root: u32, data: &[u8]) -> Result<u64, FsError> {
        let index = IndexBlock::load(&self.disk, &self.geo, root)?;
        let bs = self.geo.block_size as usize;
        let mut data = data;
        let mut blocks = 0u64;

        if depth == 1 {
            for i in 0..index.len() {
                if data.is_empty() {
                    break;
                }
                let Some(off) = index.slot(i).offset() else {
                    break;
                };
                let take = bs.min(data.len());
                let mut block = vec![0u8; bs];
                block[..take].copy_from_slice(&data[..take]);
                self.disk.write_block(off, &block)?;
                blocks += 1;
                data = &data[take..];
            }
        } else {
            let child_cap = self.geo.level_blocks(depth - 1) as usize * bs;
            for i in 0..index.len() {
                if data.is_empty() {
                    break;
                }
                let Some(off) = index.slot(i).offset() else {
                    break;
                };
                // the chunk handed to the child always advances the cursor by
                // the intended amount, even if the child tree is incomplete
                let take = child_cap.min(data.len());
                blocks += self.write_tree(depth - 1, off, &data[..take])?;
                data = &data[take..];
            }
        }

        Ok(blocks)
    }

    /// Reads a tree into `buf` starting at byte position `base`. The leaf
    /// level advances one block per live slot; inner levels advance by the
    /// whole child capacity per live slot.
    pub fn read_tree(
        &mut self,
        depth: u8,
        root: u32,
        buf: &mut [u8],
        base: usize,
    ) -> Result<(), FsError> {
        let index = IndexBlock::load(&self.disk, &self.geo, root)?;
        let bs = self.geo.block_size as usize;
        let mut pos = base;

        if depth == 1 {
            for slot in index.iter() {
                if pos >= buf.len() {
                    break;
                }
                if let Some(off) = slot.offset() {
                    let block = self.disk.read_block_vec(off)?;
                    let take = bs.min(buf.len() - pos);
                    buf[pos..pos + take].copy_from_slice(&block[..take]);
                    pos += bs;
                }
            }
        } else {
            let child_cap = self.geo.level_blocks(depth - 1) as usize * bs;
            for slot in index.iter() {
                if pos >= buf.len() {
                    break;
                }
                if let Some(off) = slot.offset() {
                    self.read_tree(depth - 1, off, buf, pos)?;
                    pos += child_cap;
                }
            }
        }

        Ok(())
    }

    /// Collects the offsets of every data block reachable from the tree.
    pub fn collect_leaf_blocks(
        &mut self,
        depth: u8,
        root: u32,
        out: &mut Vec<u32>,
    ) -> Result<(), FsError> {
        let index = IndexBlock::load(&self.disk, &self.geo, root)?;
        for slot in index.iter() {
            if let Some(off) = slot.offset() {
                if depth == 1 {
                    out.push(off);
                } else {
                    self.collect_leaf_blocks(depth - 1, off, out)?;
                }
            }
        }
        Ok(())
    }
}
