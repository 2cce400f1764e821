use crate::disk::BlockPtr;
use crate::error::FsError;
use crate::fs::Fsm;
use crate::inode::{InodeRecord, write_inode};
use crate::param::INODE_DIRECT_PTRS;

/// Result of a file write.
///
/// A write that runs the sector map dry keeps whatever it managed to put on
/// disk; `Partial` reports how far it got so the caller can truncate or
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Complete,
    Partial { blocks_written: u64 },
}

impl Fsm {
    /// Replaces the contents of the file with `data`.
    ///
    /// Direct blocks are overwritten in place (allocating unused slots on
    /// demand); any indirect level the size calls for is allocated fresh and
    /// filled. The block count is the floored quotient, as existing images
    /// record it.
    pub fn write_to_file(&mut self, inum: u32, data: &[u8]) -> Result<WriteOutcome, FsError> {
        let mut rec = self.open_file(inum)?;

        let size = data.len() as u64;
        if size > self.geo.max_file_size() || size > u32::MAX as u64 {
            return Err(FsError::InvalidArgument);
        }

        let bs = self.geo.block_size as u64;
        rec.file_size = size as u32;
        rec.data_blocks = (size / bs) as u32;

        let total_blocks = size.div_ceil(bs);
        let direct_blocks = total_blocks.min(INODE_DIRECT_PTRS as u64) as usize;
        let mut written = 0u64;
        let mut ran_out = false;

        for i in 0..direct_blocks {
            let off = match rec.direct_ptr(i) {
                BlockPtr::Offset(off) => off,
                BlockPtr::Nil => match self.smap.allocate_sectors(1)? {
                    BlockPtr::Offset(off) => {
                        rec.set_direct_ptr(i, BlockPtr::Offset(off));
                        off
                    }
                    BlockPtr::Nil => {
                        ran_out = true;
                        break;
                    }
                },
            };
            let start = i * bs as usize;
            let end = data.len().min(start + bs as usize);
            let mut block = vec![0u8; bs as usize];
            block[..end - start].copy_from_slice(&data[start..end]);
            self.disk.write_block(off, &block)?;
            written += 1;
        }

        if !ran_out && size > INODE_DIRECT_PTRS as u64 * bs {
            let s_size = self.geo.s_indirect_size();
            let d_size = self.geo.d_indirect_size();
            let direct_size = INODE_DIRECT_PTRS as u64 * bs;

            if size > d_size {
                // single and double full, the rest under the triple tree
                written += self.alloc_and_fill(
                    &mut rec,
                    1,
                    self.geo.level_blocks(1),
                    &data[direct_size as usize..s_size as usize],
                )?;
                written += self.alloc_and_fill(
                    &mut rec,
                    2,
                    self.geo.level_blocks(2),
                    &data[s_size as usize..d_size as usize],
                )?;
                let t_count = (size - d_size).div_ceil(bs);
                written +=
                    self.alloc_and_fill(&mut rec, 3, t_count, &data[d_size as usize..])?;
            } else if size > s_size {
                // single full, the rest under the double tree
                written += self.alloc_and_fill(
                    &mut rec,
                    1,
                    self.geo.level_blocks(1),
                    &data[direct_size as usize..s_size as usize],
                )?;
                let d_count = (size - s_size).div_ceil(bs);
                written +=
                    self.alloc_and_fill(&mut rec, 2, d_count, &data[s_size as usize..])?;
            } else {
                let s_count = (size - direct_size).div_ceil(bs);
                written +=
                    self.alloc_and_fill(&mut rec, 1, s_count, &data[direct_size as usize..])?;
            }
        }

        write_inode(&self.disk, &self.geo, inum, &rec)?;

        if written == total_blocks {
            Ok(WriteOutcome::Complete)
        } else {
            Ok(WriteOutcome::Partial {
                blocks_written: written,
            })
        }
    }

    /// Allocates one indirect level and fills it. A failed root allocation
    /// leaves the inode field null and writes nothing.
    fn alloc_and_fill(
        &mut self,
        rec: &mut InodeRecord,
        depth: u8,
        count: u64,
        data: &[u8],
    ) -> Result<u64, FsError> {
        let root = self.alloc_tree(depth, count as i64)?;
        rec.set_tree_root(depth, root);
        match root {
            BlockPtr::Offset(off) => self.write_tree(depth, off, data),
            BlockPtr::Nil => Ok(0),
        }
    }

    /// Reads the file into `buf`.
    ///
    /// The cursor advances one block per live direct pointer, then by the
    /// whole level capacity for each indirect tree, so the caller's buffer
    /// should hold `ceil(file_size / block_size)` blocks. Copying stops when
    /// the buffer is full.
    pub fn read_from_file(&mut self, inum: u32, buf: &mut [u8]) -> Result<(), FsError> {
        let rec = self.open_file(inum)?;
        let bs = self.geo.block_size as usize;
        let mut pos = 0usize;

        for i in 0..INODE_DIRECT_PTRS {
            if pos >= buf.len() {
                break;
            }
            if let Some(off) = rec.direct_ptr(i).offset() {
                let block = self.disk.read_block_vec(off)?;
                let take = bs.min(buf.len() - pos);
                buf[pos..pos + take].copy_from_slice(&block[..take]);
                pos += bs;
            }
        }

        for depth in 1..=3u8 {
            if pos >= buf.len() {
                break;
            }
            if let Some(root) = rec.tree_root(depth).offset() {
                self.read_tree(depth, root, buf, pos)?;
                pos += self.geo.level_blocks(depth) as usize * bs;
            }
        }

        Ok(())
    }
}
