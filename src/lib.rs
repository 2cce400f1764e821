// Disk layout:
// [ boot block | super block | inode table | data and index blocks ]
//
// Sector 0 holds the boot block, sector 1 the super block, and the next
// `inode_blocks` sectors the inode table. Everything after that is handed out
// by the sector map. All multi-byte on-disk values are little-endian and every
// pointer slot uses 0xFFFFFFFF as the null sentinel.

pub mod dir;
pub mod disk;
pub mod error;
pub mod file;
pub mod fs;
pub mod indirect;
pub mod inode;
pub mod param;
pub mod ssm;

pub use disk::BlockPtr;
pub use error::FsError;
pub use file::WriteOutcome;
pub use fs::Fsm;
pub use param::Geometry;
