use std::fs;
use std::path::Path;

use rand::RngCore;

use sectorfs::disk::NIL;
use sectorfs::inode::{FT_DIR, FT_FILE};
use sectorfs::param::HARD_DISK;
use sectorfs::{FsError, Fsm, Geometry, WriteOutcome};

fn geo_small() -> Geometry {
    Geometry {
        disk_size: 64 * 2048,
        block_size: 64,
        inode_size: 128,
        inode_blocks: 128,
        inode_count: 64,
    }
}

fn u32_at(img: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(img[off..off + 4].try_into().unwrap())
}

fn tree_blocks(
    img: &[u8],
    geo: &Geometry,
    depth: u8,
    root: u32,
    data: &mut Vec<u32>,
    index: &mut Vec<u32>,
) {
    index.push(root);
    for i in 0..geo.ptrs_per_block() as usize {
        let ptr = u32_at(img, root as usize + 4 * i);
        if ptr == NIL {
            continue;
        }
        if depth == 1 {
            data.push(ptr);
        } else {
            tree_blocks(img, geo, depth - 1, ptr, data, index);
        }
    }
}

/// Walks the raw image and checks the universal invariants: pointer validity,
/// no reachable all-null index block, and directory link counts matching the
/// live entries.
fn fsck(dir: &Path, geo: &Geometry) {
    let img = fs::read(dir.join(HARD_DISK)).unwrap();
    let bs = geo.block_size as usize;

    for inum in 0..geo.inode_count {
        let base = 2 * bs + (inum * geo.inode_size) as usize;
        let file_type = u32_at(&img, base);
        if file_type != FT_FILE && file_type != FT_DIR {
            continue;
        }
        let link_count = u32_at(&img, base + 12);

        let mut data = Vec::new();
        let mut index = Vec::new();
        for i in 0..10 {
            let ptr = u32_at(&img, base + 16 + 4 * i);
            if ptr != NIL {
                data.push(ptr);
            }
        }
        for (depth, field) in [(1u8, 56), (2, 60), (3, 64)] {
            let root = u32_at(&img, base + field);
            if root != NIL {
                tree_blocks(&img, geo, depth, root, &mut data, &mut index);
            }
        }

        for &ptr in data.iter().chain(index.iter()) {
            assert!(ptr < geo.disk_size, "inode {inum}: pointer {ptr} out of range");
            assert!(
                ptr as usize % bs == 0,
                "inode {inum}: pointer {ptr} not block-aligned"
            );
        }

        for &ib in &index {
            let live = (0..geo.ptrs_per_block() as usize)
                .any(|i| u32_at(&img, ib as usize + 4 * i) != NIL);
            assert!(live, "inode {inum}: reachable index block {ib} is all null");
        }

        if file_type == FT_DIR {
            let mut live_entries = 0;
            for &block in &data {
                for slot in 0..geo.entries_per_block() as usize {
                    if u32_at(&img, block as usize + slot * 16 + 12) == 1 {
                        live_entries += 1;
                    }
                }
            }
            assert_eq!(
                live_entries, link_count,
                "inode {inum}: link count does not match live entries"
            );
        }
    }
}

#[test]
fn fresh_image_has_boot_super_and_root() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    assert_eq!(fsm.open_file(0).unwrap().file_type, FT_FILE);
    assert_eq!(fsm.open_file(1).unwrap().file_type, FT_FILE);
    let root = fsm.open_file(2).unwrap();
    assert_eq!(root.file_type, FT_DIR);
    assert_eq!(root.link_count, 2);

    let entries = fsm.read_dir(2).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name_str(), ".");
    assert_eq!(entries[0].inum, 2);
    assert_eq!(entries[1].name_str(), "..");
    // the root has no parent
    assert_eq!(entries[1].inum, NIL);

    fsck(dir.path(), &geo);
}

#[test]
fn create_then_remove_frees_sectors_and_inode() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "a", Some(2)).unwrap();
    assert_eq!(inum, 3);
    assert_eq!(fsm.read_dir(2).unwrap().len(), 3);

    assert_eq!(
        fsm.write_to_file(inum, &[0x5a; 64]).unwrap(),
        WriteOutcome::Complete
    );
    let rec = fsm.open_file(inum).unwrap();
    let block = rec.direct_ptr(0).offset().unwrap();
    assert!(fsm.sector_allocated(block));

    fsm.remove_file(inum, 2).unwrap();
    assert_eq!(fsm.read_dir(2).unwrap().len(), 2);
    assert!(!fsm.sector_allocated(block));
    assert!(matches!(fsm.open_file(inum), Err(FsError::NotFound)));

    // the freed inode is handed out again
    assert_eq!(fsm.create_file(false, "b", Some(2)).unwrap(), 3);

    fsck(dir.path(), &geo);
}

#[test]
fn ten_block_file_fits_in_direct_pointers() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "f", Some(2)).unwrap();
    let data: Vec<u8> = (0..640u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(
        fsm.write_to_file(inum, &data).unwrap(),
        WriteOutcome::Complete
    );

    let rec = fsm.open_file(inum).unwrap();
    assert_eq!(rec.file_size, 640);
    assert_eq!(rec.data_blocks, 10);
    assert_eq!(rec.s_indirect, NIL);

    let mut back = vec![0u8; 640];
    fsm.read_from_file(inum, &mut back).unwrap();
    assert_eq!(back, data);

    fsck(dir.path(), &geo);
}

#[test]
fn eleventh_block_spills_into_single_indirect() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "f", Some(2)).unwrap();
    let free_before = fsm.free_sectors();

    let data: Vec<u8> = (0..704u32).map(|i| (i % 239) as u8).collect();
    assert_eq!(
        fsm.write_to_file(inum, &data).unwrap(),
        WriteOutcome::Complete
    );

    // 10 direct blocks, one index block and one indirect data block
    assert_eq!(free_before - fsm.free_sectors(), 12);
    let rec = fsm.open_file(inum).unwrap();
    assert_ne!(rec.s_indirect, NIL);
    assert_eq!(rec.data_blocks, 11);

    let mut back = vec![0u8; 704];
    fsm.read_from_file(inum, &mut back).unwrap();
    assert_eq!(back, data);

    fsck(dir.path(), &geo);
}

#[test]
fn round_trip_across_every_level() {
    // one block shy of each boundary, the boundary itself, and one past it,
    // up into the triple-indirect tree
    let sizes = [
        1usize, 63, 64, 65, 640, 704, 1663, 1664, 1665, 5000, 18047, 18048, 18100, 20000,
    ];
    let mut rng = rand::thread_rng();

    for &size in &sizes {
        let dir = tempfile::tempdir().unwrap();
        let geo = geo_small();
        let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();
        let inum = fsm.create_file(false, "f", Some(2)).unwrap();

        let mut data = vec![0u8; size];
        rng.fill_bytes(&mut data);
        assert_eq!(
            fsm.write_to_file(inum, &data).unwrap(),
            WriteOutcome::Complete,
            "size {size}"
        );

        let rec = fsm.open_file(inum).unwrap();
        assert_eq!(rec.file_size as usize, size);
        assert_eq!(rec.data_blocks as usize, size / 64);

        let mut back = vec![0u8; size.div_ceil(64) * 64];
        fsm.read_from_file(inum, &mut back).unwrap();
        assert_eq!(&back[..size], &data[..], "size {size}");

        fsck(dir.path(), &geo);
    }
}

#[test]
fn empty_write_allocates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "f", Some(2)).unwrap();
    let free_before = fsm.free_sectors();
    assert_eq!(
        fsm.write_to_file(inum, &[]).unwrap(),
        WriteOutcome::Complete
    );
    assert_eq!(fsm.free_sectors(), free_before);

    let rec = fsm.open_file(inum).unwrap();
    assert_eq!(rec.file_size, 0);
    assert_eq!(rec.data_blocks, 0);
}

#[test]
fn oversized_write_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "f", Some(2)).unwrap();
    let data = vec![0u8; geo.max_file_size() as usize + 1];
    assert!(matches!(
        fsm.write_to_file(inum, &data),
        Err(FsError::InvalidArgument)
    ));
}

#[test]
fn link_count_tracks_live_entries() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let mut inodes = Vec::new();
    for i in 0..10 {
        inodes.push(fsm.create_file(false, &format!("f{i}"), Some(2)).unwrap());
    }
    for &inum in &[inodes[2], inodes[5], inodes[7]] {
        fsm.remove_file(inum, 2).unwrap();
    }

    let root = fsm.open_file(2).unwrap();
    assert_eq!(root.link_count, 9);
    assert_eq!(fsm.read_dir(2).unwrap().len(), 9);

    fsck(dir.path(), &geo);
}

#[test]
fn rename_to_same_name_leaves_image_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "abc", Some(2)).unwrap();
    let before = fs::read(dir.path().join(HARD_DISK)).unwrap();

    fsm.rename_file(inum, "abc", 2).unwrap();
    let after = fs::read(dir.path().join(HARD_DISK)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn rename_changes_only_the_name() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "abc", Some(2)).unwrap();
    fsm.rename_file(inum, "xyz", 2).unwrap();

    let entries = fsm.read_dir(2).unwrap();
    let entry = entries.iter().find(|e| e.inum == inum).unwrap();
    assert_eq!(entry.name_str(), "xyz");
    assert!(!entries.iter().any(|e| e.name_str() == "abc"));

    assert!(matches!(
        fsm.rename_file(42, "nope", 2),
        Err(FsError::NotFound)
    ));

    fsck(dir.path(), &geo);
}

#[test]
fn root_overflows_through_every_indirect_level() {
    let dir = tempfile::tempdir().unwrap();
    // direct blocks hold 40 entries, the single tree 64, the double tree
    // 1024; 1200 children plus `.` and `..` spill into the triple tree
    let geo = Geometry {
        disk_size: 64 * 4096,
        block_size: 64,
        inode_size: 128,
        inode_blocks: 2560,
        inode_count: 1280,
    };
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let count = 1200u32;
    for i in 0..count {
        let inum = fsm.create_file(false, &format!("f{i}"), Some(2)).unwrap();
        assert_eq!(inum, 3 + i);
    }

    let root = fsm.open_file(2).unwrap();
    assert_eq!(root.link_count, count + 2);
    assert_ne!(root.s_indirect, NIL);
    assert_ne!(root.d_indirect, NIL);
    assert_ne!(root.t_indirect, NIL);
    fsck(dir.path(), &geo);

    // every entry is reachable by inode number
    for i in 0..count {
        fsm.rename_file(3 + i, &format!("g{i}"), 2).unwrap();
    }

    for i in 0..count {
        fsm.remove_file(3 + i, 2).unwrap();
    }

    let root = fsm.open_file(2).unwrap();
    assert_eq!(root.link_count, 2);
    assert_eq!(root.s_indirect, NIL);
    assert_eq!(root.d_indirect, NIL);
    assert_eq!(root.t_indirect, NIL);
    assert_eq!(fsm.read_dir(2).unwrap().len(), 2);

    fsck(dir.path(), &geo);
}

#[test]
fn recursive_removal_tears_down_nested_directories() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let d1 = fsm.create_file(true, "d1", Some(2)).unwrap();
    let d2 = fsm.create_file(true, "d2", Some(d1)).unwrap();
    let f = fsm.create_file(false, "f", Some(d2)).unwrap();
    fsm.write_to_file(f, &[0x42; 128]).unwrap();

    let mut sectors = Vec::new();
    for inum in [d1, d2, f] {
        let rec = fsm.open_file(inum).unwrap();
        for i in 0..10 {
            if let Some(off) = rec.direct_ptr(i).offset() {
                sectors.push(off);
            }
        }
    }
    assert_eq!(sectors.len(), 4);

    fsm.remove_file(d1, 2).unwrap();

    assert_eq!(fsm.read_dir(2).unwrap().len(), 2);
    for off in sectors {
        assert!(!fsm.sector_allocated(off), "sector {off} still allocated");
    }
    for inum in [d1, d2, f] {
        assert!(matches!(fsm.open_file(inum), Err(FsError::NotFound)));
    }

    // the whole subtree's inodes are reusable
    assert_eq!(fsm.create_file(false, "n", Some(2)).unwrap(), d1);

    fsck(dir.path(), &geo);
}

#[test]
fn exhausted_inode_bitmap_reports_out_of_inodes() {
    let dir = tempfile::tempdir().unwrap();
    let geo = Geometry {
        disk_size: 64 * 64,
        block_size: 64,
        inode_size: 128,
        inode_blocks: 8,
        inode_count: 4,
    };
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    assert_eq!(fsm.create_file(false, "a", Some(2)).unwrap(), 3);
    assert!(matches!(
        fsm.create_file(false, "b", Some(2)),
        Err(FsError::OutOfInodes)
    ));
}

#[test]
fn full_disk_write_reports_partial() {
    let dir = tempfile::tempdir().unwrap();
    let geo = Geometry {
        disk_size: 64 * 32,
        block_size: 64,
        inode_size: 128,
        inode_blocks: 8,
        inode_count: 4,
    };
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    let inum = fsm.create_file(false, "f", Some(2)).unwrap();
    // 25 blocks cannot fit on the handful of free sectors left
    let data = vec![0x77u8; 25 * 64];
    match fsm.write_to_file(inum, &data).unwrap() {
        WriteOutcome::Partial { blocks_written } => {
            assert!(blocks_written < 25);
            assert!(blocks_written > 0);
        }
        WriteOutcome::Complete => panic!("write cannot complete on a full disk"),
    }
    assert_eq!(fsm.free_sectors(), 0);
}

#[test]
fn image_reopens_with_matching_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let data = b"persistent".to_vec();

    let inum = {
        let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();
        let inum = fsm.create_file(false, "keep", Some(2)).unwrap();
        fsm.write_to_file(inum, &data).unwrap();
        fsm.close();
        inum
    };

    let mut fsm = Fsm::open(dir.path(), geo).unwrap();
    let mut back = vec![0u8; 64];
    fsm.read_from_file(inum, &mut back).unwrap();
    assert_eq!(&back[..data.len()], &data[..]);
    let entries = fsm.read_dir(2).unwrap();
    assert!(entries.iter().any(|e| e.name_str() == "keep"));

    let mut wrong = geo;
    wrong.disk_size = geo.disk_size * 2;
    assert!(matches!(
        Fsm::open(dir.path(), wrong),
        Err(FsError::InvalidArgument)
    ));
}

#[test]
fn open_file_validates_inode_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let geo = geo_small();
    let mut fsm = Fsm::make(dir.path(), geo, true).unwrap();

    assert!(matches!(fsm.open_file(50), Err(FsError::NotFound)));
    assert!(matches!(fsm.open_file(NIL), Err(FsError::InvalidArgument)));
    assert!(matches!(
        fsm.open_file(geo.inode_count),
        Err(FsError::InvalidArgument)
    ));
    fsm.close_file();
}
