use std::env::args;
use std::path::Path;

use sectorfs::{Fsm, Geometry};

const DEFAULT_DISK_SIZE: u32 = 4 * 1024 * 1024;
const DEFAULT_BLOCK_SIZE: u32 = 512;
const DEFAULT_INODE_SIZE: u32 = 128;
const DEFAULT_INODE_COUNT: u32 = 1024;

fn main() {
    let args = args().collect::<Vec<String>>();

    if args.len() < 2 {
        println!(
            "Usage: mkfs <image-dir> [disk-size block-size inode-size inode-count]"
        );
        std::process::exit(1);
    }

    let parse = |i: usize, default: u32| -> u32 {
        args.get(i)
            .map(|s| s.parse().expect("invalid number"))
            .unwrap_or(default)
    };

    let disk_size = parse(2, DEFAULT_DISK_SIZE);
    let block_size = parse(3, DEFAULT_BLOCK_SIZE);
    let inode_size = parse(4, DEFAULT_INODE_SIZE);
    let inode_count = parse(5, DEFAULT_INODE_COUNT);
    let inode_blocks = (inode_count * inode_size).div_ceil(block_size);

    let geo = Geometry {
        disk_size,
        block_size,
        inode_size,
        inode_blocks,
        inode_count,
    };

    println!("{geo:?}");

    let fsm = Fsm::make(Path::new(&args[1]), geo, true).expect("failed to format image");
    println!(
        "{} sectors total, {} free after format",
        geo.sector_count(),
        fsm.free_sectors()
    );
    fsm.close();

    println!("done");
}
