// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_shmpool <segment_bytes> [a:<bytes> | f:<index>]...
//
// Bootstraps a private segment, replays the command list against it and
// prints the per-class counters after every step.
//
//   a:<bytes>  allocate a chunk of at least <bytes>; its slot index and
//              segment offset are printed
//   f:<index>  free the chunk allocated at slot <index>

use shmpool::ShmPool;

fn dump(pool: &ShmPool) {
    println!("{}", pool.stats().expect("stats"));
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_shmpool <segment_bytes> [a:<bytes> | f:<index>]...");
        std::process::exit(1);
    }

    let size: usize = args[1].parse().expect("segment size must be a number");
    let pool = ShmPool::bootstrap(size, false).expect("failed to bootstrap segment");
    dump(&pool);

    let mut slots: Vec<Option<*mut u8>> = Vec::new();

    for cmd in &args[2..] {
        if let Some(bytes) = cmd.strip_prefix("a:") {
            let bytes: usize = bytes.parse().expect("a:<bytes> must be a number");
            match pool.alloc(bytes) {
                Some(addr) => {
                    println!(
                        "slot {}: {} bytes at offset {:#x}",
                        slots.len(),
                        bytes,
                        pool.addr_to_offset(addr)
                    );
                    slots.push(Some(addr));
                }
                None => {
                    println!("slot {}: allocation of {bytes} bytes failed", slots.len());
                    slots.push(None);
                }
            }
        } else if let Some(index) = cmd.strip_prefix("f:") {
            let index: usize = index.parse().expect("f:<index> must be a number");
            match slots.get_mut(index).and_then(Option::take) {
                Some(addr) => {
                    unsafe { pool.free(addr) };
                    println!("slot {index}: freed");
                }
                None => println!("slot {index}: nothing to free"),
            }
        } else {
            println!("command unknown: {cmd}");
        }
        println!("------");
        dump(&pool);
    }
}
