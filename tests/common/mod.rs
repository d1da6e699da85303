#![allow(dead_code)]

use std::sync::Arc;

use aegisvfs::{MemFsType, OpenFlags, Vfs};

/// Fresh VFS with a memfs root mounted; logging wired up for the test run.
pub fn new_vfs() -> Vfs {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::new();
    vfs.register_fs(Arc::new(MemFsType));
    vfs.mount("memfs", "mem0", None).expect("root mount");
    vfs
}

pub fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
    let f = vfs
        .open(path, OpenFlags::CREATE | OpenFlags::WRITE, 0o644)
        .expect("create file");
    f.write(data).expect("write");
    f.put();
}

pub fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
    let f = vfs.open(path, OpenFlags::READ, 0).expect("open file");
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = f.read(&mut buf).expect("read");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    f.put();
    out
}
