//! Path resolution: components, dots, symlinks, mounts, and cache behavior.

mod common;

use std::sync::Arc;

use aegisvfs::{LookupFlags, NodeKind, OpenFlags, VfsError, MAX_SYMLINK_DEPTH};
use common::{new_vfs, read_file, write_file};

#[test]
fn resolve_files_and_directories() {
    let vfs = new_vfs();
    vfs.mkdir("/a", 0o755).unwrap();
    vfs.mkdir("/a/b", 0o755).unwrap();
    write_file(&vfs, "/a/b/f", b"hello");

    let f = vfs.resolve("/a/b/f").unwrap();
    let inode = f.inode().unwrap();
    assert_eq!(inode.kind(), NodeKind::File);
    assert_eq!(inode.size(), 5);

    let d = vfs.resolve("/a/b").unwrap();
    assert_eq!(d.inode().unwrap().kind(), NodeKind::Dir);
    assert_eq!(d.dentry().name(), "b");
}

#[test]
fn missing_components_are_not_found() {
    let vfs = new_vfs();
    vfs.mkdir("/a", 0o755).unwrap();
    assert!(matches!(vfs.resolve("/nope"), Err(VfsError::NotFound(_))));
    assert!(matches!(
        vfs.resolve("/a/nope/deeper"),
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn file_mid_path_is_not_a_directory() {
    let vfs = new_vfs();
    write_file(&vfs, "/f", b"x");
    assert!(matches!(
        vfs.resolve("/f/child"),
        Err(VfsError::NotADirectory(_))
    ));
}

#[test]
fn trailing_slash_requires_a_directory() {
    let vfs = new_vfs();
    vfs.mkdir("/d", 0o755).unwrap();
    write_file(&vfs, "/f", b"x");
    assert!(vfs.resolve("/d/").is_ok());
    assert!(matches!(
        vfs.resolve("/f/"),
        Err(VfsError::NotADirectory(_))
    ));
}

#[test]
fn dot_and_dotdot_components() {
    let vfs = new_vfs();
    vfs.mkdir("/a", 0o755).unwrap();
    vfs.mkdir("/a/b", 0o755).unwrap();

    let direct = vfs.resolve("/a/b").unwrap();
    let dotted = vfs.resolve("/a/./b").unwrap();
    assert!(Arc::ptr_eq(direct.dentry(), dotted.dentry()));

    let up = vfs.resolve("/a/b/..").unwrap();
    assert_eq!(up.inode().unwrap().ino(), vfs.resolve("/a").unwrap().inode().unwrap().ino());

    // Climbing at the root stays at the root.
    let root = vfs.resolve("/").unwrap();
    let above = vfs.resolve("/..").unwrap();
    assert!(Arc::ptr_eq(root.dentry(), above.dentry()));
}

#[test]
fn relative_symlink_resolves_from_its_directory() {
    let vfs = new_vfs();
    vfs.mkdir("/d1", 0o755).unwrap();
    vfs.mkdir("/d2", 0o755).unwrap();
    write_file(&vfs, "/d2/f", b"payload");
    vfs.symlink("/d1/link", "../d2").unwrap();

    let via_link = vfs.resolve("/d1/link/f").unwrap();
    let direct = vfs.resolve("/d2/f").unwrap();
    assert_eq!(
        via_link.inode().unwrap().ino(),
        direct.inode().unwrap().ino()
    );
    assert_eq!(read_file(&vfs, "/d1/link/f"), b"payload");
}

#[test]
fn absolute_symlink_restarts_at_the_root() {
    let vfs = new_vfs();
    vfs.mkdir("/d2", 0o755).unwrap();
    write_file(&vfs, "/d2/f", b"abs");
    vfs.symlink("/jump", "/d2/f").unwrap();

    assert_eq!(read_file(&vfs, "/jump"), b"abs");
    assert_eq!(vfs.read_link("/jump").unwrap(), "/d2/f");
}

#[test]
fn symlink_chain_at_the_depth_limit() {
    let vfs = new_vfs();
    write_file(&vfs, "/target", b"end");
    vfs.symlink("/l1", "/target").unwrap();
    for i in 2..=(MAX_SYMLINK_DEPTH + 1) {
        vfs.symlink(&format!("/l{i}"), &format!("/l{}", i - 1))
            .unwrap();
    }

    // A chain of exactly MAX_SYMLINK_DEPTH links resolves.
    let at_limit = format!("/l{MAX_SYMLINK_DEPTH}");
    assert_eq!(read_file(&vfs, &at_limit), b"end");

    // One more and the walk gives up.
    let over = format!("/l{}", MAX_SYMLINK_DEPTH + 1);
    assert!(matches!(vfs.resolve(&over), Err(VfsError::SymlinkLoop)));
}

#[test]
fn symlink_cycle_is_detected() {
    let vfs = new_vfs();
    vfs.symlink("/ping", "/pong").unwrap();
    vfs.symlink("/pong", "/ping").unwrap();
    assert!(matches!(vfs.resolve("/ping"), Err(VfsError::SymlinkLoop)));
}

#[test]
fn read_link_does_not_follow() {
    let vfs = new_vfs();
    vfs.mkdir("/d", 0o755).unwrap();
    vfs.symlink("/s", "d").unwrap();
    assert_eq!(vfs.read_link("/s").unwrap(), "d");

    write_file(&vfs, "/plain", b"x");
    assert!(matches!(
        vfs.read_link("/plain"),
        Err(VfsError::InvalidPath(_))
    ));
}

#[test]
fn final_symlink_followed_only_on_request() {
    let vfs = new_vfs();
    write_file(&vfs, "/f", b"x");
    vfs.symlink("/s", "/f").unwrap();

    let followed = vfs.resolve("/s").unwrap();
    assert_eq!(followed.inode().unwrap().kind(), NodeKind::File);

    let bare = vfs.resolve_with("/s", LookupFlags::empty()).unwrap();
    assert_eq!(bare.inode().unwrap().kind(), NodeKind::Symlink);
}

#[test]
fn negative_entries_cache_misses_until_creation() {
    let vfs = new_vfs();
    let sb = vfs.resolve("/").unwrap().dentry().sb().clone();

    assert!(matches!(vfs.resolve("/later"), Err(VfsError::NotFound(_))));
    assert!(matches!(vfs.resolve("/later"), Err(VfsError::NotFound(_))));
    assert_eq!(sb.cache_stats().negative, 1);

    write_file(&vfs, "/later", b"now");
    assert_eq!(sb.cache_stats().negative, 0);
    assert_eq!(read_file(&vfs, "/later"), b"now");
}

#[test]
fn usage_count_is_restored_when_references_drop() {
    let vfs = new_vfs();
    write_file(&vfs, "/u", b"x");

    let held = vfs.resolve("/u").unwrap();
    let dentry = held.dentry().clone();
    assert_eq!(dentry.usage_count(), 1);

    drop(held);
    assert_eq!(dentry.usage_count(), 0);

    // Still cached; a new walk resurrects the same entry.
    let again = vfs.resolve("/u").unwrap();
    assert!(Arc::ptr_eq(again.dentry(), &dentry));
    assert_eq!(dentry.usage_count(), 1);
}

#[test]
fn prune_evicts_only_unused_and_is_idempotent() {
    let vfs = new_vfs();
    write_file(&vfs, "/x", b"1");
    write_file(&vfs, "/y", b"2");
    let _ = vfs.resolve("/x").unwrap();
    let pinned = vfs.resolve("/y").unwrap();

    let freed = vfs.prune_caches(false);
    assert!(freed >= 1);
    let sb = pinned.dentry().sb().clone();
    assert_eq!(sb.cache_stats().unused, 0);
    assert_eq!(vfs.prune_caches(false), 0);

    drop(pinned);
    // Entries reload from the backend after eviction.
    assert_eq!(read_file(&vfs, "/x"), b"1");
}

#[test]
fn negative_only_prune_spares_positive_entries() {
    let vfs = new_vfs();
    write_file(&vfs, "/real", b"x");
    let _ = vfs.resolve("/real").unwrap();
    assert!(matches!(vfs.resolve("/fake"), Err(VfsError::NotFound(_))));

    let sb = vfs.resolve("/").unwrap().dentry().sb().clone();
    assert_eq!(vfs.prune_caches(true), 1);
    let stats = sb.cache_stats();
    assert_eq!(stats.negative, 0);
    assert!(stats.entries >= 2);
}

#[test]
fn mount_crossing_down_and_back_up() {
    let vfs = new_vfs();
    vfs.mkdir("/mnt", 0o755).unwrap();
    let child = vfs.mount("memfs", "mem1", Some("/mnt")).unwrap();
    write_file(&vfs, "/mnt/inner", b"other fs");

    // The walk lands on the mounted filesystem's root, not the mountpoint.
    let crossed = vfs.resolve("/mnt").unwrap();
    assert!(Arc::ptr_eq(crossed.dentry(), &child.root()));
    assert_eq!(crossed.dentry().sb().name(), "mem1");
    assert!(child.mountpoint().unwrap().is_mount_point());

    // ".." from inside the mount climbs back into the parent filesystem.
    let back = vfs.resolve("/mnt/..").unwrap();
    let root = vfs.resolve("/").unwrap();
    assert!(Arc::ptr_eq(back.dentry(), root.dentry()));

    assert_eq!(read_file(&vfs, "/mnt/inner"), b"other fs");
    assert_eq!(vfs.namespace().mount_count(), 2);
}

#[test]
fn cross_device_link_and_rename_are_rejected() {
    let vfs = new_vfs();
    vfs.mkdir("/mnt", 0o755).unwrap();
    vfs.mount("memfs", "mem1", Some("/mnt")).unwrap();
    write_file(&vfs, "/mnt/f", b"x");

    assert!(matches!(
        vfs.link("/mnt/f", "/hardlink"),
        Err(VfsError::CrossDevice)
    ));
    assert!(matches!(
        vfs.rename("/mnt/f", "/moved"),
        Err(VfsError::CrossDevice)
    ));
}

#[test]
fn rmdir_of_a_mountpoint_is_busy() {
    let vfs = new_vfs();
    vfs.mkdir("/mnt", 0o755).unwrap();
    vfs.mount("memfs", "mem1", Some("/mnt")).unwrap();
    assert!(matches!(vfs.rmdir("/mnt"), Err(VfsError::Busy(_))));
}

#[test]
fn second_root_mount_is_busy_and_unknown_type_unsupported() {
    let vfs = new_vfs();
    assert!(matches!(
        vfs.mount("memfs", "mem1", None),
        Err(VfsError::Busy(_))
    ));
    assert!(matches!(
        vfs.mount("nosuchfs", "dev", Some("/")),
        Err(VfsError::Unsupported)
    ));
}

#[test]
fn chdir_anchors_relative_paths() {
    let vfs = new_vfs();
    vfs.mkdir("/work", 0o755).unwrap();
    vfs.chdir("/work").unwrap();

    write_file(&vfs, "notes.txt", b"relative");
    assert_eq!(read_file(&vfs, "/work/notes.txt"), b"relative");
    assert_eq!(read_file(&vfs, "notes.txt"), b"relative");

    vfs.mkdir("sub", 0o755).unwrap();
    vfs.chdir("sub").unwrap();
    assert_eq!(read_file(&vfs, "../notes.txt"), b"relative");

    assert!(matches!(
        vfs.chdir("/work/notes.txt"),
        Err(VfsError::NotADirectory(_))
    ));
}

#[test]
fn open_file_pins_entries_against_prune() {
    let vfs = new_vfs();
    write_file(&vfs, "/pinned", b"stay");
    let f = vfs.open("/pinned", OpenFlags::READ, 0).unwrap();

    vfs.prune_caches(false);
    // The open file kept its dentry; reads still work without a reload.
    let mut buf = [0u8; 8];
    let n = f.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"stay");
    f.put();
}
