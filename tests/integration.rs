//! End-to-end scenarios driven directly against `Volume`, without going
//! through a real FUSE mount (no root/privilege requirement in CI),
//! mirroring how the sibling pack's own `fdisk` tests exercise its `Disk`
//! type directly rather than through a mounted block device.

use nanofs::{FileKind, Volume};
use tempfile::NamedTempFile;

fn fresh_image() -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().set_len(4 * 1024 * 1024).unwrap();
    tmp
}

#[test]
fn format_and_root_exists() {
    let tmp = fresh_image();
    let mut v = Volume::mount(tmp.path()).unwrap();
    let attr = v.getattr("/").unwrap();
    assert!(matches!(attr.kind, FileKind::Directory));
    assert_eq!(attr.nlink, 2);
}

#[test]
fn mkdir_and_readdir_lists_children() {
    let tmp = fresh_image();
    let mut v = Volume::mount(tmp.path()).unwrap();
    v.mkdir("/home").unwrap();
    v.mkdir("/etc").unwrap();

    let mut names = Vec::new();
    let mut offset = 0;
    while let Some((name, _, _)) = v.readdir_entry("/", offset).unwrap() {
        names.push(name);
        offset += 1;
    }
    names.sort();
    assert_eq!(names, vec!["etc".to_string(), "home".to_string()]);
}

#[test]
fn write_read_and_truncate() {
    let tmp = fresh_image();
    let mut v = Volume::mount(tmp.path()).unwrap();
    v.mknod("/notes.txt", FileKind::Regular).unwrap();
    v.write("/notes.txt", 0, b"hello world").unwrap();
    assert_eq!(v.read("/notes.txt", 0, 11).unwrap(), b"hello world");

    v.truncate("/notes.txt", 5).unwrap();
    let attr = v.getattr("/notes.txt").unwrap();
    assert_eq!(attr.size, 5);
}

#[test]
fn persistence_round_trip_across_remount() {
    let tmp = fresh_image();
    {
        let mut v = Volume::mount(tmp.path()).unwrap();
        v.mkdir("/data").unwrap();
        v.mknod("/data/a.bin", FileKind::Regular).unwrap();
        v.write("/data/a.bin", 0, b"persisted bytes").unwrap();
        v.unmount().unwrap();
    }
    {
        let mut v = Volume::mount(tmp.path()).unwrap();
        let back = v.read("/data/a.bin", 0, "persisted bytes".len() as u32).unwrap();
        assert_eq!(back, b"persisted bytes");
    }
}

#[test]
fn symlink_readlink_and_unlink() {
    let tmp = fresh_image();
    let mut v = Volume::mount(tmp.path()).unwrap();
    v.mknod("/real.txt", FileKind::Regular).unwrap();
    v.symlink("/real.txt", "/link.txt").unwrap();
    assert_eq!(v.readlink("/link.txt").unwrap(), "/real.txt");

    v.unlink("/link.txt").unwrap();
    assert!(v.readlink("/link.txt").is_err());
    // The symlink's target was never touched.
    assert!(v.getattr("/real.txt").is_ok());
}

#[test]
fn rmdir_recursively_frees_allocator_ids() {
    let tmp = fresh_image();
    let mut v = Volume::mount(tmp.path()).unwrap();
    v.mkdir("/tree").unwrap();
    v.mkdir("/tree/a").unwrap();
    v.mknod("/tree/a/f1", FileKind::Regular).unwrap();
    v.mknod("/tree/f2", FileKind::Regular).unwrap();

    let tree_ino = v.getattr("/tree").unwrap().ino;
    let a_ino = v.getattr("/tree/a").unwrap().ino;
    let f1_ino = v.getattr("/tree/a/f1").unwrap().ino;
    let f2_ino = v.getattr("/tree/f2").unwrap().ino;

    v.rmdir("/tree").unwrap();
    assert!(v.getattr("/tree").is_err());
    assert!(v.getattr("/tree/a").is_err());
    assert!(v.getattr("/tree/a/f1").is_err());

    // The bitmap bits previously held by every node in the tree are clear.
    assert!(!v.is_inode_allocated(tree_ino));
    assert!(!v.is_inode_allocated(a_ino));
    assert!(!v.is_inode_allocated(f1_ino));
    assert!(!v.is_inode_allocated(f2_ino));

    // Freed ids are reusable: this should succeed, not run out of space.
    v.mkdir("/tree2").unwrap();
    v.mknod("/tree2/fresh", FileKind::Regular).unwrap();
}

#[test]
fn rmdir_frees_descendants_left_unmaterialized_across_a_remount() {
    let tmp = fresh_image();
    {
        let mut v = Volume::mount(tmp.path()).unwrap();
        v.mkdir("/d").unwrap();
        v.mkdir("/d/x").unwrap();
        v.unmount().unwrap();
    }
    let mut v = Volume::mount(tmp.path()).unwrap();
    let d_ino = v.getattr("/d").unwrap().ino;
    // Read `x`'s ino straight off the dentry, not via `getattr`, so its
    // inode stays unmaterialized going into `rmdir`.
    let (_, _, x_ino) = v.readdir_entry("/d", 0).unwrap().unwrap();

    // `/d/x`'s inode has not been touched since remount; `rmdir` must still
    // materialize and free it rather than only dropping its dentry.
    v.rmdir("/d").unwrap();
    assert!(v.getattr("/d").is_err());
    assert!(!v.is_inode_allocated(d_ino));
    assert!(!v.is_inode_allocated(x_ino));
}

#[test]
fn allocator_runs_out_of_data_blocks_gracefully() {
    let tmp = fresh_image();
    let mut v = Volume::mount(tmp.path()).unwrap();
    let capacity = v.data_count();
    let mut created = 0u32;
    for i in 0..capacity {
        if v.mknod(&format!("/f{i}"), FileKind::Regular).is_err() {
            break;
        }
        created += 1;
    }
    assert!(created > 0);
    assert!(created <= capacity);
}
