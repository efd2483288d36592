//! Path resolution: descends the in-memory tree, materializing inodes from
//! disk on demand, mirroring `nfs_lookup`.

use crate::error::Result;
use crate::format::FileKind;
use crate::node::{children, DentryRef};
use crate::volume::Volume;

/// Outcome of resolving a path.
pub struct Lookup {
    pub dentry: DentryRef,
    pub is_find: bool,
    pub is_root: bool,
}

/// Resolves `path` (must start with `/`) against `volume`'s tree, reading
/// inodes from disk as the walk needs them.
pub fn resolve(volume: &mut Volume, path: &str) -> Result<Lookup> {
    let root = volume.root();
    let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let total_lvl = components.len();

    if total_lvl == 0 {
        volume.ensure_materialized(&root)?;
        return Ok(Lookup {
            dentry: root,
            is_find: true,
            is_root: true,
        });
    }

    let mut current = root;
    volume.ensure_materialized(&current)?;

    for (lvl, name) in components.iter().enumerate() {
        let inode = current
            .borrow()
            .inode
            .clone()
            .expect("ensure_materialized guarantees an inode");
        let kind = inode.borrow().kind;

        if matches!(kind, FileKind::Regular | FileKind::Symlink) && lvl < total_lvl {
            return Ok(Lookup {
                dentry: current,
                is_find: false,
                is_root: false,
            });
        }

        let found = children(&inode).into_iter().find(|d| d.borrow().name == *name);
        match found {
            Some(child) => {
                volume.ensure_materialized(&child)?;
                current = child;
                if lvl + 1 == total_lvl {
                    return Ok(Lookup {
                        dentry: current,
                        is_find: true,
                        is_root: false,
                    });
                }
            }
            None => {
                return Ok(Lookup {
                    dentry: current,
                    is_find: false,
                    is_root: false,
                });
            }
        }
    }

    Ok(Lookup {
        dentry: current,
        is_find: true,
        is_root: false,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::FileKind;
    use tempfile::NamedTempFile;

    fn temp_volume() -> (NamedTempFile, Volume) {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(2 * 1024 * 1024).unwrap();
        let volume = Volume::mount(tmp.path()).unwrap();
        (tmp, volume)
    }

    #[test]
    fn root_resolves_with_is_root() {
        let (_tmp, mut v) = temp_volume();
        let lookup = resolve(&mut v, "/").unwrap();
        assert!(lookup.is_root);
        assert!(lookup.is_find);
    }

    #[test]
    fn missing_path_reports_not_found_without_erroring() {
        let (_tmp, mut v) = temp_volume();
        let lookup = resolve(&mut v, "/nope").unwrap();
        assert!(!lookup.is_find);
    }

    #[test]
    fn nested_lookup_after_mkdir() {
        let (_tmp, mut v) = temp_volume();
        v.mkdir("/a").unwrap();
        v.mkdir("/a/b").unwrap();
        let lookup = resolve(&mut v, "/a/b").unwrap();
        assert!(lookup.is_find);
        assert_eq!(lookup.dentry.borrow().kind as u8, FileKind::Directory as u8);
    }

    #[test]
    fn component_past_a_regular_file_is_not_found() {
        let (_tmp, mut v) = temp_volume();
        v.mknod("/f", FileKind::Regular).unwrap();
        let lookup = resolve(&mut v, "/f/x").unwrap();
        assert!(!lookup.is_find);
    }
}
