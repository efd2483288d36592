//! In-memory object graph: inodes and directory entries.
//!
//! Cyclic links (inode back to its dentry, dentry back to its parent) are
//! non-owning `Weak` references; everything that forms a tree (a dentry's
//! resolved inode, a directory's child-dentry chain threaded by `sibling`)
//! is an owning `Rc`. This mirrors the original's raw-pointer tree
//! (`dentry->brother`, `inode->dentrys`, `dentry->parent`) the way the spec's
//! own design notes prescribe translating it into safe Rust.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::format::{FileKind, MAX_NAME};

pub type DentryRef = Rc<RefCell<Dentry>>;
pub type InodeRef = Rc<RefCell<Inode>>;

pub struct Inode {
    pub ino: u32,
    pub kind: FileKind,
    pub size: u64,
    pub data_index: u32,
    /// Non-owning back-link to the dentry this inode was materialized
    /// through. Never used to keep the dentry alive.
    pub dentry: Weak<RefCell<Dentry>>,
    /// Head of the owning sibling chain of this directory's children.
    /// `None` for regular files and symlinks.
    pub children: Option<DentryRef>,
    pub dir_cnt: u32,
    /// Symlink target, valid only when `kind == Symlink`.
    pub target: [u8; MAX_NAME],
    /// One data block's worth of bytes, valid only when `kind == Regular`.
    pub data: Vec<u8>,
}

impl Inode {
    pub fn new(ino: u32, kind: FileKind, data_index: u32, dentry: &DentryRef) -> InodeRef {
        Rc::new(RefCell::new(Inode {
            ino,
            kind,
            size: 0,
            data_index,
            dentry: Rc::downgrade(dentry),
            children: None,
            dir_cnt: 0,
            target: [0u8; MAX_NAME],
            data: Vec::new(),
        }))
    }
}

pub struct Dentry {
    pub name: String,
    pub kind: FileKind,
    pub ino: u32,
    pub data_index: u32,
    /// Non-owning back-link to the parent directory's dentry. `None` for the
    /// root.
    pub parent: Option<Weak<RefCell<Dentry>>>,
    /// Next sibling in the owning head-insertion chain built by the parent
    /// directory's inode.
    pub sibling: Option<DentryRef>,
    /// The inode this dentry names, once materialized from disk.
    pub inode: Option<InodeRef>,
}

impl Dentry {
    pub fn new_root() -> DentryRef {
        Rc::new(RefCell::new(Dentry {
            name: "/".to_string(),
            kind: FileKind::Directory,
            ino: crate::format::ROOT_INO,
            data_index: 0,
            parent: None,
            sibling: None,
            inode: None,
        }))
    }

    pub fn new_child(
        name: &str,
        kind: FileKind,
        ino: u32,
        data_index: u32,
        parent: &DentryRef,
    ) -> DentryRef {
        Rc::new(RefCell::new(Dentry {
            name: name.to_string(),
            kind,
            ino,
            data_index,
            parent: Some(Rc::downgrade(parent)),
            sibling: None,
            inode: None,
        }))
    }
}

/// Head-inserts `child` into `parent`'s sibling chain and bumps `dir_cnt`,
/// mirroring `nfs_alloc_dentry`.
pub fn alloc_dentry(parent: &InodeRef, child: DentryRef) -> u32 {
    let mut p = parent.borrow_mut();
    child.borrow_mut().sibling = p.children.take();
    p.children = Some(child);
    p.dir_cnt += 1;
    p.dir_cnt
}

/// Unlinks `target` from `parent`'s sibling chain, mirroring
/// `nfs_drop_dentry`. Fails with `NotFound` if `target` is not a child.
pub fn drop_dentry(parent: &InodeRef, target: &DentryRef) -> Result<()> {
    let mut p = parent.borrow_mut();
    let is_head = match &p.children {
        Some(head) => Rc::ptr_eq(head, target),
        None => false,
    };
    if is_head {
        let next = target.borrow().sibling.clone();
        p.children = next;
        p.dir_cnt -= 1;
        return Ok(());
    }
    let mut cursor = p.children.clone();
    while let Some(node) = cursor {
        let next = node.borrow().sibling.clone();
        if let Some(ref n) = next {
            if Rc::ptr_eq(n, target) {
                let after = target.borrow().sibling.clone();
                node.borrow_mut().sibling = after;
                p.dir_cnt -= 1;
                return Ok(());
            }
        }
        cursor = next;
    }
    Err(Error::NotFound)
}

/// Returns the `dir`-th child dentry of `parent`, or `None` if out of
/// range, mirroring `nfs_get_dentry`.
pub fn get_dentry(parent: &InodeRef, dir: u32) -> Option<DentryRef> {
    let mut cursor = parent.borrow().children.clone();
    let mut i = 0u32;
    while let Some(node) = cursor {
        if i == dir {
            return Some(node);
        }
        cursor = node.borrow().sibling.clone();
        i += 1;
    }
    None
}

/// Iterates the live children of `parent` in sibling-chain order (most
/// recently inserted first, matching head-insertion).
pub fn children(parent: &InodeRef) -> Vec<DentryRef> {
    let mut out = Vec::new();
    let mut cursor = parent.borrow().children.clone();
    while let Some(node) = cursor {
        cursor = node.borrow().sibling.clone();
        out.push(node);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_dir(name: &str, ino: u32, parent: &DentryRef) -> (DentryRef, InodeRef) {
        let d = Dentry::new_child(name, FileKind::Directory, ino, 0, parent);
        let i = Inode::new(ino, FileKind::Directory, 0, &d);
        d.borrow_mut().inode = Some(i.clone());
        (d, i)
    }

    #[test]
    fn head_insertion_order() {
        let root = Dentry::new_root();
        let root_inode = Inode::new(0, FileKind::Directory, 0, &root);
        root.borrow_mut().inode = Some(root_inode.clone());

        let (a, _) = make_dir("a", 1, &root);
        alloc_dentry(&root_inode, a.clone());
        let (b, _) = make_dir("b", 2, &root);
        alloc_dentry(&root_inode, b.clone());

        let names: Vec<String> = children(&root_inode)
            .iter()
            .map(|d| d.borrow().name.clone())
            .collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(root_inode.borrow().dir_cnt, 2);
    }

    #[test]
    fn drop_dentry_updates_count_and_links() {
        let root = Dentry::new_root();
        let root_inode = Inode::new(0, FileKind::Directory, 0, &root);
        root.borrow_mut().inode = Some(root_inode.clone());

        let (a, _) = make_dir("a", 1, &root);
        alloc_dentry(&root_inode, a.clone());
        let (b, _) = make_dir("b", 2, &root);
        alloc_dentry(&root_inode, b.clone());
        let (c, _) = make_dir("c", 3, &root);
        alloc_dentry(&root_inode, c.clone());

        drop_dentry(&root_inode, &b).unwrap();
        assert_eq!(root_inode.borrow().dir_cnt, 2);
        let names: Vec<String> = children(&root_inode)
            .iter()
            .map(|d| d.borrow().name.clone())
            .collect();
        assert_eq!(names, vec!["c".to_string(), "a".to_string()]);
    }

    #[test]
    fn drop_unknown_dentry_fails() {
        let root = Dentry::new_root();
        let root_inode = Inode::new(0, FileKind::Directory, 0, &root);
        let (stray, _) = make_dir("stray", 9, &root);
        assert_eq!(drop_dentry(&root_inode, &stray), Err(Error::NotFound));
    }
}
