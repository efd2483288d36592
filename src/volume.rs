//! Mount/unmount protocol and the process-wide volume singleton.
//!
//! Generalizes `kernel/src/file/vfs/mountpoint.rs`'s `MountPoint` lifecycle
//! down to a single volume per process (no concurrent-mount registry is
//! needed; spec Non-goals exclude multi-threaded/multi-mount access), and
//! implements the format-detect / load / recursive-flush protocol from
//! `nfs_mount`/`nfs_umount`.

use std::path::Path;

use log::{info, warn};

use crate::bitmap::Bitmap;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::format::{
    DentryRecord, FileKind, InodeRecord, Superblock, DATA_COUNT, DATA_MAP_BLOCKS,
    INODE_MAP_BLOCKS, INODE_TABLE_BLOCKS, MAGIC, MAX_INO, ROOT_INO, SUPER_BLOCKS,
};
use crate::node::{alloc_dentry, Dentry, DentryRef, Inode, InodeRef};

/// Layout of the four fixed sections of the device, resolved once at mount
/// time from the superblock (or computed fresh on first format).
struct Layout {
    block: u64,
    map_inode_offset: u64,
    map_data_offset: u64,
    inode_offset: u64,
    data_offset: u64,
}

impl Layout {
    fn fresh(block: u64) -> Self {
        let map_inode_offset = SUPER_BLOCKS as u64 * block;
        let map_data_offset = map_inode_offset + INODE_MAP_BLOCKS as u64 * block;
        let inode_offset = map_data_offset + DATA_MAP_BLOCKS as u64 * block;
        // The inode table is `INODE_TABLE_BLOCKS` (514) wide on disk, matching
        // `nfs_utils.c`'s `data_offset = inode_offset + NFS_BLKS_SZ(inode_num)`
        // — `MAX_INO` (512) is the usable allocation count, not the table's
        // on-disk width, and must not be used to place the data region.
        let data_offset = inode_offset + INODE_TABLE_BLOCKS as u64 * block;
        Layout {
            block,
            map_inode_offset,
            map_data_offset,
            inode_offset,
            data_offset,
        }
    }

    fn from_superblock(block: u64, sb: &Superblock) -> Self {
        Layout {
            block,
            map_inode_offset: sb.map_inode_offset,
            map_data_offset: sb.map_data_offset,
            inode_offset: sb.inode_offset,
            data_offset: sb.data_offset,
        }
    }

    fn inode_slot(&self, ino: u32) -> u64 {
        self.inode_offset + ino as u64 * self.block
    }

    fn data_slot(&self, index: u32) -> u64 {
        self.data_offset + index as u64 * self.block
    }
}

/// The mounted filesystem: device handle, allocators, layout and the root
/// of the in-memory tree. Exactly one instance exists per process.
pub struct Volume {
    device: BlockDevice,
    layout: Layout,
    inode_map: Bitmap,
    data_map: Bitmap,
    root: DentryRef,
    usage: u64,
    mounted: bool,
}

impl Volume {
    /// Opens `path`, detects whether it already holds a formatted volume
    /// and either loads it or lays out a fresh one, mirroring `nfs_mount`.
    pub fn mount(path: &Path) -> Result<Self> {
        let mut device = BlockDevice::open(path)?;
        let block = device.io_size();

        let sb_bytes = device.read(0, Superblock::SIZE)?;
        let sb = Superblock::from_bytes(&sb_bytes);

        let root = Dentry::new_root();

        if sb.magic != MAGIC {
            info!("formatting new volume at {}", path.display());
            let layout = Layout::fresh(block);
            let root_inode = Inode::new(ROOT_INO, FileKind::Directory, 0, &root);
            root.borrow_mut().inode = Some(root_inode.clone());

            let mut inode_map = Bitmap::new(MAX_INO);
            let data_map = Bitmap::new(DATA_COUNT);
            let root_alloc = inode_map.alloc()?;
            debug_assert_eq!(root_alloc, ROOT_INO);

            let mut volume = Volume {
                device,
                layout,
                inode_map,
                data_map,
                root,
                usage: 0,
                mounted: true,
            };
            volume.sync_inode(&root_inode)?;
            volume.write_superblock()?;
            volume.write_bitmaps()?;
            Ok(volume)
        } else {
            info!("mounting existing volume at {}", path.display());
            let layout = Layout::from_superblock(block, &sb);

            let inode_map_bytes =
                device.read(sb.map_inode_offset, INODE_MAP_BLOCKS as usize * block as usize)?;
            let data_map_bytes =
                device.read(sb.map_data_offset, DATA_MAP_BLOCKS as usize * block as usize)?;

            let mut volume = Volume {
                device,
                layout,
                inode_map: Bitmap::from_bytes(inode_map_bytes, MAX_INO),
                data_map: Bitmap::from_bytes(data_map_bytes, DATA_COUNT),
                root,
                usage: sb.usage,
                mounted: true,
            };
            let root_inode = volume.read_inode(&volume.root.clone(), ROOT_INO)?;
            volume.root.borrow_mut().inode = Some(root_inode);
            Ok(volume)
        }
    }

    /// Flushes the tree, persists superblock and bitmaps, and releases the
    /// device, mirroring `nfs_umount`.
    pub fn unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        let root_inode = self
            .root
            .borrow()
            .inode
            .clone()
            .expect("root inode is always materialized while mounted");
        self.sync_inode(&root_inode)?;
        self.write_superblock()?;
        self.write_bitmaps()?;
        self.mounted = false;
        info!("unmounted volume cleanly");
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn root(&self) -> DentryRef {
        self.root.clone()
    }

    pub fn usage(&self) -> u64 {
        self.usage
    }

    pub fn data_count(&self) -> u32 {
        DATA_COUNT
    }

    pub fn io_size(&self) -> u64 {
        self.layout.block
    }

    /// Reports whether inode id `ino` is currently allocated — used to check
    /// the "`inode_bitmap[i.ino] == 1` iff live" invariant directly.
    pub fn is_inode_allocated(&self, ino: u32) -> bool {
        self.inode_map.is_set(ino)
    }

    /// Reports whether data-block id `index` is currently allocated — used
    /// to check the matching data-map half of the same invariant.
    pub fn is_data_allocated(&self, index: u32) -> bool {
        self.data_map.is_set(index)
    }

    fn write_superblock(&mut self) -> Result<()> {
        let sb = Superblock {
            magic: MAGIC,
            map_inode_offset: self.layout.map_inode_offset,
            map_inode_blocks: INODE_MAP_BLOCKS,
            map_data_offset: self.layout.map_data_offset,
            map_data_blocks: DATA_MAP_BLOCKS,
            inode_offset: self.layout.inode_offset,
            data_offset: self.layout.data_offset,
            usage: self.usage,
        };
        self.device.write(0, &sb.to_bytes())
    }

    fn write_bitmaps(&mut self) -> Result<()> {
        self.device
            .write(self.layout.map_inode_offset, self.inode_map.to_bytes())?;
        self.device
            .write(self.layout.map_data_offset, self.data_map.to_bytes())
    }

    /// Ensures `dentry`'s inode is materialized, reading it from disk if
    /// needed.
    pub(crate) fn ensure_materialized(&mut self, dentry: &DentryRef) -> Result<()> {
        let needs_read = dentry.borrow().inode.is_none();
        if needs_read {
            let ino = dentry.borrow().ino;
            let inode = self.read_inode(dentry, ino)?;
            dentry.borrow_mut().inode = Some(inode);
        }
        Ok(())
    }

    /// Reads one inode record plus (for directories) its child
    /// dentry records, mirroring `nfs_read_inode`. Child inodes are not
    /// materialized eagerly.
    pub(crate) fn read_inode(&mut self, owner: &DentryRef, ino: u32) -> Result<InodeRef> {
        let bytes = self.device.read(self.layout.inode_slot(ino), InodeRecord::SIZE)?;
        let rec = InodeRecord::from_bytes(&bytes).ok_or(Error::Io)?;

        let inode = Inode::new(rec.ino, rec.kind, rec.data_index, owner);
        {
            let mut i = inode.borrow_mut();
            i.size = rec.size;
            i.target = rec.target;
        }

        match rec.kind {
            FileKind::Directory => {
                let mut offset = self.layout.data_slot(rec.data_index);
                for _ in 0..rec.dir_cnt {
                    let entry_bytes = self.device.read(offset, DentryRecord::SIZE)?;
                    let entry = DentryRecord::from_bytes(&entry_bytes).ok_or(Error::Io)?;
                    let child = Dentry::new_child(
                        &entry.name_str(),
                        entry.kind,
                        entry.ino,
                        entry.data_index,
                        owner,
                    );
                    alloc_dentry(&inode, child);
                    offset += DentryRecord::SIZE as u64;
                }
            }
            FileKind::Regular => {
                let data = self.device.read(self.layout.data_slot(rec.data_index), self.layout.block as usize)?;
                inode.borrow_mut().data = data;
            }
            FileKind::Symlink => {}
        }

        Ok(inode)
    }

    /// Writes `inode`'s record and, recursively, its live children,
    /// mirroring `nfs_sync_inode`.
    pub(crate) fn sync_inode(&mut self, inode: &InodeRef) -> Result<()> {
        let (ino, kind, size, dir_cnt, data_index, target, data, child_records) = {
            let i = inode.borrow();
            let child_records: Vec<(DentryRecord, Option<InodeRef>)> = if matches!(i.kind, FileKind::Directory) {
                crate::node::children(inode)
                    .iter()
                    .map(|d| {
                        let d = d.borrow();
                        (
                            DentryRecord::new(&d.name, d.kind, d.ino, d.data_index),
                            d.inode.clone(),
                        )
                    })
                    .collect()
            } else {
                Vec::new()
            };
            (
                i.ino,
                i.kind,
                i.size,
                i.dir_cnt,
                i.data_index,
                i.target,
                i.data.clone(),
                child_records,
            )
        };

        let rec = InodeRecord {
            ino,
            size,
            kind,
            dir_cnt,
            data_index,
            target,
        };
        self.device.write(self.layout.inode_slot(ino), &rec.to_bytes())?;

        match kind {
            FileKind::Directory => {
                let mut offset = self.layout.data_slot(data_index);
                for (entry, _) in &child_records {
                    self.device.write(offset, &entry.to_bytes())?;
                    offset += DentryRecord::SIZE as u64;
                }
                for (_, child_inode) in child_records {
                    if let Some(child_inode) = child_inode {
                        self.sync_inode(&child_inode)?;
                    }
                }
            }
            FileKind::Regular => {
                self.device.write(self.layout.data_slot(data_index), &data)?;
            }
            FileKind::Symlink => {}
        }
        Ok(())
    }

    pub(crate) fn alloc_inode_id(&mut self) -> Result<u32> {
        self.inode_map.alloc()
    }

    pub(crate) fn free_inode_id(&mut self, ino: u32) {
        self.inode_map.free(ino);
    }

    pub(crate) fn alloc_data_id(&mut self) -> Result<u32> {
        self.data_map.alloc()
    }

    pub(crate) fn free_data_id(&mut self, index: u32) {
        self.data_map.free(index);
    }

    pub(crate) fn note_usage(&mut self, delta: i64) {
        if delta >= 0 {
            self.usage += delta as u64;
        } else {
            self.usage = self.usage.saturating_sub((-delta) as u64);
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.unmount() {
                warn!("unmount on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::NamedTempFile;

    fn temp_image() -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(2 * 1024 * 1024).unwrap();
        tmp
    }

    #[test]
    fn fresh_mount_creates_root() {
        let tmp = temp_image();
        let volume = Volume::mount(tmp.path()).unwrap();
        assert!(volume.is_mounted());
        assert!(volume.root().borrow().inode.is_some());
    }

    #[test]
    fn remount_after_unmount_preserves_state() {
        let tmp = temp_image();
        {
            let mut v = Volume::mount(tmp.path()).unwrap();
            v.mkdir("/dir").unwrap();
            v.unmount().unwrap();
        }
        let mut v2 = Volume::mount(tmp.path()).unwrap();
        let lookup = crate::resolver::resolve(&mut v2, "/dir").unwrap();
        assert!(lookup.is_find);
    }
}
