//! On-disk record layout.
//!
//! Every record is packed by hand into little-endian bytes with a fixed,
//! documented size — no reliance on host struct layout, per the original
//! program's own need to read back a device image written by a possibly
//! different build. Counts and offsets below mirror the fixed layout
//! `nfs_mount` builds the first time it sees an unformatted device.

pub const MAGIC: u32 = 0x4e_46_53_21; // "NFS!"

/// Fixed-size buffer for a name or a symlink target, matching the original
/// program's inline-name convention.
pub const MAX_NAME: usize = 60;

/// Blocks occupied by the superblock.
pub const SUPER_BLOCKS: u32 = 1;
/// Blocks occupied by the inode bitmap.
pub const INODE_MAP_BLOCKS: u32 = 1;
/// Blocks occupied by the data bitmap.
pub const DATA_MAP_BLOCKS: u32 = 1;
/// Width of the inode table in blocks — the original's `inode_num`. This is
/// the region's on-disk size, not the number of inodes that can actually be
/// allocated; see `MAX_INO`.
pub const INODE_TABLE_BLOCKS: u32 = 514;
/// Usable inodes once the superblock and inode bitmap's own blocks are set
/// aside — `INODE_TABLE_BLOCKS - SUPER_BLOCKS - INODE_MAP_BLOCKS` in the
/// original's own unformatted-layout numbers.
pub const MAX_INO: u32 = INODE_TABLE_BLOCKS - SUPER_BLOCKS - INODE_MAP_BLOCKS;
/// Usable data blocks.
pub const DATA_COUNT: u32 = 512;

/// Inode number of the always-present root directory.
pub const ROOT_INO: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    Directory = 0,
    Regular = 1,
    Symlink = 2,
}

impl FileKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FileKind::Directory),
            1 => Some(FileKind::Regular),
            2 => Some(FileKind::Symlink),
            _ => None,
        }
    }
}

/// On-disk superblock, one block wide.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub magic: u32,
    pub map_inode_offset: u64,
    pub map_inode_blocks: u32,
    pub map_data_offset: u64,
    pub map_data_blocks: u32,
    pub inode_offset: u64,
    pub data_offset: u64,
    pub usage: u64,
}

impl Superblock {
    pub const SIZE: usize = 4 + 8 + 4 + 8 + 4 + 8 + 8 + 8;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.map_inode_offset.to_le_bytes());
        out.extend_from_slice(&self.map_inode_blocks.to_le_bytes());
        out.extend_from_slice(&self.map_data_offset.to_le_bytes());
        out.extend_from_slice(&self.map_data_blocks.to_le_bytes());
        out.extend_from_slice(&self.inode_offset.to_le_bytes());
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.extend_from_slice(&self.usage.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut p = 0usize;
        macro_rules! take {
            ($ty:ty) => {{
                const N: usize = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes(buf[p..p + N].try_into().unwrap());
                p += N;
                v
            }};
        }
        Superblock {
            magic: take!(u32),
            map_inode_offset: take!(u64),
            map_inode_blocks: take!(u32),
            map_data_offset: take!(u64),
            map_data_blocks: take!(u32),
            inode_offset: take!(u64),
            data_offset: take!(u64),
            usage: take!(u64),
        }
    }
}

/// On-disk inode record, one block wide.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub ino: u32,
    pub size: u64,
    pub kind: FileKind,
    pub dir_cnt: u32,
    pub data_index: u32,
    pub target: [u8; MAX_NAME],
}

impl InodeRecord {
    pub const SIZE: usize = 4 + 8 + 1 + 4 + 4 + MAX_NAME;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.dir_cnt.to_le_bytes());
        out.extend_from_slice(&self.data_index.to_le_bytes());
        out.extend_from_slice(&self.target);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut p = 0usize;
        let ino = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        p += 4;
        let size = u64::from_le_bytes(buf[p..p + 8].try_into().unwrap());
        p += 8;
        let kind = FileKind::from_u8(buf[p])?;
        p += 1;
        let dir_cnt = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        p += 4;
        let data_index = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        p += 4;
        let mut target = [0u8; MAX_NAME];
        target.copy_from_slice(&buf[p..p + MAX_NAME]);
        Some(InodeRecord {
            ino,
            size,
            kind,
            dir_cnt,
            data_index,
            target,
        })
    }
}

/// On-disk directory-entry record, packed sequentially in the parent's data
/// block.
#[derive(Debug, Clone)]
pub struct DentryRecord {
    pub name: [u8; MAX_NAME],
    pub kind: FileKind,
    pub ino: u32,
    pub data_index: u32,
}

impl DentryRecord {
    pub const SIZE: usize = MAX_NAME + 1 + 4 + 4;

    pub fn new(name: &str, kind: FileKind, ino: u32, data_index: u32) -> Self {
        let mut buf = [0u8; MAX_NAME];
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAX_NAME - 1);
        buf[..n].copy_from_slice(&bytes[..n]);
        DentryRecord {
            name: buf,
            kind,
            ino,
            data_index,
        }
    }

    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.name);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.ino.to_le_bytes());
        out.extend_from_slice(&self.data_index.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut name = [0u8; MAX_NAME];
        name.copy_from_slice(&buf[0..MAX_NAME]);
        let mut p = MAX_NAME;
        let kind = FileKind::from_u8(buf[p])?;
        p += 1;
        let ino = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        p += 4;
        let data_index = u32::from_le_bytes(buf[p..p + 4].try_into().unwrap());
        Some(DentryRecord {
            name,
            kind,
            ino,
            data_index,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn superblock_round_trips() {
        let sb = Superblock {
            magic: MAGIC,
            map_inode_offset: 512,
            map_inode_blocks: 1,
            map_data_offset: 1024,
            map_data_blocks: 1,
            inode_offset: 1536,
            data_offset: 264192,
            usage: 42,
        };
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), Superblock::SIZE);
        let back = Superblock::from_bytes(&bytes);
        assert_eq!(back.magic, sb.magic);
        assert_eq!(back.data_offset, sb.data_offset);
        assert_eq!(back.usage, sb.usage);
    }

    #[test]
    fn inode_record_round_trips() {
        let rec = InodeRecord {
            ino: 7,
            size: 4096,
            kind: FileKind::Regular,
            dir_cnt: 0,
            data_index: 3,
            target: [0u8; MAX_NAME],
        };
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), InodeRecord::SIZE);
        let back = InodeRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back.ino, 7);
        assert_eq!(back.size, 4096);
        assert!(matches!(back.kind, FileKind::Regular));
    }

    #[test]
    fn dentry_record_preserves_name() {
        let rec = DentryRecord::new("notes.txt", FileKind::Regular, 9, 2);
        let bytes = rec.to_bytes();
        let back = DentryRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back.name_str(), "notes.txt");
        assert_eq!(back.ino, 9);
    }

    #[test]
    fn dentry_record_truncates_overlong_name() {
        let long = "x".repeat(MAX_NAME + 10);
        let rec = DentryRecord::new(&long, FileKind::Regular, 1, 0);
        assert_eq!(rec.name_str().len(), MAX_NAME - 1);
    }
}
