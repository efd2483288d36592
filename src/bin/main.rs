//! Host binding: wires `nanofs::Volume` into a `fuser::Filesystem` and
//! parses the small `--device=<path> <mountpoint>` surface the original
//! program's own FUSE option table exposed.

use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::{error, info};

use nanofs::{Attr, FileKind, Volume};

const FUSE_ROOT_ID: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

struct Args {
    prog: String,
    device: Option<PathBuf>,
    mountpoint: Option<PathBuf>,
    help: bool,
}

fn parse_args() -> Args {
    let mut it = env::args();
    let prog = it.next().unwrap_or_else(|| "nanofs-fuse".to_string());
    let mut device = None;
    let mut mountpoint = None;
    let mut help = false;

    for arg in it {
        if arg == "-h" || arg == "--help" {
            help = true;
        } else if let Some(path) = arg.strip_prefix("--device=") {
            device = Some(PathBuf::from(path));
        } else if !arg.starts_with('-') {
            mountpoint = Some(PathBuf::from(arg));
        }
        // unknown flags pass through silently to the host FUSE layer
    }

    Args {
        prog,
        device,
        mountpoint,
        help,
    }
}

fn print_usage(prog: &str) {
    eprintln!("usage: {prog} --device=<path> <mountpoint>");
}

fn print_help(prog: &str) {
    print_usage(prog);
    eprintln!();
    eprintln!("  --device=<path>   backing image or block device to store the filesystem on");
    eprintln!("  -h, --help        print this help and exit");
}

fn main() -> ExitCode {
    env_logger::init();
    let args = parse_args();

    if args.help {
        print_help(&args.prog);
        return ExitCode::SUCCESS;
    }

    let (Some(device), Some(mountpoint)) = (args.device, args.mountpoint) else {
        print_usage(&args.prog);
        return ExitCode::FAILURE;
    };

    let volume = match Volume::mount(&device) {
        Ok(v) => v,
        Err(e) => {
            error!("mount failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let fs = NanoFuse::new(volume);
    let options = vec![MountOption::FSName("nanofs".to_string())];
    info!("mounting {} at {}", device.display(), mountpoint.display());
    if let Err(e) = fuser::mount2(fs, &mountpoint, &options) {
        error!("fuse session failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Adapts the synchronous `Volume` API onto FUSE's inode-number-addressed
/// calls. The kernel only ever names a node by the integer it was handed
/// back from a prior `lookup`/`readdir`, so this layer keeps a small
/// ino-to-path table, populated lazily the way a minimal FUSE filesystem
/// typically does it when it has no persistent inode cache of its own.
struct NanoFuse {
    volume: Volume,
    paths: HashMap<u64, String>,
}

impl NanoFuse {
    fn new(volume: Volume) -> Self {
        let mut paths = HashMap::new();
        paths.insert(FUSE_ROOT_ID, "/".to_string());
        NanoFuse { volume, paths }
    }

    fn real_ino_to_fuse(ino: u32) -> u64 {
        ino as u64 + 1
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(|s| s.as_str())
    }

    fn child_path(parent_path: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    fn remember(&mut self, real_ino: u32, path: String) -> u64 {
        let fuse_ino = Self::real_ino_to_fuse(real_ino);
        self.paths.insert(fuse_ino, path);
        fuse_ino
    }

    fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
        let kind = match attr.kind {
            FileKind::Directory => FileType::Directory,
            FileKind::Regular => FileType::RegularFile,
            FileKind::Symlink => FileType::Symlink,
        };
        let now = SystemTime::now();
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.total_blocks.max(1),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: 0o777,
            nlink: attr.nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: attr.block_size as u32,
            flags: 0,
        }
    }
}

impl Filesystem for NanoFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        match self.volume.getattr(&path) {
            Ok(attr) => {
                let fuse_ino = self.remember(attr.ino, path);
                reply.entry(&TTL, &Self::to_file_attr(fuse_ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.volume.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &Self::to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(e) = self.volume.truncate(&path, size) {
                reply.error(e.to_errno());
                return;
            }
        }
        if self.volume.utimens(&path).is_err() {
            reply.error(libc::ENOENT);
            return;
        }
        match self.volume.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &Self::to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.volume.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        let kind = if mode & libc::S_IFMT == libc::S_IFDIR {
            FileKind::Directory
        } else {
            FileKind::Regular
        };
        if let Err(e) = self.volume.mknod(&path, kind) {
            reply.error(e.to_errno());
            return;
        }
        match self.volume.getattr(&path) {
            Ok(attr) => {
                let fuse_ino = self.remember(attr.ino, path);
                reply.entry(&TTL, &Self::to_file_attr(fuse_ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        if let Err(e) = self.volume.mkdir(&path) {
            reply.error(e.to_errno());
            return;
        }
        match self.volume.getattr(&path) {
            Ok(attr) => {
                let fuse_ino = self.remember(attr.ino, path);
                reply.entry(&TTL, &Self::to_file_attr(fuse_ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        match self.volume.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, name);
        match self.volume.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::child_path(&parent_path, link_name);
        let target = target.to_string_lossy().into_owned();
        if let Err(e) = self.volume.symlink(&target, &path) {
            reply.error(e.to_errno());
            return;
        }
        match self.volume.getattr(&path) {
            Ok(attr) => {
                let fuse_ino = self.remember(attr.ino, path);
                reply.entry(&TTL, &Self::to_file_attr(fuse_ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(new_parent_path)) = (
            self.path_of(parent).map(str::to_string),
            self.path_of(newparent).map(str::to_string),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        let from = Self::child_path(&parent_path, name);
        let to = Self::child_path(&new_parent_path, newname);
        match self.volume.rename(&from, &to) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.volume.open(&path) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.volume.open(&path) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::ESPIPE);
            return;
        }
        match self.volume.read(&path, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::ESPIPE);
            return;
        }
        match self.volume.write(&path, offset as u64, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mut next = offset;
        if offset == 0 && reply.add(ino, 1, FileType::Directory, ".") {
            return;
        }
        if offset <= 1 {
            next = 1;
            if reply.add(ino, 2, FileType::Directory, "..") {
                return;
            }
        }

        let mut child_offset = if next <= 1 { 0 } else { (next - 2) as u32 };
        loop {
            match self.volume.readdir_entry(&path, child_offset) {
                Ok(Some((name, kind, real_ino))) => {
                    let fuse_ino = Self::real_ino_to_fuse(real_ino);
                    let ft = match kind {
                        FileKind::Directory => FileType::Directory,
                        FileKind::Regular => FileType::RegularFile,
                        FileKind::Symlink => FileType::Symlink,
                    };
                    let next_offset = (child_offset as i64) + 3;
                    if reply.add(fuse_ino, next_offset, ft, &name) {
                        break;
                    }
                    child_offset += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino).map(str::to_string) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.volume.access(&path, mask == libc::F_OK) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}
