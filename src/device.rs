//! Block-aligned I/O adapter.
//!
//! The backing driver only ever reads or writes whole, aligned blocks. This
//! module turns that into arbitrary-offset, arbitrary-length reads and
//! writes, the same way `nfs_driver_read`/`nfs_driver_write` do over the
//! original FUSE driver handle.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;

use crate::error::{Error, Result};

/// Fallback I/O unit used for plain image files that don't support `ioctl`
/// size queries (loopback testing, as in the sibling pack's own disk tests).
const DEFAULT_IO_SIZE: u64 = 512;

/// A block device opened for block-aligned I/O.
pub struct BlockDevice {
    file: File,
    size: u64,
    io_size: u64,
}

impl BlockDevice {
    /// Opens `path` for read/write and queries its capacity and I/O unit
    /// size, mirroring `ddriver_open` + the `REQ_DEVICE_SIZE`/`REQ_DEVICE_IO_SZ`
    /// ioctl pair from the original driver contract.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(0)
            .open(path)?;
        let metadata = file.metadata()?;
        let (size, io_size) = if metadata.file_type().is_block_device() {
            query_block_device(&file)?
        } else {
            (metadata.len(), DEFAULT_IO_SIZE)
        };
        Ok(BlockDevice {
            file,
            size,
            io_size,
        })
    }

    /// Total device capacity in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The device's native I/O unit size; all underlying reads/writes happen
    /// in whole multiples of this, aligned to it.
    pub fn io_size(&self) -> u64 {
        self.io_size
    }

    /// Reads `len` bytes starting at `offset`, for arbitrary (unaligned)
    /// `offset` and `len`.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let block = self.io_size;
        let aligned_offset = (offset / block) * block;
        let bias = (offset - aligned_offset) as usize;
        let aligned_len = round_up(len as u64 + bias as u64, block) as usize;

        self.file.seek(SeekFrom::Start(aligned_offset))?;
        let mut buf = vec![0u8; aligned_len];
        self.file.read_exact(&mut buf)?;
        Ok(buf[bias..bias + len].to_vec())
    }

    /// Overwrites `len = src.len()` bytes starting at `offset` via
    /// read-modify-write over the aligned window, the same way
    /// `nfs_driver_write` does.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        let block = self.io_size;
        let aligned_offset = (offset / block) * block;
        let bias = (offset - aligned_offset) as usize;
        let aligned_len = round_up(src.len() as u64 + bias as u64, block) as usize;

        self.file.seek(SeekFrom::Start(aligned_offset))?;
        let mut buf = vec![0u8; aligned_len];
        self.file.read_exact(&mut buf)?;

        buf[bias..bias + src.len()].copy_from_slice(src);

        self.file.seek(SeekFrom::Start(aligned_offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }
}

fn round_up(n: u64, unit: u64) -> u64 {
    (n + unit - 1) / unit * unit
}

#[cfg(target_os = "linux")]
fn query_block_device(file: &File) -> Result<(u64, u64)> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x80081272;
    const BLKSSZGET: libc::c_ulong = 0x1268;

    let fd = file.as_raw_fd();
    let mut size: u64 = 0;
    let mut io_size: libc::c_int = 0;
    // SAFETY: fd is a valid open file descriptor for a block device; the
    // out-pointers match the sizes the kernel expects for these requests.
    unsafe {
        if libc::ioctl(fd, BLKGETSIZE64, &mut size as *mut u64) != 0 {
            return Err(Error::Io);
        }
        if libc::ioctl(fd, BLKSSZGET, &mut io_size as *mut libc::c_int) != 0 {
            return Err(Error::Io);
        }
    }
    Ok((size, io_size as u64))
}

#[cfg(not(target_os = "linux"))]
fn query_block_device(file: &File) -> Result<(u64, u64)> {
    let len = file.metadata()?.len();
    Ok((len, DEFAULT_IO_SIZE))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn make_image(bytes: usize) -> (tempfile::NamedTempFile, BlockDevice) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; bytes]).unwrap();
        tmp.flush().unwrap();
        let dev = BlockDevice::open(tmp.path()).unwrap();
        (tmp, dev)
    }

    #[test]
    fn unaligned_round_trip() {
        let (_tmp, mut dev) = make_image(4096);
        let payload = b"hello, nanofs";
        dev.write(37, payload).unwrap();
        let back = dev.read(37, payload.len()).unwrap();
        assert_eq!(&back, payload);
    }

    #[test]
    fn crosses_block_boundary() {
        let (_tmp, mut dev) = make_image(4096);
        let io = dev.io_size() as usize;
        let payload: Vec<u8> = (0..(io + 50)).map(|i| (i % 256) as u8).collect();
        let offset = io as u64 - 10;
        dev.write(offset, &payload).unwrap();
        let back = dev.read(offset, payload.len()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn write_does_not_disturb_neighbors() {
        let (_tmp, mut dev) = make_image(4096);
        dev.write(0, &[0xAAu8; 16]).unwrap();
        dev.write(200, &[0xBBu8; 16]).unwrap();
        let first = dev.read(0, 16).unwrap();
        assert_eq!(first, vec![0xAAu8; 16]);
    }
}
