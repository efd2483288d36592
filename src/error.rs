//! Error taxonomy shared by every layer of the filesystem.

use std::fmt;

/// Everything that can go wrong while resolving a path, allocating storage or
/// touching the backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A path component does not exist.
    NotFound,
    /// The target of a create operation already exists.
    Exists,
    /// The backing device failed to read or write.
    Io,
    /// Preconditions of an operation were violated.
    Inval,
    /// An `F_OK` access check failed.
    Access,
    /// An allocator (inode map or data map) is exhausted.
    NoSpace,
    /// A read or write offset is past the end of the file.
    Seek,
    /// A file-only operation was attempted on a directory.
    IsDir,
    /// The operation is not supported for this kind of node.
    Unsupported,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::Exists => "file exists",
            Error::Io => "I/O error",
            Error::Inval => "invalid argument",
            Error::Access => "permission denied",
            Error::NoSpace => "no space left on device",
            Error::Seek => "invalid seek",
            Error::IsDir => "is a directory",
            Error::Unsupported => "operation not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Maps to the POSIX errno value `fuser` expects at the reply boundary.
    pub fn to_errno(self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::Io => libc::EIO,
            Error::Inval => libc::EINVAL,
            Error::Access => libc::EACCES,
            Error::NoSpace => libc::ENOSPC,
            Error::Seek => libc::ESPIPE,
            Error::IsDir => libc::EISDIR,
            Error::Unsupported => libc::ENOTSUP,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Io
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(Error::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(Error::IsDir.to_errno(), libc::EISDIR);
        assert_eq!(Error::NoSpace.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn display_is_nonempty() {
        for e in [
            Error::NotFound,
            Error::Exists,
            Error::Io,
            Error::Inval,
            Error::Access,
            Error::NoSpace,
            Error::Seek,
            Error::IsDir,
            Error::Unsupported,
        ] {
            assert!(!e.to_string().is_empty());
        }
    }
}
