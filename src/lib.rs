//! A small persistent single-user filesystem stored on a block-addressed
//! pseudo-device, exposed over FUSE by the `nanofs-fuse` binary.
//!
//! The library half of this crate (this module and everything it
//! re-exports) never touches FUSE directly: it is a plain, synchronous API
//! — `Volume::mount`, the operation methods in `ops`, `Volume::unmount` —
//! that the binary adapts onto `fuser::Filesystem`. That split keeps the
//! core testable without a real mount.

pub mod bitmap;
pub mod device;
pub mod error;
pub mod format;
pub mod node;
pub mod ops;
pub mod resolver;
pub mod volume;

pub use error::{Error, Result};
pub use format::FileKind;
pub use ops::Attr;
pub use volume::Volume;
