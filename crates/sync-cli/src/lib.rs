//! sync-cli library: native adapters for the sync engine.
//!
//! Exposes the disk-backed `FileSystem` and `RemoteStore` implementations so
//! integration tests can drive them without the binary.

pub mod dir_remote;
pub mod native_fs;

pub use dir_remote::DirRemote;
pub use native_fs::NativeFs;
