//! Serves a remote update package as a single read-only file, fetching it
//! block by block on demand and pinning each block's SHA-256 on first read so
//! an untrusted transport can never answer the same offset two different ways.

pub mod fuse;
pub mod mount;
pub mod provider;
pub mod session;
pub mod store;

pub use mount::{run, MountOptions};
pub use provider::{BlockProvider, FileProvider};
