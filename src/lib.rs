//! A zoned-namespace flash translation layer paired with a
//! log-structured filesystem built directly on top of it.
//!
//! The crate is organized leaves-first, matching the dependency order
//! each layer is built against: [`device`] (the ZNS primitives) underlies
//! [`ftl`] (address translation and GC), which underlies [`segment`] and
//! [`block`] (the filesystem's on-media records), which underlie
//! [`filesystem`] (path resolution and the storage-engine-facing API).
//! [`threadpool`] is a small utility used for background maintenance
//! work; [`ffi`] exposes the FTL layer over a C ABI.

pub mod block;
pub mod device;
pub mod error;
pub mod ffi;
pub mod filesystem;
pub mod ftl;
pub mod segment;
pub mod threadpool;

pub use device::{FileBackedDevice, Geometry, ZoneDevice};
pub use error::{Error, Result};
pub use filesystem::Filesystem;
pub use ftl::{Ftl, FtlParams};
