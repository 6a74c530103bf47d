//! Artifact caching for the package registry proxy.
//!
//! Provides [`BackedRemote`], the read-through wrapper that fronts one
//! upstream with the shared blob store, and the storage-key derivation that
//! namespaces and partitions cached objects.

pub mod backed;
pub mod key;

pub use backed::BackedRemote;
