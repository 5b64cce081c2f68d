//! Logical paths and typed attribute values for Kasane.
//!
//! This crate is the vocabulary of the layered filesystem: the normalized
//! [`VfsPath`] every component speaks, the closed [`AttrValue`] union stored
//! in attribute tables, and the [`FactoryRegistry`] that replaces dynamic
//! code references with explicit registration. It has **no internal kasane
//! dependencies** — a pure leaf crate that `kasane-vfs` builds on.

pub mod path;
pub mod value;

// Re-export primary types at crate root for convenience.
pub use path::{PathError, VfsPath};
pub use value::{AttrValue, FactoryRegistry, ValueDecodeError, devoidify, voidify};
