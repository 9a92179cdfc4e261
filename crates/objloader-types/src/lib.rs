//! Foundation types for objloader.
//!
//! This crate provides the identity and payload types shared by every other
//! objloader crate.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- Content-addressed identifier (hex content hash)
//! - [`Base`] -- An object payload: a JSON value tree with an `id` field
//! - [`Item`] -- An id paired with its (possibly missing) payload
//!
//! Payloads are kept as generic JSON trees. References between objects are
//! discovered by [`Base::references`], which walks the tree looking for
//! `referencedId` fields, and the root's manifest of reachable objects is
//! read with [`Base::closure`].

pub mod base;
pub mod error;
pub mod id;
pub mod item;

pub use base::{Base, CLOSURE_FIELD, REFERENCE_FIELD};
pub use error::{TypeError, TypeResult};
pub use id::ObjectId;
pub use item::Item;
