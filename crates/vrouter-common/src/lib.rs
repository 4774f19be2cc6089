//! Common building blocks for the vRouter flow tables.
//!
//! - [`SyncMap`]: a keyed index that never creates entries implicitly
//! - [`Arena`]: slot storage addressed by generation-checked [`Handle`]s
//!
//! Flow records reference each other (forward and reverse direction of one
//! conversation) through arena handles rather than owning pointers, so the
//! owning table decides when both are destroyed.

mod arena;
mod sync_map;

pub use arena::{Arena, Handle};
pub use sync_map::{SyncMap, SyncMapError};
