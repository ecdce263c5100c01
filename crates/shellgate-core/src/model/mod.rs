//! Hierarchical, lazily loaded data models.
//!
//! All three models share the arena in [`tree`]: nodes live in one owned
//! map keyed by stable [`tree::EntryId`], linked by id rather than by
//! reference, so the trees stay cycle-free and cheap to diff.

pub mod cloud;
pub mod connections;
pub mod documents;
pub mod tree;

pub use cloud::CloudModel;
pub use connections::ConnectionsModel;
pub use documents::DocumentsModel;
pub use tree::{EntryId, EntryState, TreeDelta, TreeStore};
