//! Element memory
//!
//! - `element`: stable identity for DOM element descriptors
//! - `beads`: bounded per-element change history, stored per project

mod beads;
mod element;

pub use beads::{render_context, Bead, BeadStore, ChangeRecord, CONTEXT_CHANGES, MAX_BEAD_CHANGES};
pub use element::{derive_key, ElementDescriptor, ElementKey, ElementSummary};
