//! Implementations for testing/examples

/// votable test items
pub mod item_types;

/// node types
pub mod node_types;
