//! Provides the per-item tasks a node runs: elections and resyncs

/// Per-item voting
pub mod election;
/// Recovery of decided states from peers
pub mod resync;
