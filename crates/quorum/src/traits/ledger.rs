//! Ledger implementations

pub mod memory_ledger;
