//! Integration test suite for relay.
//!
//! These tests drive the scheduler, lock manager, worker sessions and merge
//! coordinator together against the filesystem task store and, where
//! merging matters, a real git repository.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency-ordered dispatch and pool limits
//! - `claims`: exclusive claiming and reclamation on the filesystem store
//! - `recovery`: blocked tasks, stale claims and resets
//! - `merging`: integrating completed workspaces into the baseline
//!
//! # CI Compatibility
//!
//! Task execution is scripted; no external executor is invoked.

mod fixtures;

mod claims;
mod merging;
mod recovery;
mod scheduling;
