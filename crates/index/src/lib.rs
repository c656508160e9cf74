//! edgews Index - ordered eviction index
//!
//! This crate provides:
//! - `AvlMultimap`: an AVL tree mapping each key to a set of values
//! - `TimeoutIndex`: a mutex-guarded `AvlMultimap` keyed by last-activity
//!   timestamp, shared by the read path and the eviction sweep

mod avl;
mod timeout;

pub use avl::*;
pub use timeout::*;
