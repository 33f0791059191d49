//! NetworkPolicy index
//!
//! The index is driven by a `kubert::index` watch over `NetworkPolicy`
//! resources. It serves two purposes:
//!
//! - It is the controller's local cache of policies. Reconcilers read policies
//!   through a [`Reader`] rather than querying the API server.
//! - It admits watch events into the reconciliation queue. Each applied policy
//!   is classified as an add (not previously cached) or an update (cached with
//!   different rules); deletions are queued as deletes. Events are only queued
//!   while this replica holds a write token, but the cache is always kept
//!   current so that a newly elected leader can resync from it.
//!
//! ```text
//! [ watch ] -> [ Index ] -> [ WorkQueue<Task> ] -> [ Reconciler ]
//!                  ^                                     |
//!                  +------------- Reader ----------------+
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod metrics;


pub use self::{index::Index, metrics::IndexMetrics};
use anyhow::Result;
use netpol_controller_core::{Policy, PolicyId, PolicyStore};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Reads policies from a shared index.
#[derive(Clone)]
pub struct Reader(SharedIndex);

// === impl Reader ===

impl Reader {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl PolicyStore for Reader {
    fn get_policy(&self, id: &PolicyId) -> Result<Option<Arc<Policy>>> {
        Ok(self.0.read().get(id))
    }
}
