use crate::index::SharedIndex;
use kubert::lease::Claim;
use netpol_controller_core::{Terms, WriteToken};
use std::sync::Arc;
use tokio::{sync::watch, time};

/// Claims expire without the lease being updated, so the current claim is
/// re-evaluated at least this often.
const RECHECK_INTERVAL: time::Duration = time::Duration::from_secs(1);

/// Turns lease claims into write-token terms.
pub(crate) struct Leadership {
    terms: Terms,
    hostname: String,
    index: SharedIndex,
}

// === impl Leadership ===

impl Leadership {
    pub(crate) fn new(terms: Terms, hostname: String, index: SharedIndex) -> Self {
        Self {
            terms,
            hostname,
            index,
        }
    }

    pub(crate) async fn run(mut self, mut claims: watch::Receiver<Arc<Claim>>) {
        loop {
            let is_leader = claims.borrow_and_update().is_current_for(&self.hostname);
            self.observe(is_leader);

            tokio::select! {
                res = claims.changed() => {
                    if res.is_err() {
                        tracing::debug!("Lease manager stopped");
                        return;
                    }
                }
                _ = time::sleep(RECHECK_INTERVAL) => {}
            }
        }
    }

    /// Starts a term when this replica takes over the lease. Events dropped
    /// while another replica led are recovered by resyncing the index.
    fn observe(&mut self, is_leader: bool) -> Option<WriteToken> {
        let token = self.terms.observe(is_leader)?;
        self.index.read().resync();
        Some(token)
    }
}
