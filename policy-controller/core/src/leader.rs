use tokio::sync::watch;

/// Permission to write to the SDN backend, issued once per election term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteToken {
    holder: String,
    term: u64,
}

/// Issues a [`WriteToken`] each time this replica becomes the leader, and
/// revokes it when leadership is lost.
#[derive(Debug)]
pub struct Terms {
    holder: String,
    term: u64,
    tx: watch::Sender<Option<WriteToken>>,
}

/// Exposes the current write token to the components that may only act while
/// this replica is the leader.
#[derive(Clone, Debug)]
pub struct LeaderGate(watch::Receiver<Option<WriteToken>>);

// === impl WriteToken ===

impl WriteToken {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn term(&self) -> u64 {
        self.term
    }
}

// === impl Terms ===

impl Terms {
    pub fn new(holder: impl ToString) -> (Self, LeaderGate) {
        let (tx, rx) = watch::channel(None);
        let terms = Self {
            holder: holder.to_string(),
            term: 0,
            tx,
        };
        (terms, LeaderGate(rx))
    }

    /// Records whether this replica currently holds the write lease.
    ///
    /// Returns the new token when a term begins. Observing the same state
    /// repeatedly (e.g. as the lease is renewed) does not start a new term.
    pub fn observe(&mut self, is_leader: bool) -> Option<WriteToken> {
        let was_leader = self.tx.borrow().is_some();
        match (was_leader, is_leader) {
            (false, true) => {
                self.term += 1;
                let token = WriteToken {
                    holder: self.holder.clone(),
                    term: self.term,
                };
                tracing::info!(holder = %self.holder, term = self.term, "Became leader");
                self.tx.send_replace(Some(token.clone()));
                Some(token)
            }
            (true, false) => {
                tracing::info!(holder = %self.holder, term = self.term, "Lost leadership");
                self.tx.send_replace(None);
                None
            }
            _ => None,
        }
    }
}

// === impl LeaderGate ===

impl LeaderGate {
    /// A gate whose token never changes.
    pub fn fixed(token: Option<WriteToken>) -> Self {
        let (_, rx) = watch::channel(token);
        Self(rx)
    }

    /// A gate that holds a term-1 token for `holder`.
    pub fn leader(holder: impl ToString) -> Self {
        Self::fixed(Some(WriteToken {
            holder: holder.to_string(),
            term: 1,
        }))
    }

    pub fn token(&self) -> Option<WriteToken> {
        self.0.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.0.borrow().is_some()
    }
}
