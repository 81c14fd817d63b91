//! Pending-connection table: the rendezvous state machine.
//!
//! Each rendezvous attempt is one record in an arena, reachable through two
//! token index entries. A token is consumed by the first Accept or Reject
//! that presents it; the record is dropped once both tokens are consumed.
//!
//! ```text
//!            accept               accept (sibling)
//!   Open ─────────────► Accepted ─────────────────► Resolved (both relay)
//!    │                     │
//!    │ reject              │ reject (sibling)
//!    ▼                     ▼
//!  Rejected             Resolved (acceptor gets ErrorConnection)
//! ```
//!
//! The table is a plain `&mut self` structure; the broker wraps it in a
//! mutex, which serializes every decision on a record.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::debug;

use super::super::token::{EntropyError, EntropySource, Token};

type RecordId = u64;

/// Why a token could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection was rejected")]
    Rejected,
}

enum Decision<A> {
    Open,
    Accepted(A),
    Rejected,
    Resolved,
}

/// One rendezvous attempt.
struct PendingConnection<A> {
    token_a: Token,
    token_b: Token,
    decision: Decision<A>,
    /// Index entries still pointing at this record.
    live_tokens: u8,
}

impl<A> PendingConnection<A> {
    fn sibling_of(&self, token: &Token) -> Token {
        if *token == self.token_a {
            self.token_b
        } else {
            self.token_a
        }
    }
}

/// Result of a successful accept.
#[derive(Debug)]
pub enum AcceptOutcome<A> {
    /// The peer has not decided yet; the acceptor was recorded.
    FirstAccept,
    /// Both sides accepted. `first` accepted earlier under `first_token`.
    Complete { first: A, first_token: Token },
}

/// Result of a successful reject.
#[derive(Debug)]
pub enum RejectOutcome<A> {
    /// Nobody had accepted; the sibling token will now see a rejection.
    Recorded,
    /// The peer had already accepted under `acceptor_token` and must be told.
    NotifyAcceptor { acceptor: A, acceptor_token: Token },
}

/// Arena of pending rendezvous records plus the token index.
pub struct PendingTable<A> {
    records: HashMap<RecordId, PendingConnection<A>>,
    index: HashMap<Token, RecordId>,
    next_record: RecordId,
}

impl<A> PendingTable<A> {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            index: HashMap::new(),
            next_record: 0,
        }
    }

    /// Mint two distinct tokens, neither colliding with a live token, both
    /// resolving to one fresh record.
    pub fn generate_pair(
        &mut self,
        entropy: &dyn EntropySource,
    ) -> Result<(Token, Token), EntropyError> {
        let id = self.next_record;
        self.next_record += 1;

        let first = self.claim_token(id, None, entropy)?;
        let second = match self.claim_token(id, Some(&first), entropy) {
            Ok(token) => token,
            Err(e) => {
                self.index.remove(&first);
                return Err(e);
            }
        };

        self.records.insert(
            id,
            PendingConnection {
                token_a: first,
                token_b: second,
                decision: Decision::Open,
                live_tokens: 2,
            },
        );
        Ok((first, second))
    }

    fn claim_token(
        &mut self,
        id: RecordId,
        distinct_from: Option<&Token>,
        entropy: &dyn EntropySource,
    ) -> Result<Token, EntropyError> {
        loop {
            let candidate = Token::generate(entropy)?;
            if distinct_from == Some(&candidate) {
                debug!("token pair collided with itself, redrawing");
                continue;
            }
            match self.index.entry(candidate) {
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    return Ok(candidate);
                }
                Entry::Occupied(_) => {
                    debug!("token collided with a live token, redrawing");
                }
            }
        }
    }

    /// Accept under `token`, consuming it.
    pub fn accept(&mut self, token: &Token, acceptor: A) -> Result<AcceptOutcome<A>, PendingError> {
        let id = self.consume(token)?;
        let record = self
            .records
            .get_mut(&id)
            .ok_or(PendingError::UnknownConnection)?;
        let sibling = record.sibling_of(token);

        let outcome = match std::mem::replace(&mut record.decision, Decision::Resolved) {
            Decision::Open => {
                record.decision = Decision::Accepted(acceptor);
                Ok(AcceptOutcome::FirstAccept)
            }
            Decision::Accepted(first) => Ok(AcceptOutcome::Complete {
                first,
                first_token: sibling,
            }),
            Decision::Rejected => {
                record.decision = Decision::Rejected;
                Err(PendingError::Rejected)
            }
            Decision::Resolved => Err(PendingError::Rejected),
        };
        self.release_if_spent(id);
        outcome
    }

    /// Reject under `token`, consuming it.
    pub fn reject(&mut self, token: &Token) -> Result<RejectOutcome<A>, PendingError> {
        let id = self.consume(token)?;
        let record = self
            .records
            .get_mut(&id)
            .ok_or(PendingError::UnknownConnection)?;
        let sibling = record.sibling_of(token);

        let outcome = match std::mem::replace(&mut record.decision, Decision::Rejected) {
            Decision::Accepted(acceptor) => {
                record.decision = Decision::Resolved;
                RejectOutcome::NotifyAcceptor {
                    acceptor,
                    acceptor_token: sibling,
                }
            }
            Decision::Resolved => {
                record.decision = Decision::Resolved;
                RejectOutcome::Recorded
            }
            Decision::Open | Decision::Rejected => RejectOutcome::Recorded,
        };
        self.release_if_spent(id);
        Ok(outcome)
    }

    /// Remove the index entry for `token`.
    fn consume(&mut self, token: &Token) -> Result<RecordId, PendingError> {
        let id = self
            .index
            .remove(token)
            .ok_or(PendingError::UnknownConnection)?;
        if let Some(record) = self.records.get_mut(&id) {
            record.live_tokens -= 1;
        }
        Ok(id)
    }

    fn release_if_spent(&mut self, id: RecordId) {
        if self.records.get(&id).is_some_and(|r| r.live_tokens == 0) {
            self.records.remove(&id);
        }
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.index.contains_key(token)
    }

    /// Number of tokens that can still be presented.
    pub fn token_count(&self) -> usize {
        self.index.len()
    }

    /// Number of rendezvous attempts with at least one live token.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl<A> Default for PendingTable<A> {
    fn default() -> Self {
        Self::new()
    }
}
