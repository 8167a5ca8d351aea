//! Request multiplexer
//!
//! Owns the correlation id counter and the table of requests waiting for a
//! reply. Every table mutation happens under one mutex, so "allocate + insert"
//! and "lookup + remove" are atomic with respect to each other and to
//! timeouts. Each pending entry is resolved exactly once: by its reply, by
//! its timeout, or by connection teardown. A `PendingReply` that is dropped
//! unresolved removes its own entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::connection::RequestError;
use super::lock_ignore_poison;
use crate::protocol::{CorrelationId, Message, OperationMap, Response, DEFAULT_ID_SPACE, MAX_ID_SPACE};

/// Outcome delivered to a waiting caller
pub type Resolution = Result<OperationMap, RequestError>;

/// Bookkeeping for a request awaiting its reply
#[derive(Debug)]
pub struct PendingEntry {
    /// Distinguishes successive users of the same correlation id
    ticket: u64,
    created: Instant,
    waiter: oneshot::Sender<Resolution>,
}

impl PendingEntry {
    /// How long the entry has been pending
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// Handle a caller suspends on until its reply arrives.
///
/// Owns the pending entry from `submit()` onward: dropping it before the
/// entry is resolved releases the correlation id.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: CorrelationId,
    ticket: u64,
    rx: oneshot::Receiver<Resolution>,
    table: Arc<Mutex<Table>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }

    fn cancel(&self) -> bool {
        cancel_entry(&self.table, self.correlation_id, self.ticket)
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.cancel() {
            tracing::debug!("Request {} abandoned by caller", self.correlation_id);
        }
    }
}

/// A request with its correlation id assigned
#[derive(Debug)]
pub struct Submission {
    pub request: Message,
    /// Present when a reply is expected
    pub reply: Option<PendingReply>,
}

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the waiting caller
    Delivered,
    /// No pending entry had this correlation id
    Stale,
}

#[derive(Debug)]
struct Table {
    next_id: u16,
    next_ticket: u64,
    pending: HashMap<CorrelationId, PendingEntry>,
}

/// `timeout` from now, saturating far in the future instead of overflowing
pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Remove a pending entry if it still belongs to `ticket`
fn cancel_entry(table: &Mutex<Table>, correlation_id: CorrelationId, ticket: u64) -> bool {
    let mut table = lock_ignore_poison(table);
    match table.pending.get(&correlation_id) {
        Some(entry) if entry.ticket == ticket => {
            table.pending.remove(&correlation_id);
            true
        }
        _ => false,
    }
}

/// Correlation id allocation and reply dispatch
#[derive(Debug)]
pub struct RequestMultiplexer {
    id_space: u16,
    table: Arc<Mutex<Table>>,
}

impl Default for RequestMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_ID_SPACE)
    }
}

impl RequestMultiplexer {
    /// Create a multiplexer handing out ids `0..id_space`.
    ///
    /// `id_space` is clamped to `1..=256`.
    pub fn new(id_space: u16) -> Self {
        Self {
            id_space: id_space.clamp(1, MAX_ID_SPACE),
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                next_ticket: 0,
                pending: HashMap::new(),
            })),
        }
    }

    pub fn id_space(&self) -> u16 {
        self.id_space
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.table).pending.len()
    }

    /// Whether `id` currently belongs to a pending request
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        lock_ignore_poison(&self.table).pending.contains_key(&id)
    }

    /// Whether `id` is still pending under `ticket`
    pub(crate) fn is_current(&self, id: CorrelationId, ticket: u64) -> bool {
        matches!(
            lock_ignore_poison(&self.table).pending.get(&id),
            Some(entry) if entry.ticket == ticket
        )
    }

    /// Next free correlation id.
    ///
    /// The counter wraps at the id space and skips ids that are still pending.
    pub fn allocate(&self) -> Result<CorrelationId, RequestError> {
        let mut table = lock_ignore_poison(&self.table);
        self.allocate_locked(&mut table)
    }

    fn allocate_locked(&self, table: &mut Table) -> Result<CorrelationId, RequestError> {
        for _ in 0..self.id_space {
            let id = CorrelationId(table.next_id as u8);
            table.next_id = (table.next_id + 1) % self.id_space;
            if !table.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RequestError::Exhausted)
    }

    /// Assign a correlation id to `operations`.
    ///
    /// When a reply is expected the pending entry is registered before the
    /// request is returned, so a reply can never outrun its entry.
    pub fn submit(&self, operations: OperationMap, expects_reply: bool) -> Result<Submission, RequestError> {
        Message::check_operations(&operations)?;

        let mut table = lock_ignore_poison(&self.table);
        let correlation_id = self.allocate_locked(&mut table)?;
        let request = Message {
            correlation_id,
            operations,
        };

        if !expects_reply {
            return Ok(Submission { request, reply: None });
        }

        let ticket = table.next_ticket;
        table.next_ticket = table.next_ticket.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            correlation_id,
            PendingEntry {
                ticket,
                created: Instant::now(),
                waiter: tx,
            },
        );

        Ok(Submission {
            request,
            reply: Some(PendingReply {
                correlation_id,
                ticket,
                rx,
                table: self.table.clone(),
            }),
        })
    }

    /// Route an inbound message to its waiter
    pub fn on_message(&self, response: Response) -> Dispatch {
        // Resolve under the lock so a concurrent timeout sees either the
        // entry or the delivered outcome, never neither
        let mut table = lock_ignore_poison(&self.table);

        match table.pending.remove(&response.correlation_id) {
            Some(entry) => {
                tracing::debug!(
                    "Reply for request {} after {:?}",
                    response.correlation_id,
                    entry.age()
                );
                // The receiver is gone only if the caller abandoned the request
                let _ = entry.waiter.send(Ok(response.operations));
                Dispatch::Delivered
            }
            None => {
                tracing::warn!(
                    "Dropping stale or foreign reply for request {}",
                    response.correlation_id
                );
                Dispatch::Stale
            }
        }
    }

    /// Wait for the reply to a submitted request.
    ///
    /// Resolves with the reply, `RequestError::Timeout` after `timeout`, or
    /// the error the connection was torn down with. Dropping the returned
    /// future releases the correlation id.
    pub async fn wait(&self, reply: PendingReply, timeout: Duration) -> Resolution {
        self.wait_until(reply, deadline_after(timeout), timeout).await
    }

    /// Like [`wait`](Self::wait), against a deadline fixed earlier.
    ///
    /// `timeout` is the budget the deadline was derived from and is what a
    /// `RequestError::Timeout` reports.
    pub async fn wait_until(&self, mut reply: PendingReply, deadline: tokio::time::Instant, timeout: Duration) -> Resolution {
        let correlation_id = reply.correlation_id;

        match tokio::time::timeout_at(deadline, &mut reply.rx).await {
            Ok(Ok(resolution)) => resolution,
            // The sender only disappears if the entry was dropped unresolved
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                if reply.cancel() {
                    tracing::warn!("Request {} timed out after {:?}", correlation_id, timeout);
                    Err(RequestError::Timeout {
                        correlation_id,
                        after: timeout,
                    })
                } else {
                    // Resolved while the timer fired; the outcome is already in the channel
                    reply.rx.try_recv().unwrap_or(Err(RequestError::ConnectionLost))
                }
            }
        }
    }

    /// Give up on a submitted request without waiting, e.g. when its frame
    /// never made it onto the wire
    pub fn release(&self, reply: PendingReply) {
        if reply.cancel() {
            tracing::debug!("Request {} released", reply.correlation_id);
        }
    }

    /// Remove a pending entry if it still belongs to `ticket`
    fn cancel(&self, correlation_id: CorrelationId, ticket: u64) -> bool {
        cancel_entry(&self.table, correlation_id, ticket)
    }

    /// Resolve every pending entry with `error` and clear the table.
    ///
    /// Returns the number of entries failed.
    pub fn fail_all(&self, error: impl Fn() -> RequestError) -> usize {
        let mut table = lock_ignore_poison(&self.table);
        let count = table.pending.len();

        for (correlation_id, entry) in table.pending.drain() {
            tracing::debug!("Failing request {} after {:?}", correlation_id, entry.age());
            let _ = entry.waiter.send(Err(error()));
        }
        count
    }
}
