//! Request correlation over the shared worker pipe.
//!
//! Every submitted request is parked in a pending map keyed by its ID and
//! completed by whichever comes first: a matching reply, its deadline, or a
//! bulk failure when the worker closes or the relay shuts down. The worker
//! may answer in any order.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::error::{CloseReason, WorkerError, WorkerResult};
use super::protocol::{Answer, RequestEnvelope, ResponseEnvelope};

/// Type-erased write half of a worker pipe.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Completion = oneshot::Sender<WorkerResult<Answer>>;

enum Outbound {
    Line {
        line: String,
        written: oneshot::Sender<io::Result<()>>,
    },
    Close,
}

/// Write half of one worker instance, tagged with its generation.
///
/// Lines are written by a dedicated task that owns the pipe, so a caller
/// giving up mid-write never leaves a partial line behind.
#[derive(Clone)]
pub struct WorkerLink {
    generation: u64,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl WorkerLink {
    /// Must be called from within a Tokio runtime.
    pub fn new(generation: u64, stdin: BoxedWriter) -> Self {
        let (outbox, queued) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(generation, stdin, queued));
        Self { generation, outbox }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue `envelope` and return a receiver that fires once the whole line
    /// has been flushed, or the write failed.
    fn enqueue(
        &self,
        envelope: &RequestEnvelope,
    ) -> WorkerResult<oneshot::Receiver<io::Result<()>>> {
        let line = envelope.to_line().map_err(WorkerError::SerializeFailed)?;
        let (written, ack) = oneshot::channel();
        self.outbox
            .send(Outbound::Line { line, written })
            .map_err(|_| WorkerError::WriteFailure(pipe_closed()))?;
        Ok(ack)
    }

    /// Close the worker's stdin once queued lines are written. Well-behaved
    /// workers treat this as a request to exit.
    pub(crate) fn close(&self) {
        let _ = self.outbox.send(Outbound::Close);
    }
}

fn pipe_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed")
}

async fn write_lines(
    generation: u64,
    stdin: BoxedWriter,
    mut queued: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut stdin = BufWriter::new(stdin);

    while let Some(outbound) = queued.recv().await {
        let Outbound::Line { line, written } = outbound else {
            break;
        };
        let result = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        let _ = written.send(result);
        // A failed write may have left part of a line in the pipe.
        if failed {
            warn!(generation, "worker stdin unusable; dropping queued requests");
            return;
        }
    }

    if let Err(e) = stdin.shutdown().await {
        debug!(generation, error = %e, "closing worker stdin failed");
    }
}

struct PendingRequest {
    /// Distinguishes successive requests that reuse the same ID.
    ticket: u64,
    generation: u64,
    created_at: Instant,
    timeout: Duration,
    deadline: Option<AbortHandle>,
    completion: Completion,
}

impl PendingRequest {
    fn complete(self, outcome: WorkerResult<Answer>) {
        if let Some(deadline) = self.deadline {
            deadline.abort();
        }
        // The caller may have given up already.
        let _ = self.completion.send(outcome);
    }
}

#[derive(Default)]
struct State {
    link: Option<WorkerLink>,
    pending: HashMap<String, PendingRequest>,
    next_ticket: u64,
    closed: bool,
}

/// Maps outstanding requests to their eventual results.
///
/// Cheap to clone; clones share the same pending set. The lock is never held
/// across pipe I/O.
#[derive(Clone, Default)]
pub struct Correlator {
    state: Arc<Mutex<State>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `link` the current worker. Ignored once the correlator is closed.
    pub async fn attach(&self, link: WorkerLink) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.link = Some(link);
        }
    }

    /// Forget the current worker if it belongs to `generation`.
    pub async fn detach(&self, generation: u64) -> Option<WorkerLink> {
        let mut state = self.state.lock().await;
        if state.link.as_ref().map(WorkerLink::generation) == Some(generation) {
            state.link.take()
        } else {
            None
        }
    }

    /// Stop accepting submissions for good and drop the current worker.
    pub async fn close(&self) -> Option<WorkerLink> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.link.take()
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.link.is_some()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Send a request to the current worker and wait for its reply.
    ///
    /// The deadline runs independently of the returned future: a caller that
    /// stops polling still has its slot released once `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - `NotReady` if no worker is attached
    /// - `DuplicateRequest` if `request_id` is already pending
    /// - `WriteFailure` if the pipe write fails
    /// - `WorkerReported`, `Timeout`, `WorkerClosed` or `ShuttingDown`
    ///   depending on how the request completes
    pub async fn submit(
        &self,
        request_id: impl Into<String>,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> WorkerResult<Answer> {
        let request_id = request_id.into();
        let (tx, mut rx) = oneshot::channel();

        let (link, ticket) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(WorkerError::ShuttingDown);
            }
            let Some(link) = state.link.clone() else {
                return Err(WorkerError::NotReady);
            };
            if state.pending.contains_key(&request_id) {
                return Err(WorkerError::DuplicateRequest(request_id));
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            let deadline = tokio::spawn(self.clone().expire_after(
                request_id.clone(),
                ticket,
                timeout,
            ));
            state.pending.insert(
                request_id.clone(),
                PendingRequest {
                    ticket,
                    generation: link.generation,
                    created_at: Instant::now(),
                    timeout,
                    deadline: Some(deadline.abort_handle()),
                    completion: tx,
                },
            );
            (link, ticket)
        };

        let envelope = RequestEnvelope::new(request_id.clone(), payload);
        let written = match link.enqueue(&envelope) {
            Ok(ack) => ack,
            Err(err) => return self.fail_write(&request_id, ticket, err, rx).await,
        };

        // A stalled worker may never drain its stdin; the deadline still fires.
        tokio::select! {
            biased;
            outcome = &mut rx => return outcome?,
            result = written => {
                let err = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(WorkerError::WriteFailure(e)),
                    Err(_) => Some(WorkerError::WriteFailure(pipe_closed())),
                };
                if let Some(err) = err {
                    warn!(request_id = %request_id, generation = link.generation, error = %err, "write to worker failed");
                    return self.fail_write(&request_id, ticket, err, rx).await;
                }
            }
        }

        rx.await?
    }

    /// Complete the pending request matching `reply`.
    ///
    /// Returns `false` when the reply was dropped: unknown or stale ID, or a
    /// reply produced by a different worker instance than the request was
    /// issued against.
    pub async fn on_frame(&self, generation: u64, reply: ResponseEnvelope) -> bool {
        let pending = {
            let mut state = self.state.lock().await;
            let issued_on = state.pending.get(&reply.request_id).map(|p| p.generation);
            match issued_on {
                Some(g) if g == generation => state.pending.remove(&reply.request_id),
                Some(g) => {
                    debug!(
                        request_id = %reply.request_id,
                        frame_generation = generation,
                        request_generation = g,
                        "reply from another worker instance dropped"
                    );
                    return false;
                }
                None => None,
            }
        };

        let Some(pending) = pending else {
            debug!(request_id = %reply.request_id, "reply for unknown request dropped");
            return false;
        };

        let request_id = reply.request_id.clone();
        let outcome = reply.into_outcome().map_err(WorkerError::WorkerReported);
        debug!(
            request_id = %request_id,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "request completed"
        );
        pending.complete(outcome);
        true
    }

    /// Fail `request_id` with `Timeout` if it is still pending.
    pub async fn on_timeout(&self, request_id: &str) -> bool {
        let pending = self.state.lock().await.pending.remove(request_id);
        match pending {
            Some(pending) => {
                debug!(request_id, "request timed out");
                let timeout = pending.timeout;
                pending.complete(Err(WorkerError::Timeout(timeout)));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `reason`. Returns how many were failed.
    pub async fn fail_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock().await;
            state.pending.drain().collect()
        };

        let count = drained.len();
        if count > 0 {
            warn!(count, ?reason, "failing pending requests");
        }
        for (_, pending) in drained {
            pending.complete(Err(reason.into()));
        }
        count
    }

    async fn take(&self, request_id: &str, ticket: u64) -> Option<PendingRequest> {
        let mut state = self.state.lock().await;
        if state.pending.get(request_id).map(|p| p.ticket) == Some(ticket) {
            state.pending.remove(request_id)
        } else {
            None
        }
    }

    async fn expire_after(self, request_id: String, ticket: u64, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        if let Some(mut pending) = self.take(&request_id, ticket).await {
            debug!(request_id, "request timed out");
            // This task is the deadline; nothing left to abort.
            pending.deadline = None;
            pending.complete(Err(WorkerError::Timeout(timeout)));
        }
    }

    async fn fail_write(
        &self,
        request_id: &str,
        ticket: u64,
        err: WorkerError,
        rx: oneshot::Receiver<WorkerResult<Answer>>,
    ) -> WorkerResult<Answer> {
        // If something else already completed the request, report that instead.
        if let Some(pending) = self.take(request_id, ticket).await {
            pending.complete(Err(err));
        }
        rx.await?
    }
}
