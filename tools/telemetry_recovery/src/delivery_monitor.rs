use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::errors::RecoveryError;
use crate::logging::append_run_log;
use crate::upload::{DeliveryOutcome, DeliveryStatus, UploadTicket};

/// Observes upload tickets off the recovery thread and logs how each one
/// settles. Watching a ticket never blocks the caller.
pub struct DeliveryMonitor {
    tickets: Mutex<Option<mpsc::UnboundedSender<UploadTicket>>>,
    outcomes: Arc<Mutex<Vec<DeliveryOutcome>>>,
    done_rx: Mutex<std_mpsc::Receiver<()>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeliveryMonitor {
    pub fn spawn() -> Result<Self, RecoveryError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| RecoveryError::Io(format!("delivery runtime: {e}")))?;
        let (ticket_tx, mut ticket_rx) = mpsc::unbounded_channel::<UploadTicket>();
        let (done_tx, done_rx) = std_mpsc::channel();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&outcomes);

        let worker = thread::Builder::new()
            .name("delivery-monitor".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut pending = JoinSet::new();
                    while let Some(ticket) = ticket_rx.recv().await {
                        let recorded = Arc::clone(&recorded);
                        pending.spawn(async move {
                            let outcome = ticket.settle().await;
                            log_outcome(&outcome);
                            if let Ok(mut outcomes) = recorded.lock() {
                                outcomes.push(outcome);
                            }
                        });
                    }
                    while pending.join_next().await.is_some() {}
                });
                let _ = done_tx.send(());
            })
            .map_err(|e| RecoveryError::Io(format!("delivery monitor thread: {e}")))?;

        Ok(Self {
            tickets: Mutex::new(Some(ticket_tx)),
            outcomes,
            done_rx: Mutex::new(done_rx),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn watch(&self, ticket: UploadTicket) {
        let kind = ticket.kind;
        let id = ticket.id.clone();
        let sent = match self.tickets.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|tx| tx.send(ticket).is_ok()),
            Err(_) => false,
        };
        if !sent {
            append_run_log(
                "warn",
                "upload.unobserved",
                json!({ "kind": kind.as_str(), "id": id }),
            );
        }
    }

    /// Outcomes settled so far, in settlement order.
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.outcomes
            .lock()
            .map(|outcomes| outcomes.clone())
            .unwrap_or_default()
    }

    /// Stops accepting tickets and waits up to `timeout` for the watched ones
    /// to settle. Returns false when tickets were still open at the deadline;
    /// those keep being observed until the process exits.
    pub fn close_and_wait(&self, timeout: Duration) -> bool {
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.take();
        }
        let settled = match self.done_rx.lock() {
            Ok(done_rx) => done_rx.recv_timeout(timeout).is_ok(),
            Err(_) => false,
        };
        if settled {
            if let Some(handle) = self.worker.lock().ok().and_then(|mut worker| worker.take()) {
                let _ = handle.join();
            }
        } else {
            append_run_log(
                "warn",
                "upload.settle_timeout",
                json!({
                    "timeout_ms": timeout.as_millis() as u64,
                    "settled": self.outcomes().len(),
                }),
            );
        }
        settled
    }
}

impl Drop for DeliveryMonitor {
    fn drop(&mut self) {
        // Never join here: a gateway that holds tickets open would hang the drop.
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.take();
        }
    }
}

fn log_outcome(outcome: &DeliveryOutcome) {
    let kind = outcome.kind.as_str();
    match &outcome.status {
        DeliveryStatus::Delivered => append_run_log(
            "info",
            "upload.delivered",
            json!({ "kind": kind, "id": outcome.id }),
        ),
        DeliveryStatus::Failed(error) => append_run_log(
            "warn",
            "upload.delivery_failed",
            json!({ "kind": kind, "id": outcome.id, "error": error }),
        ),
        DeliveryStatus::Abandoned => append_run_log(
            "warn",
            "upload.abandoned",
            json!({ "kind": kind, "id": outcome.id }),
        ),
    }
}
