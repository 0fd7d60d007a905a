//! Replicator (C6): drives the Durable Buffer → MES pipeline in ordered,
//! idempotent batches (spec §4.5). The periodic-timer-plus-signal task shape
//! follows the teacher's own background loops in `main.rs`; the backoff and
//! poison-handling state machine is new, built directly from the spec's
//! upload algorithm.

use crate::buffer::DurableBuffer;
use crate::clock;
use crate::events::{EngineEvent, EventBus};
use crate::mes::{MesClient, MesOutcome};
use crate::model::Order;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Fallback pass cap (spec §4.5 step 6) used only when a caller does not
/// wire in `sync.max_attempts_per_pass` from config.
const DEFAULT_MAX_PASSES_PER_TRIGGER: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Idle,
    Uploaded(usize),
    Retry,
    AuthFailed,
}

pub struct Replicator {
    buffer: Arc<DurableBuffer>,
    mes: Arc<MesClient>,
    events: Arc<EventBus>,
    batch_max: usize,
    max_passes_per_trigger: u32,
    backoff: Duration,
}

impl Replicator {
    pub fn new(
        buffer: Arc<DurableBuffer>,
        mes: Arc<MesClient>,
        events: Arc<EventBus>,
        batch_max: usize,
        max_passes_per_trigger: u32,
    ) -> Self {
        Self {
            buffer,
            mes,
            events,
            batch_max,
            max_passes_per_trigger,
            backoff: INITIAL_BACKOFF,
        }
    }

    /// Runs passes until the buffer is drained, a retry is needed, or the
    /// per-trigger pass cap is hit (spec §4.5 step 6, bounded by
    /// `sync.max_attempts_per_pass`).
    pub async fn run_until_idle_or_retry(&mut self, current_order: Option<&Order>, station_id: u64) {
        self.events.publish(EngineEvent::SyncStarted);
        let mut total_uploaded = 0usize;
        for _ in 0..self.max_passes_per_trigger {
            match self.run_one_pass(current_order, station_id).await {
                PassOutcome::Idle => break,
                PassOutcome::Uploaded(n) => {
                    total_uploaded += n;
                    self.backoff = INITIAL_BACKOFF;
                }
                PassOutcome::Retry => {
                    warn!("replicator pass failed transiently, backing off {:?}", self.backoff);
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                }
                PassOutcome::AuthFailed => {
                    warn!("replicator pass failed: reauthentication rejected");
                    break;
                }
            }
        }
        self.events.publish(EngineEvent::SyncCompleted {
            uploaded: total_uploaded,
        });
    }

    /// One upload pass (spec §4.5).
    pub async fn run_one_pass(&mut self, current_order: Option<&Order>, station_id: u64) -> PassOutcome {
        let batch_size = self.buffer.pending_count().await.unwrap_or(0);
        if batch_size == 0 {
            return PassOutcome::Idle;
        }

        let mut batch = match self.buffer.pending_batch(self.batch_max).await {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to read pending batch: {e}");
                return PassOutcome::Retry;
            }
        };
        if batch.is_empty() {
            return PassOutcome::Idle;
        }

        for increment in batch.iter_mut() {
            if increment.fingerprint.is_empty() {
                increment.fingerprint = clock::fingerprint(
                    &increment.order_code,
                    &increment.upc,
                    &increment.occurred_at,
                    increment.station_id,
                );
            }
        }

        match self.mes.upload_increments(&batch).await {
            MesOutcome::Ok(accepted) => {
                let seqs: Vec<i64> = batch.iter().map(|i| i.seq).collect();
                if let Err(e) = self.buffer.mark_synced(&seqs).await {
                    warn!("failed to mark batch synced: {e}");
                    return PassOutcome::Retry;
                }
                info!("uploaded {} increment(s)", accepted);

                if let Some(order) = current_order {
                    if let MesOutcome::Ok(progress) =
                        self.mes.get_order_progress(&order.code).await
                    {
                        self.events.publish(EngineEvent::ProgressUpdated {
                            order_code: order.code.clone(),
                            quantity_pending: progress.quantity_pending,
                            progress_ratio: progress.progress_ratio,
                        });
                    }
                }
                let _ = station_id;
                PassOutcome::Uploaded(seqs.len())
            }
            MesOutcome::AuthExpired => {
                // The Replicator owns the single-writer reauthentication
                // protocol (spec §5): refresh once, retry the same batch.
                match self.mes.reauthenticate().await {
                    MesOutcome::Ok(()) => match self.mes.upload_increments(&batch).await {
                        MesOutcome::Ok(accepted) => {
                            let seqs: Vec<i64> = batch.iter().map(|i| i.seq).collect();
                            let _ = self.buffer.mark_synced(&seqs).await;
                            PassOutcome::Uploaded(accepted)
                        }
                        _ => PassOutcome::AuthFailed,
                    },
                    _ => PassOutcome::AuthFailed,
                }
            }
            MesOutcome::Transient(reason) => {
                warn!("transient upload failure: {reason}");
                PassOutcome::Retry
            }
            MesOutcome::Permanent(reason) => {
                // Poison the oldest offending row and continue (spec §4.5).
                if let Some(first) = batch.first() {
                    let _ = self.buffer.mark_rejected(first.seq).await;
                    self.events.publish(EngineEvent::IncrementRejected {
                        seq: first.seq,
                        reason,
                    });
                }
                PassOutcome::Uploaded(0)
            }
            MesOutcome::NotFound => {
                warn!("upload endpoint returned not found");
                PassOutcome::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Increment, IncrementSource};
    use tempfile::NamedTempFile;

    async fn new_buffer() -> (Arc<DurableBuffer>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let buffer = Arc::new(DurableBuffer::new(file.path()).await.unwrap());
        (buffer, file)
    }

    #[tokio::test]
    async fn empty_buffer_pass_is_idle() {
        let (buffer, _file) = new_buffer().await;
        let mes = Arc::new(MesClient::new("http://localhost:1", 1, "operator", "secret"));
        let events = Arc::new(EventBus::new());
        let mut replicator = Replicator::new(buffer, mes, events, 100, DEFAULT_MAX_PASSES_PER_TRIGGER);
        let outcome = replicator.run_one_pass(None, 7).await;
        assert_eq!(outcome, PassOutcome::Idle);
    }

    #[tokio::test]
    async fn unreachable_mes_yields_retry() {
        let (buffer, _file) = new_buffer().await;
        buffer
            .append(&Increment {
                seq: 0,
                order_code: "OF-100".to_string(),
                upc: "012345678905".to_string(),
                quantity: 1,
                occurred_at: chrono::Utc::now(),
                source: IncrementSource::Device,
                station_id: 7,
                user_id: 1,
                order_id: 1,
                synced: false,
                rejected: false,
                fingerprint: String::new(),
            })
            .await
            .unwrap();

        // Port 1 is reserved and never accepts connections; the request
        // fails fast rather than hanging for the full timeout.
        let mes = Arc::new(MesClient::new("http://127.0.0.1:1", 1, "operator", "secret"));
        let events = Arc::new(EventBus::new());
        let mut replicator = Replicator::new(buffer.clone(), mes, events, 100, DEFAULT_MAX_PASSES_PER_TRIGGER);
        let outcome = replicator.run_one_pass(None, 7).await;
        assert_eq!(outcome, PassOutcome::Retry);
        assert_eq!(buffer.pending_count().await.unwrap(), 1);
    }
}
