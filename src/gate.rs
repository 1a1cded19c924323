use std::path::PathBuf;

use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    domain::Watermark,
    state::{StateError, WatermarkStore},
};

#[derive(Debug)]
pub enum GateMessage {
    Commit(Watermark),
    Finish { done: oneshot::Sender<GateReport> },
}

/// What the worker did over its lifetime. `persisted` is the watermark on disk
/// when `Finish` was handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub persisted: Watermark,
    pub accepted: u32,
    pub rejected: u32,
    pub failed: u32,
}

#[derive(Debug)]
pub enum GateError {
    WorkerGone,
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerGone => write!(f, "watermark worker stopped unexpectedly"),
        }
    }
}

impl std::error::Error for GateError {}

/// Main-path side of the gate. Without a worker nothing is persisted; a
/// read-only handle still skips batches at or below its baseline.
#[derive(Debug)]
pub struct GateHandle {
    tx: Option<mpsc::Sender<GateMessage>>,
    worker: Option<JoinHandle<()>>,
    baseline: Watermark,
    read_only: bool,
}

impl GateHandle {
    pub fn noop() -> Self {
        Self {
            tx: None,
            worker: None,
            baseline: Watermark::default(),
            read_only: false,
        }
    }

    /// Gates against `baseline` but never persists. Used for dry runs.
    pub fn read_only(baseline: Watermark) -> Self {
        Self {
            read_only: true,
            baseline,
            ..Self::noop()
        }
    }

    /// True when every batch is admitted.
    pub fn is_noop(&self) -> bool {
        self.tx.is_none() && !self.read_only
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The watermark persisted when the worker started.
    pub fn baseline(&self) -> Watermark {
        self.baseline
    }

    pub async fn commit(&self, candidate: Watermark) -> Result<(), GateError> {
        let Some(tx) = &self.tx else {
            if self.read_only {
                info!(
                    create_index = candidate.create_index,
                    modify_index = candidate.modify_index,
                    "dry run: would commit watermark"
                );
            }
            return Ok(());
        };
        tx.send(GateMessage::Commit(candidate))
            .await
            .map_err(|_| GateError::WorkerGone)
    }

    /// Flushes every commit sent so far and stops the worker.
    pub async fn finish(mut self) -> Result<GateReport, GateError> {
        let Some(tx) = self.tx.take() else {
            return Ok(GateReport {
                persisted: self.baseline,
                ..Default::default()
            });
        };

        let (done_tx, done_rx) = oneshot::channel();
        tx.send(GateMessage::Finish { done: done_tx })
            .await
            .map_err(|_| GateError::WorkerGone)?;
        let report = done_rx.await.map_err(|_| GateError::WorkerGone)?;
        drop(tx);

        if let Some(worker) = self.worker.take()
            && let Err(err) = worker.await
        {
            warn!(error = %err, "watermark worker join failed");
        }
        Ok(report)
    }
}

/// Opens and locks the state file on a blocking worker, then returns once the
/// persisted watermark has been loaded.
pub async fn spawn_gate(path: PathBuf) -> Result<GateHandle, StateError> {
    let (tx, mut rx) = mpsc::channel::<GateMessage>(1);
    let (init_tx, init_rx) = oneshot::channel::<Result<Watermark, StateError>>();

    let worker = tokio::task::spawn_blocking(move || {
        let mut store = match WatermarkStore::open(&path) {
            Ok(store) => store,
            Err(err) => {
                let _ = init_tx.send(Err(err));
                return;
            }
        };
        debug!(
            path = %store.path().display(),
            modify_index = store.current().modify_index,
            "watermark loaded"
        );
        let _ = init_tx.send(Ok(store.current()));
        run_worker(&mut store, &mut rx, || chrono::Utc::now().timestamp_millis());
    });

    let baseline = match init_rx.await {
        Ok(Ok(baseline)) => baseline,
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(StateError::Io(std::io::Error::other(
                "watermark worker exited during startup",
            )));
        }
    };

    Ok(GateHandle {
        tx: Some(tx),
        worker: Some(worker),
        baseline,
        read_only: false,
    })
}

fn run_worker(
    store: &mut WatermarkStore,
    rx: &mut mpsc::Receiver<GateMessage>,
    now_ms: impl Fn() -> i64,
) {
    let mut report = GateReport::default();

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            GateMessage::Commit(candidate) => match store.admit(candidate, now_ms()) {
                Ok(true) => {
                    report.accepted += 1;
                    info!(
                        create_index = candidate.create_index,
                        modify_index = candidate.modify_index,
                        lock_index = candidate.lock_index,
                        "watermark advanced"
                    );
                }
                Ok(false) => {
                    report.rejected += 1;
                    debug!(
                        modify_index = candidate.modify_index,
                        current = store.current().modify_index,
                        "watermark not advanced"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    error!(
                        modify_index = candidate.modify_index,
                        error = %err,
                        "failed to persist watermark"
                    );
                }
            },
            GateMessage::Finish { done } => {
                report.persisted = store.current();
                let _ = done.send(report);
                return;
            }
        }
    }

    debug!("watermark channel closed without finish");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RECORD_LEN, decode_record};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn noop_gate_persists_nothing() {
        let gate = GateHandle::noop();
        assert!(gate.is_noop());
        gate.commit(Watermark::candidate(1, 2, 3)).await.unwrap();
        let report = gate.finish().await.unwrap();
        assert_eq!(report, GateReport::default());
    }

    #[tokio::test]
    async fn read_only_gate_keeps_baseline_and_persists_nothing() {
        let baseline = Watermark::candidate(2, 20, 0);
        let gate = GateHandle::read_only(baseline);
        assert!(!gate.is_noop());
        assert!(gate.is_read_only());
        assert_eq!(gate.baseline(), baseline);

        gate.commit(Watermark::candidate(2, 25, 0)).await.unwrap();
        let report = gate.finish().await.unwrap();
        assert_eq!(report.persisted, baseline);
        assert_eq!(report.accepted, 0);
    }

    #[tokio::test]
    async fn commits_are_persisted_in_order_and_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("watermark");

        let gate = spawn_gate(path.clone()).await.unwrap();
        assert_eq!(gate.baseline(), Watermark::default());

        for modify in [10, 10, 5, 12] {
            gate.commit(Watermark::candidate(1, modify, 0)).await.unwrap();
        }
        let report = gate.finish().await.unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.persisted.modify_index, 12);
        assert!(report.persisted.last_seen_at_ms > 0);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(decode_record(&bytes), report.persisted);
    }

    #[tokio::test]
    async fn next_run_sees_previous_watermark_as_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("watermark");

        let gate = spawn_gate(path.clone()).await.unwrap();
        gate.commit(Watermark::candidate(4, 40, 2)).await.unwrap();
        gate.finish().await.unwrap();

        let gate = spawn_gate(path).await.unwrap();
        assert_eq!(gate.baseline().modify_index, 40);
        assert_eq!(gate.baseline().create_index, 4);
        let report = gate.finish().await.unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.persisted.modify_index, 40);
    }

    #[tokio::test]
    async fn dropped_handle_releases_the_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("watermark");

        let gate = spawn_gate(path.clone()).await.unwrap();
        drop(gate);

        let gate = spawn_gate(path).await.unwrap();
        gate.finish().await.unwrap();
    }

    #[tokio::test]
    async fn init_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let err = spawn_gate(blocker.join("watermark")).await.unwrap_err();
        assert!(matches!(err, StateError::Io(_)));
    }
}
