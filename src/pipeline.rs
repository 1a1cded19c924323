use anyhow::Context as _;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    domain::Watermark,
    gate::{GateHandle, GateReport},
    groups::dedupe_members,
    notification::{Incoming, normalize, parse_incoming},
    reconcile::{ReconcileReport, Reconciler},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub records: usize,
    pub decoded: usize,
    pub fresh: usize,
    pub already_reconciled: bool,
    pub reconcile: ReconcileReport,
    pub gate: GateReport,
}

/// Processes one notification batch and then shuts the gate down, whether or
/// not the batch succeeded.
pub async fn run_batch(
    input: &[u8],
    gate: GateHandle,
    reconciler: &Reconciler,
) -> anyhow::Result<RunSummary> {
    let result = handle_incoming(input, &gate, reconciler).await;
    let report = gate.finish().await.context("flush watermark")?;
    let mut summary = result?;
    if report.failed > 0 {
        warn!(failed = report.failed, "some watermarks were not persisted");
    }
    summary.gate = report;
    Ok(summary)
}

pub async fn handle_incoming(
    input: &[u8],
    gate: &GateHandle,
    reconciler: &Reconciler,
) -> anyhow::Result<RunSummary> {
    let mut summary = RunSummary::default();

    let records = match parse_incoming(input) {
        Incoming::Nothing => return Ok(summary),
        Incoming::Records(records) => records,
    };
    summary.records = records.len();

    let decoded = normalize(&records);
    summary.decoded = decoded.len();
    if decoded.is_empty() {
        info!(records = summary.records, "no usable records in batch");
        return Ok(summary);
    }

    let baseline = gate.baseline();
    let fresh: Vec<Watermark> = decoded
        .iter()
        .map(|r| r.watermark)
        .filter(|w| gate.is_noop() || w.is_newer_than(&baseline))
        .collect();
    summary.fresh = fresh.len();
    if fresh.is_empty() {
        info!(
            modify_index = baseline.modify_index,
            "batch already reconciled, skipping"
        );
        summary.already_reconciled = true;
        return Ok(summary);
    }

    let rosters = decoded.into_iter().map(|r| r.roster).collect::<Vec<_>>();
    let entries = dedupe_members(rosters)?;
    info!(
        users = entries.len(),
        fresh = summary.fresh,
        baseline = baseline.modify_index,
        "reconciling batch"
    );

    summary.reconcile = reconciler
        .reconcile_all(&entries)
        .await
        .context("fetch desired state")?;

    for watermark in fresh {
        gate.commit(watermark).await?;
    }

    info!(
        created = summary.reconcile.count("created"),
        updated = summary.reconcile.count("updated"),
        disabled = summary.reconcile.count("disabled"),
        skipped = summary.reconcile.count("skipped"),
        failed = summary.reconcile.failed(),
        "batch reconciled"
    );
    Ok(summary)
}
