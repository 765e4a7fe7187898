use crate::config::{ColumnMap, JobConfig};
use crate::driver::{call_with_retry, ActorDriver, CallKind};
use crate::governor::RateGovernor;
use crate::report::{Phase, Reporter};
use crate::store::{self, CsvTable, RowView, StoreWriter};
use crate::tools::{RequestOutcome, ToolSpec};
use crate::wallet::Wallet;
use eyre::{eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use futures::stream;
use futures::StreamExt;

#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub cancelled: bool,
}

/// Everything a worker needs, shared across the pool.
struct WorkerCtx<D: ActorDriver> {
    tool: &'static ToolSpec,
    driver: Arc<D>,
    wallet: Arc<Wallet>,
    governor: Arc<RateGovernor>,
    reporter: Arc<Reporter>,
    store: StoreWriter,
    /// Per-run response cache keyed by the normalized work-item key.
    /// Dropped with the run; never persisted.
    cache: tokio::sync::Mutex<HashMap<String, Value>>,
    cancel: CancellationToken,
    headers: Arc<Vec<String>>,
    rows: Arc<Vec<Vec<String>>>,
    column_map: ColumnMap,
    batch_size: u32,
    retry_max: u32,
    call_timeout: Duration,
    dry_run: bool,
}

/// Run one job to completion (or drained cancellation): load the input and
/// wallet, spawn the serialized store writer, then drive all pending rows
/// through a fixed-width worker pool. Emits the final status itself.
pub async fn execute<D: ActorDriver>(
    cfg: &JobConfig,
    tool: &'static ToolSpec,
    driver: Arc<D>,
    reporter: Arc<Reporter>,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let mut table = CsvTable::load(&cfg.input_path)?;
    if table.ensure_status_column()? {
        tracing::info!(input = %cfg.input_path.display(), "added Status column to input");
    }

    let headers = Arc::new(table.headers().to_vec());
    let rows = Arc::new(table.rows().to_vec());
    let done: Arc<Vec<bool>> = Arc::new((0..table.len()).map(|i| table.is_done(i)).collect());
    let total = rows.len();
    reporter.set_total(total);

    let wallet = Arc::new(Wallet::load(&cfg.credentials_path, cfg.per_credential_limit)?);
    let governor = RateGovernor::new(cfg.max_concurrent, cfg.max_requests_per_second);

    let (store_writer, store_task) = store::spawn_writer(
        table,
        cfg.output_path.clone(),
        tool.output_columns_vec(),
        cancel.clone(),
    );

    let startup = wallet.snapshot().await;
    tracing::info!(
        tool = tool.id,
        rows = total,
        active_credentials = startup.active,
        remaining_credits = startup.total_remaining,
        dry_run = cfg.dry_run,
        "job starting"
    );
    reporter.status(Phase::Running, Some(&reporter.snapshot(startup)));

    let ctx = Arc::new(WorkerCtx {
        tool,
        driver,
        wallet: wallet.clone(),
        governor,
        reporter: reporter.clone(),
        store: store_writer,
        cache: tokio::sync::Mutex::new(HashMap::new()),
        cancel: cancel.clone(),
        headers,
        rows,
        column_map: cfg.column_map.clone(),
        batch_size: cfg.batch_size,
        retry_max: cfg.retry_max,
        call_timeout: cfg.call_timeout,
        dry_run: cfg.dry_run,
    });

    let fatal: Arc<std::sync::Mutex<Option<eyre::Report>>> =
        Arc::new(std::sync::Mutex::new(None));

    stream::iter(0..total)
        .for_each_concurrent(cfg.max_concurrent, |row_index| {
            let ctx = ctx.clone();
            let done = done.clone();
            let fatal = fatal.clone();
            async move {
                // Drain: once cancel is observed, no new row is picked.
                if ctx.cancel.is_cancelled() {
                    return;
                }
                if done[row_index] {
                    ctx.reporter.note_skipped_done();
                    ctx.reporter.row_complete(ctx.wallet.snapshot().await);
                    return;
                }
                if let Err(err) = process_row(&ctx, row_index).await {
                    tracing::error!(row = row_index, error = %err, "row processing aborted the run");
                    if let Ok(mut slot) = fatal.lock() {
                        slot.get_or_insert(err);
                    }
                    ctx.cancel.cancel();
                }
            }
        })
        .await;

    // Close the store queue and wait for the last checkpoint to land.
    drop(ctx);
    store_task
        .await
        .map_err(|err| eyre!("store writer task panicked: {err}"))??;

    if let Some(err) = fatal.lock().ok().and_then(|mut slot| slot.take()) {
        return Err(err);
    }

    let cancelled = cancel.is_cancelled();
    let final_snapshot = reporter.snapshot(wallet.snapshot().await);
    reporter.status(
        if cancelled { Phase::Stopped } else { Phase::Done },
        Some(&final_snapshot),
    );
    Ok(RunOutcome { cancelled })
}

async fn process_row<D: ActorDriver>(ctx: &Arc<WorkerCtx<D>>, row_index: usize) -> Result<()> {
    ctx.reporter.note_row_started(row_index);
    let row = RowView::new(&ctx.headers, &ctx.rows[row_index]);

    // Tool mappers are user-supplied code; a panic becomes a client error
    // for this row, never a crash of the pool.
    let mapped = catch_unwind(AssertUnwindSafe(|| {
        (ctx.tool.build_request)(row, &ctx.column_map, ctx.batch_size)
    }));
    let built = match mapped {
        Ok(RequestOutcome::Built(built)) => built,
        Ok(RequestOutcome::Skip(reason)) => {
            tracing::warn!(row = row_index, reason = %reason, "row skipped (no request)");
            return close_failed(ctx, row_index, "invalid_input", &reason).await;
        }
        Err(_) => {
            return close_failed(ctx, row_index, "client_error", "request mapper panicked").await
        }
    };

    if ctx.dry_run {
        tracing::info!(row = row_index, key = %built.key, "DRY RUN: would call driver");
        ctx.reporter.note_succeeded();
        ctx.reporter.row_complete(ctx.wallet.snapshot().await);
        return Ok(());
    }

    // Rows with an empty key are processed but never cached.
    if !built.key.is_empty() {
        let hit = ctx.cache.lock().await.get(&built.key).cloned();
        if let Some(parsed) = hit {
            tracing::debug!(row = row_index, key = %built.key, "cache hit; no credits spent");
            return finish_success(ctx, row_index, row, &parsed).await;
        }
    }

    // Credential rotation loop: one iteration per credential tried for this
    // row. Every reservation leaves through exactly one of commit, refund,
    // or retire, on every path.
    loop {
        let Some(permit) = ctx.governor.acquire(&ctx.cancel).await else {
            // Cancelled while waiting; the row stays open for the next run.
            return Ok(());
        };

        let need = ctx.tool.estimated_cost(ctx.batch_size);
        let Some(reservation) = ctx.wallet.reserve(need).await? else {
            drop(permit);
            tracing::warn!(row = row_index, "no usable credential remains");
            return close_failed(
                ctx,
                row_index,
                "no_credits",
                "no credits remaining on any credential",
            )
            .await;
        };
        ctx.reporter.note_credential(&reservation.short_id);

        let outcome = call_with_retry(
            ctx.driver.as_ref(),
            &reservation.token,
            &built.request,
            ctx.retry_max,
            ctx.call_timeout,
            &ctx.cancel,
        )
        .await;
        drop(permit);

        match outcome.kind {
            CallKind::Success => {
                ctx.wallet
                    .commit(reservation, outcome.cost_actual.max(1))
                    .await?;
                if !built.key.is_empty() {
                    ctx.cache
                        .lock()
                        .await
                        .insert(built.key.clone(), outcome.parsed.clone());
                }
                return finish_success(ctx, row_index, row, &outcome.parsed).await;
            }
            CallKind::Cancelled => {
                // Nothing was consumed; release the credits and drain.
                ctx.wallet.refund(reservation).await?;
                return Ok(());
            }
            kind if kind.retires_credential() => {
                let message = outcome
                    .message
                    .as_deref()
                    .unwrap_or("credential rejected by remote");
                ctx.wallet.retire(reservation, kind, message).await?;
                // Same row, next credential.
                continue;
            }
            CallKind::Fatal => {
                ctx.wallet.refund(reservation).await?;
                return Err(eyre!(
                    "driver reported a fatal condition: {}",
                    outcome.message.as_deref().unwrap_or("unknown")
                ));
            }
            _ => {
                // Client error, or a transient that exhausted its retries.
                // Credit is burned only when the remote reported consumption.
                if outcome.cost_actual >= 1 {
                    ctx.wallet.commit(reservation, outcome.cost_actual).await?;
                } else {
                    ctx.wallet.refund(reservation).await?;
                }
                let error_status = row_error_status(&outcome.kind, outcome.http_status);
                let message = outcome.message.as_deref().unwrap_or("request failed");
                tracing::warn!(
                    row = row_index,
                    status = outcome.http_status,
                    kind = ?outcome.kind,
                    message,
                    "row failed"
                );
                return close_failed(ctx, row_index, &error_status, message).await;
            }
        }
    }
}

fn row_error_status(kind: &CallKind, http_status: u16) -> String {
    match kind {
        CallKind::Transient => "transient_exhausted".to_string(),
        _ if http_status > 0 => format!("http_{http_status}"),
        _ => "client_error".to_string(),
    }
}

/// Write the success (or no-match) output rows, checkpoint the input row,
/// bump counters. One checkpoint regardless of how many rows fanned out.
async fn finish_success<D: ActorDriver>(
    ctx: &Arc<WorkerCtx<D>>,
    row_index: usize,
    row: RowView<'_>,
    parsed: &Value,
) -> Result<()> {
    let output = match catch_unwind(AssertUnwindSafe(|| {
        (ctx.tool.build_output_rows)(row, &ctx.column_map, parsed)
    })) {
        Ok(output) => output,
        Err(_) => {
            return close_failed(ctx, row_index, "client_error", "output mapper panicked").await
        }
    };

    let matched = output.matched && !output.rows.is_empty();
    let rows = if output.rows.is_empty() {
        vec![ctx.tool.failure_row("no_match", "no results")]
    } else {
        output.rows
    };
    ctx.store.append(rows);
    ctx.store.mark_done(row_index);
    if matched {
        ctx.reporter.note_succeeded();
    } else {
        ctx.reporter.note_no_match();
    }
    ctx.reporter.row_complete(ctx.wallet.snapshot().await);
    Ok(())
}

/// Close a row as a permanent failure: failure output row, `Status=done` on
/// the input (failures are not retried across runs), `failed` counter.
async fn close_failed<D: ActorDriver>(
    ctx: &Arc<WorkerCtx<D>>,
    row_index: usize,
    error_status: &str,
    error_message: &str,
) -> Result<()> {
    ctx.store
        .append(vec![ctx.tool.failure_row(error_status, error_message)]);
    ctx.store.mark_done(row_index);
    ctx.reporter.note_failed();
    ctx.reporter.row_complete(ctx.wallet.snapshot().await);
    Ok(())
}
