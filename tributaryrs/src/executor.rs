//! Datasource query execution: sequential or bounded-parallel fan-out
//! with a global deadline and cooperative kill.
//!
//! Workers only touch their own state; cancellation flows through a shared
//! [`KillSwitch`] that backends register native cancel handles on
//! (SQLite interrupt handles, PostgreSQL cancel tokens).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::backends::{BackendConnection, RowSet};
use crate::error::{Result, TributaryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    #[default]
    Sequential,
    Parallel,
}

type CancelFn = Box<dyn Fn() + Send>;

/// Cooperative cancellation shared between a report and its in-flight
/// backend queries. `kill` flips the flag and fires every registered
/// cancel; the timeout path fires cancels without flipping the flag so the
/// two exits stay distinguishable.
#[derive(Default)]
pub struct KillSwitch {
    killed: AtomicBool,
    next_id: AtomicU64,
    cancels: Mutex<HashMap<u64, CancelFn>>,
}

impl KillSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Request cancellation. Safe to call concurrently; a second kill is a
    /// no-op.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("kill requested, interrupting in-flight queries");
        self.interrupt_all();
    }

    /// Re-arm for another execution.
    pub fn reset(&self) {
        self.killed.store(false, Ordering::SeqCst);
    }

    /// Fire all registered cancels without marking the run as killed.
    /// Used by the deadline path.
    pub fn interrupt_all(&self) {
        let cancels = self.cancels.lock().expect("cancel registry poisoned");
        for cancel in cancels.values() {
            cancel();
        }
    }

    /// Register a backend cancel handle for the duration of one query.
    /// Fires immediately if a kill already happened.
    pub fn register(&self, cancel: CancelFn) -> u64 {
        if self.is_killed() {
            cancel();
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .insert(id, cancel);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.cancels
            .lock()
            .expect("cancel registry poisoned")
            .remove(&id);
    }
}

/// A rendered query bound to its datasource backend.
pub(crate) struct PlannedQuery {
    pub index: usize,
    pub datasource: String,
    pub backend: Arc<dyn BackendConnection>,
    pub sql: String,
}

pub(crate) struct ExecutedQuery {
    pub index: usize,
    pub rowset: RowSet,
    pub duration: Duration,
}

/// Run all planned queries under the configured mode and deadline.
/// Results come back tagged with their plan index; order is unspecified in
/// parallel mode.
pub(crate) async fn execute_all(
    queries: Vec<PlannedQuery>,
    mode: QueryMode,
    timeout: Option<Duration>,
    workers: usize,
    kill: Arc<KillSwitch>,
) -> Result<Vec<ExecutedQuery>> {
    if kill.is_killed() {
        return Err(TributaryError::ExecutionKilled);
    }
    tracing::debug!(
        queries = queries.len(),
        ?mode,
        ?timeout,
        workers,
        "executing datasource queries"
    );

    let run = async {
        match mode {
            QueryMode::Sequential => execute_sequential(queries, &kill).await,
            QueryMode::Parallel => execute_parallel(queries, workers, &kill).await,
        }
    };

    let outcome = match timeout {
        Some(deadline) => match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                // Free backend connections before surfacing the timeout.
                kill.interrupt_all();
                tracing::warn!(?deadline, "datasource query deadline exceeded");
                return Err(TributaryError::QueryTimeout(deadline));
            }
        },
        None => run.await,
    };

    if kill.is_killed() {
        return Err(TributaryError::ExecutionKilled);
    }
    outcome
}

async fn execute_sequential(
    queries: Vec<PlannedQuery>,
    kill: &Arc<KillSwitch>,
) -> Result<Vec<ExecutedQuery>> {
    let mut results = Vec::with_capacity(queries.len());
    for query in queries {
        if kill.is_killed() {
            return Err(TributaryError::ExecutionKilled);
        }
        results.push(run_one(query, kill).await?);
    }
    Ok(results)
}

async fn execute_parallel(
    queries: Vec<PlannedQuery>,
    workers: usize,
    kill: &Arc<KillSwitch>,
) -> Result<Vec<ExecutedQuery>> {
    let limiter = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(queries.len());
    for query in queries {
        let limiter = limiter.clone();
        let kill = kill.clone();
        handles.push(tokio::spawn(async move {
            let _permit = limiter
                .acquire_owned()
                .await
                .map_err(|e| TributaryError::Execution(format!("worker limiter closed: {e}")))?;
            run_one(query, &kill).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for joined in futures::future::join_all(handles).await {
        let result =
            joined.map_err(|e| TributaryError::Execution(format!("worker task failed: {e}")))?;
        results.push(result?);
    }
    Ok(results)
}

async fn run_one(query: PlannedQuery, kill: &Arc<KillSwitch>) -> Result<ExecutedQuery> {
    let start = Instant::now();
    tracing::debug!(
        datasource = %query.datasource,
        sql_len = query.sql.len(),
        "executing datasource query"
    );
    tracing::trace!(sql = %query.sql, "datasource SQL");

    let rowset = query.backend.execute_sql(&query.sql, kill).await;
    let duration = start.elapsed();

    match rowset {
        Ok(rowset) => {
            tracing::debug!(
                datasource = %query.datasource,
                rows = rowset.rows.len(),
                ms = duration.as_millis(),
                "datasource query completed"
            );
            Ok(ExecutedQuery {
                index: query.index,
                rowset,
                duration,
            })
        }
        Err(e) => {
            // A query interrupted by kill() reports the kill, not the
            // backend's interrupt error.
            if kill.is_killed() {
                return Err(TributaryError::ExecutionKilled);
            }
            tracing::error!(
                datasource = %query.datasource,
                error = %e,
                ms = duration.as_millis(),
                "datasource query failed"
            );
            Err(e)
        }
    }
}
