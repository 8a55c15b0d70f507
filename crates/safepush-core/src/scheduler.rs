//! Bounded-concurrency task scheduler with fail-slow error aggregation.
//!
//! Tasks are admitted in submission order through a semaphore; every task
//! runs to completion regardless of how its siblings end. Outcomes are
//! funnelled through one channel to the scheduler, which records them in
//! completion order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, Instrument};

use crate::error::{HarnessError, Result};
use crate::obs::{emit_task_finished, emit_task_started, task_span};

/// One unit of work, consumed by running it.
#[async_trait]
pub trait Task: Send {
    fn name(&self) -> String;

    async fn run(self: Box<Self>) -> Result<()>;
}

/// Outcome of a scheduled batch, in completion order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<String>,
    pub failures: Vec<(String, HarnessError)>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// The first failure to complete, if any.
    pub fn into_result(self) -> Result<()> {
        match self.failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskScheduler {
    parallelism: usize,
}

impl TaskScheduler {
    pub fn new(parallelism: usize) -> Result<Self> {
        if parallelism == 0 {
            return Err(HarnessError::InvalidArgument(
                "parallelism must be at least 1".to_string(),
            ));
        }
        Ok(Self { parallelism })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run every task and return the full report.
    pub async fn run_all(&self, tasks: Vec<Box<dyn Task>>) -> RunReport {
        let sem = Arc::new(Semaphore::new(self.parallelism));
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Result<()>)>();
        let total = tasks.len();

        for task in tasks {
            // Admission order is submission order.
            let permit = Arc::clone(&sem).acquire_owned().await.ok();
            let tx = tx.clone();
            let name = task.name();
            let span = task_span(&name);

            tokio::spawn(
                async move {
                    let _permit = permit;
                    let started = Instant::now();
                    emit_task_started(&name);

                    let result = AssertUnwindSafe(task.run())
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(HarnessError::TaskPanicked { task: name.clone() })
                        });

                    emit_task_finished(&name, started.elapsed().as_millis() as u64, result.is_ok());
                    let _ = tx.send((name, result));
                }
                .instrument(span),
            );
        }
        drop(tx);

        let mut report = RunReport::default();
        while let Some((name, result)) = rx.recv().await {
            match result {
                Ok(()) => report.completed.push(name),
                Err(e) => report.failures.push((name, e)),
            }
        }
        info!(
            total,
            completed = report.completed.len(),
            failed = report.failures.len(),
            "all tasks finished"
        );
        report
    }

    /// Run every task; log each failure and return the first one.
    pub async fn run(&self, tasks: Vec<Box<dyn Task>>) -> Result<()> {
        let report = self.run_all(tasks).await;
        for (name, e) in &report.failures {
            error!(task = %name, "{e}");
        }
        report.into_result()
    }
}
