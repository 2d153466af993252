//! Worker pool running independent diagnosis runs.
//!
//! Runs are queued on a crossbeam channel and picked up by N worker threads.
//! Each run is sequential on its worker; runs have no ordering between them.
//! Dropping the service closes the queue, lets queued runs finish and joins
//! the workers.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use uuid::Uuid;

use super::orchestrator::{CancellationToken, PipelineOrchestrator};
use super::types::{DiagnosticRequest, PipelineRun};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Diagnosis workers are not running")]
    WorkersStopped,
}

struct Job {
    run: PipelineRun,
    request: DiagnosticRequest,
    cancel: CancellationToken,
    reply: Sender<PipelineRun>,
}

/// Handle on a submitted run.
pub struct RunTicket {
    run_id: Uuid,
    cancel: CancellationToken,
    result: Receiver<PipelineRun>,
}

impl RunTicket {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Takes effect at the next stage boundary; a call
    /// already in flight completes and its result is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the run reaches a terminal status.
    pub fn wait(self) -> Result<PipelineRun, ServiceError> {
        self.result.recv().map_err(|_| ServiceError::WorkersStopped)
    }

    /// `Ok(None)` when the run is still going after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<PipelineRun>, ServiceError> {
        match self.result.recv_timeout(timeout) {
            Ok(run) => Ok(Some(run)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ServiceError::WorkersStopped),
        }
    }
}

pub struct DiagnosisService {
    queue: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl DiagnosisService {
    /// Spawn `workers` threads (at least one) sharing `orchestrator`.
    pub fn start(orchestrator: Arc<PipelineOrchestrator>, workers: usize) -> Self {
        let (queue, jobs) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(workers.max(1));

        for index in 0..workers.max(1) {
            let jobs = jobs.clone();
            let orchestrator = Arc::clone(&orchestrator);
            let spawned = std::thread::Builder::new()
                .name(format!("logpilot-worker-{index}"))
                .spawn(move || worker_loop(index, &orchestrator, &jobs));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(worker = index, error = %e, "Failed to spawn diagnosis worker"),
            }
        }

        tracing::info!(workers = handles.len(), "Diagnosis service started");
        Self {
            queue: Some(queue),
            workers: handles,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue a run. The run record (and its id) is created here.
    pub fn submit(&self, request: DiagnosticRequest) -> RunTicket {
        let run = PipelineRun::new(&request);
        let run_id = run.id;
        let cancel = CancellationToken::new();
        let (reply, result) = crossbeam_channel::bounded(1);

        let job = Job {
            run,
            request,
            cancel: cancel.clone(),
            reply,
        };
        match &self.queue {
            Some(queue) => {
                if queue.send(job).is_err() {
                    tracing::error!(%run_id, "Diagnosis queue closed, run dropped");
                } else {
                    tracing::debug!(%run_id, queued = queue.len(), "Run queued");
                }
            }
            None => tracing::error!(%run_id, "Diagnosis service stopped, run dropped"),
        }

        RunTicket {
            run_id,
            cancel,
            result,
        }
    }
}

impl Drop for DiagnosisService {
    fn drop(&mut self) {
        // Closing the queue ends each worker loop once it drains.
        self.queue.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("Diagnosis service stopped");
    }
}

fn worker_loop(index: usize, orchestrator: &PipelineOrchestrator, jobs: &Receiver<Job>) {
    tracing::debug!(worker = index, "Diagnosis worker started");
    for job in jobs.iter() {
        let run = orchestrator.execute(job.run, &job.request, &job.cancel);
        if job.reply.send(run).is_err() {
            tracing::debug!(worker = index, "Run ticket dropped before completion");
        }
    }
    tracing::debug!(worker = index, "Diagnosis worker stopped");
}
