//! Request queue in front of the pipeline.
//!
//! One worker thread owns the model handle and processes scans strictly one
//! at a time. Admission is bounded: when `queue_depth` requests are already
//! waiting, [`InferenceService::submit`] refuses instead of blocking. A panic
//! while serving one scan is answered with an error report; the worker keeps
//! running.

use crate::{
    config::{Config, ConfigError},
    model::SharedModel,
    pipeline::{self, InferenceOutcome},
    report::ScanReport,
    volumetrics::VolumetricResult,
};

use futures::channel::oneshot;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("request queue is full")]
    QueueFull,

    #[error("service is shut down")]
    Closed,

    #[error("cannot start worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

struct Job {
    path: PathBuf,
    reply: oneshot::Sender<ScanReport>,
}

pub struct InferenceService {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl InferenceService {
    /// Spawn the worker. The model is shared read-only with it for the
    /// lifetime of the service.
    pub fn start(model: SharedModel, config: Config) -> Result<Self, ServiceError> {
        config.validate()?;
        let (sender, mut receiver) = mpsc::channel::<Job>(config.queue_depth.max(1));
        let worker = thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        pipeline::run_request(model.as_ref(), &job.path, &config)
                    }))
                    .unwrap_or_else(|payload| panicked(&job.path, payload.as_ref()));
                    let report = ScanReport::from_outcome(&job.path, &outcome);
                    if job.reply.send(report).is_err() {
                        debug!(path = %job.path.display(), "requester dropped before reply");
                    }
                }
                debug!("inference worker stopped");
            })?;
        info!("inference service started");
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue a scan. The report arrives on the returned receiver.
    pub fn submit(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<oneshot::Receiver<ScanReport>, ServiceError> {
        let sender = self.sender.as_ref().ok_or(ServiceError::Closed)?;
        let (reply, receiver) = oneshot::channel();
        sender
            .try_send(Job {
                path: path.into(),
                reply,
            })
            .map_err(|error| match error {
                TrySendError::Full(_) => ServiceError::QueueFull,
                TrySendError::Closed(_) => ServiceError::Closed,
            })?;
        Ok(receiver)
    }

    /// Queue a scan and wait for its report.
    pub async fn process(&self, path: impl Into<PathBuf>) -> Result<ScanReport, ServiceError> {
        self.submit(path)?.await.map_err(|_| ServiceError::Closed)
    }

    /// Stop accepting requests, finish the queued ones and join the worker.
    pub fn shutdown(mut self) -> Result<(), ServiceError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        self.sender.take();
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| ServiceError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

fn panicked(path: &Path, payload: &(dyn Any + Send)) -> InferenceOutcome {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(path = %path.display(), %message, "request panicked");
    InferenceOutcome::Degraded {
        reason: format!("internal error: {message}"),
        result: VolumetricResult::zeroed(),
    }
}

impl Drop for InferenceService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
