//! Asynchronous provider jobs (e.g. bulk server registration).
//!
//! A job goes through three phases: [`JobExecutor::run`] waits for a free slot
//! of the job's kind and submits it, a spawned poller waits until the job
//! reached a terminal state (bounded number of polls), and
//! [`JobHandle::result`] waits for the poller's verdict. The slot is released
//! after a short cool-down to smooth bursts against provider rate limits.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use log::debug;
use tokio::{
    sync::{Semaphore, oneshot},
    time::{Duration, sleep},
};
use tokio_util::sync::CancellationToken;

use super::{CloudError, CloudProvider, JobStatus, retry::retry_call};
use crate::errors::ControllerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum JobKind {
    AddServers,
    RemoveServers,
}

const JOB_KINDS: [JobKind; 2] = [JobKind::AddServers, JobKind::RemoveServers];

#[derive(Clone, Debug)]
pub(crate) struct JobSettings {
    /// Maximum number of in-flight jobs per kind.
    pub permits: usize,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub cooldown: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            permits: 4,
            poll_interval: Duration::from_secs(2),
            max_polls: 60,
            cooldown: Duration::from_secs(1),
        }
    }
}

/// Process wide gate for asynchronous jobs, shared by all reconciliation passes.
pub(crate) struct JobExecutor {
    cloud: Arc<dyn CloudProvider>,
    gates: BTreeMap<JobKind, Arc<Semaphore>>,
    settings: JobSettings,
}

impl JobExecutor {
    pub fn new(cloud: Arc<dyn CloudProvider>, settings: JobSettings) -> Self {
        let gates = JOB_KINDS
            .iter()
            .map(|k| (*k, Arc::new(Semaphore::new(settings.permits.max(1)))))
            .collect();
        Self {
            cloud,
            gates,
            settings,
        }
    }

    /// Submit a job once a slot of `kind` is available, `submit` returns the job
    /// ID and is repeated while the provider reports transient errors.
    pub async fn run<F, Fut>(
        &self,
        kind: JobKind,
        cancel: &CancellationToken,
        submit: F,
    ) -> Result<JobHandle, ControllerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, CloudError>>,
    {
        let gate = self
            .gates
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no gate for job kind {:?}", kind))?;
        let permit = tokio::select! {
            permit = gate.acquire_owned() => permit.map_err(|e| anyhow::anyhow!("job gate closed: {}", e))?,
            _ = cancel.cancelled() => return Err(ControllerError::Timeout(format!("{:?} slot (cancelled)", kind))),
        };
        let job_id = retry_call("submit job", submit).await?;
        debug!("submitted {:?} job {}", kind, job_id);
        let (sender, receiver) = oneshot::channel();
        let cloud = self.cloud.clone();
        let settings = self.settings.clone();
        let cancel = cancel.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let result = poll_until_done(cloud.as_ref(), &id, &settings, &cancel).await;
            // The receiver might be gone if the caller was cancelled, the slot is released anyway.
            let _ = sender.send(result);
            sleep(settings.cooldown).await;
            drop(permit);
        });
        Ok(JobHandle { job_id, receiver })
    }
}

async fn poll_until_done(
    cloud: &dyn CloudProvider,
    job_id: &str,
    settings: &JobSettings,
    cancel: &CancellationToken,
) -> Result<(), ControllerError> {
    for _ in 0..settings.max_polls {
        match cloud.get_job(job_id).await {
            Ok(JobStatus::Succeeded) => return Ok(()),
            Ok(JobStatus::Failed(message)) => {
                return Err(ControllerError::JobFailed {
                    job: job_id.to_string(),
                    message,
                });
            }
            Ok(JobStatus::Running) => (),
            Err(e) if e.is_retryable() => debug!("polling job {} failed: {}", job_id, e),
            Err(e) => return Err(e.into()),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ControllerError::Timeout(format!("job {} (cancelled)", job_id))),
            _ = sleep(settings.poll_interval) => (),
        }
    }
    Err(ControllerError::Timeout(format!("job {}", job_id)))
}

/// Pending asynchronous job.
pub(crate) struct JobHandle {
    job_id: String,
    receiver: oneshot::Receiver<Result<(), ControllerError>>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait until the job reached a terminal state.
    pub async fn result(self) -> Result<(), ControllerError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::JobFailed {
                job: self.job_id,
                message: "poller terminated without result".to_string(),
            }),
        }
    }
}
