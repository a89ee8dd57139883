use std::sync::{Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::UpdateConfig;
use crate::error::Result;
use crate::net::Sender;
use crate::protocol::{Body, Packet, UpdateRequest, UpdateState, UpdateStatus};

#[derive(Debug, Clone)]
pub struct UpdateJob {
    pub transaction_id: u16,
    pub request: UpdateRequest,
}

impl UpdateJob {
    fn status(&self, state: UpdateState, reason: impl Into<String>) -> Packet {
        Packet::new(
            self.transaction_id,
            Body::UpdateStatus(UpdateStatus {
                component: self.request.component.clone(),
                state,
                reason: reason.into(),
            }),
        )
    }
}

pub struct UpdateSimulator {
    sender: Sender,
    config: UpdateConfig,
    jobs: Mutex<Vec<JoinHandle<UpdateState>>>,
}

impl UpdateSimulator {
    pub fn new(sender: Sender, config: UpdateConfig) -> Self {
        Self {
            sender,
            config,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn(&self, job: UpdateJob) {
        info!(
            txn = job.transaction_id,
            component = %job.request.component,
            url = %job.request.url,
            args = %job.request.arguments,
            "Starting simulated update"
        );
        let handle = tokio::spawn(run(self.sender.clone(), self.config, job));

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Hands over the handles of every job spawned since the last call,
    /// finished or not.
    pub fn take_handles(&self) -> Vec<JoinHandle<UpdateState>> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

async fn run(sender: Sender, config: UpdateConfig, job: UpdateJob) -> UpdateState {
    match lifecycle(&sender, config, &job).await {
        Ok(state) => state,
        Err(e) => {
            warn!(txn = job.transaction_id, error = %e, "Update job failed");
            let report = job.status(UpdateState::Failed, format!("Exception: {}", e));
            if let Err(e) = sender.send(&report, "Update Failed (exception)").await {
                debug!(txn = job.transaction_id, error = %e, "Dropping update failure report");
            }
            UpdateState::Failed
        }
    }
}

/// started -> sleep -> success | failed
async fn lifecycle(sender: &Sender, config: UpdateConfig, job: &UpdateJob) -> Result<UpdateState> {
    sender
        .send(&job.status(UpdateState::Started, ""), "Update Started")
        .await?;

    tokio::time::sleep(config.duration).await;

    let failure_rate = config.failure_rate.clamp(0.0, 1.0);
    let final_state = if rand::random::<f64>() < failure_rate {
        UpdateState::Failed
    } else {
        UpdateState::Success
    };

    let (packet, reason) = match final_state {
        UpdateState::Failed => (job.status(final_state, "Simulated failure"), "Update Failed"),
        _ => (job.status(final_state, ""), "Update Success"),
    };
    sender.send(&packet, reason).await?;
    Ok(final_state)
}
