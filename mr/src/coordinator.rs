use futures::{future, lock::Mutex, prelude::*};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tarpc::{
    context,
    server::{self, incoming::Incoming, Channel},
    tokio_serde::formats::Json,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, ErrorReport, MrError};
use crate::host::{CheckpointLog, Host, RunHandle, RunOutcome, RunProgress};
use crate::types::{JobRequest, RunResult};

/// What a status query reports for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum RunStatus {
    Running { progress: RunProgress },
    Completed { output: RunResult },
    Failed { error: ErrorReport },
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running { .. })
    }
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed(output) => RunStatus::Completed { output },
            RunOutcome::Failed(error) => RunStatus::Failed { error },
            RunOutcome::Cancelled => RunStatus::Cancelled,
        }
    }
}

struct RunEntry {
    handle: Arc<RunHandle>,
    outcome: Option<RunOutcome>,
}

/// Run table of the coordinator. Runs themselves execute on the host.
#[derive(Default)]
pub struct Coordinator {
    runs: HashMap<String, RunEntry>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_run(&mut self, run_id: &str) -> Arc<RunHandle> {
        let handle = RunHandle::new();
        self.runs.insert(
            run_id.to_string(),
            RunEntry {
                handle: Arc::clone(&handle),
                outcome: None,
            },
        );
        handle
    }

    fn finish(&mut self, run_id: &str, outcome: RunOutcome) {
        if let Some(entry) = self.runs.get_mut(run_id) {
            entry.outcome = Some(outcome);
        }
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        let entry = self.runs.get(run_id)?;
        Some(match &entry.outcome {
            Some(outcome) => outcome.clone().into(),
            None => RunStatus::Running {
                progress: entry.handle.progress(),
            },
        })
    }

    /// Asks a running run to stop at its next suspension point.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs.get(run_id) {
            Some(entry) if entry.outcome.is_none() => {
                entry.handle.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

#[derive(Clone)]
pub struct CoordinatorServer {
    coordinator: Arc<Mutex<Coordinator>>,
    host: Arc<Host>,
    socket_addr: Option<SocketAddr>,
}

impl CoordinatorServer {
    pub fn new(host: Arc<Host>) -> Self {
        CoordinatorServer {
            coordinator: Arc::new(Mutex::new(Coordinator::new())),
            host,
            socket_addr: None,
        }
    }

    fn with_peer(&self, socket_addr: Option<SocketAddr>) -> Self {
        CoordinatorServer {
            socket_addr,
            ..self.clone()
        }
    }

    pub async fn submit(&self, payload: &str) -> Result<String, MrError> {
        let request = JobRequest::from_json(payload)?;
        let run_id = Uuid::new_v4().to_string();
        let log = self.host.open_log(&run_id, request)?;
        let handle = self.coordinator.lock().await.add_run(&run_id);
        info!("run {} started by {:?}", run_id, self.socket_addr);
        self.launch(log, handle);
        Ok(run_id)
    }

    /// Resumes every checkpointed run that had not finished.
    pub async fn recover(&self) -> Result<usize, MrError> {
        let logs = self.host.recover()?;
        let count = logs.len();
        for log in logs {
            info!("recovering run {}", log.run_id());
            let handle = self.coordinator.lock().await.add_run(log.run_id());
            self.launch(log, handle);
        }
        Ok(count)
    }

    fn launch(&self, log: Arc<CheckpointLog>, handle: Arc<RunHandle>) {
        let coordinator = Arc::clone(&self.coordinator);
        let host = Arc::clone(&self.host);
        tokio::spawn(async move {
            let run_id = log.run_id().to_string();
            let joined = tokio::spawn(async move { host.resume(log, handle).await }).await;
            let outcome = joined.unwrap_or_else(|e| {
                error!("run {} orchestration aborted: {}", run_id, e);
                RunOutcome::Failed(ErrorReport {
                    kind: ErrorKind::FatalActivityError,
                    message: format!("orchestration aborted: {}", e),
                })
            });
            coordinator.lock().await.finish(&run_id, outcome);
        });
    }

    pub async fn query(&self, run_id: &str) -> Option<RunStatus> {
        self.coordinator.lock().await.status(run_id)
    }
}

impl crate::rpc::Rpc for CoordinatorServer {
    async fn start_job(self, _: context::Context, payload: String) -> Result<String, ErrorReport> {
        self.submit(&payload).await.map_err(|e| {
            warn!("rejected job from {:?}: {}", self.socket_addr, e);
            e.report()
        })
    }

    async fn status(self, _: context::Context, run_id: String) -> Option<RunStatus> {
        self.query(&run_id).await
    }

    async fn cancel(self, _: context::Context, run_id: String) -> bool {
        let cancelled = self.coordinator.lock().await.cancel(&run_id);
        if cancelled {
            info!("run {} cancellation requested", run_id);
        }
        cancelled
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

pub async fn run(server: CoordinatorServer, server_addr: SocketAddr) -> anyhow::Result<()> {
    // JSON transport is provided by the json_transport tarpc module. It makes it easy
    // to start up a serde-powered json serialization strategy over TCP.
    let mut listener = tarpc::serde_transport::tcp::listen(&server_addr, Json::default).await?;
    info!("Listening on port {}", listener.local_addr().port());
    listener.config_mut().max_frame_length(usize::MAX);

    let recovered = server.recover().await?;
    if recovered > 0 {
        info!("resumed {} unfinished runs", recovered);
    }

    listener
        // Ignore accept errors.
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        // Limit channels to 2 per IP.
        .max_channels_per_key(2, |t| {
            t.transport()
                .peer_addr()
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        })
        .map(|channel| {
            let server = server.with_peer(channel.transport().peer_addr().ok());
            channel
                .execute(crate::rpc::Rpc::serve(server))
                .for_each(spawn)
        })
        // Max 10 channels.
        .buffer_unordered(10)
        .for_each(|_| async {})
        .await;

    Ok(())
}
