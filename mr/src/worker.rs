use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::activity::{self, Activity, ActivityOutput};
use crate::error::{MrError, Result};
use crate::resolver::InputResolver;
use crate::types::{GroupedEntry, InputRecord, MapperOutput};

/// Executes one activity attempt. The host calls this at least once per
/// scheduled activity, so implementations must be idempotent.
#[async_trait]
pub trait ActivityWorker: Send + Sync {
    async fn execute(&self, activity: Activity) -> Result<ActivityOutput>;
}

// Worker 是执行 Activity 的机器的抽象
pub struct Worker {
    resolver: Option<Arc<InputResolver>>,
}

impl Worker {
    pub fn new(resolver: Arc<InputResolver>) -> Self {
        Worker {
            resolver: Some(resolver),
        }
    }

    /// A worker that only accepts inline jobs.
    pub fn without_store() -> Self {
        Worker { resolver: None }
    }

    async fn do_resolve(
        &self,
        container: Option<String>,
        blobs: Option<Vec<String>>,
    ) -> Result<ActivityOutput> {
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            MrError::Configuration("no object store configured for this worker".to_string())
        })?;
        let records = resolver
            .resolve(container.as_deref(), blobs.as_deref())
            .await?;
        Ok(ActivityOutput::Input(records))
    }

    fn do_map(&self, record: &InputRecord) -> ActivityOutput {
        ActivityOutput::Mapped(activity::map_record(record))
    }

    // shuffle sees the whole run at once, keep it off the async threads
    async fn do_shuffle(&self, outputs: Vec<MapperOutput>) -> Result<ActivityOutput> {
        let grouped = tokio::task::spawn_blocking(move || activity::shuffle(&outputs))
            .await
            .map_err(|e| MrError::transient("Shuffler", e.to_string()))?;
        Ok(ActivityOutput::Shuffled(grouped))
    }

    fn do_reduce(&self, entry: &GroupedEntry) -> ActivityOutput {
        ActivityOutput::Reduced(activity::reduce(entry))
    }
}

#[async_trait]
impl ActivityWorker for Worker {
    async fn execute(&self, activity: Activity) -> Result<ActivityOutput> {
        debug!("worker got activity {}", activity.name());
        match activity {
            Activity::ResolveInput { container, blobs } => self.do_resolve(container, blobs).await,
            Activity::Map(record) => Ok(self.do_map(&record)),
            Activity::Shuffle(outputs) => self.do_shuffle(outputs).await,
            Activity::Reduce(entry) => Ok(self.do_reduce(&entry)),
        }
    }
}
