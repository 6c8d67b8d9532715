use std::sync::Arc;

use tracing::debug;

use crate::error::{MrError, Result};
use crate::store::{ObjectStore, StoreError};
use crate::types::InputRecord;

const ACTIVITY: &str = "GetInputData";

/// Turns a container reference into the ordered input records of a run.
pub struct InputResolver {
    store: Arc<dyn ObjectStore>,
    default_container: String,
}

impl InputResolver {
    pub fn new(store: Arc<dyn ObjectStore>, default_container: impl Into<String>) -> Self {
        InputResolver {
            store,
            default_container: default_container.into(),
        }
    }

    pub fn default_container(&self) -> &str {
        &self.default_container
    }

    /// Reads every named object (or every object in the container when no
    /// names are given) and numbers their lines from zero. Any object that
    /// cannot be read fails the whole resolution.
    pub async fn resolve(
        &self,
        container: Option<&str>,
        blobs: Option<&[String]>,
    ) -> Result<Vec<InputRecord>> {
        let container = container
            .filter(|c| !c.is_empty())
            .unwrap_or(self.default_container.as_str());

        let names = match blobs {
            Some(names) if !names.is_empty() => names.to_vec(),
            _ => self.store.list(container).await.map_err(store_error)?,
        };
        debug!("resolving {} objects from container {}", names.len(), container);

        let mut records = vec![];
        let mut offset = 0u64;
        for name in names {
            let bytes = self.store.get(container, &name).await.map_err(store_error)?;
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines() {
                records.push(InputRecord::new(offset, line));
                offset += 1;
            }
        }
        Ok(records)
    }
}

fn store_error(e: StoreError) -> MrError {
    if e.is_transient() {
        MrError::transient(ACTIVITY, e.to_string())
    } else {
        MrError::fatal(ACTIVITY, e.to_string())
    }
}
