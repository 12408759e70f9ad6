// Task and host catalog
// Read-only view of configured tasks, steps, schedules and hosts

use crate::errors::CatalogError;
use crate::models::{Host, Task};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, instrument};

/// Source of resolved configuration entities
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn get_task(&self, task_id: i64) -> Result<Task, CatalogError>;

    /// Active tasks with their steps in execution order
    async fn get_active_tasks(&self) -> Result<Vec<Task>, CatalogError>;

    async fn get_host(&self, host_id: i64) -> Result<Host, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Catalog held in memory, typically loaded from a JSON document
///
/// ```json
/// {
///   "hosts": [{"id": 1, "name": "in", "type": "local_directory", "directory": "/data/in"}],
///   "tasks": [{"id": 1, "name": "copy", "steps": [...], "schedules": [...]}]
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    hosts: HashMap<i64, Host>,
    tasks: BTreeMap<i64, Task>,
}

impl InMemoryCatalog {
    /// Build a catalog, normalising step order and owner ids
    pub fn new(hosts: Vec<Host>, tasks: Vec<Task>) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();

        for host in hosts {
            let id = host.id;
            if catalog.hosts.insert(id, host).is_some() {
                return Err(CatalogError::Parse(format!("Duplicate host id {}", id)));
            }
        }

        for mut task in tasks {
            for step in &mut task.steps {
                step.task_id = task.id;
            }
            for schedule in &mut task.schedules {
                schedule.task_id = task.id;
            }
            task.sort_steps();

            let id = task.id;
            if catalog.tasks.insert(id, task).is_some() {
                return Err(CatalogError::Parse(format!("Duplicate task id {}", id)));
            }
        }

        Ok(catalog)
    }

    pub fn from_json(document: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument =
            serde_json::from_str(document).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(document.hosts, document.tasks)
    }

    /// Load a catalog file
    #[instrument]
    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CatalogError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let catalog = Self::from_json(&content)?;
        info!(
            hosts = catalog.hosts.len(),
            tasks = catalog.tasks.len(),
            "Loaded catalog"
        );
        Ok(catalog)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalog {
    async fn get_task(&self, task_id: i64) -> Result<Task, CatalogError> {
        self.tasks
            .get(&task_id)
            .cloned()
            .ok_or(CatalogError::TaskNotFound(task_id))
    }

    async fn get_active_tasks(&self) -> Result<Vec<Task>, CatalogError> {
        Ok(self.tasks.values().filter(|t| t.active).cloned().collect())
    }

    async fn get_host(&self, host_id: i64) -> Result<Host, CatalogError> {
        self.hosts
            .get(&host_id)
            .cloned()
            .ok_or(CatalogError::HostNotFound(host_id))
    }
}
