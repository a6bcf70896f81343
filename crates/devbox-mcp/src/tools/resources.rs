//! In-memory resource bookkeeping for jobs.

use super::{parse_params, ToolOutput, ToolRegistry, ToolSpec};
use crate::error::ToolError;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const TOOL: &str = "manage_resources";

/// Resources held by a job. Units are the caller's (cores, MiB, GiB by convention).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceSpec {
    /// CPU cores.
    #[serde(default)]
    pub cpu: f64,
    /// Memory in MiB.
    #[serde(default)]
    pub memory: u64,
    /// Disk in GiB.
    #[serde(default)]
    pub disk: u64,
}

/// One job's allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub job_id: String,
    pub resources: ResourceSpec,
    pub allocated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operation requested through `manage_resources`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceOperation {
    Allocate,
    Deallocate,
    Update,
    Status,
}

/// Parameters for `manage_resources`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ManageResourcesParams {
    /// Job the resources belong to. Optional for `status`.
    #[serde(default)]
    pub job_id: Option<String>,

    /// What to do.
    pub operation: ResourceOperation,

    /// Resources for `allocate` and `update`.
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
}

/// Job allocations keyed by job id.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Allocation>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new allocation. Fails if the job already holds one.
    pub fn allocate(&self, job_id: &str, resources: ResourceSpec) -> Result<Allocation, ToolError> {
        let mut allocations = self.lock();
        if allocations.contains_key(job_id) {
            return Err(ToolError::Execution(format!(
                "job {job_id} already has an allocation"
            )));
        }
        let now = Utc::now();
        let allocation = Allocation {
            job_id: job_id.to_string(),
            resources,
            allocated_at: now,
            updated_at: now,
        };
        allocations.insert(job_id.to_string(), allocation.clone());
        tracing::info!(job_id, cpu = resources.cpu, memory = resources.memory, disk = resources.disk, "Resources allocated");
        Ok(allocation)
    }

    /// Release a job's allocation.
    pub fn deallocate(&self, job_id: &str) -> Result<Allocation, ToolError> {
        let released = self
            .lock()
            .remove(job_id)
            .ok_or_else(|| ToolError::Execution(format!("job {job_id} has no allocation")))?;
        tracing::info!(job_id, "Resources released");
        Ok(released)
    }

    /// Replace a job's resources.
    pub fn update(&self, job_id: &str, resources: ResourceSpec) -> Result<Allocation, ToolError> {
        let mut allocations = self.lock();
        let allocation = allocations
            .get_mut(job_id)
            .ok_or_else(|| ToolError::Execution(format!("job {job_id} has no allocation")))?;
        allocation.resources = resources;
        allocation.updated_at = Utc::now();
        Ok(allocation.clone())
    }

    pub fn get(&self, job_id: &str) -> Option<Allocation> {
        self.lock().get(job_id).cloned()
    }

    /// All allocations, ordered by job id.
    pub fn all(&self) -> Vec<Allocation> {
        let mut all: Vec<Allocation> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        all
    }

    /// Sum over every allocation.
    pub fn totals(&self) -> ResourceSpec {
        self.lock()
            .values()
            .fold(ResourceSpec::default(), |acc, a| ResourceSpec {
                cpu: acc.cpu + a.resources.cpu,
                memory: acc.memory + a.resources.memory,
                disk: acc.disk + a.resources.disk,
            })
    }

    pub async fn manage(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let params: ManageResourcesParams = parse_params(TOOL, params)?;
        let job_id = params.job_id.filter(|id| !id.trim().is_empty());
        let require_job = || {
            job_id
                .clone()
                .ok_or_else(|| ToolError::invalid(TOOL, "job_id is required"))
        };
        let require_resources = || {
            params
                .resources
                .ok_or_else(|| ToolError::invalid(TOOL, "resources are required"))
        };

        match params.operation {
            ResourceOperation::Allocate => {
                let allocation = self.allocate(&require_job()?, require_resources()?)?;
                Ok(ToolOutput::Json(json!({"success": true, "allocation": allocation})))
            }
            ResourceOperation::Deallocate => {
                let released = self.deallocate(&require_job()?)?;
                Ok(ToolOutput::Json(json!({"success": true, "released": released})))
            }
            ResourceOperation::Update => {
                let allocation = self.update(&require_job()?, require_resources()?)?;
                Ok(ToolOutput::Json(json!({"success": true, "allocation": allocation})))
            }
            ResourceOperation::Status => match job_id {
                Some(job_id) => {
                    let allocation = self.get(&job_id);
                    Ok(ToolOutput::Json(json!({
                        "job_id": job_id,
                        "allocated": allocation.is_some(),
                        "allocation": allocation,
                    })))
                }
                None => Ok(ToolOutput::Json(json!({
                    "allocations": self.all(),
                    "totals": self.totals(),
                }))),
            },
        }
    }
}

pub(crate) fn specs() -> Vec<ToolSpec> {
    vec![ToolSpec::new::<ManageResourcesParams>(
        TOOL,
        "Allocate, update, release or inspect resources held by a job.",
    )]
}

pub(crate) fn register(registry: &mut ToolRegistry, ledger: Arc<ResourceLedger>) {
    for spec in specs() {
        let ledger = Arc::clone(&ledger);
        registry.register_fn(spec, move |params| {
            let ledger = Arc::clone(&ledger);
            async move { ledger.manage(params).await }
        });
    }
}
