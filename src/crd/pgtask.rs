use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pgtask is a one-shot unit of work against a cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgtask",
    plural = "pgtasks",
    namespaced,
    status = "PgtaskStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.tasktype"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
pub struct PgtaskSpec {
    #[serde(default)]
    pub namespace: String,

    pub name: String,

    #[serde(rename = "tasktype")]
    pub task_type: TaskType,

    #[serde(default)]
    pub status: String,

    /// Free-form task arguments
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Kind of work a Pgtask requests
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum TaskType {
    #[serde(rename = "clone")]
    Clone,
    #[serde(rename = "delete-data")]
    Rmdata,
    #[serde(rename = "backrest")]
    Backup,
    #[serde(rename = "backrestrestore")]
    Restore,
    #[serde(rename = "failover")]
    Failover,
    #[serde(rename = "autofailover")]
    AutoFailover,
    #[serde(rename = "pgdump")]
    PgDump,
    #[serde(rename = "pgrestore")]
    PgRestore,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PgtaskStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,

    #[serde(default)]
    pub message: String,
}

/// Task state; states written by other tools deserialize as `Unknown`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum TaskState {
    #[serde(rename = "pgtask Created")]
    Created,
    #[serde(rename = "pgtask Processed")]
    Processed,
    #[serde(rename = "pgtask Completed")]
    Completed,
    #[serde(other)]
    Unknown,
}

impl PgtaskStatus {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            state: Some(TaskState::Completed),
            message: message.into(),
        }
    }

    /// The task was picked up but could not be carried out
    pub fn processed(message: impl Into<String>) -> Self {
        Self {
            state: Some(TaskState::Processed),
            message: message.into(),
        }
    }
}

impl Pgtask {
    pub fn state(&self) -> Option<TaskState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    /// Whether the task has already been handled
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state(),
            Some(TaskState::Processed | TaskState::Completed)
        )
    }
}
