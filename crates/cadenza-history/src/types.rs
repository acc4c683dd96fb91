// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared value types: identities, task lists, payloads and status enums.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Event id used for "no event".
pub const EMPTY_EVENT_ID: i64 = 0;
/// Id of the first event of every run.
pub const FIRST_EVENT_ID: i64 = 1;
/// Placeholder id carried by buffered events until they are flushed.
pub const BUFFERED_EVENT_ID: i64 = -123;
/// Version used when no failover version applies.
pub const EMPTY_VERSION: i64 = -24;

/// Identity of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct WorkflowKey {
    /// Owning domain.
    pub domain_id: String,
    /// Workflow id (reusable across runs).
    pub workflow_id: String,
    /// Run id (unique).
    pub run_id: String,
}

impl WorkflowKey {
    /// Build a key.
    pub fn new(
        domain_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// The `(workflow_id, run_id)` pair.
    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain_id, self.workflow_id, self.run_id)
    }
}

/// `(workflow_id, run_id)` as seen by callers. An empty run id addresses
/// the current run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Workflow id.
    pub workflow_id: String,
    /// Run id, possibly empty.
    pub run_id: String,
}

impl WorkflowExecution {
    /// Build an execution reference.
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Kind of task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskListKind {
    /// Shared by all workers of a task list.
    #[default]
    Normal,
    /// Bound to the worker that processed the previous decision.
    Sticky,
}

/// A named task list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskList {
    /// Task list name.
    pub name: String,
    /// Normal or sticky.
    pub kind: TaskListKind,
}

impl TaskList {
    /// A normal task list.
    pub fn normal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskListKind::Normal,
        }
    }
}

/// Opaque caller bytes, base64 encoded when serialized.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// Payload from UTF-8 text.
    pub fn from_text(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }

    /// Borrow the bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::from_text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.len() <= 64 => write!(f, "Payload({:?})", text),
            _ => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

/// Encoding of a [`DataBlob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8 JSON.
    #[default]
    Json,
}

/// Serialized bytes tagged with their encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataBlob {
    /// How `data` is encoded.
    pub encoding: Encoding,
    /// Encoded bytes.
    pub data: Payload,
}

impl DataBlob {
    /// Encode `value` as JSON.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            encoding: Encoding::Json,
            data: Payload(serde_json::to_vec(value)?),
        })
    }

    /// Decode JSON bytes into `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self.encoding {
            Encoding::Json => serde_json::from_slice(&self.data.0),
        }
    }

    /// Whether the blob holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.0.is_empty()
    }
}

/// Free-form fields attached to a workflow.
pub type Memo = BTreeMap<String, Payload>;

/// Indexed fields attached to a workflow, JSON encoded per value.
pub type SearchAttributes = BTreeMap<String, Payload>;

/// Exponential backoff retry policy for activities.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First retry delay.
    pub initial_interval_seconds: i32,
    /// Multiplier applied per attempt; values below 1 are treated as 1.
    pub backoff_coefficient: f64,
    /// Upper bound for one delay; 0 means unbounded.
    pub maximum_interval_seconds: i32,
    /// Attempt cap; 0 means unlimited.
    pub maximum_attempts: i32,
    /// Failure reasons that are never retried.
    pub non_retriable_error_reasons: Vec<String>,
    /// Total time budget since first schedule; 0 means unbounded.
    pub expiration_interval_seconds: i32,
}

/// Coarse lifecycle of a run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Created but not yet persisted as started.
    #[default]
    Created,
    /// Running.
    Running,
    /// Closed, see [`CloseStatus`].
    Completed,
    /// Replicated run that lost a conflict; kept for its history only.
    Zombie,
}

/// How a closed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CloseStatus {
    /// Still open.
    #[default]
    None,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Canceled on request.
    Canceled,
    /// Terminated by an operator or by a conflict.
    Terminated,
    /// Closed and succeeded by a new run.
    ContinuedAsNew,
    /// Exceeded its execution timeout.
    TimedOut,
}

impl CloseStatus {
    /// Whether a subsequent run may start under
    /// [`WorkflowIdReusePolicy::AllowDuplicateFailedOnly`].
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            CloseStatus::Failed | CloseStatus::Canceled | CloseStatus::Terminated | CloseStatus::TimedOut
        )
    }
}

/// Policy for starting a run when the workflow id was used before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkflowIdReusePolicy {
    /// Allow only if the previous run did not complete successfully.
    #[default]
    AllowDuplicateFailedOnly,
    /// Allow whenever no run is open.
    AllowDuplicate,
    /// Never reuse.
    RejectDuplicate,
    /// Terminate an open run, then start.
    TerminateIfRunning,
}

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    /// Start to close.
    StartToClose,
    /// Schedule to start.
    ScheduleToStart,
    /// Schedule to close.
    ScheduleToClose,
    /// Heartbeat.
    Heartbeat,
}

/// Why a decision task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
    /// New events arrived while a close decision was being made.
    UnhandledDecision,
    /// Bad schedule-activity attributes.
    BadScheduleActivityAttributes,
    /// Bad request-cancel-activity attributes.
    BadRequestCancelActivityAttributes,
    /// Bad start-timer attributes.
    BadStartTimerAttributes,
    /// Bad cancel-timer attributes.
    BadCancelTimerAttributes,
    /// Bad record-marker attributes.
    BadRecordMarkerAttributes,
    /// Bad complete-workflow attributes.
    BadCompleteWorkflowExecutionAttributes,
    /// Bad fail-workflow attributes.
    BadFailWorkflowExecutionAttributes,
    /// Bad cancel-workflow attributes.
    BadCancelWorkflowExecutionAttributes,
    /// Bad continue-as-new attributes.
    BadContinueAsNewAttributes,
    /// Bad start-child attributes.
    BadStartChildExecutionAttributes,
    /// Bad signal-external attributes.
    BadSignalWorkflowExecutionAttributes,
    /// Bad upsert-search-attributes attributes.
    BadSearchAttributes,
    /// Worker reported a failure.
    WorkflowWorkerUnhandledFailure,
    /// History was reset at this decision.
    ResetWorkflow,
    /// The sticky worker could not be reached.
    ResetStickyTaskList,
}

/// Identity of a parent run, recorded on child runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParentExecutionInfo {
    /// Parent domain.
    pub domain_id: String,
    /// Parent run.
    pub execution: WorkflowExecution,
    /// Initiated event id in the parent.
    pub initiated_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_as_base64() {
        let payload = Payload::from_text("hello");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, "\"aGVsbG8=\"");
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_payload_rejects_invalid_base64() {
        let result: Result<Payload, _> = serde_json::from_str("\"***\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_data_blob_decode_failure() {
        let blob = DataBlob {
            encoding: Encoding::Json,
            data: Payload(b"{not json".to_vec()),
        };
        let decoded: Result<Memo, _> = blob.decode();
        assert!(decoded.is_err());
    }

    #[test]
    fn test_close_status_failure_classes() {
        assert!(CloseStatus::Failed.is_failure());
        assert!(CloseStatus::Terminated.is_failure());
        assert!(!CloseStatus::Completed.is_failure());
        assert!(!CloseStatus::ContinuedAsNew.is_failure());
    }

    #[test]
    fn test_workflow_key_display() {
        let key = WorkflowKey::new("dom", "wf", "run");
        assert_eq!(key.to_string(), "dom/wf/run");
        assert_eq!(key.execution(), WorkflowExecution::new("wf", "run"));
    }
}
