// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Visibility manager.
//!
//! A thin translation layer between the public visibility records and the
//! shape kept by a [`VisibilityStore`]. Writes serialize the memo before it
//! reaches the store; reads decode memo and search attributes back. Failures
//! on those optional fields are logged and the field is dropped, so one bad
//! value never fails a listing.

pub mod memory;

pub use self::memory::InMemoryVisibilityStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::state::ExecutionInfo;
use crate::types::{CloseStatus, DataBlob, Memo, SearchAttributes, WorkflowExecution};

/// Result type for visibility operations.
pub type Result<T> = std::result::Result<T, VisibilityError>;

/// Errors returned by visibility stores and the manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VisibilityError {
    /// No closed record exists for the requested run.
    #[error("visibility record for workflow '{workflow_id}' (run '{run_id}') not found")]
    NotFound {
        /// Workflow id.
        workflow_id: String,
        /// Run id.
        run_id: String,
    },

    /// The request is malformed.
    #[error("bad visibility request: {0}")]
    BadRequest(String),

    /// The store cannot evaluate the query.
    #[error("unsupported visibility query '{0}'")]
    InvalidQuery(String),

    /// Backend failure.
    #[error("visibility store error during {operation}: {details}")]
    Store {
        /// Operation that failed.
        operation: &'static str,
        /// Backend message.
        details: String,
    },
}

// ============================================================================
// Public records
// ============================================================================

/// Public projection of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowExecutionInfo {
    /// Domain of the run.
    pub domain_id: String,
    /// The run.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub type_name: String,
    /// When the run was created.
    pub start_time: DateTime<Utc>,
    /// When the run became eligible to execute; never the zero timestamp.
    pub execution_time: DateTime<Utc>,
    /// Close time, for closed runs.
    pub close_time: Option<DateTime<Utc>>,
    /// Close status, for closed runs.
    pub close_status: Option<CloseStatus>,
    /// Number of events in the history, for closed runs.
    pub history_length: i64,
    /// Task list of the run.
    pub task_list: String,
    /// Decoded memo; `None` when absent or undecodable.
    pub memo: Option<Memo>,
    /// Decoded search attributes; keys that fail to decode are omitted.
    pub search_attributes: Option<BTreeMap<String, serde_json::Value>>,
}

/// Fields shared by the started and upsert requests.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordWorkflowExecutionStartedRequest {
    /// Domain id.
    pub domain_id: String,
    /// Domain name.
    pub domain: String,
    /// The run.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub workflow_type_name: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// Execution time; the zero timestamp means "same as start".
    pub execution_time: DateTime<Utc>,
    /// Workflow execution timeout.
    pub workflow_timeout_seconds: i64,
    /// Id of the transfer task that produced this record.
    pub task_id: i64,
    /// Task list of the run.
    pub task_list: String,
    /// Memo attached at start.
    pub memo: Memo,
    /// Search attributes, JSON encoded per value.
    pub search_attributes: SearchAttributes,
}

impl RecordWorkflowExecutionStartedRequest {
    /// Build a record from a run's mutable state.
    pub fn from_execution_info(domain: &str, info: &ExecutionInfo, task_id: i64) -> Self {
        Self {
            domain_id: info.domain_id.clone(),
            domain: domain.to_string(),
            execution: WorkflowExecution::new(&info.workflow_id, &info.run_id),
            workflow_type_name: info.workflow_type.clone(),
            start_time: info.start_time,
            execution_time: info.execution_time,
            workflow_timeout_seconds: i64::from(info.workflow_timeout_seconds),
            task_id,
            task_list: info.task_list.clone(),
            memo: info.memo.clone(),
            search_attributes: info.search_attributes.clone(),
        }
    }
}

/// Upsert carries the same fields as a start record.
pub type UpsertWorkflowExecutionRequest = RecordWorkflowExecutionStartedRequest;

/// Record written once a run closes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordWorkflowExecutionClosedRequest {
    /// Fields known since start.
    pub started: RecordWorkflowExecutionStartedRequest,
    /// Close time.
    pub close_time: DateTime<Utc>,
    /// How the run ended.
    pub status: CloseStatus,
    /// Number of events in the history.
    pub history_length: i64,
    /// Retention of the closed record.
    pub retention_seconds: i64,
}

impl RecordWorkflowExecutionClosedRequest {
    /// Build a close record from a closed run's mutable state.
    pub fn from_execution_info(domain: &str, info: &ExecutionInfo, task_id: i64) -> Self {
        Self {
            started: RecordWorkflowExecutionStartedRequest::from_execution_info(domain, info, task_id),
            close_time: info.close_time.unwrap_or(info.last_updated),
            status: info.close_status,
            history_length: info.next_event_id - 1,
            retention_seconds: info.retention_seconds,
        }
    }
}

/// Time-bounded, paged listing inside one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct ListWorkflowExecutionsRequest {
    /// Domain id.
    pub domain_id: String,
    /// Domain name.
    pub domain: String,
    /// Inclusive lower bound (start time for open runs, close time for closed).
    pub earliest_time: DateTime<Utc>,
    /// Inclusive upper bound.
    pub latest_time: DateTime<Utc>,
    /// Page size; 0 means unbounded.
    pub page_size: usize,
    /// Token from a previous page.
    pub next_page_token: Option<Vec<u8>>,
}

/// Listing filtered by workflow type.
#[derive(Debug, Clone, PartialEq)]
pub struct ListWorkflowExecutionsByTypeRequest {
    /// Bounds and paging.
    pub list: ListWorkflowExecutionsRequest,
    /// Workflow type name.
    pub workflow_type_name: String,
}

/// Listing filtered by workflow id.
#[derive(Debug, Clone, PartialEq)]
pub struct ListWorkflowExecutionsByWorkflowIdRequest {
    /// Bounds and paging.
    pub list: ListWorkflowExecutionsRequest,
    /// Workflow id.
    pub workflow_id: String,
}

/// Closed listing filtered by close status.
#[derive(Debug, Clone, PartialEq)]
pub struct ListClosedWorkflowExecutionsByStatusRequest {
    /// Bounds and paging.
    pub list: ListWorkflowExecutionsRequest,
    /// Close status.
    pub status: CloseStatus,
}

/// Lookup of one closed run.
#[derive(Debug, Clone, PartialEq)]
pub struct GetClosedWorkflowExecutionRequest {
    /// Domain id.
    pub domain_id: String,
    /// Domain name.
    pub domain: String,
    /// The run.
    pub execution: WorkflowExecution,
}

/// Removal of one run's record.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteWorkflowExecutionRequest {
    /// Domain id.
    pub domain_id: String,
    /// Run id.
    pub run_id: String,
    /// Id of the task that requested the delete.
    pub task_id: i64,
}

/// Query-based listing, scanning and counting.
#[derive(Debug, Clone, PartialEq)]
pub struct ListWorkflowExecutionsByQueryRequest {
    /// Domain id.
    pub domain_id: String,
    /// Domain name.
    pub domain: String,
    /// Store-specific query; empty matches every record of the domain.
    pub query: String,
    /// Page size; 0 means unbounded.
    pub page_size: usize,
    /// Token from a previous page.
    pub next_page_token: Option<Vec<u8>>,
}

/// Counting request.
#[derive(Debug, Clone, PartialEq)]
pub struct CountWorkflowExecutionsRequest {
    /// Domain id.
    pub domain_id: String,
    /// Domain name.
    pub domain: String,
    /// Store-specific query; empty matches every record of the domain.
    pub query: String,
}

/// One page of public records.
#[derive(Debug, Clone, PartialEq)]
pub struct ListWorkflowExecutionsResponse {
    /// Records on this page.
    pub executions: Vec<WorkflowExecutionInfo>,
    /// Token for the next page; `None` on the last page.
    pub next_page_token: Option<Vec<u8>>,
}

/// A closed record.
#[derive(Debug, Clone, PartialEq)]
pub struct GetClosedWorkflowExecutionResponse {
    /// The record.
    pub execution: WorkflowExecutionInfo,
}

/// Count result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountWorkflowExecutionsResponse {
    /// Number of matching records.
    pub count: i64,
}

// ============================================================================
// Store shape
// ============================================================================

/// The read-optimised projection kept by a [`VisibilityStore`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VisibilityWorkflowExecutionInfo {
    /// Domain id.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Workflow type name.
    pub type_name: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// Execution time as written; may be the zero timestamp.
    pub execution_time: DateTime<Utc>,
    /// Workflow execution timeout.
    pub workflow_timeout_seconds: i64,
    /// Id of the transfer task that last wrote the record.
    pub task_id: i64,
    /// Task list.
    pub task_list: String,
    /// Serialized memo.
    pub memo: DataBlob,
    /// Search attributes as written, JSON per value.
    pub search_attributes: SearchAttributes,
    /// Close status; `None` while open.
    pub status: Option<CloseStatus>,
    /// Close time.
    pub close_time: Option<DateTime<Utc>>,
    /// History length at close.
    pub history_length: i64,
    /// Retention of a closed record.
    pub retention_seconds: i64,
}

/// One page of store records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VisibilityPage {
    /// Records on this page.
    pub executions: Vec<VisibilityWorkflowExecutionInfo>,
    /// Token for the next page.
    pub next_page_token: Option<Vec<u8>>,
}

/// Search-optimised store of run projections.
#[async_trait]
pub trait VisibilityStore: Send + Sync {
    /// Insert the record of a started run.
    async fn record_workflow_execution_started(&self, record: VisibilityWorkflowExecutionInfo) -> Result<()>;

    /// Replace the record of a run with its closed form.
    async fn record_workflow_execution_closed(&self, record: VisibilityWorkflowExecutionInfo) -> Result<()>;

    /// Overwrite the open record of a run.
    async fn upsert_workflow_execution(&self, record: VisibilityWorkflowExecutionInfo) -> Result<()>;

    /// Open runs started inside the bounds.
    async fn list_open_workflow_executions(&self, request: &ListWorkflowExecutionsRequest) -> Result<VisibilityPage>;

    /// Closed runs closed inside the bounds.
    async fn list_closed_workflow_executions(
        &self,
        request: &ListWorkflowExecutionsRequest,
    ) -> Result<VisibilityPage>;

    /// Open runs of one workflow type.
    async fn list_open_workflow_executions_by_type(
        &self,
        request: &ListWorkflowExecutionsByTypeRequest,
    ) -> Result<VisibilityPage>;

    /// Closed runs of one workflow type.
    async fn list_closed_workflow_executions_by_type(
        &self,
        request: &ListWorkflowExecutionsByTypeRequest,
    ) -> Result<VisibilityPage>;

    /// Open runs of one workflow id.
    async fn list_open_workflow_executions_by_workflow_id(
        &self,
        request: &ListWorkflowExecutionsByWorkflowIdRequest,
    ) -> Result<VisibilityPage>;

    /// Closed runs of one workflow id.
    async fn list_closed_workflow_executions_by_workflow_id(
        &self,
        request: &ListWorkflowExecutionsByWorkflowIdRequest,
    ) -> Result<VisibilityPage>;

    /// Closed runs with one close status.
    async fn list_closed_workflow_executions_by_status(
        &self,
        request: &ListClosedWorkflowExecutionsByStatusRequest,
    ) -> Result<VisibilityPage>;

    /// The closed record of one run.
    async fn get_closed_workflow_execution(
        &self,
        request: &GetClosedWorkflowExecutionRequest,
    ) -> Result<VisibilityWorkflowExecutionInfo>;

    /// Remove the record of one run. Missing records are not an error.
    async fn delete_workflow_execution(&self, request: &DeleteWorkflowExecutionRequest) -> Result<()>;

    /// Records matching a query, newest first.
    async fn list_workflow_executions(&self, request: &ListWorkflowExecutionsByQueryRequest) -> Result<VisibilityPage>;

    /// Records matching a query, in no particular order.
    async fn scan_workflow_executions(&self, request: &ListWorkflowExecutionsByQueryRequest) -> Result<VisibilityPage>;

    /// Number of records matching a query.
    async fn count_workflow_executions(
        &self,
        request: &CountWorkflowExecutionsRequest,
    ) -> Result<CountWorkflowExecutionsResponse>;
}

// ============================================================================
// Manager
// ============================================================================

/// Converts between public records and the store shape.
#[derive(Clone)]
pub struct VisibilityManager {
    store: Arc<dyn VisibilityStore>,
}

impl VisibilityManager {
    /// Wrap a store.
    pub fn new(store: Arc<dyn VisibilityStore>) -> Self {
        Self { store }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<dyn VisibilityStore> {
        &self.store
    }

    /// Record a started run.
    #[instrument(skip(self, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub async fn record_workflow_execution_started(
        &self,
        request: RecordWorkflowExecutionStartedRequest,
    ) -> Result<()> {
        let record = to_store_record(request);
        self.store.record_workflow_execution_started(record).await
    }

    /// Record a closed run, replacing its open record.
    #[instrument(skip(self, request), fields(
        workflow_id = %request.started.execution.workflow_id,
        run_id = %request.started.execution.run_id,
        status = ?request.status,
    ))]
    pub async fn record_workflow_execution_closed(
        &self,
        request: RecordWorkflowExecutionClosedRequest,
    ) -> Result<()> {
        let mut record = to_store_record(request.started);
        record.status = Some(request.status);
        record.close_time = Some(request.close_time);
        record.history_length = request.history_length;
        record.retention_seconds = request.retention_seconds;
        self.store.record_workflow_execution_closed(record).await
    }

    /// Overwrite the open record of a run.
    #[instrument(skip(self, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub async fn upsert_workflow_execution(&self, request: UpsertWorkflowExecutionRequest) -> Result<()> {
        let record = to_store_record(request);
        self.store.upsert_workflow_execution(record).await
    }

    /// Open runs started inside the bounds.
    pub async fn list_open_workflow_executions(
        &self,
        request: &ListWorkflowExecutionsRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_open_workflow_executions(request).await?;
        Ok(to_response(page))
    }

    /// Closed runs closed inside the bounds.
    pub async fn list_closed_workflow_executions(
        &self,
        request: &ListWorkflowExecutionsRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_closed_workflow_executions(request).await?;
        Ok(to_response(page))
    }

    /// Open runs of one workflow type.
    pub async fn list_open_workflow_executions_by_type(
        &self,
        request: &ListWorkflowExecutionsByTypeRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_open_workflow_executions_by_type(request).await?;
        Ok(to_response(page))
    }

    /// Closed runs of one workflow type.
    pub async fn list_closed_workflow_executions_by_type(
        &self,
        request: &ListWorkflowExecutionsByTypeRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_closed_workflow_executions_by_type(request).await?;
        Ok(to_response(page))
    }

    /// Open runs of one workflow id.
    pub async fn list_open_workflow_executions_by_workflow_id(
        &self,
        request: &ListWorkflowExecutionsByWorkflowIdRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_open_workflow_executions_by_workflow_id(request).await?;
        Ok(to_response(page))
    }

    /// Closed runs of one workflow id.
    pub async fn list_closed_workflow_executions_by_workflow_id(
        &self,
        request: &ListWorkflowExecutionsByWorkflowIdRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self
            .store
            .list_closed_workflow_executions_by_workflow_id(request)
            .await?;
        Ok(to_response(page))
    }

    /// Closed runs with one close status.
    pub async fn list_closed_workflow_executions_by_status(
        &self,
        request: &ListClosedWorkflowExecutionsByStatusRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_closed_workflow_executions_by_status(request).await?;
        Ok(to_response(page))
    }

    /// The closed record of one run.
    pub async fn get_closed_workflow_execution(
        &self,
        request: &GetClosedWorkflowExecutionRequest,
    ) -> Result<GetClosedWorkflowExecutionResponse> {
        let record = self.store.get_closed_workflow_execution(request).await?;
        Ok(GetClosedWorkflowExecutionResponse {
            execution: to_public_record(record),
        })
    }

    /// Remove the record of one run.
    pub async fn delete_workflow_execution(&self, request: &DeleteWorkflowExecutionRequest) -> Result<()> {
        self.store.delete_workflow_execution(request).await
    }

    /// Records matching a query.
    pub async fn list_workflow_executions(
        &self,
        request: &ListWorkflowExecutionsByQueryRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.list_workflow_executions(request).await?;
        Ok(to_response(page))
    }

    /// Records matching a query, unordered.
    pub async fn scan_workflow_executions(
        &self,
        request: &ListWorkflowExecutionsByQueryRequest,
    ) -> Result<ListWorkflowExecutionsResponse> {
        let page = self.store.scan_workflow_executions(request).await?;
        Ok(to_response(page))
    }

    /// Number of records matching a query.
    pub async fn count_workflow_executions(
        &self,
        request: &CountWorkflowExecutionsRequest,
    ) -> Result<CountWorkflowExecutionsResponse> {
        self.store.count_workflow_executions(request).await
    }
}

impl std::fmt::Debug for VisibilityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityManager").finish_non_exhaustive()
    }
}

fn to_store_record(request: RecordWorkflowExecutionStartedRequest) -> VisibilityWorkflowExecutionInfo {
    let memo = serialize_memo(&request.memo, &request.execution);
    VisibilityWorkflowExecutionInfo {
        domain_id: request.domain_id,
        workflow_id: request.execution.workflow_id,
        run_id: request.execution.run_id,
        type_name: request.workflow_type_name,
        start_time: request.start_time,
        execution_time: request.execution_time,
        workflow_timeout_seconds: request.workflow_timeout_seconds,
        task_id: request.task_id,
        task_list: request.task_list,
        memo,
        search_attributes: request.search_attributes,
        status: None,
        close_time: None,
        history_length: 0,
        retention_seconds: 0,
    }
}

fn serialize_memo(memo: &Memo, execution: &WorkflowExecution) -> DataBlob {
    if memo.is_empty() {
        return DataBlob::default();
    }
    match DataBlob::encode(memo) {
        Ok(blob) => blob,
        Err(e) => {
            error!(
                workflow_id = %execution.workflow_id,
                run_id = %execution.run_id,
                error = %e,
                "Unable to encode visibility memo"
            );
            DataBlob::default()
        }
    }
}

fn to_response(page: VisibilityPage) -> ListWorkflowExecutionsResponse {
    ListWorkflowExecutionsResponse {
        executions: page.executions.into_iter().map(to_public_record).collect(),
        next_page_token: page.next_page_token,
    }
}

fn is_zero_time(time: &DateTime<Utc>) -> bool {
    time.timestamp_nanos_opt() == Some(0)
}

/// Store record to public record.
fn to_public_record(record: VisibilityWorkflowExecutionInfo) -> WorkflowExecutionInfo {
    let execution_time = if is_zero_time(&record.execution_time) {
        record.start_time
    } else {
        record.execution_time
    };

    let memo = if record.memo.is_empty() {
        None
    } else {
        match record.memo.decode::<Memo>() {
            Ok(memo) => Some(memo),
            Err(e) => {
                error!(
                    workflow_id = %record.workflow_id,
                    run_id = %record.run_id,
                    error = %e,
                    "Unable to decode visibility memo"
                );
                None
            }
        }
    };

    let search_attributes = if record.search_attributes.is_empty() {
        None
    } else {
        let mut decoded = BTreeMap::new();
        for (name, value) in &record.search_attributes {
            match serde_json::from_slice::<serde_json::Value>(value.as_bytes()) {
                Ok(value) => {
                    decoded.insert(name.clone(), value);
                }
                Err(e) => error!(
                    workflow_id = %record.workflow_id,
                    run_id = %record.run_id,
                    search_attribute = %name,
                    error = %e,
                    "Unable to decode search attribute"
                ),
            }
        }
        Some(decoded)
    };

    // Close fields only mean something once a status is recorded.
    let (close_time, close_status, history_length) = match record.status {
        Some(status) => (record.close_time, Some(status), record.history_length),
        None => (None, None, 0),
    };

    WorkflowExecutionInfo {
        domain_id: record.domain_id,
        execution: WorkflowExecution::new(record.workflow_id, record.run_id),
        type_name: record.type_name,
        start_time: record.start_time,
        execution_time,
        close_time,
        close_status,
        history_length,
        task_list: record.task_list,
        memo,
        search_attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use chrono::TimeZone;

    fn manager() -> VisibilityManager {
        VisibilityManager::new(Arc::new(InMemoryVisibilityStore::new()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn started(workflow_id: &str, start: i64) -> RecordWorkflowExecutionStartedRequest {
        RecordWorkflowExecutionStartedRequest {
            domain_id: "domain".into(),
            domain: "orders".into(),
            execution: WorkflowExecution::new(workflow_id, format!("{}-run", workflow_id)),
            workflow_type_name: "checkout".into(),
            start_time: at(start),
            execution_time: at(start),
            task_list: "tl".into(),
            ..Default::default()
        }
    }

    fn window() -> ListWorkflowExecutionsRequest {
        ListWorkflowExecutionsRequest {
            domain_id: "domain".into(),
            domain: "orders".into(),
            earliest_time: at(0),
            latest_time: at(10_000),
            page_size: 0,
            next_page_token: None,
        }
    }

    #[tokio::test]
    async fn test_zero_execution_time_reports_start_time() {
        let manager = manager();
        let mut request = started("wf", 100);
        request.execution_time = at(0);
        manager.record_workflow_execution_started(request).await.unwrap();

        let response = manager.list_open_workflow_executions(&window()).await.unwrap();
        assert_eq!(response.executions.len(), 1);
        assert_eq!(response.executions[0].execution_time, at(100));
    }

    #[tokio::test]
    async fn test_delayed_execution_time_is_kept() {
        let manager = manager();
        let mut request = started("wf", 100);
        request.execution_time = at(160);
        manager.record_workflow_execution_started(request).await.unwrap();

        let response = manager.list_open_workflow_executions(&window()).await.unwrap();
        assert_eq!(response.executions[0].execution_time, at(160));
    }

    #[tokio::test]
    async fn test_undecodable_search_attribute_is_omitted() {
        let manager = manager();
        let mut request = started("wf", 100);
        request
            .search_attributes
            .insert("CustomerId".into(), Payload::from_text("\"c-42\""));
        request
            .search_attributes
            .insert("Broken".into(), Payload(vec![0xff, 0xfe, b'{']));
        manager.record_workflow_execution_started(request).await.unwrap();

        let response = manager.list_open_workflow_executions(&window()).await.unwrap();
        assert_eq!(response.executions.len(), 1);
        let attributes = response.executions[0].search_attributes.as_ref().unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes["CustomerId"], serde_json::json!("c-42"));
    }

    #[tokio::test]
    async fn test_memo_round_trips_through_store() {
        let manager = manager();
        let mut request = started("wf", 100);
        request.memo.insert("note".into(), Payload::from_text("hello"));
        manager.record_workflow_execution_started(request).await.unwrap();

        let response = manager.list_open_workflow_executions(&window()).await.unwrap();
        let memo = response.executions[0].memo.as_ref().unwrap();
        assert_eq!(memo["note"], Payload::from_text("hello"));
    }

    #[tokio::test]
    async fn test_undecodable_memo_is_omitted() {
        let store = Arc::new(InMemoryVisibilityStore::new());
        let manager = VisibilityManager::new(store.clone());
        let mut record = to_store_record(started("wf", 100));
        record.memo = DataBlob {
            data: Payload::from_text("not json"),
            ..DataBlob::default()
        };
        store.record_workflow_execution_started(record).await.unwrap();

        let response = manager.list_open_workflow_executions(&window()).await.unwrap();
        assert_eq!(response.executions.len(), 1);
        assert!(response.executions[0].memo.is_none());
    }

    #[tokio::test]
    async fn test_open_record_has_no_close_fields() {
        let manager = manager();
        manager
            .record_workflow_execution_started(started("wf", 100))
            .await
            .unwrap();
        let response = manager.list_open_workflow_executions(&window()).await.unwrap();
        let record = &response.executions[0];
        assert!(record.close_time.is_none());
        assert!(record.close_status.is_none());
        assert_eq!(record.history_length, 0);
    }

    #[tokio::test]
    async fn test_closed_record_lookup() {
        let manager = manager();
        manager
            .record_workflow_execution_started(started("wf", 100))
            .await
            .unwrap();
        manager
            .record_workflow_execution_closed(RecordWorkflowExecutionClosedRequest {
                started: started("wf", 100),
                close_time: at(200),
                status: CloseStatus::Completed,
                history_length: 11,
                retention_seconds: 86_400,
            })
            .await
            .unwrap();

        let open = manager.list_open_workflow_executions(&window()).await.unwrap();
        assert!(open.executions.is_empty());

        let response = manager
            .get_closed_workflow_execution(&GetClosedWorkflowExecutionRequest {
                domain_id: "domain".into(),
                domain: "orders".into(),
                execution: WorkflowExecution::new("wf", "wf-run"),
            })
            .await
            .unwrap();
        assert_eq!(response.execution.close_status, Some(CloseStatus::Completed));
        assert_eq!(response.execution.close_time, Some(at(200)));
        assert_eq!(response.execution.history_length, 11);
    }

    #[test]
    fn test_close_request_from_execution_info() {
        let (mut ms, _) = crate::state::test_support::started_state_with_history("wf");
        ms.execution_info.close_status = CloseStatus::Failed;
        ms.execution_info.close_time = Some(at(500));
        let request = RecordWorkflowExecutionClosedRequest::from_execution_info("orders", &ms.execution_info, 7);
        assert_eq!(request.status, CloseStatus::Failed);
        assert_eq!(request.close_time, at(500));
        assert_eq!(request.history_length, ms.execution_info.next_event_id - 1);
        assert_eq!(request.started.workflow_type_name, "wf-type");
        assert_eq!(request.started.task_id, 7);
    }
}
