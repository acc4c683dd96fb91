// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory visibility store.
//!
//! Records are keyed by `(domain_id, run_id)`. Listings sort newest first
//! and page with an offset token. Only the empty query is understood.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CountWorkflowExecutionsRequest, CountWorkflowExecutionsResponse, DeleteWorkflowExecutionRequest,
    GetClosedWorkflowExecutionRequest, ListClosedWorkflowExecutionsByStatusRequest,
    ListWorkflowExecutionsByQueryRequest, ListWorkflowExecutionsByTypeRequest,
    ListWorkflowExecutionsByWorkflowIdRequest, ListWorkflowExecutionsRequest, Result, VisibilityError,
    VisibilityPage, VisibilityStore, VisibilityWorkflowExecutionInfo,
};

type RecordKey = (String, String);

/// Visibility store kept in a map, for tests and the default binary mode.
#[derive(Default)]
pub struct InMemoryVisibilityStore {
    records: Mutex<HashMap<RecordKey, VisibilityWorkflowExecutionInfo>>,
}

impl InMemoryVisibilityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, HashMap<RecordKey, VisibilityWorkflowExecutionInfo>>> {
        self.records.lock().map_err(|e| VisibilityError::Store {
            operation,
            details: e.to_string(),
        })
    }

    fn put(&self, operation: &'static str, record: VisibilityWorkflowExecutionInfo) -> Result<()> {
        if record.domain_id.is_empty() || record.run_id.is_empty() {
            return Err(VisibilityError::BadRequest(
                "domain_id and run_id are required".to_string(),
            ));
        }
        let key = (record.domain_id.clone(), record.run_id.clone());
        self.lock(operation)?.insert(key, record);
        Ok(())
    }

    fn open_page(
        &self,
        list: &ListWorkflowExecutionsRequest,
        filter: impl Fn(&VisibilityWorkflowExecutionInfo) -> bool,
    ) -> Result<VisibilityPage> {
        let records = self.lock("list_open")?;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.domain_id == list.domain_id && r.status.is_none())
            .filter(|r| in_bounds(r.start_time, list))
            .filter(|r| filter(*r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.run_id.cmp(&b.run_id)));
        paginate(matching, list.page_size, list.next_page_token.as_deref())
    }

    fn closed_page(
        &self,
        list: &ListWorkflowExecutionsRequest,
        filter: impl Fn(&VisibilityWorkflowExecutionInfo) -> bool,
    ) -> Result<VisibilityPage> {
        let records = self.lock("list_closed")?;
        let mut matching: Vec<_> = records
            .values()
            .filter(|r| r.domain_id == list.domain_id)
            .filter(|r| match (r.status, r.close_time) {
                (Some(_), Some(close_time)) => in_bounds(close_time, list),
                _ => false,
            })
            .filter(|r| filter(*r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.close_time.cmp(&a.close_time).then_with(|| a.run_id.cmp(&b.run_id)));
        paginate(matching, list.page_size, list.next_page_token.as_deref())
    }

    fn query_matches(&self, domain_id: &str, query: &str) -> Result<Vec<VisibilityWorkflowExecutionInfo>> {
        if !query.trim().is_empty() {
            return Err(VisibilityError::InvalidQuery(query.to_string()));
        }
        let records = self.lock("query")?;
        Ok(records
            .values()
            .filter(|r| r.domain_id == domain_id)
            .cloned()
            .collect())
    }
}

fn in_bounds(time: DateTime<Utc>, list: &ListWorkflowExecutionsRequest) -> bool {
    time >= list.earliest_time && time <= list.latest_time
}

fn decode_token(token: Option<&[u8]>) -> Result<usize> {
    match token {
        None => Ok(0),
        Some(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| VisibilityError::BadRequest("invalid next_page_token".to_string())),
    }
}

fn paginate(
    records: Vec<VisibilityWorkflowExecutionInfo>,
    page_size: usize,
    token: Option<&[u8]>,
) -> Result<VisibilityPage> {
    let offset = decode_token(token)?;
    let total = records.len();
    let take = if page_size == 0 { total } else { page_size };
    let executions: Vec<_> = records.into_iter().skip(offset).take(take).collect();
    let end = offset + executions.len();
    let next_page_token = (end < total).then(|| end.to_string().into_bytes());
    Ok(VisibilityPage {
        executions,
        next_page_token,
    })
}

#[async_trait]
impl VisibilityStore for InMemoryVisibilityStore {
    async fn record_workflow_execution_started(&self, record: VisibilityWorkflowExecutionInfo) -> Result<()> {
        self.put("record_started", record)
    }

    async fn record_workflow_execution_closed(&self, record: VisibilityWorkflowExecutionInfo) -> Result<()> {
        if record.status.is_none() {
            return Err(VisibilityError::BadRequest("closed record without status".to_string()));
        }
        self.put("record_closed", record)
    }

    async fn upsert_workflow_execution(&self, record: VisibilityWorkflowExecutionInfo) -> Result<()> {
        self.put("upsert", record)
    }

    async fn list_open_workflow_executions(&self, request: &ListWorkflowExecutionsRequest) -> Result<VisibilityPage> {
        self.open_page(request, |_| true)
    }

    async fn list_closed_workflow_executions(
        &self,
        request: &ListWorkflowExecutionsRequest,
    ) -> Result<VisibilityPage> {
        self.closed_page(request, |_| true)
    }

    async fn list_open_workflow_executions_by_type(
        &self,
        request: &ListWorkflowExecutionsByTypeRequest,
    ) -> Result<VisibilityPage> {
        self.open_page(&request.list, |r| r.type_name == request.workflow_type_name)
    }

    async fn list_closed_workflow_executions_by_type(
        &self,
        request: &ListWorkflowExecutionsByTypeRequest,
    ) -> Result<VisibilityPage> {
        self.closed_page(&request.list, |r| r.type_name == request.workflow_type_name)
    }

    async fn list_open_workflow_executions_by_workflow_id(
        &self,
        request: &ListWorkflowExecutionsByWorkflowIdRequest,
    ) -> Result<VisibilityPage> {
        self.open_page(&request.list, |r| r.workflow_id == request.workflow_id)
    }

    async fn list_closed_workflow_executions_by_workflow_id(
        &self,
        request: &ListWorkflowExecutionsByWorkflowIdRequest,
    ) -> Result<VisibilityPage> {
        self.closed_page(&request.list, |r| r.workflow_id == request.workflow_id)
    }

    async fn list_closed_workflow_executions_by_status(
        &self,
        request: &ListClosedWorkflowExecutionsByStatusRequest,
    ) -> Result<VisibilityPage> {
        self.closed_page(&request.list, |r| r.status == Some(request.status))
    }

    async fn get_closed_workflow_execution(
        &self,
        request: &GetClosedWorkflowExecutionRequest,
    ) -> Result<VisibilityWorkflowExecutionInfo> {
        let records = self.lock("get_closed")?;
        records
            .get(&(request.domain_id.clone(), request.execution.run_id.clone()))
            .filter(|r| r.status.is_some() && r.workflow_id == request.execution.workflow_id)
            .cloned()
            .ok_or_else(|| VisibilityError::NotFound {
                workflow_id: request.execution.workflow_id.clone(),
                run_id: request.execution.run_id.clone(),
            })
    }

    async fn delete_workflow_execution(&self, request: &DeleteWorkflowExecutionRequest) -> Result<()> {
        self.lock("delete")?
            .remove(&(request.domain_id.clone(), request.run_id.clone()));
        Ok(())
    }

    async fn list_workflow_executions(&self, request: &ListWorkflowExecutionsByQueryRequest) -> Result<VisibilityPage> {
        let mut matching = self.query_matches(&request.domain_id, &request.query)?;
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| a.run_id.cmp(&b.run_id)));
        paginate(matching, request.page_size, request.next_page_token.as_deref())
    }

    async fn scan_workflow_executions(&self, request: &ListWorkflowExecutionsByQueryRequest) -> Result<VisibilityPage> {
        let mut matching = self.query_matches(&request.domain_id, &request.query)?;
        // Scans promise no order; a stable one keeps offset tokens valid.
        matching.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        paginate(matching, request.page_size, request.next_page_token.as_deref())
    }

    async fn count_workflow_executions(
        &self,
        request: &CountWorkflowExecutionsRequest,
    ) -> Result<CountWorkflowExecutionsResponse> {
        let matching = self.query_matches(&request.domain_id, &request.query)?;
        Ok(CountWorkflowExecutionsResponse {
            count: matching.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CloseStatus;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(workflow_id: &str, run_id: &str, type_name: &str, start: i64) -> VisibilityWorkflowExecutionInfo {
        VisibilityWorkflowExecutionInfo {
            domain_id: "domain".into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            type_name: type_name.into(),
            start_time: at(start),
            execution_time: at(start),
            ..Default::default()
        }
    }

    fn closed(mut record: VisibilityWorkflowExecutionInfo, status: CloseStatus, close: i64) -> VisibilityWorkflowExecutionInfo {
        record.status = Some(status);
        record.close_time = Some(at(close));
        record
    }

    fn window(page_size: usize) -> ListWorkflowExecutionsRequest {
        ListWorkflowExecutionsRequest {
            domain_id: "domain".into(),
            domain: "orders".into(),
            earliest_time: at(0),
            latest_time: at(1_000),
            page_size,
            next_page_token: None,
        }
    }

    fn query(query: &str) -> ListWorkflowExecutionsByQueryRequest {
        ListWorkflowExecutionsByQueryRequest {
            domain_id: "domain".into(),
            domain: "orders".into(),
            query: query.into(),
            page_size: 0,
            next_page_token: None,
        }
    }

    async fn seeded() -> InMemoryVisibilityStore {
        let store = InMemoryVisibilityStore::new();
        store
            .record_workflow_execution_started(record("a", "run-a", "checkout", 10))
            .await
            .unwrap();
        store
            .record_workflow_execution_started(record("b", "run-b", "refund", 20))
            .await
            .unwrap();
        store
            .record_workflow_execution_closed(closed(record("c", "run-c", "checkout", 5), CloseStatus::Completed, 30))
            .await
            .unwrap();
        store
            .record_workflow_execution_closed(closed(record("d", "run-d", "checkout", 6), CloseStatus::Failed, 40))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_listing_newest_first_with_pages() {
        let store = seeded().await;
        let first = store.list_open_workflow_executions(&window(1)).await.unwrap();
        assert_eq!(first.executions[0].run_id, "run-b");
        let token = first.next_page_token.clone().unwrap();

        let mut request = window(1);
        request.next_page_token = Some(token);
        let second = store.list_open_workflow_executions(&request).await.unwrap();
        assert_eq!(second.executions[0].run_id, "run-a");
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_filters() {
        let store = seeded().await;
        let by_type = store
            .list_closed_workflow_executions_by_type(&ListWorkflowExecutionsByTypeRequest {
                list: window(0),
                workflow_type_name: "checkout".into(),
            })
            .await
            .unwrap();
        assert_eq!(by_type.executions.len(), 2);

        let by_status = store
            .list_closed_workflow_executions_by_status(&ListClosedWorkflowExecutionsByStatusRequest {
                list: window(0),
                status: CloseStatus::Failed,
            })
            .await
            .unwrap();
        assert_eq!(by_status.executions.len(), 1);
        assert_eq!(by_status.executions[0].workflow_id, "d");

        let by_id = store
            .list_open_workflow_executions_by_workflow_id(&ListWorkflowExecutionsByWorkflowIdRequest {
                list: window(0),
                workflow_id: "a".into(),
            })
            .await
            .unwrap();
        assert_eq!(by_id.executions.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_listing_bounds_by_close_time() {
        let store = seeded().await;
        let mut request = window(0);
        request.earliest_time = at(35);
        let page = store.list_closed_workflow_executions(&request).await.unwrap();
        assert_eq!(page.executions.len(), 1);
        assert_eq!(page.executions[0].run_id, "run-d");
    }

    #[tokio::test]
    async fn test_delete_and_count() {
        let store = seeded().await;
        let count = store
            .count_workflow_executions(&CountWorkflowExecutionsRequest {
                domain_id: "domain".into(),
                domain: "orders".into(),
                query: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(count.count, 4);

        store
            .delete_workflow_execution(&DeleteWorkflowExecutionRequest {
                domain_id: "domain".into(),
                run_id: "run-a".into(),
                task_id: 1,
            })
            .await
            .unwrap();
        let scanned = store.scan_workflow_executions(&query("")).await.unwrap();
        assert_eq!(scanned.executions.len(), 3);
    }

    #[tokio::test]
    async fn test_non_empty_query_is_rejected() {
        let store = seeded().await;
        let err = store
            .list_workflow_executions(&query("WorkflowType = 'checkout'"))
            .await
            .unwrap_err();
        assert!(matches!(err, VisibilityError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_get_closed_requires_closed_record() {
        let store = seeded().await;
        let err = store
            .get_closed_workflow_execution(&GetClosedWorkflowExecutionRequest {
                domain_id: "domain".into(),
                domain: "orders".into(),
                execution: crate::types::WorkflowExecution::new("a", "run-a"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VisibilityError::NotFound { .. }));
    }
}
