// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller context carried by every engine operation.
//!
//! A [`CallContext`] bundles an optional deadline with a cancellation token.
//! Engine code never blocks past either: suspended calls race their wait
//! against both and report [`HistoryError::Timeout`] or
//! [`HistoryError::Canceled`] respectively.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{HistoryError, Result};

/// Deadline and cancellation for one inbound call.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context without deadline that is never canceled by itself.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_at(Instant::now() + timeout)
    }

    /// Replace the deadline.
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token canceled when the caller gives up.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the caller canceled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the call is already canceled or past its deadline.
    pub fn check(&self, operation: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HistoryError::Canceled { operation });
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(HistoryError::Timeout { operation });
        }
        Ok(())
    }

    /// The earlier of the caller deadline and `now + cap`.
    pub(crate) fn deadline_capped(&self, cap: Duration) -> Instant {
        let capped = Instant::now() + cap;
        match self.deadline {
            Some(deadline) if deadline < capped => deadline,
            _ => capped,
        }
    }

    /// Run `fut` until it finishes, the deadline passes, or the call is
    /// canceled.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.deadline;
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(HistoryError::Canceled { operation }),

            _ = sleep_until_opt(deadline) => Err(HistoryError::Timeout { operation }),

            result = fut => result,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_runs_to_completion() {
        let ctx = CallContext::background();
        let value = ctx.run("test", async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert!(ctx.check("test").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout() {
        let ctx = CallContext::with_timeout(Duration::from_millis(100));
        let result: Result<()> = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(HistoryError::Timeout { operation: "slow" }));
        assert!(matches!(ctx.check("slow"), Err(HistoryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cancel_yields_canceled() {
        let ctx = CallContext::background();
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceler.cancel();
        });

        let result: Result<()> = ctx.run("wait", std::future::pending()).await;
        assert_eq!(result, Err(HistoryError::Canceled { operation: "wait" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_capped_picks_earlier() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let capped = ctx.deadline_capped(Duration::from_secs(20));
        assert_eq!(Some(capped), ctx.deadline());

        let loose = CallContext::background();
        let capped = loose.deadline_capped(Duration::from_secs(2));
        assert!(capped <= Instant::now() + Duration::from_secs(2));
    }
}
