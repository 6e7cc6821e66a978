use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use pvebox_core::error::Result;
use pvebox_core::retry::Backoff;

use crate::client::{Method, ProxmoxClient};

/// How long a wrapped action's server-side jobs may take to drain.
const TASK_DEADLINE: Duration = Duration::from_secs(1200);

/// Jobs triggered by an action may not appear in the cluster task list
/// immediately; wait this long before the first poll.
const TASK_GRACE: Duration = Duration::from_secs(2);

/// Source of the cluster-wide set of incomplete asynchronous jobs.
///
/// There is no way to scope the job list to one action, so completion is
/// detected by diffing this set before and after.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// UPIDs of tasks that have not reached a terminal OK status.
    async fn incomplete_upids(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl TaskSource for ProxmoxClient {
    async fn incomplete_upids(&self) -> Result<Vec<String>> {
        let tasks = self.request(Method::GET, "/cluster/tasks", None).await?;
        Ok(incomplete_from_list(&tasks))
    }
}

/// Extract incomplete-task UPIDs from a `/cluster/tasks` response.
/// A task with no status field is still running.
pub fn incomplete_from_list(tasks: &Value) -> Vec<String> {
    tasks
        .as_array()
        .into_iter()
        .flatten()
        .filter(|task| {
            task.get("status")
                .and_then(Value::as_str)
                .map(|status| status != "OK")
                .unwrap_or(true)
        })
        .filter_map(|task| task.get("upid").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Detects and awaits completion of server-side jobs triggered by a
/// request. Every mutating VM/network operation is wrapped by this;
/// without it a dependent operation could race an in-flight job (e.g.
/// configuring a VM still mid-clone).
pub struct TaskMonitor<S = ProxmoxClient> {
    source: Arc<S>,
    grace: Duration,
    backoff: Backoff,
}

impl<S: TaskSource> TaskMonitor<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self::with_schedule(source, TASK_GRACE, Backoff::with_deadline(TASK_DEADLINE))
    }

    /// Custom grace/backoff schedule; tests shrink these.
    pub fn with_schedule(source: Arc<S>, grace: Duration, backoff: Backoff) -> Self {
        Self {
            source,
            grace,
            backoff,
        }
    }

    /// Run `action` and block until every job that appeared after it
    /// reaches a terminal OK, or fail with `ProvisioningTimeout`.
    pub async fn run_and_await<T, Fut>(&self, operation: &str, action: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let pre_existing: HashSet<String> =
            self.source.incomplete_upids().await?.into_iter().collect();

        let output = action.await?;

        tokio::time::sleep(self.grace).await;

        let pre_existing = &pre_existing;
        self.backoff
            .poll_until(operation, || async move {
                let current = self.source.incomplete_upids().await?;
                let pending: Vec<String> = current
                    .into_iter()
                    .filter(|upid| !pre_existing.contains(upid))
                    .collect();
                if pending.is_empty() {
                    Ok(Some(()))
                } else {
                    debug!(operation, pending = pending.len(), "jobs still running");
                    Ok(None)
                }
            })
            .await?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use pvebox_core::error::Error;
    use serde_json::json;

    /// Fake job source that serves a scripted sequence of task lists.
    struct ScriptedSource {
        polls: Mutex<Vec<Vec<String>>>,
        last: Vec<String>,
    }

    impl ScriptedSource {
        fn new(polls: Vec<Vec<&str>>, last: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(
                    polls
                        .into_iter()
                        .map(|p| p.into_iter().map(str::to_string).collect())
                        .collect(),
                ),
                last: last.into_iter().map(str::to_string).collect(),
            })
        }
    }

    #[async_trait]
    impl TaskSource for ScriptedSource {
        async fn incomplete_upids(&self) -> Result<Vec<String>> {
            let mut polls = self.polls.lock().unwrap();
            if polls.is_empty() {
                Ok(self.last.clone())
            } else {
                Ok(polls.remove(0))
            }
        }
    }

    fn fast_monitor<S: TaskSource>(source: Arc<S>) -> TaskMonitor<S> {
        TaskMonitor::with_schedule(
            source,
            Duration::from_millis(1),
            Backoff::new(Duration::from_millis(1), 1.3, Duration::from_millis(500)),
        )
    }

    #[tokio::test]
    async fn test_returns_once_new_jobs_drain() {
        // Snapshot sees one pre-existing stuck job; the action spawns a
        // new one that resolves on the third poll.
        let source = ScriptedSource::new(
            vec![
                vec!["old"],               // pre-action snapshot
                vec!["old", "new"],        // poll 1
                vec!["old", "new"],        // poll 2
                vec!["old"],               // poll 3: new job done
            ],
            vec!["old"],
        );
        let monitor = fast_monitor(source);
        let out = monitor
            .run_and_await("test action", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_pre_existing_jobs_do_not_block() {
        let source = ScriptedSource::new(vec![vec!["stuck"]], vec!["stuck"]);
        let monitor = fast_monitor(source);
        monitor
            .run_and_await("noop", async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unresolved_job_times_out() {
        let source = ScriptedSource::new(vec![vec![]], vec!["forever"]);
        let monitor = fast_monitor(source);
        let result = monitor.run_and_await("stuck action", async { Ok(()) }).await;
        assert!(matches!(
            result,
            Err(Error::ProvisioningTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_action_error_propagates_without_polling() {
        let source = ScriptedSource::new(vec![vec![]], vec![]);
        let monitor = fast_monitor(source);
        let result: Result<()> = monitor
            .run_and_await("failing action", async {
                Err(Error::Configuration("bad".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_incomplete_from_list() {
        let tasks = json!([
            {"upid": "a", "status": "OK"},
            {"upid": "b", "status": "running"},
            {"upid": "c"},
            {"status": "OK"},
        ]);
        let ids = incomplete_from_list(&tasks);
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_incomplete_from_non_array() {
        assert!(incomplete_from_list(&Value::Null).is_empty());
    }
}
