//! Waiting for asynchronous hypervisor tasks.
//!
//! Mutating calls (create, clone, power changes, delete) return a UPID. The
//! task is polled on its owning node until it stops or the deadline passes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ProxmoxClient, TaskStatus, Upid};
use crate::error::CloudError;
use crate::params::Params;

/// Default deadline for a task to stop.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between status queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wall-clock deadline.
    pub timeout: Duration,
    /// Delay between status queries.
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TASK_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Where a task stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Still running.
    Pending,
    /// Stopped without a failure exit status.
    StoppedOk,
    /// Stopped with an exit status containing `failed`.
    StoppedFailed,
}

impl TaskState {
    /// Classify a status payload.
    #[must_use]
    pub fn of(status: &TaskStatus) -> Self {
        if !status.is_stopped() {
            Self::Pending
        } else if status.is_failed() {
            Self::StoppedFailed
        } else {
            Self::StoppedOk
        }
    }

    /// Whether polling can stop.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Poll a task until it stops.
///
/// # Errors
/// - `InvalidUpid` if the handle cannot be decoded.
/// - `ExecutionTimeout` if the task is still running at the deadline.
/// - `TaskFailed` if the task stopped with a failure exit status.
pub async fn wait_for_task(
    client: &ProxmoxClient,
    upid: &str,
    config: &PollConfig,
) -> Result<TaskStatus, CloudError> {
    let handle: Upid = upid.parse()?;
    let path = format!("nodes/{}/tasks/{}/status", handle.node, handle);

    info!(
        upid = %handle,
        node = %handle.node,
        task_type = %handle.task_type,
        timeout_secs = config.timeout.as_secs(),
        "Waiting for task"
    );

    let start = Instant::now();

    loop {
        if start.elapsed() >= config.timeout {
            warn!(upid = %handle, "Task did not stop before the deadline");
            return Err(CloudError::ExecutionTimeout {
                upid: handle.to_string(),
                timeout_secs: config.timeout.as_secs(),
            });
        }

        let status: TaskStatus = client.get(&path, &Params::new()).await?;

        debug!(
            upid = %handle,
            status = %status.status,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Polling task status"
        );

        match TaskState::of(&status) {
            TaskState::Pending => tokio::time::sleep(config.interval).await,
            TaskState::StoppedOk => {
                info!(upid = %handle, exitstatus = ?status.exitstatus, "Task finished");
                return Ok(status);
            }
            TaskState::StoppedFailed => {
                return Err(CloudError::TaskFailed {
                    upid: handle.to_string(),
                    exit_status: status.exitstatus.unwrap_or_default(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const UPID: &str = "UPID:pve1:0000C0DE:00ABCDEF:65A8C0F0:qmstart:100:root@pam:";

    fn status_path() -> String {
        format!("/api2/json/nodes/pve1/tasks/{UPID}/status")
    }

    fn fast() -> PollConfig {
        PollConfig {
            timeout: Duration::from_millis(300),
            interval: Duration::from_millis(10),
        }
    }

    fn client_for(server: &MockServer) -> ProxmoxClient {
        ProxmoxClient::with_base_url(
            Url::parse(&format!("{}/api2/json", server.uri())).unwrap(),
            Credentials::Token {
                user: "root@pam".into(),
                token_name: "ci".into(),
                token_value: "secret".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_task_state_classification() {
        let running: TaskStatus = serde_json::from_value(json!({"status": "running"})).unwrap();
        let ok: TaskStatus =
            serde_json::from_value(json!({"status": "stopped", "exitstatus": "OK"})).unwrap();
        let failed: TaskStatus = serde_json::from_value(
            json!({"status": "stopped", "exitstatus": "clone failed: storage busy"}),
        )
        .unwrap();

        assert_eq!(TaskState::of(&running), TaskState::Pending);
        assert_eq!(TaskState::of(&ok), TaskState::StoppedOk);
        assert_eq!(TaskState::of(&failed), TaskState::StoppedFailed);
        assert!(!TaskState::Pending.is_terminal());
        assert!(TaskState::StoppedFailed.is_terminal());
    }

    #[test]
    fn test_default_poll_config() {
        let config = PollConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.interval, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_returns_final_payload_after_running() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(status_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "running", "upid": UPID}
            })))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(status_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"status": "stopped", "exitstatus": "OK", "upid": UPID, "node": "pve1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let status = wait_for_task(&client_for(&server), UPID, &fast()).await.unwrap();
        assert_eq!(status.status, "stopped");
        assert_eq!(status.exitstatus.as_deref(), Some("OK"));
        assert_eq!(status.extra["node"], "pve1");
    }

    #[tokio::test]
    async fn test_failed_exit_status_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(status_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "status": "stopped",
                    "exitstatus": "command 'qm start 100' failed: exit code 1"
                }
            })))
            .mount(&server)
            .await;

        let err = wait_for_task(&client_for(&server), UPID, &fast())
            .await
            .unwrap_err();
        match err {
            CloudError::TaskFailed { upid, exit_status } => {
                assert_eq!(upid, UPID);
                assert!(exit_status.contains("failed: exit code 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_times_out_when_never_stopped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(status_path()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"status": "running"}})),
            )
            .mount(&server)
            .await;

        let err = wait_for_task(&client_for(&server), UPID, &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::ExecutionTimeout { ref upid, .. } if upid == UPID));
    }

    #[tokio::test]
    async fn test_invalid_handle_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = wait_for_task(&client_for(&server), "not-a-upid", &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::InvalidUpid(_)));
    }
}
