//! Seams to the orchestration framework.
//!
//! Lifecycle notifications and guest bootstrap belong to the framework that
//! drives this crate. They are injected into the driver as trait objects.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::Profile;
use crate::driver::VmDetails;
use crate::error::CloudError;
use crate::params::Params;

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    /// Event tag, e.g. `cloud/web-01/creating`.
    pub tag: String,
    /// Human readable message.
    pub message: String,
    /// Event payload.
    pub args: Params,
}

impl LifecycleEvent {
    /// Build an event for `name` entering `phase`.
    #[must_use]
    pub fn new(name: &str, phase: &str, message: impl Into<String>, args: Params) -> Self {
        Self {
            tag: format!("cloud/{name}/{phase}"),
            message: message.into(),
            args,
        }
    }
}

/// Receives lifecycle notifications.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event.
    async fn fire(&self, event: LifecycleEvent);
}

/// Emits lifecycle events as log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

#[async_trait]
impl EventSink for LogEvents {
    async fn fire(&self, event: LifecycleEvent) {
        info!(tag = %event.tag, args = %serde_json::Value::Object(event.args), "{}", event.message);
    }
}

/// Provisions the guest OS of a freshly started VM.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Bootstrap the guest; the returned map is merged into the create result.
    async fn bootstrap(&self, profile: &Profile, details: &VmDetails) -> Result<Params, CloudError>;
}

/// Leaves the guest untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipBootstrap;

#[async_trait]
impl Bootstrapper for SkipBootstrap {
    async fn bootstrap(
        &self,
        profile: &Profile,
        _details: &VmDetails,
    ) -> Result<Params, CloudError> {
        debug!(name = %profile.name, "Skipping guest bootstrap");
        Ok(Params::new())
    }
}

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Waits for SSH on the guest and optionally pipes a deploy script to it.
#[derive(Debug, Clone)]
pub struct SshBootstrap {
    /// Port to wait for.
    pub port: u16,
    /// Deadline for the port to open.
    pub timeout: Duration,
    /// Delay between connection attempts.
    pub interval: Duration,
    /// Script run on the guest with `sh -s`.
    pub deploy_script: Option<PathBuf>,
}

impl Default for SshBootstrap {
    fn default() -> Self {
        Self {
            port: SSH_PORT,
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
            deploy_script: None,
        }
    }
}

impl SshBootstrap {
    /// Set the deploy script.
    #[must_use]
    pub fn with_deploy_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.deploy_script = Some(script.into());
        self
    }

    /// Address to connect to: `ssh_host`, else the first discovered IP.
    fn target(profile: &Profile, details: &VmDetails) -> Option<String> {
        profile.ssh_host.clone().or_else(|| {
            details
                .private_ips
                .first()
                .or_else(|| details.public_ips.first())
                .cloned()
        })
    }

    async fn wait_for_port(&self, host: &str) -> Result<(), CloudError> {
        let addr = format!("{host}:{}", self.port);
        let start = Instant::now();

        info!(addr = %addr, timeout_secs = self.timeout.as_secs(), "Waiting for SSH");

        loop {
            if start.elapsed() > self.timeout {
                return Err(CloudError::Bootstrap(format!("Timeout waiting for SSH at {addr}")));
            }

            match tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => {
                    info!(addr = %addr, "SSH is reachable");
                    return Ok(());
                }
                Ok(Err(e)) => debug!("Connection attempt failed: {e}"),
                Err(_) => debug!("Connection attempt timed out"),
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Password for the guest login, as handed over by the driver.
    fn password(profile: &Profile) -> Option<&str> {
        profile
            .extra
            .get("password")
            .and_then(Value::as_str)
            .or(profile.ssh_password.as_deref())
    }

    /// Build the ssh invocation. Password logins go through `sshpass -e`;
    /// key logins run in batch mode so a missing key fails instead of
    /// prompting.
    fn ssh_command(&self, host: &str, user: &str, password: Option<&str>) -> Command {
        let mut cmd = match password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password).args(["-e", "ssh"]);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };

        cmd.args(["-o", "StrictHostKeyChecking=accept-new", "-p"])
            .arg(self.port.to_string())
            .arg(format!("{user}@{host}"))
            .arg("sh -s");
        cmd
    }

    async fn run_script(
        &self,
        host: &str,
        user: &str,
        password: Option<&str>,
        script: &Path,
    ) -> Result<(), CloudError> {
        let file = std::fs::File::open(script).map_err(|e| {
            CloudError::Bootstrap(format!("Failed to open {}: {e}", script.display()))
        })?;

        info!(
            host = %host,
            script = %script.display(),
            password_auth = password.is_some(),
            "Running deploy script"
        );
        let output = self
            .ssh_command(host, user, password)
            .stdin(Stdio::from(file))
            .output()
            .await
            .map_err(|e| CloudError::Bootstrap(format!("Failed to execute ssh: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CloudError::Bootstrap(format!("Deploy script failed: {stderr}")))
        }
    }
}

#[async_trait]
impl Bootstrapper for SshBootstrap {
    async fn bootstrap(
        &self,
        profile: &Profile,
        details: &VmDetails,
    ) -> Result<Params, CloudError> {
        let host = Self::target(profile, details).ok_or_else(|| {
            CloudError::Bootstrap(format!(
                "No ssh_host configured and no IP address found for '{}'",
                profile.name
            ))
        })?;

        self.wait_for_port(&host).await?;

        let mut ret = Params::new();
        ret.insert("ssh_host".into(), Value::String(host.clone()));

        match &self.deploy_script {
            Some(script) => {
                let user = profile.ssh_username.as_deref().unwrap_or("root");
                self.run_script(&host, user, Self::password(profile), script)
                    .await?;
                ret.insert("deployed".into(), Value::Bool(true));
            }
            None => {
                ret.insert("deployed".into(), Value::Bool(false));
            }
        }

        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn details(private_ips: &[&str]) -> VmDetails {
        let resource = serde_json::from_value(serde_json::json!({
            "vmid": 100, "name": "web", "node": "pve", "type": "qemu", "status": "running"
        }))
        .unwrap();
        let mut details = VmDetails::new(resource, Params::new());
        details.private_ips = private_ips.iter().map(ToString::to_string).collect();
        details
    }

    fn quick(port: u16) -> SshBootstrap {
        SshBootstrap {
            port,
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(20),
            deploy_script: None,
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_ssh_command_with_key_uses_batch_mode() {
        let cmd = quick(2222).ssh_command("10.0.0.5", "root", None);

        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert_eq!(
            args(&cmd),
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-p",
                "2222",
                "root@10.0.0.5",
                "sh -s"
            ]
        );
        assert_eq!(cmd.as_std().get_envs().count(), 0);
    }

    #[test]
    fn test_ssh_command_with_password_uses_sshpass() {
        let cmd = quick(22).ssh_command("10.0.0.5", "admin", Some("hunter2"));

        assert_eq!(cmd.as_std().get_program(), "sshpass");
        let args = args(&cmd);
        assert_eq!(&args[..2], ["-e", "ssh"]);
        assert!(!args.iter().any(|a| a.contains("BatchMode")));
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert_eq!(args.last().map(String::as_str), Some("sh -s"));

        let envs: Vec<_> = cmd.as_std().get_envs().collect();
        assert_eq!(
            envs,
            vec![(
                std::ffi::OsStr::new("SSHPASS"),
                Some(std::ffi::OsStr::new("hunter2"))
            )]
        );
    }

    #[test]
    fn test_password_prefers_driver_supplied_key() {
        let mut profile = Profile {
            ssh_password: Some("from-profile".into()),
            ..Profile::default()
        };
        assert_eq!(SshBootstrap::password(&profile), Some("from-profile"));

        profile
            .extra
            .insert("password".into(), Value::String("from-driver".into()));
        assert_eq!(SshBootstrap::password(&profile), Some("from-driver"));

        assert_eq!(SshBootstrap::password(&Profile::default()), None);
    }

    #[test]
    fn test_event_tag() {
        let event = LifecycleEvent::new("web-01", "creating", "starting create", Params::new());
        assert_eq!(event.tag, "cloud/web-01/creating");
    }

    #[test]
    fn test_target_prefers_ssh_host() {
        let profile = Profile {
            name: "web".into(),
            ssh_host: Some("10.0.0.9".into()),
            ..Profile::default()
        };
        assert_eq!(
            SshBootstrap::target(&profile, &details(&["192.168.1.2"])).as_deref(),
            Some("10.0.0.9")
        );

        let profile = Profile::default();
        assert_eq!(
            SshBootstrap::target(&profile, &details(&["192.168.1.2"])).as_deref(),
            Some("192.168.1.2")
        );
        assert!(SshBootstrap::target(&profile, &details(&[])).is_none());
    }

    #[tokio::test]
    async fn test_waits_for_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let profile = Profile {
            name: "web".into(),
            ssh_host: Some("127.0.0.1".into()),
            ..Profile::default()
        };

        let ret = quick(port).bootstrap(&profile, &details(&[])).await.unwrap();
        assert_eq!(ret["ssh_host"], "127.0.0.1");
        assert_eq!(ret["deployed"], false);
    }

    #[tokio::test]
    async fn test_times_out_on_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = quick(port)
            .bootstrap(&Profile::default(), &details(&["127.0.0.1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Bootstrap(_)));
    }

    #[tokio::test]
    async fn test_skip_bootstrap_returns_nothing() {
        let ret = SkipBootstrap
            .bootstrap(&Profile::default(), &details(&[]))
            .await
            .unwrap();
        assert!(ret.is_empty());
    }
}
