//! Proxmox VE API request and response models.
//!
//! Only the fields the driver reasons about are typed; everything else the
//! API reports is kept verbatim in `extra`.

use serde::{Deserialize, Serialize};

use crate::params::Params;

// ============================================================================
// Common wrapper types
// ============================================================================

/// Every PVE response is wrapped in a `data` envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Response data.
    pub data: T,
}

/// Error body returned alongside a non-success status.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    /// Per-parameter validation errors.
    #[serde(default)]
    pub errors: Option<Params>,
    /// Free-form message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Session ticket returned by `POST /access/ticket`.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketData {
    /// Authentication cookie value.
    pub ticket: String,
    /// CSRF token required on mutating requests.
    #[serde(rename = "CSRFPreventionToken")]
    pub csrf_token: String,
    /// Authenticated user.
    #[serde(default)]
    pub username: Option<String>,
}

// ============================================================================
// VM types
// ============================================================================

/// Virtualization kind of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    /// LXC container.
    Lxc,
    /// QEMU/KVM full virtual machine.
    Qemu,
}

impl Technology {
    /// Config key prefix holding network settings with an `ip` entry.
    #[must_use]
    pub fn ip_config_prefix(self) -> &'static str {
        match self {
            Self::Lxc => "net",
            Self::Qemu => "ipconfig",
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lxc => write!(f, "lxc"),
            Self::Qemu => write!(f, "qemu"),
        }
    }
}

impl std::str::FromStr for Technology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lxc" => Ok(Self::Lxc),
            "qemu" => Ok(Self::Qemu),
            other => Err(format!("unknown technology '{other}' (expected lxc or qemu)")),
        }
    }
}

/// Guest power state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// Guest is running.
    Running,
    /// Guest is stopped.
    Stopped,
    /// Unknown status.
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One guest from `GET /cluster/resources?type=vm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResource {
    /// Numeric guest id.
    pub vmid: u32,
    /// Guest name.
    #[serde(default)]
    pub name: String,
    /// Node hosting the guest.
    pub node: String,
    /// Virtualization kind.
    #[serde(rename = "type")]
    pub technology: Technology,
    /// Power state.
    #[serde(default)]
    pub status: VmStatus,
    /// Resource usage and any other reported fields.
    #[serde(flatten)]
    pub extra: Params,
}

impl VmResource {
    /// API path of this guest, e.g. `nodes/pve1/qemu/100`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("nodes/{}/{}/{}", self.node, self.technology, self.vmid)
    }
}

// ============================================================================
// Cluster types
// ============================================================================

/// One cluster node from `GET /nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name.
    pub node: String,
    /// Node status (`online`, `offline`, `unknown`).
    #[serde(default)]
    pub status: Option<String>,
    /// Other reported fields.
    #[serde(flatten)]
    pub extra: Params,
}

impl NodeInfo {
    /// Only nodes reporting exactly `online` can host guests.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status.as_deref() == Some("online")
    }
}

/// One volume from `GET /nodes/{node}/storage/{storage}/content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageContent {
    /// Volume identifier.
    pub volid: String,
    /// Content type (`images`, `vztmpl`, `iso`, `backup`, ...).
    pub content: String,
    /// Other reported fields.
    #[serde(flatten)]
    pub extra: Params,
}

impl StorageContent {
    /// Content types usable as guest images.
    pub const IMAGE_CONTENT: [&'static str; 3] = ["images", "vztmpl", "iso"];

    /// Whether this volume is a template, disk image or ISO.
    #[must_use]
    pub fn is_image(&self) -> bool {
        Self::IMAGE_CONTENT.contains(&self.content.as_str())
    }
}

// ============================================================================
// Task types
// ============================================================================

/// Status of an asynchronous task from `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// `running` or `stopped`.
    #[serde(default)]
    pub status: String,
    /// Exit status, present once stopped (`OK` or an error text).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitstatus: Option<String>,
    /// Other reported fields.
    #[serde(flatten)]
    pub extra: Params,
}

impl TaskStatus {
    /// Whether the task reached its terminal state.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }

    /// Whether the exit status reports a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exitstatus
            .as_deref()
            .is_some_and(|exit| exit.contains("failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_resource_keeps_usage_fields() {
        let vm: VmResource = serde_json::from_value(json!({
            "vmid": 100,
            "name": "web",
            "node": "pve1",
            "type": "lxc",
            "status": "running",
            "maxmem": 536_870_912,
            "cpu": 0.01
        }))
        .unwrap();

        assert_eq!(vm.technology, Technology::Lxc);
        assert_eq!(vm.status, VmStatus::Running);
        assert_eq!(vm.extra["maxmem"], json!(536_870_912));
        assert_eq!(vm.path(), "nodes/pve1/lxc/100");
    }

    #[test]
    fn test_unknown_vm_status() {
        let vm: VmResource = serde_json::from_value(json!({
            "vmid": 101, "name": "db", "node": "pve1", "type": "qemu", "status": "paused"
        }))
        .unwrap();
        assert_eq!(vm.status, VmStatus::Unknown);
    }

    #[test]
    fn test_technology_parse() {
        assert_eq!("qemu".parse::<Technology>().unwrap(), Technology::Qemu);
        assert!("openvz".parse::<Technology>().is_err());
        assert_eq!(Technology::Lxc.ip_config_prefix(), "net");
        assert_eq!(Technology::Qemu.ip_config_prefix(), "ipconfig");
    }

    #[test]
    fn test_task_status_failure_detection() {
        let ok = TaskStatus {
            status: "stopped".into(),
            exitstatus: Some("OK".into()),
            extra: Params::new(),
        };
        let failed = TaskStatus {
            status: "stopped".into(),
            exitstatus: Some("command 'qm start 100' failed: exit code 1".into()),
            extra: Params::new(),
        };
        assert!(ok.is_stopped() && !ok.is_failed());
        assert!(failed.is_failed());
    }

    #[test]
    fn test_node_online() {
        let node: NodeInfo =
            serde_json::from_value(json!({"node": "pve2", "status": "offline"})).unwrap();
        assert!(!node.is_online());
    }
}
