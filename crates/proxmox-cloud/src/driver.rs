//! VM lifecycle orchestration.
//!
//! [`ProxmoxDriver`] exposes the operations the orchestration framework
//! invokes. Operations that are not bound to an instance must be called as a
//! [`CallKind::Function`]; operations on a named instance as a
//! [`CallKind::Action`]. A wrong calling convention fails before any request
//! is made.
//!
//! Every mutating call returns a task handle that is waited on with
//! [`wait_for_task`](crate::tasks::wait_for_task) before the operation
//! returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::{NodeInfo, ProxmoxClient, StorageContent, TaskStatus, VmResource};
use crate::config::Profile;
use crate::error::CloudError;
use crate::hooks::{Bootstrapper, EventSink, LifecycleEvent, LogEvents, SkipBootstrap};
use crate::ips::parse_ips;
use crate::locator;
use crate::params::{require_vmid, Params};
use crate::retry::{with_retry_async, RetryConfig, RetryError};
use crate::tasks::{wait_for_task, PollConfig};

/// Storage searched by `avail_images` when none is given.
pub const DEFAULT_STORAGE: &str = "local";

/// Calling convention of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Targets a named instance.
    Action,
    /// Not bound to an instance.
    Function,
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action => write!(f, "action"),
            Self::Function => write!(f, "function"),
        }
    }
}

fn require_call(call: CallKind, expected: CallKind, operation: &str) -> Result<(), CloudError> {
    if call == expected {
        return Ok(());
    }

    let article = match expected {
        CallKind::Action => "an",
        CallKind::Function => "a",
    };
    Err(CloudError::Usage(format!(
        "The {operation} {expected} must be called as {article} {expected}."
    )))
}

/// Power state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Boot the guest.
    Start,
    /// Hard stop.
    Stop,
    /// Graceful shutdown.
    Shutdown,
}

impl PowerAction {
    /// Last path segment of the status endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
        }
    }

    /// State the guest ends up in.
    #[must_use]
    pub fn target_state(self) -> &'static str {
        match self {
            Self::Start => "running",
            Self::Stop | Self::Shutdown => "stopped",
        }
    }
}

/// Result of an action on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    /// Always true; failures are errors.
    pub success: bool,
    /// State after the action, for power actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Action performed.
    pub action: String,
}

impl ActionResult {
    fn new(action: &str, state: Option<&str>) -> Self {
        Self {
            success: true,
            state: state.map(ToString::to_string),
            action: action.to_string(),
        }
    }
}

/// Full details of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmDetails {
    /// VM id as a string.
    pub id: String,
    /// Not tracked by Proxmox; always empty.
    pub image: String,
    /// Private addresses from the network config.
    pub private_ips: Vec<String>,
    /// Public addresses from the network config.
    pub public_ips: Vec<String>,
    /// Proxmox has no instance sizes; always empty.
    pub size: String,
    /// Power state.
    pub state: String,
    /// Raw guest configuration.
    pub config: Params,
    /// Raw inventory record.
    pub resource: VmResource,
}

impl VmDetails {
    /// Join an inventory record with its configuration.
    #[must_use]
    pub fn new(resource: VmResource, config: Params) -> Self {
        let (private_ips, public_ips) = parse_ips(&config, resource.technology);
        Self {
            id: resource.vmid.to_string(),
            image: String::new(),
            private_ips,
            public_ips,
            size: String::new(),
            state: resource.status.to_string(),
            config,
            resource,
        }
    }

    /// The fields reported by `list_nodes`.
    #[must_use]
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            image: self.image.clone(),
            private_ips: self.private_ips.clone(),
            public_ips: self.public_ips.clone(),
            size: self.size.clone(),
            state: self.state.clone(),
        }
    }
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    /// VM id as a string.
    pub id: String,
    /// Always empty.
    pub image: String,
    /// Private addresses.
    pub private_ips: Vec<String>,
    /// Public addresses.
    pub public_ips: Vec<String>,
    /// Always empty.
    pub size: String,
    /// Power state.
    pub state: String,
}

/// Images per location, keyed by volume id.
pub type ImageCatalog = BTreeMap<String, BTreeMap<String, StorageContent>>;

/// Proxmox VE cloud driver.
pub struct ProxmoxDriver {
    client: ProxmoxClient,
    events: Arc<dyn EventSink>,
    bootstrapper: Arc<dyn Bootstrapper>,
    poll: PollConfig,
    start_retry: RetryConfig,
}

impl ProxmoxDriver {
    /// Driver with log-only events, no bootstrap and default timings.
    #[must_use]
    pub fn new(client: ProxmoxClient) -> Self {
        Self {
            client,
            events: Arc::new(LogEvents),
            bootstrapper: Arc::new(SkipBootstrap),
            poll: PollConfig::default(),
            start_retry: RetryConfig::default(),
        }
    }

    /// Set the lifecycle event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Set the guest bootstrapper.
    #[must_use]
    pub fn with_bootstrapper(mut self, bootstrapper: Arc<dyn Bootstrapper>) -> Self {
        self.bootstrapper = bootstrapper;
        self
    }

    /// Set task polling timings.
    #[must_use]
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Set the retry policy for starting a freshly created VM.
    #[must_use]
    pub fn with_start_retry(mut self, retry: RetryConfig) -> Self {
        self.start_retry = retry;
        self
    }

    /// Underlying API client.
    #[must_use]
    pub fn client(&self) -> &ProxmoxClient {
        &self.client
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Create a VM from a profile, start it and bootstrap the guest.
    ///
    /// # Errors
    /// Usage errors for an incomplete profile, plus any API, task or
    /// bootstrap failure.
    pub async fn create(&self, profile: &Profile) -> Result<Params, CloudError> {
        self.events
            .fire(LifecycleEvent::new(
                &profile.name,
                "creating",
                "starting create",
                profile.event_args(),
            ))
            .await;

        let technology = profile.technology.ok_or_else(|| {
            CloudError::Usage(format!(
                "The VM profile '{}' is missing the 'technology' parameter.",
                profile.profile_name()
            ))
        })?;

        if let Some(clone_params) = profile.clone.as_ref().filter(|c| !c.is_empty()) {
            self.clone_vm(CallKind::Function, clone_params.clone()).await?;
        } else {
            let create_params = profile.create.as_ref().ok_or_else(|| {
                CloudError::Usage(format!(
                    "The VM profile '{}' needs either 'create' or 'clone' parameters.",
                    profile.profile_name()
                ))
            })?;
            let node = create_params
                .get("node")
                .and_then(Value::as_str)
                .ok_or_else(|| CloudError::MissingParameter("create.node".into()))?;

            info!(name = %profile.name, node = %node, technology = %technology, "Creating VM");
            let upid: String = self
                .client
                .post(&format!("nodes/{node}/{technology}"), create_params)
                .await?;
            wait_for_task(&self.client, &upid, &self.poll).await?;
        }

        self.start_new_vm(&profile.name).await?;

        let details = self.instance_details(&profile.name).await?;

        let mut bootstrap_profile = profile.clone();
        if let Some(password) = &profile.ssh_password {
            bootstrap_profile
                .extra
                .insert("password".into(), Value::String(password.clone()));
        }
        let mut ret = self
            .bootstrapper
            .bootstrap(&bootstrap_profile, &details)
            .await?;

        if let Value::Object(fields) = serde_json::to_value(&details)? {
            ret.extend(fields);
        }

        self.events
            .fire(LifecycleEvent::new(
                &profile.name,
                "created",
                "created instance",
                profile.event_args(),
            ))
            .await;

        info!(name = %profile.name, id = %details.id, "VM created");
        Ok(ret)
    }

    /// Start a VM that was just created, tolerating inventory lag.
    async fn start_new_vm(&self, name: &str) -> Result<(), CloudError> {
        let operation = format!("Starting newly created VM '{name}'");
        let no_params = Params::new();
        let result = with_retry_async(&self.start_retry, &operation, CloudError::is_not_found, || {
            self.set_vm_status(name, PowerAction::Start, &no_params)
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(RetryError::Aborted(e)) => Err(e),
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(name = %name, error = %last, "VM never appeared in the inventory");
                Err(CloudError::NotPropagated {
                    name: name.to_string(),
                    attempts,
                })
            }
        }
    }

    /// Clone the VM identified by the `vmid` param.
    ///
    /// All params are forwarded to the clone endpoint.
    ///
    /// # Errors
    /// Usage error unless called as a function; `MissingParameter` without
    /// `vmid`; `NotFound` for an unknown source.
    pub async fn clone_vm(&self, call: CallKind, params: Params) -> Result<TaskStatus, CloudError> {
        require_call(call, CallKind::Function, "clone")?;

        let vmid = require_vmid(&params, "vmid")?;
        let source = locator::find_by_id(&self.client, vmid).await?;

        info!(vmid, node = %source.node, technology = %source.technology, "Cloning VM");
        let upid: String = self
            .client
            .post(&format!("{}/clone", source.path()), &params)
            .await?;
        wait_for_task(&self.client, &upid, &self.poll).await
    }

    /// Update the configuration of a named VM.
    ///
    /// # Errors
    /// Usage error unless called as an action; `NotFound` for an unknown VM.
    pub async fn reconfigure(
        &self,
        call: CallKind,
        name: &str,
        params: Params,
    ) -> Result<ActionResult, CloudError> {
        require_call(call, CallKind::Action, "reconfigure")?;

        let vm = locator::find_by_name(&self.client, name).await?;
        info!(name = %name, vmid = vm.vmid, "Reconfiguring VM");
        let _: Value = self
            .client
            .put(&format!("{}/config", vm.path()), &params)
            .await?;

        Ok(ActionResult::new("reconfigure", None))
    }

    /// Delete a named VM.
    ///
    /// # Errors
    /// Usage error unless called as an action; `NotFound` for an unknown VM.
    pub async fn destroy(
        &self,
        call: CallKind,
        name: &str,
        params: Params,
    ) -> Result<ActionResult, CloudError> {
        require_call(call, CallKind::Action, "destroy")?;

        let mut args = Params::new();
        args.insert("name".into(), Value::String(name.to_string()));

        self.events
            .fire(LifecycleEvent::new(name, "destroying", "destroying instance", args.clone()))
            .await;

        let vm = locator::find_by_name(&self.client, name).await?;
        info!(name = %name, vmid = vm.vmid, "Destroying VM");
        let response: Value = self.client.delete(&vm.path(), &params).await?;
        if let Some(upid) = response.as_str() {
            wait_for_task(&self.client, upid, &self.poll).await?;
        }

        self.events
            .fire(LifecycleEvent::new(name, "destroyed", "destroyed instance", args))
            .await;

        Ok(ActionResult::new("destroy", None))
    }

    /// Start a named VM.
    ///
    /// # Errors
    /// Usage error unless called as an action; `NotFound` for an unknown VM.
    pub async fn start(
        &self,
        call: CallKind,
        name: &str,
        params: Params,
    ) -> Result<ActionResult, CloudError> {
        self.power(call, name, PowerAction::Start, params).await
    }

    /// Hard-stop a named VM.
    ///
    /// # Errors
    /// Usage error unless called as an action; `NotFound` for an unknown VM.
    pub async fn stop(
        &self,
        call: CallKind,
        name: &str,
        params: Params,
    ) -> Result<ActionResult, CloudError> {
        self.power(call, name, PowerAction::Stop, params).await
    }

    /// Gracefully shut down a named VM.
    ///
    /// # Errors
    /// Usage error unless called as an action; `NotFound` for an unknown VM.
    pub async fn shutdown(
        &self,
        call: CallKind,
        name: &str,
        params: Params,
    ) -> Result<ActionResult, CloudError> {
        self.power(call, name, PowerAction::Shutdown, params).await
    }

    async fn power(
        &self,
        call: CallKind,
        name: &str,
        action: PowerAction,
        params: Params,
    ) -> Result<ActionResult, CloudError> {
        require_call(call, CallKind::Action, action.as_str())?;
        self.set_vm_status(name, action, &params).await?;
        Ok(ActionResult::new(action.as_str(), Some(action.target_state())))
    }

    async fn set_vm_status(
        &self,
        name: &str,
        action: PowerAction,
        params: &Params,
    ) -> Result<TaskStatus, CloudError> {
        let vm = locator::find_by_name(&self.client, name).await?;

        info!(name = %name, vmid = vm.vmid, action = action.as_str(), "Changing VM power state");
        let upid: String = self
            .client
            .post(&format!("{}/status/{}", vm.path(), action.as_str()), params)
            .await?;
        wait_for_task(&self.client, &upid, &self.poll).await
    }

    // ------------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------------

    /// Cluster nodes that are online, keyed by node name.
    ///
    /// # Errors
    /// Usage error when called as an action.
    pub async fn avail_locations(
        &self,
        call: CallKind,
    ) -> Result<BTreeMap<String, NodeInfo>, CloudError> {
        require_call(call, CallKind::Function, "avail_locations")?;
        self.online_nodes().await
    }

    async fn online_nodes(&self) -> Result<BTreeMap<String, NodeInfo>, CloudError> {
        let nodes: Vec<NodeInfo> = self.client.get("nodes", &Params::new()).await?;

        let mut ret = BTreeMap::new();
        for node in nodes {
            if node.is_online() {
                ret.insert(node.node.clone(), node);
            } else {
                warn!(
                    node = %node.node,
                    status = ?node.status,
                    "Ignoring Proxmox node because it is not online"
                );
            }
        }
        Ok(ret)
    }

    /// Templates, disk images and ISOs on every online node.
    ///
    /// Reads the `storage` param, defaulting to `local`.
    ///
    /// # Errors
    /// Usage error when called as an action.
    pub async fn avail_images(
        &self,
        call: CallKind,
        params: &Params,
    ) -> Result<ImageCatalog, CloudError> {
        require_call(call, CallKind::Function, "avail_images")?;

        let storage = params
            .get("storage")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_STORAGE);

        let mut ret = ImageCatalog::new();
        for location in self.online_nodes().await?.into_keys() {
            let content: Vec<StorageContent> = self
                .client
                .get(&format!("nodes/{location}/storage/{storage}/content"), &Params::new())
                .await?;

            let images = content
                .into_iter()
                .filter(StorageContent::is_image)
                .map(|item| (item.volid.clone(), item))
                .collect();
            ret.insert(location, images);
        }
        Ok(ret)
    }

    /// Compact listing of every managed VM, keyed by name.
    ///
    /// # Errors
    /// Usage error when called as an action.
    pub async fn list_nodes(
        &self,
        call: CallKind,
    ) -> Result<BTreeMap<String, NodeSummary>, CloudError> {
        require_call(call, CallKind::Function, "list_nodes")?;
        Ok(self
            .nodes_full()
            .await?
            .into_iter()
            .map(|(name, details)| (name, details.summary()))
            .collect())
    }

    /// Every managed VM with its configuration, keyed by name.
    ///
    /// # Errors
    /// Usage error when called as an action.
    pub async fn list_nodes_full(
        &self,
        call: CallKind,
    ) -> Result<BTreeMap<String, VmDetails>, CloudError> {
        require_call(call, CallKind::Function, "list_nodes_full")?;
        self.nodes_full().await
    }

    /// The selected fields of every managed VM, keyed by name.
    ///
    /// # Errors
    /// Usage error when called as an action.
    pub async fn list_nodes_select(
        &self,
        call: CallKind,
        fields: &[String],
    ) -> Result<BTreeMap<String, Params>, CloudError> {
        require_call(call, CallKind::Function, "list_nodes_select")?;

        let mut ret = BTreeMap::new();
        for (name, details) in self.nodes_full().await? {
            let Value::Object(all) = serde_json::to_value(&details)? else {
                continue;
            };
            let selected = all
                .into_iter()
                .filter(|(key, _)| fields.iter().any(|f| f == key))
                .collect();
            ret.insert(name, selected);
        }
        Ok(ret)
    }

    async fn nodes_full(&self) -> Result<BTreeMap<String, VmDetails>, CloudError> {
        let vms = locator::list_vms(&self.client).await?;

        let mut ret = BTreeMap::new();
        for vm in vms {
            let config: Params = self
                .client
                .get(&format!("{}/config", vm.path()), &Params::new())
                .await?;
            ret.insert(vm.name.clone(), VmDetails::new(vm, config));
        }
        Ok(ret)
    }

    /// Full details of one VM.
    ///
    /// # Errors
    /// Usage error unless called as an action; `NotFound` for an unknown VM.
    pub async fn show_instance(&self, call: CallKind, name: &str) -> Result<VmDetails, CloudError> {
        require_call(call, CallKind::Action, "show_instance")?;
        self.instance_details(name).await
    }

    async fn instance_details(&self, name: &str) -> Result<VmDetails, CloudError> {
        self.nodes_full()
            .await?
            .remove(name)
            .ok_or_else(|| {
                CloudError::NotFound(format!(
                    "The specified VM named '{name}' could not be found."
                ))
            })
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Invoke an operation by name as a function.
    ///
    /// `list_nodes_select` reads a comma separated `selection` param.
    ///
    /// # Errors
    /// Usage error for unknown operations or operations that are actions.
    pub async fn call_function(&self, function: &str, params: Params) -> Result<Value, CloudError> {
        let call = CallKind::Function;
        let value = match function {
            "clone" => serde_json::to_value(self.clone_vm(call, params).await?)?,
            "avail_locations" => serde_json::to_value(self.avail_locations(call).await?)?,
            "avail_images" => serde_json::to_value(self.avail_images(call, &params).await?)?,
            "list_nodes" => serde_json::to_value(self.list_nodes(call).await?)?,
            "list_nodes_full" => serde_json::to_value(self.list_nodes_full(call).await?)?,
            "list_nodes_select" => {
                let fields = selection(&params);
                serde_json::to_value(self.list_nodes_select(call, &fields).await?)?
            }
            "reconfigure" | "destroy" | "show_instance" | "start" | "stop" | "shutdown" => {
                self.call_action_as(call, function, "", params).await?
            }
            other => return Err(CloudError::Usage(format!("Unknown function '{other}'"))),
        };
        Ok(value)
    }

    /// Invoke an operation by name as an action on `name`.
    ///
    /// # Errors
    /// Usage error for unknown operations or operations that are functions.
    pub async fn call_action(
        &self,
        action: &str,
        name: &str,
        params: Params,
    ) -> Result<Value, CloudError> {
        self.call_action_as(CallKind::Action, action, name, params).await
    }

    async fn call_action_as(
        &self,
        call: CallKind,
        action: &str,
        name: &str,
        params: Params,
    ) -> Result<Value, CloudError> {
        let value = match action {
            "reconfigure" => serde_json::to_value(self.reconfigure(call, name, params).await?)?,
            "destroy" => serde_json::to_value(self.destroy(call, name, params).await?)?,
            "show_instance" => serde_json::to_value(self.show_instance(call, name).await?)?,
            "start" => serde_json::to_value(self.start(call, name, params).await?)?,
            "stop" => serde_json::to_value(self.stop(call, name, params).await?)?,
            "shutdown" => serde_json::to_value(self.shutdown(call, name, params).await?)?,
            "clone" => serde_json::to_value(self.clone_vm(call, params).await?)?,
            "avail_locations" => serde_json::to_value(self.avail_locations(call).await?)?,
            "avail_images" => serde_json::to_value(self.avail_images(call, &params).await?)?,
            "list_nodes" => serde_json::to_value(self.list_nodes(call).await?)?,
            "list_nodes_full" => serde_json::to_value(self.list_nodes_full(call).await?)?,
            "list_nodes_select" => serde_json::to_value(self.list_nodes_select(call, &[]).await?)?,
            other => return Err(CloudError::Usage(format!("Unknown action '{other}'"))),
        };
        Ok(value)
    }
}

/// Fields named by a comma separated `selection` param.
fn selection(params: &Params) -> Vec<String> {
    params
        .get("selection")
        .and_then(Value::as_str)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_call_messages() {
        assert!(require_call(CallKind::Action, CallKind::Action, "start").is_ok());

        let err = require_call(CallKind::Function, CallKind::Action, "start").unwrap_err();
        assert_eq!(err.to_string(), "The start action must be called as an action.");

        let err = require_call(CallKind::Action, CallKind::Function, "clone").unwrap_err();
        assert_eq!(err.to_string(), "The clone function must be called as a function.");
    }

    #[test]
    fn test_power_action_target_state() {
        assert_eq!(PowerAction::Start.target_state(), "running");
        assert_eq!(PowerAction::Stop.target_state(), "stopped");
        assert_eq!(PowerAction::Shutdown.target_state(), "stopped");
        assert_eq!(PowerAction::Shutdown.as_str(), "shutdown");
    }

    #[test]
    fn test_vm_details_from_resource() {
        let resource: VmResource = serde_json::from_value(json!({
            "vmid": 100,
            "status": "stopped",
            "name": "my-proxmox-vm",
            "node": "proxmox",
            "type": "lxc"
        }))
        .unwrap();
        let config = json!({
            "ostype": "ubuntu",
            "hostname": "my-proxmox-vm",
            "net0": "name=eth0,bridge=vmbr0,hwaddr=BA:F9:3B:F7:9E:A7,ip=192.168.1.2/24,type=veth"
        });

        let details = VmDetails::new(resource, config.as_object().unwrap().clone());
        assert_eq!(details.id, "100");
        assert_eq!(details.state, "stopped");
        assert_eq!(details.private_ips, vec!["192.168.1.2"]);
        assert!(details.public_ips.is_empty());

        let summary = serde_json::to_value(details.summary()).unwrap();
        assert_eq!(
            summary,
            json!({
                "id": "100",
                "image": "",
                "private_ips": ["192.168.1.2"],
                "public_ips": [],
                "size": "",
                "state": "stopped"
            })
        );
    }

    #[test]
    fn test_selection_param() {
        let params = json!({"selection": "id, state,,private_ips"});
        assert_eq!(
            selection(params.as_object().unwrap()),
            vec!["id", "state", "private_ips"]
        );
        assert!(selection(&Params::new()).is_empty());
    }
}
