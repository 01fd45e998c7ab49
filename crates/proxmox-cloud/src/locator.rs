//! VM lookup against the live cluster inventory.
//!
//! There is no server-side filter by name, so every lookup fetches the full
//! `cluster/resources` listing and scans it in order. Duplicate names are not
//! deduplicated: the first match wins.

use serde_json::Value;
use tracing::debug;

use crate::api::{ProxmoxClient, VmResource};
use crate::error::CloudError;
use crate::params::Params;

/// Fetch every guest in the cluster, in listing order.
///
/// # Errors
/// Returns error if the API request fails.
pub async fn list_vms(client: &ProxmoxClient) -> Result<Vec<VmResource>, CloudError> {
    let mut params = Params::new();
    params.insert("type".into(), Value::String("vm".into()));
    client.get("cluster/resources", &params).await
}

/// First guest named `name`.
#[must_use]
pub fn first_by_name<'a>(vms: &'a [VmResource], name: &str) -> Option<&'a VmResource> {
    vms.iter().find(|vm| vm.name == name)
}

/// The guest with id `vmid`.
#[must_use]
pub fn first_by_id(vms: &[VmResource], vmid: u32) -> Option<&VmResource> {
    vms.iter().find(|vm| vm.vmid == vmid)
}

/// Resolve a guest by name.
///
/// # Errors
/// Returns `NotFound` if no guest has that name.
pub async fn find_by_name(client: &ProxmoxClient, name: &str) -> Result<VmResource, CloudError> {
    let vms = list_vms(client).await?;
    debug!(name = %name, candidates = vms.len(), "Resolving VM by name");

    first_by_name(&vms, name)
        .cloned()
        .ok_or_else(|| {
            CloudError::NotFound(format!(
                "The specified VM with name '{name}' could not be found."
            ))
        })
}

/// Resolve a guest by numeric id.
///
/// # Errors
/// Returns `NotFound` if no guest has that id.
pub async fn find_by_id(client: &ProxmoxClient, vmid: u32) -> Result<VmResource, CloudError> {
    let vms = list_vms(client).await?;
    debug!(vmid, candidates = vms.len(), "Resolving VM by id");

    first_by_id(&vms, vmid)
        .cloned()
        .ok_or_else(|| {
            CloudError::NotFound(format!(
                "The specified VM with vmid '{vmid}' could not be found."
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vm(vmid: u32, name: &str) -> VmResource {
        serde_json::from_value(json!({
            "vmid": vmid, "name": name, "node": "pve1", "type": "qemu", "status": "running"
        }))
        .unwrap()
    }

    async fn serve_inventory(server: &MockServer, inventory: serde_json::Value) -> ProxmoxClient {
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/resources"))
            .and(query_param("type", "vm"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": inventory})))
            .mount(server)
            .await;

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
    fn test_first_by_name_preserves_listing_order() {
        let vms = vec![vm(300, "other"), vm(100, "dup"), vm(200, "dup")];
        assert_eq!(first_by_name(&vms, "dup").unwrap().vmid, 100);
        assert!(first_by_name(&vms, "missing").is_none());
        assert_eq!(first_by_id(&vms, 200).unwrap().name, "dup");
    }

    #[tokio::test]
    async fn test_find_by_name_returns_first_duplicate() {
        let server = MockServer::start().await;
        let client = serve_inventory(
            &server,
            json!([
                {"vmid": 100, "name": "duplicate name vm", "node": "pve1", "type": "lxc"},
                {"vmid": 200, "name": "duplicate name vm", "node": "pve2", "type": "lxc"}
            ]),
        )
        .await;

        let found = find_by_name(&client, "duplicate name vm").await.unwrap();
        assert_eq!(found.vmid, 100);
        assert_eq!(found.node, "pve1");
    }

    #[tokio::test]
    async fn test_find_by_name_not_found() {
        let server = MockServer::start().await;
        let client = serve_inventory(&server, json!([])).await;

        let err = find_by_name(&client, "my-proxmox-vm").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_by_id() {
        let server = MockServer::start().await;
        let client = serve_inventory(
            &server,
            json!([{"vmid": 100, "name": "my-proxmox-vm", "node": "pve1", "type": "qemu"}]),
        )
        .await;

        assert_eq!(find_by_id(&client, 100).await.unwrap().name, "my-proxmox-vm");
        assert!(find_by_id(&client, 101).await.unwrap_err().is_not_found());
    }
}
