//! Proxmox VE cloud driver.
//!
//! Provisions, inspects, reconfigures, powers and destroys LXC containers
//! and QEMU virtual machines through the Proxmox VE REST API, on behalf of
//! an orchestration framework that supplies profiles, event publishing and
//! guest bootstrap.
//!
//! # Example
//!
//! ```rust,ignore
//! use proxmox_cloud::{CallKind, CloudConfig, ProxmoxClient, ProxmoxDriver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CloudConfig::load("cloud.yaml".as_ref())?;
//!     let client = ProxmoxClient::new(config.provider("proxmox")?)?;
//!     let driver = ProxmoxDriver::new(client);
//!
//!     // Create, start and bootstrap a VM from a profile
//!     let profile = config.profile("small-lxc", "web-01")?;
//!     driver.create(&profile).await?;
//!
//!     // Power it off again
//!     driver.stop(CallKind::Action, "web-01", Default::default()).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod ips;
pub mod locator;
pub mod params;
pub mod retry;
pub mod tasks;

pub use api::{ProxmoxClient, Technology, Upid, VmResource};
pub use config::{CloudConfig, Credentials, Profile, ProviderConfig};
pub use driver::{ActionResult, CallKind, NodeSummary, ProxmoxDriver, VmDetails};
pub use error::{CloudError, ErrorKind};
pub use hooks::{Bootstrapper, EventSink, LifecycleEvent, SshBootstrap};
pub use params::Params;
