//! Proxmox VE REST API access.
//!
//! A thin authenticated client plus the handful of response models the
//! driver needs. Everything is addressed relative to `/api2/json`.

mod client;
mod models;
mod upid;

pub use client::ProxmoxClient;
pub use models::*;
pub use upid::Upid;
