//! Provider and profile configuration.
//!
//! Configuration lives in a YAML file with named provider instances and VM
//! profiles:
//!
//! ```yaml
//! providers:
//!   my-proxmox:
//!     host: pve.example.com
//!     user: root@pam
//!     token_name: automation
//!     token_value: 00000000-0000-0000-0000-000000000000
//!
//! profiles:
//!   web:
//!     provider: my-proxmox
//!     technology: lxc
//!     create:
//!       node: pve1
//!       vmid: 200
//!       ostemplate: local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::api::Technology;
use crate::error::CloudError;
use crate::params::Params;

/// Default PVE API port.
pub const DEFAULT_PORT: u16 = 8006;

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Provider name used when none is selected.
pub const DEFAULT_PROVIDER: &str = "proxmox";

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Connection settings for one named provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Hostname, or an absolute `http(s)://` URL.
    pub host: String,
    /// API port, used when `host` is a bare hostname.
    #[serde(default)]
    pub port: Option<u16>,
    /// User including realm, e.g. `root@pam`.
    pub user: String,
    /// API token id.
    #[serde(default)]
    pub token_name: Option<String>,
    /// API token secret.
    #[serde(default)]
    pub token_value: Option<String>,
    /// Password for ticket authentication.
    #[serde(default)]
    pub password: Option<String>,
    /// Verify the server certificate.
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential material derived from a provider config.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Long-lived API token.
    Token {
        user: String,
        token_name: String,
        token_value: String,
    },
    /// Username and password exchanged for a session ticket.
    Password { user: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token {
                user, token_name, ..
            } => f
                .debug_struct("Token")
                .field("user", user)
                .field("token_name", token_name)
                .finish_non_exhaustive(),
            Self::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

impl ProviderConfig {
    /// Config for an API-token login.
    #[must_use]
    pub fn with_token(
        host: impl Into<String>,
        user: impl Into<String>,
        token_name: impl Into<String>,
        token_value: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: user.into(),
            token_name: Some(token_name.into()),
            token_value: Some(token_value.into()),
            password: None,
            verify_ssl: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Config for a password (ticket) login.
    #[must_use]
    pub fn with_password(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: user.into(),
            token_name: None,
            token_value: None,
            password: Some(password.into()),
            verify_ssl: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Whether host, user and a complete credential are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && !self.user.trim().is_empty() && self.credentials().is_ok()
    }

    /// Credentials to authenticate with. Tokens win over passwords.
    ///
    /// # Errors
    /// Returns a config error if neither a token pair nor a password is set.
    pub fn credentials(&self) -> Result<Credentials, CloudError> {
        match (&self.token_name, &self.token_value, &self.password) {
            (Some(token_name), Some(token_value), _) => Ok(Credentials::Token {
                user: self.user.clone(),
                token_name: token_name.clone(),
                token_value: token_value.clone(),
            }),
            (_, _, Some(password)) => Ok(Credentials::Password {
                user: self.user.clone(),
                password: password.clone(),
            }),
            _ => Err(CloudError::Config(format!(
                "provider for user '{}' needs token_name and token_value, or password",
                self.user
            ))),
        }
    }

    /// Base URL of the JSON API, ending in `/api2/json`.
    ///
    /// # Errors
    /// Returns a config error if the host does not form a valid URL.
    pub fn api_url(&self) -> Result<Url, CloudError> {
        let host = self.host.trim().trim_end_matches('/');
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/api2/json")
        } else {
            let port = self.port.unwrap_or(DEFAULT_PORT);
            format!("https://{host}:{port}/api2/json")
        };

        Url::parse(&base).map_err(|e| CloudError::Config(format!("Invalid host '{host}': {e}")))
    }
}

/// A VM profile as handed to `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Name of the VM to create.
    #[serde(default)]
    pub name: String,
    /// Name of the profile this VM was rendered from.
    #[serde(default)]
    pub profile: Option<String>,
    /// Provider instance name.
    #[serde(default)]
    pub provider: Option<String>,
    /// Driver name.
    #[serde(default)]
    pub driver: Option<String>,
    /// Virtualization kind.
    #[serde(default)]
    pub technology: Option<Technology>,
    /// Parameters for direct creation; must include `node`.
    #[serde(default)]
    pub create: Option<Params>,
    /// Parameters for cloning; must include the source `vmid`.
    #[serde(default)]
    pub clone: Option<Params>,
    /// Address the bootstrapper connects to.
    #[serde(default)]
    pub ssh_host: Option<String>,
    /// SSH login user.
    #[serde(default)]
    pub ssh_username: Option<String>,
    /// SSH login password.
    #[serde(default)]
    pub ssh_password: Option<String>,
    /// Any other profile keys, passed on to the bootstrapper.
    #[serde(flatten)]
    pub extra: Params,
}

impl Profile {
    /// Profile name for messages, falling back to the VM name.
    #[must_use]
    pub fn profile_name(&self) -> &str {
        self.profile.as_deref().unwrap_or(&self.name)
    }

    /// The identifying subset of the profile attached to lifecycle events.
    #[must_use]
    pub fn event_args(&self) -> Params {
        let mut args = Params::new();
        args.insert("name".into(), Value::String(self.name.clone()));
        for (key, value) in [
            ("profile", &self.profile),
            ("provider", &self.provider),
            ("driver", &self.driver),
        ] {
            if let Some(value) = value {
                args.insert(key.into(), Value::String(value.clone()));
            }
        }
        args
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Named provider instances.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Named VM profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl CloudConfig {
    /// Parse configuration from YAML text.
    ///
    /// # Errors
    /// Returns a config error if the YAML is invalid.
    pub fn from_yaml(contents: &str) -> Result<Self, CloudError> {
        serde_yaml::from_str(contents)
            .map_err(|e| CloudError::Config(format!("Failed to parse configuration: {e}")))
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    /// Returns a config error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, CloudError> {
        debug!(path = %path.display(), "Loading configuration");
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CloudError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }

    /// The named provider, if present and fully configured.
    ///
    /// # Errors
    /// Returns a config error if the provider is unknown or incomplete.
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig, CloudError> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| CloudError::Config(format!("Provider '{name}' is not configured")))?;

        if !provider.is_configured() {
            return Err(CloudError::Config(format!(
                "Provider '{name}' requires host, user and token_name/token_value or password"
            )));
        }

        Ok(provider)
    }

    /// Render the named profile for a VM called `vm_name`.
    ///
    /// # Errors
    /// Returns a config error if the profile does not exist.
    pub fn profile(&self, profile: &str, vm_name: &str) -> Result<Profile, CloudError> {
        let mut rendered = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| CloudError::Config(format!("Profile '{profile}' is not defined")))?;

        rendered.name = vm_name.to_string();
        rendered.profile = Some(profile.to_string());
        Ok(rendered)
    }
}
