//! Proxmox VE API client implementation.
//!
//! API Documentation: <https://pve.proxmox.com/pve-docs/api-viewer/>

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::COOKIE;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use url::Url;

use super::models::{ApiErrorBody, ApiResponse, TicketData};
use crate::config::{Credentials, ProviderConfig, DEFAULT_TIMEOUT_SECS};
use crate::error::CloudError;
use crate::params::{to_query, Params};

/// Header carrying the CSRF token on ticket-authenticated writes.
const CSRF_HEADER: &str = "CSRFPreventionToken";

/// Authenticated client for one Proxmox VE cluster.
#[derive(Clone)]
pub struct ProxmoxClient {
    /// HTTP client.
    client: Client,
    /// Base URL ending in `/api2/json`.
    base_url: Url,
    /// Credential material.
    credentials: Credentials,
    /// Session ticket, acquired on first use for password logins.
    session: Arc<OnceCell<TicketData>>,
}

impl ProxmoxClient {
    /// Create a client from a provider config.
    ///
    /// # Errors
    /// Returns error if the config is incomplete or the HTTP client cannot be created.
    pub fn new(config: &ProviderConfig) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url()?,
            credentials: config.credentials()?,
            session: Arc::new(OnceCell::new()),
        })
    }

    /// Create a client against an explicit base URL.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_base_url(base_url: Url, credentials: Credentials) -> Result<Self, CloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url,
            credentials,
            session: Arc::new(OnceCell::new()),
        })
    }

    /// Base URL of the JSON API.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Make an authenticated GET request; params go in the query string.
    ///
    /// # Errors
    /// Returns error if the request fails or the API reports an error.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &Params,
    ) -> Result<T, CloudError> {
        self.request(Method::GET, path, params).await
    }

    /// Make an authenticated POST request; params go in the JSON body.
    ///
    /// # Errors
    /// Returns error if the request fails or the API reports an error.
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &Params,
    ) -> Result<T, CloudError> {
        self.request(Method::POST, path, params).await
    }

    /// Make an authenticated PUT request; params go in the JSON body.
    ///
    /// # Errors
    /// Returns error if the request fails or the API reports an error.
    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &Params,
    ) -> Result<T, CloudError> {
        self.request(Method::PUT, path, params).await
    }

    /// Make an authenticated DELETE request; params go in the query string.
    ///
    /// # Errors
    /// Returns error if the request fails or the API reports an error.
    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &Params,
    ) -> Result<T, CloudError> {
        self.request(Method::DELETE, path, params).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &Params,
    ) -> Result<T, CloudError> {
        let url = self.url(path)?;
        debug!(method = %method, url = %url, "API request");

        let mut request = self.client.request(method.clone(), url);
        request = self.authorize(request, &method).await?;

        if method == Method::GET || method == Method::DELETE {
            if !params.is_empty() {
                request = request.query(&to_query(params));
            }
        } else {
            request = request.json(params);
        }

        let response = request.send().await?;
        self.handle_response(&method, path, response).await
    }

    /// Attach credentials to a request.
    async fn authorize(
        &self,
        request: RequestBuilder,
        method: &Method,
    ) -> Result<RequestBuilder, CloudError> {
        match &self.credentials {
            Credentials::Token {
                user,
                token_name,
                token_value,
            } => Ok(request.header(
                "Authorization",
                format!("PVEAPIToken={user}!{token_name}={token_value}"),
            )),
            Credentials::Password { .. } => {
                let session = self.session.get_or_try_init(|| self.login()).await?;
                let request = request.header(COOKIE, format!("PVEAuthCookie={}", session.ticket));
                if *method == Method::GET {
                    Ok(request)
                } else {
                    Ok(request.header(CSRF_HEADER, &session.csrf_token))
                }
            }
        }
    }

    /// Exchange username and password for a session ticket.
    async fn login(&self) -> Result<TicketData, CloudError> {
        let Credentials::Password { user, password } = &self.credentials else {
            return Err(CloudError::Config("ticket login requires a password".into()));
        };

        info!(user = %user, "Requesting session ticket");
        let response = self
            .client
            .post(self.url("access/ticket")?)
            .form(&[("username", user.as_str()), ("password", password.as_str())])
            .send()
            .await?;

        self.handle_response(&Method::POST, "access/ticket", response)
            .await
    }

    /// Handle API response, unwrapping the `data` envelope or reporting the error.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str::<ApiResponse<T>>(&text)
                .map(|envelope| envelope.data)
                .map_err(|e| {
                    warn!(error = %e, body = %text, "Failed to parse response");
                    CloudError::Serialization(e)
                });
        }

        let reason = status.canonical_reason().unwrap_or("Unknown Error").to_string();
        error!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            reason = %reason,
            body = %text,
            "Proxmox API request failed"
        );

        Err(CloudError::Api {
            status: status.as_u16(),
            reason,
            message: error_detail(&text),
        })
    }

    fn url(&self, path: &str) -> Result<Url, CloudError> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| CloudError::Config(format!("Invalid API path '{path}': {e}")))
    }
}

/// Pull the most specific message out of an error body.
fn error_detail(body: &str) -> String {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    parsed
        .errors
        .map(|errors| Value::Object(errors).to_string())
        .or(parsed.message)
        .unwrap_or_else(|| body.trim().to_string())
}
