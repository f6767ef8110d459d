//! Authenticated HTTP client for the backend's control plane
//!
//! A client is bound to one endpoint snapshot. Building one before the
//! backend has a port is allowed; every call then fails with
//! [`ControlPlaneError::BackendNotStarted`] without touching the network.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tether_core::error::ControlPlaneError;

/// Authorization scheme expected by the backend
const AUTH_SCHEME: &str = "Convex";

#[derive(Debug, Serialize)]
struct EnvChange<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateEnvRequest<'a> {
    changes: Vec<EnvChange<'a>>,
}

#[derive(Debug, Serialize)]
struct FunctionRequest<'a> {
    path: &'a str,
    format: &'static str,
    args: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct FunctionResponse {
    #[serde(default)]
    value: Value,
}

/// Control-plane client for one backend endpoint
#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: Option<String>,
    admin_key: String,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    /// Bind to the backend on `port` (loopback), if it has one
    pub fn new(port: Option<u16>, admin_key: impl Into<String>) -> Self {
        Self::with_base_url(port.map(|p| format!("http://127.0.0.1:{}", p)), admin_key)
    }

    /// Bind to an explicit base URL
    pub fn with_base_url(base_url: Option<String>, admin_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            admin_key: admin_key.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    fn url(&self, path: &str) -> Result<String, ControlPlaneError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or(ControlPlaneError::BackendNotStarted)?;
        Ok(format!("{}{}", base, path))
    }

    fn authorization(&self) -> String {
        format!("{} {}", AUTH_SCHEME, self.admin_key)
    }

    /// Set one environment variable on the backend
    pub async fn set_env(&self, name: &str, value: &str) -> Result<(), ControlPlaneError> {
        self.set_envs([(name, value)]).await
    }

    /// Set several environment variables in one request
    pub async fn set_envs<'a, I>(&self, changes: I) -> Result<(), ControlPlaneError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let url = self.url("/api/v1/update_environment_variables")?;
        let body = UpdateEnvRequest {
            changes: changes
                .into_iter()
                .map(|(name, value)| EnvChange { name, value })
                .collect(),
        };
        tracing::debug!("Setting {} environment variable(s)", body.changes.len());

        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    /// Invoke a deployed function and return its `value`
    pub async fn run_function(
        &self,
        name: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, ControlPlaneError> {
        let url = self.url("/api/function")?;
        tracing::debug!("Running function {}", name);

        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&FunctionRequest {
                path: name,
                format: "json",
                args,
            })
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: FunctionResponse = response.json().await?;
        Ok(body.value)
    }

    /// Fetch the backend version string (unauthenticated)
    pub async fn version(&self) -> Result<String, ControlPlaneError> {
        let url = self.url("/version")?;
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?.trim().to_string())
    }
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("base_url", &self.base_url)
            .field("admin_key", &"<redacted>")
            .finish()
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ControlPlaneError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_env_without_port() {
        let client = ControlPlaneClient::new(None, "key");
        let err = client.set_env("A", "1").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::BackendNotStarted));
    }

    #[tokio::test]
    async fn test_run_function_without_port() {
        let client = ControlPlaneClient::new(None, "key");
        let err = client.run_function("init:seed", &Map::new()).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::BackendNotStarted));
    }

    #[test]
    fn test_base_url() {
        let client = ControlPlaneClient::new(Some(3210), "key");
        assert_eq!(client.base_url(), Some("http://127.0.0.1:3210"));

        let client =
            ControlPlaneClient::with_base_url(Some("http://localhost:9/".to_string()), "key");
        assert_eq!(client.base_url(), Some("http://localhost:9"));
    }

    #[test]
    fn test_authorization_header() {
        let client = ControlPlaneClient::new(Some(1), "local|0102");
        assert_eq!(client.authorization(), "Convex local|0102");
    }

    #[test]
    fn test_debug_redacts_key() {
        let client = ControlPlaneClient::new(Some(1), "local|secret");
        assert!(!format!("{:?}", client).contains("secret"));
    }

    #[test]
    fn test_request_shapes() {
        let body = UpdateEnvRequest {
            changes: vec![EnvChange {
                name: "A",
                value: "1",
            }],
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"changes": [{"name": "A", "value": "1"}]})
        );

        let mut args = Map::new();
        args.insert("count".to_string(), Value::from(3));
        let body = FunctionRequest {
            path: "init:seed",
            format: "json",
            args: &args,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"path": "init:seed", "format": "json", "args": {"count": 3}})
        );
    }
}
