//! Compute Engine REST client

use super::api::{ApiError, ComputeApi, Image, Instance, InstanceRequest, Operation};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// Environment variable consulted for a bearer token
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// `ComputeApi` over the Compute Engine v1 REST API
pub struct GceClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GceClient {
    /// Create a client with an explicit bearer token
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: COMPUTE_BASE_URL.to_string(),
            token: token.into(),
        })
    }

    /// Create a client, resolving the token from `token`, then
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, then `gcloud auth print-access-token`
    pub async fn from_env(token: Option<&str>) -> anyhow::Result<Self> {
        if let Some(token) = token {
            return Self::new(token);
        }
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                return Self::new(token.trim());
            }
        }

        let output = Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .context("No access token configured and gcloud is not available")?;
        if !output.status.success() {
            anyhow::bail!(
                "gcloud auth print-access-token failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Self::new(String::from_utf8_lossy(&output.stdout).trim())
    }

    /// Point the client at a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Failed to reach compute API")?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!(path = %path, "GET");
        self.send(self.client.get(self.url(path))).await
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .context("Failed to read compute API response")?;

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }

    Ok(serde_json::from_str(&body).context("Failed to decode compute API response")?)
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn get_image(&self, project: &str, image: &str) -> Result<Image, ApiError> {
        self.get(&format!("projects/{project}/global/images/{image}"))
            .await
    }

    async fn get_image_from_family(&self, project: &str, family: &str) -> Result<Image, ApiError> {
        self.get(&format!("projects/{project}/global/images/family/{family}"))
            .await
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        request: &InstanceRequest,
    ) -> Result<Operation, ApiError> {
        let url = self.url(&format!("projects/{project}/zones/{zone}/instances"));
        debug!(instance = %request.name, "POST instances.insert");
        self.send(self.client.post(url).json(request)).await
    }

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<Instance, ApiError> {
        self.get(&format!("projects/{project}/zones/{zone}/instances/{name}"))
            .await
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<Operation, ApiError> {
        let url = self.url(&format!("projects/{project}/zones/{zone}/instances/{name}"));
        debug!(instance = %name, "DELETE instance");
        self.send(self.client.delete(url)).await
    }

    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> Result<Operation, ApiError> {
        self.get(&format!("projects/{project}/zones/{zone}/operations/{operation}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base() {
        let client = GceClient::new("t")
            .unwrap()
            .with_base_url("http://localhost:8080/compute/v1/");
        assert_eq!(
            client.url("projects/p/zones/z/instances"),
            "http://localhost:8080/compute/v1/projects/p/zones/z/instances"
        );
    }

    #[tokio::test]
    async fn explicit_token_wins() {
        let client = GceClient::from_env(Some("abc")).await.unwrap();
        assert_eq!(client.token, "abc");
    }

    #[test]
    fn error_body_message_is_extracted() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"error": {"code": 409, "message": "The resource 'machine-1' already exists"}}"#,
        )
        .unwrap();
        assert!(body.error.message.contains("already exists"));
    }

    #[tokio::test]
    #[ignore = "requires compute API credentials"]
    async fn resolves_public_image_family() {
        let client = GceClient::from_env(None).await.unwrap();
        let image = client
            .get_image_from_family("debian-cloud", "debian-12")
            .await
            .unwrap();
        assert!(image.self_link.contains("debian-12"));
    }
}
