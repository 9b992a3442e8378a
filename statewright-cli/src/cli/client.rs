//! HTTP client for a running statewright server

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use statewright_core::models::{Execution, StateMachineDefinition, TransitionRecord};
use statewright_core::server::api::{
    ExecutionSummary, StartExecutionRequest, StartExecutionResponse, StopRequest,
    TaskFailureRequest, TaskSuccessRequest,
};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Server used when `--server` is not given
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

pub struct ApiClient {
    http: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(server: &str) -> Result<Self> {
        let server = if server.is_empty() { DEFAULT_SERVER } else { server };
        let base_url = Url::parse(server)
            .with_context(|| format!("Invalid server URL: {}", server))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid API path: {}", path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach server at {}", self.base_url))?;
        decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.http.get(self.url(path)?)).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.http.post(self.url(path)?).json(body)).await
    }

    pub async fn list_definitions(&self) -> Result<Vec<String>> {
        let body: Value = self.get("api/v1/definitions").await?;
        serde_json::from_value(body["definitions"].clone())
            .context("Unexpected definitions response")
    }

    /// Register a definition; returns the compiler warnings
    pub async fn put_definition(&self, definition: &StateMachineDefinition) -> Result<Vec<String>> {
        let path = format!("api/v1/definitions/{}", definition.name);
        let request = self.http.put(self.url(&path)?).json(definition);
        let body: Value = self.send(request).await?;
        Ok(serde_json::from_value(body["warnings"].clone()).unwrap_or_default())
    }

    pub async fn start_execution(&self, definition: &str, input: Value) -> Result<Uuid> {
        let request = StartExecutionRequest {
            definition: definition.to_string(),
            input,
        };
        let response: StartExecutionResponse = self.post("api/v1/executions", &request).await?;
        Ok(response.execution_id)
    }

    pub async fn list_executions(&self) -> Result<Vec<ExecutionSummary>> {
        self.get("api/v1/executions").await
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.get(&format!("api/v1/executions/{}", id)).await
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<TransitionRecord>> {
        self.get(&format!("api/v1/executions/{}/history", id)).await
    }

    pub async fn stop_execution(&self, id: Uuid, cause: Option<String>) -> Result<ExecutionSummary> {
        self.post(&format!("api/v1/executions/{}/stop", id), &StopRequest { cause })
            .await
    }

    pub async fn complete_task(&self, token: &str, output: Value) -> Result<()> {
        let _: Value = self
            .post(
                &format!("api/v1/callbacks/{}/success", token),
                &TaskSuccessRequest { output },
            )
            .await?;
        Ok(())
    }

    pub async fn fail_task(&self, token: &str, error: String, cause: String) -> Result<()> {
        let _: Value = self
            .post(
                &format!("api/v1/callbacks/{}/failure", token),
                &TaskFailureRequest { error, cause },
            )
            .await?;
        Ok(())
    }
}

/// Deserialize a success body, or turn the server's `{"error": ..}` into an error
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .context("Failed to decode server response");
    }

    let body: Value = response.json().await.unwrap_or_else(|_| json!({}));
    let message = body["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    anyhow::bail!("Server returned {}: {}", status.as_u16(), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_when_empty() {
        let client = ApiClient::new("").unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn test_paths_join_onto_base() {
        let client = ApiClient::new("http://example.test:9000").unwrap();
        assert_eq!(
            client.url("api/v1/health").unwrap().as_str(),
            "http://example.test:9000/api/v1/health"
        );
    }

    #[test]
    fn test_rejects_invalid_server() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
