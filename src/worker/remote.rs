//! HTTP client for a remote reasoning service
//!
//! One connection-pooled client per endpoint. The service answers a role
//! prompt with a structured opinion payload; anything that does not parse
//! into the typed contract is a worker failure at this boundary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::PipelineError;
use crate::models::{Opinion, WorkerRole};
use crate::worker::{ContextBundle, Worker};
use crate::Result;

/// Reusable remote worker client (connection-pooled)
pub struct RemoteWorker {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RemoteWorker {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    role: WorkerRole,
    context: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    subject: String,
    confidence: f64,
    summary: String,
    #[serde(default)]
    details: serde_json::Value,
}

#[async_trait]
impl Worker for RemoteWorker {
    async fn invoke(&self, role: WorkerRole, context: &ContextBundle) -> Result<Opinion> {
        if self.api_key.is_empty() {
            return Err(PipelineError::WorkerFailure {
                role,
                reason: "reasoning service API key not configured".to_string(),
            });
        }

        let url = format!("{}/v1/invoke", self.base_url);
        let body = InvokeRequest {
            role,
            context: &context.as_value(),
        };

        info!(role = %role, "Calling reasoning service");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(role = %role, error = %e, "Reasoning service request failed");
                PipelineError::WorkerFailure {
                    role,
                    reason: e.to_string(),
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(role = %role, %status, "Reasoning service error response");
            return Err(PipelineError::WorkerFailure {
                role,
                reason: format!("{}: {}", status, error_text),
            });
        }

        let parsed: InvokeResponse = response.json().await.map_err(|e| {
            error!(role = %role, error = %e, "Failed to parse reasoning service response");
            PipelineError::WorkerFailure {
                role,
                reason: format!("malformed response: {}", e),
            }
        })?;

        info!(role = %role, confidence = parsed.confidence, "Opinion received");

        Ok(Opinion::new(role, parsed.subject, parsed.confidence)
            .with_summary(parsed.summary)
            .with_details(parsed.details))
    }
}
