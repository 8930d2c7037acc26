//! API client for the fabric controller

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

/// Non-success answer from the controller
#[derive(Debug, Error)]
#[error("API error ({status}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

/// API client for the controller HTTP API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        // Health endpoints answer 503 with a regular body
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(ApiError {
                status: status.as_u16(),
                message,
            }
            .into());
        }

        let body = response.text().await.context("Failed to read response")?;
        match serde_json::from_str(&body) {
            Ok(value) => Ok(value),
            Err(_) if !status.is_success() => Err(ApiError {
                status: status.as_u16(),
                message: body,
            }
            .into()),
            Err(e) => Err(e).context("Failed to parse response"),
        }
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        self.get("api/v1/snapshot").await
    }

    pub async fn placements(&self) -> Result<BTreeMap<String, String>> {
        self.get("api/v1/placements").await
    }

    pub async fn slices(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.get("api/v1/slices").await
    }

    pub async fn routes(&self, dpid: Option<u16>) -> Result<Vec<RouteRule>> {
        match dpid {
            Some(dpid) => self.get(&format!("api/v1/routes?dpid={}", dpid)).await,
            None => self.get("api/v1/routes").await,
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("healthz").await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub state: String,
    pub tick: u64,
    pub fat_tree_k: u8,
    pub flows: Vec<Flow>,
    pub congestions: Vec<Congestion>,
    pub switches: Vec<SwitchPorts>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub switch: String,
    pub dpid: u16,
    pub in_pod: u8,
    pub out_pod: u8,
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Congestion {
    pub switch: String,
    pub dpid: u16,
    pub dst_pod: u8,
    pub flow_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchPorts {
    pub switch: String,
    pub dpid: u16,
    pub connected: bool,
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub port_no: u32,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub delta_tx: u64,
    pub delta_rx: u64,
    pub downlink_flow_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutPort {
    Physical(u16),
    Controller,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub switch: u16,
    pub destination: String,
    pub mask: u32,
    pub out_port: OutPort,
    pub idle_timeout_secs: u16,
    pub priority: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
