//! Signed HTTP client for the ticketing service.
//!
//! Every request carries `AppID`, `Randstr`, `Timestamp` and `Signature`
//! headers. The signature is computed per request so credential rotation
//! takes effect immediately.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::ScitixError;
use crate::config::ConfigError;

/// Timeout applied to every call.
const REQUEST_TIMEOUT_SECS: u64 = 10;

const ENV_APP_ID: &str = "AppID";
const ENV_RANDSTR: &str = "Ranstr";
const ENV_TOKEN: &str = "Token";
const ENV_ENDPOINT: &str = "OP_ENDPOINT";

/// `hex(sha256(token || randstr || timestamp))`
pub fn signature(token: &str, randstr: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(randstr.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScitixCredentials {
    pub app_id: String,
    pub randstr: String,
    pub token: String,
}

impl ScitixCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            app_id: required_env(ENV_APP_ID)?,
            randstr: required_env(ENV_RANDSTR)?,
            token: required_env(ENV_TOKEN)?,
        })
    }
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

/// Where credentials come from at request time.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Re-read from the environment on every request
    Env,
    Static(ScitixCredentials),
}

impl CredentialSource {
    fn resolve(&self) -> Result<ScitixCredentials, ConfigError> {
        match self {
            Self::Env => ScitixCredentials::from_env(),
            Self::Static(credentials) => Ok(credentials.clone()),
        }
    }
}

/// Response envelope shared by every endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default = "Vec::new")]
    rows: Vec<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteTicket {
    pub ticket_id: String,
    pub title: String,
    pub status: String,
    pub supervisor: String,
    pub creator: String,
    pub node_name: String,
    #[serde(rename = "nodeSN")]
    pub node_sn: String,
    pub is_hardware_issue: bool,
    pub description: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceInfo {
    pub sn: String,
    pub instance_id: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketRequest {
    pub region: String,
    pub org_name: String,
    pub creator: String,
    pub title: String,
    pub priority: String,
    pub node_name: String,
    #[serde(rename = "nodeSN")]
    pub node_sn: String,
    pub is_hardware_issue: bool,
    pub model: String,
    pub hardware_type: String,
    pub start_time: String,
    pub description: String,
    pub is_from_customer: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveTicketRequest {
    pub ticket_id: String,
    pub answer: String,
    pub operation: String,
    pub finish_time: String,
    pub is_hardware_issue: bool,
}

/// Client for the ticket and instance endpoints.
#[derive(Debug, Clone)]
pub struct ScitixClient {
    client: Client,
    endpoint: String,
    credentials: CredentialSource,
}

impl ScitixClient {
    pub fn new(endpoint: impl Into<String>, credentials: CredentialSource) -> Result<Self, ScitixError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    /// Endpoint from `OP_ENDPOINT`, credentials re-read per request.
    pub fn from_env() -> Result<Self, ScitixError> {
        let endpoint = required_env(ENV_ENDPOINT)?;
        ScitixCredentials::from_env()?;
        Self::new(endpoint, CredentialSource::Env)
    }

    fn signed(&self, request: RequestBuilder) -> Result<RequestBuilder, ScitixError> {
        let credentials = self.credentials.resolve()?;
        let timestamp = chrono::Utc::now().timestamp();
        let signature = signature(&credentials.token, &credentials.randstr, timestamp);

        Ok(request
            .header("AppID", credentials.app_id)
            .header("Randstr", credentials.randstr)
            .header("Timestamp", timestamp.to_string())
            .header("Signature", signature))
    }

    async fn get<T, Q>(&self, path: &str, query: &Q) -> Result<Vec<T>, ScitixError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.endpoint);
        debug!(url = %url, "GET request");
        let request = self.signed(self.client.get(&url).query(query))?;
        Self::handle_response(request.send().await?).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<Vec<T>, ScitixError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.endpoint);
        debug!(url = %url, "POST request");
        let request = self.signed(self.client.post(&url).json(body))?;
        Self::handle_response(request.send().await?).await
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Vec<T>, ScitixError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ScitixError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse<T> = response.json().await?;
        if !body.status {
            return Err(ScitixError::Rejected(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(body.rows)
    }

    /// The one instance registered with `ip`. Rows that carry another
    /// address are ignored; anything but a single match is an error.
    pub async fn instance_info(
        &self,
        region: &str,
        org_name: &str,
        ip: &str,
    ) -> Result<InstanceInfo, ScitixError> {
        if ip.is_empty() {
            return Err(ScitixError::NotFound("instance for an empty address".to_string()));
        }
        let rows: Vec<InstanceInfo> = self
            .get(
                "/api/v1/ces/instance/list",
                &[("region", region), ("orgName", org_name), ("ip", ip)],
            )
            .await?;

        let mut matches = rows
            .into_iter()
            .filter(|row| !row.sn.is_empty() && (row.ip.is_empty() || row.ip == ip));
        match (matches.next(), matches.next()) {
            (Some(info), None) => Ok(info),
            (None, _) => Err(ScitixError::NotFound(format!("instance with ip {ip}"))),
            (Some(_), Some(_)) => Err(ScitixError::AmbiguousInstance {
                ip: ip.to_string(),
                count: 2 + matches.count(),
            }),
        }
    }

    pub async fn create_ticket(
        &self,
        request: &CreateTicketRequest,
    ) -> Result<RemoteTicket, ScitixError> {
        let rows: Vec<RemoteTicket> = self
            .post("/api/v1/support/ticket/create", request)
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ScitixError::NotFound("created ticket".to_string()))
    }

    /// Most recent tickets of a node first.
    pub async fn list_tickets(
        &self,
        region: &str,
        node_sn: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<RemoteTicket>, ScitixError> {
        self.get(
            "/api/v1/support/ticket/list",
            &[
                ("region", region.to_string()),
                ("nodeSN", node_sn.to_string()),
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
            ],
        )
        .await
    }

    pub async fn get_ticket(&self, ticket_id: &str) -> Result<RemoteTicket, ScitixError> {
        let rows: Vec<RemoteTicket> = self
            .get("/api/v1/support/ticket/list", &[("ticketId", ticket_id)])
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| ScitixError::NotFound(format!("ticket {ticket_id}")))
    }

    pub async fn patch_ticket(
        &self,
        ticket_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ScitixError> {
        let _: Vec<serde_json::Value> = self
            .post(
                "/api/v1/support/ticket/patch",
                &serde_json::json!({ "ticketId": ticket_id, "key": key, "value": value }),
            )
            .await?;
        Ok(())
    }

    pub async fn accept_ticket(&self, ticket_id: &str) -> Result<(), ScitixError> {
        let _: Vec<serde_json::Value> = self
            .post(
                "/api/v1/support/ticket/accept",
                &serde_json::json!({ "ticketID": ticket_id, "status": "resolving" }),
            )
            .await?;
        Ok(())
    }

    pub async fn dispatch_ticket(
        &self,
        ticket_id: &str,
        supervisor: &str,
    ) -> Result<(), ScitixError> {
        let _: Vec<serde_json::Value> = self
            .post(
                "/api/v1/support/ticket/dispatch",
                &serde_json::json!({
                    "ticketId": ticket_id,
                    "supervisor": supervisor,
                    "status": "assigned",
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn resolve_ticket(&self, request: &ResolveTicketRequest) -> Result<(), ScitixError> {
        let _: Vec<serde_json::Value> = self
            .post("/api/v1/support/ticket/resolve", request)
            .await?;
        Ok(())
    }

    pub async fn close_ticket(&self, ticket_id: &str) -> Result<(), ScitixError> {
        let _: Vec<serde_json::Value> = self
            .post(
                "/api/v1/support/ticket/close",
                &serde_json::json!({ "ticketId": ticket_id }),
            )
            .await?;
        Ok(())
    }
}
