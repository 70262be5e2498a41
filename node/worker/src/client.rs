use nectar_common::{Job, Worker};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The dispatcher answered with an error envelope
    #[error("dispatcher rejected request ({status}, {reason}): {message}")]
    Rejected {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("dispatcher unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected dispatcher response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Machine-readable reason of a rejection
    pub fn reason(&self) -> Option<&str> {
        match self {
            ClientError::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: String,
    message: String,
}

/// HTTP client for the dispatcher's worker-facing endpoints
#[derive(Debug, Clone)]
pub struct DispatcherClient {
    client: reqwest::Client,
    base_url: String,
}

impl DispatcherClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Subscription endpoint derived from the HTTP base URL
    pub fn ws_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|r| format!("wss://{}", r))
            .or_else(|| self.base_url.strip_prefix("http://").map(|r| format!("ws://{}", r)))
            .unwrap_or_else(|| format!("ws://{}", self.base_url));
        format!("{}/ws", rest)
    }

    pub async fn register(&self, address: &str, metadata: &Value) -> Result<Worker> {
        self.post("/api/workers", json!({ "address": address, "metadata": metadata }))
            .await
    }

    pub async fn heartbeat(&self, address: &str) -> Result<()> {
        let _: Value = self
            .post(&format!("/api/workers/{}/heartbeat", address), Value::Null)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, address: &str, online: bool) -> Result<Worker> {
        self.post(&format!("/api/workers/{}/status", address), json!({ "online": online }))
            .await
    }

    pub async fn start(&self, job_id: &str, address: &str) -> Result<Job> {
        self.post(&format!("/api/jobs/{}/start", job_id), json!({ "worker": address }))
            .await
    }

    pub async fn complete(&self, job_id: &str, address: &str, fingerprint: &str) -> Result<Job> {
        self.post(
            &format!("/api/jobs/{}/complete", job_id),
            json!({ "worker": address, "result_fingerprint": fingerprint }),
        )
        .await
    }

    pub async fn fail(&self, job_id: &str, address: &str, error: &str) -> Result<Job> {
        self.post(
            &format!("/api/jobs/{}/fail", job_id),
            json!({ "worker": address, "error": error }),
        )
        .await
    }

    pub async fn job(&self, job_id: &str) -> Result<Job> {
        let response = self
            .client
            .get(format!("{}/api/jobs/{}", self.base_url, job_id))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let mut request = self.client.post(format!("{}{}", self.base_url, path));
        if !body.is_null() {
            request = request.json(&body);
        }
        Self::parse_response(request.send().await?).await
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let bytes = response.bytes().await?;
        let envelope = serde_json::from_slice::<Envelope>(&bytes).map_err(|e| {
            ClientError::Decode(format!("{} (HTTP {}): {}", e, status, String::from_utf8_lossy(&bytes)))
        })?;
        unwrap_envelope(status, envelope)
    }
}

fn unwrap_envelope<T: DeserializeOwned>(status: StatusCode, envelope: Envelope) -> Result<T> {
    if envelope.success && status.is_success() {
        return serde_json::from_value(envelope.data).map_err(|e| ClientError::Decode(e.to_string()));
    }
    let (reason, message) = match envelope.error {
        Some(ErrorBody { reason, message }) => (reason, message),
        None => ("unknown".to_string(), format!("HTTP {}", status)),
    };
    Err(ClientError::Rejected {
        status: status.as_u16(),
        reason,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(raw: &str) -> Envelope {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn ws_url_follows_scheme() {
        let plain = DispatcherClient::new("http://127.0.0.1:3001/", Duration::from_secs(1)).unwrap();
        assert_eq!(plain.ws_url(), "ws://127.0.0.1:3001/ws");

        let tls = DispatcherClient::new("https://dispatch.example", Duration::from_secs(1)).unwrap();
        assert_eq!(tls.ws_url(), "wss://dispatch.example/ws");
    }

    #[test]
    fn success_envelope_yields_data() {
        let value: Value = unwrap_envelope(
            StatusCode::OK,
            envelope(r#"{"success": true, "data": {"status": "ok"}}"#),
        )
        .unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn error_envelope_keeps_reason() {
        let err = unwrap_envelope::<Value>(
            StatusCode::CONFLICT,
            envelope(r#"{"success": false, "error": {"reason": "not_assigned", "message": "job 1 is not assigned to W2"}}"#),
        )
        .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(err.reason(), Some("not_assigned"));
    }

    #[test]
    fn error_without_body_is_still_a_rejection() {
        let err = unwrap_envelope::<Value>(StatusCode::BAD_GATEWAY, envelope(r#"{"success": false}"#)).unwrap_err();
        assert_eq!(err.reason(), Some("unknown"));
    }
}
