//! HTTP client for the node manager's calls into the controller.
//!
//! Shares wire types with the controller's axum handlers
//! (`fleet_core::wire`) so the two processes cannot drift on field names.

use anyhow::{Context, Result, bail};
use fleet_db::models::RunStatus;
use uuid::Uuid;

use fleet_core::wire::{
    AssignedRunsResponse, EventRecord, HeartbeatRequest, HeartbeatResponse, RunBody,
    UpdateRunStatusRequest, UpdateRunStatusResponse,
};

/// Thin `reqwest`-backed client for the `/api/v1/*` surface a node manager
/// calls.
#[derive(Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let url = format!("{}/api/v1/nodes/heartbeat", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .context("failed to send heartbeat")?;
        decode(resp).await
    }

    pub async fn assigned_runs(&self, node_id: &str) -> Result<Vec<RunBody>> {
        let url = format!(
            "{}/api/v1/nodes/{node_id}/runs?status=assigned",
            self.base_url
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to fetch assigned runs")?;
        let body: AssignedRunsResponse = decode(resp).await?;
        Ok(body.runs)
    }

    pub async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        node_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<UpdateRunStatusResponse> {
        let url = format!("{}/api/v1/runs/{run_id}", self.base_url);
        let req = UpdateRunStatusRequest {
            status,
            node_id: node_id.map(str::to_string),
            error: error.map(str::to_string),
        };
        let resp = self
            .http
            .patch(&url)
            .json(&req)
            .send()
            .await
            .context("failed to update run status")?;
        decode(resp).await
    }

    /// Post a batch of events, one JSON object per line, as the controller
    /// expects.
    pub async fn post_events(&self, run_id: Uuid, events: &[EventRecord]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let url = format!("{}/api/v1/runs/{run_id}/events", self.base_url);
        let mut body = String::new();
        for event in events {
            body.push_str(&serde_json::to_string(event).context("failed to encode event")?);
            body.push('\n');
        }
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("failed to post events")?;
        ensure_success(&resp)?;
        Ok(())
    }
}

fn ensure_success(resp: &reqwest::Response) -> Result<()> {
    if !resp.status().is_success() {
        bail!("controller returned {}", resp.status());
    }
    Ok(())
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("controller returned {status}: {body}");
    }
    resp.json::<T>()
        .await
        .context("failed to decode controller response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use fleet_db::models::Labels;

    async fn spawn_test_server() -> String {
        let app = axum::Router::new()
            .route(
                "/api/v1/nodes/heartbeat",
                post(|| async { Json(HeartbeatResponse { accepted: true }) }),
            )
            .route(
                "/api/v1/nodes/{id}/runs",
                get(|| async { Json(AssignedRunsResponse { runs: vec![] }) }),
            )
            .route(
                "/api/v1/runs/{id}",
                axum::routing::patch(|Path(_id): Path<Uuid>| async {
                    Json(UpdateRunStatusResponse {
                        status: RunStatus::Running,
                    })
                }),
            )
            .route(
                "/api/v1/runs/{id}/events",
                post(|| async { axum::http::StatusCode::NO_CONTENT }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn heartbeat_round_trips() {
        let base_url = spawn_test_server().await;
        let client = ControllerClient::new(base_url);
        let resp = client
            .heartbeat(&HeartbeatRequest {
                node_id: "node-a".to_string(),
                labels: Labels::new(),
                max_concurrent: 2,
                running_count: 0,
            })
            .await
            .unwrap();
        assert!(resp.accepted);
    }

    #[tokio::test]
    async fn assigned_runs_returns_empty_list() {
        let base_url = spawn_test_server().await;
        let client = ControllerClient::new(base_url);
        let runs = client.assigned_runs("node-a").await.unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn update_run_status_decodes_response() {
        let base_url = spawn_test_server().await;
        let client = ControllerClient::new(base_url);
        let resp = client
            .update_run_status(Uuid::new_v4(), RunStatus::Running, Some("node-a"), None)
            .await
            .unwrap();
        assert_eq!(resp.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn post_events_succeeds_on_no_content() {
        let base_url = spawn_test_server().await;
        let client = ControllerClient::new(base_url);
        let events = vec![EventRecord {
            event_type: "message".to_string(),
            timestamp: chrono::Utc::now(),
            seq: 1,
            data: serde_json::json!({"text": "hi"}),
        }];
        client.post_events(Uuid::new_v4(), &events).await.unwrap();
    }

    #[tokio::test]
    async fn post_events_skips_request_when_empty() {
        let client = ControllerClient::new("http://127.0.0.1:1");
        client.post_events(Uuid::new_v4(), &[]).await.unwrap();
    }
}
