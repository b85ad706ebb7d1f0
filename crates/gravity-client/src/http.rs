//! HTTP transport against the gravity backend.
//!
//! Endpoints:
//! - `POST /notes/sync` pushes queued operations, response `{"results": [...]}`
//! - `POST /notes/crdt/updates` pulls fragments newer than the cursors
//! - `GET  /notes/crdt/snapshots` lists stored snapshots for hydration

use async_trait::async_trait;
use gravity_sync::transport::{Result, SyncTransport, TransportError};
use gravity_sync::wire::{
    OperationAck, PendingOperation, SnapshotRecord, UpdateCursor, UpdateRecord,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SyncRequest<'a> {
    operations: &'a [PendingOperation],
}

#[derive(Deserialize)]
struct SyncResponse {
    results: Vec<OperationAck>,
}

#[derive(Serialize)]
struct UpdatesRequest<'a> {
    cursors: &'a [UpdateCursor],
}

#[derive(Deserialize)]
struct UpdatesResponse {
    updates: Vec<UpdateRecord>,
}

#[derive(Deserialize)]
struct SnapshotsResponse {
    snapshots: Vec<SnapshotRecord>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn status_error(status: StatusCode) -> TransportError {
    if status == StatusCode::UNAUTHORIZED {
        TransportError::Unauthorized
    } else {
        TransportError::Failed(format!("unexpected status {}", status))
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    TransportError::Failed(e.to_string())
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push_operations(
        &self,
        bearer: &str,
        operations: &[PendingOperation],
    ) -> Result<Vec<OperationAck>> {
        let response = self
            .client
            .post(self.url("/notes/sync"))
            .bearer_auth(bearer)
            .json(&SyncRequest { operations })
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let body: SyncResponse = response.json().await.map_err(request_error)?;
        Ok(body.results)
    }

    async fn pull_updates(
        &self,
        bearer: &str,
        cursors: &[UpdateCursor],
    ) -> Result<Vec<UpdateRecord>> {
        let response = self
            .client
            .post(self.url("/notes/crdt/updates"))
            .bearer_auth(bearer)
            .json(&UpdatesRequest { cursors })
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let body: UpdatesResponse = response.json().await.map_err(request_error)?;
        Ok(body.updates)
    }

    async fn list_snapshots(&self, bearer: &str) -> Result<Vec<SnapshotRecord>> {
        let response = self
            .client
            .get(self.url("/notes/crdt/snapshots"))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let body: SnapshotsResponse = response.json().await.map_err(request_error)?;
        Ok(body.snapshots)
    }
}
