use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    RequestBuilder,
};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::types::{
    EventBatch, ProjectPayload, RemoteEvent, RemoteProject, RemoteSession, RemoteTask,
    SessionPayload, SessionSummary, TaskPayload,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A response the backend answered with a non-success status.
#[derive(Debug, Error)]
#[error("API error ({status}): {body}")]
pub struct ApiError {
    pub status: u16,
    pub body: String,
}

impl ApiError {
    /// Status of the backend response behind `err`, if there was one.
    pub fn status_of(err: &anyhow::Error) -> Option<u16> {
        err.downcast_ref::<ApiError>().map(|api| api.status)
    }
}

pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The backend as the sync engine sees it. Every id passed in is a remote id.
pub trait RemoteApi: Send + Sync {
    fn create_session(&self, payload: SessionPayload) -> ApiFuture<'_, RemoteSession>;
    fn update_session(&self, remote_id: String, payload: SessionPayload) -> ApiFuture<'_, RemoteSession>;
    fn append_events(&self, remote_session_id: String, batch: EventBatch) -> ApiFuture<'_, Vec<RemoteEvent>>;

    fn list_projects(&self) -> ApiFuture<'_, Vec<RemoteProject>>;
    fn create_project(&self, payload: ProjectPayload) -> ApiFuture<'_, RemoteProject>;
    fn update_project(&self, remote_id: String, payload: ProjectPayload) -> ApiFuture<'_, RemoteProject>;

    fn list_tasks(&self) -> ApiFuture<'_, Vec<RemoteTask>>;
    fn create_task(&self, payload: TaskPayload) -> ApiFuture<'_, RemoteTask>;
    fn update_task(&self, remote_id: String, payload: TaskPayload) -> ApiFuture<'_, RemoteTask>;

    fn session_summary(&self, remote_session_id: String) -> ApiFuture<'_, SessionSummary>;
}

/// Bearer token shared by the HTTP client and whoever signs the user in.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    token: Arc<RwLock<Option<String>>>,
}

impl AuthState {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    pub fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    pub fn set_token(&self, token: Option<String>) {
        let token = token.filter(|t| !t.is_empty());
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

pub struct HttpApi {
    http_client: reqwest::Client,
    base_url: String,
    auth: AuthState,
}

impl HttpApi {
    pub fn new(base_url: &str, auth: AuthState) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let request = match self.auth.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.context("HTTP request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(ApiError {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        response.json().await.context("failed to parse response")
    }
}

impl RemoteApi for HttpApi {
    fn create_session(&self, payload: SessionPayload) -> ApiFuture<'_, RemoteSession> {
        Box::pin(async move {
            self.send(self.http_client.post(self.url("/sessions")).json(&payload))
                .await
        })
    }

    fn update_session(&self, remote_id: String, payload: SessionPayload) -> ApiFuture<'_, RemoteSession> {
        Box::pin(async move {
            let url = self.url(&format!("/sessions/{remote_id}"));
            self.send(self.http_client.patch(url).json(&payload)).await
        })
    }

    fn append_events(&self, remote_session_id: String, batch: EventBatch) -> ApiFuture<'_, Vec<RemoteEvent>> {
        Box::pin(async move {
            let url = self.url(&format!("/sessions/{remote_session_id}/events"));
            self.send(self.http_client.post(url).json(&batch)).await
        })
    }

    fn list_projects(&self) -> ApiFuture<'_, Vec<RemoteProject>> {
        Box::pin(async move { self.send(self.http_client.get(self.url("/projects"))).await })
    }

    fn create_project(&self, payload: ProjectPayload) -> ApiFuture<'_, RemoteProject> {
        Box::pin(async move {
            self.send(self.http_client.post(self.url("/projects")).json(&payload))
                .await
        })
    }

    fn update_project(&self, remote_id: String, payload: ProjectPayload) -> ApiFuture<'_, RemoteProject> {
        Box::pin(async move {
            let url = self.url(&format!("/projects/{remote_id}"));
            self.send(self.http_client.patch(url).json(&payload)).await
        })
    }

    fn list_tasks(&self) -> ApiFuture<'_, Vec<RemoteTask>> {
        Box::pin(async move { self.send(self.http_client.get(self.url("/tasks"))).await })
    }

    fn create_task(&self, payload: TaskPayload) -> ApiFuture<'_, RemoteTask> {
        Box::pin(async move {
            self.send(self.http_client.post(self.url("/tasks")).json(&payload))
                .await
        })
    }

    fn update_task(&self, remote_id: String, payload: TaskPayload) -> ApiFuture<'_, RemoteTask> {
        Box::pin(async move {
            let url = self.url(&format!("/tasks/{remote_id}"));
            self.send(self.http_client.patch(url).json(&payload)).await
        })
    }

    fn session_summary(&self, remote_session_id: String) -> ApiFuture<'_, SessionSummary> {
        Box::pin(async move {
            let request = self
                .http_client
                .post(self.url("/insights/session-summary"))
                .query(&[("session_id", remote_session_id.as_str())]);
            self.send(request).await
        })
    }
}
