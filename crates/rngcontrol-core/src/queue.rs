//! Queue verbs of the scheduling service.
//!
//! Every endpoint answers HTTP 200 even when it refuses the request; refusals
//! arrive as a JSON `message`. Each response is parsed against an explicit
//! schema and anything unexpected is treated as a protocol failure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{ControlError, Result, is_auth_message};
use crate::session::{MessageBody, SessionManager};
use crate::telemetry::ResultsBundle;

/// Opaque identifier of this process's slot in the remote queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId(String);

impl QueueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The service sends ids as numbers, strings, or whole queue items.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueueRef {
    Number(u64),
    Text(String),
    Item { id: Box<QueueRef> },
}

impl QueueRef {
    fn into_id(self) -> QueueId {
        match self {
            Self::Number(n) => QueueId(n.to_string()),
            Self::Text(s) => QueueId(s),
            Self::Item { id } => id.into_id(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    item: Option<AddedItem>,
    state: Option<Vec<serde_json::Value>>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddedItem {
    id: QueueRef,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    item_on_top: Option<QueueRef>,
    message: Option<String>,
}

/// Result of a successful `add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAdmission {
    pub queue_id: QueueId,
    /// Queue length including this process's slot.
    pub queue_length: usize,
}

/// The queue verbs the controller needs, plus result submission.
#[async_trait]
pub trait SchedulingService: Send + Sync {
    async fn add(&self, experiment_id: &str) -> Result<QueueAdmission>;
    /// Whether `queue_id` is first in line.
    async fn poll_position(&self, queue_id: &QueueId) -> Result<bool>;
    async fn start(&self, queue_id: &QueueId) -> Result<()>;
    async fn remove(&self, queue_id: &QueueId) -> Result<()>;
    async fn submit_results(
        &self,
        experiment_id: &str,
        bundle: &ResultsBundle,
        requester_id: &str,
    ) -> Result<()>;
}

/// HTTP implementation of [`SchedulingService`] over the shared session.
pub struct QueueClient {
    session: Arc<SessionManager>,
}

impl QueueClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.session.post(path).send().await?;
        let body = read_body(resp).await?;
        serde_json::from_str(&body).map_err(|e| {
            log::warn!("Malformed response from {path}: {e}");
            ControlError::from(e)
        })
    }

    /// POST expecting only an acknowledgement; the body may be empty or non-JSON.
    async fn post_ack(&self, req: reqwest::RequestBuilder) -> Result<()> {
        let body = read_body(req.send().await?).await?;
        let parsed = serde_json::from_str::<MessageBody>(&body).unwrap_or_default();
        check_message(parsed.message)
    }
}

/// Map an HTTP status to the error taxonomy and return the body text.
async fn read_body(resp: Response) -> Result<String> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ControlError::Auth(format!("service answered {status}")));
    }
    if !status.is_success() {
        return Err(ControlError::QueueProtocol(format!(
            "service answered {status}"
        )));
    }
    Ok(resp.text().await?)
}

/// A `message` in a success body means the service refused the request.
fn check_message(message: Option<String>) -> Result<()> {
    match message {
        None => Ok(()),
        Some(m) if is_auth_message(&m) => Err(ControlError::Auth(m)),
        Some(m) => Err(ControlError::QueueProtocol(m)),
    }
}

fn parse_admission(resp: AddResponse) -> Result<QueueAdmission> {
    check_message(resp.message)?;
    let item = resp
        .item
        .ok_or_else(|| ControlError::QueueProtocol("admission without item".to_string()))?;
    let state = resp
        .state
        .ok_or_else(|| ControlError::QueueProtocol("admission without queue state".to_string()))?;
    Ok(QueueAdmission {
        queue_id: item.id.into_id(),
        queue_length: state.len(),
    })
}

fn parse_position(resp: UpdateResponse, queue_id: &QueueId) -> Result<bool> {
    check_message(resp.message)?;
    Ok(resp.item_on_top.map(QueueRef::into_id).as_ref() == Some(queue_id))
}

#[async_trait]
impl SchedulingService for QueueClient {
    async fn add(&self, experiment_id: &str) -> Result<QueueAdmission> {
        let resp: AddResponse = self
            .post_json(&format!("/queue/add/{experiment_id}.json"))
            .await?;
        let admission = parse_admission(resp)?;
        log::info!(
            "Added to queue for experiment {experiment_id}: slot {} of {}",
            admission.queue_id,
            admission.queue_length
        );
        Ok(admission)
    }

    async fn poll_position(&self, queue_id: &QueueId) -> Result<bool> {
        let resp: UpdateResponse = self
            .post_json(&format!("/queue/update/{queue_id}.json"))
            .await?;
        parse_position(resp, queue_id)
    }

    async fn start(&self, queue_id: &QueueId) -> Result<()> {
        let resp: MessageBody = self
            .post_json(&format!("/queue/start/{queue_id}.json"))
            .await?;
        check_message(resp.message)
    }

    async fn remove(&self, queue_id: &QueueId) -> Result<()> {
        self.post_ack(self.session.post(&format!("/queue/remove/{queue_id}.json")))
            .await
    }

    async fn submit_results(
        &self,
        experiment_id: &str,
        bundle: &ResultsBundle,
        requester_id: &str,
    ) -> Result<()> {
        let results = serde_json::to_string(bundle)?;
        let rng_id = self.session.config().rng_id.clone();
        let req = self
            .session
            .post(&format!("/xp/send_results/{experiment_id}"))
            .form(&[
                ("results", results.as_str()),
                ("rng_id", rng_id.as_str()),
                ("rng_control_user_id", requester_id),
            ]);
        self.post_ack(req).await?;
        log::info!(
            "Submitted {} trials for experiment {experiment_id}",
            bundle.trials.len()
        );
        Ok(())
    }
}
