//! Chat history retrieval.
//!
//! The history service returns every stored message for the pair as
//! `{ "messages": [...] }` with the sender's profile nested in each record.
//! [`HttpHistoryClient`] performs the request on tokio's blocking pool;
//! [`map_record`] flattens a record into a [`ChatMessage`].

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use pairchat_proto::DEFAULT_AVATAR;
use pairchat_proto::history::{HistoryRecord, HistoryResponse};
use pairchat_proto::room::ParticipantId;

use crate::session::ChatMessage;

/// Errors from a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// The configured API base is not a usable URL.
    #[error("invalid history endpoint: {0}")]
    InvalidEndpoint(String),

    /// The request did not complete in time.
    #[error("history request timed out")]
    Timeout,

    /// The service answered with a non-success status.
    #[error("history service returned HTTP {0}")]
    Status(u16),

    /// The request failed below HTTP (DNS, connect, TLS, I/O).
    #[error("history request failed: {0}")]
    Network(String),

    /// The body was not the expected JSON shape.
    #[error("malformed history response: {0}")]
    Decode(String),
}

/// Something that can produce the stored history for a chat partner.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch all stored records for the conversation with `target`, oldest first.
    fn fetch(
        &self,
        target: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<HistoryRecord>, HistoryError>> + Send;
}

/// `GET {api_base}/chat/{target}` over HTTP.
#[derive(Clone)]
pub struct HttpHistoryClient {
    api_base: Url,
    local_id: ParticipantId,
    session_cookie: Option<String>,
    agent: ureq::Agent,
}

impl HttpHistoryClient {
    /// Creates a client for the service at `api_base`.
    ///
    /// The local id is sent as `X-User-Id`; `session_cookie`, when present,
    /// is forwarded verbatim as the `Cookie` header.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidEndpoint`] if `api_base` does not parse
    /// or cannot carry a path.
    pub fn new(
        api_base: &str,
        local_id: ParticipantId,
        session_cookie: Option<String>,
        timeout: Duration,
    ) -> Result<Self, HistoryError> {
        let mut api_base =
            Url::parse(api_base).map_err(|e| HistoryError::InvalidEndpoint(e.to_string()))?;
        if api_base.cannot_be_a_base() {
            return Err(HistoryError::InvalidEndpoint(api_base.to_string()));
        }
        // A trailing slash keeps `join` from replacing the last path segment.
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Ok(Self {
            api_base,
            local_id,
            session_cookie,
            agent,
        })
    }

    /// The URL fetched for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidEndpoint`] if the URL cannot be built.
    pub fn endpoint(&self, target: &ParticipantId) -> Result<Url, HistoryError> {
        let mut url = self
            .api_base
            .join("chat/")
            .map_err(|e| HistoryError::InvalidEndpoint(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| HistoryError::InvalidEndpoint(self.api_base.to_string()))?
            .pop_if_empty()
            .push(target.as_str());
        Ok(url)
    }

    fn fetch_blocking(
        agent: &ureq::Agent,
        url: &Url,
        local_id: &ParticipantId,
        cookie: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, HistoryError> {
        let mut request = agent
            .get(url.as_str())
            .header("Accept", "application/json")
            .header("X-User-Id", local_id.as_str());
        if let Some(cookie) = cookie {
            request = request.header("Cookie", cookie);
        }

        let mut resp = request.call().map_err(map_ureq_error)?;
        let body: HistoryResponse = resp
            .body_mut()
            .read_json()
            .map_err(|e| HistoryError::Decode(e.to_string()))?;
        Ok(body.messages)
    }
}

impl HistorySource for HttpHistoryClient {
    async fn fetch(&self, target: &ParticipantId) -> Result<Vec<HistoryRecord>, HistoryError> {
        let url = self.endpoint(target)?;
        let agent = self.agent.clone();
        let local_id = self.local_id.clone();
        let cookie = self.session_cookie.clone();

        tracing::debug!(url = %url, "fetching chat history");
        tokio::task::spawn_blocking(move || {
            Self::fetch_blocking(&agent, &url, &local_id, cookie.as_deref())
        })
        .await
        .map_err(|e| HistoryError::Network(format!("history task failed: {e}")))?
    }
}

fn map_ureq_error(err: ureq::Error) -> HistoryError {
    match err {
        ureq::Error::StatusCode(code) => HistoryError::Status(code),
        ureq::Error::Timeout(_) => HistoryError::Timeout,
        other => HistoryError::Network(other.to_string()),
    }
}

/// Flattens one stored record into a display message.
///
/// A missing avatar becomes [`DEFAULT_AVATAR`]; a missing or unparseable
/// timestamp becomes `now`; missing text becomes the empty string.
#[must_use]
pub fn map_record(record: HistoryRecord, now: DateTime<Utc>) -> ChatMessage {
    let created_at = record.created_at_utc().unwrap_or_else(|| {
        tracing::debug!(raw = ?record.created_at, "history record without usable timestamp");
        now
    });
    let sender = record.sender_id.unwrap_or_default();

    ChatMessage {
        first_name: sender.first_name.unwrap_or_default(),
        last_name: sender.last_name.unwrap_or_default(),
        photo_url: sender
            .photo_url
            .unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
        text: record.text.unwrap_or_default(),
        created_at,
        sender_id: sender.id,
        client_id: None,
        pending: false,
        failed: false,
    }
}
