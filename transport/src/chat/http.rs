//! [`ChatBackend`] over the homeserver's client-server HTTP API (r0).
//!
//! Authenticated with a bearer access token obtained out of band. Path
//! segments (room ids, aliases, user ids) are percent-encoded by `Url`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use super::backend::{BackendError, ChatBackend, Presence};
use super::event::SyncBatch;

const API_PREFIX: [&str; 3] = ["_matrix", "client", "r0"];

/// Extra time on top of the long-poll timeout before the HTTP client gives
/// up on a sync request.
const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct FilterResponse {
    filter_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Clone)]
pub struct HttpBackend {
    base: Url,
    access_token: String,
    user_id: String,
    client: Client,
}

impl HttpBackend {
    pub fn new(
        base: &str,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let base = Url::parse(base).map_err(|e| BackendError::Http(format!("bad base url: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::Http(format!("bad base url: {base}")));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        Ok(Self {
            base,
            access_token: access_token.into(),
            user_id: user_id.into(),
            client,
        })
    }

    /// `<base>/_matrix/client/r0/<segments...>`
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Checked in `new`: the base can carry path segments.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_PREFIX).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response, BackendError> {
        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
        let (errcode, message) = parsed
            .map(|b| (b.errcode, b.error))
            .unwrap_or_else(|| (String::new(), body));
        debug!(status = status.as_u16(), %errcode, %message, "chat backend error");

        Err(match (status, errcode.as_str()) {
            (_, "M_ROOM_IN_USE") => BackendError::RoomInUse,
            (StatusCode::FORBIDDEN, _) => BackendError::Forbidden(message),
            (StatusCode::NOT_FOUND, _) => BackendError::NotFound(message),
            (StatusCode::SERVICE_UNAVAILABLE, _) => BackendError::Unavailable,
            _ => BackendError::Status {
                status: status.as_u16(),
                errcode,
                message,
            },
        })
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        self.execute(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn create_filter(&self, filter_json: &str) -> Result<String, BackendError> {
        let url = self.endpoint(&["user", &self.user_id, "filter"]);
        let body: Value =
            serde_json::from_str(filter_json).map_err(|e| BackendError::Decode(e.to_string()))?;
        let resp: FilterResponse = self
            .json(self.request(Method::POST, url).json(&body))
            .await?;
        Ok(resp.filter_id)
    }

    async fn sync(
        &self,
        since: Option<&str>,
        filter_id: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncBatch, BackendError> {
        let mut url = self.endpoint(&["sync"]);
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("timeout", &timeout.as_millis().to_string());
            if let Some(since) = since {
                q.append_pair("since", since);
            }
            if let Some(filter) = filter_id {
                q.append_pair("filter", filter);
            }
        }
        trace!(?since, "sync request");
        let req = self
            .request(Method::GET, url)
            .timeout(timeout + SYNC_TIMEOUT_MARGIN);
        self.json(req).await
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Map<String, Value>,
        txn_id: &str,
    ) -> Result<String, BackendError> {
        let url = self.endpoint(&["rooms", room_id, "send", event_type, txn_id]);
        let resp: EventIdResponse = self
            .json(self.request(Method::PUT, url).json(content))
            .await?;
        Ok(resp.event_id)
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, BackendError> {
        let url = self.endpoint(&["directory", "room", alias]);
        match self
            .json::<RoomIdResponse>(self.request(Method::GET, url))
            .await
        {
            Ok(resp) => Ok(Some(resp.room_id)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_room(
        &self,
        alias_localpart: &str,
        invite: &[String],
    ) -> Result<String, BackendError> {
        let url = self.endpoint(&["createRoom"]);
        let body = json!({
            "room_alias_name": alias_localpart,
            "invite": invite,
            "preset": "private_chat",
            "visibility": "private",
        });
        let resp: RoomIdResponse = self
            .json(self.request(Method::POST, url).json(&body))
            .await?;
        Ok(resp.room_id)
    }

    async fn join_room(&self, room_id_or_alias: &str) -> Result<String, BackendError> {
        let url = self.endpoint(&["join", room_id_or_alias]);
        let resp: RoomIdResponse = self
            .json(self.request(Method::POST, url).json(&json!({})))
            .await?;
        Ok(resp.room_id)
    }

    async fn set_presence(&self, presence: Presence) -> Result<(), BackendError> {
        let url = self.endpoint(&["presence", &self.user_id, "status"]);
        self.execute(
            self.request(Method::PUT, url)
                .json(&json!({ "presence": presence.as_str() })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_encode_path_segments() {
        let backend = HttpBackend::new("https://hs.example/", "@a:hs.example", "token").unwrap();
        let url = backend.endpoint(&["rooms", "!abc:hs.example", "send", "protocol.message", "t 1"]);
        assert_eq!(
            url.as_str(),
            "https://hs.example/_matrix/client/r0/rooms/!abc:hs.example/send/protocol.message/t%201"
        );

        let url = backend.endpoint(&["directory", "room", "#relaynet_ab:hs.example"]);
        assert!(url.as_str().ends_with("/directory/room/%23relaynet_ab:hs.example"));
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let backend = HttpBackend::new("https://proxy.example/chat", "@a:hs", "t").unwrap();
        assert_eq!(
            backend.endpoint(&["sync"]).as_str(),
            "https://proxy.example/chat/_matrix/client/r0/sync"
        );
    }

    #[test]
    fn rejects_unusable_base() {
        assert!(HttpBackend::new("not a url", "@a:hs", "t").is_err());
        assert!(HttpBackend::new("mailto:a@b", "@a:hs", "t").is_err());
    }
}
