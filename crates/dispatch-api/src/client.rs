// REST client for the dispatch backend
//
// Wraps `reqwest::Client` with base-URL path construction, bearer auth,
// and list-envelope unwrapping. Covers the three bulk-load endpoints and
// the one-id-at-a-time reference resolution endpoint; everything else the
// backend offers (admin CRUD, forms) is out of scope for this crate.

use reqwest::StatusCode;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::auth::Credentials;
use crate::error::Error;
use crate::transport::TransportConfig;

const BODY_PREVIEW_CHARS: usize = 200;

/// HTTP client for the dispatch backend's read endpoints.
///
/// All list methods return the raw JSON items; typing and id validation
/// happen in `dispatch-core`, which owns the domain model.
#[derive(Debug, Clone)]
pub struct DispatchClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DispatchClient {
    /// Create a client that authenticates every call with `credentials`.
    ///
    /// `base_url` is the backend root, e.g. `https://dispatch.example.org`
    /// or `https://gateway.example.org/dispatch/` behind a proxy prefix.
    pub fn new(
        base_url: Url,
        credentials: &Credentials,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client(credentials.headers()?)?;
        Ok(Self { http, base_url })
    }

    /// Create a client around a pre-built `reqwest::Client`.
    ///
    /// Use this when authentication is handled by the caller's client
    /// (a proxy that injects headers, or tests against a mock server).
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// The backend base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Bulk loads ───────────────────────────────────────────────────

    /// `GET /api/incidents`
    pub async fn list_incidents(&self) -> Result<Vec<Value>, Error> {
        let url = self.api_url(&["incidents"])?;
        self.get_list(url).await
    }

    /// `GET /api/vehicles`
    pub async fn list_vehicles(&self) -> Result<Vec<Value>, Error> {
        let url = self.api_url(&["vehicles"])?;
        self.get_list(url).await
    }

    /// `GET /api/proposals`
    pub async fn list_proposals(&self) -> Result<Vec<Value>, Error> {
        let url = self.api_url(&["proposals"])?;
        self.get_list(url).await
    }

    // ── Reference resolution ─────────────────────────────────────────

    /// `GET /api/references/{resource_type}?ids={id}`
    ///
    /// The backend answers with an object keyed by id. Only one id is ever
    /// requested per call, but the full mapping is returned so callers can
    /// pick their id out of it.
    pub async fn resolve_reference(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Map<String, Value>, Error> {
        let mut url = self.api_url(&["references", resource_type])?;
        url.query_pairs_mut().append_pair("ids", id);

        match self.get_json(url).await? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Deserialization {
                message: format!("expected an object keyed by id, got {}", kind_of(&other)),
                body: other.to_string(),
            }),
        }
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// Build `{base}/api/{segments...}`, percent-encoding each segment.
    pub(crate) fn api_url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get_list(&self, url: Url) -> Result<Vec<Value>, Error> {
        let body = self.get_json(url).await?;
        unwrap_list(body)
    }

    async fn get_json(&self, url: Url) -> Result<Value, Error> {
        debug!("GET {}", url);

        let resp = self.http.get(url).send().await.map_err(Error::Transport)?;
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "token expired or invalid".into(),
            });
        }

        if status == StatusCode::FORBIDDEN {
            return Err(Error::Forbidden {
                message: "insufficient permissions (HTTP 403)".into(),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: preview(&body),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: format!("{e} (body preview: {:?})", preview(&body)),
            body,
        })
    }
}

/// Accept either a bare JSON array or a `{ "data": [...] }` envelope.
fn unwrap_list(body: Value) -> Result<Vec<Value>, Error> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(Error::Deserialization {
                message: "expected a JSON array or a `data` array envelope".into(),
                body: Value::Object(map).to_string(),
            }),
        },
        other => Err(Error::Deserialization {
            message: format!("expected a JSON array, got {}", kind_of(&other)),
            body: other.to_string(),
        }),
    }
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
