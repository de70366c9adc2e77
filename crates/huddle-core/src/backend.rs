use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::CallError;

static CALL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid call id pattern"));

/// Validated backend identifier of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(String);

impl CallId {
    /// Accepts a trimmed, non-empty id made of letters, digits, `-` and `_`.
    pub fn parse(input: &str) -> Result<Self, CallError> {
        let candidate = input.trim();
        if CALL_ID_RE.is_match(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(CallError::InvalidCallId(format!("'{candidate}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUser {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl CallUser {
    /// "First Last", or whichever half is present.
    pub fn full_name(&self) -> Option<String> {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() { None } else { Some(full.to_string()) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub initiator: CallUser,
    #[serde(default)]
    pub recipient: Option<CallUser>,
    #[serde(default)]
    pub audio_only: bool,
}

impl CallMetadata {
    /// The initiator or recipient with this identifier.
    pub fn member(&self, identity: &str) -> Option<&CallUser> {
        std::iter::once(&self.initiator)
            .chain(self.recipient.iter())
            .find(|u| u.id == identity)
    }
}

/// Credential and metadata returned by a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGrant {
    pub metadata: CallMetadata,
    pub access_token: String,
    /// Server address chosen by the backend, if it picked one.
    pub server_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinResponse {
    call: CallMetadata,
    token: String,
    #[serde(default)]
    server_url: Option<String>,
}

/// Backend collaborator for the call lifecycle.
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Exchange a call id for an access token and call metadata.
    async fn join_call(&self, call_id: &CallId) -> Result<JoinGrant, CallError>;

    /// Tell the backend the local user left. Best-effort.
    async fn leave_call(&self, call_id: &CallId) -> Result<(), CallError>;
}

/// [`CallBackend`] speaking JSON over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(api_base_url: &str, api_token: Option<String>) -> Result<Self, CallError> {
        let mut base = api_base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| {
            CallError::SessionAcquisitionFailed(format!("invalid api base url '{api_base_url}': {e}"))
        })?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_token,
        })
    }

    fn endpoint(&self, call_id: &CallId, action: &str) -> Result<Url, CallError> {
        let path = format!("calls/{}/{action}/", urlencoding::encode(call_id.as_str()));
        self.base_url
            .join(&path)
            .map_err(|e| CallError::SessionAcquisitionFailed(format!("invalid endpoint: {e}")))
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CallBackend for HttpBackend {
    async fn join_call(&self, call_id: &CallId) -> Result<JoinGrant, CallError> {
        let url = self.endpoint(call_id, "join")?;
        tracing::info!("requesting call session from backend: {url}");

        let resp = self
            .post(url)
            .send()
            .await
            .map_err(|e| CallError::SessionAcquisitionFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_join_failure(status.as_u16(), &body));
        }

        let data: JoinResponse = resp.json().await.map_err(|e| {
            CallError::SessionAcquisitionFailed(format!("invalid join response: {e}"))
        })?;

        Ok(JoinGrant {
            metadata: data.call,
            access_token: data.token,
            server_url: data.server_url,
        })
    }

    async fn leave_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let url = self.endpoint(call_id, "leave")?;
        let resp = self
            .post(url)
            .send()
            .await
            .map_err(|e| CallError::TeardownFailure(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CallError::TeardownFailure(format!(
                "backend returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

const ENDED_CODES: &[&str] = &["call_ended", "call_already_ended"];
const ENDED_PHRASES: &[&str] = &["call has ended", "call has already ended", "call already ended"];

/// Map a non-success join response onto the error taxonomy.
///
/// 410 Gone and the backend's "call ended" payloads become
/// [`CallError::CallAlreadyEnded`]; everything else is a generic
/// acquisition failure.
pub fn classify_join_failure(status: u16, body: &str) -> CallError {
    if status == 410 || body_reports_ended_call(body) {
        return CallError::CallAlreadyEnded;
    }
    CallError::SessionAcquisitionFailed(format!("backend returned status {status}"))
}

fn body_reports_ended_call(body: &str) -> bool {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let field = |key: &str| json.get(key).and_then(|v| v.as_str()).map(str::to_lowercase);

    let code_matches = ["code", "error"]
        .iter()
        .filter_map(|key| field(key))
        .any(|code| ENDED_CODES.contains(&code.as_str()));
    let message_matches = ["error", "detail", "message"]
        .iter()
        .filter_map(|key| field(key))
        .any(|msg| ENDED_PHRASES.iter().any(|phrase| msg.contains(phrase)));

    code_matches || message_matches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_is_trimmed() {
        assert_eq!(CallId::parse("  call_42 ").unwrap().as_str(), "call_42");
    }

    #[test]
    fn call_id_rejects_empty_and_unsafe_input() {
        assert!(CallId::parse("").is_err());
        assert!(CallId::parse("   ").is_err());
        assert!(CallId::parse("../admin").is_err());
        assert!(CallId::parse("a b").is_err());
        assert!(CallId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn gone_status_is_call_already_ended() {
        assert_eq!(classify_join_failure(410, ""), CallError::CallAlreadyEnded);
    }

    #[test]
    fn ended_sentinel_body_is_call_already_ended() {
        assert_eq!(
            classify_join_failure(400, r#"{"code":"CALL_ENDED"}"#),
            CallError::CallAlreadyEnded
        );
        assert_eq!(
            classify_join_failure(409, r#"{"detail":"This call has already ended."}"#),
            CallError::CallAlreadyEnded
        );
    }

    #[test]
    fn other_failures_are_acquisition_failures() {
        for (status, body) in [(401, ""), (500, "oops"), (404, r#"{"detail":"Not found."}"#)] {
            match classify_join_failure(status, body) {
                CallError::SessionAcquisitionFailed(msg) => {
                    assert!(msg.contains(&status.to_string()))
                }
                other => panic!("expected SessionAcquisitionFailed, got {other:?}"),
            }
        }
    }

    #[test]
    fn join_response_parses_camel_case_payload() {
        let body = r#"{
            "call": {
                "initiator": {"id": "u1", "firstName": "Ada", "lastName": "Lovelace"},
                "recipient": {"id": "u2", "firstName": "Alan"},
                "audioOnly": true
            },
            "token": "jwt",
            "serverUrl": "https://rtc.example.com"
        }"#;
        let data: JoinResponse = serde_json::from_str(body).unwrap();
        assert!(data.call.audio_only);
        assert_eq!(data.call.member("u2").and_then(CallUser::full_name).as_deref(), Some("Alan"));
        assert_eq!(data.server_url.as_deref(), Some("https://rtc.example.com"));
    }

    #[test]
    fn endpoint_appends_encoded_call_id() {
        let backend = HttpBackend::new("https://api.example.com/v1", None).unwrap();
        let id = CallId::parse("abc-123").unwrap();
        assert_eq!(
            backend.endpoint(&id, "join").unwrap().as_str(),
            "https://api.example.com/v1/calls/abc-123/join/"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(HttpBackend::new("not a url", None).is_err());
    }
}
