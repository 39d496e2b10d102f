//! Window-message wire protocol between the page, the content relay, and
//! the background router.
//!
//! Every message is a JSON object with a `type` discriminator. The tag and
//! field names are the wire contract and must not drift: the page and the
//! extension are versioned independently.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A message on the page's window channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WindowMessage {
    /// Page probes for a live extension in this tab.
    #[serde(rename = "DETECT_EXTENSION")]
    DetectExtension { id: String },

    /// Content relay's immediate answer to a probe.
    #[serde(rename = "EXTENSION_DETECTED")]
    ExtensionDetected { id: String },

    /// Page-originated action for the extension.
    #[serde(rename = "FROM_QUEFORK")]
    FromQuefork(PageRequest),

    /// Extension-originated message for the page.
    #[serde(rename = "FROM_EXTENSION")]
    FromExtension(ExtensionReply),

    /// Page toggled the interceptor; forwarded to the router, no ack.
    #[serde(rename = "INTERCEPTOR_TOGGLE")]
    InterceptorToggle { enabled: bool },

    /// Router-side toggle (e.g. from the popup), mirrored by the page.
    #[serde(rename = "INTERCEPTOR_STATE_CHANGED")]
    InterceptorStateChanged { enabled: bool },
}

/// Action discriminator on `FROM_QUEFORK` messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PageAction {
    ExecuteRequest,
}

/// Action discriminator on `FROM_EXTENSION` messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionAction {
    ExecuteResponse,
    StatsUpdated,
}

/// Payload of a `FROM_QUEFORK` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageRequest {
    pub action: PageAction,
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl PageRequest {
    /// Wrap a request descriptor for dispatch under a fresh correlation id.
    pub fn execute(id: String, descriptor: &RequestDescriptor) -> Self {
        Self {
            action: PageAction::ExecuteRequest,
            id,
            method: descriptor.method.clone(),
            url: descriptor.url.clone(),
            headers: descriptor.headers.clone(),
            body: descriptor.body.clone(),
        }
    }
}

/// Payload of a `FROM_EXTENSION` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionReply {
    pub action: ExtensionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtensionReply {
    /// An `executeResponse` carrying the outcome of an intercepted request.
    pub fn execute_response(id: String, result: ExecuteResult) -> Self {
        Self {
            action: ExtensionAction::ExecuteResponse,
            id: Some(id),
            success: Some(result.success),
            response: result.response,
            error: result.error,
        }
    }

    /// A `statsUpdated` notification (no payload; surfaces re-query).
    pub fn stats_updated() -> Self {
        Self {
            action: ExtensionAction::StatsUpdated,
            id: None,
            success: None,
            response: None,
            error: None,
        }
    }
}

/// An abstract outgoing request as the request builder describes it.
///
/// Doubles as the body of `POST /api/proxy`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

/// Input to the router's request execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Explicit destination; when absent the router resolves one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl From<PageRequest> for ExecuteRequest {
    fn from(req: PageRequest) -> Self {
        Self {
            url: req.url,
            method: req.method,
            headers: req.headers,
            body: req.body,
            target_url: None,
        }
    }
}

/// Outcome of an intercepted fetch, as relayed back to the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResult {
    pub fn ok(response: ResponseEnvelope) -> Self {
        Self {
            success: true,
            response: Some(response),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(message.into()),
        }
    }
}

/// Normalized response produced by the router's fetch path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    /// Parsed JSON when the content type indicates JSON, else a string.
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Elapsed wall-clock, formatted "<n>ms".
    pub time: String,
    /// Body size, binary-prefix formatted ("1.21 KB").
    pub size: String,
    /// Set only when the extension path actually executed the fetch.
    #[serde(default)]
    pub intercepted: bool,
}

/// Normalized response returned by the fallback proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEnvelope {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_match_wire_contract() {
        let probe = WindowMessage::DetectExtension {
            id: "abc".to_string(),
        };
        let json = serde_json::to_value(&probe).unwrap();
        assert_eq!(json["type"], "DETECT_EXTENSION");
        assert_eq!(json["id"], "abc");

        let detected = WindowMessage::ExtensionDetected {
            id: "abc".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&detected).unwrap()["type"],
            "EXTENSION_DETECTED"
        );

        let toggle = WindowMessage::InterceptorToggle { enabled: false };
        let json = serde_json::to_value(&toggle).unwrap();
        assert_eq!(json["type"], "INTERCEPTOR_TOGGLE");
        assert_eq!(json["enabled"], false);

        let changed = WindowMessage::InterceptorStateChanged { enabled: true };
        assert_eq!(
            serde_json::to_value(&changed).unwrap()["type"],
            "INTERCEPTOR_STATE_CHANGED"
        );
    }

    #[test]
    fn test_page_request_flattens_into_from_quefork() {
        let descriptor = RequestDescriptor::get("http://example.com/test");
        let msg = WindowMessage::FromQuefork(PageRequest::execute("id-1".to_string(), &descriptor));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "FROM_QUEFORK");
        assert_eq!(json["action"], "executeRequest");
        assert_eq!(json["id"], "id-1");
        assert_eq!(json["method"], "GET");
        assert_eq!(json["url"], "http://example.com/test");
        // No body key for a GET without one
        assert!(json.get("body").is_none());
    }

    #[test]
    fn test_execute_response_round_trip() {
        let reply = ExtensionReply::execute_response(
            "id-2".to_string(),
            ExecuteResult::err("target unreachable"),
        );
        let json = serde_json::to_value(WindowMessage::FromExtension(reply)).unwrap();
        assert_eq!(json["type"], "FROM_EXTENSION");
        assert_eq!(json["action"], "executeResponse");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "target unreachable");

        let parsed: WindowMessage = serde_json::from_value(json).unwrap();
        match parsed {
            WindowMessage::FromExtension(reply) => {
                assert_eq!(reply.id.as_deref(), Some("id-2"));
                assert_eq!(reply.success, Some(false));
            }
            other => panic!("expected FROM_EXTENSION, got {other:?}"),
        }
    }

    #[test]
    fn test_envelope_uses_camel_case_keys() {
        let envelope = ResponseEnvelope {
            status: 200,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: serde_json::json!({"ok": true}),
            content_type: Some("application/json".to_string()),
            time: "12ms".to_string(),
            size: "1.00 KB".to_string(),
            intercepted: true,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("statusText").is_some());
        assert!(json.get("contentType").is_some());
        assert!(json.get("status_text").is_none());
    }

    #[test]
    fn test_execute_request_accepts_target_url_override() {
        let json = serde_json::json!({
            "url": "http://example.com/a",
            "method": "POST",
            "targetUrl": "http://localhost:4000",
        });
        let req: ExecuteRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.target_url.as_deref(), Some("http://localhost:4000"));
        assert!(req.headers.is_empty());
    }
}
