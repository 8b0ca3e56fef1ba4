//! Message types exchanged with the backend.
//!
//! Incoming payloads are decoded in two steps: the `type` discriminator is read
//! first, then the rest of the object is parsed into the matching shape.
//! Unknown kinds become [`Envelope::Unrecognized`] rather than an error so a
//! newer backend cannot break an older client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

/// Free-form body of a reply, minus `type`, `cookie` and `inReplyTo`.
pub type ReplyContent = Map<String, Value>;

/// A protocol version advertised by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVersion {
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_experimental: bool,
}

impl ProtocolVersion {
    /// The `{major, minor}` pair sent back in a handshake.
    pub fn request(&self) -> VersionRequest {
        VersionRequest {
            major: self.major,
            minor: self.minor,
        }
    }
}

/// Version selected by the client in a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRequest {
    pub major: u32,
    pub minor: u32,
}

/// Greeting sent by the backend as soon as the pipe is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub supported_protocol_versions: Vec<ProtocolVersion>,
}

/// Successful answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub cookie: String,
    pub in_reply_to: String,
    #[serde(flatten)]
    pub content: ReplyContent,
}

/// Failed answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub in_reply_to: String,
    #[serde(default)]
    pub error_message: String,
}

/// Progress report for a long-running request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub progress_message: String,
    #[serde(default)]
    pub progress_minimum: i64,
    #[serde(default)]
    pub progress_maximum: i64,
    #[serde(default)]
    pub progress_current: i64,
}

/// Human-readable status text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Unsolicited notification from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Previously computed configuration is stale.
    Dirty,
    /// A watched file changed.
    FileChange { path: String, properties: Vec<String> },
    /// A signal name this client does not know.
    Other { name: String },
}

impl Signal {
    fn from_body(body: &Map<String, Value>) -> ProtocolResult<Self> {
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedEnvelope("signal without a name".into()))?;

        Ok(match name {
            "dirty" => Self::Dirty,
            "fileChange" => Self::FileChange {
                path: body
                    .get("path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                properties: body
                    .get("properties")
                    .and_then(Value::as_array)
                    .map(|props| {
                        props
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            other => Self::Other {
                name: other.to_string(),
            },
        })
    }

    /// Wire name of the signal.
    pub fn name(&self) -> &str {
        match self {
            Self::Dirty => "dirty",
            Self::FileChange { .. } => "fileChange",
            Self::Other { name } => name,
        }
    }

    /// Encodes the signal as a wire object.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".into(), Value::from("signal"));
        object.insert("name".into(), Value::from(self.name()));
        if let Self::FileChange { path, properties } = self {
            object.insert("path".into(), Value::from(path.as_str()));
            object.insert("properties".into(), Value::from(properties.clone()));
        }
        Value::Object(object)
    }
}

/// One decoded message received from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Hello(Hello),
    /// A reply whose `inReplyTo` is `handshake`.
    HandshakeReply(Reply),
    Reply(Reply),
    Error(ErrorReply),
    Progress(Progress),
    Message(MessageNotice),
    Signal(Signal),
    /// A message kind this client does not know.
    Unrecognized { kind: String, body: Value },
}

impl Envelope {
    /// Decodes one extracted payload.
    ///
    /// # Errors
    ///
    /// Fails if the payload is not a JSON object with a string `type`, or if a
    /// known kind does not have its expected shape.
    pub fn decode(payload: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::MalformedEnvelope(
                "payload is not a JSON object".into(),
            ));
        };
        let kind = match object.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => {
                return Err(ProtocolError::MalformedEnvelope(
                    "missing string `type` field".into(),
                ));
            }
        };

        let envelope = match kind.as_str() {
            "hello" => Self::Hello(serde_json::from_value(Value::Object(object))?),
            "reply" => {
                let reply: Reply = serde_json::from_value(Value::Object(object))?;
                if reply.in_reply_to == "handshake" {
                    Self::HandshakeReply(reply)
                } else {
                    Self::Reply(reply)
                }
            }
            "error" => Self::Error(serde_json::from_value(Value::Object(object))?),
            "progress" => Self::Progress(serde_json::from_value(Value::Object(object))?),
            "message" => Self::Message(serde_json::from_value(Value::Object(object))?),
            "signal" => Self::Signal(Signal::from_body(&object)?),
            _ => Self::Unrecognized {
                kind,
                body: Value::Object(object),
            },
        };
        Ok(envelope)
    }

    /// Wire `type` of the message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Hello(_) => "hello",
            Self::HandshakeReply(_) | Self::Reply(_) => "reply",
            Self::Error(_) => "error",
            Self::Progress(_) => "progress",
            Self::Message(_) => "message",
            Self::Signal(_) => "signal",
            Self::Unrecognized { kind, .. } => kind,
        }
    }

    /// Cookie carried by the message, if any.
    pub fn cookie(&self) -> Option<&str> {
        match self {
            Self::HandshakeReply(r) | Self::Reply(r) => Some(&r.cookie),
            Self::Error(e) => Some(&e.cookie),
            Self::Progress(p) => p.cookie.as_deref(),
            Self::Message(m) => m.cookie.as_deref(),
            Self::Hello(_) | Self::Signal(_) | Self::Unrecognized { .. } => None,
        }
    }
}

/// Parameters of the first request after `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParameters {
    /// Sent verbatim; the backend compares it byte-for-byte with its cache.
    pub source_directory: String,
    pub build_directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_generator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolset: Option<String>,
    pub protocol_version: VersionRequest,
}

/// Subset of global settings that can be changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_system_vars: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_expand: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_uninitialized: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_unused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_unused_cli: Option<bool>,
}

impl GlobalSettingsUpdate {
    /// Creates an update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set debug_output.
    pub fn debug_output(mut self, on: bool) -> Self {
        self.debug_output = Some(on);
        self
    }

    /// Builder: set trace.
    pub fn trace(mut self, on: bool) -> Self {
        self.trace = Some(on);
        self
    }

    /// Builder: set trace_expand.
    pub fn trace_expand(mut self, on: bool) -> Self {
        self.trace_expand = Some(on);
        self
    }

    /// Builder: set warn_uninitialized.
    pub fn warn_uninitialized(mut self, on: bool) -> Self {
        self.warn_uninitialized = Some(on);
        self
    }

    /// Builder: set warn_unused_cli.
    pub fn warn_unused_cli(mut self, on: bool) -> Self {
        self.warn_unused_cli = Some(on);
        self
    }
}

/// Requests the client can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    Handshake(HandshakeParameters),
    GlobalSettings,
    SetGlobalSettings(GlobalSettingsUpdate),
    Configure {
        #[serde(rename = "cacheArguments", default)]
        cache_arguments: Vec<String>,
    },
    Compute,
    Codemodel,
    Cache,
    CmakeInputs,
}

impl Request {
    /// Wire `type`, also the `inReplyTo` of the matching reply.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::GlobalSettings => "globalSettings",
            Self::SetGlobalSettings(_) => "setGlobalSettings",
            Self::Configure { .. } => "configure",
            Self::Compute => "compute",
            Self::Codemodel => "codemodel",
            Self::Cache => "cache",
            Self::CmakeInputs => "cmakeInputs",
        }
    }

    /// Creates a configure request.
    pub fn configure(cache_arguments: Vec<String>) -> Self {
        Self::Configure { cache_arguments }
    }
}

/// A request as it travels on the wire: `{type, ...params, cookie}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEnvelope {
    #[serde(flatten)]
    pub request: Request,
    pub cookie: String,
}

impl RequestEnvelope {
    pub fn new(cookie: impl Into<String>, request: Request) -> Self {
        Self {
            request,
            cookie: cookie.into(),
        }
    }

    /// Decodes a request payload, as the backend side does.
    pub fn decode(payload: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::MalformedEnvelope(
                "payload is not a JSON object".into(),
            ));
        };
        let cookie = match object.remove("cookie") {
            Some(Value::String(cookie)) => cookie,
            _ => {
                return Err(ProtocolError::MalformedEnvelope(
                    "request without a string cookie".into(),
                ));
            }
        };
        let request = serde_json::from_value(Value::Object(object))?;
        Ok(Self { request, cookie })
    }
}

/// Reply to `globalSettings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub capabilities: Value,
    pub check_system_vars: bool,
    pub debug_output: bool,
    pub extra_generator: String,
    pub generator: String,
    pub source_directory: String,
    pub build_directory: String,
    pub trace: bool,
    pub trace_expand: bool,
    pub warn_uninitialized: bool,
    pub warn_unused: bool,
    pub warn_unused_cli: bool,
}

/// Reply to `codemodel`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModel {
    pub configurations: Vec<CodeModelConfiguration>,
}

impl CodeModel {
    /// Iterates over every target of every project and configuration.
    pub fn targets(&self) -> impl Iterator<Item = &CodeModelTarget> {
        self.configurations
            .iter()
            .flat_map(|c| c.projects.iter())
            .flat_map(|p| p.targets.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelConfiguration {
    pub name: String,
    pub projects: Vec<CodeModelProject>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelProject {
    pub name: String,
    pub source_directory: String,
    pub build_directory: String,
    pub targets: Vec<CodeModelTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelTarget {
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub artifacts: Vec<String>,
    pub source_directory: String,
    pub build_directory: String,
    pub file_groups: Vec<CodeModelFileGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeModelFileGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_flags: Option<String>,
    pub sources: Vec<String>,
    pub is_generated: bool,
    pub include_path: Vec<IncludePath>,
    pub defines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncludePath {
    pub path: String,
    pub is_system: bool,
}

/// Reply to `cache`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheContent {
    pub cache: Vec<CacheEntry>,
}

impl CacheContent {
    /// Looks up an entry by key.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.cache.iter().find(|e| e.key == key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub value: String,
    pub properties: BTreeMap<String, String>,
}

/// Reply to `cmakeInputs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CmakeInputs {
    pub build_files: Vec<BuildFiles>,
    pub cmake_root_directory: String,
    pub source_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildFiles {
    pub is_cmake: bool,
    pub is_temporary: bool,
    pub sources: Vec<String>,
}
