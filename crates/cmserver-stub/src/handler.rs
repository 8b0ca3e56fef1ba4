//! Request handling for the stub backend.
//!
//! The handler is a synchronous state machine: each incoming request yields
//! an [`Action`] telling the connection loop what to write, or whether to go
//! quiet or exit. Configure writes a real `CMakeCache.txt` so a later session
//! sees the recorded home directory and generator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use cmserver_core::{CMakeCache, HOME_DIRECTORY_KEY, cache_path};
use cmserver_protocol::{
    BuildFiles, CLOSE_MARKER, CacheContent, CacheEntry, CmakeInputs, CodeModel,
    CodeModelConfiguration, CodeModelFileGroup, CodeModelProject, CodeModelTarget, ErrorReply,
    GlobalSettings, GlobalSettingsUpdate, HandshakeParameters, Hello, MessageNotice,
    OPEN_MARKER, Progress, ProtocolError, ProtocolVersion, Reply, Request, RequestEnvelope,
    Signal,
};

use crate::config::StubConfig;
use crate::error::StubResult;
use crate::socket::Incoming;

const GENERATOR_KEY: &str = "CMAKE_GENERATOR";
const BUILD_TYPE_KEY: &str = "CMAKE_BUILD_TYPE";
const FLOOD_SIZE: usize = 64 * 1024;
const KNOWN_REQUESTS: &[&str] = &[
    "handshake",
    "globalSettings",
    "setGlobalSettings",
    "configure",
    "compute",
    "codemodel",
    "cache",
    "cmakeInputs",
];

/// What the connection loop does after a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write these messages in order.
    Send(Vec<Value>),
    /// Write nothing.
    Silent,
    /// Exit the process with this code.
    Crash(u8),
    /// Close the pipe and keep the process running.
    Hangup,
    /// Write these bytes as they are.
    Raw(Vec<u8>),
}

/// Directories and generator fixed by the handshake.
#[derive(Debug, Clone)]
struct Session {
    source_directory: String,
    build_directory: String,
    generator: String,
    extra_generator: String,
}

/// Flags reported by `globalSettings`.
#[derive(Debug, Clone, Default)]
struct Flags {
    check_system_vars: bool,
    debug_output: bool,
    trace: bool,
    trace_expand: bool,
    warn_uninitialized: bool,
    warn_unused: bool,
    warn_unused_cli: bool,
}

impl Flags {
    fn apply(&mut self, update: &GlobalSettingsUpdate) {
        let fields = [
            (&mut self.check_system_vars, update.check_system_vars),
            (&mut self.debug_output, update.debug_output),
            (&mut self.trace, update.trace),
            (&mut self.trace_expand, update.trace_expand),
            (&mut self.warn_uninitialized, update.warn_uninitialized),
            (&mut self.warn_unused, update.warn_unused),
            (&mut self.warn_unused_cli, update.warn_unused_cli),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

/// Serves one client connection.
#[derive(Debug)]
pub struct StubBackend {
    config: StubConfig,
    session: Option<Session>,
    flags: Flags,
    configured: bool,
    computed: bool,
}

impl StubBackend {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            session: None,
            flags: Flags::default(),
            configured: false,
            computed: false,
        }
    }

    /// The greeting sent as soon as the client connects.
    pub fn hello(&self) -> StubResult<Value> {
        outgoing(
            "hello",
            &Hello {
                supported_protocol_versions: vec![ProtocolVersion {
                    major: 1,
                    minor: 1,
                    is_experimental: false,
                }],
            },
        )
    }

    /// Idle time before a scripted crash.
    pub fn crash_delay(&self) -> Duration {
        self.config.crash_delay
    }

    pub fn is_handshaken(&self) -> bool {
        self.session.is_some()
    }

    /// Handles one request.
    pub fn handle(&mut self, incoming: Incoming) -> StubResult<Action> {
        let envelope = match incoming {
            Incoming::Request(envelope) => envelope,
            Incoming::Invalid {
                cookie,
                kind,
                message,
            } => {
                warn!(cookie = %cookie, kind = %kind, error = %message, "Invalid request");
                let text = if KNOWN_REQUESTS.contains(&kind.as_str()) {
                    format!("Invalid \"{}\" request: {}", kind, message)
                } else {
                    format!("Unknown command \"{}\".", kind)
                };
                return Ok(Action::Send(vec![error(&cookie, &kind, text)?]));
            }
        };

        let kind = envelope.request.kind();
        if self.config.crashes_on(kind) {
            warn!(kind, code = self.config.crash_code, "Crashing on request");
            return Ok(Action::Crash(self.config.crash_code));
        }
        if self.config.hangs_up_on(kind) {
            warn!(kind, "Closing the pipe on request");
            return Ok(Action::Hangup);
        }
        if self.config.sends_garbage_on(kind) {
            warn!(kind, "Answering with a malformed frame");
            return Ok(Action::Raw(malformed_frame()));
        }
        if self.config.floods_on(kind) {
            warn!(kind, bytes = FLOOD_SIZE, "Answering with an unterminated frame");
            return Ok(Action::Raw(unterminated_frame()));
        }
        if self.config.is_silent_on(kind) {
            info!(kind, cookie = %envelope.cookie, "Ignoring request");
            return Ok(Action::Silent);
        }
        debug!(kind, cookie = %envelope.cookie, "Handling request");

        let RequestEnvelope { request, cookie } = envelope;
        let Some(session) = self.session.clone() else {
            let message = match request {
                Request::Handshake(params) => self.handshake(&cookie, params)?,
                _ => error(&cookie, kind, "Waiting for type \"handshake\".")?,
            };
            return Ok(Action::Send(vec![message]));
        };

        let messages = match request {
            Request::Handshake(_) => vec![error(&cookie, kind, "Handshake already done.")?],
            Request::GlobalSettings => {
                vec![reply(&cookie, kind, &self.global_settings(&session))?]
            }
            Request::SetGlobalSettings(update) => {
                self.flags.apply(&update);
                vec![reply(&cookie, kind, &Map::new())?]
            }
            Request::Configure { cache_arguments } => {
                self.configure(&cookie, &session, &cache_arguments)?
            }
            Request::Compute => self.compute(&cookie)?,
            Request::Codemodel if !self.computed => {
                vec![error(&cookie, kind, "No build system was generated yet.")?]
            }
            Request::Codemodel => vec![reply(&cookie, kind, &code_model(&session))?],
            Request::Cache | Request::CmakeInputs if !self.configured => {
                vec![error(&cookie, kind, "This project was not configured yet.")?]
            }
            Request::Cache => match read_cache(&session.build_directory) {
                Ok(content) => vec![reply(&cookie, kind, &content)?],
                Err(message) => vec![error(&cookie, kind, message)?],
            },
            Request::CmakeInputs => vec![reply(&cookie, kind, &cmake_inputs(&session))?],
        };
        Ok(Action::Send(messages))
    }

    fn handshake(&mut self, cookie: &str, params: HandshakeParameters) -> StubResult<Value> {
        const KIND: &str = "handshake";

        if self.config.reject_handshake {
            return error(cookie, KIND, "Protocol version not supported.");
        }
        if params.protocol_version.major != 1 {
            return error(cookie, KIND, "Protocol version not supported.");
        }

        let build_dir = PathBuf::from(&params.build_directory);
        let cache = match CMakeCache::from_path(&cache_path(&build_dir)) {
            Ok(cache) => cache,
            Err(e) => return error(cookie, KIND, e.to_string()),
        };

        let generator = match &cache {
            Some(cache) => {
                if let Some(home) = cache.get(HOME_DIRECTORY_KEY)
                    && home.value != params.source_directory
                {
                    info!(
                        cached = %home.value,
                        requested = %params.source_directory,
                        "Source directory does not match cache"
                    );
                    return error(
                        cookie,
                        KIND,
                        format!(
                            "The source \"{}/CMakeLists.txt\" does not match the source \"{}/CMakeLists.txt\" used to generate cache.  Re-run cmake with a different source directory.",
                            params.source_directory, home.value
                        ),
                    );
                }
                cache
                    .get(GENERATOR_KEY)
                    .map(|entry| entry.value.clone())
                    .or(params.generator.clone())
            }
            None => params.generator.clone(),
        };

        let Some(generator) = generator else {
            return error(
                cookie,
                KIND,
                "No generator was given and no cached generator was found.",
            );
        };

        info!(
            source = %params.source_directory,
            build = %params.build_directory,
            generator = %generator,
            "Handshake accepted"
        );
        self.session = Some(Session {
            source_directory: params.source_directory,
            build_directory: params.build_directory,
            generator,
            extra_generator: params.extra_generator.unwrap_or_default(),
        });
        reply(cookie, KIND, &Map::new())
    }

    fn configure(
        &mut self,
        cookie: &str,
        session: &Session,
        cache_arguments: &[String],
    ) -> StubResult<Vec<Value>> {
        const KIND: &str = "configure";

        let source = Path::new(&session.source_directory);
        if !source.join("CMakeLists.txt").is_file() {
            let message = format!(
                "The source directory \"{}\" does not appear to contain CMakeLists.txt.",
                session.source_directory
            );
            return Ok(vec![error(cookie, KIND, message)?]);
        }

        let mut overrides = Vec::with_capacity(cache_arguments.len());
        for argument in cache_arguments {
            match parse_cache_argument(argument) {
                Some(entry) => overrides.push(entry),
                None => {
                    let message = format!("Parse error in command line argument: {}", argument);
                    return Ok(vec![error(cookie, KIND, message)?]);
                }
            }
        }

        let progress = outgoing(
            "progress",
            &Progress {
                cookie: Some(cookie.to_string()),
                in_reply_to: Some(KIND.to_string()),
                progress_message: "Configuring".to_string(),
                progress_minimum: 0,
                progress_maximum: 2,
                progress_current: 1,
            },
        )?;

        if let Err(e) = write_cache(session, overrides) {
            warn!(error = %e, "Failed to write cache");
            let message = format!("Failed to write cache: {}", e);
            return Ok(vec![progress, error(cookie, KIND, message)?]);
        }
        self.configured = true;
        self.computed = false;

        let notice = outgoing(
            "message",
            &MessageNotice {
                cookie: Some(cookie.to_string()),
                in_reply_to: Some(KIND.to_string()),
                message: "Configuring done".to_string(),
                title: None,
            },
        )?;
        Ok(vec![progress, notice, reply(cookie, KIND, &Map::new())?])
    }

    fn compute(&mut self, cookie: &str) -> StubResult<Vec<Value>> {
        const KIND: &str = "compute";

        if !self.configured {
            return Ok(vec![error(
                cookie,
                KIND,
                "This build system was not yet configured successfully.",
            )?]);
        }
        self.computed = true;

        let mut messages = vec![reply(cookie, KIND, &Map::new())?];
        if self.config.signal_dirty {
            messages.push(Signal::Dirty.to_value());
        }
        Ok(messages)
    }

    fn global_settings(&self, session: &Session) -> GlobalSettings {
        GlobalSettings {
            capabilities: json!({
                "generators": [
                    {"name": "Ninja", "platformSupport": false, "toolsetSupport": false},
                    {"name": "Unix Makefiles", "platformSupport": false, "toolsetSupport": false}
                ],
                "serverMode": true,
                "version": {"major": 3, "minor": 10, "patch": 0, "string": "3.10.0-stub"}
            }),
            check_system_vars: self.flags.check_system_vars,
            debug_output: self.flags.debug_output,
            extra_generator: session.extra_generator.clone(),
            generator: session.generator.clone(),
            source_directory: session.source_directory.clone(),
            build_directory: session.build_directory.clone(),
            trace: self.flags.trace,
            trace_expand: self.flags.trace_expand,
            warn_uninitialized: self.flags.warn_uninitialized,
            warn_unused: self.flags.warn_unused,
            warn_unused_cli: self.flags.warn_unused_cli,
        }
    }
}

/// Serializes `body` and tags it with `type`.
fn outgoing<T: Serialize>(kind: &str, body: &T) -> StubResult<Value> {
    let mut value = serde_json::to_value(body).map_err(ProtocolError::from)?;
    if let Value::Object(object) = &mut value {
        object.insert("type".to_string(), Value::String(kind.to_string()));
    }
    Ok(value)
}

fn reply<T: Serialize>(cookie: &str, in_reply_to: &str, content: &T) -> StubResult<Value> {
    let content = match serde_json::to_value(content).map_err(ProtocolError::from)? {
        Value::Object(object) => object,
        _ => Map::new(),
    };
    outgoing(
        "reply",
        &Reply {
            cookie: cookie.to_string(),
            in_reply_to: in_reply_to.to_string(),
            content,
        },
    )
}

fn error(cookie: &str, in_reply_to: &str, message: impl Into<String>) -> StubResult<Value> {
    outgoing(
        "error",
        &ErrorReply {
            cookie: cookie.to_string(),
            in_reply_to: in_reply_to.to_string(),
            error_message: message.into(),
        },
    )
}

/// `-DKEY=VALUE` or `-DKEY:TYPE=VALUE`.
/// A complete frame whose payload is not JSON.
fn malformed_frame() -> Vec<u8> {
    format!("\n{OPEN_MARKER}\n{{not json\n{CLOSE_MARKER}\n").into_bytes()
}

/// An open marker followed by filler and no close marker.
fn unterminated_frame() -> Vec<u8> {
    let mut bytes = format!("\n{OPEN_MARKER}\n").into_bytes();
    bytes.resize(bytes.len() + FLOOD_SIZE, b'x');
    bytes
}

fn parse_cache_argument(argument: &str) -> Option<(String, String, String)> {
    let definition = argument.strip_prefix("-D")?;
    let (name, value) = definition.split_once('=')?;
    let (key, entry_type) = match name.split_once(':') {
        Some((key, entry_type)) => (key, entry_type.to_ascii_uppercase()),
        None => (name, "UNINITIALIZED".to_string()),
    };
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), entry_type, value.to_string()))
}

fn write_cache(
    session: &Session,
    overrides: Vec<(String, String, String)>,
) -> std::io::Result<()> {
    let build_dir = PathBuf::from(&session.build_directory);
    let path = cache_path(&build_dir);

    // key -> (type, value, help)
    let mut entries: BTreeMap<String, (String, String, String)> = BTreeMap::new();
    if let Ok(Some(existing)) = CMakeCache::from_path(&path) {
        for entry in existing.entries() {
            entries.insert(
                entry.key.clone(),
                (
                    entry.entry_type.to_string(),
                    entry.value.clone(),
                    entry.helpstring.clone(),
                ),
            );
        }
    }
    for (key, entry_type, value) in overrides {
        let help = entries
            .get(&key)
            .map(|(_, _, help)| help.clone())
            .unwrap_or_else(|| "No help, variable specified on the command line.".to_string());
        entries.insert(key, (entry_type, value, help));
    }
    entries.insert(
        HOME_DIRECTORY_KEY.to_string(),
        (
            "INTERNAL".to_string(),
            session.source_directory.clone(),
            "Source directory with the top level CMakeLists.txt file for this project".to_string(),
        ),
    );
    entries.insert(
        GENERATOR_KEY.to_string(),
        (
            "INTERNAL".to_string(),
            session.generator.clone(),
            "Name of generator.".to_string(),
        ),
    );

    let mut text = String::from("# This is the CMakeCache file.\n\n");
    for (key, (entry_type, value, help)) in &entries {
        for line in help.lines() {
            text.push_str("//");
            text.push_str(line);
            text.push('\n');
        }
        text.push_str(&format!("{}:{}={}\n\n", key, entry_type, value));
    }

    std::fs::create_dir_all(&build_dir)?;
    std::fs::write(&path, text)?;
    debug!(path = %path.display(), entries = entries.len(), "Wrote cache");
    Ok(())
}

fn read_cache(build_directory: &str) -> Result<CacheContent, String> {
    let path = cache_path(Path::new(build_directory));
    let cache = CMakeCache::from_path(&path)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("No cache found at {}.", path.display()))?;

    let cache = cache
        .entries()
        .map(|entry| {
            let mut properties = BTreeMap::new();
            if !entry.helpstring.is_empty() {
                properties.insert("HELPSTRING".to_string(), entry.helpstring.clone());
            }
            CacheEntry {
                key: entry.key.clone(),
                entry_type: entry.entry_type.to_string(),
                value: entry.value.clone(),
                properties,
            }
        })
        .collect();
    Ok(CacheContent { cache })
}

fn project_name(session: &Session) -> String {
    Path::new(&session.source_directory)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Project".to_string())
}

fn code_model(session: &Session) -> CodeModel {
    let build_type = read_cache(&session.build_directory)
        .ok()
        .and_then(|content| content.get(BUILD_TYPE_KEY).map(|e| e.value.clone()))
        .unwrap_or_default();

    let target = CodeModelTarget {
        name: "app".to_string(),
        target_type: "EXECUTABLE".to_string(),
        full_name: Some("app".to_string()),
        artifacts: vec![format!("{}/app", session.build_directory)],
        source_directory: session.source_directory.clone(),
        build_directory: session.build_directory.clone(),
        file_groups: vec![CodeModelFileGroup {
            language: Some("CXX".to_string()),
            compile_flags: Some(String::new()),
            sources: vec!["main.cpp".to_string()],
            is_generated: false,
            include_path: Vec::new(),
            defines: Vec::new(),
        }],
    };

    CodeModel {
        configurations: vec![CodeModelConfiguration {
            name: build_type,
            projects: vec![CodeModelProject {
                name: project_name(session),
                source_directory: session.source_directory.clone(),
                build_directory: session.build_directory.clone(),
                targets: vec![target],
            }],
        }],
    }
}

fn cmake_inputs(session: &Session) -> CmakeInputs {
    CmakeInputs {
        build_files: vec![
            BuildFiles {
                is_cmake: false,
                is_temporary: false,
                sources: vec!["CMakeLists.txt".to_string()],
            },
            BuildFiles {
                is_cmake: true,
                is_temporary: false,
                sources: vec!["Modules/CMakeCXXInformation.cmake".to_string()],
            },
        ],
        cmake_root_directory: "/usr/share/cmake-stub".to_string(),
        source_directory: session.source_directory.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmserver_protocol::{Envelope, MessageFramer, VersionRequest};
    use tempfile::{TempDir, tempdir};

    struct Project {
        _dir: TempDir,
        source: String,
        build: String,
    }

    fn project() -> Project {
        let dir = tempdir().unwrap();
        let source = dir.path().join("hello");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("CMakeLists.txt"), "project(hello)\n").unwrap();
        let build = dir.path().join("build");
        Project {
            source: source.to_string_lossy().into_owned(),
            build: build.to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    fn request(cookie: &str, request: Request) -> Incoming {
        Incoming::Request(RequestEnvelope::new(cookie, request))
    }

    fn handshake(project: &Project, generator: Option<&str>) -> Incoming {
        request(
            "0",
            Request::Handshake(HandshakeParameters {
                source_directory: project.source.clone(),
                build_directory: project.build.clone(),
                generator: generator.map(str::to_string),
                extra_generator: None,
                platform: None,
                toolset: None,
                protocol_version: VersionRequest { major: 1, minor: 1 },
            }),
        )
    }

    fn decoded(action: Action) -> Vec<Envelope> {
        match action {
            Action::Send(messages) => messages
                .iter()
                .map(|m| Envelope::decode(&m.to_string()).unwrap())
                .collect(),
            other => panic!("expected messages, got {other:?}"),
        }
    }

    fn error_text(action: Action) -> String {
        match decoded(action).remove(0) {
            Envelope::Error(e) => e.error_message,
            other => panic!("expected error, got {other:?}"),
        }
    }

    fn ready(project: &Project) -> StubBackend {
        let mut backend = StubBackend::new(StubConfig::new("/unused"));
        let messages = decoded(backend.handle(handshake(project, Some("Ninja"))).unwrap());
        assert!(matches!(messages[0], Envelope::HandshakeReply(_)));
        backend
    }

    #[test]
    fn hello_advertises_version_one_one() {
        let backend = StubBackend::new(StubConfig::new("/unused"));
        let hello = Envelope::decode(&backend.hello().unwrap().to_string()).unwrap();
        match hello {
            Envelope::Hello(hello) => {
                assert_eq!(hello.supported_protocol_versions.len(), 1);
                assert_eq!(hello.supported_protocol_versions[0].request().major, 1);
                assert_eq!(hello.supported_protocol_versions[0].request().minor, 1);
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn requests_before_handshake_are_refused() {
        let mut backend = StubBackend::new(StubConfig::new("/unused"));
        let text = error_text(backend.handle(request("1", Request::Compute)).unwrap());
        assert_eq!(text, "Waiting for type \"handshake\".");
        assert!(!backend.is_handshaken());
    }

    #[test]
    fn handshake_without_cache_needs_a_generator() {
        let project = project();
        let mut backend = StubBackend::new(StubConfig::new("/unused"));
        let text = error_text(backend.handle(handshake(&project, None)).unwrap());
        assert!(text.contains("No generator"));
    }

    #[test]
    fn configure_reports_progress_then_message_then_reply() {
        let project = project();
        let mut backend = ready(&project);

        let messages = decoded(
            backend
                .handle(request(
                    "1",
                    Request::configure(vec!["-DCMAKE_BUILD_TYPE:STRING=Debug".to_string()]),
                ))
                .unwrap(),
        );
        assert_eq!(messages.len(), 3);
        match &messages[0] {
            Envelope::Progress(p) => {
                assert_eq!(p.cookie.as_deref(), Some("1"));
                assert_eq!(
                    (p.progress_minimum, p.progress_maximum, p.progress_current),
                    (0, 2, 1)
                );
            }
            other => panic!("expected progress, got {other:?}"),
        }
        assert!(matches!(messages[1], Envelope::Message(_)));
        assert!(matches!(&messages[2], Envelope::Reply(r) if r.in_reply_to == "configure"));

        let cache = CMakeCache::from_path(&cache_path(Path::new(&project.build)))
            .unwrap()
            .unwrap();
        assert_eq!(cache.get(HOME_DIRECTORY_KEY).unwrap().value, project.source);
        assert_eq!(cache.get(GENERATOR_KEY).unwrap().value, "Ninja");
        assert_eq!(cache.get(BUILD_TYPE_KEY).unwrap().value, "Debug");
    }

    #[test]
    fn configure_requires_a_project_file() {
        let project = project();
        std::fs::remove_file(Path::new(&project.source).join("CMakeLists.txt")).unwrap();
        let mut backend = ready(&project);

        let text = error_text(
            backend
                .handle(request("1", Request::configure(Vec::new())))
                .unwrap(),
        );
        assert!(text.contains("does not appear to contain CMakeLists.txt"));
    }

    #[test]
    fn second_session_must_use_cached_home_directory() {
        let project = project();
        let mut backend = ready(&project);
        backend
            .handle(request("1", Request::configure(Vec::new())))
            .unwrap();

        let moved = Project {
            _dir: tempdir().unwrap(),
            source: format!("{}/", project.source),
            build: project.build.clone(),
        };
        let mut fresh = StubBackend::new(StubConfig::new("/unused"));
        let text = error_text(fresh.handle(handshake(&moved, None)).unwrap());
        assert_eq!(
            text,
            format!(
                "The source \"{}//CMakeLists.txt\" does not match the source \"{}/CMakeLists.txt\" used to generate cache.  Re-run cmake with a different source directory.",
                project.source, project.source
            )
        );

        let mut cached = StubBackend::new(StubConfig::new("/unused"));
        let messages = decoded(cached.handle(handshake(&project, None)).unwrap());
        assert!(matches!(messages[0], Envelope::HandshakeReply(_)));
    }

    #[test]
    fn codemodel_needs_compute() {
        let project = project();
        let mut backend = ready(&project);
        backend
            .handle(request("1", Request::configure(Vec::new())))
            .unwrap();

        let text = error_text(backend.handle(request("2", Request::Codemodel)).unwrap());
        assert_eq!(text, "No build system was generated yet.");

        backend.handle(request("3", Request::Compute)).unwrap();
        let messages = decoded(backend.handle(request("4", Request::Codemodel)).unwrap());
        let Envelope::Reply(reply) = &messages[0] else {
            panic!("expected reply");
        };
        let model: CodeModel = serde_json::from_value(Value::Object(reply.content.clone())).unwrap();
        let names: Vec<_> = model.targets().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["app"]);
        assert_eq!(model.configurations[0].projects[0].name, "hello");
    }

    #[test]
    fn compute_can_signal_dirty() {
        let project = project();
        let mut backend = ready(&project);
        backend.config = backend.config.clone().with_signal_dirty(true);
        backend
            .handle(request("1", Request::configure(Vec::new())))
            .unwrap();

        let messages = decoded(backend.handle(request("2", Request::Compute)).unwrap());
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[1], Envelope::Signal(Signal::Dirty)));
    }

    #[test]
    fn global_settings_reflect_updates() {
        let project = project();
        let mut backend = ready(&project);
        backend
            .handle(request(
                "1",
                Request::SetGlobalSettings(GlobalSettingsUpdate::new().trace(true)),
            ))
            .unwrap();

        let messages = decoded(backend.handle(request("2", Request::GlobalSettings)).unwrap());
        let Envelope::Reply(reply) = &messages[0] else {
            panic!("expected reply");
        };
        let settings: GlobalSettings =
            serde_json::from_value(Value::Object(reply.content.clone())).unwrap();
        assert!(settings.trace);
        assert!(!settings.debug_output);
        assert_eq!(settings.generator, "Ninja");
        assert_eq!(settings.source_directory, project.source);
    }

    #[test]
    fn cache_lists_written_entries() {
        let project = project();
        let mut backend = ready(&project);
        backend
            .handle(request(
                "1",
                Request::configure(vec!["-DFOO=bar".to_string()]),
            ))
            .unwrap();

        let messages = decoded(backend.handle(request("2", Request::Cache)).unwrap());
        let Envelope::Reply(reply) = &messages[0] else {
            panic!("expected reply");
        };
        let content: CacheContent =
            serde_json::from_value(Value::Object(reply.content.clone())).unwrap();
        let foo = content.get("FOO").unwrap();
        assert_eq!(foo.value, "bar");
        assert_eq!(foo.entry_type, "UNINITIALIZED");
        assert!(content.get(HOME_DIRECTORY_KEY).is_some());
    }

    #[test]
    fn faults_take_precedence() {
        let project = project();
        let config = StubConfig::new("/unused")
            .with_crash_on(["compute"])
            .with_crash_code(7)
            .with_silent_on(["cache"]);
        let mut backend = StubBackend::new(config);
        backend.handle(handshake(&project, Some("Ninja"))).unwrap();

        assert_eq!(
            backend.handle(request("1", Request::Cache)).unwrap(),
            Action::Silent
        );
        assert_eq!(
            backend.handle(request("2", Request::Compute)).unwrap(),
            Action::Crash(7)
        );
    }

    #[test]
    fn transport_faults_replace_the_answer() {
        let project = project();
        let config = StubConfig::new("/unused")
            .with_hangup_on(["compute"])
            .with_garbage_on(["cache"])
            .with_flood_on(["codemodel"]);
        let mut backend = StubBackend::new(config);
        backend.handle(handshake(&project, Some("Ninja"))).unwrap();

        assert_eq!(
            backend.handle(request("1", Request::Compute)).unwrap(),
            Action::Hangup
        );

        let Action::Raw(garbage) = backend.handle(request("2", Request::Cache)).unwrap() else {
            panic!("expected raw bytes");
        };
        let mut framer = MessageFramer::new();
        let payloads = framer.feed(&garbage).unwrap();
        assert_eq!(payloads, vec!["{not json".to_string()]);
        assert!(Envelope::decode(&payloads[0]).is_err());

        let Action::Raw(flood) = backend.handle(request("3", Request::Codemodel)).unwrap() else {
            panic!("expected raw bytes");
        };
        let mut framer = MessageFramer::with_max_buffer_size(4096);
        assert!(matches!(
            framer.feed(&flood),
            Err(ProtocolError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn rejected_handshake_is_an_error() {
        let project = project();
        let mut backend = StubBackend::new(StubConfig::new("/unused").with_reject_handshake(true));
        let text = error_text(backend.handle(handshake(&project, Some("Ninja"))).unwrap());
        assert_eq!(text, "Protocol version not supported.");
    }

    #[test]
    fn unknown_commands_get_an_error() {
        let mut backend = StubBackend::new(StubConfig::new("/unused"));
        let action = backend
            .handle(Incoming::Invalid {
                cookie: "9".to_string(),
                kind: "frobnicate".to_string(),
                message: "unknown variant".to_string(),
            })
            .unwrap();
        let messages = decoded(action);
        match &messages[0] {
            Envelope::Error(e) => {
                assert_eq!(e.cookie, "9");
                assert_eq!(e.in_reply_to, "frobnicate");
                assert_eq!(e.error_message, "Unknown command \"frobnicate\".");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn cache_arguments_parse() {
        assert_eq!(
            parse_cache_argument("-DA:bool=ON"),
            Some(("A".into(), "BOOL".into(), "ON".into()))
        );
        assert_eq!(
            parse_cache_argument("-DB=x=y"),
            Some(("B".into(), "UNINITIALIZED".into(), "x=y".into()))
        );
        assert_eq!(parse_cache_argument("-D=1"), None);
        assert_eq!(parse_cache_argument("FOO=1"), None);
    }
}
