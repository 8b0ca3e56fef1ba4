//! Handshake parameter selection.
//!
//! The backend compares the handshake's source directory byte-for-byte with
//! the home directory recorded in an existing cache, so when a cache exists
//! its value is sent unchanged and no generator is sent. Without a cache the
//! caller's generator selector decides.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use cmserver_core::{CacheFileReader, CacheReader, cache_path};
use cmserver_protocol::{HandshakeParameters, Hello, ProtocolVersion};

use crate::error::StartupError;

/// Generator picked for a clean build directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorChoice {
    pub name: String,
    pub platform: Option<String>,
    pub toolset: Option<String>,
    pub extra_generator: Option<String>,
}

impl GeneratorChoice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: None,
            toolset: None,
            extra_generator: None,
        }
    }

    /// Builder: set platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Builder: set toolset.
    pub fn with_toolset(mut self, toolset: impl Into<String>) -> Self {
        self.toolset = Some(toolset.into());
        self
    }

    /// Builder: set extra generator.
    pub fn with_extra_generator(mut self, extra: impl Into<String>) -> Self {
        self.extra_generator = Some(extra.into());
        self
    }
}

/// Future returned by a [`GeneratorSelector`].
pub type GeneratorFuture = Pin<Box<dyn Future<Output = Option<GeneratorChoice>> + Send>>;

/// Async callback choosing a generator; `None` means nothing usable.
pub type GeneratorSelector = Arc<dyn Fn() -> GeneratorFuture + Send + Sync>;

/// Builds [`HandshakeParameters`] from a `hello`.
pub struct HandshakeNegotiator {
    source_dir: String,
    build_dir: String,
    cache_reader: Arc<dyn CacheReader>,
    selector: GeneratorSelector,
}

impl std::fmt::Debug for HandshakeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeNegotiator")
            .field("source_dir", &self.source_dir)
            .field("build_dir", &self.build_dir)
            .finish_non_exhaustive()
    }
}

impl HandshakeNegotiator {
    /// Creates a negotiator reading `<build_dir>/CMakeCache.txt`.
    pub fn new(
        source_dir: impl Into<String>,
        build_dir: impl Into<String>,
        selector: GeneratorSelector,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            build_dir: build_dir.into(),
            cache_reader: Arc::new(CacheFileReader),
            selector,
        }
    }

    /// Builder: set cache reader.
    pub fn with_cache_reader(mut self, reader: Arc<dyn CacheReader>) -> Self {
        self.cache_reader = reader;
        self
    }

    pub fn build_dir(&self) -> &str {
        &self.build_dir
    }

    /// The backend lists its preferred version first.
    pub fn select_version(hello: &Hello) -> Result<ProtocolVersion, StartupError> {
        hello
            .supported_protocol_versions
            .first()
            .copied()
            .ok_or(StartupError::UnsupportedProtocol)
    }

    /// Decides the handshake parameters.
    ///
    /// # Errors
    ///
    /// [`StartupError::UnsupportedProtocol`] for an empty version list,
    /// [`StartupError::NoGenerator`] if a clean build has no generator, and
    /// [`StartupError::Cache`] if the existing cache cannot be read.
    pub async fn parameters(&self, hello: &Hello) -> Result<HandshakeParameters, StartupError> {
        let version = Self::select_version(hello)?;
        debug!(
            major = version.major,
            minor = version.minor,
            experimental = version.is_experimental,
            "selected protocol version"
        );

        let cached_home = self.cache_reader.home_directory(Path::new(&self.build_dir))?;
        if let Some(home) = cached_home {
            if home != self.source_dir {
                info!(
                    cached = %home,
                    requested = %self.source_dir,
                    "using source directory recorded in cache"
                );
            }
            return Ok(HandshakeParameters {
                source_directory: home,
                build_directory: self.build_dir.clone(),
                generator: None,
                extra_generator: None,
                platform: None,
                toolset: None,
                protocol_version: version.request(),
            });
        }

        let choice = (self.selector)().await.ok_or(StartupError::NoGenerator)?;
        info!(generator = %choice.name, "clean build directory, using selected generator");
        Ok(HandshakeParameters {
            source_directory: self.source_dir.clone(),
            build_directory: self.build_dir.clone(),
            generator: Some(choice.name),
            extra_generator: choice.extra_generator,
            platform: choice.platform,
            toolset: choice.toolset,
            protocol_version: version.request(),
        })
    }
}

static BAD_HOME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"The source "(?P<expecting>[^"]*?)(?:/CMakeLists\.txt)?" does not match the source "(?P<cached>[^"]*?)(?:/CMakeLists\.txt)?" used to generate cache"#,
    )
    .expect("Invalid cache mismatch regex")
});

/// Maps the backend's handshake error text to a [`StartupError`].
pub fn classify_handshake_error(message: &str, build_dir: &Path) -> StartupError {
    match BAD_HOME_REGEX.captures(message) {
        Some(caps) => StartupError::BadHomeDirectory {
            cached: caps["cached"].to_string(),
            expecting: caps["expecting"].to_string(),
            cache_path: cache_path(build_dir).display().to_string(),
        },
        None => StartupError::HandshakeRejected {
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cmserver_core::CacheResult;

    use super::*;

    struct FixedCache(Option<&'static str>);

    impl CacheReader for FixedCache {
        fn home_directory(&self, _build_dir: &Path) -> CacheResult<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    fn hello(versions: &[(u32, u32)]) -> Hello {
        Hello {
            supported_protocol_versions: versions
                .iter()
                .map(|&(major, minor)| ProtocolVersion {
                    major,
                    minor,
                    is_experimental: false,
                })
                .collect(),
        }
    }

    fn counting_selector(
        choice: Option<GeneratorChoice>,
    ) -> (GeneratorSelector, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let selector: GeneratorSelector = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let choice = choice.clone();
            Box::pin(async move { choice })
        });
        (selector, calls)
    }

    #[tokio::test]
    async fn cached_home_directory_wins_verbatim() {
        let (selector, calls) = counting_selector(Some(GeneratorChoice::new("Ninja")));
        let negotiator = HandshakeNegotiator::new("/a/B", "/a/b/build", selector)
            .with_cache_reader(Arc::new(FixedCache(Some("/a/b"))));

        let params = negotiator.parameters(&hello(&[(1, 1)])).await.unwrap();

        assert_eq!(params.source_directory, "/a/b");
        assert_eq!(params.build_directory, "/a/b/build");
        assert_eq!(params.generator, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clean_build_uses_selected_generator() {
        let choice = GeneratorChoice::new("Visual Studio 17 2022")
            .with_platform("x64")
            .with_toolset("v143");
        let (selector, calls) = counting_selector(Some(choice));
        let negotiator = HandshakeNegotiator::new("/src", "/src/build", selector)
            .with_cache_reader(Arc::new(FixedCache(None)));

        let params = negotiator.parameters(&hello(&[(1, 2), (1, 0)])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(params.source_directory, "/src");
        assert_eq!(params.generator.as_deref(), Some("Visual Studio 17 2022"));
        assert_eq!(params.platform.as_deref(), Some("x64"));
        assert_eq!(params.toolset.as_deref(), Some("v143"));
        assert_eq!(params.protocol_version.major, 1);
        assert_eq!(params.protocol_version.minor, 2);
    }

    #[tokio::test]
    async fn no_generator_is_an_error() {
        let (selector, _) = counting_selector(None);
        let negotiator = HandshakeNegotiator::new("/src", "/build", selector)
            .with_cache_reader(Arc::new(FixedCache(None)));

        let err = negotiator.parameters(&hello(&[(1, 1)])).await.unwrap_err();
        assert!(matches!(err, StartupError::NoGenerator));
    }

    #[tokio::test]
    async fn empty_version_list_is_unsupported() {
        let (selector, calls) = counting_selector(Some(GeneratorChoice::new("Ninja")));
        let negotiator = HandshakeNegotiator::new("/src", "/build", selector)
            .with_cache_reader(Arc::new(FixedCache(None)));

        let err = negotiator.parameters(&hello(&[])).await.unwrap_err();
        assert!(matches!(err, StartupError::UnsupportedProtocol));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reads_real_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            cache_path(dir.path()),
            "CMAKE_HOME_DIRECTORY:INTERNAL=/a/b\nCMAKE_GENERATOR:INTERNAL=Ninja\n",
        )
        .unwrap();

        let (selector, _) = counting_selector(None);
        let build = dir.path().display().to_string();
        let negotiator = HandshakeNegotiator::new("/a/B", build, selector);

        let params = negotiator.parameters(&hello(&[(1, 1)])).await.unwrap();
        assert_eq!(params.source_directory, "/a/b");
    }

    #[test]
    fn mismatch_message_becomes_bad_home_directory() {
        let message = "The source \"/a/B/CMakeLists.txt\" does not match the source \
                       \"/a/b/CMakeLists.txt\" used to generate cache.  Re-run cmake with a \
                       different source directory.";
        let err = classify_handshake_error(message, Path::new("/a/b/build"));

        match err {
            StartupError::BadHomeDirectory {
                cached,
                expecting,
                cache_path,
            } => {
                assert_eq!(cached, "/a/b");
                assert_eq!(expecting, "/a/B");
                assert!(cache_path.ends_with("CMakeCache.txt"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_messages_are_plain_rejections() {
        let err = classify_handshake_error("Failed to activate protocol version", Path::new("/b"));
        assert!(
            matches!(err, StartupError::HandshakeRejected { ref message } if message.contains("protocol"))
        );
    }
}
