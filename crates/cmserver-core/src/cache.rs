//! Reader for `CMakeCache.txt`.
//!
//! The cache is a line-oriented file:
//!
//! ```text
//! # comment
//! //Help text for the next entry
//! CMAKE_BUILD_TYPE:STRING=Debug
//! "KEY WITH:COLON":INTERNAL=value
//! ```
//!
//! Only the parts needed before a handshake are modelled; the backend owns
//! everything else in the file.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// File name of the cache inside a build directory.
pub const CACHE_FILE_NAME: &str = "CMakeCache.txt";

/// Entry recording the source directory the cache was generated from.
pub const HOME_DIRECTORY_KEY: &str = "CMAKE_HOME_DIRECTORY";

static ENTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^("[^"]*"|[^:=]+):([^=]+)=(.*)$"#).expect("Invalid cache entry regex")
});

/// Errors raised while reading a cache file.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Declared type of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntryType {
    Bool,
    String,
    Path,
    Filepath,
    Internal,
    Static,
    Uninitialized,
    Other(String),
}

impl CacheEntryType {
    fn parse(raw: &str) -> Self {
        match raw {
            "BOOL" => Self::Bool,
            "STRING" => Self::String,
            "PATH" => Self::Path,
            "FILEPATH" => Self::Filepath,
            "INTERNAL" => Self::Internal,
            "STATIC" => Self::Static,
            "UNINITIALIZED" => Self::Uninitialized,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CacheEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "BOOL",
            Self::String => "STRING",
            Self::Path => "PATH",
            Self::Filepath => "FILEPATH",
            Self::Internal => "INTERNAL",
            Self::Static => "STATIC",
            Self::Uninitialized => "UNINITIALIZED",
            Self::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// One `KEY:TYPE=VALUE` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFileEntry {
    pub key: String,
    pub entry_type: CacheEntryType,
    pub value: String,
    /// Text of the `//` lines directly above the entry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helpstring: String,
}

/// Parsed contents of a cache file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CMakeCache {
    entries: BTreeMap<String, CacheFileEntry>,
}

impl CMakeCache {
    /// Parses cache text. Lines that are not entries are ignored.
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut help = Vec::new();

        for line in content.lines() {
            // Trailing blanks belong to the value.
            let trimmed = line.trim_end_matches('\r').trim_start();

            if let Some(text) = trimmed.strip_prefix("//") {
                help.push(text.to_string());
                continue;
            }
            if trimmed.is_empty() || trimmed.starts_with('#') {
                help.clear();
                continue;
            }

            let Some(caps) = ENTRY_REGEX.captures(trimmed) else {
                debug!(line = trimmed, "skipping unparseable cache line");
                help.clear();
                continue;
            };

            let key = caps[1].trim_matches('"').to_string();
            let entry = CacheFileEntry {
                key: key.clone(),
                entry_type: CacheEntryType::parse(&caps[2]),
                value: caps[3].to_string(),
                helpstring: help.join("\n"),
            };
            help.clear();
            entries.insert(key, entry);
        }

        Self { entries }
    }

    /// Reads and parses `path`. A missing file yields `Ok(None)`.
    pub fn from_path(path: &Path) -> CacheResult<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(Self::parse(&content))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Looks up an entry by key.
    pub fn get(&self, key: &str) -> Option<&CacheFileEntry> {
        self.entries.get(key)
    }

    /// All entries, ordered by key.
    pub fn entries(&self) -> impl Iterator<Item = &CacheFileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Path of the cache file inside `build_dir`.
pub fn cache_path(build_dir: &Path) -> PathBuf {
    build_dir.join(CACHE_FILE_NAME)
}

/// Source of the "home directory" recorded by a previous configure.
pub trait CacheReader: Send + Sync {
    /// Returns the recorded source directory for `build_dir`, or `None` when no
    /// cache exists there.
    fn home_directory(&self, build_dir: &Path) -> CacheResult<Option<String>>;
}

/// [`CacheReader`] backed by `<build_dir>/CMakeCache.txt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFileReader;

impl CacheReader for CacheFileReader {
    fn home_directory(&self, build_dir: &Path) -> CacheResult<Option<String>> {
        let path = cache_path(build_dir);
        let Some(cache) = CMakeCache::from_path(&path)? else {
            return Ok(None);
        };
        let home = cache.get(HOME_DIRECTORY_KEY).map(|e| e.value.clone());
        if home.is_none() {
            debug!(path = %path.display(), "cache has no home directory entry");
        }
        Ok(home)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
# This is the CMakeCache file.
# For build in directory: /work/build

//Choose the type of build.
//Second help line.
CMAKE_BUILD_TYPE:STRING=Debug

//Value Computed by CMake
CMAKE_HOME_DIRECTORY:INTERNAL=/work/src
\"ODD:KEY\":BOOL=OFF
BUILD_TESTING:BOOL=ON
not an entry
";

    #[test]
    fn parses_entries_and_help() {
        let cache = CMakeCache::parse(SAMPLE);
        assert_eq!(cache.len(), 4);

        let build_type = cache.get("CMAKE_BUILD_TYPE").unwrap();
        assert_eq!(build_type.entry_type, CacheEntryType::String);
        assert_eq!(build_type.value, "Debug");
        assert_eq!(
            build_type.helpstring,
            "Choose the type of build.\nSecond help line."
        );

        let home = cache.get(HOME_DIRECTORY_KEY).unwrap();
        assert_eq!(home.value, "/work/src");
        assert_eq!(home.entry_type, CacheEntryType::Internal);
    }

    #[test]
    fn quoted_keys_may_contain_colons() {
        let cache = CMakeCache::parse(SAMPLE);
        let odd = cache.get("ODD:KEY").unwrap();
        assert_eq!(odd.entry_type, CacheEntryType::Bool);
        assert_eq!(odd.value, "OFF");
        assert_eq!(cache.get("BUILD_TESTING").unwrap().value, "ON");
    }

    #[test]
    fn values_keep_equals_and_spaces() {
        let cache = CMakeCache::parse("  FLAGS:STRING=-DX=1 -DY=2 \r\n");
        assert_eq!(cache.get("FLAGS").unwrap().value, "-DX=1 -DY=2 ");
    }

    #[test]
    fn reader_returns_none_without_cache() {
        let dir = tempdir().unwrap();
        let home = CacheFileReader.home_directory(dir.path()).unwrap();
        assert!(home.is_none());
    }

    #[test]
    fn reader_returns_recorded_home_verbatim() {
        let dir = tempdir().unwrap();
        std::fs::write(
            cache_path(dir.path()),
            "CMAKE_HOME_DIRECTORY:INTERNAL=/a/b\n",
        )
        .unwrap();

        let home = CacheFileReader.home_directory(dir.path()).unwrap();
        assert_eq!(home.as_deref(), Some("/a/b"));
    }

    #[test]
    fn reader_keeps_trailing_blanks_in_home() {
        let dir = tempdir().unwrap();
        std::fs::write(
            cache_path(dir.path()),
            "CMAKE_HOME_DIRECTORY:INTERNAL=/a/b \t\r\n",
        )
        .unwrap();

        let home = CacheFileReader.home_directory(dir.path()).unwrap();
        assert_eq!(home.as_deref(), Some("/a/b \t"));
    }
}
