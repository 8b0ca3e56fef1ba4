//! Core pieces shared by the cmserver crates: tracing setup, environment
//! merging and the `CMakeCache.txt` reader.

pub mod cache;
pub mod env;
pub mod tracing;

pub use cache::{
    CACHE_FILE_NAME, CMakeCache, CacheEntryType, CacheError, CacheFileEntry, CacheFileReader,
    CacheReader, CacheResult, HOME_DIRECTORY_KEY, cache_path,
};
pub use env::{Environment, NameMatching, current_environment, merge_environment};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
