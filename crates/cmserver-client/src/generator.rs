//! Default generator selection by probing `PATH`.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::config::GeneratorSettings;
use crate::handshake::{GeneratorChoice, GeneratorSelector};

/// Build program a generator needs on `PATH`, if it needs one.
pub fn build_program(generator: &str) -> Option<&'static str> {
    match generator {
        "Ninja" | "Ninja Multi-Config" => Some("ninja"),
        "Unix Makefiles" | "MSYS Makefiles" => Some("make"),
        "MinGW Makefiles" => Some("mingw32-make"),
        "NMake Makefiles" => Some("nmake"),
        "Watcom WMake" => Some("wmake"),
        _ => None,
    }
}

/// Looks `program` up in a `PATH`-style list of directories.
pub fn find_program(program: &str, path_var: &OsStr) -> Option<PathBuf> {
    let names: Vec<String> = if cfg!(windows) {
        vec![format!("{program}.exe"), program.to_string()]
    } else {
        vec![program.to_string()]
    };

    std::env::split_paths(path_var).find_map(|dir| {
        names
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

/// First generator in `preferred` that is usable here.
///
/// Generators with a known build program are usable when it is on `PATH`;
/// Visual Studio and Xcode generators are accepted on their own platform.
pub fn first_available(preferred: &[String], path_var: &OsStr) -> Option<String> {
    preferred
        .iter()
        .find(|name| match build_program(name) {
            Some(program) => {
                let found = find_program(program, path_var);
                debug!(generator = %name, program, found = found.is_some(), "probing generator");
                found.is_some()
            }
            None if name.starts_with("Visual Studio") => cfg!(windows),
            None if name.as_str() == "Xcode" => cfg!(target_os = "macos"),
            None => false,
        })
        .cloned()
}

/// Selector choosing from `settings.preferred` by probing the current `PATH`.
pub fn preferred_generator_selector(settings: GeneratorSettings) -> GeneratorSelector {
    let settings = Arc::new(settings);
    Arc::new(move || {
        let settings = settings.clone();
        Box::pin(async move {
            let path_var = std::env::var_os("PATH").unwrap_or_default();
            let name = first_available(&settings.preferred, &path_var)?;
            Some(settings.choice(name))
        })
    })
}

/// Selector that always returns `choice`.
pub fn fixed_selector(choice: Option<GeneratorChoice>) -> GeneratorSelector {
    Arc::new(move || {
        let choice = choice.clone();
        Box::pin(async move { choice })
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::ffi::OsString;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    fn fake_program(dir: &std::path::Path, name: &str) {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn known_generators_map_to_programs() {
        assert_eq!(build_program("Ninja"), Some("ninja"));
        assert_eq!(build_program("Unix Makefiles"), Some("make"));
        assert_eq!(build_program("Visual Studio 17 2022"), None);
    }

    #[test]
    fn skips_generators_without_their_program() {
        let dir = tempdir().unwrap();
        fake_program(dir.path(), "make");
        let path_var = OsString::from(dir.path());

        let preferred = vec!["Ninja".to_string(), "Unix Makefiles".to_string()];
        assert_eq!(
            first_available(&preferred, &path_var).as_deref(),
            Some("Unix Makefiles")
        );
    }

    #[test]
    fn nothing_available_yields_none() {
        let dir = tempdir().unwrap();
        let path_var = OsString::from(dir.path());
        let preferred = vec!["Ninja".to_string(), "Visual Studio 17 2022".to_string()];
        assert_eq!(first_available(&preferred, &path_var), None);
    }

    #[test]
    fn find_program_searches_every_entry() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        fake_program(second.path(), "ninja");

        let path_var = std::env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(
            find_program("ninja", &path_var),
            Some(second.path().join("ninja"))
        );
    }

    #[tokio::test]
    async fn fixed_selector_returns_its_choice() {
        let selector = fixed_selector(Some(GeneratorChoice::new("Ninja")));
        assert_eq!(selector().await, Some(GeneratorChoice::new("Ninja")));
        assert_eq!(fixed_selector(None)().await, None);
    }
}
