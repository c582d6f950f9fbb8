//! Configuration file lookup.
//!
//! An explicit `--config` wins. Otherwise the first existing file among
//! [`search_path`] is used.

use std::path::{Path, PathBuf};

use instalog_core::InstalogConfig;
use tracing::debug;

use crate::error::CliError;

/// Candidate locations, in order.
pub fn search_path() -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(5);
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("instalog.yaml"));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".instalog.yaml"));
    }
    candidates.push(PathBuf::from("/etc/instalog.yaml"));
    candidates.push(PathBuf::from("/run/instalog.yaml"));
    candidates
}

/// Picks the configuration file to use.
pub fn find_config(explicit: Option<&Path>, candidates: &[PathBuf]) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(CliError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| {
            let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            CliError::Config(format!(
                "no configuration file found (searched {})",
                searched.join(", ")
            ))
        })
}

/// Finds and loads the configuration.
pub async fn load(explicit: Option<&Path>) -> Result<(PathBuf, InstalogConfig), CliError> {
    let path = find_config(explicit, &search_path())?;
    debug!(path = %path.display(), "using configuration");
    let config = InstalogConfig::load(&path).await?;
    Ok((path, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        let err = find_config(Some(&missing), &[]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn first_existing_candidate_wins() {
        // Given: the second and third candidates exist
        let dir = tempfile::tempdir().unwrap();
        let candidates: Vec<PathBuf> = ["a.yaml", "b.yaml", "c.yaml"]
            .iter()
            .map(|n| dir.path().join(n))
            .collect();
        std::fs::write(&candidates[1], "instalog: {node_id: n}").unwrap();
        std::fs::write(&candidates[2], "instalog: {node_id: n}").unwrap();

        // When / Then
        assert_eq!(find_config(None, &candidates).unwrap(), candidates[1]);
    }

    #[test]
    fn nothing_found_lists_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = vec![dir.path().join("x.yaml")];
        let err = find_config(None, &candidates).unwrap_err().to_string();
        assert!(err.contains("x.yaml"), "got: {err}");
    }

    #[test]
    fn search_path_ends_with_system_locations() {
        let path = search_path();
        assert_eq!(path.last(), Some(&PathBuf::from("/run/instalog.yaml")));
        assert!(path.contains(&PathBuf::from("/etc/instalog.yaml")));
    }
}
