//! Fixture loader.
//!
//! Finds fixture scripts on disk, parses them, and loads the suite configuration.

use crate::error::FixtureError;
use crate::parser::{Fixture, parse_fixture};
use crate::schema::SuiteConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for loading fixtures and configuration.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// Suite configuration file names, in lookup order.
pub const SUITE_CONFIG_FILENAMES: &[&str] =
    &["mongofixture.yaml", "mongofixture.yml", "mongofixture.toml"];

/// Extension of fixture scripts.
pub const FIXTURE_EXTENSION: &str = "js";

/// Read and parse one fixture.
pub fn load_fixture(path: &Path) -> Result<Fixture, LoadError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_fixture(path, &contents)?)
}

/// Load suite configuration from a directory.
///
/// Returns `None` if no configuration file exists, `Err` if one exists but is invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    let Some(config_path) = SUITE_CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
    else {
        return Ok(None);
    };

    let contents = std::fs::read_to_string(&config_path)?;
    let config = if config_path.extension().is_some_and(|e| e == "toml") {
        toml::from_str(&contents)?
    } else {
        serde_yaml::from_str(&contents)?
    };
    tracing::debug!(path = %config_path.display(), "loaded suite config");
    Ok(Some(config))
}

/// Find all fixtures in a directory, recursively and sorted, or return the single file.
pub fn find_fixtures(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut fixtures = Vec::new();
    collect_fixtures_recursive(path, &mut fixtures)?;
    fixtures.sort();
    Ok(fixtures)
}

fn collect_fixtures_recursive(dir: &Path, fixtures: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_fixtures_recursive(&path, fixtures)?;
        } else if path.extension().is_some_and(|e| e == FIXTURE_EXTENSION) {
            fixtures.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_valid_fixture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("drop.js");
        std::fs::write(
            &path,
            "// before\ndb.col.insert({a: 1});\n// command\ndb.col.drop();\n",
        )
        .unwrap();

        let fixture = load_fixture(&path).unwrap();
        assert_eq!(fixture.name(), "drop");
        assert_eq!(fixture.before.len(), 1);
        assert_eq!(fixture.commands.len(), 1);
    }

    #[test]
    fn load_fixture_without_command() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.js");
        std::fs::write(&path, "// before\ndb.col.insert({a: 1});\n").unwrap();

        let result = load_fixture(&path);
        assert!(matches!(
            result,
            Err(LoadError::Fixture(FixtureError::Malformed { .. }))
        ));
    }

    #[test]
    fn load_missing_fixture() {
        let dir = tempdir().unwrap();
        let result = load_fixture(&dir.path().join("absent.js"));
        assert!(matches!(result, Err(LoadError::Io(_))));
    }

    #[test]
    fn find_fixtures_recursively_sorted() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.js"), "").unwrap();
        std::fs::write(dir.path().join("a.js"), "").unwrap();
        std::fs::write(dir.path().join("nested").join("c.js"), "").unwrap();
        std::fs::write(dir.path().join("a.expected.json"), "").unwrap();
        std::fs::write(dir.path().join("mongofixture.yaml"), "").unwrap();

        let fixtures = find_fixtures(dir.path()).unwrap();
        let names: Vec<_> = fixtures
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.js"),
                PathBuf::from("b.js"),
                PathBuf::from("nested").join("c.js"),
            ]
        );
    }

    #[test]
    fn find_single_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("one.js");
        std::fs::write(&path, "").unwrap();
        assert_eq!(find_fixtures(&path).unwrap(), vec![path]);
    }

    #[test]
    fn load_suite_config_not_found() {
        let dir = tempdir().unwrap();
        let result = load_suite_config(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_suite_config_yaml() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("mongofixture.yaml"),
            "version: 1\ndatabase: docs\njobs: 2\n",
        )
        .unwrap();

        let config = load_suite_config(dir.path()).unwrap().unwrap();
        assert_eq!(config.database, "docs");
        assert_eq!(config.effective_jobs(), 2);
    }

    #[test]
    fn load_suite_config_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("mongofixture.toml"),
            "uri = \"mongodb://db:27017\"\nserial = true\n",
        )
        .unwrap();

        let config = load_suite_config(dir.path()).unwrap().unwrap();
        assert_eq!(config.uri, "mongodb://db:27017");
        assert_eq!(config.effective_jobs(), 1);
    }

    #[test]
    fn load_suite_config_invalid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("mongofixture.yaml"), "invalid: [yaml: {").unwrap();

        let result = load_suite_config(dir.path());
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn load_suite_config_invalid_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("mongofixture.toml"), "invalid = [toml").unwrap();

        let result = load_suite_config(dir.path());
        assert!(matches!(result, Err(LoadError::Toml(_))));
    }
}
