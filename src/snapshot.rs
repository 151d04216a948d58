//! Expected-output snapshots.
//!
//! Each fixture `<stem>.js` is compared against `<stem>.expected.json` next to it. A
//! `<stem>-ignored.expected.json` file marks the fixture as skipped.

use crate::normalize::{CanonicalResult, mask};
use std::io;
use std::path::{Path, PathBuf};

/// Outcome of comparing rendered results with a snapshot file.
#[derive(Debug, PartialEq)]
pub enum Snapshot {
    Matched,
    /// No snapshot existed; it was written from the actual output.
    Created(PathBuf),
    /// The snapshot was overwritten on request.
    Blessed(PathBuf),
    Differs {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl Snapshot {
    /// Failure description, or `None` when the fixture passes.
    ///
    /// A freshly created snapshot fails so it gets reviewed before it is trusted.
    pub fn failure(&self) -> Option<String> {
        match self {
            Snapshot::Matched | Snapshot::Blessed(_) => None,
            Snapshot::Created(path) => Some(format!("created snapshot {}", path.display())),
            Snapshot::Differs {
                path,
                expected,
                actual,
            } => Some(format!(
                "result differs from {}\n{}",
                path.display(),
                first_difference(expected, actual)
            )),
        }
    }
}

fn sibling(fixture: &Path, suffix: &str) -> PathBuf {
    let stem = fixture
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    fixture.with_file_name(format!("{stem}{suffix}"))
}

pub fn expected_path(fixture: &Path) -> PathBuf {
    sibling(fixture, ".expected.json")
}

pub fn ignored_path(fixture: &Path) -> PathBuf {
    sibling(fixture, "-ignored.expected.json")
}

pub fn is_ignored(fixture: &Path) -> bool {
    ignored_path(fixture).exists()
}

/// Render results as snapshot text, with generated identifiers masked.
pub fn render(results: &[CanonicalResult]) -> Result<String, serde_json::Error> {
    Ok(mask(&serde_json::to_string_pretty(results)?))
}

/// Compare `actual` with the fixture's snapshot, writing it when missing or when `bless`.
///
/// Surrounding whitespace and CRLF line endings are not significant.
pub fn check(fixture: &Path, actual: &str, bless: bool) -> io::Result<Snapshot> {
    let path = expected_path(fixture);
    let actual = actual.trim();

    if bless {
        std::fs::write(&path, format!("{actual}\n"))?;
        return Ok(Snapshot::Blessed(path));
    }

    // Snapshots checked out with CRLF endings still match.
    let expected = match std::fs::read_to_string(&path) {
        Ok(expected) => expected.replace("\r\n", "\n"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::write(&path, format!("{actual}\n"))?;
            return Ok(Snapshot::Created(path));
        }
        Err(e) => return Err(e),
    };

    if expected.trim() == actual {
        Ok(Snapshot::Matched)
    } else {
        Ok(Snapshot::Differs {
            path,
            expected: expected.trim().to_string(),
            actual: actual.to_string(),
        })
    }
}

fn first_difference(expected: &str, actual: &str) -> String {
    let mut expected_lines = expected.lines();
    let mut actual_lines = actual.lines();
    let mut line = 1;
    loop {
        match (expected_lines.next(), actual_lines.next()) {
            (Some(e), Some(a)) if e == a => line += 1,
            (e, a) => {
                return format!(
                    "line {line}:\n  expected: {}\n  actual:   {}",
                    e.unwrap_or("<end of file>").trim(),
                    a.unwrap_or("<end of file>").trim()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn sibling_paths() {
        let fixture = Path::new("collections/update.js");
        assert_eq!(
            expected_path(fixture),
            PathBuf::from("collections/update.expected.json")
        );
        assert_eq!(
            ignored_path(fixture),
            PathBuf::from("collections/update-ignored.expected.json")
        );
    }

    #[test]
    fn render_masks_object_ids() {
        let results = vec![CanonicalResult::Document {
            value: json!({ "_id": { "$oid": "50a8240b927d5d8b5891743c" }, "v": 2 }),
        }];
        let text = render(&results).unwrap();
        assert!(text.contains("<ObjectID>"));
        assert!(!text.contains("50a8240b"));
    }

    #[test]
    fn missing_snapshot_is_created_and_fails() {
        let dir = tempdir().unwrap();
        let fixture = dir.path().join("a.js");

        let outcome = check(&fixture, "[]\n", false).unwrap();
        assert_eq!(outcome, Snapshot::Created(dir.path().join("a.expected.json")));
        assert!(outcome.failure().is_some());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.expected.json")).unwrap(),
            "[]\n"
        );

        assert_eq!(check(&fixture, "[]", false).unwrap(), Snapshot::Matched);
    }

    #[test]
    fn difference_names_first_line() {
        let dir = tempdir().unwrap();
        let fixture = dir.path().join("a.js");
        std::fs::write(expected_path(&fixture), "[\n  1,\n  2\n]\n").unwrap();

        let outcome = check(&fixture, "[\n  1,\n  3\n]", false).unwrap();
        let failure = outcome.failure().unwrap();
        assert!(failure.contains("line 3"), "{failure}");
        assert!(failure.contains("expected: 2"), "{failure}");
        assert!(failure.contains("actual:   3"), "{failure}");
    }

    #[test]
    fn crlf_snapshot_matches() {
        let dir = tempdir().unwrap();
        let fixture = dir.path().join("a.js");
        std::fs::write(expected_path(&fixture), "[\r\n  1\r\n]\r\n").unwrap();

        assert_eq!(check(&fixture, "[\n  1\n]", false).unwrap(), Snapshot::Matched);

        let outcome = check(&fixture, "[\n  2\n]", false).unwrap();
        let failure = outcome.failure().unwrap();
        assert!(failure.contains("line 2"), "{failure}");
    }

    #[test]
    fn bless_overwrites() {
        let dir = tempdir().unwrap();
        let fixture = dir.path().join("a.js");
        std::fs::write(expected_path(&fixture), "old").unwrap();

        let outcome = check(&fixture, "new", true).unwrap();
        assert!(outcome.failure().is_none());
        assert_eq!(
            std::fs::read_to_string(expected_path(&fixture)).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn ignored_marker() {
        let dir = tempdir().unwrap();
        let fixture = dir.path().join("a.js");
        assert!(!is_ignored(&fixture));
        std::fs::write(ignored_path(&fixture), "").unwrap();
        assert!(is_ignored(&fixture));
    }
}
