//! Fixture script parser.
//!
//! A fixture is plain text split into sections by marker comments:
//!
//! ```text
//! // before
//! db.col.insertOne({key: "value", v: 1});
//! // command
//! db.col.findOneAndUpdate({key: "value"}, {$inc: {v: 1}}, {returnNewDocument: true});
//! // clear
//! db.col.drop();
//! ```
//!
//! A marker may carry properties, e.g. `// command dontCheckValue` or `// command key=value`.

use crate::error::{FixtureError, Section};
use crate::script::{self, Statement};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^//\s*(?<name>\S+)(?<props>(?:\s+\S+)*)\s*$").expect("marker pattern is valid")
});

/// A parsed fixture. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    pub path: PathBuf,
    pub before: Vec<Statement>,
    pub commands: Vec<CommandBlock>,
    pub clear: Vec<Statement>,
}

/// The statements following one `// command` marker.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBlock {
    pub statements: Vec<Statement>,
    pub options: CommandOptions,
}

/// Properties given on a `// command` marker line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    /// Compare only the shape of the result, not its values.
    pub dont_check_value: bool,
    pub properties: BTreeMap<String, String>,
}

impl CommandOptions {
    fn from_properties(properties: BTreeMap<String, String>) -> Self {
        Self {
            dont_check_value: properties.get("dontCheckValue").is_some_and(|v| v == "true"),
            properties,
        }
    }
}

impl Fixture {
    /// Fixture name: the file stem.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Every collection named by any statement, rename targets included, in order of first
    /// appearance.
    pub fn collections(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.before
            .iter()
            .chain(self.commands.iter().flat_map(|b| &b.statements))
            .chain(&self.clear)
            .flat_map(|s| s.collection().into_iter().chain(s.rename_target()))
            .filter(|name| seen.insert(name.to_string()))
            .map(str::to_string)
            .collect()
    }

    pub fn statement_count(&self) -> usize {
        self.before.len()
            + self.commands.iter().map(|b| b.statements.len()).sum::<usize>()
            + self.clear.len()
    }
}

/// Text collected under one marker.
struct Chunk {
    section: Option<Section>,
    block: usize,
    first_line: usize,
    text: String,
}

/// Parse fixture text read from `path`.
pub fn parse_fixture(path: &Path, text: &str) -> Result<Fixture, FixtureError> {
    let malformed = |reason: String| FixtureError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let mut chunks = vec![Chunk {
        section: None,
        block: 0,
        first_line: 1,
        text: String::new(),
    }];
    let mut command_options = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let number = idx + 1;
        let marker = MARKER.captures(line.trim()).and_then(|caps| {
            let section = Section::from_marker(&caps["name"])?;
            Some((section, parse_properties(&caps["props"])))
        });

        match marker {
            Some((section, properties)) => {
                let block = if section == Section::Command {
                    command_options.push(CommandOptions::from_properties(properties));
                    command_options.len() - 1
                } else {
                    0
                };
                chunks.push(Chunk {
                    section: Some(section),
                    block,
                    first_line: number + 1,
                    text: String::new(),
                });
            }
            None => {
                if let Some(chunk) = chunks.last_mut() {
                    chunk.text.push_str(line);
                    chunk.text.push('\n');
                }
            }
        }
    }

    if command_options.is_empty() {
        return Err(malformed("no `// command` section".to_string()));
    }

    let mut before = Vec::new();
    let mut clear = Vec::new();
    let mut blocks: Vec<Vec<Statement>> = vec![Vec::new(); command_options.len()];

    for chunk in &chunks {
        let label = chunk
            .section
            .map_or_else(|| "preamble".to_string(), |s| format!("{s} section"));
        let raw = script::split_statements(&chunk.text, chunk.first_line)
            .map_err(|e| malformed(format!("{label}, {e}")))?;
        let statements = raw
            .iter()
            .map(script::parse_statement)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("{label}, {e}")))?;

        match chunk.section {
            None if !statements.is_empty() => {
                return Err(malformed(format!(
                    "line {}: statement outside of any section",
                    statements[0].line
                )));
            }
            None => {}
            Some(Section::Before) => before.extend(statements),
            Some(Section::Command) => blocks[chunk.block].extend(statements),
            Some(Section::Clear) => clear.extend(statements),
        }
    }

    let commands = blocks
        .into_iter()
        .zip(command_options)
        .map(|(statements, options)| CommandBlock {
            statements,
            options,
        })
        .collect();

    Ok(Fixture {
        path: path.to_path_buf(),
        before,
        commands,
        clear,
    })
}

fn parse_properties(props: &str) -> BTreeMap<String, String> {
    props
        .split_whitespace()
        .map(|prop| match prop.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (prop.to_string(), "true".to_string()),
        })
        .collect()
}
