mod database;
mod env;
mod error;
mod evaluator;
mod loader;
mod normalize;
mod parser;
mod runner;
mod schema;
mod script;
mod snapshot;

use clap::{Parser, Subcommand, ValueEnum};
use error::FixtureError;
use parser::Fixture;
use runner::{CancelToken, CorpusOptions, FixtureReport, FixtureRun, RunOptions};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "mongofixture")]
#[command(about = "Runs MongoDB shell fixture scripts and checks their results against snapshots")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute fixtures against a database
    Run {
        /// Path to fixtures (file or directory)
        path: PathBuf,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Filter fixtures by path (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Show verbose output (debug logging, full diffs)
        #[arg(short, long)]
        verbose: bool,
        /// Stop starting fixtures after the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Connection string (overrides suite config)
        #[arg(long)]
        uri: Option<String>,
        /// Database name (overrides suite config)
        #[arg(long)]
        database: Option<String>,
        /// Number of fixtures run concurrently (overrides suite config)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Overwrite snapshots with the actual results
        #[arg(long)]
        bless: bool,
    },
    /// Parse fixtures without touching a database
    Validate {
        /// Path to fixtures (file or directory)
        path: PathBuf,
    },
    /// Scaffold a new fixture
    Init {
        /// Output path for the new fixture
        #[arg(default_value = "fixtures/example.js")]
        path: PathBuf,
    },
    /// Output the suite config and result schemas
    Schema,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            output,
            filter,
            verbose,
            fail_fast,
            uri,
            database,
            jobs,
            bless,
        } => {
            init_tracing(verbose);

            // Determine the fixture root directory for suite config
            let fixture_root = if path.is_file() {
                path.parent().unwrap_or(&path)
            } else {
                &path
            };

            let mut config = match loader::load_suite_config(fixture_root) {
                Ok(config) => config.unwrap_or_default(),
                Err(e) => {
                    eprintln!("Error loading suite config: {e}");
                    std::process::exit(1);
                }
            };

            // CLI flags override suite config
            if let Some(uri) = uri {
                config.uri = uri;
            }
            if let Some(database) = database {
                config.database = database;
            }
            if let Some(jobs) = jobs {
                config.jobs = Some(jobs);
                config.serial = false;
            }

            let fixture_paths = match loader::find_fixtures(&path) {
                Ok(paths) => paths,
                Err(e) => {
                    eprintln!("Error finding fixtures: {e}");
                    std::process::exit(1);
                }
            };
            let fixture_paths: Vec<PathBuf> = fixture_paths
                .into_iter()
                .filter(|p| {
                    filter
                        .as_deref()
                        .is_none_or(|f| p.to_string_lossy().contains(f))
                })
                .collect();

            if fixture_paths.is_empty() {
                eprintln!("No fixtures found at: {}", path.display());
                std::process::exit(1);
            }

            // Load all fixtures first, tracking skipped ones and load failures
            let mut fixtures = Vec::new();
            let mut skipped = Vec::new();
            let mut load_failures = Vec::new();
            for fixture_path in fixture_paths {
                if snapshot::is_ignored(&fixture_path) {
                    skipped.push(fixture_path);
                    continue;
                }
                match loader::load_fixture(&fixture_path) {
                    Ok(fixture) => fixtures.push(fixture),
                    Err(e) => load_failures.push((fixture_path, e.to_string())),
                }
            }

            let cancel = CancelToken::default();
            if fail_fast && !load_failures.is_empty() {
                cancel.cancel();
            }

            let options = CorpusOptions {
                jobs: config.effective_jobs(),
                database: config.database.clone(),
                fail_fast,
                run: RunOptions {
                    max_results: config.max_results,
                    pre_clear: config.pre_clear,
                },
            };

            let run_start = Instant::now();
            let reports = if fixtures.is_empty() {
                Vec::new()
            } else {
                runner::run_corpus(
                    &fixtures,
                    &options,
                    &cancel,
                    |name| database::MongoEngine::connect(&config.uri, name),
                    |fixture, outcome| judge(fixture, outcome, bless),
                )
            };
            let total_time = run_start.elapsed();
            let not_run = fixtures.len() - reports.len();

            let total_passed = reports.iter().filter(|r| r.passed()).count();
            let total_failed =
                reports.iter().filter(|r| !r.passed()).count() + load_failures.len();

            match output {
                OutputFormat::Human => {
                    for (fixture_path, e) in &load_failures {
                        eprintln!("✗ Failed to load {}: {e}", fixture_path.display());
                    }
                    for report in &reports {
                        print_human(report, verbose);
                    }
                    for fixture_path in &skipped {
                        println!("- {} (ignored)", fixture_path.display());
                    }
                    print!("\n{total_passed} passed, {total_failed} failed");
                    if !skipped.is_empty() {
                        print!(", {} skipped", skipped.len());
                    }
                    if not_run > 0 {
                        print!(", {not_run} not run");
                    }
                    println!();
                }
                OutputFormat::Json => {
                    let mut results: Vec<serde_json::Value> = load_failures
                        .iter()
                        .map(|(fixture_path, e)| {
                            serde_json::json!({
                                "file": fixture_path.display().to_string(),
                                "passed": false,
                                "failures": [format!("Failed to load fixture: {e}")],
                            })
                        })
                        .collect();
                    results.extend(reports.iter().map(|report| {
                        let run = report.outcome.as_ref().ok();
                        serde_json::json!({
                            "file": report.path.display().to_string(),
                            "name": report.name,
                            "passed": report.passed(),
                            "duration": report.duration.as_secs_f64(),
                            "failures": report.failures,
                            "results": run.map(|r| &r.results),
                            "warnings": run.map(|r| &r.warnings),
                        })
                    }));
                    let output = serde_json::json!({
                        "passed": total_passed,
                        "failed": total_failed,
                        "skipped": skipped.len(),
                        "not_run": not_run,
                        "results": results,
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&output).expect("Failed to serialize")
                    );
                }
                OutputFormat::Junit => {
                    let mut cases: Vec<JunitCase> = load_failures
                        .iter()
                        .map(|(fixture_path, e)| JunitCase {
                            name: fixture_path.display().to_string(),
                            status: CaseStatus::Failed(vec![format!("Failed to load fixture: {e}")]),
                            duration: Duration::ZERO,
                            warnings: Vec::new(),
                        })
                        .collect();
                    cases.extend(reports.iter().map(|report| JunitCase {
                        name: report.path.display().to_string(),
                        status: if report.passed() {
                            CaseStatus::Passed
                        } else {
                            CaseStatus::Failed(report.failures.clone())
                        },
                        duration: report.duration,
                        warnings: report
                            .outcome
                            .as_ref()
                            .map(|r| r.warnings.iter().map(ToString::to_string).collect())
                            .unwrap_or_default(),
                    }));
                    cases.extend(skipped.iter().map(|fixture_path| JunitCase {
                        name: fixture_path.display().to_string(),
                        status: CaseStatus::Skipped,
                        duration: Duration::ZERO,
                        warnings: Vec::new(),
                    }));
                    print!("{}", format_junit_xml(&cases, total_time));
                }
            }

            if total_failed > 0 || not_run > 0 {
                std::process::exit(1);
            }
        }
        Command::Validate { path } => {
            let fixture_paths = match loader::find_fixtures(&path) {
                Ok(paths) => paths,
                Err(e) => {
                    eprintln!("Error finding fixtures: {e}");
                    std::process::exit(1);
                }
            };

            if fixture_paths.is_empty() {
                eprintln!("No fixtures found at: {}", path.display());
                std::process::exit(1);
            }

            let mut errors = 0;
            for fixture_path in &fixture_paths {
                match loader::load_fixture(fixture_path) {
                    Ok(fixture) => {
                        println!(
                            "✓ {} ({} statements, {} command block(s))",
                            fixture_path.display(),
                            fixture.statement_count(),
                            fixture.commands.len()
                        );
                    }
                    Err(e) => {
                        eprintln!("✗ {}: {e}", fixture_path.display());
                        errors += 1;
                    }
                }
            }

            if errors > 0 {
                eprintln!("\n{errors} fixture(s) failed validation");
                std::process::exit(1);
            }
            println!("\nAll {} fixture(s) valid", fixture_paths.len());
        }
        Command::Init { path } => {
            let template = r#"// before
db.col.insertOne({key: "value", v: 1});
// command
db.col.findOneAndUpdate({key: "value"}, {$inc: {v: 1}}, {returnNewDocument: true});
// clear
db.col.drop();
"#;
            if path.exists() {
                eprintln!("Error: file already exists: {}", path.display());
                std::process::exit(1);
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
                && let Err(e) = fs::create_dir_all(parent)
            {
                eprintln!("Error creating directory: {e}");
                std::process::exit(1);
            }
            if let Err(e) = fs::write(&path, template) {
                eprintln!("Error writing file: {e}");
                std::process::exit(1);
            }
            println!("Created: {}", path.display());
        }
        Command::Schema => {
            let schema = schema::generate_schema();
            let json = serde_json::to_string_pretty(&schema).expect("Failed to serialize schema");
            println!("{json}");
        }
    }
}

/// Turn a fixture outcome into failures by comparing it with its snapshot.
fn judge(fixture: &Fixture, outcome: &Result<FixtureRun, FixtureError>, bless: bool) -> Vec<String> {
    let run = match outcome {
        Ok(run) => run,
        Err(e) => return vec![e.to_string()],
    };
    let rendered = match snapshot::render(&run.results) {
        Ok(rendered) => rendered,
        Err(e) => return vec![format!("Failed to render results: {e}")],
    };
    match snapshot::check(&fixture.path, &rendered, bless) {
        Ok(snapshot) => snapshot.failure().into_iter().collect(),
        Err(e) => vec![format!("Failed to access snapshot: {e}")],
    }
}

fn print_human(report: &FixtureReport, verbose: bool) {
    let mark = if report.passed() { "✓" } else { "✗" };
    println!("{mark} {} ({:.2?})", report.path.display(), report.duration);
    for failure in &report.failures {
        let mut lines = failure.lines();
        if let Some(first) = lines.next() {
            println!("    {first}");
        }
        if verbose {
            for line in lines {
                println!("    {line}");
            }
        }
    }
    if let Ok(run) = &report.outcome {
        for warning in &run.warnings {
            println!("    ⚠ {warning}");
        }
    }
}

enum CaseStatus {
    Passed,
    Failed(Vec<String>),
    Skipped,
}

/// A fixture result for JUnit output.
struct JunitCase {
    name: String,
    status: CaseStatus,
    duration: Duration,
    warnings: Vec<String>,
}

/// Format fixture results as JUnit XML.
fn format_junit_xml(cases: &[JunitCase], total_time: Duration) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let total_failures = cases
        .iter()
        .filter(|c| matches!(c.status, CaseStatus::Failed(_)))
        .count();
    let total_skipped = cases
        .iter()
        .filter(|c| matches!(c.status, CaseStatus::Skipped))
        .count();

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{}\" failures=\"{total_failures}\" time=\"{:.3}\">",
        cases.len(),
        total_time.as_secs_f64()
    );
    let _ = writeln!(
        xml,
        "  <testsuite name=\"mongofixture\" tests=\"{}\" failures=\"{total_failures}\" skipped=\"{total_skipped}\" time=\"{:.3}\">",
        cases.len(),
        total_time.as_secs_f64()
    );

    for case in cases {
        let _ = writeln!(
            xml,
            "    <testcase name=\"{}\" time=\"{:.3}\">",
            escape_xml(&case.name),
            case.duration.as_secs_f64()
        );

        match &case.status {
            CaseStatus::Passed => {}
            CaseStatus::Skipped => xml.push_str("      <skipped/>\n"),
            CaseStatus::Failed(failures) => {
                let message = failures
                    .first()
                    .and_then(|s| s.lines().next())
                    .unwrap_or("Fixture failed");
                let _ = writeln!(xml, "      <failure message=\"{}\">", escape_xml(message));
                for failure in failures {
                    let _ = writeln!(xml, "{}", escape_xml(failure));
                }
                xml.push_str("      </failure>\n");
            }
        }

        // Cleanup warnings go to system-out
        if !case.warnings.is_empty() {
            let _ = writeln!(
                xml,
                "      <system-out>{}</system-out>",
                escape_xml(&case.warnings.join("\n"))
            );
        }

        xml.push_str("    </testcase>\n");
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
