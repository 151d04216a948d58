//! Fixture execution.
//!
//! A fixture runs strictly in order: an optional pre-clear, `before`, every `command` block,
//! then cleanup. A corpus run spreads fixtures over a bounded pool of worker threads. Each
//! worker owns its connection and, when there is more than one worker, its own database.

use crate::database::{DbError, Engine};
use crate::error::{CleanupWarning, FixtureError, Section, StatementError};
use crate::evaluator::{Evaluator, ExecutionResult};
use crate::normalize::CanonicalResult;
use crate::parser::Fixture;
use crate::script::Statement;
use mongodb::bson::doc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Default cap on the number of documents one cursor may yield.
pub const DEFAULT_MAX_RESULTS: usize = 10_000;

/// Cancellation shared by every worker of a run.
///
/// Workers stop taking fixtures once cancelled; a running fixture notices at its next
/// section boundary, still runs cleanup, and reports [`FixtureError::Cancelled`].
#[derive(Debug, Default)]
pub struct CancelToken(AtomicBool);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings for running one fixture.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_results: usize,
    /// Run the cleanup once, silently, before `before`.
    pub pre_clear: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            pre_clear: true,
        }
    }
}

/// A fixture that ran to completion.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FixtureRun {
    /// One result per command block that ran. Blocks after a failing one do not run.
    pub results: Vec<CanonicalResult>,
    pub warnings: Vec<CleanupWarning>,
}

/// Run one fixture against `engine`.
///
/// Cleanup runs on every path, including setup failure and cancellation.
pub fn run_fixture(
    engine: &mut dyn Engine,
    fixture: &Fixture,
    options: &RunOptions,
    cancel: &CancelToken,
) -> Result<FixtureRun, FixtureError> {
    let name = fixture.name();
    let mut evaluator = Evaluator::new(engine, options.max_results);

    if options.pre_clear {
        let leftovers = cleanup(&mut evaluator, fixture);
        tracing::debug!(fixture = %name, ignored = leftovers.len(), "pre-clear");
    }

    let outcome = run_sections(&mut evaluator, fixture, cancel);

    tracing::debug!(fixture = %name, statements = fixture.clear.len(), "clear");
    let warnings = cleanup(&mut evaluator, fixture);
    for warning in &warnings {
        tracing::warn!(fixture = %name, "{warning}");
    }

    outcome.map(|results| FixtureRun { results, warnings })
}

fn run_sections(
    evaluator: &mut Evaluator<'_>,
    fixture: &Fixture,
    cancel: &CancelToken,
) -> Result<Vec<CanonicalResult>, FixtureError> {
    if cancel.is_cancelled() {
        return Err(FixtureError::Cancelled(Section::Before));
    }
    tracing::debug!(statements = fixture.before.len(), "before");
    for statement in &fixture.before {
        evaluator
            .eval(statement)
            .map_err(|source| FixtureError::SetupFailed {
                line: statement.line,
                statement: statement.source.clone(),
                source,
            })?;
    }

    let mut results = Vec::with_capacity(fixture.commands.len());
    for block in &fixture.commands {
        if cancel.is_cancelled() {
            return Err(FixtureError::Cancelled(Section::Command));
        }
        tracing::debug!(
            statements = block.statements.len(),
            properties = ?block.options.properties,
            "command"
        );
        let shape_only = block.options.dont_check_value;
        match run_block(evaluator, &block.statements) {
            Ok(result) => results.push(CanonicalResult::from_result(result, shape_only)),
            Err(e) => {
                let database = evaluator.database_name();
                results.push(CanonicalResult::from_error(&e, shape_only, database));
                break;
            }
        }
    }
    Ok(results)
}

/// The result of a block is the result of its last statement.
fn run_block(
    evaluator: &mut Evaluator<'_>,
    statements: &[Statement],
) -> Result<ExecutionResult, StatementError> {
    let mut last = ExecutionResult::Nothing;
    for statement in statements {
        tracing::trace!(line = statement.line, method = ?statement.method(), "statement");
        last = evaluator.eval(statement)?;
    }
    Ok(last)
}

/// Run `clear`, or drop every referenced collection when there is no `clear` section.
fn cleanup(evaluator: &mut Evaluator<'_>, fixture: &Fixture) -> Vec<CleanupWarning> {
    if fixture.clear.is_empty() {
        return fixture
            .collections()
            .into_iter()
            .filter_map(|collection| {
                let error = evaluator.drop_collection(&collection).err()?;
                Some(CleanupWarning {
                    line: 0,
                    statement: format!("db.{collection}.drop()"),
                    message: error.to_string(),
                })
            })
            .collect();
    }
    fixture
        .clear
        .iter()
        .filter_map(|statement| {
            let error = evaluator.eval(statement).err()?;
            Some(CleanupWarning {
                line: statement.line,
                statement: statement.source.clone(),
                message: error.to_string(),
            })
        })
        .collect()
}

/// Settings for a corpus run.
#[derive(Debug, Clone)]
pub struct CorpusOptions {
    pub jobs: usize,
    /// Base database name; workers get `<database>_w<n>` when there are several.
    pub database: String,
    pub fail_fast: bool,
    pub run: RunOptions,
}

/// Outcome of one fixture in a corpus run.
#[derive(Debug)]
pub struct FixtureReport {
    pub path: PathBuf,
    pub name: String,
    pub duration: Duration,
    pub outcome: Result<FixtureRun, FixtureError>,
    /// Why the fixture failed; empty when it passed.
    pub failures: Vec<String>,
}

impl FixtureReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Database used by `worker` out of `workers`.
pub fn worker_database(base: &str, worker: usize, workers: usize) -> String {
    if workers > 1 {
        format!("{base}_w{worker}")
    } else {
        base.to_string()
    }
}

struct Pool<'a, C, J> {
    fixtures: &'a [Fixture],
    options: &'a CorpusOptions,
    cancel: &'a CancelToken,
    next: AtomicUsize,
    workers: usize,
    connect: C,
    judge: J,
}

/// Run `fixtures` over a pool of workers.
///
/// `connect` opens a connection to the named database, once per worker. `judge` turns a
/// fixture outcome into a list of failures. Reports come back in the order of `fixtures`;
/// fixtures never started because of cancellation are absent.
pub fn run_corpus<E, C, J>(
    fixtures: &[Fixture],
    options: &CorpusOptions,
    cancel: &CancelToken,
    connect: C,
    judge: J,
) -> Vec<FixtureReport>
where
    E: Engine,
    C: Fn(&str) -> Result<E, DbError> + Sync,
    J: Fn(&Fixture, &Result<FixtureRun, FixtureError>) -> Vec<String> + Sync,
{
    let pool = Pool {
        fixtures,
        options,
        cancel,
        next: AtomicUsize::new(0),
        workers: options.jobs.clamp(1, fixtures.len().max(1)),
        connect,
        judge,
    };
    tracing::debug!(fixtures = fixtures.len(), workers = pool.workers, "corpus");

    let mut reports: Vec<(usize, FixtureReport)> = thread::scope(|s| {
        let handles: Vec<_> = (0..pool.workers)
            .map(|worker| {
                let pool = &pool;
                s.spawn(move || work(pool, worker))
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker thread panicked"))
            .collect()
    });

    reports.sort_by_key(|(index, _)| *index);
    reports.into_iter().map(|(_, report)| report).collect()
}

fn work<E, C, J>(pool: &Pool<'_, C, J>, worker: usize) -> Vec<(usize, FixtureReport)>
where
    E: Engine,
    C: Fn(&str) -> Result<E, DbError> + Sync,
    J: Fn(&Fixture, &Result<FixtureRun, FixtureError>) -> Vec<String> + Sync,
{
    let database = worker_database(&pool.options.database, worker, pool.workers);
    let mut engine = (pool.connect)(&database);
    if let Err(e) = &engine {
        tracing::error!(%database, error = %e, "worker could not connect");
    }

    let mut reports = Vec::new();
    while !pool.cancel.is_cancelled() {
        let index = pool.next.fetch_add(1, Ordering::SeqCst);
        let Some(fixture) = pool.fixtures.get(index) else {
            break;
        };

        let started = Instant::now();
        let outcome = match &mut engine {
            Ok(engine) => run_fixture(engine, fixture, &pool.options.run, pool.cancel),
            Err(e) => Err(FixtureError::Connection(e.clone())),
        };
        let failures = (pool.judge)(fixture, &outcome);
        if pool.options.fail_fast && !failures.is_empty() {
            tracing::debug!(fixture = %fixture.name(), "fail-fast, cancelling run");
            pool.cancel.cancel();
        }

        reports.push((
            index,
            FixtureReport {
                path: fixture.path.clone(),
                name: fixture.name(),
                duration: started.elapsed(),
                outcome,
                failures,
            },
        ));
    }

    if pool.workers > 1
        && let Ok(engine) = &mut engine
        && let Err(e) = engine.run_command(doc! { "dropDatabase": 1 })
    {
        tracing::warn!(%database, error = %e, "could not drop worker database");
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::{ScriptedEngine, cursor_reply};
    use crate::parser::parse_fixture;
    use mongodb::bson::{Bson, Document};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;

    fn fixture(name: &str, text: &str) -> Fixture {
        parse_fixture(Path::new(name), text).unwrap()
    }

    fn no_pre_clear() -> RunOptions {
        RunOptions {
            pre_clear: false,
            ..RunOptions::default()
        }
    }

    fn run(engine: &mut ScriptedEngine, fixture: &Fixture) -> Result<FixtureRun, FixtureError> {
        run_fixture(engine, fixture, &no_pre_clear(), &CancelToken::default())
    }

    const FIND_ONE_AND_UPDATE: &str = r#"// before
db.col.insertOne({_id: 1, key: "value", v: 1});
// command
db.col.findOneAndUpdate({key: "value"}, {$inc: {v: 1}}, {returnNewDocument: true});
// clear
db.col.drop();
"#;

    #[test]
    fn find_one_and_update_returns_incremented_document() {
        let mut engine = ScriptedEngine::new()
            .reply(doc! { "n": 1, "ok": 1 })
            .reply(doc! { "value": { "_id": 1, "key": "value", "v": 2 }, "ok": 1 });
        let outcome = run(&mut engine, &fixture("a.js", FIND_ONE_AND_UPDATE)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Document {
                value: json!({ "_id": 1, "key": "value", "v": 2 })
            }]
        );
        assert!(outcome.warnings.is_empty());
        assert_eq!(engine.command_names(), vec!["insert", "findAndModify", "drop"]);
    }

    #[test]
    fn update_many_marks_matching_documents() {
        let text = r#"// before
db.restaurant.insertMany([
   { "_id" : 1, "name" : "Central Perk Cafe", "violations" : 3 },
   { "_id" : 2, "name" : "Rock A Feller Bar and Grill", "violations" : 2 },
   { "_id" : 3, "name" : "Empire State Sub", "violations" : 5 },
   { "_id" : 4, "name" : "Pizza Rat's Pizzaria", "violations" : 8 }
]);
// command
db.restaurant.updateMany(
      { violations: { $gt: 4 } },
      { $set: { "Review" : true } }
   );
// clear
db.getCollection('restaurant').drop();
"#;
        let mut engine = ScriptedEngine::new()
            .reply(doc! { "n": 4, "ok": 1 })
            .reply(doc! { "n": 2, "nModified": 2, "ok": 1 });
        let outcome = run(&mut engine, &fixture("b.js", text)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Document {
                value: json!({
                    "acknowledged": true,
                    "insertedId": null,
                    "matchedCount": 2,
                    "modifiedCount": 2,
                    "upsertedCount": 0,
                })
            }]
        );
        let update = engine.commands[1].get_array("updates").unwrap()[0]
            .as_document()
            .unwrap()
            .clone();
        assert_eq!(
            update.get_document("q").unwrap(),
            &doc! { "violations": { "$gt": 4 } }
        );
        assert_eq!(engine.last().get_str("drop").unwrap(), "restaurant");
    }

    #[test]
    fn setup_failure_aborts_but_still_clears() {
        let mut engine = ScriptedEngine::new().fail(DbError::server(
            11000,
            "DuplicateKey",
            "E11000 duplicate key error",
        ));
        let err = run(&mut engine, &fixture("a.js", FIND_ONE_AND_UPDATE)).unwrap_err();
        match err {
            FixtureError::SetupFailed { line, source, .. } => {
                assert_eq!(line, 2);
                assert_eq!(source.kind(), "DuplicateKey");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.command_names(), vec!["insert", "drop"]);
    }

    #[test]
    fn command_error_is_the_result_and_stops_later_blocks() {
        let text = "// command\ndb.col.dropIndex('missing_1')\n// command\ndb.col.find()\n// clear\ndb.col.drop()\n";
        let mut engine = ScriptedEngine::new().fail(DbError::server(
            27,
            "IndexNotFound",
            "index not found with name [missing_1]",
        ));
        let outcome = run(&mut engine, &fixture("a.js", text)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Error {
                kind: "IndexNotFound".to_string(),
                message: "index not found with name [missing_1]".to_string(),
            }]
        );
        assert_eq!(engine.command_names(), vec!["dropIndexes", "drop"]);
    }

    #[test]
    fn block_result_is_last_statement() {
        let text = "// command\ndb.col.insertOne({_id: 1})\ndb.col.find()\n";
        let mut engine = ScriptedEngine::new()
            .reply(doc! { "n": 1, "ok": 1 })
            .reply(cursor_reply(0, true, vec![doc! { "_id": 1 }]));
        let outcome = run(&mut engine, &fixture("a.js", text)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Documents {
                values: vec![json!({ "_id": 1 })]
            }]
        );
    }

    #[test]
    fn cleanup_failures_are_warnings() {
        let text = "// command\ndb.col.drop()\n// clear\ndb.col.dropIndex('x_1')\ndb.col.drop()\n";
        let mut engine = ScriptedEngine::new()
            .reply(doc! { "ok": 1 })
            .fail(DbError::server(27, "IndexNotFound", "index not found"));
        let outcome = run(&mut engine, &fixture("a.js", text)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Scalar { value: json!(true) }]
        );
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].line, 4);
        assert_eq!(outcome.warnings[0].message, "index not found (IndexNotFound)");
        // The second clear statement still ran.
        assert_eq!(engine.command_names(), vec!["drop", "dropIndexes", "drop"]);
    }

    #[test]
    fn missing_clear_drops_referenced_collections() {
        let text = "// before\ndb.a.insert({x: 1})\n// command\ndb.getCollection('b').find()\n";
        let mut engine = ScriptedEngine::new()
            .reply(doc! { "n": 1, "ok": 1 })
            .reply(cursor_reply(0, true, vec![]))
            .reply(doc! { "ok": 1 })
            .fail(DbError::server(26, "NamespaceNotFound", "ns not found"));
        let outcome = run(&mut engine, &fixture("a.js", text)).unwrap();
        assert!(outcome.warnings.is_empty());
        let drops: Vec<&str> = engine.commands[2..]
            .iter()
            .map(|c| c.get_str("drop").unwrap())
            .collect();
        assert_eq!(drops, vec!["a", "b"]);
    }

    #[test]
    fn pre_clear_ignores_errors() {
        let mut engine = ScriptedEngine::new()
            .fail(DbError::server(26, "NamespaceNotFound", "ns not found"))
            .reply(doc! { "n": 1, "ok": 1 })
            .reply(doc! { "value": { "_id": 1, "key": "value", "v": 2 }, "ok": 1 });
        let outcome = run_fixture(
            &mut engine,
            &fixture("a.js", FIND_ONE_AND_UPDATE),
            &RunOptions::default(),
            &CancelToken::default(),
        )
        .unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(
            engine.command_names(),
            vec!["drop", "insert", "findAndModify", "drop"]
        );
    }

    #[test]
    fn variables_live_across_sections() {
        let text = r#"// before
var mapFunction1 = function() { emit(this.cust_id, this.price); };
var reduceFunction1 = function(keyCustId, valuesPrices) { return Array.sum(valuesPrices); };
// command
db.orders.mapReduce( mapFunction1, reduceFunction1 );
// clear
db.orders.drop();
"#;
        let mut engine = ScriptedEngine::new().reply(doc! {
            "results": [{ "_id": "abc123", "value": 25 }],
            "ok": 1,
        });
        let outcome = run(&mut engine, &fixture("m.js", text)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Documents {
                values: vec![json!({ "_id": "abc123", "value": 25 })]
            }]
        );
        assert!(matches!(
            engine.commands[0].get("reduce"),
            Some(Bson::JavaScriptCode(code)) if code.contains("Array.sum")
        ));
    }

    #[test]
    fn dont_check_value_reports_shape() {
        let text = "// command dontCheckValue\ndb.col.insertOne({a: 1})\n";
        let mut engine = ScriptedEngine::new().reply(doc! { "n": 1, "ok": 1 });
        let outcome = run(&mut engine, &fixture("a.js", text)).unwrap();
        assert_eq!(
            outcome.results,
            vec![CanonicalResult::Document {
                value: json!({ "acknowledged": "bool", "insertedId": "objectId" })
            }]
        );
    }

    #[test]
    fn cancelled_fixture_still_cleans_up() {
        let cancel = CancelToken::default();
        cancel.cancel();
        let mut engine = ScriptedEngine::new();
        let err = run_fixture(
            &mut engine,
            &fixture("a.js", FIND_ONE_AND_UPDATE),
            &no_pre_clear(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, FixtureError::Cancelled(Section::Before)));
        assert_eq!(engine.command_names(), vec!["drop"]);
    }

    /// Records `(database, command)` pairs from every worker.
    struct SharedEngine<'a> {
        name: String,
        log: &'a Mutex<Vec<(String, String)>>,
    }

    impl Engine for SharedEngine<'_> {
        fn database_name(&self) -> &str {
            &self.name
        }

        fn run_command(&mut self, command: Document) -> Result<Document, DbError> {
            let name = command.keys().next().cloned().unwrap_or_default();
            self.log.lock().unwrap().push((self.name.clone(), name));
            Ok(doc! { "ok": 1 })
        }
    }

    fn corpus(n: usize) -> Vec<Fixture> {
        (0..n)
            .map(|i| fixture(&format!("f{i}.js"), &format!("// command\ndb.c{i}.drop()\n")))
            .collect()
    }

    fn options(jobs: usize, fail_fast: bool) -> CorpusOptions {
        CorpusOptions {
            jobs,
            database: "fixtures".to_string(),
            fail_fast,
            run: no_pre_clear(),
        }
    }

    #[test]
    fn corpus_runs_every_fixture_in_order_on_worker_databases() {
        let log = Mutex::new(Vec::new());
        let fixtures = corpus(5);
        let reports = run_corpus(
            &fixtures,
            &options(2, false),
            &CancelToken::default(),
            |database| {
                Ok(SharedEngine {
                    name: database.to_string(),
                    log: &log,
                })
            },
            |_, outcome| match outcome {
                Ok(_) => Vec::new(),
                Err(e) => vec![e.to_string()],
            },
        );

        let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["f0", "f1", "f2", "f3", "f4"]);
        assert!(reports.iter().all(FixtureReport::passed));

        let log = log.into_inner().unwrap();
        assert!(log.iter().all(|(db, _)| db == "fixtures_w0" || db == "fixtures_w1"));
        let dropped: Vec<_> = log
            .iter()
            .filter(|(_, command)| command == "dropDatabase")
            .collect();
        assert_eq!(dropped.len(), 2);
    }

    #[test]
    fn single_worker_uses_base_database() {
        let log = Mutex::new(Vec::new());
        let fixtures = corpus(2);
        run_corpus(
            &fixtures,
            &options(1, false),
            &CancelToken::default(),
            |database| {
                Ok(SharedEngine {
                    name: database.to_string(),
                    log: &log,
                })
            },
            |_, _| Vec::new(),
        );
        let log = log.into_inner().unwrap();
        assert!(log.iter().all(|(db, _)| db == "fixtures"));
        assert!(log.iter().all(|(_, command)| command != "dropDatabase"));
    }

    #[test]
    fn fail_fast_stops_starting_fixtures() {
        let fixtures = corpus(4);
        let cancel = CancelToken::default();
        let reports = run_corpus(
            &fixtures,
            &options(1, true),
            &cancel,
            |_| Ok(ScriptedEngine::new()),
            |_, _| vec!["snapshot differs".to_string()],
        );
        assert_eq!(reports.len(), 1);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn connection_failure_fails_each_fixture() {
        let fixtures = corpus(3);
        let reports = run_corpus(
            &fixtures,
            &options(1, false),
            &CancelToken::default(),
            |_| Err::<ScriptedEngine, _>(DbError::new("Connection failed: refused")),
            |_, outcome| match outcome {
                Ok(_) => Vec::new(),
                Err(e) => vec![e.to_string()],
            },
        );
        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert!(matches!(report.outcome, Err(FixtureError::Connection(_))));
            assert_eq!(report.failures, vec!["Connection failed: refused".to_string()]);
        }
    }

    #[test]
    fn worker_database_names() {
        assert_eq!(worker_database("fixtures", 0, 1), "fixtures");
        assert_eq!(worker_database("fixtures", 3, 4), "fixtures_w3");
    }
}
