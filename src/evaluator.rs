//! Statement evaluator.
//!
//! Interprets parsed statements as database operations. Method names map to a closed
//! [`Method`] table; every method validates the shape of its arguments before anything is
//! sent to the server, then issues one or more database commands through an [`Engine`].
//! Function literals are forwarded as JavaScript code and executed by the server only.

use crate::database::{DbError, Engine};
use crate::error::StatementError;
use crate::normalize::{DATABASE_PLACEHOLDER, strip_bookkeeping};
use crate::script::{DateArg, Expr, Statement, Step, Value};
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use std::collections::HashMap;

/// Outcome of one statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Document(Document),
    /// A fully materialized cursor, in server order.
    Documents(Vec<Document>),
    Scalar(Bson),
    /// The statement produces no value, e.g. a `var` binding.
    Nothing,
}

/// Collection methods the evaluator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Insert,
    InsertOne,
    InsertMany,
    Update,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    FindAndModify,
    CreateIndex,
    CreateIndexes,
    DropIndex,
    DropIndexes,
    GetIndexes,
    Aggregate,
    MapReduce,
    Drop,
    Find,
    FindOne,
    CountDocuments,
    Count,
    EstimatedDocumentCount,
    DeleteOne,
    DeleteMany,
    RenameCollection,
}

const METHODS: &[(&str, Method)] = &[
    ("insert", Method::Insert),
    ("insertOne", Method::InsertOne),
    ("insertMany", Method::InsertMany),
    ("update", Method::Update),
    ("updateOne", Method::UpdateOne),
    ("updateMany", Method::UpdateMany),
    ("replaceOne", Method::ReplaceOne),
    ("findOneAndUpdate", Method::FindOneAndUpdate),
    ("findOneAndReplace", Method::FindOneAndReplace),
    ("findOneAndDelete", Method::FindOneAndDelete),
    ("findAndModify", Method::FindAndModify),
    ("createIndex", Method::CreateIndex),
    ("createIndexes", Method::CreateIndexes),
    ("dropIndex", Method::DropIndex),
    ("dropIndexes", Method::DropIndexes),
    ("getIndexes", Method::GetIndexes),
    ("aggregate", Method::Aggregate),
    ("mapReduce", Method::MapReduce),
    ("drop", Method::Drop),
    ("find", Method::Find),
    ("findOne", Method::FindOne),
    ("countDocuments", Method::CountDocuments),
    ("count", Method::Count),
    ("estimatedDocumentCount", Method::EstimatedDocumentCount),
    ("deleteOne", Method::DeleteOne),
    ("deleteMany", Method::DeleteMany),
    ("renameCollection", Method::RenameCollection),
];

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        METHODS.iter().find(|(n, _)| *n == name).map(|(_, m)| *m)
    }

    pub fn name(self) -> &'static str {
        METHODS
            .iter()
            .find(|(_, m)| *m == self)
            .map_or("?", |(n, _)| n)
    }
}

/// A `find` whose documents have not been fetched yet, so cursor modifiers can still apply.
#[derive(Debug, Clone, PartialEq)]
struct PendingFind {
    collection: String,
    filter: Document,
    projection: Option<Document>,
    sort: Option<Document>,
    skip: Option<i64>,
    limit: Option<i64>,
}

/// What the next link of a call chain is applied to.
#[derive(Debug)]
enum Receiver {
    Database,
    Collection(String),
    Cursor(PendingFind),
    Result(ExecutionResult),
}

/// Evaluates statements for one fixture run.
///
/// Variables bound with `var` live as long as the evaluator.
pub struct Evaluator<'e> {
    engine: &'e mut dyn Engine,
    vars: HashMap<String, Bson>,
    max_results: usize,
}

impl<'e> Evaluator<'e> {
    pub fn new(engine: &'e mut dyn Engine, max_results: usize) -> Self {
        Self {
            engine,
            vars: HashMap::new(),
            max_results,
        }
    }

    /// Name of the database statements run against.
    pub fn database_name(&self) -> &str {
        self.engine.database_name()
    }

    /// Evaluate one statement.
    pub fn eval(&mut self, statement: &Statement) -> Result<ExecutionResult, StatementError> {
        match &statement.expr {
            Expr::Bind { name, value } => {
                let value = self.to_bson(value)?;
                self.vars.insert(name.clone(), value);
                Ok(ExecutionResult::Nothing)
            }
            Expr::Chain { root, steps } => {
                if root != "db" {
                    return Err(StatementError::UnknownVariable(root.clone()));
                }
                let mut receiver = Receiver::Database;
                for step in steps {
                    receiver = self.apply(receiver, step)?;
                }
                self.finish(receiver)
            }
        }
    }

    /// Drop a collection, treating an absent collection as already dropped.
    pub fn drop_collection(&mut self, collection: &str) -> Result<bool, StatementError> {
        match self.engine.run_command(doc! { "drop": collection }) {
            Ok(_) => Ok(true),
            Err(e) if e.is_namespace_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn apply(&mut self, receiver: Receiver, step: &Step) -> Result<Receiver, StatementError> {
        match (receiver, step) {
            (Receiver::Database, Step::Property(name)) => Ok(Receiver::Collection(name.clone())),
            (Receiver::Database, Step::Call { method, args }) if method == "getCollection" => {
                match args.as_slice() {
                    [Value::String(name)] => Ok(Receiver::Collection(name.clone())),
                    _ => Err(StatementError::mismatch(
                        "getCollection",
                        "expected one collection name",
                    )),
                }
            }
            (Receiver::Collection(parent), Step::Property(name)) => {
                Ok(Receiver::Collection(format!("{parent}.{name}")))
            }
            (Receiver::Collection(collection), Step::Call { method, args }) => {
                let Some(m) = Method::from_name(method) else {
                    return Err(StatementError::UnsupportedMethod {
                        receiver: format!("collection `{collection}`"),
                        method: method.clone(),
                    });
                };
                let args = args
                    .iter()
                    .map(|v| self.to_bson(v))
                    .collect::<Result<Vec<_>, _>>()?;
                tracing::debug!(%collection, method = m.name(), "call");
                self.call(&collection, m, &args)
            }
            (Receiver::Cursor(find), Step::Call { method, args }) => {
                let args = args
                    .iter()
                    .map(|v| self.to_bson(v))
                    .collect::<Result<Vec<_>, _>>()?;
                self.cursor_call(find, method, &args)
            }
            (Receiver::Result(ExecutionResult::Documents(docs)), Step::Call { method, args })
                if method == "toArray" && args.is_empty() =>
            {
                Ok(Receiver::Result(ExecutionResult::Documents(docs)))
            }
            (receiver, step) => Err(StatementError::UnsupportedMethod {
                receiver: receiver_name(&receiver),
                method: match step {
                    Step::Property(name) | Step::Call { method: name, .. } => name.clone(),
                },
            }),
        }
    }

    fn finish(&mut self, receiver: Receiver) -> Result<ExecutionResult, StatementError> {
        match receiver {
            Receiver::Database => Ok(ExecutionResult::Scalar(Bson::String(
                DATABASE_PLACEHOLDER.to_string(),
            ))),
            Receiver::Collection(name) => Ok(ExecutionResult::Scalar(Bson::String(format!(
                "{DATABASE_PLACEHOLDER}.{name}"
            )))),
            Receiver::Cursor(find) => self.run_find(&find).map(ExecutionResult::Documents),
            Receiver::Result(result) => Ok(result),
        }
    }

    fn call(
        &mut self,
        collection: &str,
        method: Method,
        args: &[Bson],
    ) -> Result<Receiver, StatementError> {
        let a = Args { method, values: args };
        let result = match method {
            Method::Insert => {
                a.arity(1, 2)?;
                let docs = match &args[0] {
                    Bson::Document(d) => vec![d.clone()],
                    Bson::Array(_) => a.documents(0)?,
                    _ => return Err(a.mismatch("expected a document or an array of documents")),
                };
                let ordered = a.options(1, &["ordered", "writeConcern"])?;
                let (_, n) = self.insert(collection, docs, &ordered)?;
                ExecutionResult::Document(doc! { "nInserted": n })
            }
            Method::InsertOne => {
                a.arity(1, 2)?;
                let document = a.document(0)?;
                let options = a.options(1, &["writeConcern"])?;
                let (ids, _) = self.insert(collection, vec![document], &options)?;
                ExecutionResult::Document(doc! {
                    "acknowledged": true,
                    "insertedId": ids.into_iter().next().unwrap_or(Bson::Null),
                })
            }
            Method::InsertMany => {
                a.arity(1, 2)?;
                let docs = a.documents(0)?;
                let options = a.options(1, &["ordered", "writeConcern"])?;
                let (ids, _) = self.insert(collection, docs, &options)?;
                ExecutionResult::Document(doc! { "acknowledged": true, "insertedIds": ids })
            }
            Method::Update | Method::UpdateOne | Method::UpdateMany => {
                a.arity(2, 3)?;
                let filter = a.document(0)?;
                let update = a.update_spec(1, method != Method::Update)?;
                let options = a.options(
                    2,
                    &["upsert", "multi", "arrayFilters", "collation", "hint", "writeConcern"],
                )?;
                if method != Method::Update && options.contains_key("multi") {
                    return Err(a.mismatch("`multi` is only accepted by update()"));
                }
                let multi = match method {
                    Method::UpdateMany => true,
                    Method::UpdateOne => false,
                    _ => options.get_bool("multi").unwrap_or(false),
                };
                self.update(collection, method, filter, update, multi, &options)?
            }
            Method::ReplaceOne => {
                a.arity(2, 3)?;
                let filter = a.document(0)?;
                let replacement = a.replacement(1)?;
                let options = a.options(2, &["upsert", "collation", "hint", "writeConcern"])?;
                self.update(
                    collection,
                    method,
                    filter,
                    Bson::Document(replacement),
                    false,
                    &options,
                )?
            }
            Method::FindOneAndUpdate => {
                a.arity(2, 3)?;
                let filter = a.document(0)?;
                let update = a.update_spec(1, true)?;
                let options = a.options(
                    2,
                    &[
                        "returnNewDocument",
                        "returnDocument",
                        "upsert",
                        "projection",
                        "sort",
                        "arrayFilters",
                        "collation",
                        "hint",
                        "maxTimeMS",
                    ],
                )?;
                let change = Some((update, a.return_new(&options)?));
                self.find_one_and_modify(collection, filter, change, &options)?
            }
            Method::FindOneAndReplace => {
                a.arity(2, 3)?;
                let filter = a.document(0)?;
                let replacement = Bson::Document(a.replacement(1)?);
                let options = a.options(
                    2,
                    &[
                        "returnNewDocument",
                        "returnDocument",
                        "upsert",
                        "projection",
                        "sort",
                        "collation",
                        "hint",
                        "maxTimeMS",
                    ],
                )?;
                let change = Some((replacement, a.return_new(&options)?));
                self.find_one_and_modify(collection, filter, change, &options)?
            }
            Method::FindOneAndDelete => {
                a.arity(1, 2)?;
                let filter = a.document(0)?;
                let options =
                    a.options(1, &["projection", "sort", "collation", "hint", "maxTimeMS"])?;
                self.find_one_and_modify(collection, filter, None, &options)?
            }
            Method::FindAndModify => {
                a.arity(1, 1)?;
                let spec = a.document(0)?;
                if let Some(key) = spec.keys().find(|k| {
                    !matches!(
                        k.as_str(),
                        "query"
                            | "update"
                            | "remove"
                            | "new"
                            | "upsert"
                            | "sort"
                            | "fields"
                            | "arrayFilters"
                            | "collation"
                    )
                }) {
                    return Err(a.mismatch(format!("unknown option `{key}`")));
                }
                if !spec.contains_key("update") && !spec.get_bool("remove").unwrap_or(false) {
                    return Err(a.mismatch("either `update` or `remove: true` is required"));
                }
                let mut command = doc! { "findAndModify": collection };
                command.extend(spec);
                self.find_and_modify(command)?
            }
            Method::CreateIndex => {
                a.arity(1, 2)?;
                let keys = a.index_keys(&args[0])?;
                let options = a.options(1, INDEX_OPTIONS)?;
                let spec = index_spec(keys, &options);
                let name = spec.get_str("name").unwrap_or_default().to_string();
                self.create_indexes(collection, vec![spec])?;
                ExecutionResult::Scalar(Bson::String(name))
            }
            Method::CreateIndexes => {
                a.arity(1, 2)?;
                let Bson::Array(key_specs) = &args[0] else {
                    return Err(a.mismatch("expected an array of key specifications"));
                };
                let options = a.options(1, INDEX_OPTIONS)?;
                if options.contains_key("name") && key_specs.len() > 1 {
                    return Err(a.mismatch("`name` cannot be shared by several indexes"));
                }
                let specs = key_specs
                    .iter()
                    .map(|k| a.index_keys(k).map(|keys| index_spec(keys, &options)))
                    .collect::<Result<Vec<_>, _>>()?;
                let names: Vec<Bson> = specs
                    .iter()
                    .map(|s| Bson::String(s.get_str("name").unwrap_or_default().to_string()))
                    .collect();
                self.create_indexes(collection, specs)?;
                ExecutionResult::Scalar(Bson::Array(names))
            }
            Method::DropIndex => {
                a.arity(1, 1)?;
                let index = match &args[0] {
                    Bson::String(_) | Bson::Document(_) => args[0].clone(),
                    _ => return Err(a.mismatch("expected an index name or key specification")),
                };
                let reply = self
                    .engine
                    .run_command(doc! { "dropIndexes": collection, "index": index })?;
                ExecutionResult::Document(strip_bookkeeping(reply))
            }
            Method::DropIndexes => {
                a.arity(0, 1)?;
                let index = match args.first() {
                    None => Bson::String("*".to_string()),
                    Some(Bson::String(_) | Bson::Document(_)) => args[0].clone(),
                    Some(Bson::Array(names)) if names.iter().all(|n| matches!(n, Bson::String(_))) => {
                        args[0].clone()
                    }
                    Some(_) => {
                        return Err(a.mismatch(
                            "expected an index name, key specification or array of names",
                        ));
                    }
                };
                let reply = self
                    .engine
                    .run_command(doc! { "dropIndexes": collection, "index": index })?;
                ExecutionResult::Document(strip_bookkeeping(reply))
            }
            Method::GetIndexes => {
                a.arity(0, 0)?;
                let command = doc! { "listIndexes": collection, "cursor": {} };
                let indexes = match self.engine.run_command(command) {
                    Ok(reply) => self.drain_cursor(collection, &reply)?,
                    Err(e) if e.is_namespace_not_found() => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                ExecutionResult::Documents(indexes)
            }
            Method::Aggregate => {
                if args.is_empty() {
                    return Err(a.mismatch("expected a pipeline"));
                }
                let (pipeline, options) = match &args[0] {
                    Bson::Array(_) => {
                        a.arity(1, 2)?;
                        (
                            a.documents(0)?,
                            a.options(
                                1,
                                &[
                                    "allowDiskUse",
                                    "collation",
                                    "hint",
                                    "comment",
                                    "maxTimeMS",
                                    "let",
                                    "batchSize",
                                ],
                            )?,
                        )
                    }
                    _ => {
                        let stages = (0..args.len())
                            .map(|i| a.document(i))
                            .collect::<Result<Vec<_>, _>>()?;
                        (stages, Document::new())
                    }
                };
                ExecutionResult::Documents(self.aggregate(collection, pipeline, options)?)
            }
            Method::MapReduce => {
                a.arity(2, 3)?;
                let map = a.code(0)?;
                let reduce = a.code(1)?;
                let options = a.options(
                    2,
                    &[
                        "out", "query", "sort", "limit", "finalize", "scope", "jsMode", "verbose",
                        "collation",
                    ],
                )?;
                self.map_reduce(collection, map, reduce, options)?
            }
            Method::Drop => {
                a.arity(0, 1)?;
                ExecutionResult::Scalar(Bson::Boolean(self.drop_collection(collection)?))
            }
            Method::Find => {
                a.arity(0, 2)?;
                return Ok(Receiver::Cursor(PendingFind {
                    collection: collection.to_string(),
                    filter: a.optional_document(0)?.unwrap_or_default(),
                    projection: a.optional_document(1)?,
                    sort: None,
                    skip: None,
                    limit: None,
                }));
            }
            Method::FindOne => {
                a.arity(0, 2)?;
                let mut command = doc! {
                    "find": collection,
                    "filter": a.optional_document(0)?.unwrap_or_default(),
                    "limit": 1_i64,
                    "singleBatch": true,
                };
                if let Some(projection) = a.optional_document(1)? {
                    command.insert("projection", projection);
                }
                let reply = self.engine.run_command(command)?;
                let (_, mut docs) = cursor_batch(&reply, "firstBatch")?;
                if docs.is_empty() {
                    ExecutionResult::Scalar(Bson::Null)
                } else {
                    ExecutionResult::Document(docs.swap_remove(0))
                }
            }
            Method::CountDocuments => {
                a.arity(0, 2)?;
                let filter = a.optional_document(0)?.unwrap_or_default();
                let options = a.options(1, &["skip", "limit"])?;
                ExecutionResult::Scalar(Bson::Int64(self.count(collection, filter, &options)?))
            }
            Method::Count => {
                a.arity(0, 2)?;
                let query = a.optional_document(0)?.unwrap_or_default();
                let options =
                    a.options(1, &["skip", "limit", "hint", "collation", "maxTimeMS", "readConcern"])?;
                let mut command = doc! { "count": collection, "query": query };
                command.extend(options);
                let reply = self.engine.run_command(command)?;
                ExecutionResult::Scalar(Bson::Int64(count_field(&reply, "n")))
            }
            Method::EstimatedDocumentCount => {
                a.arity(0, 1)?;
                let mut command = doc! { "count": collection };
                command.extend(a.options(0, &["maxTimeMS"])?);
                let reply = self.engine.run_command(command)?;
                ExecutionResult::Scalar(Bson::Int64(count_field(&reply, "n")))
            }
            Method::RenameCollection => {
                a.arity(1, 2)?;
                let Bson::String(target) = &args[0] else {
                    return Err(a.mismatch("expected the new collection name"));
                };
                let drop_target = match args.get(1) {
                    None => false,
                    Some(Bson::Boolean(b)) => *b,
                    Some(_) => return Err(a.mismatch("dropTarget must be a boolean")),
                };
                let database = self.engine.database_name().to_string();
                self.engine.run_admin_command(doc! {
                    "renameCollection": format!("{database}.{collection}"),
                    "to": format!("{database}.{target}"),
                    "dropTarget": drop_target,
                })?;
                ExecutionResult::Nothing
            }
            Method::DeleteOne | Method::DeleteMany => {
                a.arity(1, 2)?;
                let filter = a.document(0)?;
                let options = a.options(1, &["collation", "hint", "writeConcern"])?;
                let limit = if method == Method::DeleteOne { 1 } else { 0 };
                let mut delete = doc! { "q": filter, "limit": limit };
                for key in ["collation", "hint"] {
                    if let Some(value) = options.get(key) {
                        delete.insert(key, value.clone());
                    }
                }
                let mut command = doc! { "delete": collection, "deletes": [delete] };
                if let Some(wc) = options.get("writeConcern") {
                    command.insert("writeConcern", wc.clone());
                }
                let reply = self.engine.run_command(command)?;
                check_write_errors(&reply)?;
                ExecutionResult::Document(doc! {
                    "acknowledged": true,
                    "deletedCount": count_field(&reply, "n"),
                })
            }
        };
        Ok(Receiver::Result(result))
    }

    fn cursor_call(
        &mut self,
        mut find: PendingFind,
        method: &str,
        args: &[Bson],
    ) -> Result<Receiver, StatementError> {
        let integer = |name: &str| match args {
            [value] => as_integer(value)
                .ok_or_else(|| StatementError::mismatch(name, "expected an integer")),
            _ => Err(StatementError::mismatch(name, "expected one argument")),
        };
        match method {
            "sort" => match args {
                [Bson::Document(sort)] => find.sort = Some(sort.clone()),
                _ => return Err(StatementError::mismatch("sort", "expected a document")),
            },
            "limit" => find.limit = Some(integer("limit")?),
            "skip" => find.skip = Some(integer("skip")?),
            "pretty" if args.is_empty() => {}
            "toArray" if args.is_empty() => {
                return self
                    .run_find(&find)
                    .map(|docs| Receiver::Result(ExecutionResult::Documents(docs)));
            }
            "count" if args.is_empty() => {
                let mut options = Document::new();
                if let Some(skip) = find.skip {
                    options.insert("skip", skip);
                }
                if let Some(limit) = find.limit.filter(|l| *l != 0) {
                    options.insert("limit", limit.abs());
                }
                let n = self.count(&find.collection, find.filter.clone(), &options)?;
                return Ok(Receiver::Result(ExecutionResult::Scalar(Bson::Int64(n))));
            }
            _ => {
                return Err(StatementError::UnsupportedMethod {
                    receiver: "cursor".to_string(),
                    method: method.to_string(),
                });
            }
        }
        Ok(Receiver::Cursor(find))
    }

    fn insert(
        &mut self,
        collection: &str,
        docs: Vec<Document>,
        options: &Document,
    ) -> Result<(Vec<Bson>, i64), StatementError> {
        let mut ids = Vec::with_capacity(docs.len());
        let documents: Vec<Document> = docs
            .into_iter()
            .map(|d| {
                let (id, d) = with_id(d);
                ids.push(id);
                d
            })
            .collect();
        let mut command = doc! {
            "insert": collection,
            "documents": documents,
            "ordered": options.get_bool("ordered").unwrap_or(true),
        };
        if let Some(wc) = options.get("writeConcern") {
            command.insert("writeConcern", wc.clone());
        }
        let reply = self.engine.run_command(command)?;
        check_write_errors(&reply)?;
        Ok((ids, count_field(&reply, "n")))
    }

    fn update(
        &mut self,
        collection: &str,
        method: Method,
        filter: Document,
        update: Bson,
        multi: bool,
        options: &Document,
    ) -> Result<ExecutionResult, StatementError> {
        let mut statement = doc! {
            "q": filter,
            "u": update,
            "upsert": options.get_bool("upsert").unwrap_or(false),
            "multi": multi,
        };
        for key in ["arrayFilters", "collation", "hint"] {
            if let Some(value) = options.get(key) {
                statement.insert(key, value.clone());
            }
        }
        let mut command = doc! { "update": collection, "updates": [statement] };
        if let Some(wc) = options.get("writeConcern") {
            command.insert("writeConcern", wc.clone());
        }
        let reply = self.engine.run_command(command)?;
        check_write_errors(&reply)?;

        let upserted_id = reply
            .get_array("upserted")
            .ok()
            .and_then(|u| u.first())
            .and_then(|u| u.as_document())
            .and_then(|u| u.get("_id"))
            .cloned();
        let upserted = i64::from(upserted_id.is_some());
        let matched = count_field(&reply, "n") - upserted;
        let modified = count_field(&reply, "nModified");

        Ok(ExecutionResult::Document(if method == Method::Update {
            doc! { "nMatched": matched, "nUpserted": upserted, "nModified": modified }
        } else {
            doc! {
                "acknowledged": true,
                "insertedId": upserted_id.unwrap_or(Bson::Null),
                "matchedCount": matched,
                "modifiedCount": modified,
                "upsertedCount": upserted,
            }
        }))
    }

    /// One `findAndModify` for the `findOneAnd*` methods.
    ///
    /// `change` is the update or replacement with the `new` flag; `None` removes the match.
    fn find_one_and_modify(
        &mut self,
        collection: &str,
        filter: Document,
        change: Option<(Bson, bool)>,
        options: &Document,
    ) -> Result<ExecutionResult, StatementError> {
        let mut command = doc! { "findAndModify": collection, "query": filter };
        match change {
            Some((update, return_new)) => {
                command.insert("update", update);
                command.insert("new", return_new);
            }
            None => {
                command.insert("remove", true);
            }
        }
        for (from, to) in FIND_AND_MODIFY_OPTIONS {
            if let Some(value) = options.get(*from) {
                command.insert(*to, value.clone());
            }
        }
        self.find_and_modify(command)
    }

    fn find_and_modify(&mut self, command: Document) -> Result<ExecutionResult, StatementError> {
        let reply = self.engine.run_command(command)?;
        Ok(match reply.get("value") {
            Some(Bson::Document(d)) => ExecutionResult::Document(d.clone()),
            _ => ExecutionResult::Scalar(Bson::Null),
        })
    }

    fn create_indexes(
        &mut self,
        collection: &str,
        specs: Vec<Document>,
    ) -> Result<(), StatementError> {
        self.engine
            .run_command(doc! { "createIndexes": collection, "indexes": specs })?;
        Ok(())
    }

    fn aggregate(
        &mut self,
        collection: &str,
        pipeline: Vec<Document>,
        mut options: Document,
    ) -> Result<Vec<Document>, StatementError> {
        let mut cursor = Document::new();
        if let Some(size) = options.remove("batchSize") {
            cursor.insert("batchSize", size);
        }
        let mut command = doc! { "aggregate": collection, "pipeline": pipeline, "cursor": cursor };
        command.extend(options);
        let reply = self.engine.run_command(command)?;
        self.drain_cursor(collection, &reply)
    }

    fn count(
        &mut self,
        collection: &str,
        filter: Document,
        options: &Document,
    ) -> Result<i64, StatementError> {
        let mut pipeline = vec![doc! { "$match": filter }];
        if let Some(skip) = options.get("skip") {
            pipeline.push(doc! { "$skip": skip.clone() });
        }
        if let Some(limit) = options.get("limit") {
            pipeline.push(doc! { "$limit": limit.clone() });
        }
        pipeline.push(doc! { "$group": { "_id": 1, "n": { "$sum": 1 } } });
        let docs = self.aggregate(collection, pipeline, Document::new())?;
        Ok(docs.first().map_or(0, |d| count_field(d, "n")))
    }

    fn map_reduce(
        &mut self,
        collection: &str,
        map: Bson,
        reduce: Bson,
        mut options: Document,
    ) -> Result<ExecutionResult, StatementError> {
        let out = match options.remove("out") {
            None => Bson::Document(doc! { "inline": 1 }),
            Some(out @ (Bson::String(_) | Bson::Document(_))) => out,
            Some(_) => {
                return Err(StatementError::mismatch(
                    "mapReduce",
                    "`out` must be a collection name or document",
                ));
            }
        };
        let mut command = doc! {
            "mapReduce": collection,
            "map": map,
            "reduce": reduce,
            "out": out,
        };
        command.extend(options);
        let reply = self.engine.run_command(command)?;
        match reply.get_array("results") {
            Ok(results) => {
                let docs: Vec<Document> = results
                    .iter()
                    .filter_map(|r| r.as_document().cloned())
                    .collect();
                self.guard_size(docs.len())?;
                Ok(ExecutionResult::Documents(docs))
            }
            Err(_) => Ok(ExecutionResult::Document(strip_bookkeeping(reply))),
        }
    }

    fn run_find(&mut self, find: &PendingFind) -> Result<Vec<Document>, StatementError> {
        let mut command = doc! { "find": &find.collection, "filter": find.filter.clone() };
        if let Some(projection) = &find.projection {
            command.insert("projection", projection.clone());
        }
        if let Some(sort) = &find.sort {
            command.insert("sort", sort.clone());
        }
        if let Some(skip) = find.skip {
            command.insert("skip", skip);
        }
        if let Some(limit) = find.limit.filter(|l| *l != 0) {
            command.insert("limit", limit.abs());
            if limit < 0 {
                command.insert("singleBatch", true);
            }
        }
        let reply = self.engine.run_command(command)?;
        self.drain_cursor(&find.collection, &reply)
    }

    /// Fetch every batch of a cursor reply.
    fn drain_cursor(
        &mut self,
        collection: &str,
        reply: &Document,
    ) -> Result<Vec<Document>, StatementError> {
        let (mut id, mut docs) = cursor_batch(reply, "firstBatch")?;
        while id != 0 {
            if docs.len() > self.max_results {
                // Best effort: the server reaps idle cursors anyway.
                let _ = self
                    .engine
                    .run_command(doc! { "killCursors": collection, "cursors": [id] });
                break;
            }
            let reply = self
                .engine
                .run_command(doc! { "getMore": id, "collection": collection })?;
            let (next, batch) = cursor_batch(&reply, "nextBatch")?;
            docs.extend(batch);
            id = next;
        }
        self.guard_size(docs.len())?;
        Ok(docs)
    }

    fn guard_size(&self, len: usize) -> Result<(), StatementError> {
        if len > self.max_results {
            return Err(StatementError::TooManyResults {
                limit: self.max_results,
            });
        }
        Ok(())
    }

    fn to_bson(&self, value: &Value) -> Result<Bson, StatementError> {
        Ok(match value {
            Value::Null => Bson::Null,
            Value::Bool(b) => Bson::Boolean(*b),
            Value::Int(n) => match i32::try_from(*n) {
                Ok(small) => Bson::Int32(small),
                Err(_) => Bson::Int64(*n),
            },
            Value::Long(n) => Bson::Int64(*n),
            Value::Double(f) => Bson::Double(*f),
            Value::String(s) => Bson::String(s.clone()),
            Value::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(|v| self.to_bson(v))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => {
                let mut document = Document::new();
                for (key, value) in fields {
                    document.insert(key.clone(), self.to_bson(value)?);
                }
                Bson::Document(document)
            }
            Value::ObjectId(None) => Bson::ObjectId(ObjectId::new()),
            Value::ObjectId(Some(hex)) => Bson::ObjectId(ObjectId::parse_str(hex).map_err(
                |_| StatementError::mismatch("ObjectId", format!("invalid identifier `{hex}`")),
            )?),
            Value::Date(arg) => Bson::DateTime(parse_date(arg)?),
            Value::Regex { pattern, flags } => Bson::RegularExpression(bson::Regex {
                pattern: pattern.clone(),
                options: flags.clone(),
            }),
            Value::Function(source) => Bson::JavaScriptCode(source.clone()),
            Value::Ident(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| StatementError::UnknownVariable(name.clone()))?,
        })
    }
}

fn receiver_name(receiver: &Receiver) -> String {
    match receiver {
        Receiver::Database => "db".to_string(),
        Receiver::Collection(name) => format!("collection `{name}`"),
        Receiver::Cursor(_) => "cursor".to_string(),
        Receiver::Result(_) => "result".to_string(),
    }
}

/// Shell option names of the `findOneAnd*` methods and their `findAndModify` fields.
const FIND_AND_MODIFY_OPTIONS: &[(&str, &str)] = &[
    ("upsert", "upsert"),
    ("projection", "fields"),
    ("sort", "sort"),
    ("arrayFilters", "arrayFilters"),
    ("collation", "collation"),
    ("hint", "hint"),
    ("maxTimeMS", "maxTimeMS"),
];

const INDEX_OPTIONS: &[&str] = &[
    "name",
    "unique",
    "sparse",
    "background",
    "collation",
    "expireAfterSeconds",
    "partialFilterExpression",
    "hidden",
    "weights",
    "default_language",
    "language_override",
    "wildcardProjection",
];

/// Argument list of one method call, with shape checks.
struct Args<'a> {
    method: Method,
    values: &'a [Bson],
}

impl Args<'_> {
    fn mismatch(&self, reason: impl Into<String>) -> StatementError {
        StatementError::mismatch(self.method.name(), reason)
    }

    fn arity(&self, min: usize, max: usize) -> Result<(), StatementError> {
        let n = self.values.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(self.mismatch(format!("expected {expected} argument(s), got {n}")));
        }
        Ok(())
    }

    fn document(&self, idx: usize) -> Result<Document, StatementError> {
        match self.values.get(idx) {
            Some(Bson::Document(d)) => Ok(d.clone()),
            _ => Err(self.mismatch(format!("argument {} must be a document", idx + 1))),
        }
    }

    fn optional_document(&self, idx: usize) -> Result<Option<Document>, StatementError> {
        match self.values.get(idx) {
            None | Some(Bson::Null) => Ok(None),
            Some(_) => self.document(idx).map(Some),
        }
    }

    fn documents(&self, idx: usize) -> Result<Vec<Document>, StatementError> {
        let Some(Bson::Array(items)) = self.values.get(idx) else {
            return Err(self.mismatch(format!("argument {} must be an array", idx + 1)));
        };
        items
            .iter()
            .map(|item| {
                item.as_document()
                    .cloned()
                    .ok_or_else(|| self.mismatch("array must contain only documents"))
            })
            .collect()
    }

    /// An options document restricted to `allowed` keys; empty when absent.
    fn options(&self, idx: usize, allowed: &[&str]) -> Result<Document, StatementError> {
        let options = self.optional_document(idx)?.unwrap_or_default();
        if let Some(key) = options.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(self.mismatch(format!("unknown option `{key}`")));
        }
        Ok(options)
    }

    /// An update document or aggregation pipeline.
    ///
    /// With `operators_only`, a document must consist of update operators.
    fn update_spec(&self, idx: usize, operators_only: bool) -> Result<Bson, StatementError> {
        match self.values.get(idx) {
            Some(Bson::Document(d)) => {
                if operators_only && (d.is_empty() || !d.keys().all(|k| k.starts_with('$'))) {
                    return Err(self.mismatch("update document requires atomic operators"));
                }
                Ok(Bson::Document(d.clone()))
            }
            Some(Bson::Array(_)) => Ok(Bson::Array(
                self.documents(idx)?.into_iter().map(Bson::Document).collect(),
            )),
            _ => Err(self.mismatch(format!(
                "argument {} must be an update document or pipeline",
                idx + 1
            ))),
        }
    }

    /// A whole replacement document, which must not contain update operators.
    fn replacement(&self, idx: usize) -> Result<Document, StatementError> {
        let document = self.document(idx)?;
        if document.keys().any(|k| k.starts_with('$')) {
            return Err(self.mismatch("replacement document must not contain update operators"));
        }
        Ok(document)
    }

    /// `returnDocument: "after"` or the older `returnNewDocument: true`.
    fn return_new(&self, options: &Document) -> Result<bool, StatementError> {
        match options.get("returnDocument") {
            Some(Bson::String(s)) if s == "after" => Ok(true),
            Some(Bson::String(s)) if s == "before" => Ok(false),
            Some(_) => Err(self.mismatch("returnDocument must be \"before\" or \"after\"")),
            None => Ok(options.get_bool("returnNewDocument").unwrap_or(false)),
        }
    }

    fn index_keys(&self, value: &Bson) -> Result<Document, StatementError> {
        match value {
            Bson::Document(keys) if !keys.is_empty() => Ok(keys.clone()),
            _ => Err(self.mismatch("index keys must be a non-empty document")),
        }
    }

    fn code(&self, idx: usize) -> Result<Bson, StatementError> {
        match self.values.get(idx) {
            Some(Bson::JavaScriptCode(_)) => Ok(self.values[idx].clone()),
            Some(Bson::String(source)) => Ok(Bson::JavaScriptCode(source.clone())),
            _ => Err(self.mismatch(format!("argument {} must be a function", idx + 1))),
        }
    }
}

/// Index specification for `createIndexes`, named the way the shell names indexes.
fn index_spec(keys: Document, options: &Document) -> Document {
    let name = match options.get_str("name") {
        Ok(name) => name.to_string(),
        Err(_) => index_name(&keys),
    };
    let mut spec = doc! { "key": keys, "name": name };
    for (key, value) in options {
        if key != "name" {
            spec.insert(key.clone(), value.clone());
        }
    }
    spec
}

/// `{category: 1, title: -1}` becomes `category_1_title_-1`.
pub fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, value)| {
            let value = match value {
                Bson::Int32(n) => n.to_string(),
                Bson::Int64(n) => n.to_string(),
                Bson::Double(f) if f.fract() == 0.0 => format!("{}", *f as i64),
                Bson::Double(f) => f.to_string(),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{field}_{value}")
        })
        .collect::<Vec<_>>()
        .join("_")
}

fn with_id(document: Document) -> (Bson, Document) {
    if let Some(id) = document.get("_id") {
        return (id.clone(), document);
    }
    let id = Bson::ObjectId(ObjectId::new());
    let mut with_id = doc! { "_id": id.clone() };
    with_id.extend(document);
    (id, with_id)
}

fn as_integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

fn count_field(document: &Document, key: &str) -> i64 {
    document.get(key).and_then(as_integer).unwrap_or(0)
}

/// Split a cursor reply into its id and the documents of `batch`.
fn cursor_batch(reply: &Document, batch: &str) -> Result<(i64, Vec<Document>), StatementError> {
    let malformed = || StatementError::from(DbError::new(format!("malformed cursor reply: {reply}")));
    let cursor = reply.get_document("cursor").map_err(|_| malformed())?;
    let id = cursor.get("id").and_then(as_integer).ok_or_else(malformed)?;
    let docs = cursor
        .get_array(batch)
        .map_err(|_| malformed())?
        .iter()
        .map(|d| d.as_document().cloned().ok_or_else(malformed))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((id, docs))
}

/// Turn write errors reported inside an `ok: 1` reply into a statement error.
fn check_write_errors(reply: &Document) -> Result<(), StatementError> {
    let first_error = reply
        .get_array("writeErrors")
        .ok()
        .and_then(|errors| errors.first())
        .and_then(Bson::as_document)
        .or_else(|| reply.get_document("writeConcernError").ok());
    let Some(error) = first_error else {
        return Ok(());
    };
    let code = error.get("code").and_then(as_integer).unwrap_or(0) as i32;
    let code_name = match error.get_str("codeName") {
        Ok(name) => name,
        Err(_) if code == 11000 => "DuplicateKey",
        Err(_) => "WriteError",
    };
    let message = error.get_str("errmsg").unwrap_or("write failed");
    Err(DbError::server(code, code_name, message).into())
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%b %d, %Y", "%B %d, %Y", "%b %d %Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Dates without an offset are taken as UTC so results do not depend on the host zone.
fn parse_date(arg: &DateArg) -> Result<bson::DateTime, StatementError> {
    let text = match arg {
        DateArg::Now => return Ok(bson::DateTime::now()),
        DateArg::Millis(ms) => return Ok(bson::DateTime::from_millis(*ms)),
        DateArg::Text(text) => text.trim(),
    };
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Ok(bson::DateTime::from_millis(dt.timestamp_millis()));
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, format) {
            return Ok(bson::DateTime::from_millis(dt.and_utc().timestamp_millis()));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(text, format)
            && let Some(dt) = date.and_hms_opt(0, 0, 0)
        {
            return Ok(bson::DateTime::from_millis(dt.and_utc().timestamp_millis()));
        }
    }
    Err(StatementError::mismatch(
        "Date",
        format!("cannot parse date `{text}`"),
    ))
}
