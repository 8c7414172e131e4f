// SPDX-License-Identifier: MIT OR Apache-2.0

//! The adapter surface consumed by the document server: the two-phase commit,
//! op log reads, snapshot reads and query dispatch.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    CountOptions, FindOptions, Hint, IndexOptions, ReadConcern, ReadPreference,
    ReadPreferenceOptions, SelectionCriteria,
};
use mongodb::{Collection, Database, IndexModel};
use tracing::warn;

use crate::error::StoreError;
use crate::mongo::connection::Connection;
use crate::op::{check_ops_from, latest_delete_link, link_ops, Op, OpRow};
use crate::poll;
use crate::query::{
    check_query, make_query_safe, parse_query, refine_filter_for_doc, CollectionOp, CursorOp,
    ParsedQuery,
};
use crate::snapshot::{as_version, projection_for, snapshot_to_document, Fields, Snapshot};
use crate::Config;

/// Prefix of the op-log collection backing a logical collection.
const OP_COLLECTION_PREFIX: &str = "o_";

/// The outcome of a query: matching snapshots, plus the scalar result of a
/// collection or cursor operation when one ran.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub snapshots: Vec<Snapshot>,
    pub extra: Option<Bson>,
}

/// MongoDB storage adapter for the document server.
///
/// Documents live in their logical collection; each op is appended to the
/// sibling `o_<collection>` log before the snapshot is advanced with a
/// compare-and-set on `(_id, _v)`. All methods are re-entrant; per-document
/// ordering rests entirely on the store-side CAS.
#[derive(Clone, Debug)]
pub struct MongoStore {
    connection: Connection,
    op_indexes: Arc<Mutex<HashSet<String>>>,
    disable_index_creation: bool,
    allow_js_queries: bool,
    allow_aggregate_queries: bool,
}

impl MongoStore {
    /// Construct the adapter. Connecting starts in the background; operations
    /// issued before the store is reachable wait for it.
    pub fn new(config: Config) -> Self {
        let poll_delay = config.poll_delay();
        let allow_js_queries = config.allow_js_queries || config.allow_all_queries;
        let allow_aggregate_queries = config.allow_aggregate_queries || config.allow_all_queries;
        Self {
            connection: Connection::new(config.mongo, config.mongo_poll, poll_delay),
            op_indexes: Arc::new(Mutex::new(HashSet::new())),
            disable_index_creation: config.disable_index_creation,
            allow_js_queries,
            allow_aggregate_queries,
        }
    }

    /// Release the store clients. Every operation issued afterwards fails
    /// with [`StoreError::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.connection.close().await;
        Ok(())
    }

    /// Atomically advance a document by one op.
    ///
    /// The op is written to the log first, making the log the canonical
    /// history, then the snapshot is advanced with a compare-and-set against
    /// the previous version. `Ok(false)` reports a lost race against a
    /// concurrent writer; the caller transforms and retries. Ops orphaned by
    /// lost races are deleted best-effort and ignored by readers either way.
    pub async fn commit(
        &self,
        collection: &str,
        id: &str,
        op: &Op,
        snapshot: &Snapshot,
    ) -> Result<bool, StoreError> {
        if op.version + 1 != snapshot.version {
            return Err(StoreError::InvalidOpVersion {
                id: id.to_string(),
                version: op.version,
            });
        }
        let op_collection = self.op_collection(collection).await?;
        let doc_collection = self.doc_collection(collection).await?;

        let op_doc = op.to_document(id, snapshot.op_link.as_ref());
        let op_id = op_collection.insert_one(op_doc).await?.inserted_id;

        let doc = snapshot_to_document(id, snapshot, op_id.clone());
        let advanced = if snapshot.version == 1 {
            match doc_collection.insert_one(doc).await {
                Ok(_) => Ok(true),
                // A concurrent create on the same id.
                Err(err) if is_duplicate_key_error(&err) => Ok(false),
                Err(err) => Err(StoreError::from(err)),
            }
        } else {
            let previous = doc! { "_id": id, "_v": snapshot.version as i64 - 1 };
            match doc_collection.replace_one(previous, doc).await {
                Ok(outcome) => Ok(outcome.modified_count == 1),
                Err(err) => Err(StoreError::from(err)),
            }
        };

        match advanced {
            Ok(true) => Ok(true),
            outcome => {
                if let Err(cleanup_err) = op_collection.delete_one(doc! { "_id": op_id }).await {
                    warn!("failed to remove op after unsuccessful commit: {cleanup_err}");
                    if outcome.is_ok() {
                        return Err(cleanup_err.into());
                    }
                }
                outcome
            }
        }
    }

    /// Look up whether a client submission identified by `(src, seq)` was
    /// already committed, returning its version when it is part of the
    /// document's canonical chain. Retried commits can leave duplicate rows,
    /// so the chain is consulted rather than the earliest row alone.
    pub async fn get_committed_op_version(
        &self,
        collection: &str,
        id: &str,
        snapshot: &Snapshot,
        op: &Op,
    ) -> Result<Option<u64>, StoreError> {
        let op_collection = self.op_collection(collection).await?;
        let earliest = op_collection
            .find_one(doc! { "src": op.source.as_str(), "seq": op.seq as i64 })
            .projection(doc! { "v": 1 })
            .sort(doc! { "v": 1 })
            .await?;
        let Some(earliest) = earliest else {
            return Ok(None);
        };
        let from = earliest
            .get("v")
            .and_then(as_version)
            .ok_or_else(|| StoreError::CorruptOpRecord(id.to_string()))?;
        let ops = self
            .get_ops_to_snapshot(collection, id, Some(from), snapshot)
            .await?;
        Ok(ops
            .iter()
            .find(|candidate| candidate.source == op.source && candidate.seq == op.seq)
            .map(|candidate| candidate.version))
    }

    /// Fetch a document's snapshot. A document that was never created comes
    /// back as a deleted snapshot at version 0.
    pub async fn get_snapshot(
        &self,
        collection: &str,
        id: &str,
        fields: Option<&Fields>,
    ) -> Result<Snapshot, StoreError> {
        let doc_collection = self.doc_collection(collection).await?;
        let mut find = doc_collection.find_one(doc! { "_id": id });
        if let Some(projection) = projection_for(fields) {
            find = find.projection(projection);
        }
        Ok(match find.await? {
            Some(doc) => Snapshot::from(doc),
            None => Snapshot::missing(id),
        })
    }

    /// Fetch many snapshots in one read, filling ids that have no document
    /// with deleted snapshots at version 0.
    pub async fn get_snapshot_bulk(
        &self,
        collection: &str,
        ids: &[&str],
        fields: Option<&Fields>,
    ) -> Result<HashMap<String, Snapshot>, StoreError> {
        let doc_collection = self.doc_collection(collection).await?;
        let id_list: Vec<Bson> = ids.iter().map(|id| Bson::String(id.to_string())).collect();
        let mut find = doc_collection.find(doc! { "_id": { "$in": id_list } });
        if let Some(projection) = projection_for(fields) {
            find = find.projection(projection);
        }
        let docs: Vec<Document> = find.await?.try_collect().await?;

        let mut snapshots: HashMap<String, Snapshot> = docs
            .into_iter()
            .map(Snapshot::from)
            .map(|snapshot| (snapshot.id.clone(), snapshot))
            .collect();
        for id in ids {
            snapshots
                .entry(id.to_string())
                .or_insert_with(|| Snapshot::missing(id));
        }
        Ok(snapshots)
    }

    /// Recover the canonical op sequence `[from, to)` for a document. `from`
    /// of `None` means from the start, `to` of `None` means open-ended.
    pub async fn get_ops(
        &self,
        collection: &str,
        id: &str,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<Op>, StoreError> {
        let link = self.get_snapshot_op_link(collection, id).await?;
        if let Some(link) = &link {
            if Some(link.version) == from {
                // The caller is current.
                return Ok(Vec::new());
            }
            if link.link.is_none() {
                return Err(StoreError::MissingLastOperation(id.to_string()));
            }
        }
        let rows = self.fetch_op_rows(collection, id, from).await?;
        let ops = match &link {
            Some(link) => link_ops(rows, link.link.as_ref(), to),
            None => filter_ops_without_snapshot(rows, to),
        };
        check_ops_from(&ops, id, from)?;
        Ok(ops)
    }

    /// Like [`get_ops`](Self::get_ops), but link-filters against the op link
    /// carried by a snapshot the caller already holds.
    pub async fn get_ops_to_snapshot(
        &self,
        collection: &str,
        id: &str,
        from: Option<u64>,
        snapshot: &Snapshot,
    ) -> Result<Vec<Op>, StoreError> {
        let Some(link) = &snapshot.op_link else {
            return Err(StoreError::MissingLastOperation(id.to_string()));
        };
        let rows = self.fetch_op_rows(collection, id, from).await?;
        let ops = link_ops(rows, Some(link), None);
        check_ops_from(&ops, id, from)?;
        Ok(ops)
    }

    /// Recover canonical op sequences for many documents at once. `from`
    /// names every document wanted; `to` optionally bounds individual
    /// documents.
    pub async fn get_ops_bulk(
        &self,
        collection: &str,
        from: &HashMap<String, u64>,
        to: Option<&HashMap<String, u64>>,
    ) -> Result<HashMap<String, Vec<Op>>, StoreError> {
        let doc_collection = self.doc_collection(collection).await?;
        let id_list: Vec<Bson> = from.keys().map(|id| Bson::String(id.clone())).collect();
        let link_docs: Vec<Document> = doc_collection
            .find(doc! { "_id": { "$in": id_list } })
            .projection(doc! { "_v": 1, "_o": 1 })
            .await?
            .try_collect()
            .await?;
        let mut links: HashMap<String, SnapshotOpLink> = HashMap::new();
        for doc in link_docs {
            let id = doc.get_str("_id").unwrap_or_default().to_string();
            links.insert(id, SnapshotOpLink::from_projection(&doc));
        }

        let mut results: HashMap<String, Vec<Op>> = HashMap::new();
        let mut conditions = Vec::new();
        for (id, from_version) in from {
            if let Some(link) = links.get(id) {
                if link.version == *from_version {
                    results.insert(id.clone(), Vec::new());
                    continue;
                }
                if link.link.is_none() {
                    return Err(StoreError::MissingLastOperation(id.clone()));
                }
            }
            conditions.push(Bson::Document(
                doc! { "d": id.as_str(), "v": { "$gte": *from_version as i64 } },
            ));
        }
        if conditions.is_empty() {
            return Ok(results);
        }

        let op_collection = self.op_collection(collection).await?;
        let op_docs: Vec<Document> = op_collection
            .find(doc! { "$or": conditions })
            .projection(doc! { "m": 0 })
            .await?
            .try_collect()
            .await?;
        let mut rows_by_id: HashMap<String, Vec<OpRow>> = HashMap::new();
        for doc in op_docs {
            let id = doc.get_str("d").unwrap_or_default().to_string();
            let row = OpRow::from_document(doc, &id)?;
            rows_by_id.entry(id).or_default().push(row);
        }

        for (id, mut rows) in rows_by_id {
            rows.sort_by_key(|row| row.op.version);
            let to_version = to.and_then(|to| to.get(&id)).copied();
            let ops = match links.get(&id) {
                Some(link) => link_ops(rows, link.link.as_ref(), to_version),
                None => filter_ops_without_snapshot(rows, to_version),
            };
            check_ops_from(&ops, &id, from.get(&id).copied())?;
            results.insert(id, ops);
        }
        for id in from.keys() {
            results.entry(id.clone()).or_default();
        }
        Ok(results)
    }

    async fn get_snapshot_op_link(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<SnapshotOpLink>, StoreError> {
        let doc_collection = self.doc_collection(collection).await?;
        let doc = doc_collection
            .find_one(doc! { "_id": id })
            .projection(doc! { "_v": 1, "_o": 1 })
            .await?;
        Ok(doc.map(|doc| SnapshotOpLink::from_projection(&doc)))
    }

    async fn fetch_op_rows(
        &self,
        collection: &str,
        id: &str,
        from: Option<u64>,
    ) -> Result<Vec<OpRow>, StoreError> {
        let op_collection = self.op_collection(collection).await?;
        let filter = match from {
            Some(from) => doc! { "d": id, "v": { "$gte": from as i64 } },
            None => doc! { "d": id },
        };
        let docs: Vec<Document> = op_collection
            .find(filter)
            .projection(doc! { "d": 0, "m": 0 })
            .sort(doc! { "v": 1 })
            .await?
            .try_collect()
            .await?;
        docs.into_iter()
            .map(|doc| OpRow::from_document(doc, id))
            .collect()
    }

    /// Run a query against the primary store.
    pub async fn query(
        &self,
        collection: &str,
        query: Document,
        fields: Option<&Fields>,
    ) -> Result<QueryResult, StoreError> {
        Self::check_collection_name(collection)?;
        let parsed = self.parse(query)?;
        let database = self.connection.primary().await?;
        self.run_query(&database, collection, parsed, projection_for(fields))
            .await
    }

    /// Run a query against the poll store, returning only matching ids.
    pub async fn query_poll(
        &self,
        collection: &str,
        query: Document,
    ) -> Result<(Vec<String>, Option<Bson>), StoreError> {
        Self::check_collection_name(collection)?;
        let parsed = self.parse(query)?;
        let database = self.connection.poll().await?;
        let result = self
            .run_query(&database, collection, parsed, Some(doc! { "_id": 1 }))
            .await?;
        let ids = result
            .snapshots
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect();
        Ok((ids, result.extra))
    }

    /// Check whether one particular document currently matches a query.
    pub async fn query_poll_doc(
        &self,
        collection: &str,
        id: &str,
        query: Document,
    ) -> Result<bool, StoreError> {
        Self::check_collection_name(collection)?;
        let parsed = self.parse(query)?;
        let Some(filter) = refine_filter_for_doc(&parsed.filter, id) else {
            return Ok(false);
        };
        let database = self.connection.poll().await?;
        let doc = database
            .collection::<Document>(collection)
            .find_one(filter)
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(doc.is_some())
    }

    /// Whether a query can be re-evaluated per document (see [`poll`]). A
    /// pure function of the query's shape; the query gates play no part.
    pub fn can_poll_doc(&self, _collection: &str, query: &Document) -> bool {
        poll::can_poll_doc(query)
    }

    /// Whether re-polling a query after `op` can be skipped (see [`poll`]).
    pub fn skip_poll(&self, _collection: &str, _id: &str, op: &Op, query: &Document) -> bool {
        poll::skip_poll(op, query)
    }

    fn parse(&self, query: Document) -> Result<ParsedQuery, StoreError> {
        check_query(&query, self.allow_js_queries, self.allow_aggregate_queries)?;
        let mut parsed = parse_query(query)?;
        make_query_safe(&mut parsed.filter);
        Ok(parsed)
    }

    async fn run_query(
        &self,
        database: &Database,
        collection: &str,
        parsed: ParsedQuery,
        projection: Option<Document>,
    ) -> Result<QueryResult, StoreError> {
        let doc_collection: Collection<Document> = database.collection(collection);

        if let Some(operation) = parsed.collection_op {
            let extra = run_collection_op(database, &doc_collection, &parsed.filter, operation)
                .await?;
            return Ok(QueryResult {
                snapshots: Vec::new(),
                extra: Some(extra),
            });
        }
        if let Some(operation) = parsed.cursor_op {
            let extra = run_cursor_op(
                database,
                &doc_collection,
                collection,
                &parsed.filter,
                &parsed.cursor_transforms,
                operation,
            )
            .await?;
            return Ok(QueryResult {
                snapshots: Vec::new(),
                extra: Some(extra),
            });
        }

        let options = find_options(&parsed.cursor_transforms, projection)?;
        let docs: Vec<Document> = doc_collection
            .find(parsed.filter)
            .with_options(options)
            .await?
            .try_collect()
            .await?;
        Ok(QueryResult {
            snapshots: docs.into_iter().map(Snapshot::from).collect(),
            extra: None,
        })
    }

    fn check_collection_name(collection: &str) -> Result<(), StoreError> {
        if collection == "system" || collection.starts_with(OP_COLLECTION_PREFIX) {
            return Err(StoreError::InvalidCollectionName(collection.to_string()));
        }
        Ok(())
    }

    async fn doc_collection(&self, collection: &str) -> Result<Collection<Document>, StoreError> {
        Self::check_collection_name(collection)?;
        Ok(self.connection.primary().await?.collection(collection))
    }

    /// The op-log collection for a logical collection. The first use per
    /// process ensures the history-scan and idempotency indexes exist.
    async fn op_collection(&self, collection: &str) -> Result<Collection<Document>, StoreError> {
        Self::check_collection_name(collection)?;
        let database = self.connection.primary().await?;
        let op_collection =
            database.collection(&format!("{OP_COLLECTION_PREFIX}{collection}"));
        if self.disable_index_creation {
            return Ok(op_collection);
        }
        let first_use = self
            .op_indexes
            .lock()
            .expect("acquire access to the op index set")
            .insert(collection.to_string());
        if first_use {
            let background = IndexOptions::builder().background(true).build();
            let indexes = vec![
                IndexModel::builder()
                    .keys(doc! { "d": 1, "v": 1 })
                    .options(background.clone())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "src": 1, "seq": 1, "v": 1 })
                    .options(background)
                    .build(),
            ];
            if let Err(err) = op_collection.create_indexes(indexes).await {
                warn!(
                    collection = op_collection.name(),
                    "could not create op log indexes: {err}"
                );
                // Drop the marker so a later call tries again.
                self.op_indexes
                    .lock()
                    .expect("acquire access to the op index set")
                    .remove(collection);
            }
        }
        Ok(op_collection)
    }
}

/// The `{_v, _o}` projection of a snapshot row.
#[derive(Clone, Debug)]
struct SnapshotOpLink {
    version: u64,
    link: Option<Bson>,
}

impl SnapshotOpLink {
    fn from_projection(doc: &Document) -> Self {
        Self {
            version: doc.get("_v").and_then(as_version).unwrap_or(0),
            link: doc.get("_o").filter(|link| *link != &Bson::Null).cloned(),
        }
    }
}

/// When the snapshot row is gone the document was deleted: the latest delete
/// op roots its observable history. Without one, a create raced ahead of its
/// snapshot write and nothing is observable yet.
fn filter_ops_without_snapshot(rows: Vec<OpRow>, to: Option<u64>) -> Vec<Op> {
    match latest_delete_link(&rows) {
        Some(link) => link_ops(rows, Some(&link), to),
        None => Vec::new(),
    }
}

fn is_duplicate_key_error(error: &mongodb::error::Error) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}

async fn run_collection_op(
    database: &Database,
    collection: &Collection<Document>,
    filter: &Document,
    operation: CollectionOp,
) -> Result<Bson, StoreError> {
    match operation {
        CollectionOp::Distinct { field } => {
            let values = collection.distinct(field, filter.clone()).await?;
            Ok(Bson::Array(values))
        }
        CollectionOp::Aggregate(pipeline) => {
            let docs: Vec<Document> = collection.aggregate(pipeline).await?.try_collect().await?;
            Ok(Bson::Array(docs.into_iter().map(Bson::Document).collect()))
        }
        CollectionOp::MapReduce { map, reduce, scope } => {
            // The driver has no mapReduce helper; issue the command directly
            // with inline output.
            let mut command = doc! {
                "mapReduce": collection.name(),
                "map": Bson::JavaScriptCode(map),
                "reduce": Bson::JavaScriptCode(reduce),
                "query": filter.clone(),
                "out": { "inline": 1 },
            };
            if let Some(scope) = scope {
                command.insert("scope", scope);
            }
            let reply = database.run_command(command).await?;
            Ok(reply
                .get("results")
                .cloned()
                .unwrap_or(Bson::Array(Vec::new())))
        }
    }
}

async fn run_cursor_op(
    database: &Database,
    collection: &Collection<Document>,
    collection_name: &str,
    filter: &Document,
    transforms: &[(String, Bson)],
    operation: CursorOp,
) -> Result<Bson, StoreError> {
    match operation {
        CursorOp::Count => {
            let options = count_options(transforms)?;
            let count = collection
                .count_documents(filter.clone())
                .with_options(options)
                .await?;
            Ok(Bson::Int64(count as i64))
        }
        CursorOp::Explain => {
            let mut find_command = doc! { "find": collection_name, "filter": filter.clone() };
            for (key, value) in transforms {
                match key.as_str() {
                    "$sort" => find_command.insert("sort", value.clone()),
                    "$skip" => find_command.insert("skip", value.clone()),
                    "$limit" => find_command.insert("limit", value.clone()),
                    "$hint" => find_command.insert("hint", value.clone()),
                    _ => None,
                };
            }
            let reply = database
                .run_command(doc! { "explain": find_command, "verbosity": "queryPlanner" })
                .await?;
            Ok(Bson::Document(reply))
        }
        // A wire-shaped query cannot carry the in-process mapping function
        // this operator needs.
        CursorOp::Map => Err(StoreError::MalformedQueryOperator("$map".to_string())),
    }
}

/// Fold the cursor transforms into driver find options, in their given
/// order. A value an operator cannot work with fails the query.
fn find_options(
    transforms: &[(String, Bson)],
    projection: Option<Document>,
) -> Result<FindOptions, StoreError> {
    let mut options = FindOptions::default();
    options.projection = projection;
    for (key, value) in transforms {
        match key.as_str() {
            "$sort" => options.sort = Some(doc_value(key, value)?),
            "$skip" => options.skip = Some(u64_value(key, value)?),
            "$limit" => options.limit = Some(i64_value(key, value)?),
            "$batchSize" => options.batch_size = Some(u32_value(key, value)?),
            "$comment" => options.comment = Some(value.clone()),
            "$hint" => options.hint = Some(hint_value(key, value)?),
            "$maxTimeMS" => {
                options.max_time = Some(Duration::from_millis(u64_value(key, value)?))
            }
            "$min" => options.min = Some(doc_value(key, value)?),
            "$max" => options.max = Some(doc_value(key, value)?),
            "$returnKey" => options.return_key = Some(bool_value(key, value)?),
            "$showRecordId" => options.show_record_id = Some(bool_value(key, value)?),
            "$noCursorTimeout" => options.no_cursor_timeout = Some(bool_value(key, value)?),
            "$readConcern" => options.read_concern = Some(read_concern_value(key, value)?),
            "$readPref" => options.selection_criteria = Some(read_pref_value(key, value)?),
            "$maxScan" | "$snapshot" => {
                // Removed by the server (4.2 / 4.0); accepted for wire
                // compatibility.
                warn!("ignoring unsupported query operator {key}");
            }
            other => return Err(StoreError::MalformedQueryOperator(other.to_string())),
        }
    }
    Ok(options)
}

fn count_options(transforms: &[(String, Bson)]) -> Result<CountOptions, StoreError> {
    let mut options = CountOptions::default();
    for (key, value) in transforms {
        match key.as_str() {
            "$skip" => options.skip = Some(u64_value(key, value)?),
            "$limit" => options.limit = Some(u64_value(key, value)?),
            "$hint" => options.hint = Some(hint_value(key, value)?),
            "$maxTimeMS" => {
                options.max_time = Some(Duration::from_millis(u64_value(key, value)?))
            }
            _ => {}
        }
    }
    Ok(options)
}

fn malformed(key: &str) -> StoreError {
    StoreError::MalformedQueryOperator(key.to_string())
}

fn doc_value(key: &str, value: &Bson) -> Result<Document, StoreError> {
    value.as_document().cloned().ok_or_else(|| malformed(key))
}

fn integer_value(key: &str, value: &Bson) -> Result<i64, StoreError> {
    match value {
        Bson::Int32(number) => Ok(i64::from(*number)),
        Bson::Int64(number) => Ok(*number),
        Bson::Double(number) if number.fract() == 0.0 => Ok(*number as i64),
        _ => Err(malformed(key)),
    }
}

fn i64_value(key: &str, value: &Bson) -> Result<i64, StoreError> {
    integer_value(key, value)
}

fn u64_value(key: &str, value: &Bson) -> Result<u64, StoreError> {
    u64::try_from(integer_value(key, value)?).map_err(|_| malformed(key))
}

fn u32_value(key: &str, value: &Bson) -> Result<u32, StoreError> {
    u32::try_from(integer_value(key, value)?).map_err(|_| malformed(key))
}

fn bool_value(key: &str, value: &Bson) -> Result<bool, StoreError> {
    value.as_bool().ok_or_else(|| malformed(key))
}

fn hint_value(key: &str, value: &Bson) -> Result<Hint, StoreError> {
    match value {
        Bson::String(index_name) => Ok(Hint::Name(index_name.clone())),
        Bson::Document(keys) => Ok(Hint::Keys(keys.clone())),
        _ => Err(malformed(key)),
    }
}

/// `$readConcern` arrives as `{level: "..."}`; a bare level string is
/// tolerated.
fn read_concern_value(key: &str, value: &Bson) -> Result<ReadConcern, StoreError> {
    let level = match value {
        Bson::String(level) => level.as_str(),
        Bson::Document(spec) => spec.get_str("level").map_err(|_| malformed(key))?,
        _ => return Err(malformed(key)),
    };
    Ok(match level {
        "local" => ReadConcern::local(),
        "majority" => ReadConcern::majority(),
        "linearizable" => ReadConcern::linearizable(),
        "available" => ReadConcern::available(),
        other => ReadConcern::custom(other),
    })
}

/// `$readPref` arrives as `{mode: "...", tagSet?: [...]}`.
fn read_pref_value(key: &str, value: &Bson) -> Result<SelectionCriteria, StoreError> {
    let spec = value.as_document().ok_or_else(|| malformed(key))?;
    let mode = spec.get_str("mode").map_err(|_| malformed(key))?;

    let mut options = ReadPreferenceOptions::default();
    if let Ok(tag_sets) = spec.get_array("tagSet") {
        let tag_sets = tag_sets
            .iter()
            .filter_map(|tags| tags.as_document())
            .map(|tags| {
                tags.iter()
                    .map(|(tag, value)| {
                        (
                            tag.clone(),
                            value.as_str().map(str::to_string).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .collect();
        options.tag_sets = Some(tag_sets);
    }

    let preference = match mode.to_ascii_lowercase().as_str() {
        "primary" => ReadPreference::Primary,
        "primarypreferred" => ReadPreference::PrimaryPreferred {
            options: options.into(),
        },
        "secondary" => ReadPreference::Secondary {
            options: options.into(),
        },
        "secondarypreferred" => ReadPreference::SecondaryPreferred {
            options: options.into(),
        },
        "nearest" => ReadPreference::Nearest {
            options: options.into(),
        },
        _ => return Err(malformed(key)),
    };
    Ok(SelectionCriteria::ReadPreference(preference))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_collection_names_are_rejected() {
        let err = MongoStore::check_collection_name("system").expect_err("rejected");
        assert_eq!(err.code(), Some(4102));
        let err = MongoStore::check_collection_name("o_notes").expect_err("rejected");
        assert_eq!(err.code(), Some(4102));
        assert!(MongoStore::check_collection_name("notes").is_ok());
    }

    #[test]
    fn find_options_fold_in_order() {
        let transforms = vec![
            ("$sort".to_string(), Bson::Document(doc! { "x": 1 })),
            ("$skip".to_string(), Bson::Int32(5)),
            ("$limit".to_string(), Bson::Int64(10)),
            ("$maxTimeMS".to_string(), Bson::Int32(250)),
            ("$comment".to_string(), Bson::String("why".to_string())),
        ];
        let options = find_options(&transforms, Some(doc! { "_id": 1 })).expect("valid");
        assert_eq!(options.sort, Some(doc! { "x": 1 }));
        assert_eq!(options.skip, Some(5));
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.max_time, Some(Duration::from_millis(250)));
        assert_eq!(options.projection, Some(doc! { "_id": 1 }));
    }

    #[test]
    fn malformed_transform_values_fail_the_query() {
        let transforms = vec![("$skip".to_string(), Bson::String("nope".to_string()))];
        let err = find_options(&transforms, None).expect_err("rejected");
        assert_eq!(err.code(), Some(4107));

        let transforms = vec![("$sort".to_string(), Bson::Int32(1))];
        let err = find_options(&transforms, None).expect_err("rejected");
        assert_eq!(err.code(), Some(4107));
    }

    #[test]
    fn hints_accept_names_and_key_patterns() {
        let hint = hint_value("$hint", &Bson::String("d_1_v_1".to_string())).expect("valid");
        assert!(matches!(hint, Hint::Name(name) if name == "d_1_v_1"));
        let hint = hint_value("$hint", &Bson::Document(doc! { "d": 1 })).expect("valid");
        assert!(matches!(hint, Hint::Keys(keys) if keys == doc! { "d": 1 }));
        assert!(hint_value("$hint", &Bson::Int32(1)).is_err());
    }

    #[test]
    fn read_preferences_parse_modes_and_tags() {
        let value = Bson::Document(doc! {
            "mode": "secondaryPreferred",
            "tagSet": [{ "dc": "east" }],
        });
        let criteria = read_pref_value("$readPref", &value).expect("valid");
        match criteria {
            SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred { .. }) => {}
            other => panic!("unexpected selection criteria: {other:?}"),
        }
        assert!(read_pref_value("$readPref", &Bson::Document(doc! { "mode": "sideways" })).is_err());
    }

    #[test]
    fn count_options_take_paging_transforms() {
        let transforms = vec![
            ("$skip".to_string(), Bson::Int32(2)),
            ("$limit".to_string(), Bson::Int32(3)),
            ("$sort".to_string(), Bson::Document(doc! { "x": 1 })),
        ];
        let options = count_options(&transforms).expect("valid");
        assert_eq!(options.skip, Some(2));
        assert_eq!(options.limit, Some(3));
    }
}
