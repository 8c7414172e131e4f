// SPDX-License-Identifier: MIT OR Apache-2.0

//! Behaviour against a live MongoDB.
//!
//! These tests run when `MONGODB_URL` names a reachable store (including a
//! database name, e.g. `mongodb://localhost:27017/rivulet-test`) and are
//! no-ops otherwise. Each test works in its own pair of collections and
//! drops them up front, so reruns start clean.
use std::collections::HashMap;

use mongodb::bson::{doc, Bson, Document};
use mongodb::{Client, Database};
use rivulet_mongo::{Config, Fields, MongoSource, MongoStore, Op, OpAction, Snapshot};

async fn connect() -> Option<(MongoStore, Database)> {
    connect_with(|_| {}).await
}

async fn connect_with(prepare: impl FnOnce(&mut Config)) -> Option<(MongoStore, Database)> {
    let url = std::env::var("MONGODB_URL").ok()?;
    let client = Client::with_uri_str(&url).await.expect("store reachable");
    let database = client.default_database().expect("url names a database");
    let mut config = Config::new(MongoSource::Client(client));
    prepare(&mut config);
    Some((MongoStore::new(config), database))
}

async fn reset(database: &Database, collection: &str) {
    database
        .collection::<Document>(collection)
        .drop()
        .await
        .ok();
    database
        .collection::<Document>(&format!("o_{collection}"))
        .drop()
        .await
        .ok();
}

fn create_op(version: u64, data: Document) -> Op {
    Op {
        source: "test".to_string(),
        seq: version + 1,
        version,
        action: OpAction::Create {
            doc_type: "json0".to_string(),
            data: Some(Bson::Document(data)),
        },
        meta: None,
    }
}

fn edit_op(version: u64, path: &str) -> Op {
    Op {
        source: "test".to_string(),
        seq: version + 1,
        version,
        action: OpAction::Edit(vec![doc! { "p": [path], "oi": 1 }]),
        meta: None,
    }
}

fn delete_op(version: u64) -> Op {
    Op {
        source: "test".to_string(),
        seq: version + 1,
        version,
        action: OpAction::Delete,
        meta: None,
    }
}

/// Drive a commit the way the document server does: fetch the current
/// snapshot for its op link, then write the post-op snapshot.
async fn submit(
    store: &MongoStore,
    collection: &str,
    id: &str,
    op: Op,
    doc_type: Option<&str>,
    data: Option<Bson>,
) -> bool {
    let fields = Fields {
        include: vec![],
        submit: true,
    };
    let current = store
        .get_snapshot(collection, id, Some(&fields))
        .await
        .expect("no errors");
    let snapshot = Snapshot {
        id: id.to_string(),
        version: op.version + 1,
        doc_type: doc_type.map(str::to_string),
        data,
        meta: None,
        op_link: current.op_link,
    };
    store
        .commit(collection, id, &op, &snapshot)
        .await
        .expect("no errors")
}

#[tokio::test]
async fn create_update_delete_recreate() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "lifecycle";
    reset(&database, collection).await;
    let id = "doc1";

    assert!(submit(&store, collection, id, create_op(0, doc! {}), Some("json0"), Some(Bson::Document(doc! {}))).await);
    assert!(submit(&store, collection, id, edit_op(1, "x"), Some("json0"), Some(Bson::Document(doc! { "x": 5 }))).await);
    assert!(submit(&store, collection, id, delete_op(2), None, None).await);

    let snapshot = store
        .get_snapshot(collection, id, None)
        .await
        .expect("no errors");
    assert_eq!(snapshot.version, 3);
    assert!(snapshot.is_deleted());
    assert_eq!(snapshot.data, None);

    let ops = store
        .get_ops(collection, id, Some(0), None)
        .await
        .expect("no errors");
    assert_eq!(ops.len(), 3);

    assert!(submit(&store, collection, id, create_op(3, doc! {}), Some("json0"), Some(Bson::Document(doc! {}))).await);

    let snapshot = store
        .get_snapshot(collection, id, None)
        .await
        .expect("no errors");
    assert_eq!(snapshot.version, 4);
    assert!(!snapshot.is_deleted());

    let ops = store
        .get_ops(collection, id, Some(0), None)
        .await
        .expect("no errors");
    assert_eq!(
        ops.iter().map(|op| op.version).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
}

#[tokio::test]
async fn concurrent_creates_race_cleanly() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "races";
    reset(&database, collection).await;
    let id = "doc1";

    let mut op_b = create_op(0, doc! {});
    op_b.source = "test-b".to_string();
    let snapshot_a = Snapshot {
        id: id.to_string(),
        version: 1,
        doc_type: Some("json0".to_string()),
        data: Some(Bson::Document(doc! {})),
        meta: None,
        op_link: None,
    };
    let snapshot_b = snapshot_a.clone();

    let op_a = create_op(0, doc! {});
    let (a, b) = tokio::join!(
        store.commit(collection, id, &op_a, &snapshot_a),
        store.commit(collection, id, &op_b, &snapshot_b),
    );
    let a = a.expect("no errors");
    let b = b.expect("no errors");
    assert!(a ^ b, "exactly one create must win, got {a} and {b}");

    let snapshot = store
        .get_snapshot(collection, id, None)
        .await
        .expect("no errors");
    assert_eq!(snapshot.version, 1);

    // Even if the loser's op row survived, only the linked one is returned.
    let ops = store
        .get_ops(collection, id, Some(0), None)
        .await
        .expect("no errors");
    assert_eq!(ops.len(), 1);
}

#[tokio::test]
async fn lost_ops_are_detected() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "holes";
    reset(&database, collection).await;
    let id = "doc1";

    assert!(submit(&store, collection, id, create_op(0, doc! {}), Some("json0"), Some(Bson::Document(doc! {}))).await);
    assert!(submit(&store, collection, id, edit_op(1, "x"), Some("json0"), Some(Bson::Document(doc! { "x": 1 }))).await);

    database
        .collection::<Document>("o_holes")
        .delete_one(doc! { "d": id, "v": 0 })
        .await
        .expect("no errors");

    let err = store
        .get_ops(collection, id, Some(0), None)
        .await
        .expect_err("gap must surface");
    assert_eq!(err.code(), Some(5103));
}

#[tokio::test]
async fn deleted_documents_stay_out_of_queries() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "ghosts";
    reset(&database, collection).await;
    let id = "doc1";

    assert!(submit(&store, collection, id, create_op(0, doc! { "x": 5, "y": 6 }), Some("json0"), Some(Bson::Document(doc! { "x": 5, "y": 6 }))).await);
    assert!(submit(&store, collection, id, delete_op(1), None, None).await);

    let result = store
        .query(collection, doc! { "x": 5 }, None)
        .await
        .expect("no errors");
    assert!(result.snapshots.is_empty());

    let result = store
        .query(collection, doc! { "_type": Bson::Null }, None)
        .await
        .expect("no errors");
    assert_eq!(result.snapshots.len(), 1);
    assert!(result.snapshots[0].is_deleted());
    assert_eq!(result.snapshots[0].version, 2);
}

#[tokio::test]
async fn js_queries_are_gated() {
    let Some((store, database)) = connect().await else {
        return;
    };
    reset(&database, "gated").await;

    let err = store
        .query("gated", doc! { "$where": "true" }, None)
        .await
        .expect_err("rejected");
    assert_eq!(err.code(), Some(4103));
}

#[tokio::test]
async fn committed_ops_are_found_by_source_and_seq() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "resubmits";
    reset(&database, collection).await;
    let id = "doc1";

    let create = create_op(0, doc! {});
    assert!(submit(&store, collection, id, create.clone(), Some("json0"), Some(Bson::Document(doc! {}))).await);
    assert!(submit(&store, collection, id, edit_op(1, "x"), Some("json0"), Some(Bson::Document(doc! { "x": 1 }))).await);

    let fields = Fields {
        include: vec![],
        submit: true,
    };
    let snapshot = store
        .get_snapshot(collection, id, Some(&fields))
        .await
        .expect("no errors");

    let committed = store
        .get_committed_op_version(collection, id, &snapshot, &create)
        .await
        .expect("no errors");
    assert_eq!(committed, Some(0));

    let mut unknown = create.clone();
    unknown.seq = 99;
    let committed = store
        .get_committed_op_version(collection, id, &snapshot, &unknown)
        .await
        .expect("no errors");
    assert_eq!(committed, None);
}

#[tokio::test]
async fn op_log_indexes_are_ensured() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "indexed";
    reset(&database, collection).await;

    assert!(submit(&store, collection, "doc1", create_op(0, doc! {}), Some("json0"), Some(Bson::Document(doc! {}))).await);

    let names = database
        .collection::<Document>("o_indexed")
        .list_index_names()
        .await
        .expect("no errors");
    assert!(names.iter().any(|name| name == "d_1_v_1"), "got {names:?}");
    assert!(
        names.iter().any(|name| name == "src_1_seq_1_v_1"),
        "got {names:?}"
    );
}

#[tokio::test]
async fn bulk_reads_fill_missing_documents() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "bulk";
    reset(&database, collection).await;

    assert!(submit(&store, collection, "a", create_op(0, doc! { "n": 1 }), Some("json0"), Some(Bson::Document(doc! { "n": 1 }))).await);
    assert!(submit(&store, collection, "b", create_op(0, doc! { "n": 2 }), Some("json0"), Some(Bson::Document(doc! { "n": 2 }))).await);
    assert!(submit(&store, collection, "b", edit_op(1, "n"), Some("json0"), Some(Bson::Document(doc! { "n": 3 }))).await);

    let snapshots = store
        .get_snapshot_bulk(collection, &["a", "b", "ghost"], None)
        .await
        .expect("no errors");
    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots["a"].version, 1);
    assert_eq!(snapshots["b"].version, 2);
    assert_eq!(snapshots["ghost"].version, 0);
    assert!(snapshots["ghost"].is_deleted());

    let from: HashMap<String, u64> =
        [("a".to_string(), 0), ("b".to_string(), 0), ("ghost".to_string(), 0)]
            .into_iter()
            .collect();
    let ops = store
        .get_ops_bulk(collection, &from, None)
        .await
        .expect("no errors");
    assert_eq!(ops["a"].len(), 1);
    assert_eq!(ops["b"].len(), 2);
    assert!(ops["ghost"].is_empty());
}

#[tokio::test]
async fn poll_queries_return_ids_and_matches() {
    let Some((store, database)) = connect().await else {
        return;
    };
    let collection = "polls";
    reset(&database, collection).await;

    assert!(submit(&store, collection, "doc1", create_op(0, doc! { "x": 5 }), Some("json0"), Some(Bson::Document(doc! { "x": 5 }))).await);

    let (ids, extra) = store
        .query_poll(collection, doc! { "x": 5 })
        .await
        .expect("no errors");
    assert_eq!(ids, vec!["doc1".to_string()]);
    assert_eq!(extra, None);

    assert!(store
        .query_poll_doc(collection, "doc1", doc! { "x": 5 })
        .await
        .expect("no errors"));
    assert!(!store
        .query_poll_doc(collection, "doc1", doc! { "x": 9 })
        .await
        .expect("no errors"));
    assert!(!store
        .query_poll_doc(collection, "doc1", doc! { "x": 5, "_id": "other" })
        .await
        .expect("no errors"));
}

#[tokio::test]
async fn close_is_terminal_and_idempotent() {
    let Some((store, _database)) = connect().await else {
        return;
    };

    store.close().await.expect("no errors");
    store.close().await.expect("no errors");

    let err = store
        .get_snapshot("anything", "doc1", None)
        .await
        .expect_err("closed");
    assert_eq!(err.code(), Some(5101));
}

// The checks below run without a reachable store: they fail before any
// driver operation is issued.

#[tokio::test]
async fn reserved_collection_names_are_rejected_up_front() {
    let store = MongoStore::new(Config::new(MongoSource::Url(
        "mongodb://localhost:27017/unused".to_string(),
    )));
    for name in ["system", "o_notes"] {
        let err = store
            .get_snapshot(name, "doc1", None)
            .await
            .expect_err("rejected");
        assert_eq!(err.code(), Some(4102));
    }
}

#[tokio::test]
async fn poll_checks_depend_only_on_query_shape() {
    let store = MongoStore::new(Config::new(MongoSource::Url(
        "mongodb://localhost:27017/unused".to_string(),
    )));
    assert!(store.can_poll_doc("notes", &doc! { "x": 1 }));
    assert!(!store.can_poll_doc("notes", &doc! { "$sort": { "x": 1 } }));
    // Operators the query gates would reject still leave a query per-doc
    // evaluable.
    assert!(store.can_poll_doc("notes", &doc! { "$where": "true" }));

    assert!(store.skip_poll("notes", "doc1", &edit_op(1, "b"), &doc! { "a": 1 }));
    assert!(!store.skip_poll("notes", "doc1", &edit_op(1, "a"), &doc! { "a": 1 }));
    assert!(!store.skip_poll("notes", "doc1", &edit_op(1, "b"), &doc! { "$count": true }));
}
