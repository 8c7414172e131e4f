// SPDX-License-Identifier: MIT OR Apache-2.0

//! Polling optimizer: decides whether an op could change a query's result
//! set, so subscriptions can skip re-running queries for unrelated edits.
use std::collections::HashSet;

use mongodb::bson::{Bson, Document};

use crate::op::{Op, OpAction};
use crate::query::{COLLECTION_OPERATIONS, CURSOR_OPERATIONS};

/// Operators that make a query depend on more than one document at a time.
const RESULT_SHAPE_OPERATORS: &[&str] = &[
    "$sort",
    "$orderby",
    "$limit",
    "$skip",
    "$max",
    "$min",
    "$returnKey",
];

/// Whether a query can be re-evaluated against a single document. Ordering
/// and paging operators, collection operations and cursor operations all make
/// the result depend on the rest of the collection.
pub fn can_poll_doc(query: &Document) -> bool {
    !query.keys().any(|key| {
        let key = key.as_str();
        COLLECTION_OPERATIONS.contains(&key)
            || CURSOR_OPERATIONS.contains(&key)
            || RESULT_SHAPE_OPERATORS.contains(&key)
    })
}

/// Whether re-polling `query` after `op` can be skipped because the op cannot
/// have changed the result set. Conservative: any doubt means poll.
pub fn skip_poll(op: &Op, query: &Document) -> bool {
    let components = match &op.action {
        // Creates and deletes always change membership.
        OpAction::Create { .. } | OpAction::Delete => return false,
        OpAction::Edit(components) => components,
    };
    let has_operation = query.keys().any(|key| {
        let key = key.as_str();
        COLLECTION_OPERATIONS.contains(&key) || CURSOR_OPERATIONS.contains(&key)
    });
    if has_operation {
        return false;
    }
    if components.is_empty() {
        return true;
    }

    let mut fields = HashSet::new();
    collect_filter_fields(&mut fields, query);
    for sort_key in ["$sort", "$orderby"] {
        if let Ok(sort) = query.get_document(sort_key) {
            for key in sort.keys() {
                insert_field_root(&mut fields, key);
            }
        }
    }

    components.iter().all(|component| {
        let Ok(path) = component.get_array("p") else {
            return false;
        };
        // An empty path addresses the whole document.
        let Some(head) = path.first() else {
            return false;
        };
        !fields.contains(&path_root(head))
    })
}

/// Top-level field names a filter references, descending through `$and` and
/// `$or` branches.
fn collect_filter_fields(fields: &mut HashSet<String>, query: &Document) {
    for (key, value) in query {
        if key == "$and" || key == "$or" {
            if let Bson::Array(children) = value {
                for child in children {
                    if let Bson::Document(child) = child {
                        collect_filter_fields(fields, child);
                    }
                }
            }
        } else if !key.starts_with('$') {
            insert_field_root(fields, key);
        }
    }
}

fn insert_field_root(fields: &mut HashSet<String>, key: &str) {
    let root = key.split('.').next().unwrap_or(key);
    fields.insert(root.to_string());
}

fn path_root(head: &Bson) -> String {
    match head {
        Bson::String(field) => field.clone(),
        Bson::Int32(index) => index.to_string(),
        Bson::Int64(index) => index.to_string(),
        Bson::Double(index) => (*index as i64).to_string(),
        other => other.to_string(),
    }
}
