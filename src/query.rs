// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query validation, parsing and the deleted-document safety rewrite.
//!
//! Queries are native store query documents extended with `$`-prefixed
//! adapter operators in three disjoint categories: collection operations
//! (exactly one, exclusive of everything else), cursor transforms (freely
//! composable) and cursor operations (exactly one, terminal). Anything else
//! is part of the filter and passes through to the store untouched.
use mongodb::bson::{doc, Bson, Document};

use crate::error::StoreError;

/// Operations that run against the collection instead of a cursor.
pub const COLLECTION_OPERATIONS: &[&str] = &["$distinct", "$aggregate", "$mapReduce"];

/// Operators that reconfigure the cursor before it runs.
pub const CURSOR_TRANSFORMS: &[&str] = &[
    "$batchSize",
    "$comment",
    "$hint",
    "$limit",
    "$max",
    "$maxScan",
    "$maxTimeMS",
    "$min",
    "$noCursorTimeout",
    "$orderby",
    "$readConcern",
    "$readPref",
    "$returnKey",
    "$showDiskLoc",
    "$showRecordId",
    "$skip",
    "$snapshot",
    "$sort",
];

/// Terminal operations consuming the cursor.
pub const CURSOR_OPERATIONS: &[&str] = &["$count", "$explain", "$map"];

/// A query split into its four buckets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedQuery {
    /// The plain store filter, handed through unchanged apart from the
    /// safety rewrite.
    pub filter: Document,
    pub collection_op: Option<CollectionOp>,
    /// Transforms in their original order.
    pub cursor_transforms: Vec<(String, Bson)>,
    pub cursor_op: Option<CursorOp>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CollectionOp {
    Distinct {
        field: String,
    },
    Aggregate(Vec<Document>),
    MapReduce {
        map: String,
        reduce: String,
        scope: Option<Document>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CursorOp {
    Count,
    Explain,
    Map,
}

/// Validate operator usage before parsing.
pub fn check_query(
    query: &Document,
    allow_js_queries: bool,
    allow_aggregate_queries: bool,
) -> Result<(), StoreError> {
    if query.contains_key("$query") {
        return Err(StoreError::LegacyQueryProperty);
    }

    let mut collection_op: Option<&str> = None;
    let mut cursor_op: Option<&str> = None;
    let mut cursor_method: Option<&str> = None;
    for key in query.keys() {
        let key = key.as_str();
        if COLLECTION_OPERATIONS.contains(&key) {
            if let Some(first) = collection_op {
                return Err(StoreError::MultipleCollectionOperations(
                    first.to_string(),
                    key.to_string(),
                ));
            }
            collection_op = Some(key);
        } else if CURSOR_OPERATIONS.contains(&key) {
            if let Some(first) = cursor_op {
                return Err(StoreError::MultipleCursorOperations(
                    first.to_string(),
                    key.to_string(),
                ));
            }
            cursor_op = Some(key);
            cursor_method = Some(key);
        } else if CURSOR_TRANSFORMS.contains(&key) {
            cursor_method = Some(key);
        }
    }
    if let (Some(op), Some(_)) = (collection_op, cursor_method) {
        return Err(StoreError::CursorWithCollectionOperation(op.to_string()));
    }

    if !allow_js_queries {
        if query.contains_key("$where") {
            return Err(StoreError::WhereDisabled);
        }
        if query.contains_key("$mapReduce") {
            return Err(StoreError::MapReduceDisabled);
        }
    }
    if !allow_aggregate_queries && query.contains_key("$aggregate") {
        return Err(StoreError::AggregateDisabled);
    }

    Ok(())
}

/// Partition a checked query into its buckets, normalizing the deprecated
/// `$orderby` and `$showDiskLoc` aliases.
pub fn parse_query(query: Document) -> Result<ParsedQuery, StoreError> {
    let mut parsed = ParsedQuery::default();
    for (key, value) in query {
        match key.as_str() {
            "$distinct" => {
                let field = value
                    .as_document()
                    .and_then(|spec| spec.get_str("field").ok())
                    .ok_or_else(|| StoreError::MalformedQueryOperator("$distinct".to_string()))?;
                parsed.collection_op = Some(CollectionOp::Distinct {
                    field: field.to_string(),
                });
            }
            "$aggregate" => {
                let malformed = || StoreError::MalformedQueryOperator("$aggregate".to_string());
                let pipeline = match value {
                    Bson::Array(stages) => stages
                        .into_iter()
                        .map(|stage| match stage {
                            Bson::Document(stage) => Ok(stage),
                            _ => Err(malformed()),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(malformed()),
                };
                parsed.collection_op = Some(CollectionOp::Aggregate(pipeline));
            }
            "$mapReduce" => {
                let malformed = || StoreError::MalformedQueryOperator("$mapReduce".to_string());
                let spec = value.as_document().ok_or_else(malformed)?;
                let map = js_code(spec.get("map")).ok_or_else(malformed)?;
                let reduce = js_code(spec.get("reduce")).ok_or_else(malformed)?;
                let scope = spec.get_document("scope").ok().cloned();
                parsed.collection_op = Some(CollectionOp::MapReduce { map, reduce, scope });
            }
            "$count" => parsed.cursor_op = Some(CursorOp::Count),
            "$explain" => parsed.cursor_op = Some(CursorOp::Explain),
            "$map" => parsed.cursor_op = Some(CursorOp::Map),
            "$orderby" => parsed.cursor_transforms.push(("$sort".to_string(), value)),
            "$showDiskLoc" => parsed
                .cursor_transforms
                .push(("$showRecordId".to_string(), value)),
            transform if CURSOR_TRANSFORMS.contains(&transform) => {
                parsed.cursor_transforms.push((transform.to_string(), value));
            }
            _ => {
                parsed.filter.insert(key.as_str(), value);
            }
        }
    }
    Ok(parsed)
}

fn js_code(value: Option<&Bson>) -> Option<String> {
    match value {
        Some(Bson::String(code)) => Some(code.clone()),
        Some(Bson::JavaScriptCode(code)) => Some(code.clone()),
        _ => None,
    }
}

/// Guarantee that logically-deleted documents cannot leak into results: when
/// the filter could match a deleted row, conjoin `{_type: {$ne: null}}`. A
/// filter naming `_type` itself is trusted as-is.
pub fn make_query_safe(filter: &mut Document) {
    if could_match_deleted(filter) {
        filter.insert("_type", doc! { "$ne": Bson::Null });
    }
}

fn could_match_deleted(filter: &Document) -> bool {
    if filter.contains_key("_type") {
        return false;
    }
    for (key, value) in filter {
        match key.as_str() {
            "$and" => {
                if let Bson::Array(children) = value {
                    let all = children.iter().all(|child| {
                        child.as_document().is_none_or(could_match_deleted)
                    });
                    if !all {
                        return false;
                    }
                }
            }
            "$or" => {
                if let Bson::Array(children) = value {
                    let any = children.iter().any(|child| {
                        child.as_document().is_none_or(could_match_deleted)
                    });
                    if !any {
                        return false;
                    }
                }
            }
            key if key.starts_with('$') => {
                // Other store operators are treated conservatively.
            }
            _ => {
                if !could_match_null(value) {
                    return false;
                }
            }
        }
    }
    true
}

/// Whether a single filter clause could match a document in which the field
/// is absent. Deleted documents carry no data fields, so a filter can only
/// reach them through clauses that match nothing.
fn could_match_null(clause: &Bson) -> bool {
    match clause {
        Bson::Null => true,
        Bson::Double(_)
        | Bson::String(_)
        | Bson::Boolean(_)
        | Bson::Int32(_)
        | Bson::Int64(_)
        | Bson::Decimal128(_) => false,
        Bson::Document(operators) => {
            // Multiple operators in one clause have an implied "and": a
            // single operator ruling null out rules the clause out.
            for (operator, value) in operators {
                match operator.as_str() {
                    "$in" => {
                        if let Bson::Array(candidates) = value {
                            if !candidates.iter().any(|candidate| candidate == &Bson::Null) {
                                return false;
                            }
                        }
                    }
                    "$ne" => {
                        if value == &Bson::Null {
                            return false;
                        }
                    }
                    "$exists" => {
                        if value.as_bool() == Some(true) {
                            return false;
                        }
                    }
                    "$gt" | "$gte" | "$lt" | "$lte" => {
                        if value != &Bson::Null {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            true
        }
        // Regexes, dates, arrays and other exotic clauses: assume they could.
        _ => true,
    }
}

/// Refine a filter down to a single document id for per-document polling.
/// Returns `None` when the filter provably excludes the id.
pub(crate) fn refine_filter_for_doc(filter: &Document, id: &str) -> Option<Document> {
    let mut refined = filter.clone();
    match filter.get("_id") {
        None => {
            refined.insert("_id", id);
        }
        Some(Bson::Document(condition)) => {
            if let Ok(candidates) = condition.get_array("$in") {
                let listed = candidates
                    .iter()
                    .any(|candidate| candidate == &Bson::String(id.to_string()));
                if !listed {
                    return None;
                }
            }
            // Keep the original constraint alongside the pinned id.
            let mut and = match refined.remove("$and") {
                Some(Bson::Array(clauses)) => clauses,
                _ => Vec::new(),
            };
            and.push(Bson::Document(doc! { "_id": condition.clone() }));
            refined.insert("$and", and);
            refined.insert("_id", id);
        }
        Some(existing) => {
            if existing != &Bson::String(id.to_string()) {
                return None;
            }
        }
    }
    Some(refined)
}
