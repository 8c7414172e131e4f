// SPDX-License-Identifier: MIT OR Apache-2.0

//! Op data model, the codec to and from stored op rows, and the link filter
//! that recovers the canonical op chain.
//!
//! Stored ops form a reverse linked list: each row's `o` field holds the
//! store id of its predecessor, and a snapshot's `_o` field is the only
//! trusted entry point into the chain. Retried commits can leave orphan rows
//! sharing a `(d, v)` pair with a canonical op; walking the links is what
//! tells them apart.
use mongodb::bson::{doc, Bson, Document};

use crate::error::StoreError;
use crate::snapshot::as_version;

/// A single mutation committed against a document.
#[derive(Clone, Debug, PartialEq)]
pub struct Op {
    /// Submitting client, half of the idempotency key.
    pub source: String,

    /// Client-side submission counter, the other half of the idempotency key.
    pub seq: u64,

    /// Version the op was written at; the snapshot it produces is
    /// `version + 1`.
    pub version: u64,

    /// The mutation itself.
    pub action: OpAction,

    /// Op metadata, stored but never returned to readers.
    pub meta: Option<Document>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OpAction {
    /// Bring a document into existence with the given OT type.
    Create {
        doc_type: String,
        data: Option<Bson>,
    },

    /// Logically delete the document.
    Delete,

    /// Apply OT components, each a `{p: [...], ...}` document passed through
    /// to the OT engine untouched.
    Edit(Vec<Document>),
}

impl Op {
    /// The stored form: the op fields plus the document id (`d`, duplicated
    /// for indexing) and the predecessor link (`o`). The store assigns `_id`
    /// on insert.
    pub(crate) fn to_document(&self, doc_id: &str, prev_link: Option<&Bson>) -> Document {
        let mut doc = doc! {
            "src": self.source.as_str(),
            "seq": self.seq as i64,
            "v": self.version as i64,
        };
        match &self.action {
            OpAction::Create { doc_type, data } => {
                let mut create = doc! { "type": doc_type.as_str() };
                if let Some(data) = data {
                    create.insert("data", data.clone());
                }
                doc.insert("create", create);
            }
            OpAction::Delete => {
                doc.insert("del", true);
            }
            OpAction::Edit(components) => {
                let components: Vec<Bson> = components
                    .iter()
                    .map(|component| Bson::Document(component.clone()))
                    .collect();
                doc.insert("op", components);
            }
        }
        if let Some(meta) = &self.meta {
            doc.insert("m", meta.clone());
        }
        doc.insert("d", doc_id);
        doc.insert("o", prev_link.cloned().unwrap_or(Bson::Null));
        doc
    }
}

/// A fetched op row, keeping the store identity and predecessor link around
/// for the link filter. Both are stripped before ops reach callers.
#[derive(Clone, Debug)]
pub(crate) struct OpRow {
    pub op_id: Bson,
    pub link: Option<Bson>,
    pub op: Op,
}

impl OpRow {
    pub(crate) fn from_document(mut doc: Document, doc_id: &str) -> Result<Self, StoreError> {
        let corrupt = || StoreError::CorruptOpRecord(doc_id.to_string());

        let op_id = doc.remove("_id").ok_or_else(corrupt)?;
        let link = doc.remove("o").filter(|link| link != &Bson::Null);
        let version = doc.get("v").and_then(as_version).ok_or_else(corrupt)?;
        let source = doc.get_str("src").unwrap_or_default().to_string();
        let seq = doc.get("seq").and_then(as_version).unwrap_or(0);
        let meta = match doc.remove("m") {
            Some(Bson::Document(meta)) => Some(meta),
            _ => None,
        };

        // Exactly one of create, del, op describes the mutation.
        let action = if let Ok(create) = doc.get_document("create") {
            OpAction::Create {
                doc_type: create.get_str("type").map_err(|_| corrupt())?.to_string(),
                data: create.get("data").cloned(),
            }
        } else if doc.get("del").is_some() {
            OpAction::Delete
        } else if let Some(components) = doc.get("op") {
            let components = components
                .as_array()
                .ok_or_else(corrupt)?
                .iter()
                .map(|component| component.as_document().cloned().ok_or_else(corrupt))
                .collect::<Result<Vec<_>, _>>()?;
            OpAction::Edit(components)
        } else {
            return Err(corrupt());
        };

        Ok(Self {
            op_id,
            link,
            op: Op {
                source,
                seq,
                version,
                action,
                meta,
            },
        })
    }
}

/// Walk rows newest to oldest, keeping exactly the ops on the chain rooted at
/// `from_link`. Rows must arrive sorted by version ascending; the result is
/// returned in ascending order with ops below `to` (when given).
pub(crate) fn link_ops(rows: Vec<OpRow>, from_link: Option<&Bson>, to: Option<u64>) -> Vec<Op> {
    let mut link = from_link.cloned();
    let mut ops = Vec::new();
    for row in rows.into_iter().rev() {
        let Some(current) = &link else {
            break;
        };
        if row.op_id != *current {
            continue;
        }
        link = row.link;
        if to.is_none_or(|to| row.op.version < to) {
            ops.push(row.op);
        }
    }
    ops.reverse();
    ops
}

/// A document whose snapshot row is gone was deleted; the latest delete op is
/// the root of its observable history.
pub(crate) fn latest_delete_link(rows: &[OpRow]) -> Option<Bson> {
    rows.iter()
        .rev()
        .find(|row| matches!(row.op.action, OpAction::Delete))
        .map(|row| row.op_id.clone())
}

/// Enforce that a recovered chain actually reaches back to the requested
/// version.
pub(crate) fn check_ops_from(ops: &[Op], id: &str, from: Option<u64>) -> Result<(), StoreError> {
    let Some(from) = from else {
        return Ok(());
    };
    match ops.first() {
        Some(first) if first.version != from => Err(StoreError::MissingOps {
            id: id.to_string(),
            from,
        }),
        _ => Ok(()),
    }
}
