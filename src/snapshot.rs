// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot data model and the codec between external snapshots and stored
//! documents.
//!
//! A stored document keeps the user's data at the top level (when it is a
//! BSON document) and folds the adapter's bookkeeping into reserved
//! underscore fields. Non-document data is kept under `_data` instead so it
//! survives the flattening.
use mongodb::bson::{doc, Bson, Document};

/// Field names the adapter claims on stored documents.
pub const RESERVED_FIELDS: &[&str] = &["_id", "_v", "_type", "_m", "_o", "_data"];

/// The materialized state of a document at a given version.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Logical document id; the store's primary key.
    pub id: String,

    /// Version, advanced by exactly 1 per committed op. A snapshot that was
    /// never created has version 0.
    pub version: u64,

    /// OT type identifier. `None` means the document is logically deleted:
    /// the row persists so recreations resume version numbering.
    pub doc_type: Option<String>,

    /// Document content. Any BSON value; `None` for deleted or missing
    /// documents.
    pub data: Option<Bson>,

    /// User metadata, never returned to readers unless explicitly requested.
    pub meta: Option<Document>,

    /// Opaque reference to the op whose application produced this snapshot.
    pub op_link: Option<Bson>,
}

impl Snapshot {
    /// The snapshot handed out for a document that was never created.
    pub(crate) fn missing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            doc_type: None,
            data: None,
            meta: None,
            op_link: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.doc_type.is_none()
    }
}

impl From<Document> for Snapshot {
    fn from(mut doc: Document) -> Self {
        let id = doc.get_str("_id").unwrap_or_default().to_string();
        let version = doc.get("_v").and_then(as_version).unwrap_or(0);
        let doc_type = match doc.get("_type") {
            Some(Bson::String(kind)) => Some(kind.clone()),
            _ => None,
        };
        let meta = match doc.remove("_m") {
            Some(Bson::Document(meta)) => Some(meta),
            _ => None,
        };
        let op_link = doc.remove("_o").filter(|link| link != &Bson::Null);

        let data = if doc_type.is_none() {
            None
        } else if let Some(data) = doc.remove("_data") {
            Some(data)
        } else {
            for field in RESERVED_FIELDS {
                doc.remove(field);
            }
            Some(Bson::Document(doc))
        };

        Self {
            id,
            version,
            doc_type,
            data,
            meta,
            op_link,
        }
    }
}

/// Build the stored form of a snapshot, linked to the op that produced it.
pub(crate) fn snapshot_to_document(id: &str, snapshot: &Snapshot, op_link: Bson) -> Document {
    let mut doc = match &snapshot.data {
        Some(Bson::Document(data)) => data.clone(),
        Some(other) => doc! { "_data": other.clone() },
        None => Document::new(),
    };
    doc.insert("_id", id);
    doc.insert("_v", snapshot.version as i64);
    match &snapshot.doc_type {
        Some(kind) => doc.insert("_type", kind.as_str()),
        None => doc.insert("_type", Bson::Null),
    };
    if let Some(meta) = &snapshot.meta {
        doc.insert("_m", meta.clone());
    }
    doc.insert("_o", op_link);
    doc
}

/// Requested snapshot fields for reads and queries.
#[derive(Clone, Debug, Default)]
pub struct Fields {
    /// Top-level data fields to return. Empty means only the bookkeeping
    /// fields.
    pub include: Vec<String>,

    /// Set on fetches from the commit path, which needs the whole document
    /// including metadata and the op link.
    pub submit: bool,
}

/// Translate a field request into a store projection.
///
/// Without a request the metadata and op link are excluded; an explicit
/// request is inclusive and always carries `_type` and `_v` so results can be
/// decoded into snapshots.
pub(crate) fn projection_for(fields: Option<&Fields>) -> Option<Document> {
    let Some(fields) = fields else {
        return Some(doc! { "_m": 0, "_o": 0 });
    };
    if fields.submit {
        return None;
    }
    let mut projection = Document::new();
    for field in &fields.include {
        projection.insert(field.as_str(), 1);
    }
    projection.insert("_type", 1);
    projection.insert("_v", 1);
    Some(projection)
}

/// Read a stored version number, tolerating the integer widths the store may
/// hand back.
pub(crate) fn as_version(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(version) => u64::try_from(*version).ok(),
        Bson::Int64(version) => u64::try_from(*version).ok(),
        Bson::Double(version) if version.fract() == 0.0 && *version >= 0.0 => {
            Some(*version as u64)
        }
        _ => None,
    }
}
