//! Change-event documents delivered to consumers.
//!
//! A change event describes one write observed on a watched namespace. The
//! shapes here mirror the wire format: field names map through serde renames,
//! and unknown operation kinds from newer servers are preserved as
//! [`OperationType::Unknown`] rather than failing deserialization.
//!
//! # Examples
//!
//! ```rust
//! use bucatini_core::event::{ChangeEvent, OperationType};
//! use bson::doc;
//!
//! let document = doc! {
//!     "_id": { "_data": "82635019A0" },
//!     "operationType": "insert",
//!     "ns": { "db": "shop", "coll": "orders" },
//!     "documentKey": { "_id": 7 },
//!     "fullDocument": { "_id": 7, "total": 99 },
//! };
//!
//! let event: ChangeEvent = bson::from_document(document).unwrap();
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), Some("orders"));
//! ```

use bson::{Bson, Document, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque server-generated position marker.
///
/// Tokens are passed back as `resumeAfter`/`startAfter` to continue a stream
/// from a known point. Their contents are meaningful only to the server; the
/// driver stores and compares them as raw BSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(Bson);

impl ResumeToken {
    /// Wraps a raw BSON value as a resume token.
    pub fn new(value: Bson) -> Self {
        Self(value)
    }

    /// Wraps a token document, the shape servers use in practice.
    pub fn from_document(document: Document) -> Self {
        Self(Bson::Document(document))
    }

    /// The raw BSON value, for embedding in an outgoing command.
    pub fn bson(&self) -> &Bson {
        &self.0
    }

    /// Consumes the token, returning the raw BSON value.
    pub fn into_bson(self) -> Bson {
        self.0
    }
}

impl From<Bson> for ResumeToken {
    fn from(value: Bson) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of write a change event describes, decoded from the wire
/// `operationType` field.
///
/// Which [`ChangeEvent`] fields are populated depends on this kind. Values
/// this driver version does not recognize decode as `Unknown` instead of
/// failing the batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// Wire value `"insert"`. `full_document` carries the new document.
    Insert,

    /// Wire value `"update"`. `update_description` lists the touched
    /// fields; `full_document` is present only when the stream was opened
    /// with a post-image lookup.
    Update,

    /// Wire value `"delete"`. Only `document_key` identifies what was
    /// removed.
    Delete,

    /// Wire value `"replace"`. `full_document` carries the replacement.
    Replace,

    /// Wire value `"invalidate"`. The server ends the cursor after this
    /// event; it carries no namespace.
    Invalidate,

    /// Wire value `"drop"`: the watched collection was dropped.
    Drop,

    /// Wire value `"dropDatabase"`: the watched database was dropped.
    #[serde(rename = "dropDatabase")]
    DropDatabase,

    /// Wire value `"rename"`. `ns` is the source namespace and `to` the
    /// destination.
    Rename,

    /// An `operationType` string this driver version does not recognize,
    /// preserved verbatim so callers can log or match on it.
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Wire-format name of this operation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Unknown(raw) => raw,
        }
    }

    /// Returns true if this operation writes document data (insert, update,
    /// replace).
    #[inline]
    pub fn is_data_modification(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Replace)
    }

    /// Returns true if this is an unknown operation type.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

/// Namespace (database + collection) an operation occurred in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    #[serde(rename = "db")]
    pub database: String,

    /// Collection name. Empty for database-level events.
    #[serde(rename = "coll", default)]
    pub collection: String,
}

impl Namespace {
    /// Creates a new namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Returns the fully qualified namespace as "database.collection".
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// Parses a qualified "database.collection" string, as found in cursor
    /// descriptors.
    pub(crate) fn from_qualified(qualified: &str) -> Option<Self> {
        let (database, collection) = qualified.split_once('.')?;
        Some(Self::new(database, collection))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Describes what changed in a partial document update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were added or modified
    #[serde(rename = "updatedFields")]
    pub updated_fields: Document,

    /// Fields that were removed from the document
    #[serde(rename = "removedFields")]
    pub removed_fields: Vec<String>,

    /// Array modifications (if any)
    #[serde(rename = "truncatedArrays", skip_serializing_if = "Option::is_none")]
    pub truncated_arrays: Option<Vec<TruncatedArray>>,
}

/// Describes modifications to an array field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatedArray {
    /// Field path to the array
    pub field: String,

    /// New size of the array after truncation
    #[serde(rename = "newSize")]
    pub new_size: u32,
}

/// A single change observed on a watched namespace.
///
/// The `_id` resume token is required; the engine treats a document without
/// one as fatal because the stream could not resume past it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Resume token for this event.
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace the operation occurred in. Absent on invalidate events.
    #[serde(rename = "ns", skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,

    /// Destination namespace of a rename.
    #[serde(rename = "to", skip_serializing_if = "Option::is_none")]
    pub to: Option<Namespace>,

    /// Document key (_id and shard key if sharded)
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full document after the operation.
    ///
    /// Present for insert and replace always, for update only when the
    /// stream was opened with a full-document lookup.
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Description of what changed in an update operation
    #[serde(rename = "updateDescription", skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    /// Oplog timestamp of the operation.
    #[serde(rename = "clusterTime", skip_serializing_if = "Option::is_none")]
    pub cluster_time: Option<Timestamp>,
}

impl ChangeEvent {
    /// Returns true if this is an insert operation.
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// Returns true if this is an update operation.
    #[inline]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// Returns true if this is a delete operation.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Returns true if this is an invalidate operation.
    #[inline]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// The resume token for this event.
    #[inline]
    pub fn resume_token(&self) -> &ResumeToken {
        &self.id
    }

    /// The collection name, when the event carries a namespace.
    pub fn collection_name(&self) -> Option<&str> {
        self.namespace.as_ref().map(|ns| ns.collection.as_str())
    }

    /// The database name, when the event carries a namespace.
    pub fn database_name(&self) -> Option<&str> {
        self.namespace.as_ref().map(|ns| ns.database.as_str())
    }

    /// The document ID if present in the document key.
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.as_ref()?.get("_id")
    }
}
