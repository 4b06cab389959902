//! Document kinds, typed documents and the query language understood by
//! every [`DocumentStore`](crate::store::DocumentStore).
//!
//! Queries address fields by their stored (camelCase) names. Filters support
//! equality and range comparisons combined with AND, which is what the
//! document store indexes; anything richer is done by the caller in memory.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::model::{BucketInfo, Checkpoint, FileInfo, LogEvent};

/// A document kind (table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// Append-only file log written by the storage hub.
    FileLog,
    /// Per-path summaries.
    FileInfo,
    /// Per-address rollups.
    BucketInfo,
    /// Aggregation checkpoints.
    FileWorkLog,
}

impl Kind {
    /// All kinds, in a stable order.
    pub const ALL: [Self; 4] = [Self::FileLog, Self::FileInfo, Self::BucketInfo, Self::FileWorkLog];

    /// Returns the kind name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileLog => "FileLog",
            Self::FileInfo => "FileInfo",
            Self::BucketInfo => "BucketInfo",
            Self::FileWorkLog => "FileWorkLog",
        }
    }

    /// Returns the stored field that holds the document key.
    #[must_use]
    pub const fn key_field(self) -> &'static str {
        match self {
            Self::FileLog => "key",
            Self::FileInfo => "path",
            Self::BucketInfo => "address",
            Self::FileWorkLog => "id",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed document of one of the known kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    /// A file log entry.
    FileLog(LogEvent),
    /// A per-path summary.
    FileInfo(FileInfo),
    /// A per-address rollup.
    BucketInfo(BucketInfo),
    /// An aggregation checkpoint.
    Checkpoint(Checkpoint),
}

impl Document {
    /// Returns the document kind.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::FileLog(_) => Kind::FileLog,
            Self::FileInfo(_) => Kind::FileInfo,
            Self::BucketInfo(_) => Kind::BucketInfo,
            Self::Checkpoint(_) => Kind::FileWorkLog,
        }
    }

    /// Returns the document key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::FileLog(event) => &event.key,
            Self::FileInfo(info) => &info.path,
            Self::BucketInfo(info) => info.address.as_str(),
            Self::Checkpoint(checkpoint) => &checkpoint.id,
        }
    }

    /// Serializes the document body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<JsonValue> {
        let value = match self {
            Self::FileLog(event) => serde_json::to_value(event)?,
            Self::FileInfo(info) => serde_json::to_value(info)?,
            Self::BucketInfo(info) => serde_json::to_value(info)?,
            Self::Checkpoint(checkpoint) => serde_json::to_value(checkpoint)?,
        };
        Ok(value)
    }

    /// Deserializes a document body of the given kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match the kind's schema.
    pub fn from_json(kind: Kind, value: JsonValue) -> Result<Self> {
        let document = match kind {
            Kind::FileLog => Self::FileLog(serde_json::from_value(value)?),
            Kind::FileInfo => Self::FileInfo(serde_json::from_value(value)?),
            Kind::BucketInfo => Self::BucketInfo(serde_json::from_value(value)?),
            Kind::FileWorkLog => Self::Checkpoint(serde_json::from_value(value)?),
        };
        Ok(document)
    }
}

impl From<LogEvent> for Document {
    fn from(value: LogEvent) -> Self {
        Self::FileLog(value)
    }
}

impl From<FileInfo> for Document {
    fn from(value: FileInfo) -> Self {
        Self::FileInfo(value)
    }
}

impl From<BucketInfo> for Document {
    fn from(value: BucketInfo) -> Self {
        Self::BucketInfo(value)
    }
}

impl From<Checkpoint> for Document {
    fn from(value: Checkpoint) -> Self {
        Self::Checkpoint(value)
    }
}

/// A key identifying one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    /// The document kind.
    pub kind: Kind,
    /// The key within the kind.
    pub key: String,
}

impl DocumentKey {
    /// Creates a document key.
    #[must_use]
    pub fn new(kind: Kind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

/// A scalar compared against a stored field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A string field.
    Str(String),
    /// An integer field.
    Int(i64),
    /// A timestamp field (stored as epoch milliseconds).
    Time(DateTime<Utc>),
}

impl Value {
    /// Returns the stored JSON representation.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Str(s) => JsonValue::from(s.as_str()),
            Self::Int(i) => JsonValue::from(*i),
            Self::Time(t) => JsonValue::from(t.timestamp_millis()),
        }
    }

    /// Compares a stored field against this value.
    ///
    /// Returns `None` when the types are not comparable.
    #[must_use]
    pub fn compare_stored(&self, stored: &JsonValue) -> Option<Ordering> {
        match (stored, self) {
            (JsonValue::String(s), Self::Str(v)) => Some(s.as_str().cmp(v.as_str())),
            (JsonValue::Number(n), Self::Int(v)) => n.as_i64().map(|n| n.cmp(v)),
            (JsonValue::Number(n), Self::Time(v)) => {
                n.as_i64().map(|n| n.cmp(&v.timestamp_millis()))
            }
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Time(value)
    }
}

/// Comparison operator of a field filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `field == value`
    Eq,
    /// `field < value`
    Lt,
    /// `field <= value`
    Lte,
    /// `field > value`
    Gt,
    /// `field >= value`
    Gte,
}

impl Op {
    /// Returns the SQL operator.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Lte => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Gte => ordering != Ordering::Less,
        }
    }
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    /// Stored field name.
    pub field: String,
    /// Comparison operator.
    pub op: Op,
    /// Value to compare with.
    pub value: Value,
}

/// A conjunction of field comparisons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<FieldFilter>,
}

impl Filter {
    fn clause(field: &str, op: Op, value: impl Into<Value>) -> Self {
        Self {
            clauses: vec![FieldFilter {
                field: field.to_string(),
                op,
                value: value.into(),
            }],
        }
    }

    /// `field == value`
    #[must_use]
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::clause(field, Op::Eq, value)
    }

    /// `field < value`
    #[must_use]
    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::clause(field, Op::Lt, value)
    }

    /// `field <= value`
    #[must_use]
    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Self::clause(field, Op::Lte, value)
    }

    /// `field > value`
    #[must_use]
    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self::clause(field, Op::Gt, value)
    }

    /// `field >= value`
    #[must_use]
    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self::clause(field, Op::Gte, value)
    }

    /// Combines two filters with AND.
    #[must_use]
    pub fn and(mut self, other: Self) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    /// Returns the individual comparisons.
    #[must_use]
    pub fn clauses(&self) -> &[FieldFilter] {
        &self.clauses
    }

    /// Evaluates the filter against a stored document body.
    ///
    /// Missing fields and incomparable types never match.
    #[must_use]
    pub fn matches(&self, body: &JsonValue) -> bool {
        self.clauses.iter().all(|clause| {
            body.get(&clause.field)
                .and_then(|stored| clause.value.compare_stored(stored))
                .is_some_and(|ordering| clause.op.accepts(ordering))
        })
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// A sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Stored field name.
    pub field: String,
    /// Sort direction.
    pub direction: Direction,
}

impl Order {
    /// Ascending order on `field`.
    #[must_use]
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Asc,
        }
    }

    /// Descending order on `field`.
    #[must_use]
    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: Direction::Desc,
        }
    }
}

/// A query against one kind.
///
/// # Example
///
/// ```rust
/// use tally_core::document::{Filter, Kind, Order, Query};
/// use chrono::Utc;
///
/// let query = Query::new(Kind::FileLog)
///     .filter(Filter::gte("createDate", Utc::now()))
///     .order(Order::asc("createDate"))
///     .limit(3200);
/// assert_eq!(query.limit, Some(3200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Kind to query.
    pub kind: Kind,
    /// Optional filter.
    pub filter: Option<Filter>,
    /// Sort keys, most significant first.
    pub order: Vec<Order>,
    /// Maximum number of documents returned.
    pub limit: Option<usize>,
    /// Number of leading matches to skip (paging).
    pub offset: usize,
}

impl Query {
    /// Creates an unfiltered, unordered query.
    #[must_use]
    pub const fn new(kind: Kind) -> Self {
        Self {
            kind,
            filter: None,
            order: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    /// Adds a filter, AND-ed with any existing one.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    /// Appends a sort key.
    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    /// Caps the number of returned documents.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` matches.
    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Checks that all referenced field names are plain identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a field name that is not alphanumeric.
    pub fn validate(&self) -> Result<()> {
        let fields = self
            .filter
            .iter()
            .flat_map(|f| f.clauses().iter().map(|c| c.field.as_str()))
            .chain(self.order.iter().map(|o| o.field.as_str()));

        for field in fields {
            if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Error::InvalidInput(format!(
                    "invalid field name '{field}' in {} query",
                    self.kind
                )));
            }
        }
        Ok(())
    }

    /// Compares two stored bodies according to the query order.
    ///
    /// Falls back to the document key so results are deterministic.
    #[must_use]
    pub fn compare(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        for order in &self.order {
            let ordering = compare_json(a.get(&order.field), b.get(&order.field));
            let ordering = match order.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        let key = self.kind.key_field();
        compare_json(a.get(key), b.get(key))
    }
}

/// Orders stored values: missing < numbers < strings; like types compare naturally.
fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    fn rank(value: Option<&JsonValue>) -> u8 {
        match value {
            None | Some(JsonValue::Null) => 0,
            Some(JsonValue::Number(_)) => 1,
            Some(JsonValue::String(_)) => 2,
            Some(_) => 3,
        }
    }

    match (a, b) {
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
