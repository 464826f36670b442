//! Sync data models: records, collections, wire payloads.

use crate::{Result, TabkeeperError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A synchronized collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Tasks,
    ActivityLogs,
    Settings,
    FocusModeSettings,
    MeetingModeSettings,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Tasks,
        Collection::ActivityLogs,
        Collection::Settings,
        Collection::FocusModeSettings,
        Collection::MeetingModeSettings,
    ];

    /// Wire name of the collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::ActivityLogs => "activityLogs",
            Self::Settings => "settings",
            Self::FocusModeSettings => "focusModeSettings",
            Self::MeetingModeSettings => "meetingModeSettings",
        }
    }

    /// Parse a collection from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Settings-like collections hold one record whose id is the
    /// collection name.
    pub fn is_singleton(&self) -> bool {
        matches!(
            self,
            Self::Settings | Self::FocusModeSettings | Self::MeetingModeSettings
        )
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned record: task, activity-log entry, settings object or
/// session snippet.
///
/// On the wire the payload fields sit next to `id`, `lastModified`,
/// `version` and `deleted` in one flat object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    /// Unix milliseconds. `None` when absent or unparseable; orders below
    /// every real timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub deleted: bool,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            last_modified: None,
            version: None,
            deleted: false,
            payload,
        }
    }

    /// Composite identity for activity-log entries.
    pub fn log_key(timestamp: i64, domain: &str) -> String {
        format!("{}:{}", timestamp, domain)
    }

    /// Validate and parse a wire record belonging to `collection`.
    ///
    /// Only a missing identity is fatal; malformed timestamps and versions
    /// degrade to `None`.
    pub fn from_value(value: Value, collection: Collection) -> Result<Self> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(TabkeeperError::Validation(format!(
                    "{} record is not an object: {}",
                    collection,
                    type_name(&other)
                )))
            }
        };

        // Singletons have exactly one identity whatever id they carry.
        let id = match fields.remove("id") {
            _ if collection.is_singleton() => collection.as_str().to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => derive_id(&fields, collection).ok_or_else(|| {
                TabkeeperError::Validation(format!("{} record has no usable id", collection))
            })?,
        };

        let last_modified = fields.remove("lastModified").and_then(|v| lenient_i64(&v));
        let version = fields
            .remove("version")
            .and_then(|v| lenient_i64(&v))
            .and_then(|v| u64::try_from(v).ok());
        let deleted = matches!(fields.remove("deleted"), Some(Value::Bool(true)));

        Ok(Self {
            id,
            last_modified,
            version,
            deleted,
            payload: fields,
        })
    }

    /// Parse a list of wire records, separating out the invalid ones.
    pub fn parse_all(values: Vec<Value>, collection: Collection) -> (Vec<Self>, Vec<TabkeeperError>) {
        let mut records = Vec::with_capacity(values.len());
        let mut rejected = Vec::new();
        for value in values {
            match Self::from_value(value, collection) {
                Ok(record) => records.push(record),
                Err(e) => rejected.push(e),
            }
        }
        (records, rejected)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Canonical payload encoding used as the final merge tie-break.
    /// `serde_json::Map` keeps keys sorted, so equal payloads encode equally.
    pub fn canonical_payload(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_default()
    }
}

fn derive_id(fields: &Map<String, Value>, collection: Collection) -> Option<String> {
    if collection == Collection::ActivityLogs {
        let timestamp = fields.get("timestamp").and_then(lenient_i64)?;
        let domain = fields.get("domain").and_then(Value::as_str)?;
        return Some(Record::log_key(timestamp, domain));
    }
    None
}

fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Per-collection sync bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_sync_time: Option<i64>,
}

/// Full-replace snapshot exchanged with the sync endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default)]
    pub activity_logs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_mode_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_mode_settings: Option<Value>,
}

impl SyncPayload {
    /// Split the snapshot into validated per-collection records.
    pub fn into_collections(self) -> (BTreeMap<Collection, Vec<Record>>, Vec<TabkeeperError>) {
        let mut collections = BTreeMap::new();
        let mut rejected = Vec::new();

        let raw = [
            (Collection::Tasks, self.tasks),
            (Collection::ActivityLogs, self.activity_logs),
            (Collection::Settings, self.settings.into_iter().collect()),
            (
                Collection::FocusModeSettings,
                self.focus_mode_settings.into_iter().collect(),
            ),
            (
                Collection::MeetingModeSettings,
                self.meeting_mode_settings.into_iter().collect(),
            ),
        ];

        for (collection, values) in raw {
            let (records, errors) = Record::parse_all(values, collection);
            collections.insert(collection, records);
            rejected.extend(errors);
        }
        (collections, rejected)
    }

    /// Assemble a snapshot from per-collection records.
    pub fn from_collections(collections: &BTreeMap<Collection, Vec<Record>>) -> Self {
        let list = |c: Collection| -> Vec<Value> {
            collections
                .get(&c)
                .map(|records| records.iter().map(Record::to_value).collect())
                .unwrap_or_default()
        };
        let single = |c: Collection| -> Option<Value> {
            collections
                .get(&c)
                .and_then(|records| records.iter().find(|r| r.id == c.as_str()))
                .map(|record| {
                    let mut value = record.to_value();
                    if let Value::Object(fields) = &mut value {
                        fields.remove("id");
                    }
                    value
                })
        };

        Self {
            tasks: list(Collection::Tasks),
            activity_logs: list(Collection::ActivityLogs),
            settings: single(Collection::Settings),
            focus_mode_settings: single(Collection::FocusModeSettings),
            meeting_mode_settings: single(Collection::MeetingModeSettings),
        }
    }
}
