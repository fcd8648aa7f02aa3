use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One upstream row. Field names and types vary per response, so rows stay
/// loosely typed and keep the order the vendor sent them in.
pub type Record = Map<String, Value>;

/// The two datasets the dashboards consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    CallsOnHold,
    LiveQueueStatus,
}

impl Dataset {
    pub const ALL: [Dataset; 2] = [Dataset::CallsOnHold, Dataset::LiveQueueStatus];

    /// Key used for this dataset in the fingerprint store.
    pub fn key(self) -> &'static str {
        match self {
            Dataset::CallsOnHold => "calls_on_hold",
            Dataset::LiveQueueStatus => "live_queue_status",
        }
    }

    /// Field name used on the wire, both by the vendor envelope and by the
    /// `dataUpdate` payload.
    pub fn wire_field(self) -> &'static str {
        match self {
            Dataset::CallsOnHold => "getCallsOnHoldData",
            Dataset::LiveQueueStatus => "getLiveQueueStatusData",
        }
    }

    /// Vendor endpoint forwarded through the dashboard proxy.
    pub fn endpoint(self) -> &'static str {
        match self {
            Dataset::CallsOnHold => "V2/queues/getCallsOnHold/",
            Dataset::LiveQueueStatus => "V2/queues/getLiveQueueStatus/",
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Point-in-time view of both datasets. Both sequences are always present;
/// a dataset that could not be read is represented as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "getCallsOnHoldData", default)]
    pub calls_on_hold: Vec<Record>,
    #[serde(rename = "getLiveQueueStatusData", default)]
    pub live_queue_status: Vec<Record>,
}

impl Snapshot {
    pub fn new(calls_on_hold: Vec<Record>, live_queue_status: Vec<Record>) -> Self {
        Self {
            calls_on_hold,
            live_queue_status,
        }
    }

    pub fn dataset(&self, dataset: Dataset) -> &[Record] {
        match dataset {
            Dataset::CallsOnHold => &self.calls_on_hold,
            Dataset::LiveQueueStatus => &self.live_queue_status,
        }
    }

    pub fn set_dataset(&mut self, dataset: Dataset, records: Vec<Record>) {
        match dataset {
            Dataset::CallsOnHold => self.calls_on_hold = records,
            Dataset::LiveQueueStatus => self.live_queue_status = records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls_on_hold.is_empty() && self.live_queue_status.is_empty()
    }
}

/// Reasons an upstream body could not be turned into a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("upstream reported an error: {0}")]
    UpstreamStatus(String),
    #[error("expected an array of records, found {0}")]
    NotAnArray(&'static str),
    #[error("record {index} is {found}, not an object")]
    NotARecord { index: usize, found: &'static str },
}

/// Accepts the shapes the vendor proxy is known to return for `dataset`:
/// a bare array of objects, or an envelope carrying the array under the
/// dataset's wire field or under `data`. `null` and an envelope without the
/// array both mean "no records".
pub fn normalize_dataset(dataset: Dataset, body: Value) -> Result<Vec<Record>, ShapeError> {
    check_shape(dataset, &body)?;
    Ok(into_records(dataset, body))
}

/// Validates `body` without consuming it, so callers can still log the
/// rejected value.
pub fn check_shape(dataset: Dataset, body: &Value) -> Result<(), ShapeError> {
    match body {
        Value::Null => Ok(()),
        Value::Array(items) => check_records(items),
        Value::Object(envelope) => {
            if let Some(Value::String(status)) = envelope.get("status") {
                if status.eq_ignore_ascii_case("error") {
                    let description = envelope
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("no description")
                        .to_string();
                    return Err(ShapeError::UpstreamStatus(description));
                }
            }
            match envelope
                .get(dataset.wire_field())
                .or_else(|| envelope.get("data"))
            {
                None | Some(Value::Null) => Ok(()),
                Some(Value::Array(items)) => check_records(items),
                Some(other) => Err(ShapeError::NotAnArray(kind_of(other))),
            }
        }
        other => Err(ShapeError::NotAnArray(kind_of(other))),
    }
}

/// Moves the records out of a body that passed [`check_shape`]. Anything
/// that is not a record is dropped.
pub fn into_records(dataset: Dataset, body: Value) -> Vec<Record> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut envelope) => match envelope
            .remove(dataset.wire_field())
            .or_else(|| envelope.remove("data"))
        {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) => Some(record),
            _ => None,
        })
        .collect()
}

fn check_records(items: &[Value]) -> Result<(), ShapeError> {
    match items.iter().enumerate().find(|(_, item)| !item.is_object()) {
        Some((index, item)) => Err(ShapeError::NotARecord {
            index,
            found: kind_of(item),
        }),
        None => Ok(()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
