use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::snapshot::{Dataset, Record, Snapshot};

/// Hex digest of a dataset's canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of the empty dataset. Also stands in for "nothing stored
    /// yet" when comparing against the fingerprint store.
    pub fn empty() -> Self {
        fingerprint(&[])
    }

    /// Wraps a value read back from the fingerprint store. Values are not
    /// validated: anything foreign compares unequal to every computed
    /// fingerprint and is replaced by the next successful write.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty_dataset(&self) -> bool {
        *self == Self::empty()
    }

    /// Leading hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprints of both datasets of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintPair {
    pub calls_on_hold: Fingerprint,
    pub live_queue_status: Fingerprint,
}

impl FingerprintPair {
    pub fn of(snapshot: &Snapshot) -> Self {
        Self {
            calls_on_hold: fingerprint(&snapshot.calls_on_hold),
            live_queue_status: fingerprint(&snapshot.live_queue_status),
        }
    }

    pub fn empty() -> Self {
        let empty = Fingerprint::empty();
        Self {
            calls_on_hold: empty.clone(),
            live_queue_status: empty,
        }
    }

    pub fn get(&self, dataset: Dataset) -> &Fingerprint {
        match dataset {
            Dataset::CallsOnHold => &self.calls_on_hold,
            Dataset::LiveQueueStatus => &self.live_queue_status,
        }
    }
}

/// Hashes the canonical form of `dataset` with SHA-256.
pub fn fingerprint(dataset: &[Record]) -> Fingerprint {
    let canonical = canonical_string(dataset);
    let digest = Sha256::digest(canonical.as_bytes());
    Fingerprint(format!("{:x}", digest))
}

/// Compact JSON for `dataset` with object keys sorted by byte order at every
/// depth. Record order is kept: the vendor orders calls by wait time and a
/// reorder is a visible change.
pub fn canonical_string(dataset: &[Record]) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, record) in dataset.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_object(record, &mut out);
    }
    out.push(']');
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out),
        // Scalars already have a single JSON rendering.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}
