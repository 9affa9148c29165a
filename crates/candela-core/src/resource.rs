use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::time::FhirInstant;

/// Versioning and provenance metadata carried by every stored instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Monotonic version counter, starts at 1 and strictly increases on
    /// every accepted update. Serialized as a string per the wire schema.
    #[serde(rename = "versionId", with = "version_serde", default = "initial_version")]
    pub version_id: u64,
    #[serde(rename = "lastUpdated", default = "FhirInstant::now")]
    pub last_updated: FhirInstant,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub profile: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub security: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tag: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

fn initial_version() -> u64 {
    1
}

mod version_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        // Accept both string and integer forms on input.
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => s.parse().map_err(serde::de::Error::custom),
            serde_json::Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom("versionId must be a positive integer")),
            _ => Err(serde::de::Error::custom("versionId must be a string")),
        }
    }
}

impl ResourceMeta {
    pub fn new() -> Self {
        Self {
            version_id: 1,
            last_updated: FhirInstant::now(),
            profile: Vec::new(),
            security: Vec::new(),
            tag: Vec::new(),
            source: None,
        }
    }

    /// Advance to the next version; `lastUpdated` is monotonically
    /// non-decreasing even if the wall clock steps backwards.
    pub fn advance(&mut self) {
        self.version_id += 1;
        let now = FhirInstant::now();
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    pub fn etag(&self) -> String {
        etag_for_version(self.version_id)
    }
}

impl Default for ResourceMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// One stored resource instance: kind, id, metadata, opaque payload tree.
///
/// The payload's self-declared kind and id live in the envelope fields;
/// everything else stays in `data`, round-tripping through serde untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "resourceType")]
    pub kind: String,
    #[serde(default)]
    pub meta: ResourceMeta,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ResourceEnvelope {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            meta: ResourceMeta::new(),
            data: Map::new(),
        }
    }

    /// Parse a payload tree. Fails with *structure* when `resourceType` is
    /// absent; a missing id is tolerated (create assigns one).
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(CoreError::structure("payload must be an object"));
        }
        if value.get("resourceType").and_then(Value::as_str).is_none() {
            return Err(CoreError::structure("payload lacks a resourceType"));
        }
        serde_json::from_value(value).map_err(|e| CoreError::structure(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn get_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Canonical identity string, when the payload declares a `url` element.
    pub fn canonical_url(&self) -> Option<&str> {
        self.data.get("url").and_then(Value::as_str)
    }

    /// Identifier tuples `(system, value)` declared by the payload.
    pub fn identifiers(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let entries = match self.data.get("identifier") {
            Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
            Some(single @ Value::Object(_)) => vec![single],
            _ => return out,
        };
        for entry in entries {
            if let Some(value) = entry.get("value").and_then(Value::as_str) {
                let system = entry
                    .get("system")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.push((system.to_string(), value.to_string()));
            }
        }
        out
    }

    pub fn etag(&self) -> String {
        self.meta.etag()
    }
}

/// Weak entity tag for a version counter: `W/"<version>"`.
pub fn etag_for_version(version: u64) -> String {
    format!("W/\"{version}\"")
}

/// Parse a version counter out of an etag header value.
///
/// Accepts `W/"3"`, `"3"` and bare `3`.
pub fn parse_etag_version(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("W/")
        .unwrap_or(trimmed)
        .trim_matches('"');
    stripped.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_envelope_starts_at_version_one() {
        let env = ResourceEnvelope::new("p1", "Patient");
        assert_eq!(env.meta.version_id, 1);
        assert_eq!(env.etag(), "W/\"1\"");
    }

    #[test]
    fn advance_increments_version_strictly() {
        let mut meta = ResourceMeta::new();
        let first = meta.last_updated.clone();
        meta.advance();
        meta.advance();
        assert_eq!(meta.version_id, 3);
        assert!(meta.last_updated >= first);
    }

    #[test]
    fn from_value_requires_resource_type() {
        let err = ResourceEnvelope::from_value(json!({"id": "x"})).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(ResourceEnvelope::from_value(json!("scalar")).is_err());
    }

    #[test]
    fn from_value_tolerates_missing_id() {
        let env = ResourceEnvelope::from_value(json!({"resourceType": "Patient"})).unwrap();
        assert!(env.id.is_empty());
        assert_eq!(env.kind, "Patient");
    }

    #[test]
    fn payload_fields_survive_roundtrip() {
        let env = ResourceEnvelope::from_value(json!({
            "resourceType": "Patient",
            "id": "example",
            "name": [{"given": ["Peter"], "family": "Chalmers"}],
            "active": true
        }))
        .unwrap();
        assert_eq!(env.id, "example");
        let back = env.to_value();
        assert_eq!(back["resourceType"], "Patient");
        assert_eq!(back["name"][0]["given"][0], "Peter");
        assert_eq!(back["active"], true);
        assert_eq!(back["meta"]["versionId"], "1");
    }

    #[test]
    fn canonical_url_and_identifiers_are_extracted() {
        let env = ResourceEnvelope::from_value(json!({
            "resourceType": "ValueSet",
            "id": "vs1",
            "url": "http://example.org/ValueSet/vs1",
            "identifier": [
                {"system": "urn:x", "value": "42"},
                {"value": "no-system"}
            ]
        }))
        .unwrap();
        assert_eq!(env.canonical_url(), Some("http://example.org/ValueSet/vs1"));
        assert_eq!(
            env.identifiers(),
            vec![
                ("urn:x".to_string(), "42".to_string()),
                (String::new(), "no-system".to_string())
            ]
        );
    }

    #[test]
    fn etag_parsing_accepts_all_forms() {
        assert_eq!(parse_etag_version("W/\"7\""), Some(7));
        assert_eq!(parse_etag_version("\"7\""), Some(7));
        assert_eq!(parse_etag_version("7"), Some(7));
        assert_eq!(parse_etag_version("W/\"seven\""), None);
    }

    #[test]
    fn incoming_meta_version_is_accepted_as_string_or_number() {
        let env = ResourceEnvelope::from_value(json!({
            "resourceType": "Patient",
            "id": "x",
            "meta": {"versionId": "4", "lastUpdated": "2023-05-15T14:30:00Z"}
        }))
        .unwrap();
        assert_eq!(env.meta.version_id, 4);

        let env = ResourceEnvelope::from_value(json!({
            "resourceType": "Patient",
            "id": "x",
            "meta": {"versionId": 9, "lastUpdated": "2023-05-15T14:30:00Z"}
        }))
        .unwrap();
        assert_eq!(env.meta.version_id, 9);
    }
}
