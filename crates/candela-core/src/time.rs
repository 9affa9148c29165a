use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

use crate::error::{CoreError, Result};

/// UTC instant attached to stored resources.
///
/// Wraps `time::OffsetDateTime`, serializes as RFC 3339 and orders
/// chronologically so `meta.lastUpdated` comparisons work directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirInstant(pub OffsetDateTime);

impl FhirInstant {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn parse(value: &str) -> Result<Self> {
        OffsetDateTime::parse(value, &Rfc3339)
            .map(Self)
            .map_err(|e| CoreError::structure(format!("invalid instant '{value}': {e}")))
    }

    pub fn to_rfc3339(&self) -> String {
        self.0
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
    }

    /// IMF-fixdate rendering used for the `Last-Modified` response field.
    pub fn to_http_date(&self) -> String {
        let fmt = format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        );
        self.0
            .to_offset(time::UtcOffset::UTC)
            .format(&fmt)
            .unwrap_or_else(|_| self.to_rfc3339())
    }

    pub fn unix_timestamp(&self) -> i64 {
        self.0.unix_timestamp()
    }
}

impl From<OffsetDateTime> for FhirInstant {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for FhirInstant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

impl std::str::FromStr for FhirInstant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for FhirInstant {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for FhirInstant {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FhirInstant::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Current UTC instant.
pub fn now_utc() -> FhirInstant {
    FhirInstant::now()
}

/// Render an instant as an HTTP date (convenience for response assembly).
pub fn http_date(instant: &FhirInstant) -> String {
    instant.to_http_date()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_roundtrip() {
        let instant = FhirInstant::parse("2023-05-15T14:30:00Z").unwrap();
        assert_eq!(instant.to_rfc3339(), "2023-05-15T14:30:00Z");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(FhirInstant::parse("yesterday").is_err());
        assert!(FhirInstant::parse("2023-13-40T99:00:00Z").is_err());
    }

    #[test]
    fn ordering_is_chronological() {
        let earlier = FhirInstant::parse("2020-01-01T00:00:00Z").unwrap();
        let later = FhirInstant::parse("2021-01-01T00:00:00Z").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn http_date_is_imf_fixdate() {
        let instant = FhirInstant::parse("1994-11-06T08:49:37Z").unwrap();
        assert_eq!(instant.to_http_date(), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn serde_uses_rfc3339_strings() {
        let instant = FhirInstant::parse("2023-05-15T14:30:00Z").unwrap();
        let json = serde_json::to_string(&instant).unwrap();
        assert_eq!(json, "\"2023-05-15T14:30:00Z\"");
        let back: FhirInstant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instant);
    }

    #[test]
    fn now_is_monotone_enough() {
        let a = now_utc();
        let b = now_utc();
        assert!(a <= b);
    }
}
