use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::interaction::Interaction;
use crate::outcome::outcome_for_error;

/// Wire formats recognized on the request/response boundary.
///
/// JSON is handled in-process; XML bodies are accepted on the boundary but
/// rejected with *unsupported format* since the XML codec is an external
/// collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatCode {
    #[default]
    Json,
    Xml,
}

impl FormatCode {
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.split(';').next().map(str::trim) {
            Some("application/fhir+json") | Some("application/json") | Some("json") => {
                Some(Self::Json)
            }
            Some("application/fhir+xml") | Some("application/xml") | Some("xml") => Some(Self::Xml),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Json => "application/fhir+json",
            Self::Xml => "application/fhir+xml",
        }
    }
}

/// Conditional request headers, parsed by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_none_exist: Option<String>,
}

impl ConditionalHeaders {
    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_none_exist.is_none()
    }
}

/// One parsed SMART scope, e.g. `patient/Observation.rs` or `system/*.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartScope {
    /// `patient`, `user` or `system`.
    pub context: String,
    /// Resource kind or `*`.
    pub kind: String,
    /// Permission string: v1 (`read`, `write`, `*`) or v2 (`cruds` subset).
    pub permissions: String,
}

impl SmartScope {
    /// Parse a single scope token. Returns `None` for non-resource scopes
    /// (`openid`, `launch/patient`, ...), which carry no search semantics.
    pub fn parse(token: &str) -> Option<Self> {
        let (context, rest) = token.split_once('/')?;
        if !matches!(context, "patient" | "user" | "system") {
            return None;
        }
        let (kind, permissions) = rest.split_once('.')?;
        if kind.is_empty() || permissions.is_empty() {
            return None;
        }
        Some(Self {
            context: context.to_string(),
            kind: kind.to_string(),
            permissions: permissions.to_string(),
        })
    }

    fn permits_search(&self) -> bool {
        self.permissions == "*"
            || self.permissions.contains('s')
            || self.permissions == "read"
    }

    /// True when this scope grants unfiltered search over `kind`:
    /// `*.*`, `*.s`, `Kind.*`, `Kind.s` (and v1 `read`) in the `user` or
    /// `system` context.
    pub fn bypasses_filtering(&self, kind: &str) -> bool {
        if self.context == "patient" {
            return false;
        }
        (self.kind == "*" || self.kind == kind) && self.permits_search()
    }

    /// True when this scope allows `kind` inside the launch-patient
    /// compartment.
    pub fn permits_patient_compartment(&self, kind: &str) -> bool {
        self.context == "patient"
            && (self.kind == "*" || self.kind == kind)
            && self.permits_search()
    }
}

/// Authorization descriptor attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub scopes: Vec<SmartScope>,
    /// Patient id bound at launch; required for patient-context scopes.
    pub launch_patient: Option<String>,
    pub user_id: Option<String>,
}

impl AuthorizationContext {
    pub fn from_scope_string(raw: &str) -> Self {
        Self {
            scopes: raw.split_whitespace().filter_map(SmartScope::parse).collect(),
            launch_patient: None,
            user_id: None,
        }
    }

    pub fn with_launch_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.launch_patient = Some(patient_id.into());
        self
    }

    /// Search over `kind` needs no per-resource filtering.
    pub fn bypasses_filtering(&self, kind: &str) -> bool {
        self.scopes.iter().any(|s| s.bypasses_filtering(kind))
    }

    /// Patient-context scopes exist for `kind`; results must be filtered to
    /// the launch-patient compartment.
    pub fn requires_patient_compartment(&self, kind: &str) -> bool {
        !self.bypasses_filtering(kind)
            && self
                .scopes
                .iter()
                .any(|s| s.permits_patient_compartment(kind))
    }
}

/// Immutable, parsed request handed to the dispatcher by the transport.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant: String,
    pub interaction: Interaction,
    pub kind: Option<String>,
    pub id: Option<String>,
    pub url_query: Option<String>,
    pub conditional: ConditionalHeaders,
    pub source_format: FormatCode,
    pub source_content: Option<Vec<u8>>,
    pub source_object: Option<Value>,
    pub destination_format: FormatCode,
    pub pretty: bool,
    pub operation_name: Option<String>,
    pub compartment_kind: Option<String>,
    pub authorization: Option<AuthorizationContext>,
    pub base_url_override: Option<String>,
}

impl RequestContext {
    pub fn new(tenant: impl Into<String>, interaction: Interaction) -> Self {
        Self {
            tenant: tenant.into(),
            interaction,
            kind: None,
            id: None,
            url_query: None,
            conditional: ConditionalHeaders::default(),
            source_format: FormatCode::Json,
            source_content: None,
            source_object: None,
            destination_format: FormatCode::Json,
            pretty: false,
            operation_name: None,
            compartment_kind: None,
            authorization: None,
            base_url_override: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.url_query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.source_object = Some(body);
        self
    }

    pub fn with_raw_body(mut self, bytes: Vec<u8>, format: FormatCode) -> Self {
        self.source_content = Some(bytes);
        self.source_format = format;
        self
    }

    pub fn with_conditional(mut self, conditional: ConditionalHeaders) -> Self {
        self.conditional = conditional;
        self
    }

    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.conditional.if_match = Some(etag.into());
        self
    }

    pub fn with_if_none_exist(mut self, query: impl Into<String>) -> Self {
        self.conditional.if_none_exist = Some(query.into());
        self
    }

    pub fn with_operation(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_compartment_kind(mut self, kind: impl Into<String>) -> Self {
        self.compartment_kind = Some(kind.into());
        self
    }

    pub fn with_authorization(mut self, auth: AuthorizationContext) -> Self {
        self.authorization = Some(auth);
        self
    }

    /// The effective request body as a typed tree.
    ///
    /// Prefers `source_object`; otherwise decodes `source_content` per
    /// `source_format`. XML bodies are rejected here; the XML codec lives
    /// outside the core.
    pub fn body(&self) -> Result<Option<Value>> {
        if let Some(obj) = &self.source_object {
            return Ok(Some(obj.clone()));
        }
        match (&self.source_content, self.source_format) {
            (None, _) => Ok(None),
            (Some(bytes), FormatCode::Json) => {
                let value = serde_json::from_slice(bytes)
                    .map_err(|e| CoreError::structure(format!("invalid JSON body: {e}")))?;
                Ok(Some(value))
            }
            (Some(_), FormatCode::Xml) => Err(CoreError::UnsupportedFormat(
                "XML bodies require the external codec".into(),
            )),
        }
    }
}

/// Dispatcher response handed back to the transport layer.
#[derive(Debug, Clone, Default)]
pub struct ServerResponse {
    pub resource: Option<Value>,
    pub outcome: Option<Value>,
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub location: Option<String>,
    pub serialized_resource: Option<String>,
    pub serialized_outcome: Option<String>,
    pub mime_type: Option<String>,
}

impl ServerResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn ok(resource: Value) -> Self {
        Self {
            resource: Some(resource),
            status: 200,
            ..Self::default()
        }
    }

    pub fn created(resource: Value) -> Self {
        Self {
            resource: Some(resource),
            status: 201,
            ..Self::default()
        }
    }

    pub fn no_content() -> Self {
        Self::with_status(204)
    }

    pub fn not_modified() -> Self {
        Self::with_status(304)
    }

    pub fn from_error(error: &CoreError) -> Self {
        Self {
            outcome: Some(outcome_for_error(error)),
            status: error.http_status(),
            ..Self::default()
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, date: impl Into<String>) -> Self {
        self.last_modified = Some(date.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_outcome(mut self, outcome: Value) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Render `serialized_resource` / `serialized_outcome` for the
    /// destination format. Only JSON is rendered in-process.
    pub fn serialize(&mut self, format: FormatCode, pretty: bool) {
        if format != FormatCode::Json {
            return;
        }
        let render = |v: &Value| {
            if pretty {
                serde_json::to_string_pretty(v).ok()
            } else {
                serde_json::to_string(v).ok()
            }
        };
        self.serialized_resource = self.resource.as_ref().and_then(render);
        self.serialized_outcome = self.outcome.as_ref().and_then(render);
        self.mime_type = Some(format.mime_type().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_from_mime() {
        assert_eq!(
            FormatCode::from_mime("application/fhir+json; charset=utf-8"),
            Some(FormatCode::Json)
        );
        assert_eq!(FormatCode::from_mime("application/xml"), Some(FormatCode::Xml));
        assert_eq!(FormatCode::from_mime("text/csv"), None);
    }

    #[test]
    fn scope_parsing() {
        let scope = SmartScope::parse("patient/Observation.rs").unwrap();
        assert_eq!(scope.context, "patient");
        assert_eq!(scope.kind, "Observation");
        assert_eq!(scope.permissions, "rs");

        assert!(SmartScope::parse("openid").is_none());
        assert!(SmartScope::parse("launch/patient").is_none());
        assert!(SmartScope::parse("team/Patient.read").is_none());
    }

    #[test]
    fn system_scopes_bypass_filtering() {
        let auth = AuthorizationContext::from_scope_string("system/*.*");
        assert!(auth.bypasses_filtering("Patient"));
        assert!(auth.bypasses_filtering("Observation"));

        let auth = AuthorizationContext::from_scope_string("user/Patient.s");
        assert!(auth.bypasses_filtering("Patient"));
        assert!(!auth.bypasses_filtering("Observation"));
    }

    #[test]
    fn patient_scopes_require_compartment() {
        let auth = AuthorizationContext::from_scope_string("patient/Observation.rs")
            .with_launch_patient("example");
        assert!(!auth.bypasses_filtering("Observation"));
        assert!(auth.requires_patient_compartment("Observation"));
        assert!(!auth.requires_patient_compartment("Encounter"));
    }

    #[test]
    fn body_prefers_typed_tree() {
        let ctx = RequestContext::new("default", Interaction::TypeCreate)
            .with_body(json!({"resourceType": "Patient"}))
            .with_raw_body(b"not json".to_vec(), FormatCode::Json);
        assert_eq!(
            ctx.body().unwrap().unwrap()["resourceType"],
            json!("Patient")
        );
    }

    #[test]
    fn body_decodes_json_bytes() {
        let ctx = RequestContext::new("default", Interaction::TypeCreate)
            .with_raw_body(br#"{"resourceType":"Patient"}"#.to_vec(), FormatCode::Json);
        assert!(ctx.body().unwrap().is_some());

        let bad = RequestContext::new("default", Interaction::TypeCreate)
            .with_raw_body(b"{".to_vec(), FormatCode::Json);
        assert_eq!(bad.body().unwrap_err().http_status(), 400);
    }

    #[test]
    fn xml_body_is_rejected_with_415() {
        let ctx = RequestContext::new("default", Interaction::TypeCreate)
            .with_raw_body(b"<Patient/>".to_vec(), FormatCode::Xml);
        assert_eq!(ctx.body().unwrap_err().http_status(), 415);
    }

    #[test]
    fn response_serialization_renders_json() {
        let mut resp = ServerResponse::ok(json!({"resourceType": "Patient", "id": "p1"}));
        resp.serialize(FormatCode::Json, false);
        assert!(resp.serialized_resource.as_ref().unwrap().contains("\"p1\""));
        assert_eq!(resp.mime_type.as_deref(), Some("application/fhir+json"));
    }

    #[test]
    fn error_response_carries_outcome_and_status() {
        let resp = ServerResponse::from_error(&CoreError::not_found("Patient", "x"));
        assert_eq!(resp.status, 404);
        let outcome = resp.outcome.unwrap();
        assert_eq!(outcome["resourceType"], "OperationOutcome");
    }
}
