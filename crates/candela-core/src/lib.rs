pub mod context;
pub mod error;
pub mod events;
pub mod hooks;
pub mod id;
pub mod interaction;
pub mod operations;
pub mod outcome;
pub mod resource;
pub mod time;

pub use context::{
    AuthorizationContext, ConditionalHeaders, FormatCode, RequestContext, ServerResponse,
    SmartScope,
};
pub use error::{CoreError, ErrorKind, Result};
pub use events::{MutationBus, MutationEvent, MutationKind};
pub use hooks::{HookAction, HookRegistry, HookStage, InteractionHook};
pub use id::{generate_id, validate_id};
pub use interaction::Interaction;
pub use operations::{OperationCallback, OperationDefinition, OperationLevel, OperationRegistry};
pub use outcome::{
    IssueSeverity, OperationOutcomeBuilder, outcome_for_error, outcome_ok, single_issue,
};
pub use resource::{ResourceEnvelope, ResourceMeta, etag_for_version, parse_etag_version};
pub use time::{FhirInstant, http_date, now_utc};
