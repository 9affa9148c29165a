//! Interaction routing: kind validation, the hook pipeline, delegation to
//! the stores and search services, and response assembly.

use serde_json::Value;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tracing::{debug, warn};

use candela_core::{
    CoreError, HookAction, HookStage, Interaction, OperationLevel, RequestContext, Result,
    ServerResponse, outcome_ok,
};
use candela_storage::MutationStatus;

use crate::bundle;
use crate::search;
use crate::tenant::TenantEngine;

/// Per-dispatch options; bundle processing forces pre-assigned ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    pub force_allow_existing_id: bool,
}

/// Dispatch a parsed request against a tenant.
pub async fn dispatch(tenant: &Arc<TenantEngine>, context: &RequestContext) -> ServerResponse {
    dispatch_with(tenant, context, DispatchOptions::default()).await
}

pub async fn dispatch_with(
    tenant: &Arc<TenantEngine>,
    context: &RequestContext,
    options: DispatchOptions,
) -> ServerResponse {
    let kind = context.kind.clone().unwrap_or_default();
    if context.interaction.requires_kind()
        && (kind.is_empty() || !tenant.supports_kind(&kind))
        && context.compartment_kind.is_none()
    {
        return finish(
            context,
            ServerResponse::from_error(&CoreError::unknown_kind(kind.as_str())),
        );
    }

    // Effective input body, possibly replaced by pre hooks.
    let mut body = match context.body() {
        Ok(body) => body,
        Err(err) => return finish(context, ServerResponse::from_error(&err)),
    };

    for hook in tenant
        .hooks
        .chain_for(&kind, context.interaction, HookStage::Pre)
    {
        match hook
            .on_interaction(HookStage::Pre, context, body.as_ref())
            .await
        {
            Ok(HookAction::Continue) => {}
            Ok(HookAction::Replace(replacement)) => body = Some(replacement),
            Ok(HookAction::ShortCircuit(response)) => return finish(context, response),
            Err(err) => warn!(hook = hook.name(), %err, "pre hook failed; continuing"),
        }
    }

    let mut response = match handle(tenant, context, &kind, body, options).await {
        Ok(response) => response,
        Err(err) => ServerResponse::from_error(&err),
    };

    for hook in tenant
        .hooks
        .chain_for(&kind, context.interaction, HookStage::Post)
    {
        // Deep copy so hooks can never touch the stored tree.
        let copy = response.resource.clone();
        match hook
            .on_interaction(HookStage::Post, context, copy.as_ref())
            .await
        {
            Ok(HookAction::Continue) => {}
            Ok(HookAction::Replace(replacement)) => response.resource = Some(replacement),
            Ok(HookAction::ShortCircuit(short)) => return finish(context, short),
            Err(err) => warn!(hook = hook.name(), %err, "post hook failed; continuing"),
        }
    }

    finish(context, response)
}

fn finish(context: &RequestContext, mut response: ServerResponse) -> ServerResponse {
    response.serialize(context.destination_format, context.pretty);
    response
}

async fn handle(
    tenant: &Arc<TenantEngine>,
    context: &RequestContext,
    kind: &str,
    body: Option<Value>,
    options: DispatchOptions,
) -> Result<ServerResponse> {
    let auth = context.authorization.as_ref();
    let base_override = context.base_url_override.as_deref();
    let query = context.url_query.as_deref().unwrap_or_default();

    match context.interaction {
        Interaction::InstanceRead => {
            let id = require_id(context)?;
            let Some(env) = tenant.read_resource(kind, id).await? else {
                return Err(CoreError::not_found(kind, id));
            };
            if tenant.settings().support_not_changed && not_changed(context, &env) {
                return Ok(ServerResponse::not_modified().with_etag(env.etag()));
            }
            Ok(instance_response(tenant, &env, 200, false))
        }

        Interaction::InstanceUpdate => {
            let id = require_id(context)?;
            let payload = align_payload_id(require_body(body)?, id)?;
            let outcome = tenant
                .update_resource(
                    kind,
                    payload,
                    tenant.settings().allow_create_as_update,
                    context.conditional.if_match.as_deref(),
                    context.conditional.if_none_match.as_deref(),
                )
                .await?;
            let status = if outcome.status == MutationStatus::Created {
                201
            } else {
                200
            };
            Ok(instance_response(
                tenant,
                &outcome.resource,
                status,
                status == 201,
            ))
        }

        Interaction::InstanceUpdateConditional => {
            let payload = require_body(body)?;
            let (_, matched) = tenant.search_kind(kind, query, false).await?;
            match matched.len() {
                0 => {
                    if !tenant.settings().allow_create_as_update {
                        return Err(CoreError::precondition(
                            "no match and create-as-update is disabled",
                        ));
                    }
                    let created = tenant.create_resource(kind, payload, true).await?;
                    Ok(instance_response(tenant, &created, 201, true))
                }
                1 => {
                    let target = &matched[0];
                    if let Some(payload_id) = payload.get("id").and_then(Value::as_str)
                        && payload_id != target.id
                    {
                        return Err(CoreError::precondition(format!(
                            "payload id '{payload_id}' does not match the single match '{}'",
                            target.id
                        )));
                    }
                    let payload = align_payload_id(payload, &target.id)?;
                    let outcome = tenant
                        .update_resource(
                            kind,
                            payload,
                            false,
                            context.conditional.if_match.as_deref(),
                            context.conditional.if_none_match.as_deref(),
                        )
                        .await?;
                    Ok(instance_response(tenant, &outcome.resource, 200, false))
                }
                n => Err(CoreError::precondition(format!(
                    "conditional update matched {n} instances"
                ))),
            }
        }

        Interaction::InstanceDelete => {
            let id = require_id(context)?;
            match tenant.delete_resource(kind, id).await? {
                Some(_) => Ok(ServerResponse::ok(outcome_ok(format!("deleted {kind}/{id}")))),
                None => Err(CoreError::not_found(kind, id)),
            }
        }

        Interaction::TypeCreate | Interaction::TypeCreateConditional => {
            let payload = require_body(body)?;
            if let Some(condition) = context.conditional.if_none_exist.as_deref() {
                let (_, matched) = tenant.search_kind(kind, condition, false).await?;
                match matched.len() {
                    0 => {}
                    1 => {
                        // Conditional create with one match: the existing
                        // instance, not a new one.
                        return Ok(instance_response(tenant, &matched[0], 200, false));
                    }
                    n => {
                        return Err(CoreError::precondition(format!(
                            "If-None-Exist matched {n} instances"
                        )));
                    }
                }
            }
            let allow_existing =
                options.force_allow_existing_id || tenant.settings().allow_existing_id;
            let created = tenant.create_resource(kind, payload, allow_existing).await?;
            Ok(instance_response(tenant, &created, 201, true))
        }

        Interaction::TypeDeleteConditionalSingle => {
            let (_, matched) = tenant.search_kind(kind, query, false).await?;
            match matched.len() {
                0 => Err(CoreError::not_found(kind, "<conditional>")),
                1 => {
                    let id = matched[0].id.clone();
                    tenant.delete_resource(kind, &id).await?;
                    Ok(ServerResponse::ok(outcome_ok(format!("deleted {kind}/{id}"))))
                }
                n => Err(CoreError::precondition(format!(
                    "conditional delete matched {n} instances"
                ))),
            }
        }

        // Bulk conditional deletion is not enabled.
        Interaction::TypeDeleteConditionalMultiple => Err(CoreError::precondition(
            "conditional delete of multiple instances is not enabled",
        )),

        Interaction::SystemDeleteConditional => Err(CoreError::not_supported(
            "system-level conditional delete",
        )),

        Interaction::TypeSearch => {
            let bundle = search::type_search(tenant, kind, query, auth, base_override).await?;
            Ok(ServerResponse::ok(bundle))
        }

        Interaction::SystemSearch => {
            let bundle = search::system_search(tenant, query, auth, base_override).await?;
            Ok(ServerResponse::ok(bundle))
        }

        Interaction::CompartmentSearch => {
            let root_id = require_id(context)?;
            let compartment_kind = context.compartment_kind.as_deref().unwrap_or(kind);
            let bundle = search::compartment_search(
                tenant,
                compartment_kind,
                root_id,
                None,
                query,
                auth,
                base_override,
            )
            .await?;
            Ok(ServerResponse::ok(bundle))
        }

        Interaction::CompartmentTypeSearch => {
            let root_id = require_id(context)?;
            let compartment_kind = context
                .compartment_kind
                .as_deref()
                .ok_or_else(|| CoreError::structure("compartment kind is required"))?;
            let bundle = search::compartment_search(
                tenant,
                compartment_kind,
                root_id,
                Some(kind),
                query,
                auth,
                base_override,
            )
            .await?;
            Ok(ServerResponse::ok(bundle))
        }

        Interaction::SystemCapabilities => {
            let statement = tenant.capability_statement(base_override);
            Ok(ServerResponse::ok((*statement).clone()))
        }

        Interaction::SystemBundle => {
            let payload = require_body(body)?;
            Box::pin(bundle::process(tenant, context, payload)).await
        }

        Interaction::InstanceOperation
        | Interaction::TypeOperation
        | Interaction::SystemOperation => run_operation(tenant, context, kind, body).await,
    }
}

async fn run_operation(
    tenant: &Arc<TenantEngine>,
    context: &RequestContext,
    kind: &str,
    body: Option<Value>,
) -> Result<ServerResponse> {
    let name = context
        .operation_name
        .as_deref()
        .ok_or_else(|| CoreError::structure("operation name is required"))?;
    let Some(operation) = tenant.operations().get(name) else {
        return Err(CoreError::not_supported(format!("operation ${name}")));
    };
    let definition = operation.definition();

    let level = match context.interaction {
        Interaction::InstanceOperation => OperationLevel::Instance,
        Interaction::TypeOperation => OperationLevel::Type,
        _ => OperationLevel::System,
    };
    if !definition.supports_level(level) {
        return Err(CoreError::not_supported(format!(
            "operation ${name} at {} level",
            level.as_str()
        )));
    }
    if level != OperationLevel::System && !definition.applies_to_kind(kind) {
        return Err(CoreError::not_supported(format!(
            "operation ${name} on {kind}"
        )));
    }
    if let Some(body) = &body
        && !definition.accepts_non_fhir
        && body.get("resourceType").is_none()
    {
        return Err(CoreError::UnsupportedFormat(format!(
            "operation ${name} requires a resource body"
        )));
    }

    let focus = match (level, &context.id) {
        (OperationLevel::Instance, Some(id)) => {
            let Some(env) = tenant.read_resource(kind, id).await? else {
                return Err(CoreError::not_found(kind, id));
            };
            Some(env.to_value())
        }
        (OperationLevel::Instance, None) => {
            return Err(CoreError::structure("instance operation requires an id"));
        }
        _ => None,
    };

    debug!(operation = name, level = level.as_str(), "invoking operation");
    operation.invoke(context, focus.as_ref(), body.as_ref()).await
}

fn require_id<'a>(context: &'a RequestContext) -> Result<&'a str> {
    context
        .id
        .as_deref()
        .ok_or_else(|| CoreError::structure("instance interaction requires an id"))
}

fn require_body(body: Option<Value>) -> Result<Value> {
    body.ok_or_else(|| CoreError::structure("interaction requires a body"))
}

/// Align the payload id with the url id: absent is filled in, a mismatch
/// is structural.
fn align_payload_id(mut payload: Value, id: &str) -> Result<Value> {
    match payload.get("id").and_then(Value::as_str) {
        None => {
            payload["id"] = Value::String(id.to_string());
            Ok(payload)
        }
        Some(existing) if existing == id => Ok(payload),
        Some(existing) => Err(CoreError::structure(format!(
            "payload id '{existing}' does not match url id '{id}'"
        ))),
    }
}

fn instance_response(
    tenant: &Arc<TenantEngine>,
    env: &candela_core::ResourceEnvelope,
    status: u16,
    with_location: bool,
) -> ServerResponse {
    let mut response = ServerResponse {
        resource: Some(env.to_value()),
        status,
        ..ServerResponse::default()
    }
    .with_etag(env.etag())
    .with_last_modified(env.meta.last_updated.to_http_date());
    if with_location {
        response = response.with_location(format!(
            "{}/{}/{}",
            tenant.base_url(),
            env.kind,
            env.id
        ));
    }
    response
}

/// `If-None-Match` / `If-Modified-Since` evaluation for reads.
fn not_changed(context: &RequestContext, env: &candela_core::ResourceEnvelope) -> bool {
    if let Some(tag) = context.conditional.if_none_match.as_deref()
        && candela_core::parse_etag_version(tag) == Some(env.meta.version_id)
    {
        return true;
    }
    if let Some(since) = context.conditional.if_modified_since.as_deref()
        && let Some(threshold) = parse_http_or_rfc3339(since)
    {
        return env.meta.last_updated.0 <= threshold;
    }
    false
}

fn parse_http_or_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    let imf = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    time::PrimitiveDateTime::parse(raw, &imf)
        .ok()
        .map(|dt| dt.assume_utc())
}
