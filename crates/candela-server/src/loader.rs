//! Startup directory load.
//!
//! Reads `.json` payloads from the configured directory (`.xml` files are
//! noted and skipped; the XML codec is external). A FHIR package layout
//! (`package.json` designating a `lib` directory) narrows the load to that
//! directory and skips example files. Loaded content is upserted with its
//! original ids and, when configured, added to the protected set.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use candela_core::Result;

use crate::tenant::TenantEngine;

/// Kinds loaded before everything else so that search parameters,
/// compartments, terminology and topics are in place when instance data
/// referencing them arrives.
const PRIORITY_KINDS: &[&str] = &[
    "SearchParameter",
    "CompartmentDefinition",
    "CodeSystem",
    "ValueSet",
    "StructureDefinition",
    "SubscriptionTopic",
    "Basic",
    "Subscription",
];

/// Load every payload in `directory` into the tenant. Returns the number
/// of stored resources.
pub async fn load_directory(tenant: &TenantEngine, directory: &Path) -> Result<usize> {
    let root = effective_root(directory);
    let in_package = root != directory;

    let mut files: Vec<PathBuf> = std::fs::read_dir(&root)
        .map_err(|e| candela_core::CoreError::internal(format!("load directory: {e}")))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut payloads = Vec::new();
    for path in files {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {}
            Some("xml") => {
                warn!(path = %path.display(), "skipping XML payload (external codec)");
                continue;
            }
            _ => continue,
        }
        if in_package
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".example.") || n == "package.json")
        {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), %err, "unreadable payload skipped");
                continue;
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => payloads.push((path, value)),
            Err(err) => warn!(path = %path.display(), %err, "unparseable payload skipped"),
        }
    }

    // Conformance and subscription machinery first, then instance data.
    payloads.sort_by_key(|(_, value)| {
        let kind = value.get("resourceType").and_then(Value::as_str).unwrap_or("");
        PRIORITY_KINDS
            .iter()
            .position(|p| *p == kind)
            .unwrap_or(PRIORITY_KINDS.len())
    });

    let mut loaded = 0;
    for (path, payload) in payloads {
        let Some(kind) = payload
            .get("resourceType")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            warn!(path = %path.display(), "payload lacks resourceType");
            continue;
        };
        if !tenant.supports_kind(&kind) {
            debug!(path = %path.display(), %kind, "unsupported kind skipped");
            continue;
        }
        match tenant.update_resource(&kind, payload, true, None, None).await {
            Ok(outcome) => {
                if tenant.settings().protect_loaded_content {
                    tenant.protected().protect(&kind, &outcome.resource.id);
                }
                loaded += 1;
            }
            Err(err) => warn!(path = %path.display(), %err, "payload rejected"),
        }
    }

    info!(loaded, directory = %directory.display(), "startup load complete");
    Ok(loaded)
}

/// A `package.json` designating a `lib` directory narrows the load root.
fn effective_root(directory: &Path) -> PathBuf {
    let manifest = directory.join("package.json");
    if let Ok(raw) = std::fs::read_to_string(&manifest)
        && let Ok(parsed) = serde_json::from_str::<Value>(&raw)
        && let Some(lib) = parsed
            .pointer("/directories/lib")
            .and_then(Value::as_str)
    {
        let lib_dir = directory.join(lib);
        if lib_dir.is_dir() {
            return lib_dir;
        }
    }
    directory.to_path_buf()
}
