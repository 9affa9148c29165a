use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Maximum id length accepted on the boundary.
const MAX_ID_LEN: usize = 64;

/// Generate a fresh server-assigned resource id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Validate a caller-supplied id: `[A-Za-z0-9\-\.]{1,64}`.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CoreError::structure("resource id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CoreError::structure(format!(
            "resource id exceeds {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(CoreError::structure(format!(
            "resource id '{id}' contains invalid characters"
        )));
    }
    Ok(())
}
