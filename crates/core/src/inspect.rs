//! Dotted-path lookup into JSON documents, used by the `inspect` RPC.
//!
//! `.` or an empty path selects the root. Segments are separated by dots and
//! a leading dot is optional: `.store.offset`, `runtime.restarts`,
//! `store.files.0.name`. Numeric segments index into lists.

use serde_json::Value;

use crate::error::InspectError;

/// Resolves `path` against `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Result<&'a Value, InspectError> {
    let trimmed = path.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Ok(root);
    }

    let mut current = root;
    for segment in trimmed.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| InspectError::NotFound {
            path: path.to_owned(),
            segment: segment.to_owned(),
        })?;
    }
    Ok(current)
}
