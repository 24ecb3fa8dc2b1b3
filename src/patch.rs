//! RFC-6902 JSON Patch, used both for `PATCH` request bodies and for the
//! diffs `doInsert`/`doUpdate` hand back so clients can reconcile
//! server-computed fields. Thin wrapper around the `json-patch` crate: no
//! teacher file implements patch semantics, so this is grounded directly in
//! the spec's round-trip laws (§8) rather than an existing module.

use json_patch::{Patch, PatchOperation, diff as json_diff, patch as json_apply};
use serde_json::Value;

use crate::error::Result;

/// Applies `patch` to a clone of `target`, returning the new value. Errors
/// become 400s: a patch that fails to apply (bad path, test-op mismatch) is
/// a client-input problem, not a server fault.
pub fn apply(target: &Value, patch: &Patch) -> Result<Value> {
    let mut document = target.clone();
    json_apply(&mut document, patch).map_err(|error| crate::err!(400, message = format!("invalid JSON patch: {error}")))?;
    Ok(document)
}

/// Computes the patch that turns `from` into `to`, used to build the diff
/// returned from `doInsert`/`doUpdate`.
pub fn diff(from: &Value, to: &Value) -> Patch {
    json_diff(from, to)
}

/// True for an empty patch, the boundary case the spec requires to return
/// `[]` and leave `etag` unchanged.
pub fn is_empty(patch: &Patch) -> bool {
    patch_ops(patch).is_empty()
}

fn patch_ops(patch: &Patch) -> &[PatchOperation] {
    patch.0.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_of_equal_values_is_empty() {
        let value = json!({ "a": 1 });
        assert!(is_empty(&diff(&value, &value)));
    }

    #[test]
    fn apply_round_trips_through_diff() {
        let before = json!({ "a": 1, "b": "x" });
        let after = json!({ "a": 2, "b": "x", "c": true });

        let patch = diff(&before, &after);
        let applied = apply(&before, &patch).unwrap();
        assert_eq!(applied, after);
    }

    #[test]
    fn apply_rejects_a_malformed_patch() {
        let before = json!({ "a": 1 });
        let bad: Patch = serde_json::from_value(json!([
            { "op": "test", "path": "/a", "value": 999 }
        ]))
        .unwrap();

        assert!(apply(&before, &bad).is_err());
    }
}
