//! Shared recursive traversal over read-payload (`select`/`include`) and write-payload
//! (nested create/update operators) trees, so the find and mutation planners — and any
//! plugin that wants to inspect a payload the same way — share one walker instead of
//! each inlining its own (§4.4).

use serde_json::Value;

/// The nested-write operator keys a relation field's payload may carry, in the order
/// the mutation planner applies them: disconnects/deletes run before
/// connects/creates, so a `set` that also creates never collides with a stale row
/// (§4.5 step 3).
pub const WRITE_OPERATORS: &[&str] = &[
    "disconnect",
    "delete",
    "deleteMany",
    "update",
    "updateMany",
    "set",
    "upsert",
    "connect",
    "connectOrCreate",
    "create",
    "createMany",
];

/// One nested-write operator found on a relation field's payload, plus its argument.
pub struct WriteOp<'a> {
    pub op: &'static str,
    pub arg: &'a Value,
}

/// Every recognized nested-write operator present on a relation field's payload
/// object, in [`WRITE_OPERATORS`] order (not JSON key order — the planner's ordering
/// guarantee depends on disconnect/delete always preceding connect/create).
pub fn write_ops(payload: &Value) -> Vec<WriteOp<'_>> {
    let Some(obj) = payload.as_object() else {
        return Vec::new();
    };
    WRITE_OPERATORS
        .iter()
        .filter_map(|op| obj.get(*op).map(|arg| WriteOp { op, arg }))
        .collect()
}

/// Depth-one walk over a `data` object: for each key, `is_relation` decides whether it
/// names a relation field, then dispatches to `on_scalar`/`on_relation`. Callers recurse
/// explicitly (calling back into this function themselves for nested `create` payloads)
/// so both a planner that must act on each key and a plugin that merely wants to inspect
/// it can share this one traversal.
pub fn walk_write_fields<'a>(
    data: &'a Value,
    mut is_relation: impl FnMut(&str) -> bool,
    mut on_scalar: impl FnMut(&str, &'a Value),
    mut on_relation: impl FnMut(&str, &'a Value),
) -> Option<()> {
    let obj = data.as_object()?;
    for (key, value) in obj {
        if is_relation(key) {
            on_relation(key, value);
        } else {
            on_scalar(key, value);
        }
    }
    Some(())
}

/// Depth-one walk over a `select`/`include` tree, mirroring [`walk_write_fields`] for
/// the read side: skips falsy entries (`false`/`null`), then tells the caller whether
/// each remaining key is a relation and hands back its spec (`true`, or an object
/// carrying nested `select`/`include`/`where`/...).
pub fn walk_read_fields<'a>(
    shape: &'a Value,
    mut is_relation: impl FnMut(&str) -> bool,
    mut on_field: impl FnMut(&str, &'a Value),
    mut on_relation: impl FnMut(&str, &'a Value),
) -> Option<()> {
    let obj = shape.as_object()?;
    for (key, spec) in obj {
        if matches!(spec, Value::Bool(false) | Value::Null) {
            continue;
        }
        if is_relation(key) {
            on_relation(key, spec);
        } else {
            on_field(key, spec);
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_ops_are_returned_in_dependency_order_not_payload_order() {
        let payload = serde_json::json!({"create": {"name": "a"}, "disconnect": {"id": 1}});
        let ops: Vec<&str> = write_ops(&payload).into_iter().map(|o| o.op).collect();
        assert_eq!(ops, vec!["disconnect", "create"]);
    }

    #[test]
    fn walk_read_fields_skips_falsy_entries() {
        let shape = serde_json::json!({"id": true, "name": false, "posts": {"take": 1}});
        let mut seen = Vec::new();
        walk_read_fields(&shape, |k| k == "posts", |k, _| seen.push(k.to_owned()), |k, _| seen.push(k.to_owned()));
        seen.sort();
        assert_eq!(seen, vec!["id", "posts"]);
    }
}
