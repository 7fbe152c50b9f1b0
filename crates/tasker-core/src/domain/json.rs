//! JSON state helpers.

use serde_json::Value;

/// Shallow merge: when both sides are objects, keys of `partial` overwrite
/// keys of `base`; otherwise `partial` replaces `base` wholesale.
pub fn merge_state(base: &mut Value, partial: Value) {
    match (base, partial) {
        (Value::Object(base), Value::Object(partial)) => {
            for (key, value) in partial {
                base.insert(key, value);
            }
        }
        (base, partial) => *base = partial,
    }
}
