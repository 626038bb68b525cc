//! Patch payloads and their construction
use serde::Serialize;
use serde_json::{Map, Value};

use crate::Error;

/// Describes changes to make to an object
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// [JSON Merge Patch](https://tools.ietf.org/html/rfc7386)
    Merge(Value),
    /// Strategic merge patch
    ///
    /// For the objects kiln patches this behaves like a merge patch since no lists
    /// carry merge keys.
    Strategic(Value),
}

impl Patch {
    /// Returns the patch content type
    pub fn content_type(&self) -> &'static str {
        match self {
            Patch::Merge(_) => "application/merge-patch+json",
            Patch::Strategic(_) => "application/strategic-merge-patch+json",
        }
    }

    /// The raw patch document
    pub fn value(&self) -> &Value {
        match self {
            Patch::Merge(v) | Patch::Strategic(v) => v,
        }
    }

    /// A strategic patch turning `before` into `after`
    ///
    /// Returns `Ok(None)` when both serialize identically.
    pub fn diff<T: Serialize>(before: &T, after: &T) -> Result<Option<Patch>, Error> {
        let before = serde_json::to_value(before).map_err(Error::SerializePatch)?;
        let after = serde_json::to_value(after).map_err(Error::SerializePatch)?;
        if before == after {
            return Ok(None);
        }
        Ok(Some(Patch::Strategic(create_merge_patch(&before, &after))))
    }
}

/// Computes the merge patch that turns `original` into `modified`
///
/// Objects are diffed recursively, removed keys become `null` and every other value,
/// including arrays, is replaced wholesale.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();
            for (key, new) in modi {
                match orig.get(key) {
                    Some(old) if old == new => {}
                    Some(old @ Value::Object(_)) if new.is_object() => {
                        patch.insert(key.clone(), create_merge_patch(old, new));
                    }
                    _ => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            for key in orig.keys().filter(|k| !modi.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn nested_changes_only() {
        let before = json!({
            "metadata": { "name": "ruby-1", "annotations": { "a": "1" } },
            "status": { "phase": "New", "reason": "InvalidOutputReference", "message": "x" }
        });
        let after = json!({
            "metadata": {
                "name": "ruby-1",
                "annotations": { "a": "1", "openshift.io/build.pod-name": "ruby-1-build" }
            },
            "status": { "phase": "Pending" }
        });
        let patch = create_merge_patch(&before, &after);
        assert_json_eq!(
            patch,
            json!({
                "metadata": { "annotations": { "openshift.io/build.pod-name": "ruby-1-build" } },
                "status": { "phase": "Pending", "reason": null, "message": null }
            })
        );
    }

    #[test]
    fn arrays_are_replaced() {
        let patch = create_merge_patch(&json!({ "a": [1, 2] }), &json!({ "a": [2] }));
        assert_json_eq!(patch, json!({ "a": [2] }));
    }

    #[test]
    fn identical_objects_produce_no_patch() {
        let value = json!({ "a": { "b": 1 } });
        assert_eq!(Patch::diff(&value, &value).unwrap(), None);
        let patch = Patch::diff(&value, &json!({ "a": { "b": 2 } })).unwrap().unwrap();
        assert_eq!(patch.content_type(), "application/strategic-merge-patch+json");
        assert_json_eq!(patch.value(), &json!({ "a": { "b": 2 } }));
    }
}
