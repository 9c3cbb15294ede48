//! JSON-path grammar
//!
//! Dot-separated keys; a segment may carry one `name[index]` array access.
//! A missing segment or out-of-range index resolves to nothing, which fails
//! the enclosing pair/predicate.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static ARRAY_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+)\[(\d+)\]$").expect("static regex"));

/// Extract the value at `path` from `root`.
pub fn extract<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        if let Some(captures) = ARRAY_SEGMENT.captures(segment) {
            let key = captures.get(1).expect("group 1").as_str();
            let index: usize = captures.get(2).expect("group 2").as_str().parse().ok()?;
            current = current.get(key)?.as_array()?.get(index)?;
        } else {
            current = current.get(segment)?;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_keys() {
        let doc = json!({"a": {"b": {"c": 42}}});
        assert_eq!(extract(&doc, "a.b.c"), Some(&json!(42)));
        assert_eq!(extract(&doc, "a.b"), Some(&json!({"c": 42})));
        assert_eq!(extract(&doc, ""), Some(&doc));
    }

    #[test]
    fn test_array_access() {
        let doc = json!({"items": [{"name": "ok"}, {"name": "second"}]});
        assert_eq!(extract(&doc, "items[0].name"), Some(&json!("ok")));
        assert_eq!(extract(&doc, "items[1].name"), Some(&json!("second")));
    }

    #[test]
    fn test_missing_paths() {
        let doc = json!({"items": [{"name": "ok"}]});
        assert_eq!(extract(&doc, "items[2].name"), None);
        assert_eq!(extract(&doc, "items[0].missing"), None);
        assert_eq!(extract(&doc, "nope"), None);
        assert_eq!(extract(&doc, "items.name"), None);
    }

    #[test]
    fn test_index_on_non_array() {
        let doc = json!({"items": {"0": "x"}});
        assert_eq!(extract(&doc, "items[0]"), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_planted_value_is_found(
            key in "[a-z]{1,6}",
            index in 0usize..4,
            value in proptest::num::i64::ANY,
        ) {
            let mut array = vec![json!(null); index + 1];
            array[index] = json!(value);
            let doc = json!({key.clone(): {"inner": array}});

            let path = format!("{key}.inner[{index}]");
            proptest::prop_assert_eq!(extract(&doc, &path), Some(&json!(value)));

            let beyond = format!("{key}.inner[{}]", index + 1);
            proptest::prop_assert_eq!(extract(&doc, &beyond), None);
        }
    }
}
