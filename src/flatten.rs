//! Turning nested JSON documents into flat key/scalar pairs for records

use serde_json::Value;

/// Scalars of a JSON document keyed by their dotted path, in document order.
///
/// Object members join with `.`, array elements use their index:
/// `{"user": {"tags": ["a"]}}` gives `user.tags.0 = "a"`. An empty nested
/// object or array keeps its key with a null value so the field is not lost.
pub fn scalar_paths(document: &Value) -> Vec<(String, &Value)> {
    let mut pairs = Vec::new();
    collect(document, &mut String::new(), &mut pairs);
    pairs
}

fn collect<'v>(value: &'v Value, path: &mut String, pairs: &mut Vec<(String, &'v Value)>) {
    let base = path.len();
    match value {
        Value::Object(members) if !members.is_empty() => {
            for (key, member) in members {
                push_segment(path, base, key);
                collect(member, path, pairs);
            }
        }
        Value::Array(elements) if !elements.is_empty() => {
            for (index, element) in elements.iter().enumerate() {
                push_segment(path, base, &index.to_string());
                collect(element, path, pairs);
            }
        }
        Value::Object(_) | Value::Array(_) => {
            if !path.is_empty() {
                pairs.push((path.clone(), &Value::Null));
            }
        }
        scalar => pairs.push((path.clone(), scalar)),
    }
    path.truncate(base);
}

fn push_segment(path: &mut String, base: usize, segment: &str) {
    path.truncate(base);
    if base > 0 {
        path.push('.');
    }
    path.push_str(segment);
}
