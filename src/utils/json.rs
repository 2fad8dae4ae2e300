//! Lenient serde helpers for server payloads.

use serde::{Deserialize, Deserializer};

/// Reads an explicit `null` as the type's default.
///
/// `#[serde(default)]` only covers a missing key; pair the two on any
/// non-`Option` field the server may send as `null`.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, Deserialize)]
    struct Row {
        #[serde(default, deserialize_with = "null_as_default")]
        name: String,
        #[serde(default, deserialize_with = "null_as_default")]
        tags: Vec<String>,
    }

    #[test]
    fn null_and_missing_read_as_default() {
        let row: Row = serde_json::from_value(json!({ "name": null })).expect("row");
        assert!(row.name.is_empty());
        assert!(row.tags.is_empty());

        let row: Row = serde_json::from_value(json!({ "name": "a", "tags": ["x"] })).expect("row");
        assert_eq!(row.name, "a");
        assert_eq!(row.tags, vec!["x"]);
    }

    #[test]
    fn wrong_types_still_fail() {
        assert!(serde_json::from_value::<Row>(json!({ "name": 5 })).is_err());
    }
}
