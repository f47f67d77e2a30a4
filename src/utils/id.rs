//! Ids arrive from the API either as JSON strings or as bare numbers (snowflakes). Both are
//! normalised to `String` here.

use serde::{de, Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Unsigned(u64),
    Signed(i64),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            StringOrNumber::String(s) => s,
            StringOrNumber::Unsigned(n) => n.to_string(),
            StringOrNumber::Signed(n) => n.to_string(),
        }
    }
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer).map(StringOrNumber::into_string)
}

pub(crate) fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(value
        .map(StringOrNumber::into_string)
        .filter(|s| !s.is_empty()))
}

pub(crate) fn u64_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.parse::<u64>().map_err(de::Error::custom),
        StringOrNumber::Unsigned(n) => Ok(n),
        StringOrNumber::Signed(n) => u64::try_from(n).map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "string_or_number")]
        id: String,
        #[serde(default, deserialize_with = "optional_string_or_number")]
        parent: Option<String>,
        #[serde(default, deserialize_with = "u64_from_string_or_number")]
        bits: u64,
    }

    #[test]
    fn test_numbers_and_strings_are_accepted() {
        let a: Sample = serde_json::from_str(r#"{"id": 42, "parent": "7", "bits": "3145728"}"#).unwrap();
        assert_eq!(a.id, "42");
        assert_eq!(a.parent.as_deref(), Some("7"));
        assert_eq!(a.bits, 3145728);

        let b: Sample = serde_json::from_str(r#"{"id": "abc", "parent": null, "bits": 5}"#).unwrap();
        assert_eq!(b.id, "abc");
        assert_eq!(b.parent, None);
        assert_eq!(b.bits, 5);
    }

    #[test]
    fn test_empty_optional_id_is_none() {
        let s: Sample = serde_json::from_str(r#"{"id": 1, "parent": ""}"#).unwrap();
        assert_eq!(s.parent, None);
        assert_eq!(s.bits, 0);
    }
}
