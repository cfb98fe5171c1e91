//! # Wire Encoding Helpers
//!
//! Byte payloads travel inside JSON frames as standard base64 strings.

/// Serde adapter for `Vec<u8>` fields encoded as base64 strings.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<Vec<u8>>` fields encoded as base64 strings.
pub mod base64_bytes_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Frame {
        #[serde(with = "super::base64_bytes")]
        body: Vec<u8>,
        #[serde(default, with = "super::base64_bytes_opt")]
        tail: Option<Vec<u8>>,
    }

    #[test]
    fn test_bytes_are_base64_strings() {
        let frame = Frame {
            body: b"hello".to_vec(),
            tail: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["body"], "aGVsbG8=");
        assert!(json["tail"].is_null());
    }

    #[test]
    fn test_missing_optional_bytes() {
        let frame: Frame = serde_json::from_str(r#"{"body": ""}"#).unwrap();
        assert!(frame.body.is_empty());
        assert_eq!(frame.tail, None);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = serde_json::from_str::<Frame>(r#"{"body": "%%%"}"#);
        assert!(result.is_err());
    }
}
