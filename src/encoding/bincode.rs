use super::EncodingError;
use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| map_decode_error(*e))
}

fn map_decode_error(e: bincode::ErrorKind) -> crate::Error {
    match e {
        bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            EncodingError::TruncatedData.into()
        }
        other => EncodingError::InvalidFormat(format!("Deserialization failed: {}", other)).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let serialized = serialize(&original).unwrap();
        let deserialized: TestStruct = deserialize(&serialized).unwrap();

        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_truncated_data() {
        let serialized = serialize(&"a longer string".to_string()).unwrap();
        let result: Result<String> = deserialize(&serialized[..4]);
        match result {
            Err(crate::Error::Corrupted(msg)) => assert!(msg.contains("Truncated")),
            other => panic!("Expected truncated data error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_data() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = deserialize(&invalid_data);
        assert!(result.is_err());
    }
}
