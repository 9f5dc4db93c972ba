//! Encoding of step outputs.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes step outputs to bytes and back.
///
/// The engine never inspects the encoded bytes; all it requires is that
/// `decode(encode(v))` round-trips for every value a procedure passes to or
/// expects back from a step. The codec is not versioned by the engine:
/// changing a result type between deployments is the caller's problem.
pub trait Codec: Send + Sync + 'static {
  fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>>;

  fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

/// The default codec: structured JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
  fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
  }

  fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct User {
    id: i64,
    name: String,
  }

  #[test]
  fn test_round_trip() {
    let codec = JsonCodec;
    let user = User {
      id: 123,
      name: "Test User".to_string(),
    };

    let bytes = codec.encode(&user).unwrap();
    let decoded: User = codec.decode(&bytes).unwrap();
    assert_eq!(decoded, user);
  }

  #[test]
  fn test_decode_rejects_garbage() {
    let codec = JsonCodec;
    let result: anyhow::Result<User> = codec.decode(b"not json");
    assert!(result.is_err());
  }
}
