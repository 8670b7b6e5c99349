// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf as SerdeByteBuf, Bytes as SerdeBytes};

use crate::checksum::{Checksum, ChecksumError};

/// Helper method for `serde` to serialize bytes into a hex string when using a human readable
/// encoding (JSON), otherwise it serializes the bytes directly (CBOR).
pub fn serialize_hex<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        hex::serde::serialize(value, serializer)
    } else {
        SerdeBytes::new(value).serialize(serializer)
    }
}

/// Helper method for `serde` to deserialize from a hex string into bytes when using a human
/// readable encoding (JSON), otherwise it deserializes the bytes directly (CBOR).
pub fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        hex::serde::deserialize(deserializer)
    } else {
        let bytes = <SerdeByteBuf>::deserialize(deserializer)?;
        Ok(bytes.to_vec())
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;

        bytes
            .as_slice()
            .try_into()
            .map_err(|err: ChecksumError| serde::de::Error::custom(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::Checksum;

    #[test]
    fn human_readable_encodes_as_hex() {
        let checksum = Checksum::new(b"drifting");
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, format!("\"{}\"", checksum.to_hex()));

        let decoded: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, checksum);
    }

    #[test]
    fn cbor_round_trip() {
        let checksum = Checksum::new(b"drifting");
        let bytes = crate::to_canonical_bytes(&checksum);
        let decoded: Checksum = ciborium::de::from_reader(&bytes[..]).unwrap();
        assert_eq!(decoded, checksum);
    }
}
