// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Size of BLAKE3 checksums.
pub const CHECKSUM_LEN: usize = blake3::KEY_LEN;

/// 32-byte BLAKE3 checksum over canonical CBOR bytes.
///
/// Guards operation content, log entries and materialized snapshots against
/// corruption in transit. A mismatch on receive is an integrity violation and
/// quarantines the sending peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(blake3::Hash);

impl Checksum {
    /// Calculate the checksum of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(buf.as_ref()))
    }

    /// Create a `Checksum` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Bytes of the checksum.
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        self.0.as_bytes()
    }

    /// Convert the checksum to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl AsRef<[u8]> for Checksum {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; CHECKSUM_LEN]> for Checksum {
    fn from(value: [u8; CHECKSUM_LEN]) -> Self {
        Self(blake3::Hash::from(value))
    }
}

impl From<Checksum> for [u8; CHECKSUM_LEN] {
    fn from(value: Checksum) -> Self {
        *value.as_bytes()
    }
}

impl TryFrom<&[u8]> for Checksum {
    type Error = ChecksumError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let value_len = value.len();

        let checked_value: [u8; CHECKSUM_LEN] = value
            .try_into()
            .map_err(|_| ChecksumError::InvalidLength(value_len, CHECKSUM_LEN))?;

        Ok(Self(blake3::Hash::from(checked_value)))
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(hex::decode(value)?.as_slice())
    }
}

impl PartialOrd for Checksum {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Checksum {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checksum").field(&self.to_hex()).finish()
    }
}

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("invalid checksum length {0}, expected {1}")]
    InvalidLength(usize, usize),

    #[error("invalid hex encoding in checksum string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::Checksum;

    #[test]
    fn deterministic_for_identical_input() {
        let checksum_1 = Checksum::new(b"drifting");
        let checksum_2 = Checksum::new(b"drifting");
        assert_eq!(checksum_1, checksum_2);

        let checksum_3 = Checksum::new(b"drifted");
        assert_ne!(checksum_1, checksum_3);
    }

    #[test]
    fn hex_round_trip() {
        let checksum = Checksum::new(b"drifting");
        let hex = checksum.to_hex();
        assert_eq!(Checksum::from_str(&hex).unwrap(), checksum);
    }

    #[test]
    fn invalid_byte_slice() {
        assert!(Checksum::try_from([0u8; 12].as_slice()).is_err());
    }
}
