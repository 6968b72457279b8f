use std::fmt;
use std::str::FromStr;

pub use bag_id::BagId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Piece size used when the caller does not pick one (128 KiB).
pub const DEFAULT_PIECE_SIZE: u32 = 128 * 1024;
/// Upper bound on a single piece.
pub const MAX_PIECE_SIZE: u32 = 8 * 1024 * 1024;
/// Upper bound on the number of pieces a bag may advertise.
pub const MAX_PIECES: u64 = 1 << 22;
/// Upper bound on a bag description.
pub const MAX_DESCRIPTION_LEN: usize = 1024;

mod bag_id {
    use serde::de::{self, Visitor};
    use serde::ser::{Serialize, Serializer};
    use serde::{Deserialize, Deserializer};
    use std::fmt;

    /// A bag identity: the 32-byte Merkle root over the piece tree of the
    /// bag's content. Recomputing it from identical content always yields
    /// the same value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BagId(pub [u8; 32]);

    struct BagIdVisitor;

    impl Serialize for BagId {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_bytes(&self.0)
        }
    }

    impl<'de> Visitor<'de> for BagIdVisitor {
        type Value = BagId;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("exactly 32 bytes")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let bytes: [u8; 32] = v
                .try_into()
                .map_err(|_| de::Error::custom(format!("expected 32 bytes, got {}", v.len())))?;
            Ok(BagId(bytes))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut bytes = [0u8; 32];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom(format!("expected 32 bytes, got {i}")))?;
            }
            Ok(BagId(bytes))
        }
    }

    impl<'de> Deserialize<'de> for BagId {
        fn deserialize<D>(deserializer: D) -> Result<BagId, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(BagIdVisitor)
        }
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for BagId {
    type Err = BagIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| BagIdError::InvalidLength(v.len()))?;
        Ok(BagId(bytes))
    }
}

/// Rejected locally before anything reaches the engine.
#[derive(Debug, Error)]
pub enum BagIdError {
    #[error("a bag id must be 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("a bag id must be hex encoded: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Immutable metadata of a bag. Set exactly once per torrent, either at
/// creation time or when a verified header response arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagInfo {
    /// Total content length in bytes, header region included.
    pub file_size: u64,
    /// Length of the leading header region encoding directory metadata.
    pub header_size: u64,
    /// Size of every piece except possibly the last.
    pub piece_size: u32,
    pub description: String,
}

impl BagInfo {
    pub fn piece_count(&self) -> u32 {
        self.file_size.div_ceil(self.piece_size as u64) as u32
    }

    /// Length of piece `index`; the last piece may be shorter.
    pub fn piece_len(&self, index: u32) -> u32 {
        let remainder = self.file_size % self.piece_size as u64;
        if index == self.piece_count() - 1 && remainder != 0 {
            remainder as u32
        } else {
            self.piece_size
        }
    }

    /// Payload bytes, i.e. everything past the header region.
    pub fn total_payload(&self) -> u64 {
        self.file_size - self.header_size
    }

    /// Payload bytes covered by the verified pieces in `mask`: zero until
    /// the header region is covered, then piece bytes minus the header,
    /// capped at the full payload (the last piece may be short).
    pub fn downloaded_bytes(&self, mask: &PieceMask) -> u64 {
        let covered = mask.count_set() as u64 * self.piece_size as u64;
        if covered < self.header_size {
            return 0;
        }
        (covered - self.header_size).min(self.total_payload())
    }

    /// Sanity bounds enforced before info coming off the wire is accepted.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.piece_size == 0 || self.piece_size > MAX_PIECE_SIZE {
            return Err("piece size out of range");
        }
        if self.file_size == 0 {
            return Err("empty bag");
        }
        if self.header_size > self.file_size {
            return Err("header larger than content");
        }
        if self.file_size.div_ceil(self.piece_size as u64) > MAX_PIECES {
            return Err("too many pieces");
        }
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err("description too long");
        }
        Ok(())
    }
}

/// Directory metadata serialized into the content's header region. It is
/// chunked into pieces like everything else, so it is covered by the same
/// Merkle tree that defines the BagId.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagHeader {
    pub description: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path, `/`-joined.
    pub name: String,
    pub size: u64,
}

impl BagHeader {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (header, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(header)
    }
}

/// Tracks which pieces have been fetched, verified and durably stored.
/// Bits only ever go from unset to set; the mask exists only once the
/// piece count is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceMask {
    #[serde(with = "serde_bytes")]
    bits: Vec<u8>,
    len: u32,
}

impl PieceMask {
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0; (len as usize).div_ceil(8)],
            len,
        }
    }

    /// Placeholder before the bag's info is known.
    pub fn empty() -> Self {
        Self::new(0)
    }

    pub fn full(len: u32) -> Self {
        let mut mask = Self::new(len);
        for i in 0..len {
            mask.set(i);
        }
        mask
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index as usize / 8] & (1 << (index % 8)) != 0
    }

    pub fn set(&mut self, index: u32) {
        assert!(index < self.len, "piece index {index} out of range");
        self.bits[index as usize / 8] |= 1 << (index % 8);
    }

    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.len > 0 && self.count_set() == self.len
    }

    /// Indices whose bit is still unset, lowest first.
    pub fn unset_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| !self.get(i))
    }
}
