use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::{Read, Write};

pub const HASH_SIZE: usize = 20;

/// 160-bit content identifier, used for chunk ids and peer ids alike.
///
/// The all-zero value is reserved as the "null" id (unknown chunk hash, unset peer); a real
/// content id is never all-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_SIZE]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    InvalidLength { expected: usize, actual: usize },
    InvalidFormat(String),
}

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength { expected, actual } => {
                write!(f, "invalid content id length: expected {expected} bytes, got {actual}")
            }
            Self::InvalidFormat(msg) => write!(f, "invalid content id hex: {msg}"),
        }
    }
}

impl std::error::Error for HashError {}

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn null() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: HASH_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        if s.len() != HASH_SIZE * 2 {
            return Err(HashError::InvalidFormat(format!(
                "expected {} hex chars, got {}",
                HASH_SIZE * 2,
                s.len()
            )));
        }
        let raw = s.as_bytes();
        let mut out = [0u8; HASH_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            let hi = hex_val(raw[i * 2]);
            let lo = hex_val(raw[i * 2 + 1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => *b = (hi << 4) | lo,
                _ => {
                    return Err(HashError::InvalidFormat(format!(
                        "non-hex character near offset {}",
                        i * 2
                    )));
                }
            }
        }
        Ok(Self(out))
    }

    /// Random non-null id. Used for ephemeral ids and in tests.
    pub fn random() -> anyhow::Result<Self> {
        loop {
            let mut b = [0u8; HASH_SIZE];
            getrandom::getrandom(&mut b)
                .map_err(|e| anyhow::anyhow!("failed to generate random hash: {e}"))?;
            let h = Self(b);
            if !h.is_null() {
                return Ok(h);
            }
        }
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(HASH_SIZE * 2);
        for b in self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }

    /// Writes the id as a fixed-width 20 byte field.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.0)
    }

    /// Reads a fixed-width 20 byte field. A short read is an `UnexpectedEof` error.
    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut b = [0u8; HASH_SIZE];
        r.read_exact(&mut b)?;
        Ok(Self(b))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(value: [u8; HASH_SIZE]) -> Self {
        Self(value)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF_BYTES: [u8; HASH_SIZE] = [
        0x2d, 0x73, 0x73, 0x6f, 0x34, 0xa7, 0x38, 0x37, 0xd4, 0x22, 0xf7, 0xab, 0xa2, 0x74, 0x0d,
        0x84, 0x09, 0xac, 0x60, 0xdf,
    ];
    const REF_HEX: &str = "2d73736f34a73837d422f7aba2740d8409ac60df";

    #[test]
    fn builds_from_bytes_and_hex() {
        let a = Hash::from_bytes(&REF_BYTES).expect("bytes");
        let b = Hash::from_hex(REF_HEX).expect("hex");
        assert_eq!(a, b);
        assert_eq!(a.to_hex(), REF_HEX);
        assert_eq!(a.to_string(), REF_HEX);
        assert_eq!(b.to_bytes(), REF_BYTES);
    }

    #[test]
    fn uppercase_hex_is_accepted_and_canonicalized() {
        let h = Hash::from_hex(&REF_HEX.to_uppercase()).expect("hex");
        assert_eq!(h.to_hex(), REF_HEX);
    }

    #[test]
    fn rejects_wrong_length_bytes() {
        let err = Hash::from_bytes(&REF_BYTES[..19]).expect_err("short");
        assert_eq!(
            err,
            HashError::InvalidLength {
                expected: 20,
                actual: 19
            }
        );
        assert!(Hash::from_bytes(&[0u8; 21]).is_err());
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            Hash::from_hex("abc"),
            Err(HashError::InvalidFormat(_))
        ));
        let mut bad = REF_HEX.to_string();
        bad.replace_range(10..11, "z");
        assert!(matches!(
            Hash::from_hex(&bad),
            Err(HashError::InvalidFormat(_))
        ));
        assert!("".parse::<Hash>().is_err());
    }

    #[test]
    fn null_is_default_and_distinct_from_random() {
        assert!(Hash::null().is_null());
        assert_eq!(Hash::default(), Hash::null());
        let r = Hash::random().expect("random");
        assert!(!r.is_null());
        assert_ne!(r, Hash::null());
    }

    #[test]
    fn round_trips_for_random_buffers() {
        for _ in 0..64 {
            let mut b = [0u8; HASH_SIZE];
            getrandom::getrandom(&mut b).expect("rand");
            let h = Hash::from_bytes(&b).expect("bytes");
            assert_eq!(h.to_bytes(), b);
            assert_eq!(Hash::from_hex(&h.to_hex()).expect("hex"), h);
            assert_eq!(Hash::from_hex(&h.to_hex()).expect("hex").to_hex(), h.to_hex());
        }
    }

    #[test]
    fn fixed_width_field_round_trips() {
        let h = Hash::new(REF_BYTES);
        let mut buf = Vec::new();
        h.write_to(&mut buf).expect("write");
        assert_eq!(buf.len(), HASH_SIZE);
        let back = Hash::read_from(&mut buf.as_slice()).expect("read");
        assert_eq!(back, h);

        let short = [1u8; 5];
        let err = Hash::read_from(&mut short.as_slice()).expect_err("short");
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn serde_uses_hex_string() {
        let h = Hash::new(REF_BYTES);
        let json = serde_json::to_string(&h).expect("ser");
        assert_eq!(json, format!("\"{REF_HEX}\""));
        let back: Hash = serde_json::from_str(&json).expect("de");
        assert_eq!(back, h);
        assert!(serde_json::from_str::<Hash>("\"nothex\"").is_err());
    }

    #[test]
    fn copies_are_equal_and_independent() {
        let a = Hash::new(REF_BYTES);
        let mut b = a;
        assert_eq!(a, b);
        b = Hash::new([7u8; HASH_SIZE]);
        assert_ne!(a, b);
        assert_eq!(a.to_hex(), REF_HEX);
    }
}
