//! 64-bit log offsets
//!
//! Offsets in the 0.7 protocol are byte positions in the broker log. On the
//! wire they are 8 raw big-endian bytes; in text they are 16 hex digits.
//! Arithmetic wraps modulo 2^64 like any fixed-width unsigned counter.

use std::fmt;
use std::str::FromStr;

use crate::error::KafkaClientError;

/// Position in a partition log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u64);

impl Offset {
    /// Sentinel asking the broker for the latest offset (-1L)
    pub const LATEST: Offset = Offset(u64::MAX);
    /// Sentinel asking the broker for the earliest offset (-2L)
    pub const EARLIEST: Offset = Offset(u64::MAX - 1);
    /// Wire size of an offset
    pub const SIZE: usize = 8;

    pub const fn new(value: u64) -> Self {
        Offset(value)
    }

    /// Parse up to 16 hex digits. An empty string is offset zero.
    pub fn from_hex(hex: &str) -> Result<Self, KafkaClientError> {
        if hex.len() > 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KafkaClientError::InvalidOffsetFormat {
                value: hex.to_string(),
            });
        }
        if hex.is_empty() {
            return Ok(Offset(0));
        }
        u64::from_str_radix(hex, 16)
            .map(Offset)
            .map_err(|_| KafkaClientError::InvalidOffsetFormat {
                value: hex.to_string(),
            })
    }

    /// Millisecond timestamp offset used by time-based offset requests.
    pub fn from_timestamp_secs(secs: u64) -> Self {
        Offset(secs.wrapping_mul(1000))
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Offset(u64::from_be_bytes(bytes))
    }

    /// Raw 8-byte big-endian wire form
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn add_int(&mut self, value: u64) -> &mut Self {
        self.0 = self.0.wrapping_add(value);
        self
    }

    pub fn sub_int(&mut self, value: u64) -> &mut Self {
        self.0 = self.0.wrapping_sub(value);
        self
    }

    pub fn add(&mut self, other: Offset) -> &mut Self {
        self.add_int(other.0)
    }

    pub fn sub(&mut self, other: Offset) -> &mut Self {
        self.sub_int(other.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Offset {
    type Err = KafkaClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Offset::from_hex(s)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Offset(value)
    }
}

/// Signed literals follow two's complement, so -1 and -2 land on the sentinels.
impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value as u64)
    }
}

impl From<Offset> for u64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_serialization_and_increment() {
        let mut offset = Offset::from_hex(&format!("{:x}", 65535)).unwrap();
        assert_eq!(offset.to_bytes(), [0, 0, 0, 0, 0, 0, 255, 255]);

        offset.add_int(65535);
        assert_eq!(offset.to_string(), "000000000001fffe");

        offset.add_int(4_294_836_225);
        assert_eq!(offset.to_string(), "00000000ffffffff");

        offset.add(Offset::from_hex("ffffffff00000000").unwrap());
        assert_eq!(offset.to_string(), "ffffffffffffffff");
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(Offset::LATEST.to_string(), "ffffffffffffffff");
        assert_eq!(Offset::EARLIEST.to_string(), "fffffffffffffffe");
        assert_eq!(Offset::from(-1i64), Offset::LATEST);
        assert_eq!(Offset::from(-2i64), Offset::EARLIEST);
        assert_eq!("ffffffffffffffff".parse::<Offset>().unwrap(), Offset::LATEST);
    }

    #[test]
    fn test_invalid_formats() {
        assert!(matches!(
            Offset::from_hex("10000000000000000"),
            Err(KafkaClientError::InvalidOffsetFormat { .. })
        ));
        assert!(matches!(
            Offset::from_hex("xyz"),
            Err(KafkaClientError::InvalidOffsetFormat { .. })
        ));
        for signed in ["+ff", "-1", " ff"] {
            assert!(matches!(
                Offset::from_hex(signed),
                Err(KafkaClientError::InvalidOffsetFormat { .. })
            ));
        }
        assert_eq!(Offset::from_hex("").unwrap(), Offset::default());
    }

    #[test]
    fn test_wrapping() {
        let mut offset = Offset::LATEST;
        offset.add_int(1);
        assert_eq!(offset, Offset::new(0));
        offset.sub_int(1);
        assert_eq!(offset, Offset::LATEST);
    }

    #[test]
    fn test_timestamp_offset() {
        assert_eq!(
            Offset::from_timestamp_secs(1_350_000_000),
            Offset::new(1_350_000_000_000)
        );
    }

    proptest! {
        #[test]
        fn prop_add_sub_round_trip(start in any::<u64>(), n in any::<u64>()) {
            let original = Offset::new(start);
            let mut offset = original;
            offset.add_int(n).sub_int(n);
            prop_assert_eq!(offset, original);
        }

        #[test]
        fn prop_matches_native_wrapping(a in any::<u64>(), b in any::<u64>()) {
            let mut sum = Offset::new(a);
            sum.add(Offset::new(b));
            prop_assert_eq!(sum.value(), a.wrapping_add(b));

            let mut diff = Offset::new(a);
            diff.sub(Offset::new(b));
            prop_assert_eq!(diff.value(), a.wrapping_sub(b));
        }

        #[test]
        fn prop_hex_and_bytes_agree(value in any::<u64>()) {
            let offset = Offset::new(value);
            prop_assert_eq!(offset.to_string().parse::<Offset>().unwrap(), offset);
            prop_assert_eq!(Offset::from_bytes(offset.to_bytes()), offset);
        }
    }
}
