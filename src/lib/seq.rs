use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Custom epoch (2024-01-01T00:00:00Z) expressed in milliseconds.
const EPOCH_MILLIS: u64 = 1_704_067_200_000;
const SEQUENCE_BITS: u8 = 22;
const MAX_SEQUENCE: u32 = (1 << SEQUENCE_BITS) - 1;

/// Hands out strictly increasing change sequence numbers.
///
/// The high bits carry milliseconds since [`EPOCH_MILLIS`], the low bits a
/// per-millisecond counter. A generator seeded with [`SeqGenerator::resume`]
/// never issues a value at or below the seed, so sequences keep growing
/// across restarts even if the wall clock went backwards.
#[derive(Debug)]
pub struct SeqGenerator {
    last_timestamp: u64,
    sequence: u32,
}

impl Default for SeqGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqGenerator {
    pub fn new() -> Self {
        Self {
            last_timestamp: 0,
            sequence: 0,
        }
    }

    pub fn resume(last: ChangeSeq) -> Self {
        Self {
            last_timestamp: last.0 >> SEQUENCE_BITS,
            sequence: (last.0 as u32) & MAX_SEQUENCE,
        }
    }

    pub fn next_seq(&mut self) -> ChangeSeq {
        let mut elapsed = current_millis().saturating_sub(EPOCH_MILLIS);
        if elapsed <= self.last_timestamp {
            elapsed = self.last_timestamp;
            self.sequence = (self.sequence + 1) & MAX_SEQUENCE;
            if self.sequence == 0 {
                // Counter exhausted for this millisecond; borrow the next one.
                elapsed = self.last_timestamp + 1;
            }
        } else {
            self.sequence = 0;
        }

        self.last_timestamp = elapsed;
        ChangeSeq((elapsed << SEQUENCE_BITS) | self.sequence as u64)
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(EPOCH_MILLIS)
}

#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeSeq(u64);

impl ChangeSeq {
    pub const ZERO: ChangeSeq = ChangeSeq(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ChangeSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ChangeSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChangeSeq").field(&self.0).finish()
    }
}

impl FromStr for ChangeSeq {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(ChangeSeq)
    }
}

impl Serialize for ChangeSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ChangeSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(ChangeSeq)
    }
}
