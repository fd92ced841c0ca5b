use core::fmt;

use crate::{Error, Result, WorkerIdentity};

/// Bit partition of a 64-bit Snowflake ID.
///
/// The sign bit is always left clear, so the widths may add up to at most 63.
/// The default is the Twitter layout with the 10 machine bits split into a
/// datacenter and a worker half:
///
/// ```text
///  Bit Index:  63      62            22 21        17 16        12 11         0
///              +-------+----------------+------------+------------+------------+
///  Field:      | 0 (1) | timestamp (41) | datacenter | worker (5) | seq (12)   |
///              +-------+----------------+------------+------------+------------+
/// ```
///
/// 41 timestamp bits cover roughly 69 years of milliseconds past the epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    timestamp_bits: u8,
    datacenter_bits: u8,
    worker_bits: u8,
    sequence_bits: u8,
}

impl Default for Layout {
    fn default() -> Self {
        Self::TWITTER
    }
}

impl Layout {
    /// 41 bits timestamp, 5 bits datacenter, 5 bits worker, 12 bits sequence.
    pub const TWITTER: Self = Self {
        timestamp_bits: 41,
        datacenter_bits: 5,
        worker_bits: 5,
        sequence_bits: 12,
    };

    /// Builds a custom layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the widths add up to more than 63
    /// bits or the timestamp or sequence field is empty.
    pub fn new(
        timestamp_bits: u8,
        datacenter_bits: u8,
        worker_bits: u8,
        sequence_bits: u8,
    ) -> Result<Self> {
        let total = u32::from(timestamp_bits)
            + u32::from(datacenter_bits)
            + u32::from(worker_bits)
            + u32::from(sequence_bits);
        if total > 63 {
            return Err(Error::invalid_config(format!(
                "layout uses {total} bits, at most 63 are available"
            )));
        }
        if timestamp_bits == 0 || sequence_bits == 0 {
            return Err(Error::invalid_config(
                "timestamp and sequence fields need at least one bit",
            ));
        }
        Ok(Self {
            timestamp_bits,
            datacenter_bits,
            worker_bits,
            sequence_bits,
        })
    }

    pub const fn timestamp_bits(&self) -> u8 {
        self.timestamp_bits
    }

    pub const fn datacenter_bits(&self) -> u8 {
        self.datacenter_bits
    }

    pub const fn worker_bits(&self) -> u8 {
        self.worker_bits
    }

    pub const fn sequence_bits(&self) -> u8 {
        self.sequence_bits
    }

    pub const fn max_timestamp(&self) -> u64 {
        mask(self.timestamp_bits)
    }

    pub const fn max_datacenter_id(&self) -> u64 {
        mask(self.datacenter_bits)
    }

    pub const fn max_worker_id(&self) -> u64 {
        mask(self.worker_bits)
    }

    pub const fn max_sequence(&self) -> u64 {
        mask(self.sequence_bits)
    }

    const fn worker_shift(&self) -> u8 {
        self.sequence_bits
    }

    const fn datacenter_shift(&self) -> u8 {
        self.sequence_bits + self.worker_bits
    }

    const fn timestamp_shift(&self) -> u8 {
        self.sequence_bits + self.worker_bits + self.datacenter_bits
    }

    /// Packs the components into a raw ID. Each component is masked to its
    /// field, so callers must validate ranges beforehand.
    pub const fn pack(&self, timestamp: u64, identity: WorkerIdentity, sequence: u64) -> u64 {
        ((timestamp & self.max_timestamp()) << self.timestamp_shift())
            | ((identity.datacenter_id() & self.max_datacenter_id()) << self.datacenter_shift())
            | ((identity.worker_id() & self.max_worker_id()) << self.worker_shift())
            | (sequence & self.max_sequence())
    }

    pub const fn timestamp(&self, raw: u64) -> u64 {
        (raw >> self.timestamp_shift()) & self.max_timestamp()
    }

    pub const fn datacenter_id(&self, raw: u64) -> u64 {
        (raw >> self.datacenter_shift()) & self.max_datacenter_id()
    }

    pub const fn worker_id(&self, raw: u64) -> u64 {
        (raw >> self.worker_shift()) & self.max_worker_id()
    }

    pub const fn sequence(&self, raw: u64) -> u64 {
        raw & self.max_sequence()
    }
}

const fn mask(bits: u8) -> u64 {
    if bits == 0 { 0 } else { u64::MAX >> (64 - bits as u32) }
}

/// A packed 64-bit Snowflake ID.
///
/// The ID does not carry its layout; decode it with the [`Layout`] that
/// produced it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnowflakeId {
    id: u64,
}

impl SnowflakeId {
    pub const fn from_raw(id: u64) -> Self {
        Self { id }
    }

    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    /// Splits the ID into its fields.
    pub const fn decode(&self, layout: &Layout) -> IdParts {
        IdParts {
            timestamp: layout.timestamp(self.id),
            datacenter_id: layout.datacenter_id(self.id),
            worker_id: layout.worker_id(self.id),
            sequence: layout.sequence(self.id),
        }
    }

    /// Wall-clock time the ID was issued at, in milliseconds since the Unix
    /// epoch.
    pub const fn unix_millis(&self, layout: &Layout, epoch_millis: u64) -> u64 {
        layout.timestamp(self.id) + epoch_millis
    }
}

impl From<SnowflakeId> for u64 {
    fn from(id: SnowflakeId) -> Self {
        id.id
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeId")
            .field("id", &format_args!("{:#018x}", self.id))
            .finish()
    }
}

/// Fields of a decoded [`SnowflakeId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IdParts {
    /// Milliseconds since the generator's epoch.
    pub timestamp: u64,
    pub datacenter_id: u64,
    pub worker_id: u64,
    pub sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twitter_layout_masks() {
        let layout = Layout::TWITTER;
        assert_eq!(layout.max_timestamp(), (1 << 41) - 1);
        assert_eq!(layout.max_datacenter_id(), 31);
        assert_eq!(layout.max_worker_id(), 31);
        assert_eq!(layout.max_sequence(), 4095);
    }

    #[test]
    fn pack_places_fields_at_expected_bits() {
        let layout = Layout::TWITTER;
        let identity = WorkerIdentity::new(2, 3, &layout).unwrap();
        let raw = layout.pack(5, identity, 7);

        assert_eq!(raw, (5 << 22) | (2 << 17) | (3 << 12) | 7);
        let parts = SnowflakeId::from_raw(raw).decode(&layout);
        assert_eq!(
            parts,
            IdParts {
                timestamp: 5,
                datacenter_id: 2,
                worker_id: 3,
                sequence: 7,
            }
        );
    }

    #[test]
    fn sign_bit_stays_clear() {
        let layout = Layout::TWITTER;
        let identity = WorkerIdentity::new(31, 31, &layout).unwrap();
        let raw = layout.pack(layout.max_timestamp(), identity, layout.max_sequence());
        assert_eq!(raw >> 63, 0);
        assert_eq!(raw, i64::MAX as u64);
    }

    #[test]
    fn rejects_oversized_layout() {
        assert!(matches!(
            Layout::new(42, 5, 5, 12),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(Layout::new(41, 0, 10, 12).is_ok());
        assert!(Layout::new(41, 5, 5, 0).is_err());
    }

    #[test]
    fn custom_layout_round_trips_fields() {
        let layout = Layout::new(39, 3, 7, 14).unwrap();
        let identity = WorkerIdentity::new(6, 100, &layout).unwrap();
        let parts = SnowflakeId::from_raw(layout.pack(123_456, identity, 9_999)).decode(&layout);
        assert_eq!(parts.timestamp, 123_456);
        assert_eq!(parts.datacenter_id, 6);
        assert_eq!(parts.worker_id, 100);
        assert_eq!(parts.sequence, 9_999);
    }
}
