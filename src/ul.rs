//! Universal Label (UL) types and key predicates.
//!
//! Universal Labels are the 16-byte keys of every KLV triplet in an MXF
//! file. The essence reader dispatches on a small set of key families;
//! version bytes are ignored where the registries allow them to vary.

use std::fmt;

/// A raw 16-byte Universal Label
pub type UL = [u8; 16];

/// The all-zero key, never produced by a real file.
pub const NULL_KEY: UniversalLabel = UniversalLabel([0; 16]);

/// Universal Label wrapper with the predicates the reader dispatches on
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniversalLabel(pub UL);

impl UniversalLabel {
    /// Create from raw bytes
    pub fn new(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &UL {
        &self.0
    }

    /// Check if this is a SMPTE-registered label (starts with 06 0E 2B 34)
    pub fn is_smpte(&self) -> bool {
        self.0[0..4] == labels::SMPTE_PREFIX
    }

    /// Check if this is a partition pack (header, body or footer)
    pub fn is_partition_pack(&self) -> bool {
        self.0[0..13] == labels::PARTITION_PACK_PREFIX
            && (0x02..=0x04).contains(&self.0[13])
    }

    /// Check if this is a footer partition pack
    pub fn is_footer_partition_pack(&self) -> bool {
        self.0[0..13] == labels::PARTITION_PACK_PREFIX && self.0[13] == 0x04
    }

    /// Check if this key opens a header metadata block.
    ///
    /// Header metadata is recognised at its primer pack; the partition's
    /// HeaderByteCount covers the sets that follow, so the walkers never
    /// dispatch on the individual sets.
    pub fn is_header_metadata(&self) -> bool {
        self.0[0..13] == labels::PARTITION_PACK_PREFIX && self.0[13] == 0x05
    }

    /// Check if this is an index table segment
    pub fn is_index_table_segment(&self) -> bool {
        self.0[0..7] == labels::INDEX_TABLE_SEGMENT[0..7]
            && self.0[8..15] == labels::INDEX_TABLE_SEGMENT[8..15]
    }

    /// Check if this is a KLV fill item
    pub fn is_fill_item(&self) -> bool {
        self.0[0..7] == labels::FILL_ITEM[0..7] && self.0[8..13] == labels::FILL_ITEM[8..13]
    }

    /// Check if this is a generic container item (essence element or
    /// system item within a content package)
    pub fn is_gc_essence_element(&self) -> bool {
        self.0[0..7] == labels::GC_ELEMENT_PREFIX && self.0[8..12] == [0x0D, 0x01, 0x03, 0x01]
    }

    /// Check if this is an Avid private essence element
    pub fn is_avid_essence_element(&self) -> bool {
        self.0[0..12] == labels::AVID_ELEMENT_PREFIX
    }

    /// Check if this is a generic container system item
    pub fn is_system_item(&self) -> bool {
        self.is_gc_essence_element() && (self.0[12] == 0x04 || self.0[12] == 0x14)
    }

    /// Check if this is the random index pack
    pub fn is_random_index_pack(&self) -> bool {
        self.0[0..7] == labels::RANDOM_INDEX_PACK[0..7]
            && self.0[8..] == labels::RANDOM_INDEX_PACK[8..]
    }

    /// Track number of an essence element key (bytes 12..16, big-endian)
    pub fn track_number(&self) -> u32 {
        u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]])
    }
}

impl fmt::Debug for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UL(")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                write!(f, ".")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for UniversalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<UL> for UniversalLabel {
    fn from(bytes: UL) -> Self {
        UniversalLabel(bytes)
    }
}

/// Well-known Universal Labels
pub mod labels {
    use super::UL;

    /// SMPTE label prefix
    pub const SMPTE_PREFIX: [u8; 4] = [0x06, 0x0E, 0x2B, 0x34];

    /// Common prefix of all partition packs and the primer pack (13 bytes)
    pub const PARTITION_PACK_PREFIX: [u8; 13] = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01,
    ];

    /// Generic container item prefix (bytes 0..7; byte 7 is a version)
    pub const GC_ELEMENT_PREFIX: [u8; 7] = [0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01];

    /// Avid private essence element prefix (bytes 0..12)
    pub const AVID_ELEMENT_PREFIX: [u8; 12] = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0E, 0x04, 0x03, 0x01,
    ];

    /// Header partition - closed complete
    pub const HEADER_PARTITION_CLOSED_COMPLETE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x02, 0x04,
        0x00,
    ];

    /// Header partition - open incomplete
    pub const HEADER_PARTITION_OPEN_INCOMPLETE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x02, 0x01,
        0x00,
    ];

    /// Body partition - closed complete
    pub const BODY_PARTITION_CLOSED_COMPLETE: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x03, 0x04,
        0x00,
    ];

    /// Footer partition
    pub const FOOTER_PARTITION: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x04, 0x04,
        0x00,
    ];

    /// Primer pack
    pub const PRIMER_PACK: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x05, 0x01,
        0x00,
    ];

    /// Fill item
    pub const FILL_ITEM: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x01, 0x01, 0x01, 0x02, 0x03, 0x01, 0x02, 0x10, 0x01, 0x00, 0x00,
        0x00,
    ];

    /// Index table segment
    pub const INDEX_TABLE_SEGMENT: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x53, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x10, 0x01,
        0x00,
    ];

    /// Random index pack
    pub const RANDOM_INDEX_PACK: UL = [
        0x06, 0x0E, 0x2B, 0x34, 0x02, 0x05, 0x01, 0x01, 0x0D, 0x01, 0x02, 0x01, 0x01, 0x11, 0x01,
        0x00,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    /// GC picture element key with the given track number
    fn gc_element(track_number: u32) -> UniversalLabel {
        let mut key = [
            0x06, 0x0E, 0x2B, 0x34, 0x01, 0x02, 0x01, 0x01, 0x0D, 0x01, 0x03, 0x01, 0, 0, 0, 0,
        ];
        key[12..16].copy_from_slice(&track_number.to_be_bytes());
        UniversalLabel(key)
    }

    #[test]
    fn test_partition_predicates() {
        let header = UniversalLabel(labels::HEADER_PARTITION_CLOSED_COMPLETE);
        assert!(header.is_partition_pack());
        assert!(!header.is_footer_partition_pack());
        assert!(!header.is_header_metadata());

        let footer = UniversalLabel(labels::FOOTER_PARTITION);
        assert!(footer.is_partition_pack());
        assert!(footer.is_footer_partition_pack());

        let primer = UniversalLabel(labels::PRIMER_PACK);
        assert!(!primer.is_partition_pack());
        assert!(primer.is_header_metadata());
    }

    #[test]
    fn test_essence_element() {
        let key = gc_element(0x15011500);
        assert!(key.is_gc_essence_element());
        assert!(!key.is_system_item());
        assert!(!key.is_partition_pack());
        assert_eq!(key.track_number(), 0x15011500);

        let system = gc_element(0x04010100);
        assert!(system.is_gc_essence_element());
        assert!(system.is_system_item());
    }

    #[test]
    fn test_fill_and_rip() {
        let fill = UniversalLabel(labels::FILL_ITEM);
        assert!(fill.is_fill_item());
        assert!(!fill.is_gc_essence_element());

        // version byte differences are tolerated
        let mut fill2 = labels::FILL_ITEM;
        fill2[7] = 0x01;
        assert!(UniversalLabel(fill2).is_fill_item());

        let rip = UniversalLabel(labels::RANDOM_INDEX_PACK);
        assert!(rip.is_random_index_pack());
        assert!(!rip.is_partition_pack());
    }

    #[test]
    fn test_index_table_segment() {
        let seg = UniversalLabel(labels::INDEX_TABLE_SEGMENT);
        assert!(seg.is_index_table_segment());
        assert!(!seg.is_header_metadata());
    }

    #[test]
    fn test_null_key() {
        assert_eq!(NULL_KEY, UniversalLabel([0; 16]));
        assert!(!NULL_KEY.is_smpte());
    }
}
