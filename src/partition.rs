//! MXF partition packs.
//!
//! Every partition begins with a partition pack carrying the offsets and
//! stream identifiers the essence reader navigates by. The pack writers in
//! this module exist for test construction.

use crate::error::{EssenceError, Result};
use crate::klv::KEY_LEN;
use crate::ul::{labels, UniversalLabel};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Partition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Header,
    Body,
    Footer,
}

/// MXF partition pack
#[derive(Debug, Clone)]
pub struct Partition {
    /// Partition kind
    pub kind: PartitionKind,
    /// Major version (should be 1)
    pub major_version: u16,
    /// Minor version
    pub minor_version: u16,
    /// KAG size (key alignment grid)
    pub kag_size: u32,
    /// This partition's offset in the file
    pub this_partition: i64,
    /// Previous partition offset
    pub previous_partition: u64,
    /// Footer partition offset
    pub footer_partition: u64,
    /// Byte count of the header metadata following the pack
    pub header_byte_count: u64,
    /// Byte count of the index table segments
    pub index_byte_count: u64,
    /// Stream ID of the index table in this partition
    pub index_sid: u32,
    /// Declared cumulative essence offset at this partition's start
    pub body_offset: u64,
    /// Stream ID of the essence in this partition
    pub body_sid: u32,
    /// Operational pattern label
    pub operational_pattern: [u8; 16],
    /// Essence container labels
    pub essence_containers: Vec<[u8; 16]>,
}

impl Default for Partition {
    fn default() -> Self {
        Partition {
            kind: PartitionKind::Header,
            major_version: 1,
            minor_version: 3,
            kag_size: 1,
            this_partition: 0,
            previous_partition: 0,
            footer_partition: 0,
            header_byte_count: 0,
            index_byte_count: 0,
            index_sid: 0,
            body_offset: 0,
            body_sid: 0,
            operational_pattern: [0; 16],
            essence_containers: Vec::new(),
        }
    }
}

impl Partition {
    /// Create header partition
    pub fn header() -> Self {
        Partition {
            kind: PartitionKind::Header,
            ..Default::default()
        }
    }

    /// Create body partition
    pub fn body() -> Self {
        Partition {
            kind: PartitionKind::Body,
            ..Default::default()
        }
    }

    /// Create footer partition
    pub fn footer() -> Self {
        Partition {
            kind: PartitionKind::Footer,
            ..Default::default()
        }
    }

    /// True for footer partitions
    pub fn is_footer(&self) -> bool {
        self.kind == PartitionKind::Footer
    }

    /// Update the in-memory partition offset
    pub fn set_this_partition(&mut self, position: i64) {
        self.this_partition = position;
    }

    /// Parse a partition pack from its key and value bytes
    pub fn parse(key: &UniversalLabel, value: &[u8]) -> Result<Self> {
        let kind = match key.as_bytes()[13] {
            0x02 => PartitionKind::Header,
            0x03 => PartitionKind::Body,
            0x04 => PartitionKind::Footer,
            other => {
                return Err(EssenceError::Malformed(format!(
                    "unknown partition pack type 0x{:02x}",
                    other
                )))
            }
        };

        if value.len() < 88 {
            return Err(EssenceError::Malformed(format!(
                "partition pack value of {} bytes, need at least 88",
                value.len()
            )));
        }

        let mut cursor = Cursor::new(value);
        let major_version = cursor.read_u16::<BigEndian>()?;
        let minor_version = cursor.read_u16::<BigEndian>()?;
        let kag_size = cursor.read_u32::<BigEndian>()?;
        let this_partition = cursor.read_u64::<BigEndian>()? as i64;
        let previous_partition = cursor.read_u64::<BigEndian>()?;
        let footer_partition = cursor.read_u64::<BigEndian>()?;
        let header_byte_count = cursor.read_u64::<BigEndian>()?;
        let index_byte_count = cursor.read_u64::<BigEndian>()?;
        let index_sid = cursor.read_u32::<BigEndian>()?;
        let body_offset = cursor.read_u64::<BigEndian>()?;
        let body_sid = cursor.read_u32::<BigEndian>()?;

        let mut operational_pattern = [0u8; 16];
        cursor.read_exact(&mut operational_pattern)?;

        let batch_count = cursor.read_u32::<BigEndian>()?;
        let batch_item_size = cursor.read_u32::<BigEndian>()?;
        if batch_count as u64 * batch_item_size as u64 > value.len() as u64 {
            return Err(EssenceError::Malformed(format!(
                "essence container batch of {} x {} bytes overruns the partition pack",
                batch_count, batch_item_size
            )));
        }

        let mut essence_containers = Vec::new();
        for _ in 0..batch_count {
            if batch_item_size == 16 {
                let mut ul = [0u8; 16];
                if cursor.read_exact(&mut ul).is_err() {
                    break;
                }
                essence_containers.push(ul);
            } else {
                cursor.set_position(cursor.position() + batch_item_size as u64);
            }
        }

        Ok(Partition {
            kind,
            major_version,
            minor_version,
            kag_size,
            this_partition,
            previous_partition,
            footer_partition,
            header_byte_count,
            index_byte_count,
            index_sid,
            body_offset,
            body_sid,
            operational_pattern,
            essence_containers,
        })
    }

    /// Partition pack key for this partition's kind
    pub fn pack_key(&self) -> [u8; 16] {
        match self.kind {
            PartitionKind::Header => labels::HEADER_PARTITION_CLOSED_COMPLETE,
            PartitionKind::Body => labels::BODY_PARTITION_CLOSED_COMPLETE,
            PartitionKind::Footer => labels::FOOTER_PARTITION,
        }
    }

    /// Write the partition pack as a KLV triplet
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.pack_key())?;

        let value_size = 88 + self.essence_containers.len() * 16;
        let len_bytes = encode_ber_length(value_size);
        writer.write_all(&len_bytes)?;

        writer.write_u16::<BigEndian>(self.major_version)?;
        writer.write_u16::<BigEndian>(self.minor_version)?;
        writer.write_u32::<BigEndian>(self.kag_size)?;
        writer.write_u64::<BigEndian>(self.this_partition as u64)?;
        writer.write_u64::<BigEndian>(self.previous_partition)?;
        writer.write_u64::<BigEndian>(self.footer_partition)?;
        writer.write_u64::<BigEndian>(self.header_byte_count)?;
        writer.write_u64::<BigEndian>(self.index_byte_count)?;
        writer.write_u32::<BigEndian>(self.index_sid)?;
        writer.write_u64::<BigEndian>(self.body_offset)?;
        writer.write_u32::<BigEndian>(self.body_sid)?;
        writer.write_all(&self.operational_pattern)?;

        writer.write_u32::<BigEndian>(self.essence_containers.len() as u32)?;
        writer.write_u32::<BigEndian>(16)?;
        for ec in &self.essence_containers {
            writer.write_all(ec)?;
        }

        Ok(KEY_LEN as usize + len_bytes.len() + value_size)
    }
}

/// Random index pack entry
#[derive(Debug, Clone, Copy)]
pub struct RipEntry {
    pub body_sid: u32,
    pub byte_offset: u64,
}

/// Random index pack, the trailing completeness marker
#[derive(Debug, Clone, Default)]
pub struct RandomIndexPack {
    pub entries: Vec<RipEntry>,
}

impl RandomIndexPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, body_sid: u32, byte_offset: u64) {
        self.entries.push(RipEntry {
            body_sid,
            byte_offset,
        });
    }

    /// Write the RIP as a KLV triplet with trailing overall length
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let value_size = self.entries.len() * 12 + 4;

        writer.write_all(&labels::RANDOM_INDEX_PACK)?;
        let len_bytes = encode_ber_length(value_size);
        writer.write_all(&len_bytes)?;

        for entry in &self.entries {
            writer.write_u32::<BigEndian>(entry.body_sid)?;
            writer.write_u64::<BigEndian>(entry.byte_offset)?;
        }

        let overall_length = (KEY_LEN as usize + len_bytes.len() + value_size) as u32;
        writer.write_u32::<BigEndian>(overall_length)?;

        Ok(overall_length as usize)
    }
}

/// Encode a BER length with the minimal form
pub fn encode_ber_length(length: usize) -> Vec<u8> {
    if length < 0x80 {
        vec![length as u8]
    } else if length <= 0xFF {
        vec![0x81, length as u8]
    } else if length <= 0xFFFF {
        vec![0x82, (length >> 8) as u8, length as u8]
    } else if length <= 0xFF_FFFF {
        vec![0x83, (length >> 16) as u8, (length >> 8) as u8, length as u8]
    } else {
        vec![
            0x84,
            (length >> 24) as u8,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
        ]
    }
}
