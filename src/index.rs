//! Index table helper.
//!
//! Owns what is known about per-edit-unit offsets and sizes: parsed index
//! table segments (CBR byte counts or VBR entry arrays), plus entries
//! discovered incrementally while walking a growing file. Offsets here are
//! essence container offsets; the chunk index maps them to file positions.

use crate::error::{EssenceError, Result};
use crate::klv::{KlvStream, KEY_LEN};
use crate::partition::{encode_ber_length, Partition};
use crate::track::EssenceLayout;
use crate::types::EditRate;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, Write};

const RANDOM_ACCESS_FLAG: u8 = 0x80;

/// One indexed edit unit
#[derive(Debug, Clone, Copy)]
struct IndexedUnit {
    temporal_offset: i8,
    key_frame_offset: i8,
    flags: u8,
    /// Essence container offset
    offset: i64,
    /// Byte size, 0 while unknown
    size: i64,
}

/// Delta entry describing one element of a content package
#[derive(Debug, Clone, Copy)]
struct DeltaEntry {
    pos_table_index: i8,
    element_delta: u32,
}

/// Index entry handed out to callers
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexEntryExt {
    pub temporal_offset: i8,
    pub key_frame_offset: i8,
    pub flags: u8,
    pub container_offset: i64,
    pub edit_unit_size: i64,
    /// Absolute file position, filled in by the reader
    pub file_offset: i64,
}

/// Per-edit-unit index knowledge for one essence stream
#[derive(Debug)]
pub struct IndexTableHelper {
    edit_rate: EditRate,
    is_complete: bool,
    essence_data_size: i64,
    /// Constant edit-unit byte count, 0 for VBR
    edit_unit_size: u32,
    /// Duration declared by CBR segments, 0 when open-ended
    cbr_duration: i64,
    entries: Vec<IndexedUnit>,
    delta_entries: Vec<DeltaEntry>,
}

impl IndexTableHelper {
    pub fn new() -> Self {
        IndexTableHelper {
            edit_rate: EditRate::default(),
            is_complete: false,
            essence_data_size: 0,
            edit_unit_size: 0,
            cbr_duration: 0,
            entries: Vec::new(),
            delta_entries: Vec::new(),
        }
    }

    pub fn edit_rate(&self) -> EditRate {
        self.edit_rate
    }

    pub fn set_edit_rate(&mut self, edit_rate: EditRate) {
        self.edit_rate = edit_rate;
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn set_is_complete(&mut self) {
        self.is_complete = true;
    }

    pub fn have_constant_edit_unit_size(&self) -> bool {
        self.edit_unit_size > 0
    }

    pub fn edit_unit_size(&self) -> i64 {
        self.edit_unit_size as i64
    }

    pub fn set_constant_edit_unit_size(&mut self, edit_rate: EditRate, edit_unit_size: u32) {
        self.edit_rate = edit_rate;
        self.edit_unit_size = edit_unit_size;
    }

    /// Total essence bytes backing the index.
    ///
    /// Completes the open size of the last discovered edit unit; with a
    /// constant edit-unit size the duration is then fully known.
    pub fn set_essence_data_size(&mut self, size: i64) {
        self.essence_data_size = size;
        if let Some(last) = self.entries.last_mut() {
            if last.size == 0 && size >= last.offset {
                last.size = size - last.offset;
            }
        }
        if self.edit_unit_size > 0 {
            self.is_complete = true;
        }
    }

    /// Duration in edit units known so far
    pub fn duration(&self) -> i64 {
        if self.edit_unit_size > 0 {
            if self.cbr_duration > 0 {
                self.cbr_duration
            } else if self.essence_data_size > 0 {
                self.essence_data_size / self.edit_unit_size as i64
            } else {
                0
            }
        } else {
            self.entries.len() as i64
        }
    }

    /// True when the edit unit's essence offset is known
    pub fn have_edit_unit_offset(&self, position: i64) -> bool {
        if position < 0 {
            return false;
        }
        if self.edit_unit_size > 0 {
            true
        } else {
            (position as usize) < self.entries.len()
        }
    }

    /// Essence container offset of an edit unit
    pub fn edit_unit_offset(&self, position: i64) -> i64 {
        if self.edit_unit_size > 0 {
            position * self.edit_unit_size as i64
        } else {
            self.entries[position as usize].offset
        }
    }

    /// True when both the offset and the size of the edit unit are known
    pub fn have_edit_unit_size(&self, position: i64) -> bool {
        if position < 0 {
            return false;
        }
        if self.edit_unit_size > 0 {
            true
        } else {
            self.entries
                .get(position as usize)
                .map(|e| e.size > 0)
                .unwrap_or(false)
        }
    }

    /// Essence offset and size of an edit unit
    pub fn edit_unit(&self, position: i64) -> Result<(i64, i64)> {
        if !self.have_edit_unit_offset(position) {
            return Err(EssenceError::NotFound(format!(
                "edit unit {} in index table",
                position
            )));
        }
        if self.edit_unit_size > 0 {
            Ok((
                position * self.edit_unit_size as i64,
                self.edit_unit_size as i64,
            ))
        } else {
            let entry = &self.entries[position as usize];
            Ok((entry.offset, entry.size))
        }
    }

    /// True when index metadata exists for the edit unit
    pub fn have_edit_unit(&self, position: i64) -> bool {
        if position < 0 {
            return false;
        }
        if self.edit_unit_size > 0 {
            let duration = self.duration();
            duration == 0 || position < duration
        } else {
            (position as usize) < self.entries.len()
        }
    }

    /// Index metadata of an edit unit: temporal offset, key-frame offset,
    /// flags and essence offset
    pub fn edit_unit_info(&self, position: i64) -> Option<(i8, i8, u8, i64)> {
        if !self.have_edit_unit(position) {
            return None;
        }
        if self.edit_unit_size > 0 {
            Some((0, 0, RANDOM_ACCESS_FLAG, position * self.edit_unit_size as i64))
        } else {
            let e = &self.entries[position as usize];
            Some((e.temporal_offset, e.key_frame_offset, e.flags, e.offset))
        }
    }

    /// Index entry for callers, without the file offset
    pub fn index_entry(&self, position: i64) -> Option<IndexEntryExt> {
        if !self.have_edit_unit(position) {
            return None;
        }
        let (temporal_offset, key_frame_offset, flags, container_offset) =
            self.edit_unit_info(position)?;
        let edit_unit_size = if self.edit_unit_size > 0 {
            self.edit_unit_size as i64
        } else {
            self.entries[position as usize].size
        };
        Some(IndexEntryExt {
            temporal_offset,
            key_frame_offset,
            flags,
            container_offset,
            edit_unit_size,
            file_offset: 0,
        })
    }

    /// Whether the element at the given byte offset within a content
    /// package is temporally reordered
    pub fn temporal_reordering(&self, element_offset: u32) -> bool {
        let mut reordering = false;
        for delta in &self.delta_entries {
            if delta.element_delta > element_offset {
                break;
            }
            reordering = delta.pos_table_index == -1;
        }
        reordering
    }

    /// Record an edit unit discovered while physically walking the file.
    ///
    /// Positions already known are left untouched so re-walks from an
    /// earlier anchor stay consistent.
    pub fn update_index(&mut self, position: i64, essence_offset: i64, size: i64) -> Result<()> {
        if position < 0 {
            return Err(EssenceError::BadArgument("negative edit unit position"));
        }
        if self.edit_unit_size > 0 {
            return Ok(());
        }
        let pos = position as usize;
        if pos < self.entries.len() {
            return Ok(());
        }
        if pos > self.entries.len() {
            return Err(EssenceError::Malformed(format!(
                "edit unit {} indexed before its predecessors",
                position
            )));
        }
        self.entries.push(IndexedUnit {
            temporal_offset: 0,
            key_frame_offset: 0,
            flags: 0,
            offset: essence_offset,
            size,
        });
        Ok(())
    }

    /// Parse an index table segment whose KL was just consumed
    pub fn read_index_table_segment<R: Read + Seek>(
        &mut self,
        stream: &mut KlvStream<R>,
        len: u64,
    ) -> Result<()> {
        let mut value = vec![0u8; len as usize];
        stream.read_exact(&mut value)?;
        self.parse_segment(&value)
    }

    /// Walk a complete file's partitions and read all index table segments
    /// for the target IndexSID. Returns false when none were found.
    pub fn extract_index_table<R: Read + Seek>(
        &mut self,
        stream: &mut KlvStream<R>,
        layout: &EssenceLayout,
    ) -> Result<bool> {
        let partitions: Vec<Partition> = stream.partitions().to_vec();
        let mut found = false;

        for partition in partitions.iter() {
            if partition.index_sid != layout.index_sid || partition.index_byte_count == 0 {
                continue;
            }

            stream.seek(partition.this_partition)?;
            let pack = stream.read_kl()?;
            stream.skip(pack.len)?;

            while !stream.eof()? {
                let kl = stream.read_next_non_filler_kl()?;
                if kl.key.is_partition_pack() {
                    break;
                } else if kl.key.is_header_metadata() {
                    let kl_total = KEY_LEN as u64 + kl.llen as u64 + kl.len;
                    if partition.header_byte_count > kl_total {
                        stream
                            .skip(partition.header_byte_count - (KEY_LEN as u64 + kl.llen as u64))?;
                    } else {
                        stream.skip(kl.len)?;
                    }
                } else if kl.key.is_index_table_segment() {
                    self.read_index_table_segment(stream, kl.len)?;
                    found = true;
                } else {
                    stream.skip(kl.len)?;
                }
            }
        }

        if found {
            self.is_complete = true;
        }
        Ok(found)
    }

    fn parse_segment(&mut self, value: &[u8]) -> Result<()> {
        let mut edit_rate: Option<EditRate> = None;
        let mut index_start_position = 0i64;
        let mut index_duration = 0i64;
        let mut edit_unit_byte_count = 0u32;
        let mut delta_entries: Vec<DeltaEntry> = Vec::new();
        let mut index_entries: Vec<(i8, i8, u8, u64)> = Vec::new();

        let mut offset = 0usize;
        while offset + 4 <= value.len() {
            let mut cursor = Cursor::new(&value[offset..]);
            let tag = cursor.read_u16::<BigEndian>()?;
            let len = cursor.read_u16::<BigEndian>()? as usize;
            if offset + 4 + len > value.len() {
                return Err(EssenceError::Malformed(format!(
                    "index segment item 0x{:04x} overruns the segment",
                    tag
                )));
            }
            let item = &value[offset + 4..offset + 4 + len];
            let mut cursor = Cursor::new(item);
            match tag {
                0x3F0B if len >= 8 => {
                    edit_rate = Some(EditRate::new(
                        cursor.read_u32::<BigEndian>()? as i32,
                        cursor.read_u32::<BigEndian>()? as i32,
                    ));
                }
                0x3F0C if len >= 8 => index_start_position = cursor.read_u64::<BigEndian>()? as i64,
                0x3F0D if len >= 8 => index_duration = cursor.read_u64::<BigEndian>()? as i64,
                0x3F05 if len >= 4 => edit_unit_byte_count = cursor.read_u32::<BigEndian>()?,
                0x3F09 => {
                    let count = cursor.read_u32::<BigEndian>()?;
                    let item_len = cursor.read_u32::<BigEndian>()? as usize;
                    if item_len < 6 || 8 + count as usize * item_len > len {
                        return Err(EssenceError::Malformed(
                            "delta entry array geometry".into(),
                        ));
                    }
                    for i in 0..count as usize {
                        let entry = &item[8 + i * item_len..];
                        delta_entries.push(DeltaEntry {
                            pos_table_index: entry[0] as i8,
                            element_delta: u32::from_be_bytes([
                                entry[2], entry[3], entry[4], entry[5],
                            ]),
                        });
                    }
                }
                0x3F0A => {
                    let count = cursor.read_u32::<BigEndian>()?;
                    let item_len = cursor.read_u32::<BigEndian>()? as usize;
                    if item_len < 11 || 8 + count as usize * item_len > len {
                        return Err(EssenceError::Malformed(
                            "index entry array geometry".into(),
                        ));
                    }
                    for i in 0..count as usize {
                        let entry = &item[8 + i * item_len..];
                        let mut cursor = Cursor::new(&entry[3..11]);
                        index_entries.push((
                            entry[0] as i8,
                            entry[1] as i8,
                            entry[2],
                            cursor.read_u64::<BigEndian>()?,
                        ));
                    }
                }
                _ => {}
            }
            offset += 4 + len;
        }

        if let Some(rate) = edit_rate {
            self.edit_rate = rate;
        }
        if !delta_entries.is_empty() {
            self.delta_entries = delta_entries;
        }

        if index_entries.is_empty() {
            if edit_unit_byte_count > 0 {
                self.edit_unit_size = edit_unit_byte_count;
                self.cbr_duration += index_duration;
            }
            return Ok(());
        }

        // VBR segment: entries must continue where the previous ones ended
        let have = self.entries.len() as i64;
        if index_start_position > have {
            return Err(EssenceError::Malformed(format!(
                "index segment starts at {} but only {} edit units are indexed",
                index_start_position, have
            )));
        }
        let skip = (have - index_start_position) as usize;
        if skip > 0 {
            log::warn!(
                "Index segment overlaps {} already indexed edit units",
                skip
            );
        }
        for &(temporal_offset, key_frame_offset, flags, stream_offset) in
            index_entries.iter().skip(skip)
        {
            let offset = stream_offset as i64;
            if let Some(last) = self.entries.last_mut() {
                if last.size == 0 {
                    let size = offset - last.offset;
                    if size < 0 {
                        return Err(EssenceError::Malformed(format!(
                            "index entry offset 0x{:x} behind its predecessor 0x{:x}",
                            offset, last.offset
                        )));
                    }
                    last.size = size;
                }
            }
            self.entries.push(IndexedUnit {
                temporal_offset,
                key_frame_offset,
                flags,
                offset,
                size: 0,
            });
        }
        if self.essence_data_size > 0 {
            if let Some(last) = self.entries.last_mut() {
                if last.size == 0 && self.essence_data_size >= last.offset {
                    last.size = self.essence_data_size - last.offset;
                }
            }
        }

        Ok(())
    }
}

impl Default for IndexTableHelper {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a CBR index table segment KLV (test construction)
pub fn write_cbr_segment<W: Write>(
    writer: &mut W,
    index_sid: u32,
    body_sid: u32,
    edit_rate: EditRate,
    edit_unit_byte_count: u32,
    duration: i64,
) -> Result<usize> {
    let mut value = Vec::new();
    write_rational_item(&mut value, 0x3F0B, edit_rate)?;
    write_u64_item(&mut value, 0x3F0C, 0)?;
    write_u64_item(&mut value, 0x3F0D, duration as u64)?;
    write_u32_item(&mut value, 0x3F05, edit_unit_byte_count)?;
    write_u32_item(&mut value, 0x3F06, index_sid)?;
    write_u32_item(&mut value, 0x3F07, body_sid)?;
    write_segment_klv(writer, &value)
}

/// Write a VBR index table segment KLV (test construction).
///
/// Entries are `(temporal_offset, key_frame_offset, flags, stream_offset)`.
pub fn write_vbr_segment<W: Write>(
    writer: &mut W,
    index_sid: u32,
    body_sid: u32,
    edit_rate: EditRate,
    start_position: i64,
    entries: &[(i8, i8, u8, u64)],
) -> Result<usize> {
    let mut value = Vec::new();
    write_rational_item(&mut value, 0x3F0B, edit_rate)?;
    write_u64_item(&mut value, 0x3F0C, start_position as u64)?;
    write_u64_item(&mut value, 0x3F0D, entries.len() as u64)?;
    write_u32_item(&mut value, 0x3F06, index_sid)?;
    write_u32_item(&mut value, 0x3F07, body_sid)?;

    value.write_u16::<BigEndian>(0x3F0A)?;
    value.write_u16::<BigEndian>((8 + entries.len() * 11) as u16)?;
    value.write_u32::<BigEndian>(entries.len() as u32)?;
    value.write_u32::<BigEndian>(11)?;
    for &(temporal_offset, key_frame_offset, flags, stream_offset) in entries {
        value.write_i8(temporal_offset)?;
        value.write_i8(key_frame_offset)?;
        value.write_u8(flags)?;
        value.write_u64::<BigEndian>(stream_offset)?;
    }
    write_segment_klv(writer, &value)
}

fn write_segment_klv<W: Write>(writer: &mut W, value: &[u8]) -> Result<usize> {
    writer.write_all(&crate::ul::labels::INDEX_TABLE_SEGMENT)?;
    let len_bytes = encode_ber_length(value.len());
    writer.write_all(&len_bytes)?;
    writer.write_all(value)?;
    Ok(KEY_LEN as usize + len_bytes.len() + value.len())
}

fn write_rational_item(value: &mut Vec<u8>, tag: u16, rate: EditRate) -> Result<()> {
    value.write_u16::<BigEndian>(tag)?;
    value.write_u16::<BigEndian>(8)?;
    value.write_u32::<BigEndian>(rate.numerator as u32)?;
    value.write_u32::<BigEndian>(rate.denominator as u32)?;
    Ok(())
}

fn write_u64_item(value: &mut Vec<u8>, tag: u16, item: u64) -> Result<()> {
    value.write_u16::<BigEndian>(tag)?;
    value.write_u16::<BigEndian>(8)?;
    value.write_u64::<BigEndian>(item)?;
    Ok(())
}

fn write_u32_item(value: &mut Vec<u8>, tag: u16, item: u32) -> Result<()> {
    value.write_u16::<BigEndian>(tag)?;
    value.write_u16::<BigEndian>(4)?;
    value.write_u32::<BigEndian>(item)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rational;
    use std::io::Cursor;

    fn parse_klv_value(data: &[u8]) -> (IndexTableHelper, Result<()>) {
        // strip key and short/long BER, hand the value to the parser
        let mut stream = KlvStream::new(Cursor::new(data.to_vec()));
        let kl = stream.read_kl().unwrap();
        let mut helper = IndexTableHelper::new();
        let result = helper.read_index_table_segment(&mut stream, kl.len);
        (helper, result)
    }

    #[test]
    fn test_cbr_segment() {
        let mut data = Vec::new();
        write_cbr_segment(&mut data, 1, 2, Rational::fps_25(), 1920, 100).unwrap();
        let (helper, result) = parse_klv_value(&data);
        result.unwrap();

        assert!(helper.have_constant_edit_unit_size());
        assert_eq!(helper.edit_unit_size(), 1920);
        assert_eq!(helper.edit_rate(), Rational::fps_25());
        assert_eq!(helper.duration(), 100);
        assert_eq!(helper.edit_unit(7).unwrap(), (7 * 1920, 1920));
        assert!(helper.have_edit_unit_size(42));
    }

    #[test]
    fn test_vbr_segment() {
        let entries = [
            (0i8, 0i8, 0x80u8, 0u64),
            (0, -1, 0x00, 0x400),
            (0, -2, 0x00, 0x900),
        ];
        let mut data = Vec::new();
        write_vbr_segment(&mut data, 1, 2, Rational::fps_25(), 0, &entries).unwrap();
        let (mut helper, result) = parse_klv_value(&data);
        result.unwrap();

        assert!(!helper.have_constant_edit_unit_size());
        assert_eq!(helper.duration(), 3);
        assert_eq!(helper.edit_unit(0).unwrap(), (0, 0x400));
        assert_eq!(helper.edit_unit(1).unwrap(), (0x400, 0x500));
        // the last size is open until the essence data size arrives
        assert!(!helper.have_edit_unit_size(2));
        helper.set_essence_data_size(0xC00);
        assert_eq!(helper.edit_unit(2).unwrap(), (0x900, 0x300));

        let entry = helper.index_entry(1).unwrap();
        assert_eq!(entry.key_frame_offset, -1);
        assert_eq!(entry.container_offset, 0x400);
        assert_eq!(entry.edit_unit_size, 0x500);
    }

    #[test]
    fn test_vbr_gap_rejected() {
        let mut data = Vec::new();
        write_vbr_segment(&mut data, 1, 2, Rational::fps_25(), 5, &[(0, 0, 0, 0)]).unwrap();
        let (_, result) = parse_klv_value(&data);
        assert!(matches!(result, Err(EssenceError::Malformed(_))));
    }

    #[test]
    fn test_update_index() {
        let mut helper = IndexTableHelper::new();
        helper.update_index(0, 0, 0x100).unwrap();
        helper.update_index(1, 0x100, 0x120).unwrap();
        // repeated positions are ignored
        helper.update_index(1, 0x100, 0x120).unwrap();
        assert_eq!(helper.duration(), 2);
        assert!(helper.have_edit_unit_offset(1));
        assert!(!helper.have_edit_unit_offset(2));
        assert_eq!(helper.edit_unit(1).unwrap(), (0x100, 0x120));

        // gaps are structural errors
        assert!(matches!(
            helper.update_index(5, 0x500, 0x100),
            Err(EssenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_temporal_reordering() {
        let mut value = Vec::new();
        value.write_u16::<BigEndian>(0x3F09).unwrap();
        value.write_u16::<BigEndian>(8 + 2 * 6).unwrap();
        value.write_u32::<BigEndian>(2).unwrap();
        value.write_u32::<BigEndian>(6).unwrap();
        // picture element with temporal reordering at delta 0
        value.write_i8(-1).unwrap();
        value.write_u8(0).unwrap();
        value.write_u32::<BigEndian>(0).unwrap();
        // sound element without, starting at delta 0x200
        value.write_i8(0).unwrap();
        value.write_u8(0).unwrap();
        value.write_u32::<BigEndian>(0x200).unwrap();

        let mut data = Vec::new();
        write_segment_klv(&mut data, &value).unwrap();
        let (helper, result) = parse_klv_value(&data);
        result.unwrap();

        assert!(helper.temporal_reordering(0));
        assert!(helper.temporal_reordering(0x1FF));
        assert!(!helper.temporal_reordering(0x200));
        assert!(!helper.temporal_reordering(0x500));
    }

    #[test]
    fn test_constant_size_completion() {
        let mut helper = IndexTableHelper::new();
        helper.set_constant_edit_unit_size(Rational::fps_25(), 0x300);
        assert!(!helper.is_complete());
        assert_eq!(helper.duration(), 0);
        assert!(helper.have_edit_unit(123));

        helper.set_essence_data_size(0x300 * 50);
        assert!(helper.is_complete());
        assert_eq!(helper.duration(), 50);
        assert!(helper.have_edit_unit(49));
        assert!(!helper.have_edit_unit(50));
    }

    #[test]
    fn test_truncated_segment_rejected() {
        let mut data = crate::ul::labels::INDEX_TABLE_SEGMENT.to_vec();
        data.push(5);
        data.extend_from_slice(&[0x3F, 0x0B, 0x00, 0x08, 0x00]);
        let (_, result) = parse_klv_value(&data);
        assert!(matches!(result, Err(EssenceError::Malformed(_))));
    }
}
