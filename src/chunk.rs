//! Essence chunk index.
//!
//! Essence bytes form one continuous logical offset space, but live in
//! discontiguous runs spread across the file's partitions. The chunk index
//! maps between the two. Chunks are appended in file order; the last chunk
//! may still be growing while the file is incomplete.

use crate::error::{EssenceError, Result};
use crate::klv::{KlvStream, KEY_LEN};
use crate::partition::Partition;
use crate::track::EssenceLayout;
use crate::types::Wrapping;
use std::io::{Read, Seek};

/// A contiguous run of essence bytes within a single partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EssenceChunk {
    /// Logical offset, continuous across chunks
    pub essence_offset: i64,
    /// Absolute file position of the run's payload
    pub file_position: i64,
    /// Byte length; 0 while the chunk is still growing
    pub size: i64,
    /// True once the terminal boundary is known
    pub is_complete: bool,
    /// Index into the partition list
    pub partition_id: usize,
}

/// Ordered map between essence offsets and file positions
#[derive(Debug)]
pub struct EssenceChunkIndex {
    chunks: Vec<EssenceChunk>,
    /// Search hint, the common case is sequential access
    last_chunk: usize,
    num_indexed_partitions: usize,
    is_complete: bool,
    wrapping: Wrapping,
    avid_first_frame_offset: i64,
}

impl EssenceChunkIndex {
    pub fn new(wrapping: Wrapping, avid_first_frame_offset: i64) -> Self {
        EssenceChunkIndex {
            chunks: Vec::new(),
            last_chunk: 0,
            num_indexed_partitions: 0,
            is_complete: false,
            wrapping,
            avid_first_frame_offset,
        }
    }

    /// Walk all partitions of a complete file and index their essence.
    pub fn create_index<R: Read + Seek>(
        &mut self,
        stream: &mut KlvStream<R>,
        layout: &EssenceLayout,
    ) -> Result<()> {
        let partitions: Vec<Partition> = stream.partitions().to_vec();
        let file_size = stream.size()?;

        for (i, partition) in partitions.iter().enumerate() {
            if partition.body_sid != layout.body_sid {
                continue;
            }

            let partition_end = if i + 1 < partitions.len() {
                partitions[i + 1].this_partition
            } else {
                file_size
            };

            stream.seek(partition.this_partition)?;
            let pack = stream.read_kl()?;
            stream.skip(pack.len)?;

            while !stream.eof()? {
                let kl = stream.read_next_non_filler_kl()?;
                let kl_total = KEY_LEN as u64 + kl.llen as u64 + kl.len;

                if kl.key.is_partition_pack() {
                    break;
                } else if kl.key.is_header_metadata() {
                    if partition.header_byte_count > kl_total {
                        stream.skip(partition.header_byte_count - (KEY_LEN as u64 + kl.llen as u64))?;
                    } else {
                        stream.skip(kl.len)?;
                    }
                } else if kl.key.is_index_table_segment() {
                    if partition.index_byte_count > kl_total {
                        stream.skip(partition.index_byte_count - (KEY_LEN as u64 + kl.llen as u64))?;
                    } else {
                        stream.skip(kl.len)?;
                    }
                } else if kl.key.is_gc_essence_element() || kl.key.is_avid_essence_element() {
                    if layout.is_clip_wrapped()
                        && layout.track_index_by_number(kl.key.track_number()).is_none()
                    {
                        stream.skip(kl.len)?;
                        continue;
                    }

                    let position = stream.tell()?;
                    self.append_chunk(partition, i, position, kl.llen, kl.len)?;
                    if layout.is_frame_wrapped() {
                        self.update_last_chunk(partition_end, true);
                        break;
                    }
                    // clip wrapping may carry several essence elements per partition
                    stream.skip(kl.len)?;
                } else {
                    stream.skip(kl.len)?;
                }
            }
        }

        self.is_complete = true;
        Ok(())
    }

    /// Append the chunk starting at the essence element whose KL was just
    /// read. `file_position` is the cursor position after the KL.
    pub fn append_chunk(
        &mut self,
        partition: &Partition,
        partition_id: usize,
        file_position: i64,
        klv_llen: u8,
        klv_len: u64,
    ) -> Result<()> {
        // reconcile the declared BodyOffset against the running total
        let mut body_offset = partition.body_offset as i64;
        match self.chunks.last() {
            None => {
                if body_offset > 0 {
                    log::warn!(
                        "Ignoring potential missing essence container data; \
                         partition pack's BodyOffset 0x{:x} > expected offset 0x00",
                        body_offset
                    );
                    body_offset = 0;
                }
            }
            Some(last) => {
                let tail = last.essence_offset + last.size;
                if body_offset > tail {
                    log::warn!(
                        "Ignoring potential missing essence container data; \
                         partition pack's BodyOffset 0x{:x} > expected offset 0x{:x}",
                        body_offset,
                        tail
                    );
                    body_offset = tail;
                } else if body_offset < tail {
                    log::warn!(
                        "Ignoring potential overlapping essence container data; \
                         partition pack's BodyOffset 0x{:x} < expected offset 0x{:x}",
                        body_offset,
                        tail
                    );
                    body_offset = tail;
                }
            }
        }

        let mut chunk = EssenceChunk {
            essence_offset: body_offset,
            file_position,
            size: 0,
            is_complete: false,
            partition_id,
        };
        if self.wrapping.is_frame() {
            // cover the whole run of content packages from the leading KL
            chunk.file_position -= KEY_LEN as i64 + klv_llen as i64;
        } else {
            chunk.size = klv_len as i64;
            if self.avid_first_frame_offset > 0 && self.chunks.is_empty() {
                chunk.file_position += self.avid_first_frame_offset;
                chunk.size -= self.avid_first_frame_offset;
            }
            if chunk.size < 0 {
                return Err(EssenceError::Malformed(format!(
                    "essence element of {} bytes smaller than the first frame offset {}",
                    klv_len, self.avid_first_frame_offset
                )));
            }
            chunk.is_complete = true;
        }
        self.chunks.push(chunk);

        self.num_indexed_partitions = partition_id + 1;
        Ok(())
    }

    /// Extend the growing last chunk up to `file_position`, optionally
    /// closing it. No-op when the last chunk is already complete or the
    /// position is behind its known tail.
    pub fn update_last_chunk(&mut self, file_position: i64, is_end: bool) {
        if let Some(last) = self.chunks.last_mut() {
            if !last.is_complete && file_position >= last.file_position + last.size {
                last.size = file_position - last.file_position;
                last.is_complete = is_end;
            }
        }
    }

    pub fn set_complete(&mut self) {
        self.is_complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn num_indexed_partitions(&self) -> usize {
        self.num_indexed_partitions
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[EssenceChunk] {
        &self.chunks
    }

    /// Total essence bytes indexed so far
    pub fn essence_data_size(&self) -> i64 {
        match self.chunks.last() {
            Some(last) => last.essence_offset + last.size,
            None => 0,
        }
    }

    /// True when a chunk covers the offset, boundary inclusive
    pub fn have_file_position(&mut self, essence_offset: i64) -> bool {
        if self.chunks.is_empty() {
            return false;
        }
        self.locate_by_offset(essence_offset);
        let chunk = &self.chunks[self.last_chunk];
        chunk.essence_offset <= essence_offset
            && chunk.essence_offset + chunk.size >= essence_offset
    }

    /// File position of an essence offset
    pub fn get_file_position(&mut self, essence_offset: i64) -> Result<i64> {
        if !self.have_file_position(essence_offset) {
            return Err(EssenceError::NotFound(format!(
                "essence offset 0x{:x}",
                essence_offset
            )));
        }
        let chunk = &self.chunks[self.last_chunk];
        Ok(chunk.file_position + (essence_offset - chunk.essence_offset))
    }

    /// File position of an (offset, size) span.
    ///
    /// A span running past an incomplete chunk's known bytes is accepted
    /// only while the chunk is still growing and the offset itself is
    /// within the known tail.
    pub fn get_file_position_span(&mut self, essence_offset: i64, size: i64) -> Result<i64> {
        if self.chunks.is_empty() {
            return Err(EssenceError::NotFound(format!(
                "edit unit (off=0x{:x},size=0x{:x})",
                essence_offset, size
            )));
        }
        self.locate_by_offset(essence_offset);
        let chunk = &self.chunks[self.last_chunk];

        let mut have_position = true;
        if chunk.essence_offset > essence_offset {
            have_position = false;
        } else if chunk.essence_offset + chunk.size < essence_offset + size {
            if chunk.essence_offset + chunk.size < essence_offset {
                have_position = false;
            } else if chunk.is_complete {
                have_position = false;
            }
        }
        if !have_position {
            return Err(EssenceError::NotFound(format!(
                "edit unit (off=0x{:x},size=0x{:x})",
                essence_offset, size
            )));
        }

        Ok(chunk.file_position + (essence_offset - chunk.essence_offset))
    }

    /// Essence offset of a file position, boundary inclusive
    pub fn get_essence_offset(&mut self, file_position: i64) -> Result<i64> {
        if self.chunks.is_empty() {
            return Err(EssenceError::NotFound(format!(
                "file position 0x{:x}",
                file_position
            )));
        }
        self.locate_by_position(file_position);
        let chunk = &self.chunks[self.last_chunk];
        if chunk.file_position > file_position
            || chunk.file_position + chunk.size < file_position
        {
            return Err(EssenceError::NotFound(format!(
                "file position 0x{:x}",
                file_position
            )));
        }
        Ok(chunk.essence_offset + (file_position - chunk.file_position))
    }

    // Chunks are append-only and sorted, so both lookups binary search and
    // keep the last-accessed index as the sequential fast path.

    fn locate_by_offset(&mut self, essence_offset: i64) {
        let hint = &self.chunks[self.last_chunk];
        if hint.essence_offset <= essence_offset
            && essence_offset < hint.essence_offset + hint.size
        {
            return;
        }
        let idx = self
            .chunks
            .partition_point(|c| c.essence_offset + c.size <= essence_offset);
        self.last_chunk = idx.min(self.chunks.len() - 1);
    }

    fn locate_by_position(&mut self, file_position: i64) {
        let hint = &self.chunks[self.last_chunk];
        if hint.file_position <= file_position && file_position < hint.file_position + hint.size {
            return;
        }
        let idx = self
            .chunks
            .partition_point(|c| c.file_position + c.size <= file_position);
        self.last_chunk = idx.min(self.chunks.len() - 1);
    }
}
