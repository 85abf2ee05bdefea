//! Essence reader.
//!
//! Drives the KLV stream: walks partitions, dispatches KLs, populates the
//! chunk index and the index table incrementally when the file layout is
//! not yet known, and materialises frames for enabled tracks. A single
//! owner calls `set_read_limits`, `seek` and `read` serially.

use crate::chunk::EssenceChunkIndex;
use crate::descriptor::Descriptor;
use crate::error::{EssenceError, Result};
use crate::frame::Frame;
use crate::index::{IndexEntryExt, IndexTableHelper};
use crate::klv::{Kl, KlvStream};
use crate::meta::FrameMetadataReader;
use crate::track::EssenceLayout;
use crate::ul::UniversalLabel;
use std::collections::HashMap;
use std::io::{Read, Seek};

/// Sentinel for "never positioned"
const POSITION_UNKNOWN: i64 = -1;

/// File completeness discovery state.
///
/// A growing file moves forward only: the footer partition pack is seen
/// first, the random index pack (or a footer without index data) then
/// completes the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Growing,
    FooterSeen,
    Complete,
}

/// Reads essence for one stream of an MXF file
pub struct EssenceReader<R> {
    stream: KlvStream<R>,
    layout: EssenceLayout,
    chunk_index: EssenceChunkIndex,
    index: IndexTableHelper,
    frame_metadata: FrameMetadataReader,

    file_state: FileState,
    read_start_position: i64,
    read_duration: i64,
    position: i64,
    base_position: i64,
    file_position: i64,
    next_kl: Option<Kl>,
    at_cp_start: bool,
    essence_start_key: Option<UniversalLabel>,
    last_known_base_position: i64,
    last_known_file_position: i64,
    previous_partition_id: usize,
    previous_file_position: i64,
    image_start_offset: u32,
    image_end_offset: u32,
}

impl<R: Read + Seek> EssenceReader<R> {
    /// Create a reader over a stream whose partition list already holds
    /// the partitions known so far: all of them for a complete file, at
    /// least the header partition for a growing one.
    pub fn new(
        stream: KlvStream<R>,
        layout: EssenceLayout,
        descriptor: Option<&Descriptor>,
        file_is_complete: bool,
    ) -> Result<Self> {
        if stream.partitions().is_empty() {
            return Err(EssenceError::BadArgument(
                "partition list is empty, read the header partition first",
            ));
        }
        if layout.is_clip_wrapped() && layout.num_tracks() != 1 {
            return Err(EssenceError::BadArgument(
                "clip-wrapped essence carries exactly one track",
            ));
        }

        // Avid uncompressed properties only apply to clip-wrapped picture
        let mut avid_first_frame_offset = 0i64;
        let mut image_start_offset = 0u32;
        let mut image_end_offset = 0u32;
        if layout.is_clip_wrapped() {
            if let Some(Descriptor::Picture(picture)) = descriptor {
                avid_first_frame_offset = picture.avid_first_frame_offset;
                image_start_offset = picture.image_start_offset;
                image_end_offset = picture.image_end_offset;
                let alignment = picture.image_alignment;
                if alignment > 1 && image_start_offset == 0 && image_end_offset == 0 {
                    // Avid alpha files have been seen with the alignment set
                    // but the end offset property missing
                    image_end_offset = (alignment - picture.sample_size % alignment) % alignment;
                    if image_end_offset != 0 {
                        log::warn!(
                            "File with a non-zero image alignment is missing a non-zero \
                             image start or end offset. Assuming image end offset {}",
                            image_end_offset
                        );
                    }
                }
            }
        }

        let chunk_index = EssenceChunkIndex::new(layout.wrapping, avid_first_frame_offset);
        let mut reader = EssenceReader {
            stream,
            layout,
            chunk_index,
            index: IndexTableHelper::new(),
            frame_metadata: FrameMetadataReader::new(),
            file_state: if file_is_complete {
                FileState::Complete
            } else {
                FileState::Growing
            },
            read_start_position: 0,
            read_duration: 0,
            position: 0,
            base_position: POSITION_UNKNOWN,
            file_position: POSITION_UNKNOWN,
            next_kl: None,
            at_cp_start: false,
            essence_start_key: None,
            last_known_base_position: POSITION_UNKNOWN,
            last_known_file_position: POSITION_UNKNOWN,
            previous_partition_id: 0,
            previous_file_position: 0,
            image_start_offset,
            image_end_offset,
        };

        if file_is_complete {
            reader.chunk_index.create_index(&mut reader.stream, &reader.layout)?;
        }

        if reader.layout.index_sid != 0 && file_is_complete {
            if reader.index.extract_index_table(&mut reader.stream, &reader.layout)? {
                if reader.index.edit_rate() != reader.layout.edit_rate {
                    return Err(EssenceError::Malformed(format!(
                        "index table edit rate {} differs from track edit rate {}",
                        reader.index.edit_rate(),
                        reader.layout.edit_rate
                    )));
                }
            } else if reader.chunk_index.essence_data_size() > 0 {
                log::warn!(
                    "Missing index table segments for essence data with size {}",
                    reader.chunk_index.essence_data_size()
                );
            }

            reader.index.set_essence_data_size(reader.chunk_index.essence_data_size());

            // the last indexed edit unit must be backed by essence data
            if reader.index.duration() > 0 {
                let (last_offset, last_size) = reader.index.edit_unit(reader.index.duration() - 1)?;
                if reader.chunk_index.essence_data_size() < last_offset + last_size {
                    return Err(EssenceError::Malformed(format!(
                        "last edit unit (offset {}, size {}) not available in essence \
                         container (size {})",
                        last_offset,
                        last_size,
                        reader.chunk_index.essence_data_size()
                    )));
                }
            }
        } else {
            reader.index.set_edit_rate(reader.layout.edit_rate);

            // clip-wrapped essence needs a known constant edit unit size;
            // random access with a variable size is not supported
            if reader.layout.is_clip_wrapped() {
                let unit_size =
                    descriptor.and_then(|d| d.constant_edit_unit_size(reader.layout.edit_rate));
                match unit_size {
                    Some(size) => {
                        reader.index.set_constant_edit_unit_size(reader.layout.edit_rate, size)
                    }
                    None => log::warn!(
                        "Failed to set a constant edit unit size for clip wrapped essence data"
                    ),
                }
            }

            if reader.chunk_index.is_complete() {
                reader.index.set_essence_data_size(reader.chunk_index.essence_data_size());
            }
        }

        reader.read_start_position = 0;
        reader.read_duration = if reader.index.is_complete() {
            reader.index.duration()
        } else {
            i64::MAX
        };

        Ok(reader)
    }

    /// Clamp and set the presentation window
    pub fn set_read_limits(&mut self, start_position: i64, duration: i64) {
        if self.index.is_complete() {
            self.read_start_position = self.legitimise_position(start_position);
            if duration <= 0 || self.index.duration() == 0 {
                self.read_duration = 0;
            } else {
                let last = start_position.saturating_add(duration).saturating_sub(1);
                self.read_duration = self.legitimise_position(last) - self.read_start_position + 1;
            }
        } else {
            self.read_start_position = start_position.max(0);
            self.read_duration = duration.max(0);
        }
    }

    pub fn read_start_position(&self) -> i64 {
        self.read_start_position
    }

    pub fn read_duration(&self) -> i64 {
        self.read_duration
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Duration in edit units known so far
    pub fn duration(&self) -> i64 {
        self.index.duration()
    }

    /// True once both the chunk index and the index table are complete
    pub fn is_complete(&self) -> bool {
        self.chunk_index.is_complete() && self.index.is_complete()
    }

    pub fn layout(&self) -> &EssenceLayout {
        &self.layout
    }

    /// Pop the oldest buffered frame of a track
    pub fn pop_frame(&mut self, track_index: usize) -> Option<Frame> {
        self.layout.tracks.get_mut(track_index)?.buffer.pop_frame()
    }

    /// Index entry of an edit unit with its absolute file offset resolved
    pub fn get_index_entry(&mut self, position: i64) -> Result<Option<IndexEntryExt>> {
        match self.index.index_entry(position) {
            Some(mut entry) => {
                entry.file_offset = self
                    .chunk_index
                    .get_file_position_span(entry.container_offset, entry.edit_unit_size)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Set the logical position. Physical seeking happens immediately when
    /// the position is inside the read window, lazily otherwise.
    pub fn seek(&mut self, position: i64) -> Result<()> {
        self.position = position;

        if position >= self.read_start_position
            && position < self.read_start_position.saturating_add(self.read_duration)
        {
            self.seek_essence(position, false)?;
        }
        Ok(())
    }

    /// Read up to `num_samples` edit units, materialising frames for the
    /// enabled tracks. Returns the number of samples inside the read
    /// window; the position always advances by the full `num_samples`.
    pub fn read(&mut self, num_samples: u32) -> Result<u32> {
        if num_samples == 0 {
            return Ok(0);
        }

        self.frame_metadata.reset();

        let start_position = self.position;
        let window_start = self.read_start_position;
        let window_end = window_start.saturating_add(self.read_duration);

        // entirely outside the window: no I/O, just advance
        if self.read_duration == 0
            || self.position >= window_end
            || self.position.saturating_add(num_samples as i64) <= window_start
        {
            self.seek(self.position + num_samples as i64)?;
            return Ok(0);
        }

        // clip the leading part outside the window (pre-roll or below the
        // read start) and the trailing part beyond the window end
        let mut first_sample_offset = 0u32;
        let mut read_num_samples = num_samples;
        if self.position < window_start {
            first_sample_offset = (window_start - self.position) as u32;
            read_num_samples -= first_sample_offset;
            self.seek(window_start)?;
        }
        if self.position + read_num_samples as i64 > window_end {
            read_num_samples -= (self.position + read_num_samples as i64 - window_end) as u32;
        }
        debug_assert!(read_num_samples > 0);

        let completed = if self.layout.is_clip_wrapped() {
            self.read_clip_wrapped_samples(read_num_samples)?
        } else {
            self.read_frame_wrapped_samples(read_num_samples)?
        };

        // attach index metadata and deliver in position order
        let mut first_of_track = vec![true; self.layout.num_tracks()];
        for (track_index, mut frame) in completed {
            if first_of_track[track_index] {
                frame.first_sample_offset = first_sample_offset;
                first_of_track[track_index] = false;
            }
            if let Some((temporal_offset, key_frame_offset, flags, _)) =
                self.index.edit_unit_info(frame.ec_position)
            {
                frame.temporal_offset = temporal_offset;
                frame.key_frame_offset = key_frame_offset;
                frame.flags = flags;
            }
            self.layout.tracks[track_index].buffer.push_frame(frame);
        }

        // always end up num_samples past the starting position
        if self.position != start_position + num_samples as i64 {
            self.seek(start_position + num_samples as i64)?;
        }

        Ok(read_num_samples)
    }

    fn legitimise_position(&self, position: i64) -> i64 {
        if position < 0 || self.index.duration() == 0 {
            0
        } else if position >= self.index.duration() {
            self.index.duration() - 1
        } else {
            position
        }
    }

    fn read_clip_wrapped_samples(&mut self, num_samples: u32) -> Result<Vec<(usize, Frame)>> {
        // only position 0 is seekable while the file is incomplete
        if !self.is_complete() && self.position == 0 {
            self.seek_essence(self.position, true)?;
        }

        let mut frame = if self.layout.tracks[0].enabled {
            Some(Frame::new())
        } else {
            None
        };

        let mut current_file_position = self.stream.tell()?;
        let mut total_num_samples = 0u32;
        while total_num_samples < num_samples {
            // one edit unit at a time when image padding must be stripped,
            // otherwise coalesce contiguous edit units
            let max_samples = if self.image_start_offset != 0 || self.image_end_offset != 0 {
                1
            } else {
                num_samples - total_num_samples
            };
            let (file_position, size, num_cont_samples) =
                self.edit_unit_group(self.position, max_samples)?;

            if let Some(frame) = frame.as_mut() {
                if size < self.image_start_offset as i64 + self.image_end_offset as i64 {
                    return Err(EssenceError::Malformed(format!(
                        "edit unit of {} bytes smaller than the image padding",
                        size
                    )));
                }

                if current_file_position != file_position {
                    self.stream.seek(file_position)?;
                }

                let was_empty = frame.is_empty();
                let appended_at = frame.size();
                frame.grow(size as usize);
                frame.read_from(&mut self.stream, size as u64)?;
                current_file_position = file_position + size;

                frame.trim_tail(self.image_end_offset as usize);
                frame.trim_at(appended_at, self.image_start_offset as usize);
                frame.num_samples += num_cont_samples;

                if was_empty {
                    frame.ec_position = self.position;
                    frame.temporal_reordering = self.index.temporal_reordering(0);
                    frame.cp_file_position = file_position;
                    frame.file_position = file_position;
                }
            } else {
                self.stream.seek(file_position + size)?;
                current_file_position = file_position + size;
            }

            self.position += num_cont_samples as i64;
            total_num_samples += num_cont_samples;
        }

        Ok(frame.map(|f| (0, f)).into_iter().collect())
    }

    fn read_frame_wrapped_samples(&mut self, num_samples: u32) -> Result<Vec<(usize, Frame)>> {
        let mut completed = Vec::new();
        let mut track_cache: HashMap<u32, Option<usize>> = HashMap::new();

        for _ in 0..num_samples {
            self.seek_essence(self.position, true)?;

            // the index may know the package's size, only its offset, or
            // nothing at all
            let (size, cp_file_position) = if self.index.have_edit_unit_size(self.position) {
                let (offset, unit_size) = self.index.edit_unit(self.position)?;
                let file_position = self.chunk_index.get_file_position_span(offset, unit_size)?;
                debug_assert_eq!(file_position, self.file_position);
                (unit_size, file_position)
            } else if self.index.have_edit_unit_offset(self.position) {
                let offset = self.index.edit_unit_offset(self.position);
                let file_position = self.chunk_index.get_file_position(offset)?;
                debug_assert_eq!(file_position, self.file_position);
                (0, file_position)
            } else {
                (0, self.file_position)
            };

            let mut package_frames: Vec<Option<Frame>> =
                (0..self.layout.num_tracks()).map(|_| None).collect();
            let mut cp_num_read = 0i64;

            loop {
                if size > 0 && cp_num_read >= size {
                    break;
                }
                let kl = match self.read_essence_kl(cp_num_read == 0)? {
                    Some(kl) => kl,
                    None => break,
                };
                cp_num_read += kl.header_len();

                let processed = self
                    .frame_metadata
                    .process_frame_metadata(&mut self.stream, &kl)?;

                if !processed
                    && (kl.key.is_gc_essence_element() || kl.key.is_avid_essence_element())
                {
                    let track_number = kl.key.track_number();
                    let track_index = match track_cache.get(&track_number).copied() {
                        Some(cached) => cached,
                        None => {
                            let found = self
                                .layout
                                .track_index_by_number(track_number)
                                .filter(|&idx| self.layout.tracks[idx].enabled);
                            track_cache.insert(track_number, found);
                            found
                        }
                    };

                    match track_index {
                        Some(idx) => {
                            if package_frames[idx].is_none() {
                                // first sighting of this track in the package
                                let mut new_frame = Frame::new();
                                new_frame.ec_position = self.position;
                                new_frame.cp_file_position = cp_file_position;
                                new_frame.file_position = cp_file_position + cp_num_read;
                                if self.index.have_edit_unit(self.position) {
                                    new_frame.temporal_reordering = self
                                        .index
                                        .temporal_reordering((cp_num_read - kl.header_len()) as u32);
                                }
                                new_frame.num_samples = 1;
                                package_frames[idx] = Some(new_frame);
                            }
                            if let Some(frame) = package_frames[idx].as_mut() {
                                frame.grow(kl.len as usize);
                                frame.read_from(&mut self.stream, kl.len)?;
                            }
                        }
                        None => self.stream.skip(kl.len)?,
                    }
                } else if !processed {
                    self.stream.skip(kl.len)?;
                }

                cp_num_read += kl.len as i64;
            }

            if size != 0 && cp_num_read != size {
                return Err(EssenceError::IndexMismatch {
                    read: cp_num_read,
                    indexed: size,
                    file_position: self.stream.tell()?,
                });
            }
            if size == 0 {
                let essence_offset = self.chunk_index.get_essence_offset(cp_file_position)?;
                self.index.update_index(self.position, essence_offset, cp_num_read)?;
            }

            for (idx, slot) in package_frames.iter_mut().enumerate() {
                if let Some(mut frame) = slot.take() {
                    self.frame_metadata
                        .insert_frame_metadata(&mut frame, self.layout.tracks[idx].track_number);
                    completed.push((idx, frame));
                }
            }
            self.frame_metadata.reset();

            self.position += 1;
        }

        Ok(completed)
    }

    /// Essence file position and size of one edit unit
    fn edit_unit(&mut self, position: i64) -> Result<(i64, i64)> {
        let (offset, size) = self.index.edit_unit(position)?;
        let file_position = self.chunk_index.get_file_position_span(offset, size)?;
        Ok((file_position, size))
    }

    /// Largest run of physically contiguous edit units starting at
    /// `position`, up to `max_samples`. Requires a constant edit unit size
    /// to coalesce; returns a single unit otherwise.
    fn edit_unit_group(&mut self, position: i64, max_samples: u32) -> Result<(i64, i64, u32)> {
        if max_samples == 0 {
            return Err(EssenceError::BadArgument("num_samples must be positive"));
        }

        if !self.index.have_constant_edit_unit_size() || max_samples == 1 {
            let (file_position, size) = self.edit_unit(position)?;
            return Ok((file_position, size, 1));
        }

        let unit_size = self.index.edit_unit_size();
        let (first_file_position, first_size) = self.edit_unit(position)?;

        // binary search for the largest contiguous prefix:
        // first <= left <= right <= last, first..left is contiguous
        let mut left = 1u32;
        let mut right = max_samples;
        let mut last = max_samples;
        while right != left {
            let (right_file_position, right_size) = self.edit_unit(position + right as i64 - 1)?;
            if right_size != unit_size {
                return Err(EssenceError::Malformed(format!(
                    "edit unit {} size {} breaks the constant size {}",
                    position + right as i64 - 1,
                    right_size,
                    unit_size
                )));
            }

            let contiguous_position = first_file_position + unit_size * (right as i64 - 1);
            if right_file_position > contiguous_position {
                // not contiguous up to right, halve towards left
                last = right;
                right = (left + right) / 2;
            } else if right_file_position == contiguous_position {
                // contiguous up to right, grow towards last
                left = right;
                right = (right + last + 1) / 2;
            } else {
                return Err(EssenceError::Malformed(format!(
                    "edit unit {} file position overlaps its predecessors",
                    position + right as i64 - 1
                )));
            }
        }

        Ok((first_file_position, first_size * left as i64, left))
    }

    /// Position the file at a content package start.
    ///
    /// With `for_read` false the seek is lazy: when neither the index nor
    /// the chunk index can resolve the position yet, nothing happens.
    fn seek_essence(&mut self, base_position: i64, for_read: bool) -> Result<()> {
        self.with_state_guard(|this| {
            if base_position < 0 {
                return Err(EssenceError::BadArgument("negative essence position"));
            }

            if this.at_cp_start && this.base_position == base_position {
                return Ok(());
            }

            // seek directly when the file position is known
            if let Some(file_position) = this.indexed_file_position(base_position)? {
                this.stream.seek(file_position)?;
                this.set_content_package_start(base_position, file_position, true)?;
                return Ok(());
            }

            debug_assert!(!this.chunk_index.is_complete() || !this.index.is_complete());
            if !for_read {
                return Ok(());
            }

            // position at the first or last known content package start
            if this.base_position == POSITION_UNKNOWN {
                this.seek_content_package_start()?;
                this.set_content_package_start(0, POSITION_UNKNOWN, false)?;
            } else if this.base_position < this.last_known_base_position {
                debug_assert!(this.last_known_base_position <= base_position);
                this.stream.seek(this.last_known_file_position)?;
                this.set_content_package_start(
                    this.last_known_base_position,
                    this.last_known_file_position,
                    true,
                )?;
            }

            // walk content packages forward until the requested position
            while this.base_position < base_position {
                let kl = this.read_first_essence_kl()?;
                let mut cp_num_read = kl.header_len() + kl.len as i64;
                let next_file_position = this.file_position;
                let next_base_position = this.base_position;
                if this.base_position < base_position {
                    this.stream.skip(kl.len)?;
                    this.reset_kl_state();
                    while let Some(kl) = this.read_nonfirst_essence_kl()? {
                        cp_num_read += kl.header_len() + kl.len as i64;
                        this.stream.skip(kl.len)?;
                    }
                    let essence_offset =
                        this.chunk_index.get_essence_offset(next_file_position)?;
                    this.index
                        .update_index(next_base_position, essence_offset, cp_num_read)?;
                }
            }
            Ok(())
        })
    }

    /// File position of an edit unit when both the index table and the
    /// chunk index can already resolve it
    fn indexed_file_position(&mut self, base_position: i64) -> Result<Option<i64>> {
        if self.index.have_edit_unit_offset(base_position) {
            let essence_offset = self.index.edit_unit_offset(base_position);
            if self.chunk_index.have_file_position(essence_offset) {
                return Ok(Some(self.chunk_index.get_file_position(essence_offset)?));
            }
        }
        Ok(None)
    }

    /// Record the content package the cursor is at.
    ///
    /// `file_position` below zero means "use the cursor"; with
    /// `pos_at_key` false the stored lookahead KL has already been read
    /// and the position backs up over it.
    fn set_content_package_start(
        &mut self,
        base_position: i64,
        file_position: i64,
        pos_at_key: bool,
    ) -> Result<()> {
        self.base_position = base_position;
        self.file_position = if file_position < 0 {
            self.stream.tell()?
        } else {
            file_position
        };
        if self.layout.is_frame_wrapped() && !pos_at_key {
            debug_assert!(self.next_kl.is_some());
            if let Some(kl) = self.next_kl {
                self.file_position -= kl.header_len();
            }
        }

        if self.base_position > self.last_known_base_position {
            self.last_known_base_position = self.base_position;
            self.last_known_file_position = self.file_position;
            if !self.chunk_index.is_complete() {
                self.chunk_index.update_last_chunk(self.file_position, false);
            }
        }

        if pos_at_key {
            self.next_kl = None;
        }
        self.at_cp_start = true;
        Ok(())
    }

    /// Read a content package element's KL. The first element resets the
    /// lookahead state so its value can be consumed; non-first elements
    /// return None at the end of the package.
    fn read_essence_kl(&mut self, first_element: bool) -> Result<Option<Kl>> {
        if first_element {
            let kl = self.read_first_essence_kl()?;
            self.reset_kl_state();
            Ok(Some(kl))
        } else {
            self.read_nonfirst_essence_kl()
        }
    }

    /// Read the KL of a content package's first essence element
    fn read_first_essence_kl(&mut self) -> Result<Kl> {
        self.with_state_guard(|this| {
            if !this.at_cp_start {
                this.seek_content_package_start()?;
                let next_base = this.base_position + 1;
                this.set_content_package_start(next_base, POSITION_UNKNOWN, false)?;
            } else if this.next_kl.is_none() {
                let kl = this.stream.read_kl()?;
                match this.essence_start_key {
                    None => this.essence_start_key = Some(kl.key),
                    Some(expected) if kl.key != expected => {
                        return Err(EssenceError::StartKeyMismatch {
                            expected,
                            found: kl.key,
                        });
                    }
                    Some(_) => {}
                }
                this.next_kl = Some(kl);
            }
            // else the first element's KL was already read ahead

            this.next_kl.ok_or_else(|| {
                EssenceError::Malformed("content package start without an essence key".into())
            })
        })
    }

    /// Read the KL of a non-first content package element.
    ///
    /// Returns None when the KL belongs to the next content package or a
    /// partition pack, storing it as lookahead.
    fn read_nonfirst_essence_kl(&mut self) -> Result<Option<Kl>> {
        self.with_state_guard(|this| {
            debug_assert!(this.next_kl.is_none() && !this.at_cp_start);

            let kl = this.stream.read_kl()?;

            if Some(kl.key) == this.essence_start_key {
                this.next_kl = Some(kl);
                let next_base = this.base_position + 1;
                this.set_content_package_start(next_base, POSITION_UNKNOWN, false)?;
                return Ok(None);
            }
            if kl.key.is_partition_pack() {
                let boundary = this.stream.tell()? - kl.header_len();
                this.chunk_index.update_last_chunk(boundary, true);
                if this.file_state == FileState::Growing && kl.key.is_footer_partition_pack() {
                    this.set_have_footer();
                }
                this.next_kl = Some(kl);
                return Ok(None);
            }

            Ok(Some(kl))
        })
    }

    /// Walk forward from the current cursor to the next content package
    /// start, handling partition packs, metadata, index segments and junk
    /// on the way. Leaves the first essence KL as lookahead.
    fn seek_content_package_start(&mut self) -> Result<()> {
        if let Some(kl) = self.next_kl {
            if kl.key.is_partition_pack() {
                if self.file_state == FileState::Complete {
                    self.stream.skip(kl.len)?;
                } else {
                    self.read_next_partition(&kl)?;
                }
            }
        }
        self.next_kl = None;

        let mut partition_id = if self.file_state == FileState::Complete {
            let tell = self.stream.tell()?;
            self.get_partition_id(tell)
        } else {
            self.stream.partitions().len() - 1
        };

        loop {
            let kl = self.stream.read_next_non_filler_kl()?;
            let kl_total = kl.header_len() as u64 + kl.len;
            let partition = &self.stream.partitions()[partition_id];
            let (body_sid, index_sid, header_byte_count, index_byte_count) = (
                partition.body_sid,
                partition.index_sid,
                partition.header_byte_count,
                partition.index_byte_count,
            );

            if kl.key.is_partition_pack() {
                if self.file_state == FileState::Complete {
                    self.stream.skip(kl.len)?;
                    let tell = self.stream.tell()?;
                    partition_id = self.get_partition_id(tell);
                } else {
                    if body_sid == self.layout.body_sid {
                        let boundary = self.stream.tell()? - kl.header_len();
                        self.chunk_index.update_last_chunk(boundary, true);
                    }
                    self.read_next_partition(&kl)?;
                    partition_id += 1;
                }
            } else if kl.key.is_header_metadata() {
                if header_byte_count > kl_total {
                    self.stream.skip(header_byte_count - kl.header_len() as u64)?;
                } else {
                    self.stream.skip(kl.len)?;
                }
            } else if kl.key.is_index_table_segment() {
                if !self.index.is_complete()
                    && self.layout.index_sid != 0
                    && index_sid == self.layout.index_sid
                {
                    self.index.read_index_table_segment(&mut self.stream, kl.len)?;
                } else if index_byte_count > kl_total {
                    self.stream.skip(index_byte_count - kl.header_len() as u64)?;
                } else {
                    self.stream.skip(kl.len)?;
                }
            } else if body_sid == self.layout.body_sid
                && match self.essence_start_key {
                    Some(start_key) => kl.key == start_key,
                    None => kl.key.is_gc_essence_element() || kl.key.is_avid_essence_element(),
                }
            {
                if self.layout.is_clip_wrapped() {
                    // skip essence containers that are not the target
                    if self
                        .layout
                        .track_index_by_number(kl.key.track_number())
                        .is_none()
                    {
                        self.stream.skip(kl.len)?;
                        continue;
                    }
                    if !self.chunk_index.is_complete() {
                        self.append_chunk(partition_id, &kl)?;
                    }
                } else if !self.chunk_index.is_complete()
                    && self.chunk_index.num_indexed_partitions() < self.stream.partitions().len()
                {
                    self.append_chunk(partition_id, &kl)?;
                }

                if self.essence_start_key.is_none() {
                    self.essence_start_key = Some(kl.key);
                }
                self.next_kl = Some(kl);
                return Ok(());
            } else {
                if self.file_state != FileState::Complete && kl.key.is_random_index_pack() {
                    if self.file_state == FileState::Growing {
                        return Err(EssenceError::Malformed(
                            "random index pack before a footer partition pack".into(),
                        ));
                    }
                    self.set_file_is_complete();
                }
                self.stream.skip(kl.len)?;
            }
        }
    }

    fn append_chunk(&mut self, partition_id: usize, kl: &Kl) -> Result<()> {
        let position = self.stream.tell()?;
        let partition = self.stream.partitions()[partition_id].clone();
        self.chunk_index
            .append_chunk(&partition, partition_id, position, kl.llen, kl.len)
    }

    /// Partition covering a file position, scanning from the cached hint
    fn get_partition_id(&mut self, file_position: i64) -> usize {
        if file_position < self.previous_file_position {
            self.previous_partition_id = 0;
            self.previous_file_position = 0;
        }

        let id = {
            let partitions = self.stream.partitions();
            let mut i = self.previous_partition_id;
            while i < partitions.len() {
                if partitions[i].this_partition > file_position {
                    break;
                }
                i += 1;
            }
            i.saturating_sub(1)
        };

        self.previous_file_position = file_position;
        self.previous_partition_id = id;
        id
    }

    /// Parse the partition pack whose KL was just read, extending the
    /// partition list and picking up footer/completeness transitions
    fn read_next_partition(&mut self, kl: &Kl) -> Result<()> {
        let partition_pos = self.stream.tell()? - kl.header_len();
        match self.stream.partitions().last() {
            Some(last) if last.this_partition < partition_pos => {}
            _ => {
                return Err(EssenceError::Malformed(format!(
                    "partition pack at 0x{:x} does not follow the previous partition",
                    partition_pos
                )))
            }
        }

        self.stream.read_next_partition(&kl.key, kl.len)?;

        let idx = self.stream.partitions().len() - 1;
        let declared = self.stream.partitions()[idx].this_partition;
        if declared != partition_pos {
            log::warn!(
                "Updating (in-memory) partition property ThisPartition {} to actual file \
                 position {}",
                declared,
                partition_pos
            );
            self.stream.partitions_mut()[idx].set_this_partition(partition_pos);
        }

        let partition = &self.stream.partitions()[idx];
        let is_footer = partition.is_footer();
        let index_byte_count = partition.index_byte_count;
        if self.file_state == FileState::Growing && is_footer {
            self.set_have_footer();
            if index_byte_count == 0 {
                self.set_file_is_complete();
            }
        }

        Ok(())
    }

    /// The footer partition has been reached: the essence container layout
    /// is now fully known
    fn set_have_footer(&mut self) {
        if self.file_state == FileState::Growing {
            self.file_state = FileState::FooterSeen;
        }
        self.chunk_index.set_complete();
        self.index.set_essence_data_size(self.chunk_index.essence_data_size());
    }

    /// The file is finalised: the index table is complete and the read
    /// window clamps to the actual duration
    fn set_file_is_complete(&mut self) {
        if self.file_state == FileState::Growing {
            self.set_have_footer();
        }
        self.file_state = FileState::Complete;
        self.index.set_is_complete();

        self.set_read_limits(self.read_start_position, self.read_duration);
    }

    fn reset_kl_state(&mut self) {
        self.next_kl = None;
        self.at_cp_start = false;
    }

    /// Run a fallible walk step; any failure clears the lookahead and the
    /// content-package-start flag so the next call re-walks from a safe
    /// anchor before the error propagates.
    fn with_state_guard<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.reset_kl_state();
                Err(e)
            }
        }
    }
}
