//! Essence stream layout and per-track state.
//!
//! The reader is constructed with an [`EssenceLayout`] describing the
//! target essence stream: which BodySID/IndexSID to follow, the wrapping
//! mode, and the tracks keyed by their essence-element track numbers.

use crate::frame::FrameBuffer;
use crate::types::{EditRate, Wrapping};

/// One track of the essence stream
#[derive(Debug)]
pub struct EssenceTrack {
    /// Track number carried in the essence element keys
    pub track_number: u32,
    /// Disabled tracks have their essence skipped, not materialised
    pub enabled: bool,
    /// Completed frames ready for the caller
    pub buffer: FrameBuffer,
}

impl EssenceTrack {
    pub fn new(track_number: u32) -> Self {
        EssenceTrack {
            track_number,
            enabled: true,
            buffer: FrameBuffer::new(),
        }
    }

    pub fn disabled(track_number: u32) -> Self {
        EssenceTrack {
            track_number,
            enabled: false,
            buffer: FrameBuffer::new(),
        }
    }
}

/// Layout of the essence stream the reader follows
#[derive(Debug)]
pub struct EssenceLayout {
    /// BodySID of the target essence stream
    pub body_sid: u32,
    /// IndexSID of the stream's index table, 0 if none
    pub index_sid: u32,
    /// Wrapping mode
    pub wrapping: Wrapping,
    /// Edit rate of the stream
    pub edit_rate: EditRate,
    /// Tracks, in file order
    pub tracks: Vec<EssenceTrack>,
}

impl EssenceLayout {
    /// Find a track's index by its essence-element track number
    pub fn track_index_by_number(&self, track_number: u32) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.track_number == track_number)
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_frame_wrapped(&self) -> bool {
        self.wrapping.is_frame()
    }

    pub fn is_clip_wrapped(&self) -> bool {
        self.wrapping.is_clip()
    }
}
