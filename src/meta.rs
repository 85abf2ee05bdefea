//! Frame metadata captured from inside content packages.
//!
//! Frame-wrapped content packages may interleave non-essence KLVs with the
//! essence elements: generic-container system items (timecode, package
//! metadata) and descriptive metadata. The reader captures their payloads
//! per read call and attaches them to the produced frames.

use crate::error::Result;
use crate::klv::{Kl, KlvStream};
use crate::frame::Frame;
use crate::ul::UniversalLabel;
use std::io::{Read, Seek};

/// One captured metadata KLV
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub key: UniversalLabel,
    pub data: Vec<u8>,
}

/// Collects metadata KLVs within a content package
#[derive(Debug, Default)]
pub struct FrameMetadataReader {
    items: Vec<FrameMetadata>,
}

impl FrameMetadataReader {
    pub fn new() -> Self {
        FrameMetadataReader::default()
    }

    /// Discard metadata captured by the previous read call
    pub fn reset(&mut self) {
        self.items.clear();
    }

    /// Offer a KL from the content package.
    ///
    /// Returns true and consumes the value when the key is a recognised
    /// metadata item; otherwise leaves the cursor untouched for the caller
    /// to dispatch.
    pub fn process_frame_metadata<R: Read + Seek>(
        &mut self,
        stream: &mut KlvStream<R>,
        kl: &Kl,
    ) -> Result<bool> {
        if !kl.key.is_system_item() {
            return Ok(false);
        }

        let mut data = vec![0u8; kl.len as usize];
        stream.read_exact(&mut data)?;
        self.items.push(FrameMetadata { key: kl.key, data });
        Ok(true)
    }

    /// Attach the captured metadata to a track's frame.
    ///
    /// System items describe the whole content package, so every track
    /// frame receives them.
    pub fn insert_frame_metadata(&self, frame: &mut Frame, _track_number: u32) {
        frame.metadata.extend(self.items.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
