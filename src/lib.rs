//! # MXF Essence Reading
//!
//! This crate reads essence (audio/video sample data) out of MXF (Material
//! Exchange Format) files, the SMPTE container used in professional video
//! workflows. An MXF file is a sequence of partitions carrying header
//! metadata, index table segments and essence; the essence may be
//! frame-wrapped (one content package per edit unit) or clip-wrapped (one
//! long run of samples per track), and the file may still be growing.
//!
//! # Features
//!
//! - KLV (Key-Length-Value) stream access over any `Read + Seek` source
//! - Partition pack and index table segment parsing
//! - Essence chunk index mapping logical essence offsets to file positions
//! - Frame- and clip-wrapped essence reading with presentation windows,
//!   pre-roll, and contiguous edit-unit coalescing
//! - Incremental layout discovery for incomplete (growing) files
//!
//! # Example
//!
//! ```no_run
//! use mxf_essence::{EssenceLayout, EssenceReader, EssenceTrack, KlvStream, Rational, Wrapping};
//!
//! let file = std::fs::File::open("video.mxf").unwrap();
//! let mut stream = KlvStream::new(file);
//! stream.scan_partitions().unwrap();
//!
//! let layout = EssenceLayout {
//!     body_sid: 2,
//!     index_sid: 1,
//!     wrapping: Wrapping::Frame,
//!     edit_rate: Rational::fps_25(),
//!     tracks: vec![EssenceTrack::new(0x15011500)],
//! };
//! let mut reader = EssenceReader::new(stream, layout, None, true).unwrap();
//!
//! reader.set_read_limits(0, reader.duration());
//! let produced = reader.read(10).unwrap();
//! println!("{} frames", produced);
//! ```

mod chunk;
mod descriptor;
mod error;
mod frame;
mod index;
mod klv;
mod meta;
mod partition;
mod reader;
mod track;
mod types;
mod ul;

pub use chunk::{EssenceChunk, EssenceChunkIndex};
pub use descriptor::{
    sample_sequence, Descriptor, EssenceType, PictureDescriptor, SoundDescriptor,
};
pub use error::{EssenceError, Result};
pub use frame::{Frame, FrameBuffer};
pub use index::{write_cbr_segment, write_vbr_segment, IndexEntryExt, IndexTableHelper};
pub use klv::{Kl, KlvStream, KEY_LEN};
pub use meta::{FrameMetadata, FrameMetadataReader};
pub use partition::{encode_ber_length, Partition, PartitionKind, RandomIndexPack, RipEntry};
pub use reader::EssenceReader;
pub use track::{EssenceLayout, EssenceTrack};
pub use types::{EditRate, Rational, Wrapping};
pub use ul::{labels, UniversalLabel, NULL_KEY, UL};
