//! Descriptor probing.
//!
//! The essence reader needs a handful of numeric properties from the file
//! descriptor: Avid first-frame offset and image padding for clip-wrapped
//! picture essence, and the sampling geometry that yields a constant
//! edit-unit size. Picture vs sound is a closed variant over essence-type
//! codes rather than a metadata class hierarchy.

use crate::error::{EssenceError, Result};
use crate::types::{EditRate, Rational};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

/// Essence type codes the reader can derive a constant edit-unit size for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EssenceType {
    IecDv25,
    DvBased25,
    Dv50,
    Dv100,
    UncSd,
    UncHd,
    AvidUnc10Bit,
    AvidAlpha,
    Vc3,
    Mpeg2,
    Avc,
    Jpeg2000,
    WavePcm,
    Unknown,
}

impl EssenceType {
    /// True for types whose picture edit-unit size is fixed per frame
    pub fn has_fixed_frame_size(&self) -> bool {
        matches!(
            self,
            EssenceType::IecDv25
                | EssenceType::DvBased25
                | EssenceType::Dv50
                | EssenceType::Dv100
                | EssenceType::UncSd
                | EssenceType::UncHd
                | EssenceType::AvidUnc10Bit
                | EssenceType::AvidAlpha
                | EssenceType::Vc3
        )
    }
}

/// Numeric properties probed from a picture descriptor
#[derive(Debug, Clone)]
pub struct PictureDescriptor {
    pub essence_type: EssenceType,
    /// Bytes per stored frame
    pub sample_size: u32,
    /// Bytes per edit unit, equal to `sample_size` for uncompressed types
    pub edit_unit_size: u32,
    /// Avid first-frame offset into the clip-wrapped element
    pub avid_first_frame_offset: i64,
    /// Avid uncompressed padding before the image
    pub image_start_offset: u32,
    /// Avid uncompressed padding after the image
    pub image_end_offset: u32,
    /// Avid image alignment, 0 or 1 when unaligned
    pub image_alignment: u32,
}

impl PictureDescriptor {
    pub fn new(essence_type: EssenceType, sample_size: u32) -> Self {
        PictureDescriptor {
            essence_type,
            sample_size,
            edit_unit_size: sample_size,
            avid_first_frame_offset: 0,
            image_start_offset: 0,
            image_end_offset: 0,
            image_alignment: 0,
        }
    }
}

/// Numeric properties probed from a sound descriptor
#[derive(Debug, Clone)]
pub struct SoundDescriptor {
    pub essence_type: EssenceType,
    pub sampling_rate: Rational,
    pub channel_count: u32,
    pub quantization_bits: u32,
    /// Bytes per sample across all channels (block alignment)
    pub sample_size: u32,
}

impl SoundDescriptor {
    pub fn new(sampling_rate: Rational, channel_count: u32, quantization_bits: u32) -> Self {
        let sample_size = channel_count * quantization_bits.div_ceil(8);
        SoundDescriptor {
            essence_type: EssenceType::WavePcm,
            sampling_rate,
            channel_count,
            quantization_bits,
            sample_size,
        }
    }

    /// Parse the properties out of a Wave audio descriptor local set
    pub fn parse_wave(value: &[u8]) -> Result<Self> {
        let mut sampling_rate = Rational::hz_48k();
        let mut channel_count = 0u32;
        let mut quantization_bits = 0u32;
        let mut block_align = 0u32;

        let mut offset = 0usize;
        while offset + 4 <= value.len() {
            let mut cursor = Cursor::new(&value[offset..]);
            let tag = cursor.read_u16::<BigEndian>()?;
            let len = cursor.read_u16::<BigEndian>()? as usize;
            if offset + 4 + len > value.len() {
                return Err(EssenceError::Malformed(format!(
                    "descriptor local set item 0x{:04x} overruns the set",
                    tag
                )));
            }
            let item = &value[offset + 4..offset + 4 + len];
            let mut cursor = Cursor::new(item);
            match tag {
                0x3D03 if len >= 8 => {
                    sampling_rate = Rational::new(
                        cursor.read_u32::<BigEndian>()? as i32,
                        cursor.read_u32::<BigEndian>()? as i32,
                    );
                }
                0x3D07 if len >= 4 => channel_count = cursor.read_u32::<BigEndian>()?,
                0x3D01 if len >= 4 => quantization_bits = cursor.read_u32::<BigEndian>()?,
                0x3D0A if len >= 2 => block_align = cursor.read_u16::<BigEndian>()? as u32,
                _ => {}
            }
            offset += 4 + len;
        }

        let mut desc = SoundDescriptor::new(sampling_rate, channel_count, quantization_bits);
        if block_align > 0 {
            desc.sample_size = block_align;
        }
        Ok(desc)
    }
}

/// Picture vs sound descriptor probe
#[derive(Debug, Clone)]
pub enum Descriptor {
    Picture(PictureDescriptor),
    Sound(SoundDescriptor),
}

impl Descriptor {
    pub fn is_picture(&self) -> bool {
        matches!(self, Descriptor::Picture(_))
    }

    pub fn essence_type(&self) -> EssenceType {
        match self {
            Descriptor::Picture(p) => p.essence_type,
            Descriptor::Sound(s) => s.essence_type,
        }
    }

    /// Constant edit-unit size for the given edit rate, if one exists.
    ///
    /// Picture types with fixed frame sizes use the stored frame size; PCM
    /// needs a single-element sample sequence.
    pub fn constant_edit_unit_size(&self, edit_rate: EditRate) -> Option<u32> {
        match self {
            Descriptor::Picture(p) => {
                if p.essence_type.has_fixed_frame_size() && p.edit_unit_size > 0 {
                    Some(p.edit_unit_size)
                } else {
                    None
                }
            }
            Descriptor::Sound(s) => {
                if s.essence_type != EssenceType::WavePcm || s.sample_size == 0 {
                    return None;
                }
                let sequence = sample_sequence(edit_rate, s.sampling_rate)?;
                if sequence.len() == 1 {
                    Some(sequence[0] * s.sample_size)
                } else {
                    None
                }
            }
        }
    }
}

/// Per-edit-unit audio sample counts for an edit rate / sampling rate pair.
///
/// An integer ratio yields a single-element sequence; 1001-denominator
/// rates yield the repeating NTSC pattern. Returns None when the rates are
/// invalid or the pattern would be unreasonably long.
pub fn sample_sequence(edit_rate: EditRate, sampling_rate: Rational) -> Option<Vec<u32>> {
    if edit_rate.numerator <= 0
        || edit_rate.denominator <= 0
        || sampling_rate.numerator <= 0
        || sampling_rate.denominator <= 0
    {
        return None;
    }

    // samples per edit unit = num / den
    let num = sampling_rate.numerator as i64 * edit_rate.denominator as i64;
    let den = sampling_rate.denominator as i64 * edit_rate.numerator as i64;

    let g = gcd(num, den);
    let len = den / g;
    if len > 16 {
        return None;
    }

    let mut sequence = Vec::with_capacity(len as usize);
    for i in 0..len {
        let count = ((i + 1) * num) / den - (i * num) / den;
        sequence.push(count as u32);
    }
    Some(sequence)
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_sequence_integer() {
        let seq = sample_sequence(Rational::fps_25(), Rational::hz_48k()).unwrap();
        assert_eq!(seq, vec![1920]);
    }

    #[test]
    fn test_sample_sequence_ntsc() {
        let seq = sample_sequence(Rational::fps_29_97(), Rational::hz_48k()).unwrap();
        assert_eq!(seq.len(), 5);
        assert_eq!(seq.iter().sum::<u32>(), 8008);
        assert!(seq.iter().all(|&n| n == 1601 || n == 1602));
    }

    #[test]
    fn test_sample_sequence_invalid() {
        assert!(sample_sequence(Rational::new(0, 1), Rational::hz_48k()).is_none());
        assert!(sample_sequence(Rational::fps_25(), Rational::new(-48000, 1)).is_none());
    }

    #[test]
    fn test_pcm_edit_unit_size() {
        let desc = Descriptor::Sound(SoundDescriptor::new(Rational::hz_48k(), 2, 16));
        assert_eq!(desc.constant_edit_unit_size(Rational::fps_25()), Some(1920 * 4));

        // NTSC rates have no constant size
        assert_eq!(desc.constant_edit_unit_size(Rational::fps_29_97()), None);
    }

    #[test]
    fn test_picture_edit_unit_size() {
        let desc = Descriptor::Picture(PictureDescriptor::new(EssenceType::UncSd, 720 * 576 * 2));
        assert_eq!(
            desc.constant_edit_unit_size(Rational::fps_25()),
            Some(720 * 576 * 2)
        );

        let desc = Descriptor::Picture(PictureDescriptor::new(EssenceType::Avc, 0));
        assert_eq!(desc.constant_edit_unit_size(Rational::fps_25()), None);
    }

    #[test]
    fn test_parse_wave_descriptor() {
        let mut value = Vec::new();
        // 3D03 sampling rate 48000/1
        value.extend_from_slice(&[0x3D, 0x03, 0x00, 0x08]);
        value.extend_from_slice(&48000u32.to_be_bytes());
        value.extend_from_slice(&1u32.to_be_bytes());
        // 3D07 channel count 2
        value.extend_from_slice(&[0x3D, 0x07, 0x00, 0x04]);
        value.extend_from_slice(&2u32.to_be_bytes());
        // 3D01 quantization bits 24
        value.extend_from_slice(&[0x3D, 0x01, 0x00, 0x04]);
        value.extend_from_slice(&24u32.to_be_bytes());

        let desc = SoundDescriptor::parse_wave(&value).unwrap();
        assert_eq!(desc.sampling_rate, Rational::hz_48k());
        assert_eq!(desc.channel_count, 2);
        assert_eq!(desc.quantization_bits, 24);
        assert_eq!(desc.sample_size, 6);
    }

    #[test]
    fn test_parse_wave_block_align_wins() {
        let mut value = Vec::new();
        value.extend_from_slice(&[0x3D, 0x07, 0x00, 0x04]);
        value.extend_from_slice(&2u32.to_be_bytes());
        value.extend_from_slice(&[0x3D, 0x01, 0x00, 0x04]);
        value.extend_from_slice(&16u32.to_be_bytes());
        value.extend_from_slice(&[0x3D, 0x0A, 0x00, 0x02]);
        value.extend_from_slice(&8u16.to_be_bytes());

        let desc = SoundDescriptor::parse_wave(&value).unwrap();
        assert_eq!(desc.sample_size, 8);
    }

    #[test]
    fn test_parse_wave_overrun_rejected() {
        let value = [0x3D, 0x03, 0x00, 0x20, 0x00];
        assert!(SoundDescriptor::parse_wave(&value).is_err());
    }
}
