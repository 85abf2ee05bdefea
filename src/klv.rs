//! KLV stream access.
//!
//! All data in an MXF file is encoded as KLV triplets: a 16-byte Universal
//! Label key, a BER-encoded length and the value bytes. [`KlvStream`] wraps
//! a seekable byte source, reads KL headers and owns the partition list
//! discovered so far.

use crate::error::{EssenceError, Result};
use crate::partition::Partition;
use crate::ul::{UniversalLabel, UL};
use std::io::{Read, Seek, SeekFrom};

/// Byte length of a KLV key
pub const KEY_LEN: u8 = 16;

/// A KL header: key, length-field size and value length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kl {
    pub key: UniversalLabel,
    /// Number of bytes the BER length field occupied (1..=9)
    pub llen: u8,
    /// Value length in bytes
    pub len: u64,
}

impl Kl {
    /// Total byte length of the KL header
    pub fn header_len(&self) -> i64 {
        KEY_LEN as i64 + self.llen as i64
    }
}

/// Seekable KLV stream with the partition list built so far
pub struct KlvStream<R> {
    inner: R,
    partitions: Vec<Partition>,
}

impl<R: Read + Seek> KlvStream<R> {
    /// Wrap a seekable byte source
    pub fn new(inner: R) -> Self {
        KlvStream {
            inner,
            partitions: Vec::new(),
        }
    }

    /// Current byte position
    pub fn tell(&mut self) -> Result<i64> {
        Ok(self.inner.stream_position()? as i64)
    }

    /// Seek to an absolute byte position
    pub fn seek(&mut self, position: i64) -> Result<()> {
        if position < 0 {
            return Err(EssenceError::BadArgument("negative seek position"));
        }
        self.inner.seek(SeekFrom::Start(position as u64))?;
        Ok(())
    }

    /// Skip forward over `len` bytes
    pub fn skip(&mut self, len: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Current(len as i64))?;
        Ok(())
    }

    /// Total stream size in bytes
    pub fn size(&mut self) -> Result<i64> {
        let pos = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(end as i64)
    }

    /// True once the cursor is at or past the end of the stream
    pub fn eof(&mut self) -> Result<bool> {
        Ok(self.tell()? >= self.size()?)
    }

    /// Read up to `buf.len()` bytes, returning the count actually read
    pub fn read_at_most(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.inner.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Read exactly `buf.len()` bytes or fail with `ShortRead`
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at_most(buf)?;
        if n != buf.len() {
            return Err(EssenceError::ShortRead {
                requested: buf.len() as u64,
                read: n as u64,
            });
        }
        Ok(())
    }

    /// Read a 16-byte key and a BER length
    pub fn read_kl(&mut self) -> Result<Kl> {
        let mut key: UL = [0; 16];
        let mut first = [0u8; 1];
        std::io::Read::read_exact(&mut self.inner, &mut key)?;
        std::io::Read::read_exact(&mut self.inner, &mut first)?;

        let (len, llen) = if first[0] < 0x80 {
            (first[0] as u64, 1)
        } else if first[0] == 0x80 {
            return Err(EssenceError::Malformed(
                "indefinite BER length not supported".into(),
            ));
        } else {
            let num_bytes = (first[0] & 0x7F) as usize;
            if num_bytes > 8 {
                return Err(EssenceError::Malformed(format!(
                    "BER length field of {} bytes",
                    num_bytes
                )));
            }
            let mut bytes = [0u8; 8];
            std::io::Read::read_exact(&mut self.inner, &mut bytes[..num_bytes])?;
            let mut len: u64 = 0;
            for byte in &bytes[..num_bytes] {
                len = (len << 8) | *byte as u64;
            }
            (len, 1 + num_bytes as u8)
        };

        Ok(Kl {
            key: UniversalLabel(key),
            llen,
            len,
        })
    }

    /// Read the next KL, skipping fill items
    pub fn read_next_non_filler_kl(&mut self) -> Result<Kl> {
        loop {
            let kl = self.read_kl()?;
            if !kl.key.is_fill_item() {
                return Ok(kl);
            }
            self.skip(kl.len)?;
        }
    }

    /// Parse a partition pack value and append it to the partition list.
    ///
    /// The cursor must be positioned just past the KL of the pack; `key`
    /// and `len` are the header that was already read.
    pub fn read_next_partition(&mut self, key: &UniversalLabel, len: u64) -> Result<()> {
        let mut value = vec![0u8; len as usize];
        self.read_exact(&mut value)?;
        let partition = Partition::parse(key, &value)?;
        self.partitions.push(partition);
        Ok(())
    }

    /// Read and append the partition pack at the start of the file
    pub fn read_header_partition(&mut self) -> Result<()> {
        self.seek(0)?;
        let kl = self.read_kl()?;
        if !kl.key.is_partition_pack() {
            return Err(EssenceError::Malformed(
                "file does not start with a partition pack".into(),
            ));
        }
        self.read_next_partition(&kl.key, kl.len)?;
        Ok(())
    }

    /// Walk the whole file and append every partition pack found.
    ///
    /// Intended for complete files; declared ThisPartition values that
    /// disagree with the actual position are fixed up in memory.
    pub fn scan_partitions(&mut self) -> Result<()> {
        self.seek(0)?;
        while !self.eof()? {
            let position = self.tell()?;
            let kl = self.read_kl()?;
            if kl.key.is_partition_pack() {
                self.read_next_partition(&kl.key, kl.len)?;
                let idx = self.partitions.len() - 1;
                if self.partitions[idx].this_partition != position {
                    log::warn!(
                        "Updating (in-memory) partition property ThisPartition {} to actual \
                         file position {}",
                        self.partitions[idx].this_partition,
                        position
                    );
                    self.partitions[idx].set_this_partition(position);
                }
            } else {
                self.skip(kl.len)?;
            }
        }
        self.seek(0)?;
        Ok(())
    }

    /// Ordered list of partitions read so far
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Mutable access for in-memory partition fixups
    pub fn partitions_mut(&mut self) -> &mut [Partition] {
        &mut self.partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ul::labels;
    use std::io::Cursor;

    fn klv(key: UL, value: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&key);
        if value.len() < 0x80 {
            data.push(value.len() as u8);
        } else {
            data.push(0x82);
            data.extend_from_slice(&(value.len() as u16).to_be_bytes());
        }
        data.extend_from_slice(value);
        data
    }

    #[test]
    fn test_read_kl_short_form() {
        let data = klv(labels::FOOTER_PARTITION, &[1, 2, 3]);
        let mut stream = KlvStream::new(Cursor::new(data));

        let kl = stream.read_kl().unwrap();
        assert_eq!(kl.key.as_bytes(), &labels::FOOTER_PARTITION);
        assert_eq!(kl.llen, 1);
        assert_eq!(kl.len, 3);
        assert_eq!(kl.header_len(), 17);
    }

    #[test]
    fn test_read_kl_long_form() {
        let value = vec![0xAB; 300];
        let data = klv(labels::FOOTER_PARTITION, &value);
        let mut stream = KlvStream::new(Cursor::new(data));

        let kl = stream.read_kl().unwrap();
        assert_eq!(kl.llen, 3);
        assert_eq!(kl.len, 300);

        let mut buf = vec![0u8; 300];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, value);
        assert!(stream.eof().unwrap());
    }

    #[test]
    fn test_indefinite_length_rejected() {
        let mut data = labels::FOOTER_PARTITION.to_vec();
        data.push(0x80);
        let mut stream = KlvStream::new(Cursor::new(data));
        assert!(matches!(
            stream.read_kl(),
            Err(EssenceError::Malformed(_))
        ));
    }

    #[test]
    fn test_skip_filler() {
        let mut data = klv(labels::FILL_ITEM, &[0; 32]);
        data.extend_from_slice(&klv(labels::FOOTER_PARTITION, &[9]));
        let mut stream = KlvStream::new(Cursor::new(data));

        let kl = stream.read_next_non_filler_kl().unwrap();
        assert_eq!(kl.key.as_bytes(), &labels::FOOTER_PARTITION);
    }

    #[test]
    fn test_tell_seek_size() {
        let data = klv(labels::FOOTER_PARTITION, &[1, 2, 3, 4]);
        let size = data.len() as i64;
        let mut stream = KlvStream::new(Cursor::new(data));

        assert_eq!(stream.size().unwrap(), size);
        stream.seek(16).unwrap();
        assert_eq!(stream.tell().unwrap(), 16);
        stream.skip(1).unwrap();
        assert_eq!(stream.tell().unwrap(), 17);
        assert!(!stream.eof().unwrap());
    }

    #[test]
    fn test_short_read() {
        let data = klv(labels::FOOTER_PARTITION, &[1, 2]);
        let mut stream = KlvStream::new(Cursor::new(data));
        stream.read_kl().unwrap();

        let mut buf = [0u8; 10];
        assert!(matches!(
            stream.read_exact(&mut buf),
            Err(EssenceError::ShortRead {
                requested: 10,
                read: 2
            })
        ));
    }
}
