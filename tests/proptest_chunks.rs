//! Property-based tests for the essence chunk index.
//!
//! Uses proptest to verify the offset/position mapping invariants over
//! randomly shaped chunk layouts, and that the binary-search lookup agrees
//! with a straightforward linear scan.

use mxf_essence::{EssenceChunkIndex, Partition, Wrapping};
use proptest::prelude::*;

/// Random chunk layout: per-chunk sizes and the file gaps between chunks
/// (partition packs, metadata, other streams).
fn layouts() -> impl Strategy<Value = (Vec<(i64, i64)>, i64)> {
    (
        prop::collection::vec((1i64..=4096, 0i64..=512), 1..=20),
        64i64..=1024,
    )
}

/// Build a clip-wrapped index whose chunks follow the generated layout.
fn build_index(chunks: &[(i64, i64)], first_file_position: i64) -> EssenceChunkIndex {
    let mut index = EssenceChunkIndex::new(Wrapping::Clip, 0);
    let mut essence_offset = 0i64;
    let mut file_position = first_file_position;
    for (id, &(size, gap)) in chunks.iter().enumerate() {
        let mut partition = Partition::body();
        partition.body_sid = 1;
        partition.body_offset = essence_offset as u64;
        index
            .append_chunk(&partition, id, file_position, 1, size as u64)
            .unwrap();
        essence_offset += size;
        file_position += size + gap;
    }
    index.set_complete();
    index
}

/// Reference lookup: linear scan over the chunk list.
fn linear_file_position(chunks: &[(i64, i64)], first: i64, essence_offset: i64) -> Option<i64> {
    let mut chunk_offset = 0i64;
    let mut file_position = first;
    for &(size, gap) in chunks {
        if essence_offset >= chunk_offset && essence_offset <= chunk_offset + size {
            // the boundary resolves into the next chunk when one follows
            if essence_offset < chunk_offset + size {
                return Some(file_position + (essence_offset - chunk_offset));
            }
        }
        chunk_offset += size;
        file_position += size + gap;
    }
    let total: i64 = chunks.iter().map(|&(size, _)| size).sum();
    if essence_offset == total {
        // inclusive tail of the last chunk
        let (size, gap) = chunks[chunks.len() - 1];
        return Some(file_position - gap - size + (essence_offset - (total - size)));
    }
    None
}

proptest! {
    /// Adjacent chunks cover a continuous essence offset space.
    #[test]
    fn chunks_are_contiguous((layout, first) in layouts()) {
        let index = build_index(&layout, first);
        let chunks = index.chunks();
        prop_assert_eq!(chunks[0].essence_offset, 0);
        for pair in chunks.windows(2) {
            prop_assert_eq!(
                pair[1].essence_offset,
                pair[0].essence_offset + pair[0].size
            );
        }
        let total: i64 = layout.iter().map(|&(size, _)| size).sum();
        prop_assert_eq!(index.essence_data_size(), total);
    }

    /// Offset -> position -> offset round-trips inside complete chunks.
    #[test]
    fn mapping_round_trips((layout, first) in layouts(), seed in 0u64..1_000_000) {
        let mut index = build_index(&layout, first);
        let total: i64 = layout.iter().map(|&(size, _)| size).sum();
        let offset = (seed as i64) % total;

        let position = index.get_file_position(offset).unwrap();
        prop_assert_eq!(index.get_essence_offset(position).unwrap(), offset);
    }

    /// The binary-search lookup agrees with a linear reference scan,
    /// including boundary and out-of-range offsets.
    #[test]
    fn lookup_matches_linear_scan((layout, first) in layouts(), seed in 0u64..1_000_000) {
        let mut index = build_index(&layout, first);
        let total: i64 = layout.iter().map(|&(size, _)| size).sum();
        // probe around the whole covered range, including one past the end
        let offset = (seed as i64) % (total + 2);

        let expected = linear_file_position(&layout, first, offset);
        match index.get_file_position(offset) {
            Ok(position) => prop_assert_eq!(Some(position), expected),
            Err(_) => prop_assert_eq!(None, expected),
        }
    }

    /// Sequential access through a hint, then a random jump, stays correct.
    #[test]
    fn hint_does_not_affect_results((layout, first) in layouts(), seed in 0u64..1_000_000) {
        let mut index = build_index(&layout, first);
        let total: i64 = layout.iter().map(|&(size, _)| size).sum();
        let jump = (seed as i64) % total;

        // warm the hint by walking forward
        let step = (total / 7).max(1);
        let mut offset = 0;
        while offset < total {
            index.get_file_position(offset).unwrap();
            offset += step;
        }

        let position = index.get_file_position(jump).unwrap();
        prop_assert_eq!(index.get_essence_offset(position).unwrap(), jump);
    }
}
