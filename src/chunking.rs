//! Fixed six-way chunk boundary math, shared by the upload and
//! download coordinators so the two agree on offsets without either
//! persisting them.

/// Every file is split into exactly six chunks.
pub const CHUNK_COUNT: usize = 6;

/// One chunk's span within the file: `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into six contiguous, non-overlapping spans whose
/// lengths differ by at most one byte: `base = size / 6`, and the
/// first `size % 6` chunks get `base + 1`.
pub fn plan(size: u64) -> [ChunkSpan; CHUNK_COUNT] {
    let base = size / CHUNK_COUNT as u64;
    let remainder = size % CHUNK_COUNT as u64;

    let mut spans = [ChunkSpan { index: 0, offset: 0, len: 0 }; CHUNK_COUNT];
    let mut offset = 0;
    for (i, span) in spans.iter_mut().enumerate() {
        let len = if (i as u64) < remainder { base + 1 } else { base };
        *span = ChunkSpan { index: i, offset, len };
        offset += len;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_six_way_split() {
        let spans = plan(6 * 1024);
        for s in &spans {
            assert_eq!(s.len, 1024);
        }
        assert_eq!(spans[0].offset, 0);
        assert_eq!(spans[5].offset, 5 * 1024);
    }

    #[test]
    fn remainder_distribution() {
        let spans = plan(1_000_003);
        let sizes: Vec<u64> = spans.iter().map(|s| s.len).collect();
        assert_eq!(sizes, vec![166_668, 166_667, 166_667, 166_667, 166_667, 166_667]);
        assert_eq!(sizes.iter().sum::<u64>(), 1_000_003);
    }

    #[test]
    fn spans_are_contiguous_and_non_overlapping() {
        let spans = plan(987_654);
        let mut expected_offset = 0;
        for s in &spans {
            assert_eq!(s.offset, expected_offset);
            expected_offset += s.len;
        }
        assert_eq!(expected_offset, 987_654);
    }

    #[test]
    fn small_file_still_produces_six_chunks() {
        // S < 6 bytes: base = 0, remainder = S, so the first S chunks
        // get exactly 1 byte and the rest are empty.
        let spans = plan(3);
        let sizes: Vec<u64> = spans.iter().map(|s| s.len).collect();
        assert_eq!(sizes, vec![1, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn sizes_within_one_byte_of_each_other() {
        for size in [1u64, 5, 6, 7, 1_000_003, 6_442_450_944] {
            let spans = plan(size);
            let min = spans.iter().map(|s| s.len).min().unwrap();
            let max = spans.iter().map(|s| s.len).max().unwrap();
            assert!(max - min <= 1);
            assert_eq!(spans.iter().map(|s| s.len).sum::<u64>(), size);
        }
    }

    proptest::proptest! {
        #[test]
        fn chunking_partition_holds_for_any_size(size in 0u64..=(10u64 * 1024 * 1024 * 1024)) {
            let spans = plan(size);
            let total: u64 = spans.iter().map(|s| s.len).sum();
            proptest::prop_assert_eq!(total, size);
            proptest::prop_assert_eq!(spans.len(), CHUNK_COUNT);

            let min = spans.iter().map(|s| s.len).min().unwrap();
            let max = spans.iter().map(|s| s.len).max().unwrap();
            proptest::prop_assert!(max - min <= 1);

            let mut expected_offset = 0u64;
            for s in &spans {
                proptest::prop_assert_eq!(s.offset, expected_offset);
                expected_offset += s.len;
            }
        }
    }
}
