use plume_shmem::{allocation_granularity, Cursor, Region};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any sequence of writes at arbitrary offsets reads back identically,
    /// regardless of chunk size, including the minimum chunk size where most
    /// operations straddle boundaries.
    #[test]
    fn writes_read_back_across_chunk_sizes(
        ops in prop::collection::vec(
            (0u64..3 * 4096, prop::collection::vec(any::<u8>(), 1..2048)),
            1..16,
        ),
        chunk_shift in 0u32..3,
    ) {
        let granularity = allocation_granularity() as u64;
        let size = granularity * 4;
        let region = Region::create(size).unwrap();
        let mut cursor = Cursor::new(region);
        cursor.set_chunk_size(granularity << chunk_shift);

        // Shadow copy holds the expected contents.
        let mut shadow = vec![0u8; size as usize];
        for (offset, data) in &ops {
            let offset = offset % (size - data.len() as u64);
            cursor.seek(offset);
            cursor.write(data).unwrap();
            shadow[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }

        cursor.seek(0);
        let mut got = vec![0u8; size as usize];
        cursor.read(&mut got).unwrap();
        prop_assert_eq!(got, shadow);
    }

    /// Reads that extend past the end of the region always fail and never
    /// advance the offset.
    #[test]
    fn overlong_reads_fail_cleanly(offset in 0u64..8192, len in 1usize..16384) {
        let region = Region::create(8192).unwrap();
        let mut cursor = Cursor::new(region);
        cursor.seek(offset);
        let mut buf = vec![0u8; len];
        if offset + len as u64 > 8192 {
            prop_assert!(cursor.read(&mut buf).is_err());
            prop_assert_eq!(cursor.position(), offset);
        } else {
            prop_assert!(cursor.read(&mut buf).is_ok());
            prop_assert_eq!(cursor.position(), offset + len as u64);
        }
    }
}
