use crate::{allocation_granularity, Mapping, Region, ShmemError};

/// Default first chunk size: large enough that most regions map in one piece,
/// small enough to leave room in a 32-bit address space.
#[cfg(target_pointer_width = "64")]
const STARTING_CHUNK_BYTES: u64 = 1 << 30; // 1 GiB
#[cfg(not(target_pointer_width = "64"))]
const STARTING_CHUNK_BYTES: u64 = 1 << 28; // 256 MiB

/// Resilient sequential read/write over a [`Region`] that may be too large to
/// map in one piece.
///
/// The cursor maps page-aligned chunks on demand. Chunk size starts at
/// [`STARTING_CHUNK_BYTES`], is always a power of two and never drops below
/// the allocation granularity; every mapping failure halves it and retries,
/// so a fragmented address space degrades throughput instead of failing the
/// operation. Crossing a chunk boundary invalidates the cached mapping
/// lazily. Operations may span any number of chunks; atomicity is only
/// page-granular.
#[derive(Debug)]
pub struct Cursor {
    region: Option<Region>,
    offset: u64,
    chunk_size: u64,
    /// Cached mapping and the absolute offset it starts at. Always covers the
    /// chunk containing `offset` when present.
    cached: Option<(u64, Mapping)>,
    /// Test hook: mapping attempts longer than this fail as if the address
    /// space were exhausted.
    map_ceiling: Option<u64>,
}

impl Cursor {
    /// Take exclusive ownership of `region`.
    pub fn new(region: Region) -> Cursor {
        Cursor {
            region: Some(region),
            offset: 0,
            chunk_size: STARTING_CHUNK_BYTES.max(allocation_granularity() as u64),
            cached: None,
            map_ceiling: None,
        }
    }

    /// Current absolute offset.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Bytes remaining between the offset and the end of the region.
    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.offset)
    }

    fn size(&self) -> u64 {
        self.region.as_ref().map_or(0, Region::size)
    }

    /// Move the offset. Clamped to `[0, size]`.
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset.min(self.size());
    }

    /// Relinquish the region, invalidating the cursor. Subsequent reads and
    /// writes fail with `OutOfRange` against a zero-size region.
    pub fn take_region(&mut self) -> Option<Region> {
        self.cached = None;
        self.offset = 0;
        self.region.take()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), ShmemError> {
        self.check_span(buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let within = self.ensure_chunk()?;
            let map = &self.cached.as_ref().expect("ensure_chunk populated cache").1;
            let span = (map.len() - within).min(buf.len() - done);
            map.read_at(within, &mut buf[done..done + span])?;
            done += span;
            self.advance(within, span, map.len());
        }
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<(), ShmemError> {
        self.check_span(buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let within = self.ensure_chunk()?;
            let map = &self.cached.as_ref().expect("ensure_chunk populated cache").1;
            let span = (map.len() - within).min(buf.len() - done);
            map.write_at(within, &buf[done..done + span])?;
            done += span;
            self.advance(within, span, map.len());
        }
        Ok(())
    }

    fn check_span(&self, len: usize) -> Result<(), ShmemError> {
        if len as u64 > self.remaining() {
            return Err(ShmemError::OutOfRange {
                offset: self.offset,
                len,
                size: self.size(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, within: usize, span: usize, map_len: usize) {
        self.offset += span as u64;
        if within + span == map_len {
            // Boundary crossed; the next ensure_chunk call remaps.
            self.cached = None;
        }
    }

    /// Make sure a mapping covering the chunk containing `offset` is cached.
    /// Returns the offset within the cached mapping.
    fn ensure_chunk(&mut self) -> Result<usize, ShmemError> {
        if let Some((start, map)) = &self.cached {
            if self.offset >= *start && self.offset < *start + map.len() as u64 {
                return Ok((self.offset - start) as usize);
            }
            self.cached = None;
        }

        let region = self.region.as_ref().ok_or(ShmemError::OutOfRange {
            offset: self.offset,
            len: 0,
            size: 0,
        })?;
        let granularity = allocation_granularity() as u64;

        loop {
            let chunk_start = self.offset & !(self.chunk_size - 1);
            let len = self.chunk_size.min(region.size() - chunk_start) as usize;
            let attempt = match self.map_ceiling {
                Some(ceiling) if len as u64 > ceiling => Err(ShmemError::MapFailed(
                    std::io::Error::from_raw_os_error(libc::ENOMEM),
                )),
                _ => region.map_range(chunk_start, len),
            };
            match attempt {
                Ok(map) => {
                    let within = (self.offset - chunk_start) as usize;
                    self.cached = Some((chunk_start, map));
                    return Ok(within);
                }
                Err(ShmemError::MapFailed(err)) => {
                    if self.chunk_size / 2 < granularity {
                        tracing::warn!(
                            chunk_size = self.chunk_size,
                            "cursor chunk mapping failed at the granularity floor: {err}"
                        );
                        return Err(ShmemError::GranularityFloor);
                    }
                    self.chunk_size /= 2;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Test hook: force a specific chunk size (power of two, >= granularity).
    #[doc(hidden)]
    pub fn set_chunk_size(&mut self, chunk_size: u64) {
        assert!(chunk_size.is_power_of_two());
        assert!(chunk_size >= allocation_granularity() as u64);
        self.chunk_size = chunk_size;
        self.cached = None;
    }

    /// Test hook: make mapping attempts above `bytes` fail, as a fragmented
    /// address space would.
    #[doc(hidden)]
    pub fn set_map_ceiling(&mut self, bytes: u64) {
        self.map_ceiling = Some(bytes);
        self.cached = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let region = Region::create(1 << 16).unwrap();
        let mut cursor = Cursor::new(region);

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        cursor.seek(37);
        cursor.write(&data).unwrap();

        cursor.seek(37);
        let mut got = vec![0u8; data.len()];
        cursor.read(&mut got).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn operations_span_chunk_boundaries() {
        let granularity = allocation_granularity() as u64;
        let region = Region::create(granularity * 4).unwrap();
        let mut cursor = Cursor::new(region);
        cursor.set_chunk_size(granularity);

        // A write that crosses three chunk boundaries.
        let data: Vec<u8> = (0..(granularity as usize * 3)).map(|i| (i % 199) as u8).collect();
        cursor.seek(granularity / 2);
        cursor.write(&data).unwrap();
        assert_eq!(cursor.position(), granularity / 2 + data.len() as u64);

        cursor.seek(granularity / 2);
        let mut got = vec![0u8; data.len()];
        cursor.read(&mut got).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let region = Region::create(4096).unwrap();
        let mut cursor = Cursor::new(region);
        cursor.seek(4090);
        let mut buf = [0u8; 16];
        assert!(matches!(
            cursor.read(&mut buf),
            Err(ShmemError::OutOfRange { .. })
        ));
    }

    #[test]
    fn seek_clamps_to_region_size() {
        let region = Region::create(4096).unwrap();
        let mut cursor = Cursor::new(region);
        cursor.seek(1 << 40);
        assert_eq!(cursor.position(), 4096);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn chunk_size_shrinks_until_mapping_succeeds() {
        let granularity = allocation_granularity() as u64;
        let region = Region::create(granularity * 4).unwrap();
        let mut cursor = Cursor::new(region);
        // Only granularity-sized mappings succeed; the first attempt wants
        // the whole region and must halve its way down.
        cursor.set_map_ceiling(granularity);

        let data: Vec<u8> = (0..(granularity as usize * 2)).map(|i| (i % 83) as u8).collect();
        cursor.write(&data).unwrap();
        cursor.seek(0);
        let mut got = vec![0u8; data.len()];
        cursor.read(&mut got).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn shrinking_terminates_at_the_granularity_floor() {
        let granularity = allocation_granularity() as u64;
        let region = Region::create(granularity * 4).unwrap();
        let mut cursor = Cursor::new(region);
        // Nothing maps; halving must bottom out instead of looping.
        cursor.set_map_ceiling(0);

        let mut buf = [0u8; 1];
        assert!(matches!(
            cursor.read(&mut buf),
            Err(ShmemError::GranularityFloor)
        ));
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn relinquished_cursor_is_invalid() {
        let region = Region::create(4096).unwrap();
        let mut cursor = Cursor::new(region);
        let taken = cursor.take_region().unwrap();
        assert_eq!(taken.size(), 4096);
        let mut buf = [0u8; 1];
        assert!(cursor.read(&mut buf).is_err());
        assert_eq!(cursor.remaining(), 0);
    }
}
