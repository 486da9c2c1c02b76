//! Byte-range planning
//!
//! Splits a file into `shard_count` non-overlapping ranges whose interior
//! boundaries are snapped forward to the byte after the next record
//! separator, so every record's first byte lies in exactly one range.

use super::errors::{EngineError, EngineResult};
use super::ByteRange;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

/// Records are newline-terminated lines.
pub const RECORD_SEPARATOR: u8 = b'\n';

/// Plan record-aligned byte ranges over a file of `file_length` bytes.
///
/// Interior candidate boundaries sit at `i * file_length / shard_count`
/// and are each moved forward to just past the next separator. The first
/// boundary is pinned to 0 and the last to `file_length`; neither is
/// searched. When the forward scan for a boundary reaches end-of-file the
/// remaining candidates collapse to zero width and are dropped, so a shard
/// count larger than the line count yields fewer, still-valid ranges.
pub fn plan<R: Read + Seek>(
    input: &mut R,
    file_length: u64,
    shard_count: usize,
) -> EngineResult<Vec<ByteRange>> {
    if shard_count < 1 {
        return Err(EngineError::InvalidConfiguration {
            field: "shard_count".to_string(),
            value: shard_count.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    if file_length == 0 {
        return Err(EngineError::InvalidConfiguration {
            field: "input".to_string(),
            value: "0 bytes".to_string(),
            reason: "input file is empty".to_string(),
        });
    }

    let mut reader = BufReader::new(input);
    let mut ranges = Vec::with_capacity(shard_count);
    let mut current = 0u64;

    for i in 0..shard_count {
        if current >= file_length {
            break;
        }
        if i == shard_count - 1 {
            ranges.push(ByteRange {
                start: current,
                end: file_length,
                index: ranges.len() as u32,
            });
            break;
        }

        // A long record can push the snapped boundary past the next naive
        // candidate; scanning from the later of the two keeps ranges ordered.
        let naive = ((i as u64 + 1) * file_length / shard_count as u64).max(current);
        let end = next_boundary(&mut reader, naive, file_length)
            .map_err(|e| EngineError::io("scanning for a range boundary", None, e))?;

        ranges.push(ByteRange {
            start: current,
            end,
            index: ranges.len() as u32,
        });
        current = end;
    }

    Ok(ranges)
}

/// Byte offset just past the first separator at or after `naive`.
fn next_boundary<R: Read + Seek>(
    reader: &mut BufReader<R>,
    naive: u64,
    file_length: u64,
) -> std::io::Result<u64> {
    if naive >= file_length {
        return Ok(file_length);
    }
    reader.seek(SeekFrom::Start(naive))?;
    let mut scratch = Vec::new();
    let consumed = reader.read_until(RECORD_SEPARATOR, &mut scratch)?;
    Ok(naive + consumed as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lines(n: usize, width: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..n {
            data.extend_from_slice(format!("{i:0w$}\n", w = width - 1).as_bytes());
        }
        data
    }

    fn assert_contiguous(ranges: &[ByteRange], file_length: u64) {
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[ranges.len() - 1].end, file_length);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[0].end);
        }
    }

    #[test]
    fn ranges_cover_file_exactly() {
        let data = lines(100, 10);
        let length = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let ranges = plan(&mut cursor, length, 7).unwrap();
        assert_contiguous(&ranges, length);
    }

    #[test]
    fn boundaries_land_after_separators() {
        let data = lines(50, 8);
        let length = data.len() as u64;
        let mut cursor = Cursor::new(data.clone());
        let ranges = plan(&mut cursor, length, 4).unwrap();
        for range in &ranges[..ranges.len() - 1] {
            assert_eq!(data[range.end as usize - 1], RECORD_SEPARATOR);
        }
    }

    #[test]
    fn single_shard_spans_everything() {
        let data = lines(10, 6);
        let length = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let ranges = plan(&mut cursor, length, 1).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0], ByteRange { start: 0, end: length, index: 0 });
    }

    #[test]
    fn more_shards_than_lines_drops_empty_ranges() {
        let data = b"a,1\nb,2\nc,3\n".to_vec();
        let length = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let ranges = plan(&mut cursor, length, 16).unwrap();
        assert!(ranges.len() <= 3);
        assert_contiguous(&ranges, length);
    }

    #[test]
    fn missing_trailing_newline_still_covered() {
        let data = b"alpha,1\nbeta,2\ngamma,3".to_vec();
        let length = data.len() as u64;
        let mut cursor = Cursor::new(data);
        let ranges = plan(&mut cursor, length, 2).unwrap();
        assert_contiguous(&ranges, length);
    }

    #[test]
    fn rejects_zero_shards_and_empty_files() {
        let mut cursor = Cursor::new(b"x\n".to_vec());
        assert!(matches!(
            plan(&mut cursor, 2, 0),
            Err(EngineError::InvalidConfiguration { .. })
        ));
        assert!(matches!(
            plan(&mut cursor, 0, 2),
            Err(EngineError::InvalidConfiguration { .. })
        ));
    }
}
