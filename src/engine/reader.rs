//! Chunked record reading over one byte range
//!
//! Every worker opens its own handle; handles are never shared. The reader
//! yields exactly the records whose first byte lies inside the range, and
//! parses the record that crosses the range end in full, so record
//! ownership at boundaries is unambiguous.

use super::errors::{EngineError, EngineResult};
use super::planner::RECORD_SEPARATOR;
use super::ByteRange;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Reads the records fully owned by one byte range.
pub struct ChunkReader {
    reader: csv::Reader<BufReader<File>>,
    range: ByteRange,
    /// File offset where the csv reader started; csv positions are
    /// relative to it.
    base: u64,
    /// The header row lives at offset 0 and belongs to no range's data.
    skip_header: bool,
    byte_record: csv::ByteRecord,
    record: csv::StringRecord,
}

impl ChunkReader {
    /// Open `path` and position the reader at the first record owned by
    /// `range`.
    ///
    /// When the range does not start at offset 0 the byte just before the
    /// start is inspected: if it is not a record separator, the leading
    /// partial record was already consumed by the predecessor range and is
    /// skipped. Ranges produced by the planner are always aligned, so the
    /// skip only fires for externally supplied ranges.
    pub fn open(path: &Path, range: ByteRange) -> EngineResult<Self> {
        let file = File::open(path).map_err(|e| {
            EngineError::io(
                format!("opening {} for range {}", path.display(), range.index),
                Some(range.index),
                e,
            )
        })?;
        let mut buf = BufReader::new(file);
        let mut base = range.start;

        if range.start > 0 {
            buf.seek(SeekFrom::Start(range.start - 1)).map_err(|e| {
                EngineError::io(
                    format!("seeking to range {}", range.index),
                    Some(range.index),
                    e,
                )
            })?;
            let mut previous = [0u8; 1];
            buf.read_exact(&mut previous).map_err(|e| {
                EngineError::io(
                    format!("reading range {} boundary byte", range.index),
                    Some(range.index),
                    e,
                )
            })?;
            if previous[0] != RECORD_SEPARATOR {
                let mut skipped = Vec::new();
                let consumed = buf.read_until(RECORD_SEPARATOR, &mut skipped).map_err(|e| {
                    EngineError::io(
                        format!("skipping partial record in range {}", range.index),
                        Some(range.index),
                        e,
                    )
                })?;
                base = range.start + consumed as u64;
            }
        }

        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(buf);

        Ok(Self {
            reader,
            range,
            base,
            skip_header: range.start == 0,
            byte_record: csv::ByteRecord::new(),
            record: csv::StringRecord::new(),
        })
    }

    /// Next record whose first byte lies in `[start, end)`, or `None` once
    /// the range (or the file) is exhausted. Field data is decoded
    /// lossily, so encoding damage in one record never aborts a scan.
    pub fn next_record(&mut self) -> EngineResult<Option<&csv::StringRecord>> {
        loop {
            let offset = self.base + self.reader.position().byte();
            if offset >= self.range.end {
                return Ok(None);
            }
            let got = self
                .reader
                .read_byte_record(&mut self.byte_record)
                .map_err(|e| {
                    EngineError::io(
                        format!("reading records in range {}", self.range.index),
                        Some(self.range.index),
                        e,
                    )
                })?;
            if !got {
                return Ok(None);
            }
            if self.skip_header {
                self.skip_header = false;
                continue;
            }
            self.record = csv::StringRecord::from_byte_record_lossy(self.byte_record.clone());
            return Ok(Some(&self.record));
        }
    }
}
