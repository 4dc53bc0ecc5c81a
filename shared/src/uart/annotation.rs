/*!
Diagnostic side channel: markers keyed by raw sample offset.

The file form holds one byte per sample offset so it can be laid over a
printable rendering of the capture; offsets without a marker are spaces.
*/

use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};

use crate::error::Result;

/// Sync acquired at this sample
pub const MARK_SYNC: u8 = b'!';
/// A logical bit was sampled here
pub const MARK_SAMPLE: u8 = b'b';
/// The frame starting here failed start/stop validation
pub const MARK_FRAMING: u8 = b'x';

const FILLER: u8 = b' ';

/// Receives decoder events keyed by sample offset
pub trait AnnotationSink {
    fn mark(&mut self, offset: u64, marker: u8) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards all annotations
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnnotations;

impl AnnotationSink for NullAnnotations {
    #[inline]
    fn mark(&mut self, _offset: u64, _marker: u8) -> Result<()> {
        Ok(())
    }
}

/// Collects annotations in memory
impl AnnotationSink for Vec<(u64, u8)> {
    fn mark(&mut self, offset: u64, marker: u8) -> Result<()> {
        self.push((offset, marker));
        Ok(())
    }
}

/// Byte-per-offset overlay file
pub struct FileAnnotations<W: Write + Seek> {
    out: BufWriter<W>,
    cursor: u64,
}

impl<W: Write + Seek> FileAnnotations<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: BufWriter::new(inner),
            cursor: 0,
        }
    }

    /// Flush and return the underlying writer
    pub fn into_inner(self) -> Result<W> {
        self.out.into_inner().map_err(|e| e.into_error().into())
    }
}

impl<W: Write + Seek> AnnotationSink for FileAnnotations<W> {
    fn mark(&mut self, offset: u64, marker: u8) -> Result<()> {
        if offset >= self.cursor {
            let gap = offset - self.cursor;
            io::copy(&mut io::repeat(FILLER).take(gap), &mut self.out)?;
            self.out.write_all(&[marker])?;
            self.cursor = offset + 1;
        } else {
            // Markers arrive almost in order; step back for the rare late one
            self.out.seek(SeekFrom::Start(offset))?;
            self.out.write_all(&[marker])?;
            self.out.seek(SeekFrom::Start(self.cursor))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_markers_land_at_their_offsets() {
        let mut ann = FileAnnotations::new(Cursor::new(Vec::new()));
        ann.mark(2, MARK_SYNC).unwrap();
        ann.mark(5, MARK_SAMPLE).unwrap();
        ann.mark(3, MARK_FRAMING).unwrap();
        ann.mark(7, MARK_SAMPLE).unwrap();
        ann.finish().unwrap();

        let bytes = ann.into_inner().unwrap().into_inner();
        assert_eq!(bytes, b"  !x b b".to_vec());
    }

    #[test]
    fn test_file_backed_overlay() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut ann = FileAnnotations::new(file.reopen().unwrap());
        ann.mark(0, MARK_SYNC).unwrap();
        ann.mark(4, MARK_SAMPLE).unwrap();
        ann.finish().unwrap();
        drop(ann);

        let content = std::fs::read(file.path()).unwrap();
        assert_eq!(content, b"!   b".to_vec());
    }
}
