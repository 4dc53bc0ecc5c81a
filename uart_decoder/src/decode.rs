/*!
Streams captured bits through the UART decoder.
*/

use std::io::{Read, Write};

use shared::{AnnotationSink, BitUnpacker, DecodeStats, RawSampleReader, Result, UartDecoder};

/// Capture file layout, chosen once per run
pub enum BitSource<R: Read> {
    Packed(BitUnpacker<R>),
    Raw(RawSampleReader<R>),
}

impl<R: Read> BitSource<R> {
    pub fn packed(source: R) -> Self {
        Self::Packed(BitUnpacker::new(source))
    }

    pub fn raw(source: R, signal_bit: u32) -> Self {
        Self::Raw(RawSampleReader::new(source, signal_bit))
    }

    /// Next signal sample, `None` at end of input
    pub fn get(&mut self) -> Result<Option<bool>> {
        match self {
            Self::Packed(unpacker) => unpacker.get(),
            Self::Raw(reader) => reader.get(),
        }
    }
}

/// Decode every sample of `source`, writing recovered bytes to `out`
pub fn decode_stream<R, W, A>(
    source: &mut BitSource<R>,
    mut decoder: UartDecoder<A>,
    out: &mut W,
) -> Result<(DecodeStats, A)>
where
    R: Read,
    W: Write + ?Sized,
    A: AnnotationSink,
{
    while let Some(bit) = source.get()? {
        if let Some(byte) = decoder.push(bit)? {
            out.write_all(&[byte])?;
        }
    }
    out.flush()?;
    decoder.finish()
}
