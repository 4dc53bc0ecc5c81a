/*!
# uart-decode

Recovers asynchronous-serial bytes from a bitstream captured by `iorec`.

## Usage

```bash
uart-decode capture.bin > received.txt
uart-decode --frame-length 116 --annotation-out capture.ann capture.bin
iorec --raw samples.raw && uart-decode --input-format raw samples.raw
```
*/

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use shared::protocol::{DEFAULT_FRAME_LENGTH, DEFAULT_FRAME_LENGTH_TOL, DEFAULT_SIGNAL_BIT};
use shared::uart::{FileAnnotations, NullAnnotations};
use shared::{AnnotationSink, BitOrder, DecoderConfig, UartDecoder};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod decode;

use decode::{decode_stream, BitSource};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputFormat {
    /// One bit per sample, 32 bits per word
    Packed,
    /// 32-bit samples, signal taken from --signal-bit
    Raw,
}

#[derive(Parser)]
#[command(name = "uart-decode")]
#[command(about = "Decode serial bytes from a captured iorec bitstream")]
#[command(version)]
struct Cli {
    /// Captured bitstream (standard input when omitted)
    input: Option<PathBuf>,

    /// Where to write decoded bytes (standard output when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Nominal samples per character
    #[arg(long, default_value_t = DEFAULT_FRAME_LENGTH)]
    frame_length: usize,

    /// Accepted deviation of a measured character width
    #[arg(long, default_value_t = DEFAULT_FRAME_LENGTH_TOL)]
    frame_length_tol: usize,

    /// Write a byte-per-sample annotation overlay to this file
    #[arg(long, value_name = "FILE")]
    annotation_out: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = InputFormat::Packed)]
    input_format: InputFormat,

    /// Data bit order: msb or lsb
    #[arg(long, default_value_t = BitOrder::MsbFirst)]
    bit_order: BitOrder,

    /// Signal bit of raw samples (0-31)
    #[arg(long, default_value_t = DEFAULT_SIGNAL_BIT, value_parser = clap::value_parser!(u32).range(0..32))]
    signal_bit: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout may carry decoded data, so log to stderr
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DecoderConfig {
        frame_length: cli.frame_length,
        frame_length_tol: cli.frame_length_tol,
        bit_order: cli.bit_order,
    };
    config.validate().context("Invalid decoder settings")?;

    let input: Box<dyn Read> = match &cli.input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Failed to open input: {}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };
    let mut source = match cli.input_format {
        InputFormat::Packed => BitSource::packed(input),
        InputFormat::Raw => BitSource::raw(input, cli.signal_bit),
    };

    let mut output: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output: {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    info!(
        "🔍 Decoding with frame length {} ± {}, {} first",
        config.frame_length, config.frame_length_tol, config.bit_order
    );

    match &cli.annotation_out {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create annotation file: {}", path.display()))?;
            let decoder = UartDecoder::new(config, FileAnnotations::new(file))?;
            let annotations = run(&mut source, decoder, &mut output)?;
            annotations.into_inner()?;
            info!("📝 Annotations written to {}", path.display());
        }
        None => {
            let decoder = UartDecoder::new(config, NullAnnotations)?;
            run(&mut source, decoder, &mut output)?;
        }
    }

    Ok(())
}

fn run<R: Read, A: AnnotationSink>(
    source: &mut BitSource<R>,
    decoder: UartDecoder<A>,
    output: &mut dyn Write,
) -> Result<A> {
    let (stats, annotations) = decode_stream(source, decoder, output).context("Decoding failed")?;

    info!("📊 Decode summary:");
    info!("   Samples: {}", stats.samples);
    info!("   Syncs: {}", stats.syncs);
    info!("   Bytes decoded: {}", stats.bytes_decoded);
    info!(
        "   Framing errors: {} start, {} stop",
        stats.start_bit_errors, stats.stop_bit_errors
    );
    info!("   Lost sync after a byte: {}", stats.resync_exhausted);

    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_signal_bit_range() {
        let cli = Cli::try_parse_from(["uart-decode", "--signal-bit", "31"]).unwrap();
        assert_eq!(cli.signal_bit, 31);

        let cli = Cli::try_parse_from(["uart-decode"]).unwrap();
        assert_eq!(cli.signal_bit, DEFAULT_SIGNAL_BIT);

        assert!(Cli::try_parse_from(["uart-decode", "--signal-bit", "32"]).is_err());
    }
}
