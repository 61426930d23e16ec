//! Per-tag compression codec (§4.2.5, §9 "Zlib integration").
//!
//! The B-tree treats compression as a pluggable trait rather than calling
//! zlib directly, per the redesign note: "treat the codec as a pluggable
//! trait with `compress(bytes) -> (bytes, compressed?)` and
//! `decompress(bytes) -> bytes`; the engine calls it without knowing which
//! codec is in use." [`DeflateCodec`] is the one codec shipped, using a raw
//! (header-less) deflate stream with a 32 KiB window, matching the source's
//! `deflateInit2`/`inflateInit2` window-bits argument.
//!
//! Unlike the original source, this implementation always emits and requires
//! a clean end-of-stream: the historical `Z_BUF_ERROR`-with-no-remaining-input
//! workaround (synthesizing a four-byte adler trailer for a writer that never
//! emitted one) is a compatibility shim for pre-existing databases and is not
//! reproduced here (Open Question decision, see `DESIGN.md`).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Window size used for both compression and decompression: 2^15 bytes,
/// matching the raw (no zlib/gzip header) window named in §4.2.5.
const WINDOW_BITS: u8 = 15;

/// Size of the reusable scratch buffer decompression streams through
/// (§4.2.5: "streamed chunk-by-chunk into a reusable 8 KiB buffer").
const DECOMPRESS_CHUNK: usize = 8 * 1024;

/// A pluggable compression codec for B-tree tag payloads.
pub trait Codec {
    /// Attempt to compress `input`. Returns `(bytes, true)` if the output is
    /// smaller than `input` and therefore worth storing compressed, or
    /// `(input.to_vec(), false)` otherwise — callers must check the second
    /// element before trusting that the bytes are actually compressed.
    fn compress(&self, input: &[u8]) -> Result<(Vec<u8>, bool)>;

    /// Reverse [`Codec::compress`]: `input` must be a complete compressed
    /// stream previously produced by this codec.
    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// Raw-deflate codec with a 32 KiB window, matching the source's zlib usage.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeflateCodec;

impl Codec for DeflateCodec {
    fn compress(&self, input: &[u8]) -> Result<(Vec<u8>, bool)> {
        let mut compressor = Compress::new_with_window_bits(
            Compression::default(),
            /* zlib_header = */ false,
            WINDOW_BITS,
        );

        let mut out = Vec::with_capacity(input.len());
        let status = compressor
            .compress_vec(input, &mut out, FlushCompress::Finish)
            .map_err(|e| Error::DatabaseCorrupt(format!("deflate compression failed: {e}")))?;

        if status != Status::StreamEnd {
            return Err(Error::DatabaseCorrupt(
                "deflate compression did not reach stream end".into(),
            ));
        }

        if out.len() < input.len() {
            Ok((out, true))
        } else {
            Ok((input.to_vec(), false))
        }
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let mut decompressor = Decompress::new_with_window_bits(false, WINDOW_BITS);
        let mut out = Vec::with_capacity(expected_len);
        let mut scratch = vec![0u8; DECOMPRESS_CHUNK];

        let mut consumed_total = 0usize;
        loop {
            let before_in = decompressor.total_in() as usize;
            let before_out = decompressor.total_out() as usize;

            let remaining_input = &input[consumed_total..];
            let status = decompressor
                .decompress(remaining_input, &mut scratch, FlushDecompress::None)
                .map_err(|e| Error::DatabaseCorrupt(format!("inflate failed: {e}")))?;

            let produced = decompressor.total_out() as usize - before_out;
            out.extend_from_slice(&scratch[..produced]);

            consumed_total += decompressor.total_in() as usize - before_in;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError if consumed_total < input.len() => continue,
                Status::Ok | Status::BufError => {
                    return Err(Error::DatabaseCorrupt(
                        "inflate ended without reaching stream end".into(),
                    ));
                }
            }
        }

        if out.len() != expected_len {
            return Err(Error::DatabaseCorrupt(format!(
                "inflate produced {} bytes, expected {expected_len}",
                out.len()
            )));
        }

        Ok(out)
    }
}
