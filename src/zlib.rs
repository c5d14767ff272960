//! A [`ValueCompressor`] backed by zlib, ported from the teacher's
//! `rsmc-core/src/zlib.rs` to operate on plain value bytes instead of a
//! whole [`crate::protocol::Packet`] — compression is now purely a
//! [`crate::value`] concern, independent of wire framing.

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use std::io::Write;

use crate::error::Error;
use crate::value::ValueCompressor;

/// A zlib compressor at the default compression ratio.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    compression: Compression,
}

impl ZlibCompressor {
    pub fn new(compression: Compression) -> Self {
        ZlibCompressor { compression }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        ZlibCompressor::new(Compression::default())
    }
}

impl ValueCompressor for ZlibCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = vec![];
        let mut enc = ZlibEncoder::new(&mut out, self.compression);
        enc.write_all(bytes)?;
        enc.finish()?;
        Ok(out)
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = vec![];
        let mut dec = ZlibDecoder::new(&mut out);
        dec.write_all(bytes)?;
        dec.finish()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::ZlibCompressor;
    use crate::value::ValueCompressor;
    use flate2::Compression;

    #[test]
    fn round_trips_and_shrinks_repetitive_data() {
        let compressor = ZlibCompressor::new(Compression::new(9));
        let value = b"0".repeat(4096);

        let compressed = compressor.compress(&value).unwrap();
        let decompressed = compressor.decompress(&compressed).unwrap();

        assert!(compressed.len() < value.len());
        assert_eq!(value, decompressed);
    }
}
