//! Serializes, optionally compresses, and flag-tags values on the way to the
//! wire; does the inverse on the way back. Kept as two small capabilities
//! ([`ValueSerializer`], [`ValueCompressor`]) so swapping either is a matter
//! of configuration rather than subclassing, per the teacher's
//! [`crate::client::Compressor`]-as-a-trait design in `rsmc-core`.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;

/// Bit 0 of the flags word: the value was run through a [`ValueSerializer`]
/// rather than stored verbatim.
pub const FLAG_SERIALIZED: u32 = 0x1;
/// Bit 1 of the flags word: the (serialized) value was additionally
/// compressed with a [`ValueCompressor`].
pub const FLAG_COMPRESSED: u32 = 0x2;

/// Encodes and decodes values to and from bytes. The default is
/// [`BincodeSerializer`]; implement this trait to plug in another format.
pub trait ValueSerializer: Clone + Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Error>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Error>;
}

/// The default serializer, matching the teacher's choice of `bincode` with a
/// fixed big-endian encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl ValueSerializer for BincodeSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Error> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Deflates value bytes. A default no-op implementation is provided as
/// [`NoCompressor`]; enable the `zlib` feature for [`crate::zlib::ZlibCompressor`].
pub trait ValueCompressor: Clone + Copy + Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error>;
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A [`ValueCompressor`] that does nothing. Use this to disable compression
/// entirely while keeping the same codec plumbing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressor;

impl ValueCompressor for NoCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(bytes.to_vec())
    }
}

/// Wraps a value that should be sent to memcached exactly as-is: no
/// serializer runs, no compression runs, and the flags word is zero on the
/// wire. This is the type-level stand-in for the source's `raw` boolean
/// option — choosing `Raw(bytes)` over a plain serializable value is the
/// call a caller makes instead of flipping a flag.
#[derive(Debug, Clone, Copy)]
pub struct Raw<T>(pub T);

/// Serialize, optionally compress, and tag a value with its flags word;
/// undo that on the way back. One `ValueCodec` is shared by every
/// connection in a [`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct ValueCodec<S: ValueSerializer, C: ValueCompressor> {
    serializer: S,
    compressor: C,
    compress: bool,
    compression_min_size: usize,
    value_max_bytes: usize,
}

impl<S: ValueSerializer, C: ValueCompressor> ValueCodec<S, C> {
    pub fn new(
        serializer: S,
        compressor: C,
        compress: bool,
        compression_min_size: usize,
        value_max_bytes: usize,
    ) -> Self {
        Self {
            serializer,
            compressor,
            compress,
            compression_min_size,
            value_max_bytes,
        }
    }

    fn check_size(&self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > self.value_max_bytes {
            return Err(Error::ValueTooLarge {
                limit: self.value_max_bytes,
                actual: bytes.len(),
            });
        }
        Ok(())
    }

    /// Encode a raw byte value: flags are always zero, no compression runs.
    pub fn encode_raw(&self, bytes: &[u8]) -> Result<(Vec<u8>, u32), Error> {
        self.check_size(bytes)?;
        Ok((bytes.to_vec(), 0))
    }

    /// Encode a typed value: always serialized, compressed when enabled and
    /// large enough to clear `compression_min_size`.
    pub fn encode_value<T: Serialize>(&self, value: &T) -> Result<(Vec<u8>, u32), Error> {
        let mut bytes = self.serializer.serialize(value)?;
        let mut flags = FLAG_SERIALIZED;
        if self.compress && bytes.len() >= self.compression_min_size {
            bytes = self.compressor.compress(&bytes)?;
            flags |= FLAG_COMPRESSED;
        }
        self.check_size(&bytes)?;
        Ok((bytes, flags))
    }

    /// Decode bytes carrying the given flags word into a raw byte buffer,
    /// undoing compression but not deserializing.
    pub fn decode_raw(&self, bytes: &[u8], flags: u32) -> Result<Vec<u8>, Error> {
        if flags & FLAG_COMPRESSED != 0 {
            self.compressor.decompress(bytes)
        } else {
            Ok(bytes.to_vec())
        }
    }

    /// Decode bytes carrying the given flags word into a typed value,
    /// undoing compression and deserialization as the flags dictate.
    ///
    /// A value stored without the `SERIALIZED` bit isn't in this codec's
    /// wire format for any `T`, so it's reported as an unmarshal failure
    /// rather than guessed at; callers that want the bytes as stored should
    /// use [`ValueCodec::decode_raw`] instead.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], flags: u32) -> Result<T, Error> {
        let raw = self.decode_raw(bytes, flags)?;
        if flags & FLAG_SERIALIZED != 0 {
            self.serializer.deserialize(&raw)
        } else {
            Err(Error::Unmarshal(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "value was stored without the serialized flag",
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BincodeSerializer, NoCompressor, ValueCodec, FLAG_COMPRESSED, FLAG_SERIALIZED};

    fn codec(compress: bool, min_size: usize) -> ValueCodec<BincodeSerializer, NoCompressor> {
        ValueCodec::new(BincodeSerializer, NoCompressor, compress, min_size, 1024 * 1024)
    }

    #[test]
    fn raw_round_trips_with_zero_flags() {
        let codec = codec(true, 4096);
        let (bytes, flags) = codec.encode_raw(b"hello").unwrap();
        assert_eq!(0, flags);
        assert_eq!(b"hello".to_vec(), codec.decode_raw(&bytes, flags).unwrap());
    }

    #[test]
    fn typed_values_round_trip() {
        let codec = codec(true, 4096);
        let (bytes, flags) = codec.encode_value(&123u64).unwrap();
        assert_eq!(FLAG_SERIALIZED, flags);
        let value: u64 = codec.decode(&bytes, flags).unwrap();
        assert_eq!(123, value);
    }

    #[test]
    fn compression_only_kicks_in_above_threshold() {
        let codec = codec(true, 4096);
        let small = "x".repeat(10);
        let (_, flags) = codec.encode_value(&small).unwrap();
        assert_eq!(FLAG_SERIALIZED, flags, "small values should not be compressed");

        // NoCompressor never actually sets the bit since it's a no-op, so
        // exercise the threshold math with a compressor that would.
        #[derive(Debug, Clone, Copy)]
        struct AlwaysCompresses;
        impl super::ValueCompressor for AlwaysCompresses {
            fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, crate::error::Error> {
                Ok(bytes.to_vec())
            }
            fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, crate::error::Error> {
                Ok(bytes.to_vec())
            }
        }
        let codec = ValueCodec::new(BincodeSerializer, AlwaysCompresses, true, 8, 1024);
        let (_, flags) = codec.encode_value(&small).unwrap();
        assert_eq!(FLAG_SERIALIZED | FLAG_COMPRESSED, flags);
    }

    #[test]
    fn oversize_values_are_rejected() {
        let codec = ValueCodec::new(BincodeSerializer, NoCompressor, false, 4096, 4);
        let err = codec.encode_raw(b"too long").unwrap_err();
        assert!(matches!(err, crate::error::Error::ValueTooLarge { .. }));
    }
}
