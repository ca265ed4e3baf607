//! Value transform pipeline: codec, UTF-8 text mode, compression.
//!
//! Every stored value ships a flag word in the protocol's `flags` field:
//!
//! | bit | meaning |
//! |---|---|
//! | b0 | codec-encoded structured value |
//! | b1 | compressed |
//! | b2 | UTF-8 text |
//!
//! The flag word travels with the value, so reading it back needs no
//! knowledge of the writing client's configuration: a reconfigured client
//! still decodes existing data correctly. On fetch the bits are undone in
//! the order b1, then b2/b0.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use tracing::warn;

use crate::error::Error;

/// b0: value is codec-encoded, not a raw byte string.
pub const FLAG_CODEC: u32 = 1 << 0;
/// b1: value is compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 1;
/// b2: value is UTF-8 text.
pub const FLAG_TEXT: u32 = 1 << 2;

/// Encodes structured values to bytes and back. Flag bit b0 marks values
/// that went through the codec.
///
/// The default [`JsonCodec`] uses a self-describing format so "generic"
/// callers can round-trip values without sharing schema out of band.
pub trait Codec {
    type Value;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, Error>;
    fn decode(&self, data: &[u8]) -> Result<Self::Value, Error>;
}

/// JSON-backed default codec.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Value = serde_json::Value;

    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| Error::Transform(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Self::Value, Error> {
        serde_json::from_slice(data).map_err(|e| Error::Transform(e.to_string()))
    }
}

/// A value being stored, borrowed from the caller.
#[derive(Debug)]
pub enum StorePayload<'a, V> {
    /// Raw bytes, shipped as-is.
    Bytes(&'a [u8]),
    /// Character data; encoded as UTF-8 with b2 when text mode is on.
    Text(&'a str),
    /// Structured value, run through the codec with b0.
    Object(&'a V),
}

// Manual impls: the payload only holds references, so it is copyable
// whether or not `V` itself is.
impl<V> Clone for StorePayload<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for StorePayload<'_, V> {}

impl<'a, V> StorePayload<'a, V> {
    pub fn object(value: &'a V) -> Self {
        StorePayload::Object(value)
    }
}

impl<'a, V> From<&'a [u8]> for StorePayload<'a, V> {
    fn from(bytes: &'a [u8]) -> Self {
        StorePayload::Bytes(bytes)
    }
}

impl<'a, V, const N: usize> From<&'a [u8; N]> for StorePayload<'a, V> {
    fn from(bytes: &'a [u8; N]) -> Self {
        StorePayload::Bytes(bytes)
    }
}

impl<'a, V> From<&'a str> for StorePayload<'a, V> {
    fn from(text: &'a str) -> Self {
        StorePayload::Text(text)
    }
}

/// A fetched value after the flag bits have been undone.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue<V> {
    Bytes(Bytes),
    Text(String),
    Object(V),
}

impl<V> CacheValue<V> {
    /// Raw bytes, when the value was stored as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<V> {
        match self {
            CacheValue::Object(v) => Some(v),
            _ => None,
        }
    }
}

type SqueezeFn = fn(&[u8]) -> std::io::Result<Vec<u8>>;

/// One registered compression algorithm.
#[derive(Clone, Copy)]
struct Algorithm {
    compress: SqueezeFn,
    decompress: SqueezeFn,
}

/// Look up a compression algorithm by its configured name.
fn algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "gzip" => Some(Algorithm {
            compress: gzip_compress,
            decompress: gzip_decompress,
        }),
        "deflate" => Some(Algorithm {
            compress: zlib_compress,
            decompress: zlib_decompress,
        }),
        _ => None,
    }
}

fn gzip_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gzip_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn zlib_compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn zlib_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// The configured store/fetch pipeline.
pub(crate) struct Transformer<C> {
    codec: C,
    utf8: bool,
    /// `None` disables compression outright.
    compress_threshold: Option<usize>,
    compress_ratio: f64,
    compression: Option<Algorithm>,
}

impl<C: Codec> Transformer<C> {
    /// Build from config knobs. An unknown algorithm name logs a warning
    /// and disables compression instead of failing construction.
    pub(crate) fn new(
        codec: C,
        utf8: bool,
        compress_threshold: Option<usize>,
        compress_ratio: f64,
        compress_algo: &str,
    ) -> Self {
        let compression = match algorithm(compress_algo) {
            Some(algo) => Some(algo),
            None => {
                warn!(algo = compress_algo, "unknown compression algorithm, disabling compression");
                None
            }
        };
        Transformer {
            codec,
            utf8,
            compress_threshold,
            compress_ratio,
            compression,
        }
    }

    /// Store direction: payload → (bytes, flag word).
    pub(crate) fn outbound(&self, payload: StorePayload<'_, C::Value>) -> Result<(Vec<u8>, u32), Error> {
        let (mut data, mut flags) = match payload {
            StorePayload::Bytes(b) => (b.to_vec(), 0),
            StorePayload::Text(s) if self.utf8 => (s.as_bytes().to_vec(), FLAG_TEXT),
            StorePayload::Text(s) => (s.as_bytes().to_vec(), 0),
            StorePayload::Object(v) => (self.codec.encode(v)?, FLAG_CODEC),
        };

        if let (Some(threshold), Some(algo)) = (self.compress_threshold, self.compression) {
            if data.len() >= threshold {
                let squeezed =
                    (algo.compress)(&data).map_err(|e| Error::Transform(e.to_string()))?;
                // Keep the compressed form only when it actually pays off.
                if (squeezed.len() as f64) <= self.compress_ratio * data.len() as f64 {
                    data = squeezed;
                    flags |= FLAG_COMPRESSED;
                }
            }
        }

        Ok((data, flags))
    }

    /// Fetch direction: (bytes, flag word) → value. A failure here is
    /// scoped to this one value.
    pub(crate) fn inbound(&self, data: Vec<u8>, flags: u32) -> Result<CacheValue<C::Value>, Error> {
        let data = if flags & FLAG_COMPRESSED != 0 {
            let algo = self.compression.ok_or_else(|| {
                Error::Transform("value is compressed but compression is disabled".into())
            })?;
            (algo.decompress)(&data).map_err(|e| Error::Transform(e.to_string()))?
        } else {
            data
        };

        if flags & FLAG_CODEC != 0 {
            return Ok(CacheValue::Object(self.codec.decode(&data)?));
        }
        if flags & FLAG_TEXT != 0 {
            return String::from_utf8(data)
                .map(CacheValue::Text)
                .map_err(|e| Error::Transform(e.to_string()));
        }
        Ok(CacheValue::Bytes(Bytes::from(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> Transformer<JsonCodec> {
        Transformer::new(JsonCodec, false, None, 0.8, "gzip")
    }

    #[test]
    fn bytes_pass_through_unflagged() {
        let t = plain();
        let (data, flags) = t.outbound(StorePayload::Bytes(b"raw")).unwrap();
        assert_eq!((data.as_slice(), flags), (&b"raw"[..], 0));
        assert_eq!(
            t.inbound(data, flags).unwrap(),
            CacheValue::Bytes(Bytes::from_static(b"raw"))
        );
    }

    #[test]
    fn text_mode_sets_b2() {
        let t = Transformer::new(JsonCodec, true, None, 0.8, "gzip");
        let (data, flags) = t.outbound(StorePayload::Text("héllo")).unwrap();
        assert_eq!(flags, FLAG_TEXT);
        match t.inbound(data, flags).unwrap() {
            CacheValue::Text(s) => assert_eq!(s, "héllo"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn text_without_text_mode_is_plain_bytes() {
        let t = plain();
        let (_, flags) = t.outbound(StorePayload::Text("hello")).unwrap();
        assert_eq!(flags, 0);
    }

    #[test]
    fn objects_round_trip_through_codec() {
        let t = plain();
        let value = serde_json::json!({"n": 7, "tags": ["a", "b"]});
        let (data, flags) = t.outbound(StorePayload::object(&value)).unwrap();
        assert_eq!(flags, FLAG_CODEC);
        match t.inbound(data, flags).unwrap() {
            CacheValue::Object(v) => assert_eq!(v, value),
            other => panic!("expected Object, got {other:?}"),
        }
    }

    #[test]
    fn compression_applies_at_threshold() {
        let t = Transformer::new(JsonCodec, false, Some(64), 0.8, "gzip");
        let payload = vec![b'a'; 64];
        let (data, flags) = t.outbound(StorePayload::Bytes(&payload)).unwrap();
        assert_eq!(flags, FLAG_COMPRESSED);
        assert!(data.len() < payload.len());
        assert_eq!(
            t.inbound(data, flags).unwrap(),
            CacheValue::Bytes(Bytes::from(payload))
        );
    }

    #[test]
    fn one_byte_below_threshold_is_not_considered() {
        let t = Transformer::new(JsonCodec, false, Some(64), 0.8, "gzip");
        let payload = vec![b'a'; 63];
        let (_, flags) = t.outbound(StorePayload::Bytes(&payload)).unwrap();
        assert_eq!(flags, 0);
    }

    #[test]
    fn incompressible_data_ships_raw() {
        // Gzip cannot shrink 64 pseudo-random bytes to 10% of their size.
        let t = Transformer::new(JsonCodec, false, Some(16), 0.1, "gzip");
        let payload: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
            .collect();
        let (data, flags) = t.outbound(StorePayload::Bytes(&payload)).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(data, payload);
    }

    #[test]
    fn unknown_algorithm_disables_compression() {
        let t = Transformer::new(JsonCodec, false, Some(4), 0.8, "snappy");
        let (data, flags) = t.outbound(StorePayload::Bytes(&[b'a'; 128])).unwrap();
        assert_eq!(flags, 0);
        assert_eq!(data.len(), 128);
    }

    #[test]
    fn deflate_round_trips() {
        let t = Transformer::new(JsonCodec, false, Some(16), 0.9, "deflate");
        let payload = vec![b'z'; 256];
        let (data, flags) = t.outbound(StorePayload::Bytes(&payload)).unwrap();
        assert_eq!(flags, FLAG_COMPRESSED);
        assert_eq!(
            t.inbound(data, flags).unwrap(),
            CacheValue::Bytes(Bytes::from(payload))
        );
    }

    #[test]
    fn corrupt_compressed_value_errors_without_panicking() {
        let t = plain();
        let err = t.inbound(vec![1, 2, 3], FLAG_COMPRESSED).unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn invalid_utf8_text_errors() {
        let t = plain();
        let err = t.inbound(vec![0xff, 0xfe], FLAG_TEXT).unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }
}
