//! Security layer framing.
//!
//! On the wire every frame is a 4 bytes big endian length followed by exactly
//! that many bytes of engine output. Plaintext longer than the negotiated
//! maximum buffer is cut into consecutive chunks, each sealed into its own frame.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use nom::bytes::streaming::take;
use nom::number::streaming::be_u32;
use nom::IResult;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::engine::{EngineError, LayerDecoder, LayerEncoder};
use crate::error::{Error, Result};

pub const FRAME_HEADER_LEN: usize = 4;

struct Layer {
    encoder: Mutex<Box<dyn LayerEncoder>>,
    decoder: Mutex<Box<dyn LayerDecoder>>,
}

struct Inner {
    mechanism: String,
    ssf: u32,
    max_buffer: usize,
    authorized_identity: String,
    layer: Option<Layer>,
}

/// The negotiated result of a completed handshake: its properties and the
/// encode/decode pair.
///
/// Cheap to clone; clones share the same engine state. The encode and decode
/// directions are guarded separately so a reader and a writer never contend.
#[derive(Clone)]
pub struct SecurityLayer {
    inner: Arc<Inner>,
}

impl fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityLayer")
            .field("mechanism", &self.inner.mechanism)
            .field("ssf", &self.inner.ssf)
            .field("max_buffer", &self.inner.max_buffer)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SecurityLayer {
    pub(crate) fn new(
        mechanism: String,
        ssf: u32,
        max_buffer: usize,
        authorized_identity: String,
        halves: Option<(Box<dyn LayerEncoder>, Box<dyn LayerDecoder>)>,
    ) -> Self {
        let layer = halves.map(|(encoder, decoder)| Layer {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
        });
        Self {
            inner: Arc::new(Inner {
                mechanism,
                ssf,
                max_buffer: max_buffer.max(1),
                authorized_identity,
                layer,
            }),
        }
    }

    pub fn mechanism(&self) -> &str {
        &self.inner.mechanism
    }

    pub fn ssf(&self) -> u32 {
        self.inner.ssf
    }

    pub fn max_buffer(&self) -> usize {
        self.inner.max_buffer
    }

    pub fn authorized_identity(&self) -> &str {
        &self.inner.authorized_identity
    }

    /// False when no security layer was negotiated: encode and decode are
    /// then the identity.
    pub fn is_active(&self) -> bool {
        self.inner.layer.is_some()
    }

    /// Largest frame body accepted from the peer.
    pub fn max_frame_len(&self) -> usize {
        match &self.inner.layer {
            Some(layer) => self.inner.max_buffer + lock(&layer.decoder).overhead(),
            None => self.inner.max_buffer,
        }
    }

    /// Seal `plaintext` into one or more frames.
    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = BytesMut::new();
        self.encode_into(plaintext, &mut out)?;
        Ok(out.to_vec())
    }

    /// Open every frame of `ciphertext` and concatenate the plaintext.
    ///
    /// `ciphertext` must hold whole frames only.
    pub fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if !self.is_active() {
            return Ok(ciphertext.to_vec());
        }

        let limit = self.max_frame_len();
        let mut out = Vec::with_capacity(ciphertext.len());
        let mut input = ciphertext;
        while !input.is_empty() {
            let (body, rest) = split_frame(input, limit)?;
            out.extend_from_slice(&self.open_frame(body)?);
            input = rest;
        }
        Ok(out)
    }

    pub(crate) fn encode_into(&self, plaintext: &[u8], out: &mut BytesMut) -> Result<()> {
        let layer = match &self.inner.layer {
            Some(layer) => layer,
            None => {
                out.put(plaintext);
                return Ok(());
            }
        };

        let mut encoder = lock(&layer.encoder);
        for chunk in plaintext.chunks(self.inner.max_buffer) {
            let sealed = encoder.seal(chunk).map_err(engine_to_codec)?;
            let len = u32::try_from(sealed.len()).map_err(|_| {
                Error::CorruptFrame(format!("sealed frame of {} bytes", sealed.len()))
            })?;
            tracing::trace!(plain = chunk.len(), sealed = sealed.len(), "sealed frame");
            out.reserve(FRAME_HEADER_LEN + sealed.len());
            out.put_u32(len);
            out.put(&sealed[..]);
        }
        Ok(())
    }

    /// Open a single frame body (without its length header).
    pub(crate) fn open_frame(&self, body: &[u8]) -> Result<Vec<u8>> {
        let layer = match &self.inner.layer {
            Some(layer) => layer,
            None => return Ok(body.to_vec()),
        };
        let plain = lock(&layer.decoder)
            .open(body)
            .map_err(engine_to_codec)?;
        tracing::trace!(sealed = body.len(), plain = plain.len(), "opened frame");
        Ok(plain)
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic while holding the lock leaves the engine state as the engine left it
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn engine_to_codec(err: EngineError) -> Error {
    match err {
        EngineError::Integrity(msg) | EngineError::Protocol(msg) => Error::CorruptFrame(msg),
        other => Error::SessionFailed(other.to_string()),
    }
}

fn frame_header(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

fn frame_body(input: &[u8], len: usize) -> IResult<&[u8], &[u8]> {
    take(len)(input)
}

/// Split the first frame off `input`, returning `(body, rest)`.
pub fn split_frame(input: &[u8], limit: usize) -> Result<(&[u8], &[u8])> {
    let (after_header, declared) = frame_header(input).map_err(|_| Error::TruncatedFrame {
        expected: FRAME_HEADER_LEN,
        available: input.len(),
    })?;
    let declared = declared as usize;
    check_frame_len(declared, limit)?;

    let (rest, body) = frame_body(after_header, declared).map_err(|_| Error::TruncatedFrame {
        expected: declared,
        available: after_header.len(),
    })?;
    Ok((body, rest))
}

pub(crate) fn check_frame_len(declared: usize, limit: usize) -> Result<()> {
    if declared > limit {
        return Err(Error::CorruptFrame(format!(
            "frame declares {} bytes, limit is {}",
            declared, limit
        )));
    }
    Ok(())
}

/// `tokio_util` codec applying the security layer to a framed transport.
///
/// Decoded items are plaintext payloads, one per wire frame. When no layer
/// was negotiated bytes are passed through as they arrive.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    layer: SecurityLayer,
}

impl FrameCodec {
    pub fn new(layer: SecurityLayer) -> Self {
        Self { layer }
    }

    pub fn layer(&self) -> &SecurityLayer {
        &self.layer
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !self.layer.is_active() {
            if src.is_empty() {
                return Ok(None);
            }
            return Ok(Some(src.split().to_vec()));
        }

        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let declared = (&src[..FRAME_HEADER_LEN]).get_u32() as usize;
        check_frame_len(declared, self.layer.max_frame_len())?;

        if src.len() < FRAME_HEADER_LEN + declared {
            src.reserve(FRAME_HEADER_LEN + declared - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let body = src.split_to(declared);
        self.layer.open_frame(&body).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None if src.len() < FRAME_HEADER_LEN => Err(Error::TruncatedFrame {
                expected: FRAME_HEADER_LEN,
                available: src.len(),
            }),
            None => Err(Error::TruncatedFrame {
                expected: (&src[..FRAME_HEADER_LEN]).get_u32() as usize,
                available: src.len() - FRAME_HEADER_LEN,
            }),
        }
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<()> {
        self.layer.encode_into(item, dst)
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        self.layer.encode_into(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SealDecoder, SealEncoder};

    fn sealed_layer(max_buffer: usize) -> (SecurityLayer, SecurityLayer) {
        let key = b"k3y";
        let ours = SecurityLayer::new(
            "TESTSEAL".into(),
            56,
            max_buffer,
            "user".into(),
            Some((
                Box::new(SealEncoder::new(key).unwrap()),
                Box::new(SealDecoder::new(key).unwrap()),
            )),
        );
        let theirs = SecurityLayer::new(
            "TESTSEAL".into(),
            56,
            max_buffer,
            "user".into(),
            Some((
                Box::new(SealEncoder::new(key).unwrap()),
                Box::new(SealDecoder::new(key).unwrap()),
            )),
        );
        (ours, theirs)
    }

    #[test]
    fn test_passthrough_without_layer() {
        let layer = SecurityLayer::new("TESTPLAIN".into(), 0, 16, "user".into(), None);
        assert!(!layer.is_active());
        assert_eq!(layer.encode(b"hello world").unwrap(), b"hello world");
        assert_eq!(layer.decode(b"hello world").unwrap(), b"hello world");
    }

    #[test]
    fn test_chunking_produces_one_frame_per_chunk() {
        let (ours, theirs) = sealed_layer(4);
        let wire = ours.encode(b"0123456789").unwrap();

        // 3 chunks: 4 + 4 + 2 bytes, each with its header and 8 bytes of overhead
        let mut input = &wire[..];
        let mut sizes = vec![];
        while !input.is_empty() {
            let (body, rest) = split_frame(input, ours.max_frame_len()).unwrap();
            sizes.push(body.len());
            input = rest;
        }
        assert_eq!(sizes, vec![12, 12, 10]);
        assert_eq!(theirs.decode(&wire).unwrap(), b"0123456789");
    }

    #[test]
    fn test_empty_input() {
        let (ours, theirs) = sealed_layer(4);
        let wire = ours.encode(b"").unwrap();
        assert!(wire.is_empty());
        assert!(theirs.decode(&wire).unwrap().is_empty());
    }

    #[test]
    fn test_one_byte_short_is_truncated() {
        let (ours, theirs) = sealed_layer(64);
        let wire = ours.encode(b"some payload").unwrap();
        match theirs.decode(&wire[..wire.len() - 1]) {
            Err(Error::TruncatedFrame {
                expected,
                available,
            }) => assert_eq!(expected, available + 1),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_short_header_is_truncated() {
        let (_, theirs) = sealed_layer(64);
        assert!(matches!(
            theirs.decode(&[0, 0]),
            Err(Error::TruncatedFrame {
                expected: 4,
                available: 2
            })
        ));
    }

    #[test]
    fn test_oversized_frame_is_corrupt() {
        let (_, theirs) = sealed_layer(8);
        let mut wire = vec![0, 0, 1, 0];
        wire.extend_from_slice(&[0u8; 256]);
        assert!(matches!(theirs.decode(&wire), Err(Error::CorruptFrame(_))));
    }

    #[test]
    fn test_tampered_frame_is_corrupt() {
        let (ours, theirs) = sealed_layer(64);
        let mut wire = ours.encode(b"integrity matters").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(theirs.decode(&wire), Err(Error::CorruptFrame(_))));
    }

    #[test]
    fn test_replayed_frame_is_corrupt() {
        let (ours, theirs) = sealed_layer(64);
        let wire = ours.encode(b"once").unwrap();
        assert_eq!(theirs.decode(&wire).unwrap(), b"once");
        assert!(matches!(theirs.decode(&wire), Err(Error::CorruptFrame(_))));
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let (ours, theirs) = sealed_layer(64);
        let wire = ours.encode(b"abc").unwrap();
        let mut codec = FrameCodec::new(theirs);

        let mut buf = BytesMut::from(&wire[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[3..wire.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&wire[wire.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"abc".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_eof_mid_frame() {
        let (ours, theirs) = sealed_layer(64);
        let wire = ours.encode(b"abc").unwrap();
        let mut codec = FrameCodec::new(theirs);
        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(Error::TruncatedFrame { .. })
        ));
    }
}
