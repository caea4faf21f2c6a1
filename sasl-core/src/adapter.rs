//! Blocking stream wrappers applying a negotiated security layer.
//!
//! Writes seal the whole buffer into frames and hand them to the inner
//! writer in a single call. Reads pull one frame at a time and serve its
//! plaintext across as many `read` calls as needed. With no layer
//! negotiated both directions pass bytes through untouched.

use std::io::{self, Read, Write};

use tokio_util::bytes::BytesMut;

use crate::codec::{check_frame_len, SecurityLayer, FRAME_HEADER_LEN};
use crate::error::{Error, Result};
use crate::session::HandshakeSession;

#[derive(Debug, Default)]
struct FrameReader {
    pending: Vec<u8>,
    pos: usize,
}

impl FrameReader {
    fn read<R: Read>(
        &mut self,
        inner: &mut R,
        layer: &SecurityLayer,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !layer.is_active() {
            return inner.read(buf);
        }

        while self.pos >= self.pending.len() {
            match next_frame(inner, layer)? {
                Some(plaintext) => {
                    self.pending = plaintext;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }

        let available = &self.pending[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// Read one frame and open it, `None` on a clean end of stream.
fn next_frame<R: Read>(inner: &mut R, layer: &SecurityLayer) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_full(inner, &mut header)? {
        0 => return Ok(None),
        n if n < FRAME_HEADER_LEN => {
            return Err(Error::TruncatedFrame {
                expected: FRAME_HEADER_LEN,
                available: n,
            })
        }
        _ => (),
    }

    let declared = u32::from_be_bytes(header) as usize;
    check_frame_len(declared, layer.max_frame_len())?;

    let mut body = vec![0u8; declared];
    let got = read_full(inner, &mut body)?;
    if got < declared {
        return Err(Error::TruncatedFrame {
            expected: declared,
            available: got,
        });
    }
    layer.open_frame(&body).map(Some)
}

fn read_full<R: Read>(inner: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn write_sealed<W: Write>(inner: &mut W, layer: &SecurityLayer, buf: &[u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    if !layer.is_active() {
        return inner.write(buf);
    }

    let mut frames = BytesMut::new();
    layer.encode_into(buf, &mut frames)?;
    loop {
        match inner.write(&frames) {
            Ok(n) if n == frames.len() => return Ok(buf.len()),
            Ok(n) => {
                return Err(Error::ShortWrite {
                    written: n,
                    expected: frames.len(),
                }
                .into())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Decoding side over any `Read`.
#[derive(Debug)]
pub struct SecuredReader<R> {
    inner: R,
    layer: SecurityLayer,
    frames: FrameReader,
}

impl<R: Read> SecuredReader<R> {
    /// Fails with `HandshakeNotComplete` unless `session` completed.
    pub fn new(session: &HandshakeSession, inner: R) -> Result<Self> {
        Ok(Self::from_layer(session.security_layer()?, inner))
    }

    pub fn from_layer(layer: SecurityLayer, inner: R) -> Self {
        Self {
            inner,
            layer,
            frames: FrameReader::default(),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Plaintext already decoded but not read yet is lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for SecuredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.frames.read(&mut self.inner, &self.layer, buf)
    }
}

/// Encoding side over any `Write`.
#[derive(Debug)]
pub struct SecuredWriter<W> {
    inner: W,
    layer: SecurityLayer,
}

impl<W: Write> SecuredWriter<W> {
    pub fn new(session: &HandshakeSession, inner: W) -> Result<Self> {
        Ok(Self::from_layer(session.security_layer()?, inner))
    }

    pub fn from_layer(layer: SecurityLayer, inner: W) -> Self {
        Self { inner, layer }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for SecuredWriter<W> {
    /// Either every byte of `buf` is sealed and written, or an error is returned.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_sealed(&mut self.inner, &self.layer, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Both directions over a single duplex stream.
#[derive(Debug)]
pub struct SecuredStream<S> {
    inner: S,
    layer: SecurityLayer,
    frames: FrameReader,
}

impl<S: Read + Write> SecuredStream<S> {
    pub fn new(session: &HandshakeSession, inner: S) -> Result<Self> {
        Ok(Self::from_layer(session.security_layer()?, inner))
    }

    pub fn from_layer(layer: SecurityLayer, inner: S) -> Self {
        Self {
            inner,
            layer,
            frames: FrameReader::default(),
        }
    }

    pub fn layer(&self) -> &SecurityLayer {
        &self.layer
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Write> Read for SecuredStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.frames.read(&mut self.inner, &self.layer, buf)
    }
}

impl<S: Read + Write> Write for SecuredStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_sealed(&mut self.inner, &self.layer, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SealDecoder, SealEncoder};
    use std::io::Cursor;

    fn pair(max_buffer: usize) -> (SecurityLayer, SecurityLayer) {
        let key = b"shared";
        let mk = || {
            SecurityLayer::new(
                "TESTSEAL".into(),
                56,
                max_buffer,
                "user".into(),
                Some((
                    Box::new(SealEncoder::new(key).unwrap()),
                    Box::new(SealDecoder::new(key).unwrap()),
                )),
            )
        };
        (mk(), mk())
    }

    fn clear() -> SecurityLayer {
        SecurityLayer::new("TESTPLAIN".into(), 0, 65535, "user".into(), None)
    }

    /// Accepts at most `limit` bytes per write.
    struct Stingy {
        limit: usize,
        data: Vec<u8>,
    }

    impl Write for Stingy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.limit);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_then_read_across_frames() {
        let (ours, theirs) = pair(5);
        let mut writer = SecuredWriter::from_layer(ours, Vec::new());
        writer.write_all(b"hello secured world").unwrap();
        writer.write_all(b"!").unwrap();
        let wire = writer.into_inner();
        assert_ne!(&wire[..], b"hello secured world!");

        let mut reader = SecuredReader::from_layer(theirs, Cursor::new(wire));
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello secured world!");
    }

    #[test]
    fn test_small_reads_are_served_from_pending() {
        let (ours, theirs) = pair(1024);
        let wire = ours.encode(b"abcdef").unwrap();
        let mut reader = SecuredReader::from_layer(theirs, Cursor::new(wire));

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_truncated_stream() {
        let (ours, theirs) = pair(1024);
        let mut wire = ours.encode(b"some payload").unwrap();
        wire.truncate(wire.len() - 3);

        let mut reader = SecuredReader::from_layer(theirs, Cursor::new(wire));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(matches!(
            Error::from_io(err),
            Error::TruncatedFrame { .. }
        ));
    }

    #[test]
    fn test_truncated_header() {
        let (_, theirs) = pair(1024);
        let mut reader = SecuredReader::from_layer(theirs, Cursor::new(vec![0u8, 0]));
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert!(matches!(
            Error::from_io(err),
            Error::TruncatedFrame {
                expected: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn test_oversized_frame_is_corrupt() {
        let (_, theirs) = pair(16);
        let mut wire = 1_000_000u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 32]);
        let mut reader = SecuredReader::from_layer(theirs, Cursor::new(wire));
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_short_write_is_an_error() {
        let (ours, _) = pair(1024);
        let mut writer = SecuredWriter::from_layer(
            ours,
            Stingy {
                limit: 3,
                data: Vec::new(),
            },
        );
        let err = writer.write(b"payload").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert!(matches!(Error::from_io(err), Error::ShortWrite { written: 3, .. }));
    }

    #[test]
    fn test_passthrough_without_layer() {
        let mut writer = SecuredWriter::from_layer(clear(), Vec::new());
        writer.write_all(b"in the clear").unwrap();
        assert_eq!(writer.get_ref(), b"in the clear");

        let mut reader = SecuredReader::from_layer(clear(), Cursor::new(b"raw bytes".to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"raw bytes");
    }

    #[test]
    fn test_stream_both_directions() {
        let (ours, theirs) = pair(8);
        let incoming = theirs.encode(b"from peer").unwrap();

        let mut stream = SecuredStream::from_layer(ours, Cursor::new(incoming));
        let mut buf = vec![0u8; 9];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, b"from peer");
        assert_eq!(stream.layer().ssf(), 56);
    }
}
