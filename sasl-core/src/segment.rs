//! Text encoding of handshake payloads for line based protocols
//! (IMAP `AUTHENTICATE`, SMTP `AUTH`, ...).
//!
//! A lone `=` stands for an empty payload and a lone `*` cancels the exchange.

use base64::Engine;
use nom::{
    bytes::complete::{take_while, take_while1},
    combinator::{all_consuming, map_res},
    sequence::terminated,
    IResult,
};

use crate::error::{Error, Result};

pub fn encode_segment(payload: &[u8]) -> String {
    if payload.is_empty() {
        return "=".into();
    }
    base64::engine::general_purpose::STANDARD.encode(payload)
}

/// Padding is optional, peers disagree on whether it must be sent.
pub fn decode_segment(line: &str) -> Result<Vec<u8>> {
    match line.trim_end_matches(&['\r', '\n'][..]).trim() {
        "=" | "" => Ok(Vec::new()),
        "*" => Err(Error::Cancelled),
        text => all_consuming(base64)(text.as_bytes())
            .map(|(_, data)| data)
            .map_err(|_| Error::InvalidSegment(format!("{} is not base64", text))),
    }
}

fn is_base64_core(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'+' || c == b'/'
}

fn is_base64_pad(c: u8) -> bool {
    c == b'='
}

fn base64(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(
        terminated(take_while1(is_base64_core), take_while(is_base64_pad)),
        |b64: &[u8]| base64::engine::general_purpose::STANDARD_NO_PAD.decode(b64),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload() {
        assert_eq!(encode_segment(b""), "=");
        assert_eq!(decode_segment("=").unwrap(), b"");
    }

    #[test]
    fn test_plain_payload() {
        let line = encode_segment(b"\0alice\0hunter2");
        assert_eq!(line, "AGFsaWNlAGh1bnRlcjI=");
        assert_eq!(decode_segment(&line).unwrap(), b"\0alice\0hunter2");
        assert_eq!(
            decode_segment("AGFsaWNlAGh1bnRlcjI\r\n").unwrap(),
            b"\0alice\0hunter2"
        );
    }

    #[test]
    fn test_cancel_and_garbage() {
        assert!(matches!(decode_segment("*"), Err(Error::Cancelled)));
        assert!(matches!(
            decode_segment("not base64!"),
            Err(Error::InvalidSegment(_))
        ));
    }
}
