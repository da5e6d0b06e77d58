//! The payload codec: many packets batched into one long-polling body.
//!
//! Two framings exist; decoders accept both (sniffed from the first byte)
//! and encoders pick one per batch:
//!
//! ```text
//! text framing    <len>:<digit><data>           len in UTF-8 characters
//!                 <len>:b<digit><base64-data>   binary packet, base64'd
//!
//! binary framing  <00|01><len digits><FF><digit><data>
//!                 00 = text packet, 01 = binary packet,
//!                 len in bytes, digits as raw values 0–9
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use crate::error::PayloadError;
use crate::packet::{FrameKind, Packet, PacketType};

/// Longest accepted run of length digits. Ten decimal digits already
/// describe bodies beyond any sane poll response.
const MAX_LENGTH_DIGITS: usize = 10;

/// Encode a batch using the text framing.
///
/// Binary packets are base64-encoded and marked with a leading `b`.
#[must_use]
pub fn encode_text(packets: &[Packet]) -> Bytes {
    let mut out = Vec::new();
    for packet in packets {
        match packet.frame {
            FrameKind::Text => {
                let chars = 1 + char_count(&packet.data);
                out.extend_from_slice(format!("{chars}:").as_bytes());
                out.push(packet.ptype.digit());
                out.extend_from_slice(&packet.data);
            }
            FrameKind::Binary => {
                let encoded = STANDARD.encode(&packet.data);
                let chars = 2 + encoded.len();
                out.extend_from_slice(format!("{chars}:b").as_bytes());
                out.push(packet.ptype.digit());
                out.extend_from_slice(encoded.as_bytes());
            }
        }
    }
    Bytes::from(out)
}

/// Encode a batch using the binary framing.
#[must_use]
pub fn encode_binary(packets: &[Packet]) -> Bytes {
    let mut out = Vec::new();
    for packet in packets {
        out.push(match packet.frame {
            FrameKind::Text => 0x00,
            FrameKind::Binary => 0x01,
        });
        let len = 1 + packet.data.len();
        for digit in len.to_string().bytes() {
            out.push(digit - b'0');
        }
        out.push(0xFF);
        out.push(packet.ptype.digit());
        out.extend_from_slice(&packet.data);
    }
    Bytes::from(out)
}

/// Decode a payload in either framing, sniffed from the first byte.
///
/// An empty body decodes to an empty batch.
///
/// # Errors
///
/// Any [`PayloadError`]; all of them are permanent.
pub fn decode(bytes: &[u8]) -> Result<Vec<Packet>, PayloadError> {
    match bytes.first() {
        None => Ok(Vec::new()),
        Some(0x00 | 0x01) => decode_binary(bytes),
        Some(_) => decode_text(bytes),
    }
}

fn decode_text(mut rest: &[u8]) -> Result<Vec<Packet>, PayloadError> {
    let mut packets = Vec::new();
    while !rest.is_empty() {
        let colon = rest
            .iter()
            .position(|&b| b == b':')
            .ok_or(PayloadError::InvalidLength)?;
        if colon == 0 || colon > MAX_LENGTH_DIGITS {
            return Err(PayloadError::InvalidLength);
        }
        let len = parse_decimal(&rest[..colon])?;
        rest = &rest[colon + 1..];

        let end = char_boundary(rest, len)?;
        let body = &rest[..end];
        rest = &rest[end..];
        packets.push(parse_text_body(body)?);
    }
    Ok(packets)
}

fn decode_binary(mut rest: &[u8]) -> Result<Vec<Packet>, PayloadError> {
    let mut packets = Vec::new();
    while !rest.is_empty() {
        let frame = match rest[0] {
            0x00 => FrameKind::Text,
            0x01 => FrameKind::Binary,
            other => return Err(PayloadError::InvalidMarker(other)),
        };
        rest = &rest[1..];

        let sep = rest
            .iter()
            .position(|&b| b == 0xFF)
            .ok_or(PayloadError::InvalidLength)?;
        if sep == 0 || sep > MAX_LENGTH_DIGITS {
            return Err(PayloadError::InvalidLength);
        }
        let mut len = 0usize;
        for &digit in &rest[..sep] {
            if digit > 9 {
                return Err(PayloadError::InvalidLength);
            }
            len = len * 10 + digit as usize;
        }
        rest = &rest[sep + 1..];

        if len == 0 {
            return Err(PayloadError::InvalidLength);
        }
        if len > rest.len() {
            return Err(PayloadError::UnexpectedEof);
        }
        let body = &rest[..len];
        rest = &rest[len..];

        let ptype =
            PacketType::from_digit(body[0]).ok_or(PayloadError::InvalidType(body[0]))?;
        packets.push(Packet::new(frame, ptype, Bytes::copy_from_slice(&body[1..])));
    }
    Ok(packets)
}

fn parse_text_body(body: &[u8]) -> Result<Packet, PayloadError> {
    let (&first, rest) = body.split_first().ok_or(PayloadError::InvalidLength)?;
    if first == b'b' {
        let (&digit, encoded) = rest.split_first().ok_or(PayloadError::UnexpectedEof)?;
        let ptype = PacketType::from_digit(digit).ok_or(PayloadError::InvalidType(digit))?;
        let data = STANDARD.decode(encoded)?;
        Ok(Packet::binary(ptype, data))
    } else {
        let ptype = PacketType::from_digit(first).ok_or(PayloadError::InvalidType(first))?;
        Ok(Packet::text(ptype, Bytes::copy_from_slice(rest)))
    }
}

fn parse_decimal(digits: &[u8]) -> Result<usize, PayloadError> {
    let mut value = 0usize;
    for &digit in digits {
        if !digit.is_ascii_digit() {
            return Err(PayloadError::InvalidLength);
        }
        value = value * 10 + usize::from(digit - b'0');
    }
    if value == 0 {
        return Err(PayloadError::InvalidLength);
    }
    Ok(value)
}

/// Number of UTF-8 characters in `bytes` (continuation bytes don't count).
fn char_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b & 0xC0 != 0x80).count()
}

/// Byte offset just past the first `chars` UTF-8 characters of `bytes`.
fn char_boundary(bytes: &[u8], chars: usize) -> Result<usize, PayloadError> {
    let mut offset = 0;
    for _ in 0..chars {
        let &lead = bytes.get(offset).ok_or(PayloadError::UnexpectedEof)?;
        offset += match lead {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return Err(PayloadError::InvalidUtf8),
        };
    }
    if offset > bytes.len() {
        return Err(PayloadError::UnexpectedEof);
    }
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(data: &str) -> Packet {
        Packet::text(PacketType::Message, data.to_owned())
    }

    #[test]
    fn text_framing_matches_wire_format() {
        let encoded = encode_text(&[message("hello")]);
        assert_eq!(&encoded[..], b"6:4hello");

        let encoded = encode_text(&[Packet::text(PacketType::Ping, "")]);
        assert_eq!(&encoded[..], b"1:2");
    }

    #[test]
    fn text_framing_counts_characters_not_bytes() {
        // "héllo" is five characters but six bytes.
        let encoded = encode_text(&[message("héllo")]);
        assert_eq!(&encoded[..], "6:4héllo".as_bytes());
        assert_eq!(decode(&encoded).unwrap(), vec![message("héllo")]);
    }

    #[test]
    fn binary_packet_in_text_framing_is_base64() {
        let packet = Packet::binary(PacketType::Message, vec![1u8, 2, 3, 4]);
        let encoded = encode_text(&[packet.clone()]);
        assert_eq!(&encoded[..], b"10:b4AQIDBA==");
        assert_eq!(decode(&encoded).unwrap(), vec![packet]);
    }

    #[test]
    fn binary_framing_matches_wire_format() {
        let encoded = encode_binary(&[message("hi")]);
        assert_eq!(&encoded[..], &[0x00, 3, 0xFF, b'4', b'h', b'i']);

        let packet = Packet::binary(PacketType::Message, vec![0xDEu8, 0xAD]);
        let encoded = encode_binary(&[packet]);
        assert_eq!(&encoded[..], &[0x01, 3, 0xFF, b'4', 0xDE, 0xAD]);
    }

    #[test]
    fn binary_framing_multi_digit_length() {
        let data = "x".repeat(11);
        let encoded = encode_binary(&[message(&data)]);
        assert_eq!(&encoded[..4], &[0x00, 1, 2, 0xFF]);
        assert_eq!(decode(&encoded).unwrap(), vec![message(&data)]);
    }

    #[test]
    fn mixed_batches_round_trip_in_both_framings() {
        let batch = vec![
            Packet::text(PacketType::Open, "{}"),
            Packet::binary(PacketType::Message, vec![0u8, 0xFF, 7]),
            message("done"),
            Packet::noop(),
        ];
        assert_eq!(decode(&encode_text(&batch)).unwrap(), batch);
        assert_eq!(decode(&encode_binary(&batch)).unwrap(), batch);
    }

    #[test]
    fn empty_body_decodes_to_empty_batch() {
        assert_eq!(decode(b"").unwrap(), Vec::new());
    }

    #[test]
    fn framing_is_sniffed_from_the_first_byte() {
        let batch = vec![message("ping me")];
        let text = encode_text(&batch);
        let binary = encode_binary(&batch);
        assert_ne!(text, binary);
        assert_eq!(decode(&text).unwrap(), decode(&binary).unwrap());
    }

    #[test]
    fn malformed_text_payloads_are_rejected() {
        assert!(matches!(decode(b"abc"), Err(PayloadError::InvalidLength)));
        assert!(matches!(decode(b":4hi"), Err(PayloadError::InvalidLength)));
        assert!(matches!(decode(b"9:4hi"), Err(PayloadError::UnexpectedEof)));
        assert!(matches!(decode(b"2:9x"), Err(PayloadError::InvalidType(b'9'))));
        assert!(matches!(decode(b"3:b4*"), Err(PayloadError::Base64(_))));
    }

    #[test]
    fn truncated_binary_payloads_are_rejected() {
        assert!(matches!(
            decode(&[0x00, 5, 0xFF, b'4']),
            Err(PayloadError::UnexpectedEof)
        ));
        assert!(matches!(
            decode(&[0x00, 3, b'4', b'h', b'i']),
            Err(PayloadError::InvalidLength)
        ));
    }

    #[test]
    fn trailing_garbage_after_a_packet_is_rejected() {
        assert!(decode(b"6:4hello???").is_err());
    }
}
