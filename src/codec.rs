//! Streaming frame codec for use with [`tokio_util::codec::Framed`].
//!
//! The decoder is a small state machine over the inbound byte buffer: it
//! parses the fixed 2-byte header, then the extended length and masking key,
//! then the payload, returning `Ok(None)` whenever the buffer is short so the
//! transport can read more. The encoder mirrors it, choosing the 7/16/64-bit
//! length form by payload size and masking outgoing frames when the endpoint
//! runs in the client role.
//!
//! Role awareness lives here: a server rejects unmasked frames, a client
//! rejects masked ones, per
//! [RFC 6455 Section 5.1](https://datatracker.ietf.org/doc/html/rfc6455#section-5.1).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec;

use crate::{
    connection::Role,
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    mask, Error,
};

/// Largest possible frame header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// Fields known after the fixed 2-byte header has been read.
struct PartialHeader {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    masked: bool,
    /// The raw 7-bit length field (126 and 127 select extended forms).
    length_code: u8,
    /// Number of extended length bytes still to read (0, 2 or 8).
    extra: usize,
}

/// Fields known once the extended length and masking key are available.
struct FullHeader {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

enum DecodeState {
    /// Waiting for the fixed 2-byte header.
    Header,
    /// Waiting for the extended length and masking key.
    Length(PartialHeader),
    /// Waiting for the payload bytes.
    Payload(FullHeader),
}

/// Decoder half of the codec.
///
/// Holds the peer role (to enforce the masking rule) and the configured
/// payload cap. Frames are emitted unmasked.
pub struct FrameDecoder {
    role: Role,
    max_payload: usize,
    state: DecodeState,
}

impl FrameDecoder {
    /// Creates a decoder for an endpoint in `role`, rejecting frames with a
    /// payload larger than `max_payload`.
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            role,
            max_payload,
            state: DecodeState::Header,
        }
    }
}

impl codec::Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Header) {
                DecodeState::Header => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv1 = src[0] & 0b0100_0000 != 0;
                    if src[0] & 0b0011_0000 != 0 {
                        return Err(Error::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    // Masking is mandatory client-to-server and forbidden
                    // server-to-client.
                    match self.role {
                        Role::Server if !masked => return Err(Error::ExpectedMaskedFrame),
                        Role::Client if masked => return Err(Error::ExpectedUnmaskedFrame),
                        _ => {}
                    }

                    if rsv1 && opcode.is_control() {
                        return Err(Error::ReservedBitsNotZero);
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };

                    src.advance(2);
                    self.state = DecodeState::Length(PartialHeader {
                        fin,
                        rsv1,
                        opcode,
                        masked,
                        length_code,
                        extra,
                    });
                }
                DecodeState::Length(header) => {
                    let need = header.extra + if header.masked { 4 } else { 0 };
                    if src.remaining() < need {
                        self.state = DecodeState::Length(header);
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => usize::from(src.get_u16()),
                        8 => {
                            let len = src.get_u64();
                            // The most significant bit of a 64-bit length
                            // must be zero.
                            if len & (1 << 63) != 0 {
                                return Err(Error::FrameTooLarge);
                            }
                            usize::try_from(len).map_err(|_| Error::FrameTooLarge)?
                        }
                        _ => unreachable!(),
                    };

                    let mask = header
                        .masked
                        .then(|| src.get_u32().to_be_bytes());

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(Error::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(Error::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_payload {
                        return Err(Error::FrameTooLarge);
                    }

                    self.state = DecodeState::Payload(FullHeader {
                        fin: header.fin,
                        rsv1: header.rsv1,
                        opcode: header.opcode,
                        mask,
                        payload_len,
                    });
                }
                DecodeState::Payload(header) => {
                    if src.remaining() < header.payload_len {
                        self.state = DecodeState::Payload(header);
                        return Ok(None);
                    }

                    let mut payload = src.split_to(header.payload_len);
                    if let Some(key) = header.mask {
                        mask::apply_mask(&mut payload, key);
                    }

                    return Ok(Some(Frame::message(
                        header.opcode,
                        payload.freeze(),
                        header.fin,
                        header.rsv1,
                    )));
                }
            }
        }
    }
}

/// Encoder half of the codec.
///
/// A client-role encoder masks every frame with a fresh random key drawn
/// from [`rand`]; a server-role encoder never masks.
pub struct FrameEncoder {
    role: Role,
}

impl FrameEncoder {
    /// Creates an encoder for an endpoint in `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for FrameEncoder {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let key: Option<[u8; 4]> = match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };

        let len = frame.payload.len();
        dst.reserve(MAX_HEADER_SIZE + len);

        dst.put_u8(
            (frame.fin as u8) << 7
                | (frame.compressed as u8) << 6
                | u8::from(frame.opcode),
        );

        let mask_bit = if key.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len < 65536 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match key {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                mask::apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&frame.payload),
        }

        Ok(())
    }
}

/// Combined decoder + encoder, the codec installed into `Framed`.
pub struct FrameCodec {
    decoder: FrameDecoder,
    encoder: FrameEncoder,
}

impl FrameCodec {
    /// Creates the codec for an endpoint in `role` with the given inbound
    /// payload cap.
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(role, max_payload),
            encoder: FrameEncoder::new(role),
        }
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        self.encoder.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const CAP: usize = 1024 * 1024;

    fn decode_all(decoder: &mut FrameDecoder, bytes: &[u8]) -> Result<Option<Frame>, Error> {
        let mut buf = BytesMut::from(bytes);
        decoder.decode(&mut buf)
    }

    #[test]
    fn decodes_rfc_masked_hello() {
        // The masked "Hello" example from RFC 6455 Section 5.7.
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut decoder = FrameDecoder::new(Role::Server, CAP);
        let frame = decode_all(&mut decoder, &bytes).unwrap().unwrap();

        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn decodes_unmasked_hello() {
        let bytes = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let frame = decode_all(&mut decoder, &bytes).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn partial_reads_need_more() {
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut decoder = FrameDecoder::new(Role::Server, CAP);
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the last byte completes the frame.
        for byte in &bytes[..bytes.len() - 1] {
            buf.put_u8(*byte);
            assert!(decoder.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(bytes[bytes.len() - 1]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn rejects_rsv2_rsv3() {
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0x91, 0x00]);
        assert!(matches!(res, Err(Error::ReservedBitsNotZero)));

        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0xA1, 0x00]);
        assert!(matches!(res, Err(Error::ReservedBitsNotZero)));
    }

    #[test]
    fn rejects_rsv1_on_control() {
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0xC9, 0x00]);
        assert!(matches!(res, Err(Error::ReservedBitsNotZero)));
    }

    #[test]
    fn rejects_reserved_opcode() {
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0x83, 0x00]);
        assert!(matches!(res, Err(Error::InvalidOpCode(0x3))));
    }

    #[test]
    fn rejects_fragmented_control() {
        // Ping with fin=0.
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0x09, 0x00]);
        assert!(matches!(res, Err(Error::ControlFrameFragmented)));
    }

    #[test]
    fn rejects_oversize_control() {
        // Ping with a 16-bit length of 126.
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0x89, 0x7E, 0x00, 0x7E]);
        assert!(matches!(res, Err(Error::ControlFrameTooLarge)));
    }

    #[test]
    fn enforces_masking_per_role() {
        // Server must see masked frames.
        let mut decoder = FrameDecoder::new(Role::Server, CAP);
        let res = decode_all(&mut decoder, &[0x81, 0x00]);
        assert!(matches!(res, Err(Error::ExpectedMaskedFrame)));

        // Client must not.
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &[0x81, 0x80, 1, 2, 3, 4]);
        assert!(matches!(res, Err(Error::ExpectedUnmaskedFrame)));
    }

    #[test]
    fn rejects_64bit_length_with_high_bit() {
        let mut bytes = vec![0x82, 0x7F];
        bytes.extend_from_slice(&(1u64 << 63 | 5).to_be_bytes());
        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let res = decode_all(&mut decoder, &bytes);
        assert!(matches!(res, Err(Error::FrameTooLarge)));
    }

    #[test]
    fn rejects_payload_over_cap() {
        let mut decoder = FrameDecoder::new(Role::Client, 16);
        let res = decode_all(&mut decoder, &[0x82, 0x20]);
        assert!(matches!(res, Err(Error::FrameTooLarge)));
    }

    #[test]
    fn encodes_unmasked_with_16bit_length() {
        let payload = vec![0xAB; 300];
        let mut encoder = FrameEncoder::new(Role::Server);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::binary(payload.clone()), &mut dst).unwrap();

        assert_eq!(dst[0], 0x82);
        assert_eq!(dst[1], 126);
        assert_eq!(u16::from_be_bytes([dst[2], dst[3]]), 300);
        assert_eq!(dst.len(), 4 + 300);
        assert_eq!(&dst[4..], &payload[..]);
    }

    #[test]
    fn encodes_64bit_length() {
        let payload = vec![0u8; 70_000];
        let mut encoder = FrameEncoder::new(Role::Server);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::binary(payload), &mut dst).unwrap();

        assert_eq!(dst[1], 127);
        assert_eq!(
            u64::from_be_bytes(dst[2..10].try_into().unwrap()),
            70_000
        );
        assert_eq!(dst.len(), 10 + 70_000);
    }

    #[test]
    fn client_frames_are_masked_and_roundtrip() {
        let mut encoder = FrameEncoder::new(Role::Client);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::text("backpressure"), &mut dst).unwrap();

        // Mask bit set, payload not in the clear.
        assert_eq!(dst[1] & 0x80, 0x80);
        assert_ne!(&dst[6..], b"backpressure");

        let mut decoder = FrameDecoder::new(Role::Server, CAP);
        let frame = decoder.decode(&mut dst).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"backpressure");
        assert!(dst.is_empty());
    }

    #[test]
    fn serialized_length_matches_header_form() {
        for (len, header) in [(5usize, 2usize), (125, 2), (126, 4), (65_535, 4), (65_536, 10)] {
            let mut encoder = FrameEncoder::new(Role::Server);
            let mut dst = BytesMut::new();
            encoder
                .encode(Frame::binary(vec![0u8; len]), &mut dst)
                .unwrap();
            assert_eq!(dst.len(), len + header, "payload len {len}");
        }
    }

    #[test]
    fn server_roundtrip_preserves_compression_bit() {
        let mut encoder = FrameEncoder::new(Role::Server);
        let mut dst = BytesMut::new();
        let mut frame = Frame::binary(vec![1, 2, 3]);
        frame.compressed = true;
        encoder.encode(frame, &mut dst).unwrap();
        assert_eq!(dst[0] & 0x40, 0x40);

        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let frame = decoder.decode(&mut dst).unwrap().unwrap();
        assert!(frame.is_compressed());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut encoder = FrameEncoder::new(Role::Server);
        let mut dst = BytesMut::new();
        encoder.encode(Frame::text("one"), &mut dst).unwrap();
        encoder.encode(Frame::text("two"), &mut dst).unwrap();

        let mut decoder = FrameDecoder::new(Role::Client, CAP);
        let first = decoder.decode(&mut dst).unwrap().unwrap();
        let second = decoder.decode(&mut dst).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(&second.payload[..], b"two");
        assert!(decoder.decode(&mut dst).unwrap().is_none());
    }
}
