//! Framing: fixed 20-byte header followed by a length-prefixed body.
//!
//! Header (little-endian): version u8 | flags u8 | reserved u16 | session_id u64 |
//! serial u32 | body_len u32.

use crate::identity::UniqueName;
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::session::SessionId;

pub const HEADER_SIZE: usize = 20;
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Body is a bincode-encoded control [`Message`]; session id must be 0.
pub const FLAG_CONTROL: u8 = 0x01;
/// Data forwarded by a multipoint host. Body is `sender_len u16 | sender | payload`.
pub const FLAG_RELAYED: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_CONTROL | FLAG_RELAYED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub session_id: SessionId,
    pub serial: u32,
    pub flags: u8,
    pub body_len: u32,
}

/// One framed unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    body: Vec<u8>,
}

impl Frame {
    /// Data frame carrying an opaque session payload.
    pub fn data(session_id: SessionId, serial: u32, body: Vec<u8>) -> Result<Frame, FrameEncodeError> {
        if !session_id.is_valid() {
            return Err(FrameEncodeError::InvalidSession);
        }
        Frame::build(session_id, serial, 0, body)
    }

    /// Data frame forwarded on behalf of `sender`, keeping the originator's serial.
    pub fn relayed(
        session_id: SessionId,
        serial: u32,
        sender: &UniqueName,
        payload: &[u8],
    ) -> Result<Frame, FrameEncodeError> {
        if !session_id.is_valid() {
            return Err(FrameEncodeError::InvalidSession);
        }
        let name = sender.as_str().as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| FrameEncodeError::TooLarge)?;
        let mut body = Vec::with_capacity(2 + name.len() + payload.len());
        body.extend_from_slice(&name_len.to_le_bytes());
        body.extend_from_slice(name);
        body.extend_from_slice(payload);
        Frame::build(session_id, serial, FLAG_RELAYED, body)
    }

    /// Control frame carrying a protocol message.
    pub fn control(serial: u32, msg: &Message) -> Result<Frame, FrameEncodeError> {
        let body = bincode::serialize(msg)?;
        Frame::build(SessionId::CONTROL, serial, FLAG_CONTROL, body)
    }

    fn build(session_id: SessionId, serial: u32, flags: u8, body: Vec<u8>) -> Result<Frame, FrameEncodeError> {
        if body.len() > MAX_BODY_LEN as usize {
            return Err(FrameEncodeError::TooLarge);
        }
        Ok(Frame {
            header: FrameHeader {
                session_id,
                serial,
                flags,
                body_len: body.len() as u32,
            },
            body,
        })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }

    pub fn serial(&self) -> u32 {
        self.header.serial
    }

    pub fn is_control(&self) -> bool {
        self.header.flags & FLAG_CONTROL != 0
    }

    pub fn is_relayed(&self) -> bool {
        self.header.flags & FLAG_RELAYED != 0
    }

    /// Split a relayed frame into originator and payload.
    pub fn relayed_parts(&self) -> Result<(UniqueName, &[u8]), FrameDecodeError> {
        if !self.is_relayed() {
            return Err(FrameDecodeError::NotRelayed);
        }
        let b = &self.body;
        if b.len() < 2 {
            return Err(FrameDecodeError::BadRelay);
        }
        let len = u16::from_le_bytes([b[0], b[1]]) as usize;
        let name = b.get(2..2 + len).ok_or(FrameDecodeError::BadRelay)?;
        let name = std::str::from_utf8(name).map_err(|_| FrameDecodeError::BadRelay)?;
        Ok((UniqueName::new(name), &b[2 + len..]))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Decode the control message in this frame's body.
    pub fn message(&self) -> Result<Message, FrameDecodeError> {
        if !self.is_control() {
            return Err(FrameDecodeError::NotControl);
        }
        Ok(bincode::deserialize(&self.body)?)
    }
}

/// Encode a frame: header then body.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let h = &frame.header;
    let mut out = Vec::with_capacity(HEADER_SIZE + frame.body.len());
    out.push(PROTOCOL_VERSION);
    out.push(h.flags);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&h.session_id.as_u64().to_le_bytes());
    out.extend_from_slice(&h.serial.to_le_bytes());
    out.extend_from_slice(&h.body_len.to_le_bytes());
    out.extend_from_slice(&frame.body);
    out
}

/// Error building a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("data frame needs a valid session id")]
    InvalidSession,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Returns `NeedMore` when the buffer holds only part of a frame; call again with more data.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let header = parse_header(&bytes[..HEADER_SIZE])?;
    let total = HEADER_SIZE + header.body_len as usize;
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = Frame {
        header,
        body: bytes[HEADER_SIZE..total].to_vec(),
    };
    Ok((frame, total))
}

fn parse_header(h: &[u8]) -> Result<FrameHeader, FrameDecodeError> {
    if h[0] != PROTOCOL_VERSION {
        return Err(FrameDecodeError::BadVersion(h[0]));
    }
    let flags = h[1];
    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameDecodeError::BadHeader("unknown flags"));
    }
    if h[2] != 0 || h[3] != 0 {
        return Err(FrameDecodeError::BadHeader("reserved bits set"));
    }
    let mut sid = [0u8; 8];
    sid.copy_from_slice(&h[4..12]);
    let session_id = SessionId::from_u64(u64::from_le_bytes(sid));
    let serial = u32::from_le_bytes([h[12], h[13], h[14], h[15]]);
    let body_len = u32::from_le_bytes([h[16], h[17], h[18], h[19]]);
    if body_len > MAX_BODY_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let control = flags & FLAG_CONTROL != 0;
    if control && flags & FLAG_RELAYED != 0 {
        return Err(FrameDecodeError::BadHeader("control frames are never relayed"));
    }
    if control == session_id.is_valid() {
        return Err(FrameDecodeError::BadHeader("control flag and session id disagree"));
    }
    Ok(FrameHeader {
        session_id,
        serial,
        flags,
        body_len,
    })
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("malformed header: {0}")]
    BadHeader(&'static str),
    #[error("not a control frame")]
    NotControl,
    #[error("not a relayed frame")]
    NotRelayed,
    #[error("malformed relay sender")]
    BadRelay,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

impl FrameDecodeError {
    /// True for errors that mean the stream is corrupt (as opposed to incomplete).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameDecodeError::NeedMore)
    }
}

/// Reassembles frames from a byte stream that arrives in arbitrary pieces.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with bytes already read past a handshake.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        match decode_frame(&self.buf) {
            Ok((frame, n)) => {
                self.buf.drain(..n);
                Ok(Some(frame))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn into_remaining(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeGuid;

    fn sid(n: u32) -> SessionId {
        SessionId::compose(0xabcd, n)
    }

    fn hello() -> Message {
        let guid = NodeGuid::generate();
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            guid,
            unique_name: guid.unique_name(1),
        }
    }

    #[test]
    fn data_frame_decodes_with_header_fields() {
        let frame = Frame::data(sid(1), 42, b"hello bus".to_vec()).unwrap();
        let bytes = encode_frame(&frame);
        assert_eq!(bytes.len(), HEADER_SIZE + 9);
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded.session_id(), sid(1));
        assert_eq!(decoded.serial(), 42);
        assert!(!decoded.is_control());
        assert_eq!(decoded.body(), b"hello bus");
    }

    #[test]
    fn control_frame_carries_message() {
        let frame = Frame::control(7, &hello()).unwrap();
        let (decoded, _) = decode_frame(&encode_frame(&frame)).unwrap();
        assert!(decoded.is_control());
        assert!(matches!(decoded.message().unwrap(), Message::Hello { .. }));
    }

    #[test]
    fn partial_read_need_more() {
        let frame = Frame::data(sid(2), 1, vec![9u8; 64]).unwrap();
        let bytes = encode_frame(&frame);
        assert!(matches!(decode_frame(&bytes[..3]), Err(FrameDecodeError::NeedMore)));
        assert!(matches!(
            decode_frame(&bytes[..HEADER_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn decoder_resumes_across_arbitrary_splits() {
        let a = Frame::data(sid(3), 1, b"first".to_vec()).unwrap();
        let b = Frame::control(2, &hello()).unwrap();
        let c = Frame::data(sid(3), 3, Vec::new()).unwrap();
        let mut stream = encode_frame(&a);
        stream.extend(encode_frame(&b));
        stream.extend(encode_frame(&c));

        let mut dec = FrameDecoder::new();
        let mut out = Vec::new();
        for piece in stream.chunks(5) {
            dec.push(piece);
            while let Some(f) = dec.next_frame().unwrap() {
                out.push(f);
            }
        }
        assert_eq!(out, vec![a, b, c]);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = encode_frame(&Frame::data(sid(1), 1, vec![1]).unwrap());
        bytes[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(decode_frame(&bytes), Err(FrameDecodeError::BadVersion(_))));
    }

    #[test]
    fn rejects_unknown_flags_and_reserved() {
        let good = encode_frame(&Frame::data(sid(1), 1, vec![1]).unwrap());
        let mut flags = good.clone();
        flags[1] = 0x80;
        assert!(matches!(decode_frame(&flags), Err(FrameDecodeError::BadHeader(_))));
        let mut reserved = good;
        reserved[3] = 1;
        assert!(matches!(decode_frame(&reserved), Err(FrameDecodeError::BadHeader(_))));
    }

    #[test]
    fn rejects_oversized_length_before_body_arrives() {
        let mut bytes = encode_frame(&Frame::data(sid(1), 1, vec![]).unwrap());
        bytes[16..20].copy_from_slice(&(MAX_BODY_LEN + 1).to_le_bytes());
        assert!(matches!(decode_frame(&bytes), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn rejects_control_flag_on_session_frame() {
        let mut bytes = encode_frame(&Frame::data(sid(1), 1, vec![]).unwrap());
        bytes[1] = FLAG_CONTROL;
        let err = decode_frame(&bytes).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn relayed_frame_keeps_sender_and_serial() {
        let sender = UniqueName::new(":1a2b3c4d.1");
        let frame = Frame::relayed(sid(4), 17, &sender, b"payload").unwrap();
        let (decoded, _) = decode_frame(&encode_frame(&frame)).unwrap();
        assert!(decoded.is_relayed());
        assert_eq!(decoded.serial(), 17);
        let (from, payload) = decoded.relayed_parts().unwrap();
        assert_eq!(from, sender);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn truncated_relay_sender_is_rejected() {
        let frame = Frame::build(sid(4), 1, FLAG_RELAYED, vec![9, 0, b'x']).unwrap();
        assert!(matches!(frame.relayed_parts(), Err(FrameDecodeError::BadRelay)));
        let plain = Frame::data(sid(4), 1, b"x".to_vec()).unwrap();
        assert!(matches!(plain.relayed_parts(), Err(FrameDecodeError::NotRelayed)));

        let mut both = encode_frame(&Frame::control(1, &hello()).unwrap());
        both[1] = FLAG_CONTROL | FLAG_RELAYED;
        assert!(matches!(decode_frame(&both), Err(FrameDecodeError::BadHeader(_))));
    }

    #[test]
    fn data_frame_requires_session() {
        assert!(matches!(
            Frame::data(SessionId::CONTROL, 1, vec![]),
            Err(FrameEncodeError::InvalidSession)
        ));
    }
}
