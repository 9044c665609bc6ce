use bytes::Bytes;

use crate::error::Result;
use crate::io::BufMutExt;
use crate::net::queue::ByteQueue;

/// Largest payload a single frame can carry. A logical message of
/// exactly this size (or larger) continues in the next frame; the
/// message ends at the first frame with a smaller payload, possibly
/// zero-length.
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;

/// Frame header: 24-bit little-endian payload length plus sequence id.
pub const HEADER_LEN: usize = 4;

/// Splits a raw byte stream into frames and stamps outgoing frames with
/// sequence ids.
///
/// One framer serves one socket; the sequence counter is shared by both
/// directions of that socket's conversation and is reset at phase
/// boundaries (new command, authentication restart).
#[derive(Debug)]
pub struct PacketFramer {
    /// Payload length of the frame currently being assembled; `None`
    /// until the 4-byte header has been consumed.
    packet_len: Option<usize>,

    /// Sequence id expected on the next received frame and used for the
    /// next sent frame.
    seq: u8,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            packet_len: None,
            seq: 0,
        }
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Phase reset (command start, auth completion, `COM_CHANGE_USER`).
    pub fn reset(&mut self) {
        self.packet_len = None;
        self.seq = 0;
    }

    /// Resynchronize after a frame moved through this socket outside the
    /// framer's control (verbatim forwarding).
    pub fn observe(&mut self, frame: &[u8]) {
        self.seq = frame[3].wrapping_add(1);
    }

    /// Pop one complete frame, header included, off the raw queue.
    ///
    /// Returns `None` until enough bytes have arrived. A sequence id
    /// other than the expected one is a protocol violation.
    pub fn unframe(&mut self, raw: &mut ByteQueue) -> Result<Option<Bytes>> {
        if self.packet_len.is_none() {
            let mut header = [0u8; HEADER_LEN];
            if !raw.peek(&mut header) {
                return Ok(None);
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let seq = header[3];

            if seq != self.seq {
                return Err(err_protocol!(
                    "received packet with sequence id {seq}, but expected {}",
                    self.seq
                ));
            }

            self.packet_len = Some(len);
            self.seq = seq.wrapping_add(1);
        }

        // packet_len was either just set or carried over from an earlier
        // call that ran short of bytes
        let need = self.packet_len.unwrap_or(0) + HEADER_LEN;

        if raw.len() < need {
            return Ok(None);
        }

        let frame = raw.pop(need);
        self.packet_len = None;

        Ok(Some(frame))
    }

    /// Frame a payload onto the send queue, splitting it into maximal
    /// frames at the 16 MiB boundary. Each emitted frame consumes one
    /// sequence id.
    pub fn frame(&mut self, send: &mut ByteQueue, payload: &[u8]) {
        let mut rest = payload;

        loop {
            let take = rest.len().min(MAX_PAYLOAD_LEN);

            let mut frame = Vec::with_capacity(HEADER_LEN + take);
            frame.put_u24(take as u32);
            frame.put_u8(self.seq);
            frame.put_bytes(&rest[..take]);

            self.seq = self.seq.wrapping_add(1);
            send.push(Bytes::from(frame));

            rest = &rest[take..];

            // a maximal frame demands a continuation, possibly empty
            if take < MAX_PAYLOAD_LEN {
                break;
            }
        }
    }
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload view of a complete frame.
pub fn payload(frame: &[u8]) -> &[u8] {
    &frame[HEADER_LEN..]
}

/// Sequence id of a complete frame.
pub fn seq(frame: &[u8]) -> u8 {
    frame[3]
}

/// `true` when the frame carries a maximal payload and the logical
/// message continues in the next frame.
pub fn is_overlong(frame: &[u8]) -> bool {
    frame.len() - HEADER_LEN == MAX_PAYLOAD_LEN
}
