//! Length framed wire protocol shared with the leg firmware.
//!
//! Every frame is `[length][protocol id][payload..][checksum]` where length
//! counts the protocol byte plus the payload and the checksum is the
//! wrapping byte sum of everything before it. Two sub protocols are
//! multiplexed on one stream: 0 carries commands, 1 carries text debug.

pub mod command;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

pub const COMMAND_PROTOCOL: u8 = 0;
pub const TEXT_PROTOCOL: u8 = 1;

pub fn encode_frame(protocol: u8, payload: &[u8]) -> Bytes {
    let length = (payload.len() + 1) as u8;
    let mut frame = BytesMut::with_capacity(payload.len() + 3);
    frame.put_u8(length);
    frame.put_u8(protocol);
    frame.put_slice(payload);
    let checksum = frame
        .iter()
        .fold(0u8, |accumulator, byte| accumulator.wrapping_add(*byte));
    frame.put_u8(checksum);
    frame.freeze()
}

/// Incremental frame decoder over an unreliable byte stream.
///
/// Malformed frames are logged and dropped, decoding continues with the
/// next frame.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Framer::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<(u8, Bytes)> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }
            let length = self.buffer[0] as usize;
            if length == 0 {
                warn!("dropping zero length frame byte");
                let _ = self.buffer.split_to(1);
                continue;
            }
            // length byte + body + checksum byte
            let needed = length + 2;
            if self.buffer.len() < needed {
                return None;
            }
            let frame = self.buffer.split_to(needed);
            let expected = frame[..needed - 1]
                .iter()
                .fold(0u8, |accumulator, byte| accumulator.wrapping_add(*byte));
            if expected != frame[needed - 1] {
                warn!(
                    "dropping frame with bad checksum ({} != {})",
                    frame[needed - 1],
                    expected
                );
                continue;
            }
            let protocol = frame[1];
            return Some((protocol, frame.freeze().slice(2..needed - 1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let mut framer = Framer::new();
        framer.push(&encode_frame(COMMAND_PROTOCOL, &[3, 1, 2]));
        framer.push(&encode_frame(TEXT_PROTOCOL, b"hi"));

        let (protocol, payload) = framer.next_frame().unwrap();
        assert_eq!(protocol, COMMAND_PROTOCOL);
        assert_eq!(&payload[..], &[3, 1, 2]);

        let (protocol, payload) = framer.next_frame().unwrap();
        assert_eq!(protocol, TEXT_PROTOCOL);
        assert_eq!(&payload[..], b"hi");

        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut framer = Framer::new();
        let frame = encode_frame(COMMAND_PROTOCOL, &[42]);
        framer.push(&frame[..2]);
        assert!(framer.next_frame().is_none());
        framer.push(&frame[2..]);
        let (_, payload) = framer.next_frame().unwrap();
        assert_eq!(&payload[..], &[42]);
    }

    #[test]
    fn corrupt_frame_is_dropped_and_decoding_continues() {
        let mut framer = Framer::new();
        let mut corrupted = encode_frame(COMMAND_PROTOCOL, &[1, 2, 3]).to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] = corrupted[last].wrapping_add(1);
        framer.push(&corrupted);
        framer.push(&encode_frame(COMMAND_PROTOCOL, &[9]));

        let (_, payload) = framer.next_frame().unwrap();
        assert_eq!(&payload[..], &[9]);
    }
}
