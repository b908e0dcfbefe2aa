//! Frame codec
//!
//! Length-prefixed decoding of the gateway byte stream. Malformed records are
//! dropped and the stream resynchronizes on the next start code; the stream
//! itself only fails on socket errors.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::error::FrameError;
use crate::frame::{
    Frame, FC_READ_HOLDING, FC_WRITE_SINGLE, MAX_DECLARED_LEN, MIN_DECLARED_LEN, PREAMBLE_LEN,
    START_CODE,
};

/// Decoder for the gateway's length-prefixed records.
///
/// Use with `FramedRead` to turn a socket read half into a lazy, restartable
/// sequence of [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Parse one record off the front of `src`.
    ///
    /// `Ok(None)` means more bytes are needed. A malformed header is an
    /// error; the caller decides whether to resynchronize.
    fn parse_record(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < PREAMBLE_LEN + 1 {
            return Ok(None);
        }

        if src[PREAMBLE_LEN] != START_CODE {
            return Err(FrameError::BadStartCode {
                found: src[PREAMBLE_LEN],
            });
        }

        let length = u16::from_be_bytes([src[4], src[5]]);
        if !(MIN_DECLARED_LEN..=MAX_DECLARED_LEN).contains(&length) {
            return Err(FrameError::BadLength { length });
        }

        // The function code decides whether an address field follows it
        if src.len() < PREAMBLE_LEN + 4 {
            return Ok(None);
        }
        let function_code = src[PREAMBLE_LEN + 3];
        let addr_len = match function_code {
            FC_READ_HOLDING | FC_WRITE_SINGLE => 2,
            _ => 0,
        };

        let payload_len = (length - 3) as usize;
        let total = PREAMBLE_LEN + 4 + addr_len + payload_len;
        if src.len() < total {
            return Ok(None);
        }

        let record = src.split_to(total);
        Ok(Some(Frame {
            identify: u16::from_be_bytes([record[0], record[1]]),
            slave_id: u16::from_be_bytes([record[7], record[8]]),
            function_code,
            payload: Bytes::copy_from_slice(&record[PREAMBLE_LEN + 4 + addr_len..]),
        }))
    }

    /// Discard the bad record head and realign on the next candidate start
    /// code, keeping room for the preamble that must precede it.
    fn resync(src: &mut BytesMut) {
        let next = src[PREAMBLE_LEN + 1..]
            .iter()
            .position(|&b| b == START_CODE);
        match next {
            Some(pos) => src.advance(pos + 1),
            None => {
                let keep = PREAMBLE_LEN.min(src.len());
                src.advance(src.len() - keep);
            },
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match Self::parse_record(src) {
                Ok(item) => return Ok(item),
                Err(err) => {
                    warn!("frame resync: {}", err);
                    Self::resync(src);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Command, CurtainAction, SWITCH_REGISTER};

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_read_command() {
        let frames = decode_all(&[
            0x00, 0x35, 0x00, 0x00, 0x00, 0x05, 0x55, 0x00, 0x05, 0x03, 0x10, 0x08, 0x00, 0x01,
        ]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].identify, 53);
        assert_eq!(frames[0].slave_id, 5);
        assert_eq!(frames[0].function_code, 3);
        assert_eq!(frames[0].payload.as_ref(), &[0x00, 0x01]);
    }

    #[test]
    fn test_roundtrip_commands() {
        let commands = [
            Command::read_registers(5, 53, SWITCH_REGISTER, 1),
            Command::write_register(3, 31, SWITCH_REGISTER, 0x0102),
            Command::curtain(2, CurtainAction::Open),
            Command::curtain(2, CurtainAction::Close),
            Command::curtain(2, CurtainAction::Stop),
            Command::curtain(2, CurtainAction::SetPosition(30)),
            Command::curtain(2, CurtainAction::Query),
        ];
        for cmd in commands {
            let bytes = cmd.encode().unwrap();
            let frames = decode_all(&bytes);
            assert_eq!(frames.len(), 1, "one frame per command: {cmd:?}");
            let frame = &frames[0];
            assert_eq!(frame.slave_id, cmd.slave_id);
            assert_eq!(frame.identify, cmd.identify);
            let expected_fc = match cmd.kind {
                crate::frame::CommandKind::ReadRegisters { .. } => 3,
                crate::frame::CommandKind::WriteRegister { .. } => 6,
                crate::frame::CommandKind::Curtain(_) => 1,
            };
            assert_eq!(frame.function_code, expected_fc);
        }
    }

    #[test]
    fn test_decode_two_records_in_one_buffer() {
        let mut bytes = Command::read_registers(5, 53, SWITCH_REGISTER, 1)
            .encode()
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(
            &Command::curtain(2, CurtainAction::Stop).encode().unwrap(),
        );
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].slave_id, 5);
        assert_eq!(frames[1].slave_id, 2);
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let bytes = Command::read_registers(5, 53, SWITCH_REGISTER, 1)
            .encode()
            .unwrap();
        // Feed one byte at a time; the frame must appear exactly once
        for split in 1..bytes.len() {
            let mut codec = FrameCodec;
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&bytes[..split]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(&bytes[split..]);
            let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(frame.slave_id, 5);
        }
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut bytes = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x09, 0x99];
        bytes.extend_from_slice(
            &Command::read_registers(5, 53, SWITCH_REGISTER, 1).encode().unwrap(),
        );
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].slave_id, 5);
    }

    #[test]
    fn test_resync_on_bad_length() {
        // Valid start code but declared length below the floor
        let mut bytes = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x55];
        bytes.extend_from_slice(
            &Command::write_register(3, 31, SWITCH_REGISTER, 7).encode().unwrap(),
        );
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function_code, 6);
        assert_eq!(frames[0].register_value(), Some(7));
    }

    #[test]
    fn test_garbage_without_start_code_is_discarded() {
        let frames = decode_all(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09]);
        assert!(frames.is_empty());
    }
}
