// (c) 2025 Ross Younger

//! SMP frame structure and codec
//!
//! A frame is an 8-byte big-endian header followed by a CBOR map:
//!
//! ```text
//!  0       1       2     3       4     5       6       7
//! ┌───────┬───────┬─────────────┬─────────────┬───────┬───────┐
//! │  op   │ flags │   length    │    group    │  seq  │  id   │ CBOR payload...
//! └───────┴───────┴─────────────┴─────────────┴───────┴───────┘
//! ```
//!
//! `length` is the byte count of the payload that follows; a frame whose
//! tail does not match it is rejected outright. `sequence` is assigned by
//! the requester and echoed by the device, which is what lets responses be
//! matched back to requests on a full-duplex link.

use bytes::{Buf, BufMut};

use super::value::{PayloadMap, payload_from_slice, payload_to_vec};
use crate::{Error, Result};

/// Wire size of the fixed header
pub const HEADER_LEN: usize = 8;

/// Operation code (two request kinds, and their response counterparts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Read request
    Read = 0,
    /// Response to a read
    ReadRsp = 1,
    /// Write request
    Write = 2,
    /// Response to a write
    WriteRsp = 3,
}

impl TryFrom<u8> for Op {
    type Error = Error;
    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Op::Read,
            1 => Op::ReadRsp,
            2 => Op::Write,
            3 => Op::WriteRsp,
            other => return Err(Error::MalformedFrame(format!("unknown op {other}"))),
        })
    }
}

/// Command group numbers
pub mod group {
    /// OS management (echo, reset, buffer parameters)
    pub const OS: u16 = 0;
    /// Image management (slots, upload, erase)
    pub const IMAGE: u16 = 1;
    /// Filesystem management (file read/write)
    pub const FS: u16 = 8;
}

/// The fixed SMP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpHeader {
    /// Operation
    pub op: Op,
    /// Flag bits; devices currently define none
    pub flags: u8,
    /// Payload byte count. Filled in by the encoder.
    pub length: u16,
    /// Command group
    pub group: u16,
    /// Request identifier, echoed by the device
    pub sequence: u8,
    /// Command id within the group
    pub id: u8,
}

/// A complete SMP message: header plus CBOR payload map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpFrame {
    /// The fixed header
    pub header: SmpHeader,
    /// The payload map (possibly empty)
    pub payload: PayloadMap,
}

impl SmpFrame {
    /// Builds a request frame. The sequence number is assigned later, when
    /// the frame is issued.
    #[must_use]
    pub fn request(op: Op, group: u16, id: u8, payload: PayloadMap) -> Self {
        SmpFrame {
            header: SmpHeader {
                op,
                flags: 0,
                length: 0,
                group,
                sequence: 0,
                id,
            },
            payload,
        }
    }

    /// Encodes header and payload into one wire frame.
    ///
    /// The header's `length` field is ignored and recomputed from the actual
    /// payload encoding.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = payload_to_vec(&self.payload)?;
        let length = u16::try_from(payload.len())
            .map_err(|_| Error::MalformedFrame(format!("payload of {} bytes", payload.len())))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(self.header.op as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(length);
        buf.put_u16(self.header.group);
        buf.put_u8(self.header.sequence);
        buf.put_u8(self.header.id);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes one complete wire frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "{}-byte frame is shorter than the header",
                frame.len()
            )));
        }
        let mut buf = frame;
        let op = Op::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let length = buf.get_u16();
        let group = buf.get_u16();
        let sequence = buf.get_u8();
        let id = buf.get_u8();
        if usize::from(length) != frame.len() - HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "declared payload {length} bytes, got {}",
                frame.len() - HEADER_LEN
            )));
        }
        let payload = payload_from_slice(&frame[HEADER_LEN..])?;
        Ok(SmpFrame {
            header: SmpHeader {
                op,
                flags,
                length,
                group,
                sequence,
                id,
            },
            payload,
        })
    }
}

impl std::fmt::Display for SmpFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = &self.header;
        write!(
            f,
            "{:?} group={} id={} seq={} ({} payload keys)",
            h.op,
            h.group,
            h.id,
            h.sequence,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{HEADER_LEN, Op, SmpFrame, group};
    use crate::{Error, payload};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn golden_echo_request() {
        let mut frame = SmpFrame::request(Op::Write, group::OS, 0, payload! { "d" => "hi" });
        frame.header.sequence = 7;
        let wire = frame.encode().unwrap();
        // op=2, flags=0, len=0x0006, group=0x0000, seq=7, id=0, {"d":"hi"}
        assert_eq!(wire, b"\x02\x00\x00\x06\x00\x00\x07\x00\xa1\x61\x64\x62hi");
    }

    #[test]
    fn roundtrip() {
        let mut frame = SmpFrame::request(
            Op::Write,
            group::IMAGE,
            1,
            payload! {
                "data" => vec![9u8; 100],
                "off" => 0u64,
                "len" => 1024u64,
                "sha" => vec![0xCCu8; 32],
                "image" => 0u64,
            },
        );
        frame.header.sequence = 200;
        let wire = frame.encode().unwrap();
        let back = SmpFrame::decode(&wire).unwrap();
        assert_eq!(back.header.op, Op::Write);
        assert_eq!(back.header.group, group::IMAGE);
        assert_eq!(back.header.id, 1);
        assert_eq!(back.header.sequence, 200);
        assert_eq!(usize::from(back.header.length), wire.len() - HEADER_LEN);
        assert_eq!(back.payload, frame.payload);
    }

    #[test]
    fn empty_payload_encodes_as_empty_map() {
        let wire = SmpFrame::request(Op::Read, group::OS, 6, payload! {})
            .encode()
            .unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 1);
        assert_eq!(wire[HEADER_LEN], 0xA0);
        let back = SmpFrame::decode(&wire).unwrap();
        assert!(back.payload.is_empty());
    }

    #[test]
    fn zero_length_tail_is_accepted() {
        // a frame with no payload bytes at all decodes to the empty map
        let frame = SmpFrame::decode(b"\x01\x00\x00\x00\x00\x00\x01\x00").unwrap();
        assert!(frame.payload.is_empty());
    }

    #[rstest]
    #[case::short_header(b"\x02\x00\x00".as_slice())]
    #[case::bad_op(b"\x07\x00\x00\x01\x00\x00\x00\x00\xa0".as_slice())]
    #[case::length_short(b"\x02\x00\x00\x05\x00\x00\x00\x00\xa0".as_slice())]
    #[case::length_long(b"\x02\x00\x00\x00\x00\x00\x00\x00\xa0".as_slice())]
    #[case::payload_garbage(b"\x02\x00\x00\x01\x00\x00\x00\x00\xff".as_slice())]
    fn rejects_malformed(#[case] wire: &[u8]) {
        assert!(matches!(
            SmpFrame::decode(wire),
            Err(Error::MalformedFrame(_))
        ));
    }
}
