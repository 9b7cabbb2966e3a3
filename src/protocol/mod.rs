// (c) 2025 Ross Younger

//! SMP wire protocol definitions
//!
//! The Simple Management Protocol is a request/response protocol. Every
//! datagram is a [frame](SmpFrame): a fixed 8-byte header naming the
//! operation, command group, command id and an 8-bit sequence number,
//! followed by a CBOR map of string-keyed [values](Value).
//!
//! * Client ➡️ Device: request frame (`op` = Read or Write)
//! * Device ➡️ Client: response frame (`op` = ReadRsp or WriteRsp) carrying
//!   the same `(group, id, sequence)` triple
//!
//! Responses and requests are matched on that triple alone: the device may
//! answer overlapping requests in any order, and may also emit frames the
//! client never asked for (which the router quietly discards).
//!
//! A response either carries the requested data, or an `rc` field with a
//! non-zero numeric error; absence of `rc` means success.
//!
//! Command groups implemented here: OS management (group 0), image
//! management (group 1) and file management (group 8). The group and id
//! spaces are defined by the device firmware; see the Zephyr SMP
//! documentation for the full registry.

pub mod smp;
pub mod value;

pub use smp::{HEADER_LEN, Op, SmpFrame, SmpHeader, group};
pub use value::{PayloadExt, PayloadMap, Value, payload_from_slice, payload_len, payload_to_vec};
