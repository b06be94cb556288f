//! tfsproxy wire protocol
//!
//! Binary messages exchanged with the four backend roles: the routing (rc)
//! service, the root service holding the meta table, name servers, meta
//! servers and data servers. Every message is a 24 byte [`codec::Header`]
//! followed by a little-endian payload.
//!
//! Each role module offers `encode_*` functions producing ready-to-send
//! packets, `parse_*` functions decoding replies (status replies are mapped
//! to errors first), and `*_response` builders that produce the replies a
//! server would send.

pub mod codec;
pub mod data;
pub mod fsname;
pub mod meta;
pub mod name;
pub mod rc;
pub mod root;
pub mod segment;
pub mod status;

pub use codec::{Decoded, Frame, Header, MessageType, PacketBuilder, Reader, HEADER_SIZE};
pub use fsname::{RawFileKind, RawFsName};
pub use name::{BlockInfo, OpenMode};
pub use rc::RcInfo;
pub use root::MetaTable;
pub use segment::{SegmentDirectory, SegmentInfo};
pub use status::StatusMessage;
