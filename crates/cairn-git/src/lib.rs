//! Git protocol implementation for Cairn.
//!
//! This crate implements the pkt-line framing, the pack file format with
//! delta compression, and the smart HTTP fetch and push services, enabling
//! standard git clients to clone from and push to Cairn repositories.
//!
//! Everything here is synchronous over `std::io::{Read, Write}`; the node
//! drives it from blocking tasks.

pub mod delta;
mod error;
pub mod negotiate;
pub mod pack;
pub mod pktline;
mod protocol;
pub mod walk;

pub use delta::{apply_delta, encode_delta};
pub use error::GitError;
pub use negotiate::{
    Command, FetchCapabilities, PushCapabilities, ReceiveNegotiation, ReceiveState, SideBand,
    UploadNegotiation, UploadState,
};
pub use pack::{DecodedPack, PackBuilder, PackLimits, PackObject, PackParser};
pub use pktline::{PktLine, PktLineReader, PktLineWriter};
pub use protocol::{
    advertise_refs, list_advertised, parse_report, receive_pack, upload_pack, write_push_request,
    CommandStatus, FetchReport, PushReport, RefAdvertisement, RefUpdate, Service, TransferOptions,
};
pub use walk::{check_connected, is_ancestor, missing_closure, reachable};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
