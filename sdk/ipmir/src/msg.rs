//! IPMI message vocabulary.
//!
//! Request/response carrier types plus the network function, command, and
//! completion-code constants used by the stack. Responses are delivered
//! exactly as the transport produced them: the completion code is the first
//! body byte and the payload follows.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use crate::addr::IpmbAddress;

/// Storage network function, home of the FRU inventory commands.
pub const NETFN_STORAGE: u8 = 0x0a;

/// `Get FRU Inventory Area Info` command.
pub const CMD_GET_FRU_INVENTORY_AREA_INFO: u8 = 0x10;
/// `Read FRU Data` command.
pub const CMD_READ_FRU_DATA: u8 = 0x11;
/// `Write FRU Data` command.
pub const CMD_WRITE_FRU_DATA: u8 = 0x12;

/// IPMI completion codes, per table 5-2 of the IPMI v2 specification.
///
/// Only the codes the stack consumes by value are named here; everything else
/// is carried through as the raw byte.
pub mod cc {
    /// Command completed normally.
    pub const OK: u8 = 0x00;
    /// Command-specific: FRU device busy (write path).
    pub const FRU_DEVICE_BUSY: u8 = 0x81;
    /// Node busy.
    pub const NODE_BUSY: u8 = 0xc0;
    /// Timeout while processing the command.
    pub const TIMEOUT: u8 = 0xc3;
    /// Request data length invalid.
    pub const REQUEST_DATA_LENGTH_INVALID: u8 = 0xc7;
    /// Request data field length limit exceeded.
    pub const REQUESTED_DATA_LENGTH_EXCEEDED: u8 = 0xc8;
    /// Parameter out of range.
    pub const PARAMETER_OUT_OF_RANGE: u8 = 0xc9;
    /// Cannot return number of requested data bytes.
    pub const CANNOT_RETURN_REQ_LENGTH: u8 = 0xca;
    /// Unspecified error.
    pub const UNKNOWN_ERROR: u8 = 0xff;

    /// Renders the standard description for a completion code, for log
    /// messages. Unknown codes render as "unrecognized completion code".
    pub fn describe(code: u8) -> &'static str {
        match code {
            OK => "Command completed normally",
            NODE_BUSY => "Node busy",
            0xc1 => "Invalid command",
            0xc2 => "Invalid command on LUN",
            TIMEOUT => "Timeout",
            0xc4 => "Out of space",
            0xc5 => "Reservation cancelled or invalid",
            0xc6 => "Request data truncated",
            REQUEST_DATA_LENGTH_INVALID => "Request data length invalid",
            REQUESTED_DATA_LENGTH_EXCEEDED => "Request data field length limit exceeded",
            PARAMETER_OUT_OF_RANGE => "Parameter out of range",
            CANNOT_RETURN_REQ_LENGTH => "Cannot return number of requested data bytes",
            0xcb => "Requested sensor, data, or record not found",
            0xcc => "Invalid data field in request",
            0xcd => "Command illegal for specified sensor or record type",
            0xce => "Command response could not be provided",
            0xcf => "Cannot execute duplicated request",
            0xd0 => "SDR Repository in update mode",
            0xd1 => "Device firmware in update mode",
            0xd2 => "BMC initialization in progress",
            0xd3 => "Destination unavailable",
            0xd4 => "Insufficient privilege level",
            0xd5 => "Command not supported in present state",
            0xd6 => "Cannot execute command, command disabled",
            UNKNOWN_ERROR => "Unspecified error",
            _ => "unrecognized completion code",
        }
    }
}

/// An IPMI message body: network function, command, and data bytes.
///
/// For requests the data is the command payload; for responses the first
/// data byte is the completion code and the payload follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmiMsg {
    pub netfn: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl IpmiMsg {
    /// Creates a request message.
    pub fn new(netfn: u8, cmd: u8, data: Vec<u8>) -> Self {
        Self { netfn, cmd, data }
    }

    /// The completion code of a response message.
    ///
    /// A body with no bytes at all reads as [`cc::UNKNOWN_ERROR`]; transports
    /// synthesize error responses for dropped replies, so an empty body only
    /// occurs when something upstream has already gone wrong.
    pub fn completion_code(&self) -> u8 {
        self.data.first().copied().unwrap_or(cc::UNKNOWN_ERROR)
    }
}

/// A response as delivered by the transport: the address it came from and
/// the message body.
#[derive(Debug, Clone)]
pub struct IpmiResponse {
    pub addr: IpmbAddress,
    pub msg: IpmiMsg,
}
