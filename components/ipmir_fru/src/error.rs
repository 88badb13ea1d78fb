//! Error types for FRU operations.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use ipmir::error::IpmiError;

/// FRU operation errors.
///
/// This enum covers everything a read, write, destroy, or decoder operation
/// can report through its completion callback or its synchronous return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FruError {
    // Device-reported errors
    /// The device answered with a non-zero IPMI completion code.
    Ipmi(u8),

    // Structural errors
    /// A response was too short, declared a zero transfer count, or declared
    /// a count larger than the bytes it actually carried.
    InvalidResponse,
    /// The device advertised an inventory area smaller than the 8-byte FRU
    /// common header.
    AreaTooSmall,

    // Resource errors
    /// The raw image buffer could not be allocated.
    OutOfResources,

    // Cancellation (reads only; writes always run to completion)
    /// The FRU was destroyed while the fetch was in flight.
    Cancelled,

    // Policy errors, reported without side effect
    /// Another operation currently owns the FRU.
    Busy,
    /// Tracked-destroy was invoked on an untracked FRU, or untracked-destroy
    /// on a tracked one.
    NotPermitted,
    /// The object was not where the operation expected it: the FRU had
    /// already been removed from its registry, or the decoder being
    /// deregistered was never registered.
    NotFound,

    // Format errors
    /// No registered decoder recognized the raw inventory image.
    UnsupportedFormat,
    /// Physical (non-logical) FRU addressing has no wire protocol specified.
    NotImplemented,

    // Seam errors
    /// The domain or transport failed underneath the operation.
    Transport(IpmiError),
}

impl From<IpmiError> for FruError {
    fn from(err: IpmiError) -> Self {
        FruError::Transport(err)
    }
}
