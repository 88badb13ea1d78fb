//! Shared interfaces for the ipmir IPMI management stack.
//!
//! This crate carries the vocabulary that stack components exchange with the
//! surrounding IPMI domain: wire-level message types and completion codes,
//! IPMB addressing, the [`domain::Domain`] capability trait, and the seam
//! error type. Components (such as `ipmir_fru`) depend on this crate rather
//! than on a concrete transport, so the whole stack can be driven by a real
//! connection in production and by a scripted one in tests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

pub mod addr;
pub mod domain;
pub mod error;
pub mod msg;

pub use addr::IpmbAddress;
pub use domain::Domain;
pub use error::IpmiError;
pub use msg::{IpmiMsg, IpmiResponse};
