//! The domain seam.
//!
//! A *domain* is the surrounding IPMI management context: it owns the
//! transport, a per-domain attribute registry, and the worker threads that
//! deliver responses. Components never talk to a concrete domain type; they
//! consume this capability trait, which keeps them mockable and lets one
//! component implementation serve every connection flavor the stack grows.
//!
//! Components hold long-lived references to a domain as `Weak<dyn Domain>`.
//! An upgrade failure means the domain has been torn down, and id-based
//! lookups degrade gracefully instead of dangling.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use core::any::Any;
use std::sync::Arc;

use crate::{addr::IpmbAddress, error::IpmiError, msg::IpmiMsg, msg::IpmiResponse};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Handler invoked by the transport when a response (or a synthesized error
/// response) arrives for a posted command. Runs on a domain worker thread.
pub type ResponseHandler = Box<dyn FnOnce(&Arc<dyn Domain>, IpmiResponse) + Send>;

/// Deferred work executed on the domain thread.
pub type DomainWork = Box<dyn FnOnce(&Arc<dyn Domain>) + Send>;

/// Initializer for a domain attribute payload. Invoked at most once per key,
/// under the domain's attribute lock.
pub type AttrInit = fn() -> Arc<dyn Any + Send + Sync>;

/// Capability surface a component consumes from its domain.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Domain: Send + Sync {
    /// The domain's printable name.
    fn name(&self) -> &str;

    /// Allocates a number unique within this domain, used to suffix
    /// component object names.
    fn next_unique_num(&self) -> u32;

    /// Finds the attribute payload registered under `name`, or registers the
    /// payload produced by `init` if the key is vacant. Find-or-create runs
    /// under the domain's attribute lock, so two racing registrations of the
    /// same key observe the same payload.
    fn register_attribute(&self, name: &str, init: AttrInit) -> Result<Arc<dyn Any + Send + Sync>, IpmiError>;

    /// Finds the attribute payload registered under `name`.
    fn find_attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Posts a command to the transport. Never blocks for I/O: the command
    /// is queued and `handler` is invoked later, on a worker thread, with
    /// the matching response. The transport guarantees a response body with
    /// at least a completion code, synthesizing one on timeout.
    fn send_command(&self, addr: IpmbAddress, msg: IpmiMsg, handler: ResponseHandler) -> Result<(), IpmiError>;

    /// Executes `work` on the domain thread with a live reference to the
    /// domain. Fails with [`IpmiError::DomainGone`] if the domain is tearing
    /// down.
    fn run_in_domain(&self, work: DomainWork) -> Result<(), IpmiError>;
}
