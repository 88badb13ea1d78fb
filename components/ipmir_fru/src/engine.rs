//! The read and write engines.
//!
//! Both engines are callback-driven: they post one IPMI command at a time
//! and continue from the transport's response handler. All progress state
//! lives in the FRU itself, guarded by the per-FRU lock; the in-flight
//! operation owns a strong reference through the handler closure it leaves
//! with the transport.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use std::sync::{Arc, MutexGuard};

use ipmir::domain::Domain;

use crate::{
    error::FruError,
    fru::{CompletionHandler, Fru, FruState},
};

pub(crate) mod read;
pub mod record;
pub(crate) mod write;

/// Largest read chunk requested before any back-off.
pub(crate) const MAX_FRU_DATA_FETCH: usize = 32;
/// Back-off step when a device rejects the current chunk size.
pub(crate) const FRU_DATA_FETCH_DECR: usize = 8;
/// Smallest read chunk; a rejection at this size is final.
pub(crate) const MIN_FRU_DATA_FETCH: usize = 16;
/// Payload byte limit of one `Write FRU Data` command.
pub(crate) const MAX_FRU_DATA_WRITE: usize = 16;
/// Device-busy resends allowed per write command.
pub(crate) const MAX_FRU_WRITE_RETRIES: u32 = 30;

/// Single completion routine every operation funnels through: releases the
/// raw image, clears `in_use`, drops the lock, and then invokes whichever
/// user callback variant was installed.
pub(crate) fn finish_operation(
    domain: &Arc<dyn Domain>,
    fru: &Arc<Fru>,
    mut st: MutexGuard<'_, FruState>,
    result: Result<(), FruError>,
) {
    st.data = None;
    st.in_use = false;
    let completion = st.completion.take();
    drop(st);

    match completion {
        Some(CompletionHandler::Fru(callback)) => callback(fru, result),
        Some(CompletionHandler::Domain(callback)) => callback(domain, fru, result),
        None => {}
    }
}
