//! The FRU object: identity, lifecycle, and accessors.
//!
//! A [`Fru`] is a reference-counted handle to one FRU inventory device. The
//! handle is shared between the caller, the per-domain registry (for tracked
//! objects), and whichever read or write operation is currently in flight;
//! `Arc` clone/drop is the reference count, and final teardown runs from
//! [`Drop`] when the last clone goes away.
//!
//! Allocation immediately starts the inventory fetch, so a freshly allocated
//! FRU is observable with two references (the caller's and the in-flight
//! operation's) and `in_use` set until the fetch completion callback runs.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use core::any::Any;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use ipmir::{domain::Domain, error::IpmiError};

use crate::{
    decoder::FruOps,
    engine::{self, record::UpdateRecord},
    error::FruError,
    registry::{FRU_ATTR_NAME, FruRegistry},
};

/// Fetch-mask bit: internal use area.
pub const FRU_AREA_INTERNAL_USE: u32 = 1 << 0;
/// Fetch-mask bit: chassis info area.
pub const FRU_AREA_CHASSIS_INFO: u32 = 1 << 1;
/// Fetch-mask bit: board info area.
pub const FRU_AREA_BOARD_INFO: u32 = 1 << 2;
/// Fetch-mask bit: product info area.
pub const FRU_AREA_PRODUCT_INFO: u32 = 1 << 3;
/// Fetch-mask bit: multi-record area.
pub const FRU_AREA_MULTI_RECORD: u32 = 1 << 4;
/// All areas; the mask tracked allocators install.
pub const FRU_ALL_AREA_MASK: u32 = FRU_AREA_INTERNAL_USE
    | FRU_AREA_CHASSIS_INFO
    | FRU_AREA_BOARD_INFO
    | FRU_AREA_PRODUCT_INFO
    | FRU_AREA_MULTI_RECORD;

/// Completion callback for [`Fru::alloc`]: receives the FRU and the fetch
/// result.
pub type FetchedHandler = Box<dyn FnOnce(&Arc<Fru>, Result<(), FruError>) + Send>;

/// Completion callback for [`Fru::domain_alloc`], [`Fru::alloc_notrack`],
/// and [`Fru::write`]: receives the domain as well.
pub type DomainFetchedHandler = Box<dyn FnOnce(&Arc<dyn Domain>, &Arc<Fru>, Result<(), FruError>) + Send>;

/// Handler invoked during final teardown, after the last reference dropped.
pub type DestroyedHandler = Box<dyn FnOnce(&Fru) + Send>;

/// The user callback installed for the operation in flight. Chosen at
/// allocation (or at write entry), consumed exactly once at completion.
pub(crate) enum CompletionHandler {
    Fru(FetchedHandler),
    Domain(DomainFetchedHandler),
}

/// Immutable addressing identity of a FRU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FruDevice {
    /// Logical FRU access. Physical access has no wire protocol specified
    /// and allocation of a physical FRU fails with
    /// [`FruError::NotImplemented`].
    pub is_logical: bool,
    /// 7-bit IPMB slave address of the managing controller.
    pub device_address: u8,
    /// FRU device id on that controller.
    pub device_id: u8,
    /// 2-bit logical unit.
    pub lun: u8,
    /// Private bus the device hangs off.
    pub private_bus: u8,
    /// IPMB channel.
    pub channel: u8,
}

/// Mutable FRU state, guarded by the per-FRU lock.
pub(crate) struct FruState {
    /// Cancellation flag; observed by read response handlers.
    pub deleted: bool,
    /// An operation (the initial fetch or a write) owns the FRU.
    pub in_use: bool,
    /// The per-domain registry holds a reference to this object.
    pub in_frulist: bool,
    /// Device addresses 16-bit words rather than bytes.
    pub access_by_words: bool,
    /// Adaptive read chunk size, walked down by capability back-off.
    pub fetch_size: usize,
    /// Raw inventory image; present only while an operation runs.
    pub data: Option<Vec<u8>>,
    /// Declared (or truncation-adjusted) inventory length in bytes.
    pub data_len: usize,
    /// Read cursor into `data`.
    pub curr_pos: usize,
    /// Dirty spans awaiting flush, consumed at the head.
    pub update_recs: VecDeque<UpdateRecord>,
    /// Body of the last write command, resent verbatim on device-busy.
    pub last_cmd: Vec<u8>,
    /// Device-busy retries of the current write command.
    pub retry_count: u32,
    /// User callback for the operation in flight.
    pub completion: Option<CompletionHandler>,
    /// User teardown handler, installed by destroy.
    pub destroy_handler: Option<DestroyedHandler>,
    /// Decoder-owned result of the last successful decode.
    pub rec_data: Option<Arc<dyn Any + Send + Sync>>,
    /// Decoder operations installed by the winning decoder.
    pub ops: Option<Arc<dyn FruOps>>,
    /// The decoder recognized a standard-format FRU.
    pub normal_fru: bool,
}

/// A FRU inventory device handle.
pub struct Fru {
    name: String,
    iname: String,
    domain: Weak<dyn Domain>,
    device: FruDevice,
    fetch_mask: u32,
    state: Mutex<FruState>,
}

impl Fru {
    fn alloc_internal(
        domain: &Arc<dyn Domain>,
        device: FruDevice,
        fetch_mask: u32,
        completion: CompletionHandler,
    ) -> Result<Arc<Fru>, FruError> {
        let name = format!("{}.{}", domain.name(), domain.next_unique_num());
        let iname = format!(
            "{}.{}.{:x}.{}.{}.{}.{} ",
            domain.name(),
            u8::from(device.is_logical),
            device.device_address,
            device.device_id,
            device.lun,
            device.private_bus,
            device.channel
        );

        let fru = Arc::new(Fru {
            name,
            iname,
            domain: Arc::downgrade(domain),
            device,
            fetch_mask,
            state: Mutex::new(FruState {
                deleted: false,
                in_use: true,
                in_frulist: false,
                access_by_words: false,
                fetch_size: engine::MAX_FRU_DATA_FETCH,
                data: None,
                data_len: 0,
                curr_pos: 0,
                update_recs: VecDeque::new(),
                last_cmd: Vec::new(),
                retry_count: 0,
                completion: Some(completion),
                destroy_handler: None,
                rec_data: None,
                ops: None,
                normal_fru: false,
            }),
        });

        if fru.device.is_logical {
            engine::read::start_logical_fetch(domain, &fru)?;
        } else {
            engine::read::start_physical_fetch(domain, &fru)?;
        }
        Ok(fru)
    }

    fn alloc_tracked(
        domain: &Arc<dyn Domain>,
        device: FruDevice,
        completion: CompletionHandler,
    ) -> Result<Arc<Fru>, FruError> {
        let registry = FruRegistry::attach(domain.as_ref())?;

        // The list lock is held across allocation and attachment so an
        // iterator can never observe a half-attached object, and the fetch
        // already in flight cannot complete against an untracked one.
        let mut list = registry.list();
        let fru = Self::alloc_internal(domain, device, FRU_ALL_AREA_MASK, completion)?;
        fru.state().in_frulist = true;
        list.push(Arc::clone(&fru));
        Ok(fru)
    }

    /// Allocates a registry-tracked FRU and starts its inventory fetch.
    /// `fetched` runs once the image has been fetched and decoded.
    pub fn alloc(
        domain: &Arc<dyn Domain>,
        device: FruDevice,
        fetched: impl FnOnce(&Arc<Fru>, Result<(), FruError>) + Send + 'static,
    ) -> Result<Arc<Fru>, FruError> {
        Self::alloc_tracked(domain, device, CompletionHandler::Fru(Box::new(fetched)))
    }

    /// Allocates a registry-tracked FRU with a domain-aware completion
    /// callback.
    pub fn domain_alloc(
        domain: &Arc<dyn Domain>,
        device: FruDevice,
        fetched: impl FnOnce(&Arc<dyn Domain>, &Arc<Fru>, Result<(), FruError>) + Send + 'static,
    ) -> Result<Arc<Fru>, FruError> {
        Self::alloc_tracked(domain, device, CompletionHandler::Domain(Box::new(fetched)))
    }

    /// Allocates a FRU that is not tracked by the per-domain registry, with
    /// a caller-supplied area fetch mask. Untracked objects are destroyed
    /// through [`Fru::destroy_internal`].
    pub fn alloc_notrack(
        domain: &Arc<dyn Domain>,
        device: FruDevice,
        fetch_mask: u32,
        fetched: impl FnOnce(&Arc<dyn Domain>, &Arc<Fru>, Result<(), FruError>) + Send + 'static,
    ) -> Result<Arc<Fru>, FruError> {
        Self::alloc_internal(domain, device, fetch_mask, CompletionHandler::Domain(Box::new(fetched)))
    }

    /// Serializes the decoder's current logical state and streams every
    /// changed span back to the device. `done` runs once the write fully
    /// completes or fails; if nothing changed it runs without any IPMI
    /// traffic. Fails with [`FruError::Busy`], without side effect, while
    /// another operation owns the FRU.
    pub fn write(
        self: &Arc<Self>,
        done: impl FnOnce(&Arc<dyn Domain>, &Arc<Fru>, Result<(), FruError>) + Send + 'static,
    ) -> Result<(), FruError> {
        engine::write::start_write(self, Box::new(done))
    }

    /// Destroys a registry-tracked FRU, consuming the caller's reference.
    ///
    /// The object is removed from the registry and flagged deleted; an
    /// in-flight fetch observes the flag at its next response and completes
    /// with [`FruError::Cancelled`]. `handler` runs during final teardown,
    /// after the last reference has dropped.
    pub fn destroy(self: Arc<Self>, handler: Option<DestroyedHandler>) -> Result<(), FruError> {
        let domain = {
            let st = self.state();
            if !st.in_frulist {
                // Only the engine's own allocations live in the registry.
                return Err(FruError::NotPermitted);
            }
            self.domain.upgrade().ok_or(FruError::Transport(IpmiError::DomainGone))?
        };

        self.state().in_frulist = false;

        let removed = domain
            .find_attribute(FRU_ATTR_NAME)
            .and_then(|attr| attr.downcast::<FruRegistry>().ok())
            .is_some_and(|registry| registry.remove(&self));
        if !removed {
            // Already gone from the list; someone else beat us to it.
            return Err(FruError::NotFound);
        }

        self.destroy_common(handler);
        Ok(())
    }

    /// Destroys a FRU that is not tracked by the registry, consuming the
    /// caller's reference.
    pub fn destroy_internal(self: Arc<Self>, handler: Option<DestroyedHandler>) -> Result<(), FruError> {
        if self.state().in_frulist {
            return Err(FruError::NotPermitted);
        }
        self.destroy_common(handler);
        Ok(())
    }

    fn destroy_common(self: Arc<Self>, handler: Option<DestroyedHandler>) {
        {
            let mut st = self.state();
            st.destroy_handler = handler;
            st.deleted = true;
        }
        drop(self);
    }

    /// The FRU's printable name: domain name plus a unique numeric suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The internal diagnostic name used to prefix log messages.
    pub fn internal_name(&self) -> &str {
        &self.iname
    }

    /// The owning domain. An upgrade failure means the domain was torn down.
    pub fn domain(&self) -> &Weak<dyn Domain> {
        &self.domain
    }

    /// The immutable addressing identity.
    pub fn device(&self) -> &FruDevice {
        &self.device
    }

    /// The area fetch mask supplied at allocation.
    pub fn fetch_mask(&self) -> u32 {
        self.fetch_mask
    }

    /// Declared length of the inventory area, in bytes.
    pub fn data_len(&self) -> usize {
        self.state().data_len
    }

    /// Runs `f` on the raw inventory image, if an operation currently holds
    /// one. The image only exists between the start of an operation and its
    /// completion callback.
    pub fn with_raw_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let st = self.state();
        st.data.as_deref().map(f)
    }

    /// The decoder-owned result of the last successful decode.
    pub fn rec_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state().rec_data.clone()
    }

    /// Replaces the decoder-owned result slot.
    pub fn set_rec_data(&self, rec_data: Option<Arc<dyn Any + Send + Sync>>) {
        self.state().rec_data = rec_data;
    }

    /// Installs the decoder operations vtable.
    pub fn set_ops(&self, ops: Arc<dyn FruOps>) {
        self.state().ops = Some(ops);
    }

    /// Whether the winning decoder recognized a standard-format FRU.
    pub fn is_normal_fru(&self) -> bool {
        self.state().normal_fru
    }

    /// Flags the FRU as holding a standard-format image.
    pub fn set_normal_fru(&self, val: bool) {
        self.state().normal_fru = val;
    }

    /// Acquires the per-FRU state lock. A poisoned lock is recovered: the
    /// state stays consistent across a panicking user callback, and one bad
    /// callback must not wedge every later operation.
    pub(crate) fn state(&self) -> MutexGuard<'_, FruState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Fru {
    fn drop(&mut self) {
        let (handler, ops) = {
            let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            (st.destroy_handler.take(), st.ops.take())
        };
        if let Some(handler) = handler {
            handler(self);
        }
        if let Some(ops) = ops {
            ops.cleanup(self);
        }
        // The decoder slot, any leftover update records, and the raw image
        // drop with the state.
    }
}

impl core::fmt::Debug for Fru {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fru").field("name", &self.name).field("device", &self.device).finish_non_exhaustive()
    }
}
