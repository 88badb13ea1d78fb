//! Test support: a scripted domain and canned decoder pieces.
//!
//! `FakeDomain` implements the domain seam over an in-memory queue: posted
//! commands are matched against a script of canned response builders, and
//! everything (responses and deferred domain work) is delivered when the
//! test pumps the queue. Handlers therefore run exactly like they would on a
//! transport worker thread: after the engine has released its locks.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use core::any::Any;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use ipmir::{
    addr::IpmbAddress,
    domain::{AttrInit, Domain, DomainWork, ResponseHandler},
    error::IpmiError,
    msg::{IpmiMsg, IpmiResponse},
};

use crate::{
    decoder::{DecodedFru, FruDecoder, FruOps},
    engine::record::FruImage,
    error::FruError,
    fru::{FRU_ALL_AREA_MASK, Fru, FruDevice},
};

/// Builds the response body for one scripted command.
pub type ScriptFn = Box<dyn FnOnce(&IpmiMsg) -> Vec<u8> + Send>;

/// Scripts a fixed response body.
pub fn reply(body: Vec<u8>) -> ScriptFn {
    Box::new(move |_| body)
}

enum Pending {
    Response(ResponseHandler, IpmiResponse),
    Work(DomainWork),
}

/// A scripted, synchronously pumped domain.
pub struct FakeDomain {
    name: String,
    unique: AtomicU32,
    attrs: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    script: Mutex<VecDeque<ScriptFn>>,
    pending: Mutex<VecDeque<Pending>>,
    sent: Mutex<Vec<IpmiMsg>>,
    refuse_work: AtomicBool,
}

impl FakeDomain {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            unique: AtomicU32::new(0),
            attrs: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            refuse_work: AtomicBool::new(false),
        })
    }

    pub fn as_domain(self: &Arc<Self>) -> Arc<dyn Domain> {
        Arc::clone(self) as Arc<dyn Domain>
    }

    /// Appends a response builder for the next unmatched command.
    pub fn script(&self, build: ScriptFn) {
        self.script.lock().unwrap_or_else(PoisonError::into_inner).push_back(build);
    }

    /// Every command posted so far, in order.
    pub fn sent(&self) -> Vec<IpmiMsg> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Makes `run_in_domain` fail, as a tearing-down domain would.
    pub fn refuse_domain_work(&self, refuse: bool) {
        self.refuse_work.store(refuse, Ordering::SeqCst);
    }

    /// Drops every registered attribute, as domain teardown does.
    pub fn clear_attributes(&self) {
        self.attrs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Delivers one pending response or deferred work item.
    pub fn pump_one(self: &Arc<Self>) -> bool {
        let next = self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some(next) = next else {
            return false;
        };
        let domain = self.as_domain();
        match next {
            Pending::Response(handler, rsp) => handler(&domain, rsp),
            Pending::Work(work) => work(&domain),
        }
        true
    }

    /// Delivers pending items until the queue drains.
    pub fn pump(self: &Arc<Self>) {
        while self.pump_one() {}
    }
}

impl Domain for FakeDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_unique_num(&self) -> u32 {
        self.unique.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn register_attribute(&self, name: &str, init: AttrInit) -> Result<Arc<dyn Any + Send + Sync>, IpmiError> {
        let mut attrs = self.attrs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(attrs.entry(name.to_string()).or_insert_with(init)))
    }

    fn find_attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attrs.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn send_command(&self, addr: IpmbAddress, msg: IpmiMsg, handler: ResponseHandler) -> Result<(), IpmiError> {
        let build = self.script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some(build) = build else {
            panic!("unscripted command: netfn {:#04x} cmd {:#04x} data {:02x?}", msg.netfn, msg.cmd, msg.data);
        };
        let body = build(&msg);
        let rsp = IpmiResponse { addr, msg: IpmiMsg::new(msg.netfn | 0x01, msg.cmd, body) };
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(msg);
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).push_back(Pending::Response(handler, rsp));
        Ok(())
    }

    fn run_in_domain(&self, work: DomainWork) -> Result<(), IpmiError> {
        if self.refuse_work.load(Ordering::SeqCst) {
            return Err(IpmiError::DomainGone);
        }
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).push_back(Pending::Work(work));
        Ok(())
    }
}

/// Decoder ops that do nothing.
pub struct NullOps;

impl FruOps for NullOps {
    fn write(&self, _fru: &Fru, _image: &mut FruImage<'_>) -> Result<(), FruError> {
        Ok(())
    }
    fn write_complete(&self, _fru: &Fru) {}
    fn cleanup(&self, _fru: &Fru) {}
}

/// Decoder ops driven by a fixed dirty-span plan. The image is filled with
/// its own byte offsets so command payloads are recognizable.
pub struct ScriptedOps {
    pub plan: Vec<(usize, usize)>,
    pub fail_write: Option<FruError>,
    pub write_completes: Arc<AtomicUsize>,
    pub cleanups: Arc<AtomicUsize>,
}

impl ScriptedOps {
    pub fn with_plan(plan: Vec<(usize, usize)>) -> Self {
        Self {
            plan,
            fail_write: None,
            write_completes: Arc::new(AtomicUsize::new(0)),
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FruOps for ScriptedOps {
    fn write(&self, _fru: &Fru, image: &mut FruImage<'_>) -> Result<(), FruError> {
        if let Some(err) = self.fail_write {
            return Err(err);
        }
        for (pos, byte) in image.data_mut().iter_mut().enumerate() {
            *byte = pos as u8;
        }
        for &(offset, length) in &self.plan {
            image.mark_dirty(offset, length);
        }
        Ok(())
    }

    fn write_complete(&self, _fru: &Fru) {
        self.write_completes.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&self, _fru: &Fru) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// A decoder that accepts every image and counts its invocations.
pub struct CountingDecoder {
    pub decodes: Arc<AtomicUsize>,
}

impl FruDecoder for CountingDecoder {
    fn decode(&self, _fru: &Fru, _data: &[u8]) -> Result<DecodedFru, FruError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        Ok(DecodedFru { rec_data: None, ops: Arc::new(NullOps), normal_fru: true })
    }
}

static DECODER_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that touch the process-wide decoder registry or pump a
/// fetch to completion (which dispatches through it).
pub fn decoder_registry_guard() -> MutexGuard<'static, ()> {
    DECODER_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocates an untracked FRU and pumps its fetch to completion, leaving it
/// idle with `data_len == len`. `len` must fit one read chunk.
pub fn fetched_fru(domain: &Arc<FakeDomain>, len: usize, words: bool) -> Arc<Fru> {
    assert!(len <= 32, "fetched_fru only scripts a single-chunk read");
    domain.script(reply(vec![0x00, len as u8, 0x00, u8::from(words)]));
    let shift = u32::from(words);
    domain.script(reply({
        let mut body = vec![0x00, (len >> shift) as u8];
        body.extend((0..len).map(|pos| pos as u8));
        body
    }));

    let device = FruDevice { is_logical: true, device_address: 0x20, device_id: 1, lun: 0, private_bus: 0, channel: 0 };
    let fru = Fru::alloc_notrack(&domain.as_domain(), device, FRU_ALL_AREA_MASK, |_, _, _| {}).unwrap();
    domain.pump();
    fru
}
