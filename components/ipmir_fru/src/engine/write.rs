//! The write engine: flush decoder-marked spans back to the device.
//!
//! A write rebuilds the complete image on the domain thread and streams the
//! dirty spans out in queue order, greedily coalescing adjacent spans into
//! commands of at most 16 payload bytes. The full rebuild is required by
//! word access: a 16-bit write may need the byte next to the changed one,
//! and that byte can come from a different logical field.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use std::{
    collections::VecDeque,
    sync::{Arc, MutexGuard},
};

use ipmir::{
    addr::IpmbAddress,
    domain::Domain,
    error::IpmiError,
    msg::{CMD_WRITE_FRU_DATA, IpmiMsg, IpmiResponse, NETFN_STORAGE, cc},
};

use crate::{
    engine::{MAX_FRU_DATA_WRITE, MAX_FRU_WRITE_RETRIES, finish_operation, record::FruImage},
    error::FruError,
    fru::{CompletionHandler, Fru, FruState},
};

/// Entry point behind [`Fru::write`]: gates on `in_use`, installs the user
/// callback, and defers image preparation to the domain thread. Failure to
/// hand off clears the gate again; a refused write has no side effect.
pub(crate) fn start_write(
    fru: &Arc<Fru>,
    done: crate::fru::DomainFetchedHandler,
) -> Result<(), FruError> {
    let domain = fru.domain().upgrade().ok_or(FruError::Transport(IpmiError::DomainGone))?;

    {
        let mut st = fru.state();
        if st.in_use {
            return Err(FruError::Busy);
        }
        st.in_use = true;
        st.completion = Some(CompletionHandler::Domain(done));
    }

    let op = Arc::clone(fru);
    if let Err(err) = domain.run_in_domain(Box::new(move |domain| start_domain_write(domain, &op))) {
        let mut st = fru.state();
        st.in_use = false;
        st.completion = None;
        return Err(err.into());
    }
    Ok(())
}

/// Domain-thread half of write start: rebuild the image through the
/// decoder's `write` hook and begin streaming. All failures from here on
/// complete through the write callback.
fn start_domain_write(domain: &Arc<dyn Domain>, fru: &Arc<Fru>) {
    let (ops, data_len, access_by_words) = {
        let st = fru.state();
        match st.ops.clone() {
            Some(ops) => (ops, st.data_len, st.access_by_words),
            None => {
                finish_operation(domain, fru, st, Err(FruError::UnsupportedFormat));
                return;
            }
        }
    };

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(data_len).is_err() {
        log::error!(target: "ipmi_fru", "{}write: error allocating FRU image", fru.internal_name());
        finish_operation(domain, fru, fru.state(), Err(FruError::OutOfResources));
        return;
    }
    buffer.resize(data_len, 0);

    // The hook runs with the FRU lock released; `in_use` keeps every other
    // operation out in the meantime.
    let mut records = VecDeque::new();
    let mut image = FruImage::new(&mut buffer, &mut records, access_by_words);
    if let Err(err) = ops.write(fru, &mut image) {
        log::error!(target: "ipmi_fru", "{}write: decoder failed to serialize FRU image", fru.internal_name());
        finish_operation(domain, fru, fru.state(), Err(err));
        return;
    }

    let mut st = fru.state();
    if records.is_empty() {
        // Nothing differs from the device; no IPMI traffic needed.
        finish_operation(domain, fru, st, Ok(()));
        return;
    }

    st.data = Some(buffer);
    st.update_recs = records;

    let device = fru.device();
    let addr = IpmbAddress::new(device.channel, device.device_address, device.lun);
    if let Err(err) = next_write(domain, fru, &mut st, &addr) {
        write_done(domain, fru, st, Err(err));
    }
}

/// Builds and posts one `Write FRU Data` command: starts at the head span's
/// offset and consumes spans while they stay contiguous and payload room
/// remains. A partially consumed head span advances in place.
fn next_write(
    domain: &Arc<dyn Domain>,
    fru: &Arc<Fru>,
    st: &mut FruState,
    addr: &IpmbAddress,
) -> Result<(), FruError> {
    let start = match st.update_recs.front() {
        Some(rec) => rec.offset,
        None => return Err(FruError::InvalidResponse),
    };

    let mut cursor = start;
    let mut room = MAX_FRU_DATA_WRITE;
    let mut length: usize = 0;
    while room > 0 {
        let Some(rec) = st.update_recs.front_mut() else {
            break;
        };
        if rec.offset != cursor {
            break;
        }
        let take = usize::from(rec.length).min(room);
        cursor += take as u16;
        length += take;
        room -= take;
        if take < usize::from(rec.length) {
            rec.offset += take as u16;
            rec.length -= take as u16;
        } else {
            st.update_recs.pop_front();
        }
    }

    st.retry_count = 0;

    let data = st.data.as_ref().ok_or(FruError::InvalidResponse)?;
    let start = usize::from(start);
    let shift = u32::from(st.access_by_words);

    let mut body = Vec::with_capacity(3 + length);
    body.push(fru.device().device_id);
    body.extend_from_slice(&((start >> shift) as u16).to_le_bytes());
    body.extend_from_slice(&data[start..start + length]);
    st.last_cmd = body.clone();

    let msg = IpmiMsg::new(NETFN_STORAGE, CMD_WRITE_FRU_DATA, body);
    let op = Arc::clone(fru);
    domain.send_command(*addr, msg, Box::new(move |domain, rsp| write_handler(domain, &op, rsp)))?;
    Ok(())
}

fn write_handler(domain: &Arc<dyn Domain>, fru: &Arc<Fru>, rsp: IpmiResponse) {
    let mut st = fru.state();

    // Deletion does not stop a write in flight; the remaining spans are
    // flushed and the callback runs late rather than leaving the device
    // half-written.

    let code = rsp.msg.completion_code();

    if code == cc::FRU_DEVICE_BUSY {
        if st.retry_count >= MAX_FRU_WRITE_RETRIES {
            log::error!(
                target: "ipmi_fru",
                "{}write: device still busy after {} retries",
                fru.internal_name(),
                st.retry_count
            );
            write_done(domain, fru, st, Err(FruError::Ipmi(code)));
            return;
        }
        st.retry_count += 1;
        // Resend the saved command verbatim.
        let msg = IpmiMsg::new(NETFN_STORAGE, CMD_WRITE_FRU_DATA, st.last_cmd.clone());
        let op = Arc::clone(fru);
        if let Err(err) =
            domain.send_command(rsp.addr, msg, Box::new(move |domain, rsp| write_handler(domain, &op, rsp)))
        {
            write_done(domain, fru, st, Err(err.into()));
        }
        return;
    }

    if code != cc::OK {
        log::error!(
            target: "ipmi_fru",
            "{}write: IPMI error writing FRU data: {:#04x} ({})",
            fru.internal_name(),
            code,
            cc::describe(code)
        );
        write_done(domain, fru, st, Err(FruError::Ipmi(code)));
        return;
    }

    if rsp.msg.data.len() < 2 {
        log::error!(target: "ipmi_fru", "{}write: FRU write response too small", fru.internal_name());
        write_done(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    }

    let acked = usize::from(rsp.msg.data[1]) << u32::from(st.access_by_words);
    let sent = st.last_cmd.len() - 3;
    if acked != sent {
        // The device took the command but acknowledged fewer bytes. Carry
        // on; there is no way to replay part of a command.
        log::warn!(
            target: "ipmi_fru",
            "{}write: incomplete FRU write, wrote {}, expected {}",
            fru.internal_name(),
            acked,
            sent
        );
    }

    if st.update_recs.is_empty() {
        write_done(domain, fru, st, Ok(()));
    } else if let Err(err) = next_write(domain, fru, &mut st, &rsp.addr) {
        write_done(domain, fru, st, Err(err));
    }
}

/// Write-side completion: a fully flushed image lets the decoder clear its
/// dirty tracking before the common completion routine runs the callback.
/// Any leftover spans from a failed stream are discarded so a later write
/// starts from a clean queue.
fn write_done<'a>(
    domain: &Arc<dyn Domain>,
    fru: &'a Arc<Fru>,
    mut st: MutexGuard<'a, FruState>,
    result: Result<(), FruError>,
) {
    if result.is_ok() {
        if let Some(ops) = st.ops.clone() {
            drop(st);
            ops.write_complete(fru);
            st = fru.state();
        }
    }
    st.update_recs.clear();
    finish_operation(domain, fru, st, result);
}
