//! The read engine: two-phase chunked inventory fetch.
//!
//! Phase one asks the device how big its inventory area is and whether it
//! addresses bytes or 16-bit words. Phase two walks the area in ascending,
//! never-overlapping chunks of at most `fetch_size` bytes. Devices that
//! reject the chunk size (or silently drop over-large responses) are walked
//! down 32 → 24 → 16 by re-issuing the same read; devices that advertise
//! more area than they can serve are truncated at the error point once the
//! 8-byte header is in hand.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use std::sync::{Arc, MutexGuard};

use ipmir::{
    addr::IpmbAddress,
    domain::Domain,
    msg::{CMD_GET_FRU_INVENTORY_AREA_INFO, CMD_READ_FRU_DATA, IpmiMsg, IpmiResponse, NETFN_STORAGE, cc},
};
use zerocopy::{Ref, byteorder::little_endian::U16};
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::{
    decoder,
    engine::{FRU_DATA_FETCH_DECR, MIN_FRU_DATA_FETCH, finish_operation},
    error::FruError,
    fru::{Fru, FruState},
};

/// `Get FRU Inventory Area Info` response payload, after the completion
/// code: 16-bit area size and the access-mode flags (bit 0 = word access).
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned)]
struct InventoryAreaInfo {
    size: U16,
    access: u8,
}

fn ipmb_address(fru: &Fru) -> IpmbAddress {
    let device = fru.device();
    IpmbAddress::new(device.channel, device.device_address, device.lun)
}

/// Starts the fetch of a logical FRU: posts `Get FRU Inventory Area Info`.
pub(crate) fn start_logical_fetch(domain: &Arc<dyn Domain>, fru: &Arc<Fru>) -> Result<(), FruError> {
    let msg = IpmiMsg::new(NETFN_STORAGE, CMD_GET_FRU_INVENTORY_AREA_INFO, vec![fru.device().device_id]);
    let op = Arc::clone(fru);
    domain.send_command(ipmb_address(fru), msg, Box::new(move |domain, rsp| area_info_handler(domain, &op, rsp)))?;
    Ok(())
}

/// Physical (non-logical) FRU addressing has no wire protocol specified.
pub(crate) fn start_physical_fetch(_domain: &Arc<dyn Domain>, fru: &Arc<Fru>) -> Result<(), FruError> {
    log::error!(target: "ipmi_fru", "{}read: physical FRU access is not implemented", fru.internal_name());
    Err(FruError::NotImplemented)
}

/// Posts the next `Read FRU Data` for the chunk at `curr_pos`. Requests only
/// what remains; some devices dislike over-asking.
fn request_next_data(
    domain: &Arc<dyn Domain>,
    fru: &Arc<Fru>,
    st: &mut FruState,
    addr: &IpmbAddress,
) -> Result<(), FruError> {
    let to_read = (st.data_len - st.curr_pos).min(st.fetch_size);
    let shift = u32::from(st.access_by_words);

    let mut body = vec![fru.device().device_id];
    body.extend_from_slice(&((st.curr_pos >> shift) as u16).to_le_bytes());
    body.push((to_read >> shift) as u8);

    let msg = IpmiMsg::new(NETFN_STORAGE, CMD_READ_FRU_DATA, body);
    let op = Arc::clone(fru);
    domain.send_command(*addr, msg, Box::new(move |domain, rsp| data_handler(domain, &op, rsp)))?;
    Ok(())
}

fn area_info_handler(domain: &Arc<dyn Domain>, fru: &Arc<Fru>, rsp: IpmiResponse) {
    let mut st = fru.state();

    if st.deleted {
        fetch_complete(domain, fru, st, Err(FruError::Cancelled));
        return;
    }

    let code = rsp.msg.completion_code();
    if code != cc::OK {
        log::error!(
            target: "ipmi_fru",
            "{}read: IPMI error getting FRU inventory area: {:#04x} ({})",
            fru.internal_name(),
            code,
            cc::describe(code)
        );
        fetch_complete(domain, fru, st, Err(FruError::Ipmi(code)));
        return;
    }

    if rsp.msg.data.len() < 4 {
        log::error!(target: "ipmi_fru", "{}read: FRU inventory area response too small", fru.internal_name());
        fetch_complete(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    }

    let Ok((info, _)) = Ref::<&[u8], InventoryAreaInfo>::from_prefix(&rsp.msg.data[1..]) else {
        fetch_complete(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    };
    st.data_len = usize::from(info.size.get());
    st.access_by_words = info.access & 1 != 0;

    if st.data_len < 8 {
        log::error!(
            target: "ipmi_fru",
            "{}read: FRU space less than the header ({} bytes)",
            fru.internal_name(),
            st.data_len
        );
        fetch_complete(domain, fru, st, Err(FruError::AreaTooSmall));
        return;
    }

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(st.data_len).is_err() {
        log::error!(target: "ipmi_fru", "{}read: error allocating FRU data", fru.internal_name());
        fetch_complete(domain, fru, st, Err(FruError::OutOfResources));
        return;
    }
    buffer.resize(st.data_len, 0);
    st.data = Some(buffer);

    if let Err(err) = request_next_data(domain, fru, &mut st, &rsp.addr) {
        log::error!(target: "ipmi_fru", "{}read: error requesting next FRU data", fru.internal_name());
        fetch_complete(domain, fru, st, Err(err));
    }
}

fn data_handler(domain: &Arc<dyn Domain>, fru: &Arc<Fru>, rsp: IpmiResponse) {
    let mut st = fru.state();

    if st.deleted {
        fetch_complete(domain, fru, st, Err(FruError::Cancelled));
        return;
    }

    let code = rsp.msg.completion_code();

    // The timeout and unknown errors should not need back-off handling, but
    // some broken devices just return nothing when the response is too big.
    let capability_error = matches!(
        code,
        cc::CANNOT_RETURN_REQ_LENGTH
            | cc::REQUESTED_DATA_LENGTH_EXCEEDED
            | cc::REQUEST_DATA_LENGTH_INVALID
            | cc::TIMEOUT
            | cc::UNKNOWN_ERROR
    );
    if capability_error && st.fetch_size > MIN_FRU_DATA_FETCH {
        st.fetch_size -= FRU_DATA_FETCH_DECR;
        log::debug!(
            target: "ipmi_fru",
            "{}read: device rejected chunk ({}), backing off to {} bytes",
            fru.internal_name(),
            cc::describe(code),
            st.fetch_size
        );
        if let Err(err) = request_next_data(domain, fru, &mut st, &rsp.addr) {
            log::error!(target: "ipmi_fru", "{}read: error requesting next FRU data", fru.internal_name());
            fetch_complete(domain, fru, st, Err(err));
        }
        return;
    }

    if code != cc::OK {
        if st.curr_pos >= 8 {
            // Some cards advertise more area than they really have. With the
            // header already in hand, treat what we got as the whole FRU.
            log::warn!(
                target: "ipmi_fru",
                "{}read: IPMI error getting FRU data: {:#04x} ({}); truncating area to {} bytes",
                fru.internal_name(),
                code,
                cc::describe(code),
                st.curr_pos
            );
            st.data_len = st.curr_pos;
            let len = st.data_len;
            if let Some(data) = st.data.as_mut() {
                data.truncate(len);
            }
            fetch_complete(domain, fru, st, Ok(()));
        } else {
            log::error!(
                target: "ipmi_fru",
                "{}read: IPMI error getting FRU data: {:#04x} ({})",
                fru.internal_name(),
                code,
                cc::describe(code)
            );
            fetch_complete(domain, fru, st, Err(FruError::Ipmi(code)));
        }
        return;
    }

    if rsp.msg.data.len() < 2 {
        log::error!(target: "ipmi_fru", "{}read: FRU data response too small", fru.internal_name());
        fetch_complete(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    }

    let count = usize::from(rsp.msg.data[1]) << u32::from(st.access_by_words);

    if count == 0 {
        log::error!(
            target: "ipmi_fru",
            "{}read: FRU got zero-sized data, must make progress",
            fru.internal_name()
        );
        fetch_complete(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    }

    if count > rsp.msg.data.len() - 2 || count > st.data_len - st.curr_pos {
        log::error!(target: "ipmi_fru", "{}read: FRU data count mismatch", fru.internal_name());
        fetch_complete(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    }

    if st.data.is_none() {
        fetch_complete(domain, fru, st, Err(FruError::InvalidResponse));
        return;
    }
    let pos = st.curr_pos;
    if let Some(data) = st.data.as_mut() {
        data[pos..pos + count].copy_from_slice(&rsp.msg.data[2..2 + count]);
    }
    st.curr_pos += count;

    if st.curr_pos < st.data_len {
        if let Err(err) = request_next_data(domain, fru, &mut st, &rsp.addr) {
            log::error!(target: "ipmi_fru", "{}read: error requesting next FRU data", fru.internal_name());
            fetch_complete(domain, fru, st, Err(err));
        }
    } else {
        fetch_complete(domain, fru, st, Ok(()));
    }
}

/// Read-side completion: a successful fetch hands the image to the decoder
/// registry before the common completion routine runs the user callback.
fn fetch_complete<'a>(
    domain: &Arc<dyn Domain>,
    fru: &'a Arc<Fru>,
    mut st: MutexGuard<'a, FruState>,
    mut result: Result<(), FruError>,
) {
    if result.is_ok() {
        match st.data.take() {
            Some(image) => {
                // Decoders run with the lock released; `in_use` keeps any
                // write out until the completion callback has returned.
                drop(st);
                result = decoder::dispatch(fru, &image);
                st = fru.state();
            }
            None => result = Err(FruError::InvalidResponse),
        }
    }
    finish_operation(domain, fru, st, result);
}
