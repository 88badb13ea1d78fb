//! Format decoder plug-ins.
//!
//! The engine never interprets the raw inventory image itself. Decoders
//! register process-wide; when a fetch completes, each registered decoder is
//! offered the image in registration order and the first one that accepts
//! wins. The winner's parse result lands in the FRU's decoder-scratch slot
//! and its [`FruOps`] vtable is installed for the write path.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use core::any::Any;
use std::sync::{Arc, PoisonError, RwLock};

use crate::{engine::record::FruImage, error::FruError, fru::Fru};

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Result of a successful decode.
pub struct DecodedFru {
    /// Decoder-owned parse result, stored in the FRU's scratch slot.
    pub rec_data: Option<Arc<dyn Any + Send + Sync>>,
    /// Operations the write engine calls back into.
    pub ops: Arc<dyn FruOps>,
    /// Whether the image is a standard-format FRU.
    pub normal_fru: bool,
}

/// A format decoder.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait FruDecoder: Send + Sync {
    /// Offers `data` (the complete fetched image) to this decoder. Any error
    /// declines the image and the next registered decoder is consulted.
    fn decode(&self, fru: &Fru, data: &[u8]) -> Result<DecodedFru, FruError>;
}

/// Operations installed by the winning decoder.
///
/// Hooks receive everything they may touch as arguments; they must not call
/// back into accessors that take the FRU state lock the engine released to
/// invoke them (`name`, `internal_name`, `device`, and `fetch_mask` are
/// lock-free and always safe).
pub trait FruOps: Send + Sync {
    /// Serializes the decoder's current logical state into `image` (a
    /// zero-filled buffer of the full declared length) and marks every span
    /// that differs from what the device currently holds. Marking nothing
    /// completes the write immediately with no IPMI traffic.
    fn write(&self, fru: &Fru, image: &mut FruImage<'_>) -> Result<(), FruError>;

    /// A write fully reached the device; the decoder clears its dirty
    /// tracking so an unchanged rewrite marks nothing.
    fn write_complete(&self, fru: &Fru);

    /// Final teardown. Runs once, after the last reference to the FRU
    /// dropped and before the decoder-scratch slot is released.
    fn cleanup(&self, fru: &Fru);
}

static DECODERS: RwLock<Vec<Arc<dyn FruDecoder>>> = RwLock::new(Vec::new());

/// Appends a decoder to the process-wide registry. Decoders are consulted in
/// registration order.
pub fn register_decoder(decoder: Arc<dyn FruDecoder>) {
    DECODERS.write().unwrap_or_else(PoisonError::into_inner).push(decoder);
}

/// Removes a previously registered decoder, by identity.
pub fn deregister_decoder(decoder: &Arc<dyn FruDecoder>) -> Result<(), FruError> {
    let mut decoders = DECODERS.write().unwrap_or_else(PoisonError::into_inner);
    let pos = decoders.iter().position(|d| Arc::ptr_eq(d, decoder)).ok_or(FruError::NotFound)?;
    decoders.remove(pos);
    Ok(())
}

/// Empties the registry. Used by the process init/shutdown hooks.
pub(crate) fn clear_decoders() {
    DECODERS.write().unwrap_or_else(PoisonError::into_inner).clear();
}

/// Offers the fetched image to each registered decoder in order; the first
/// acceptance installs its result on the FRU. All-decline reports an
/// unsupported format.
pub(crate) fn dispatch(fru: &Arc<Fru>, data: &[u8]) -> Result<(), FruError> {
    let decoders: Vec<Arc<dyn FruDecoder>> = DECODERS.read().unwrap_or_else(PoisonError::into_inner).clone();

    for decoder in decoders {
        let Ok(decoded) = decoder.decode(fru, data) else {
            continue;
        };
        let mut st = fru.state();
        st.rec_data = decoded.rec_data;
        st.ops = Some(decoded.ops);
        st.normal_fru = decoded.normal_fru;
        return Ok(());
    }

    log::debug!(target: "ipmi_fru", "{}no decoder accepted a {}-byte image", fru.internal_name(), data.len());
    Err(FruError::UnsupportedFormat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDomain, NullOps, decoder_registry_guard, reply};
    use crate::fru::FruDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OrderProbe {
        order: Arc<AtomicUsize>,
        tag: usize,
        accept: bool,
    }

    impl FruDecoder for OrderProbe {
        fn decode(&self, _fru: &Fru, _data: &[u8]) -> Result<DecodedFru, FruError> {
            // Record the visit order as appended base-10 digits.
            self.order.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + self.tag)).ok();
            if self.accept {
                Ok(DecodedFru { rec_data: Some(Arc::new(self.tag)), ops: Arc::new(NullOps), normal_fru: true })
            } else {
                Err(FruError::UnsupportedFormat)
            }
        }
    }

    fn test_fru(domain: &Arc<FakeDomain>) -> Arc<Fru> {
        domain.script(reply(vec![0x00, 16, 0, 0]));
        let device =
            FruDevice { is_logical: true, device_address: 0x20, device_id: 0, lun: 0, private_bus: 0, channel: 0 };
        Fru::alloc_notrack(&domain.as_domain(), device, crate::fru::FRU_ALL_AREA_MASK, |_, _, _| {}).unwrap()
    }

    #[test]
    fn test_first_accepting_decoder_wins_in_registration_order() {
        let _guard = decoder_registry_guard();
        clear_decoders();

        let order = Arc::new(AtomicUsize::new(0));
        register_decoder(Arc::new(OrderProbe { order: Arc::clone(&order), tag: 1, accept: false }));
        register_decoder(Arc::new(OrderProbe { order: Arc::clone(&order), tag: 2, accept: true }));
        register_decoder(Arc::new(OrderProbe { order: Arc::clone(&order), tag: 3, accept: true }));

        let domain = FakeDomain::new("dom");
        let fru = test_fru(&domain);
        dispatch(&fru, &[0u8; 16]).unwrap();

        // Decoder 3 was never consulted; decoder 2's result was installed.
        assert_eq!(order.load(Ordering::SeqCst), 12);
        assert_eq!(fru.rec_data().unwrap().downcast_ref::<usize>(), Some(&2));
        assert!(fru.is_normal_fru());

        clear_decoders();
    }

    #[test]
    fn test_all_decoders_declining_is_unsupported_format() {
        let _guard = decoder_registry_guard();
        clear_decoders();

        let order = Arc::new(AtomicUsize::new(0));
        register_decoder(Arc::new(OrderProbe { order: Arc::clone(&order), tag: 1, accept: false }));

        let domain = FakeDomain::new("dom");
        let fru = test_fru(&domain);
        assert_eq!(dispatch(&fru, &[0u8; 16]), Err(FruError::UnsupportedFormat));
        assert!(fru.rec_data().is_none());

        clear_decoders();
    }

    #[test]
    fn test_deregister_removes_by_identity() {
        let _guard = decoder_registry_guard();
        clear_decoders();

        let order = Arc::new(AtomicUsize::new(0));
        let first: Arc<dyn FruDecoder> = Arc::new(OrderProbe { order: Arc::clone(&order), tag: 1, accept: true });
        let twin: Arc<dyn FruDecoder> = Arc::new(OrderProbe { order: Arc::clone(&order), tag: 1, accept: true });
        register_decoder(Arc::clone(&first));

        // A structurally identical decoder is not the registered one.
        assert_eq!(deregister_decoder(&twin), Err(FruError::NotFound));
        deregister_decoder(&first).unwrap();
        assert_eq!(deregister_decoder(&first), Err(FruError::NotFound));

        clear_decoders();
    }

    #[test]
    fn test_mocked_decoder_decline() {
        let _guard = decoder_registry_guard();
        clear_decoders();

        let mut mock = MockFruDecoder::new();
        mock.expect_decode().times(1).returning(|_, _| Err(FruError::InvalidResponse));
        register_decoder(Arc::new(mock));

        let domain = FakeDomain::new("dom");
        let fru = test_fru(&domain);
        // A decoder error of any kind is a decline, not a dispatch failure.
        assert_eq!(dispatch(&fru, &[0u8; 16]), Err(FruError::UnsupportedFormat));

        clear_decoders();
    }
}
