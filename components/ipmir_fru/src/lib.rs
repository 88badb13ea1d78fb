//! FRU inventory access engine.
//!
//! This component reads FRU (Field Replaceable Unit) inventory storage from
//! IPMI-addressable devices, caches the raw image while pluggable format
//! decoders interpret it, and writes modified regions back using a chunked,
//! resumable protocol. It sits on the [`ipmir`] domain seam and never
//! interprets the image itself; decoders register process-wide and the
//! first one to recognize a fetched image wins.
//!
//! A FRU is allocated with one of three flavors — [`Fru::alloc`] and
//! [`Fru::domain_alloc`] track the object in the per-domain registry,
//! [`Fru::alloc_notrack`] does not — and every allocation immediately starts
//! the inventory fetch. Writes go through [`Fru::write`] once a decoder has
//! been installed. Tracked objects are visited with
//! [`registry::iterate_frus`] and torn down with [`Fru::destroy`].
//!
//! ## Logging
//!
//! Engine diagnostics use the `ipmi_fru` log target, prefixed with each
//! FRU's internal diagnostic name.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

pub mod decoder;
mod engine;
pub mod error;
pub mod fru;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use decoder::{DecodedFru, FruDecoder, FruOps, deregister_decoder, register_decoder};
pub use engine::record::{FruImage, UpdateRecord};
pub use error::FruError;
pub use fru::{
    DestroyedHandler, DomainFetchedHandler, FRU_ALL_AREA_MASK, FRU_AREA_BOARD_INFO, FRU_AREA_CHASSIS_INFO,
    FRU_AREA_INTERNAL_USE, FRU_AREA_MULTI_RECORD, FRU_AREA_PRODUCT_INFO, FetchedHandler, Fru, FruDevice,
};
pub use registry::{FRU_ATTR_NAME, iterate_frus};

/// Process-level initialization: starts with an empty decoder registry.
/// Idempotent; callable before any decoder registers.
pub fn init() {
    decoder::clear_decoders();
}

/// Process-level shutdown: drops every registered decoder.
pub fn shutdown() {
    decoder::clear_decoders();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NullOps, decoder_registry_guard};
    use std::sync::Arc;

    struct Always;
    impl FruDecoder for Always {
        fn decode(&self, _fru: &Fru, _data: &[u8]) -> Result<DecodedFru, FruError> {
            Ok(DecodedFru { rec_data: None, ops: Arc::new(NullOps), normal_fru: true })
        }
    }

    #[test]
    fn test_shutdown_drops_registered_decoders() {
        let _guard = decoder_registry_guard();
        init();

        let decoder: Arc<dyn FruDecoder> = Arc::new(Always);
        register_decoder(Arc::clone(&decoder));
        shutdown();

        // The registration did not survive shutdown.
        assert_eq!(deregister_decoder(&decoder), Err(FruError::NotFound));
    }
}
