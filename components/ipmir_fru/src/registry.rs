//! The per-domain FRU registry.
//!
//! Every tracked FRU lives in a list stored as a domain attribute under the
//! key [`FRU_ATTR_NAME`]. Membership is mutated only under the list's own
//! lock; iteration snapshots a strong reference per element under that lock
//! and then runs user code with the lock released, so a handler always sees
//! a live object even while a concurrent destroyer races it off the list.
//!
//! When the domain tears the attribute down, every member is marked
//! untracked first: callers own their FRU handles, and the registry dropping
//! its references must never look like a user-initiated destroy.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use core::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ipmir::domain::Domain;

use crate::{error::FruError, fru::Fru};

/// Domain attribute key the FRU list is registered under.
pub const FRU_ATTR_NAME: &str = "ipmi_fru";

/// The domain-attribute payload: the list of tracked FRUs.
pub(crate) struct FruRegistry {
    frus: Mutex<Vec<Arc<Fru>>>,
}

impl FruRegistry {
    fn new_attr() -> Arc<dyn Any + Send + Sync> {
        Arc::new(FruRegistry { frus: Mutex::new(Vec::new()) })
    }

    /// Finds or creates the registry attribute on `domain`.
    pub(crate) fn attach(domain: &dyn Domain) -> Result<Arc<FruRegistry>, FruError> {
        let attr = domain.register_attribute(FRU_ATTR_NAME, Self::new_attr)?;
        attr.downcast::<FruRegistry>().map_err(|_| FruError::Transport(ipmir::IpmiError::AttributeTypeMismatch))
    }

    /// Acquires the list lock.
    pub(crate) fn list(&self) -> MutexGuard<'_, Vec<Arc<Fru>>> {
        self.frus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes `fru` from the list by identity, dropping the registry's
    /// reference. Returns whether it was still listed.
    pub(crate) fn remove(&self, fru: &Arc<Fru>) -> bool {
        let mut list = self.list();
        match list.iter().position(|member| Arc::ptr_eq(member, fru)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }
}

impl Drop for FruRegistry {
    fn drop(&mut self) {
        // Domain teardown. Callers still own their handles; just mark every
        // member untracked before the registry references drop.
        let frus = self.frus.get_mut().unwrap_or_else(PoisonError::into_inner);
        for fru in frus.iter() {
            fru.state().in_frulist = false;
        }
    }
}

/// Visits every FRU tracked by `domain`.
///
/// The handler runs with no registry lock held: references are snapshotted
/// under the list lock and each is released after its visit. Objects
/// inserted after iteration starts are not visited; objects removed after
/// the snapshot are still visited (and stay alive for the duration of their
/// visit).
pub fn iterate_frus(domain: &dyn Domain, mut handler: impl FnMut(&Arc<Fru>)) {
    let Some(attr) = domain.find_attribute(FRU_ATTR_NAME) else {
        return;
    };
    let Ok(registry) = attr.downcast::<FruRegistry>() else {
        return;
    };

    let snapshot: Vec<Arc<Fru>> = registry.list().clone();
    for fru in &snapshot {
        handler(fru);
    }
}
