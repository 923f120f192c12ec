//! Subscription file availability.
//!
//! Computes, per subscription, the set of input files still eligible for
//! work. A file is eligible when its acquisition state for *this*
//! subscription is still `Available`, it has at least one known location,
//! and at least one of those locations passes the subscription's site
//! restriction. Pure derived view, performs no writes.

use crate::model::AcquisitionState;
use crate::store::{StoreInner, StoreRef};
use crate::{FileId, Set, SubscriptionId};

pub struct AvailabilityEngine {
    store: StoreRef,
}

impl AvailabilityEngine {
    pub fn new(store: StoreRef) -> Self {
        Self { store }
    }

    /// Files of the subscription's fileset that are still eligible for work.
    /// The result is a set; no ordering is guaranteed.
    pub fn available_files(&self, subscription: SubscriptionId) -> crate::Result<Set<FileId>> {
        let txn = self.store.begin_read()?;
        available_files_in(&txn, subscription)
    }
}

/// Availability query against an already open transaction context.
pub fn available_files_in(
    txn: &StoreInner,
    subscription: SubscriptionId,
) -> crate::Result<Set<FileId>> {
    let subscription = txn.subscription(subscription)?;
    let mode = subscription.constraint_mode();
    let fileset = txn.fileset(subscription.fileset)?;

    let mut available = Set::default();
    for &file_id in &fileset.files {
        if txn.acquisition(file_id, subscription.id) != AcquisitionState::Available {
            continue;
        }
        let file = txn.file(file_id)?;
        // A file with no known location cannot be worked on anywhere; a file
        // survives a blacklist as long as one location is not blacklisted.
        if file.locations.iter().any(|location| mode.allows(location)) {
            available.insert(file_id);
        }
    }
    Ok(available)
}
