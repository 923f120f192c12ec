//! In-memory bookkeeping store.
//!
//! The engines never touch shared state directly: every query or mutation
//! goes through an explicitly passed transaction context ([`ReadTxn`] or
//! [`WriteTxn`]) obtained from a [`StoreRef`]. One context corresponds to one
//! transaction; reads observe a consistent snapshot and writes to the same
//! row serialize with last-writer-wins semantics.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::error::{not_found, validation, WmError};
use crate::common::idcounter::IdCounter;
use crate::common::ids::AcquisitionKey;
use crate::common::Map;
use crate::model::{
    AcquisitionState, BatchStatus, FileRecord, Fileset, Job, JobState, Site, SiteName,
    Subscription, TaskType, Threshold,
};
use crate::{FileId, FilesetId, JobId, Set, SubscriptionId, WorkflowId};

/// Shared handle to the bookkeeping store.
#[derive(Clone)]
pub struct StoreRef(Arc<RwLock<StoreInner>>);

impl StoreRef {
    pub fn new() -> StoreRef {
        StoreRef(Arc::new(RwLock::new(StoreInner::default())))
    }

    /// Open a read transaction: a consistent snapshot over all tables.
    pub fn begin_read(&self) -> crate::Result<ReadTxn<'_>> {
        self.0.read().map(ReadTxn).map_err(poisoned)
    }

    /// Open a write transaction. Writers serialize with each other and with
    /// readers, so admission queries never observe a half-applied update.
    pub fn begin_write(&self) -> crate::Result<WriteTxn<'_>> {
        self.0.write().map(WriteTxn).map_err(poisoned)
    }
}

impl Default for StoreRef {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> WmError {
    WmError::TransientStoreError("bookkeeping store lock was poisoned".to_string())
}

/// Read transaction context, threaded through query helpers.
pub struct ReadTxn<'a>(RwLockReadGuard<'a, StoreInner>);

impl Deref for ReadTxn<'_> {
    type Target = StoreInner;

    fn deref(&self) -> &StoreInner {
        &self.0
    }
}

/// Write transaction context.
pub struct WriteTxn<'a>(RwLockWriteGuard<'a, StoreInner>);

impl Deref for WriteTxn<'_> {
    type Target = StoreInner;

    fn deref(&self) -> &StoreInner {
        &self.0
    }
}

impl DerefMut for WriteTxn<'_> {
    fn deref_mut(&mut self) -> &mut StoreInner {
        &mut self.0
    }
}

#[derive(Default)]
pub struct StoreInner {
    sites: Map<SiteName, Site>,
    /// Thresholds per site, in insertion order. The order breaks priority
    /// ties and drives default priority assignment.
    thresholds: Map<SiteName, Vec<Threshold>>,
    jobs: Map<JobId, Job>,
    run_jobs: Map<JobId, BatchStatus>,
    subscriptions: Map<SubscriptionId, Subscription>,
    filesets: Map<FilesetId, Fileset>,
    files: Map<FileId, FileRecord>,
    files_by_lfn: Map<String, FileId>,
    acquisitions: Map<AcquisitionKey, AcquisitionState>,
    job_ids: IdCounter,
    file_ids: IdCounter,
    subscription_ids: IdCounter,
    fileset_ids: IdCounter,
}

impl StoreInner {
    // Site registry rows

    pub fn site(&self, name: &str) -> crate::Result<&Site> {
        match self.sites.get(name) {
            Some(site) => Ok(site),
            None => not_found(format!("Site {name} is not registered")),
        }
    }

    pub fn site_mut(&mut self, name: &str) -> crate::Result<&mut Site> {
        match self.sites.get_mut(name) {
            Some(site) => Ok(site),
            None => not_found(format!("Site {name} is not registered")),
        }
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    pub fn has_site(&self, name: &str) -> bool {
        self.sites.contains_key(name)
    }

    /// Insert the site unless a site of the same name already exists.
    /// Returns true if the row was inserted.
    pub fn insert_site_row(&mut self, site: Site) -> bool {
        if self.sites.contains_key(&site.name) {
            return false;
        }
        self.thresholds.entry(site.name.clone()).or_default();
        self.sites.insert(site.name.clone(), site);
        true
    }

    pub fn thresholds_for(&self, site: &str) -> &[Threshold] {
        self.thresholds.get(site).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn thresholds_for_mut(&mut self, site: &str) -> crate::Result<&mut Vec<Threshold>> {
        match self.thresholds.get_mut(site) {
            Some(thresholds) => Ok(thresholds),
            None => not_found(format!("Site {site} is not registered")),
        }
    }

    // Files and filesets

    pub fn create_fileset(&mut self, name: &str) -> FilesetId {
        let id = FilesetId::new(self.fileset_ids.increment() as u32);
        self.filesets.insert(
            id,
            Fileset {
                id,
                name: name.to_string(),
                files: Set::default(),
            },
        );
        id
    }

    pub fn fileset(&self, id: FilesetId) -> crate::Result<&Fileset> {
        match self.filesets.get(&id) {
            Some(fileset) => Ok(fileset),
            None => not_found(format!("Fileset {id} does not exist")),
        }
    }

    /// Register a file under its logical name. Registering an existing LFN
    /// merges the new locations into the known set.
    pub fn register_file<I>(&mut self, lfn: &str, size_bytes: u64, locations: I) -> FileId
    where
        I: IntoIterator<Item = SiteName>,
    {
        if let Some(&id) = self.files_by_lfn.get(lfn) {
            let file = self.files.get_mut(&id).expect("lfn index out of sync");
            file.locations.extend(locations);
            return id;
        }
        let id = FileId::new(self.file_ids.increment());
        self.files.insert(
            id,
            FileRecord {
                id,
                lfn: lfn.to_string(),
                size_bytes,
                locations: locations.into_iter().collect(),
            },
        );
        self.files_by_lfn.insert(lfn.to_string(), id);
        id
    }

    pub fn file(&self, id: FileId) -> crate::Result<&FileRecord> {
        match self.files.get(&id) {
            Some(file) => Ok(file),
            None => not_found(format!("File {id} does not exist")),
        }
    }

    pub fn file_by_lfn(&self, lfn: &str) -> Option<&FileRecord> {
        self.files_by_lfn.get(lfn).and_then(|id| self.files.get(id))
    }

    pub fn add_file_to_fileset(&mut self, file: FileId, fileset: FilesetId) -> crate::Result<()> {
        if !self.files.contains_key(&file) {
            return not_found(format!("File {file} does not exist"));
        }
        match self.filesets.get_mut(&fileset) {
            Some(fs) => {
                fs.files.insert(file);
                Ok(())
            }
            None => not_found(format!("Fileset {fileset} does not exist")),
        }
    }

    // Subscriptions

    pub fn create_subscription(
        &mut self,
        fileset: FilesetId,
        workflow: WorkflowId,
        task_type: TaskType,
    ) -> crate::Result<SubscriptionId> {
        if !self.filesets.contains_key(&fileset) {
            return not_found(format!("Fileset {fileset} does not exist"));
        }
        let id = SubscriptionId::new(self.subscription_ids.increment() as u32);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                fileset,
                workflow,
                task_type,
                constraints: Vec::new(),
            },
        );
        Ok(id)
    }

    pub fn subscription(&self, id: SubscriptionId) -> crate::Result<&Subscription> {
        match self.subscriptions.get(&id) {
            Some(subscription) => Ok(subscription),
            None => not_found(format!("Subscription {id} does not exist")),
        }
    }

    pub fn add_site_constraint(
        &mut self,
        subscription: SubscriptionId,
        site: &str,
        valid: bool,
    ) -> crate::Result<()> {
        let subscription = match self.subscriptions.get_mut(&subscription) {
            Some(subscription) => subscription,
            None => return not_found(format!("Subscription {subscription} does not exist")),
        };
        subscription
            .constraints
            .retain(|constraint| constraint.site != site);
        subscription.constraints.push(crate::model::SiteConstraint {
            site: site.to_string(),
            valid,
        });
        Ok(())
    }

    pub fn clear_site_constraints(&mut self, subscription: SubscriptionId) -> crate::Result<()> {
        match self.subscriptions.get_mut(&subscription) {
            Some(subscription) => {
                subscription.constraints.clear();
                Ok(())
            }
            None => not_found(format!("Subscription {subscription} does not exist")),
        }
    }

    // Jobs

    /// Create a job for a subscription and mark its input files as acquired
    /// by that subscription.
    pub fn create_job(
        &mut self,
        subscription: SubscriptionId,
        input_files: Vec<FileId>,
    ) -> crate::Result<JobId> {
        if !self.subscriptions.contains_key(&subscription) {
            return not_found(format!("Subscription {subscription} does not exist"));
        }
        for file in &input_files {
            if !self.files.contains_key(file) {
                return not_found(format!("File {file} does not exist"));
            }
        }
        let id = JobId::new(self.job_ids.increment());
        for &file in &input_files {
            self.acquisitions
                .insert(AcquisitionKey::new(file, subscription), AcquisitionState::Acquired);
        }
        self.jobs.insert(
            id,
            Job {
                id,
                subscription,
                state: JobState::New,
                location: None,
                input_files,
            },
        );
        Ok(id)
    }

    pub fn job(&self, id: JobId) -> crate::Result<&Job> {
        match self.jobs.get(&id) {
            Some(job) => Ok(job),
            None => not_found(format!("Job {id} does not exist")),
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|job| job.state == state)
            .map(|job| job.id)
            .collect()
    }

    pub fn set_job_location(&mut self, job: JobId, site: &str) -> crate::Result<()> {
        if !self.sites.contains_key(site) {
            return not_found(format!("Site {site} is not registered"));
        }
        match self.jobs.get_mut(&job) {
            Some(job) => {
                job.location = Some(site.to_string());
                Ok(())
            }
            None => not_found(format!("Job {job} does not exist")),
        }
    }

    pub fn change_job_state(&mut self, job: JobId, state: JobState) -> crate::Result<()> {
        match self.jobs.get_mut(&job) {
            Some(job) => {
                job.state = state;
                Ok(())
            }
            None => not_found(format!("Job {job} does not exist")),
        }
    }

    /// Mirror a job's external batch-system status.
    pub fn insert_run_job(&mut self, job: JobId, status: BatchStatus) -> crate::Result<()> {
        if !self.jobs.contains_key(&job) {
            return not_found(format!("Job {job} does not exist"));
        }
        self.run_jobs.insert(job, status);
        Ok(())
    }

    pub fn batch_status(&self, job: JobId) -> Option<BatchStatus> {
        self.run_jobs.get(&job).copied()
    }

    // Acquisition state

    pub fn acquisition(&self, file: FileId, subscription: SubscriptionId) -> AcquisitionState {
        self.acquisitions
            .get(&AcquisitionKey::new(file, subscription))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_acquisition(
        &mut self,
        file: FileId,
        subscription: SubscriptionId,
        state: AcquisitionState,
    ) -> crate::Result<()> {
        if !self.files.contains_key(&file) {
            return not_found(format!("File {file} does not exist"));
        }
        if !self.subscriptions.contains_key(&subscription) {
            return not_found(format!("Subscription {subscription} does not exist"));
        }
        if state == AcquisitionState::Available {
            return validation(
                "Acquisition state cannot be reset to Available explicitly".to_string(),
            );
        }
        self.acquisitions
            .insert(AcquisitionKey::new(file, subscription), state);
        Ok(())
    }
}
