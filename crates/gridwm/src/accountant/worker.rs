use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::accountant::report::ReportSource;
use crate::accountant::AccountingResult;
use crate::model::{AcquisitionState, JobState};
use crate::store::StoreRef;
use crate::JobId;

/// Accounts a single completed job. Implementations must be idempotent: a
/// job may be picked up again if a previous batch was interrupted before its
/// state advanced.
pub trait JobAccountant: Send + Sync {
    fn account_job(
        &self,
        job: JobId,
    ) -> Pin<Box<dyn Future<Output = AccountingResult<()>> + Send + '_>>;
}

/// Default accountant: ingests the framework job report, registers the
/// job's output files and advances the input files' acquisition state in the
/// bookkeeping store. All writes for one job happen in one transaction.
pub struct StoreAccountant {
    store: StoreRef,
    reports: Arc<dyn ReportSource>,
}

impl StoreAccountant {
    pub fn new(store: StoreRef, reports: Arc<dyn ReportSource>) -> Self {
        Self { store, reports }
    }

    fn account_one(&self, job_id: JobId) -> AccountingResult<()> {
        let report = self.reports.report_for(job_id)?;

        let mut txn = self.store.begin_write()?;
        let job = txn.job(job_id)?.clone();
        if job.state != JobState::Complete {
            // Accounted by an earlier cycle, nothing left to do.
            log::debug!("Job {job_id} is no longer complete, skipping");
            return Ok(());
        }

        for output in &report.output_files {
            let file = txn.register_file(
                &output.lfn,
                output.size_bytes,
                output.locations.iter().cloned(),
            );
            log::debug!("Registered output {} ({file}) of job {job_id}", output.lfn);
        }

        let acquisition = if report.success {
            AcquisitionState::Complete
        } else {
            AcquisitionState::Failed
        };
        for &file in &job.input_files {
            txn.set_acquisition(file, job.subscription, acquisition)?;
        }

        let job_state = if report.success {
            JobState::Success
        } else {
            JobState::Failed
        };
        txn.change_job_state(job_id, job_state)?;
        log::debug!("Accounted job {job_id} as {job_state:?}");
        Ok(())
    }
}

impl JobAccountant for StoreAccountant {
    fn account_job(
        &self,
        job: JobId,
    ) -> Pin<Box<dyn Future<Output = AccountingResult<()>> + Send + '_>> {
        Box::pin(async move { self.account_one(job) })
    }
}
