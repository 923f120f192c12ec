use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::accountant::worker::JobAccountant;
use crate::accountant::AccountantConfig;
use crate::common::rpc::{ResponseToken, RpcReceiver};
use crate::model::JobState;
use crate::store::StoreRef;
use crate::JobId;

/// Outcome of one polling cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub accounted: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub enum AccountantMessage {
    /// Run a cycle outside the regular schedule and report its summary.
    PollNow(ResponseToken<crate::Result<CycleSummary>>),
    /// Cooperative shutdown; the current batch finishes draining first.
    Quit,
}

/// Main accountant event loop: runs a polling cycle on a fixed interval and
/// reacts to external messages. Resolves after a `Quit` message or once all
/// service handles are dropped.
pub async fn accountant_process(
    store: StoreRef,
    accountant: Arc<dyn JobAccountant>,
    config: AccountantConfig,
    mut receiver: RpcReceiver<AccountantMessage>,
) {
    let mut poll_interval = tokio::time::interval(config.poll_interval);
    loop {
        tokio::select! {
            _ = poll_interval.tick() => {
                match run_cycle(&store, &accountant, &config).await {
                    Ok(summary) => {
                        if summary.accounted + summary.failed > 0 {
                            log::info!(
                                "Accounting cycle finished: {} accounted, {} failed",
                                summary.accounted,
                                summary.failed
                            );
                        }
                    }
                    // The batch could not even be fetched; wait for the next
                    // interval instead of giving up.
                    Err(error) => log::error!("Could not fetch completed jobs: {error:?}"),
                }
            }
            message = receiver.recv() => {
                match message {
                    None | Some(AccountantMessage::Quit) => break,
                    Some(AccountantMessage::PollNow(response)) => {
                        response.respond(run_cycle(&store, &accountant, &config).await);
                    }
                }
            }
        }
    }
    log::debug!("Ending job accountant");
}

/// One polling cycle: fetch all jobs in the `Complete` state and drain them
/// through a fixed pool of accounting workers. Returns only after the whole
/// batch has been processed, succeeded or failed.
pub(crate) async fn run_cycle(
    store: &StoreRef,
    accountant: &Arc<dyn JobAccountant>,
    config: &AccountantConfig,
) -> crate::Result<CycleSummary> {
    let batch = store.begin_read()?.jobs_in_state(JobState::Complete);
    if batch.is_empty() {
        return Ok(CycleSummary::default());
    }
    log::debug!("Accounting a batch of {} completed jobs", batch.len());

    let queue = Arc::new(Mutex::new(VecDeque::from(batch)));
    let accounted = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..config.worker_count.max(1))
        .map(|_| {
            tokio::spawn(accounting_worker(
                queue.clone(),
                accountant.clone(),
                config.job_timeout,
                accounted.clone(),
                failed.clone(),
            ))
        })
        .collect();

    // Drain barrier: the next cycle cannot start before every worker has
    // emptied the shared queue.
    for result in join_all(workers).await {
        if let Err(error) = result {
            log::error!("Accounting worker crashed: {error}");
        }
    }

    Ok(CycleSummary {
        accounted: accounted.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    })
}

async fn accounting_worker(
    queue: Arc<Mutex<VecDeque<JobId>>>,
    accountant: Arc<dyn JobAccountant>,
    job_timeout: Option<Duration>,
    accounted: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
) {
    loop {
        let job = queue.lock().await.pop_front();
        let Some(job) = job else {
            break;
        };
        let result = match job_timeout {
            Some(limit) => match tokio::time::timeout(limit, accountant.account_job(job)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("Accounting timed out after {limit:?}")),
            },
            None => accountant.account_job(job).await,
        };
        match result {
            Ok(()) => {
                accounted.fetch_add(1, Ordering::SeqCst);
            }
            Err(error) => {
                // One bad job never aborts the batch; it stays in `Complete`
                // and will be retried on a later cycle.
                log::error!("Accounting of job {job} failed: {error:?}");
                failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{run_cycle, CycleSummary};
    use crate::accountant::report::InMemoryReports;
    use crate::accountant::worker::{JobAccountant, StoreAccountant};
    use crate::accountant::{AccountantConfig, AccountingResult};
    use crate::model::{AcquisitionState, JobState};
    use crate::store::StoreRef;
    use crate::{FileId, JobId, Map, Set, SubscriptionId, WorkflowId};

    /// Accountant that records concurrency and optionally fails some jobs.
    struct MockAccountant {
        active: AtomicUsize,
        max_active: AtomicUsize,
        processed: AtomicUsize,
        delay: Duration,
        fail_jobs: Set<JobId>,
    }

    impl MockAccountant {
        fn new(delay: Duration, fail_jobs: Set<JobId>) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
                delay,
                fail_jobs,
            })
        }
    }

    impl JobAccountant for MockAccountant {
        fn account_job(
            &self,
            job: JobId,
        ) -> Pin<Box<dyn Future<Output = AccountingResult<()>> + Send + '_>> {
            Box::pin(async move {
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.processed.fetch_add(1, Ordering::SeqCst);
                if self.fail_jobs.contains(&job) {
                    return Err(anyhow::anyhow!("Unparsable report"));
                }
                Ok(())
            })
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(worker_count: usize) -> AccountantConfig {
        AccountantConfig {
            worker_count,
            ..Default::default()
        }
    }

    /// Store with `count` jobs in the `Complete` state, each owning one
    /// input file located at siteA.
    fn store_with_complete_jobs(count: usize) -> (StoreRef, SubscriptionId, Vec<(JobId, FileId)>) {
        let store = StoreRef::new();
        let mut txn = store.begin_write().unwrap();
        let fileset = txn.create_fileset("input-data");
        let subscription = txn
            .create_subscription(fileset, WorkflowId::new(1), "Processing".to_string())
            .unwrap();
        let mut jobs = Vec::new();
        for index in 0..count {
            let file = txn.register_file(
                &format!("/store/data/input-{index}.root"),
                1024,
                ["siteA".to_string()],
            );
            txn.add_file_to_fileset(file, fileset).unwrap();
            let job = txn.create_job(subscription, vec![file]).unwrap();
            txn.change_job_state(job, JobState::Complete).unwrap();
            jobs.push((job, file));
        }
        drop(txn);
        (store, subscription, jobs)
    }

    fn success_report(job: JobId) -> String {
        format!(
            r#"{{"job": {job}, "success": true, "timestamp": "2024-03-01T12:00:00Z",
                "output_files": [{{"lfn": "/store/output/out-{job}.root",
                "dataset": "/PrimaryDS/Era-v1/AOD", "size_bytes": 2048,
                "checksum": "adler32:cafe{job}", "locations": ["siteA"]}}]}}"#
        )
    }

    #[tokio::test]
    async fn test_empty_cycle() {
        let (store, _sub, _jobs) = store_with_complete_jobs(0);
        let accountant: Arc<dyn JobAccountant> =
            MockAccountant::new(Duration::ZERO, Set::default());
        let summary = run_cycle(&store, &accountant, &config(2)).await.unwrap();
        assert_eq!(summary, CycleSummary::default());
    }

    #[tokio::test]
    async fn test_drain_barrier_with_bounded_pool() {
        init_logging();
        let (store, _sub, jobs) = store_with_complete_jobs(8);
        let mock = MockAccountant::new(Duration::from_millis(10), Set::default());
        let accountant: Arc<dyn JobAccountant> = mock.clone();

        let summary = run_cycle(&store, &accountant, &config(2)).await.unwrap();

        // The cycle returns only once all jobs of the batch were processed.
        assert_eq!(summary.accounted, jobs.len());
        assert_eq!(summary.failed, 0);
        assert_eq!(mock.processed.load(Ordering::SeqCst), jobs.len());
        // Never more in flight than the pool size.
        assert!(mock.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_abort_batch() {
        init_logging();
        let (store, _sub, jobs) = store_with_complete_jobs(6);
        let mut fail_jobs = Set::default();
        fail_jobs.insert(jobs[2].0);
        let mock = MockAccountant::new(Duration::ZERO, fail_jobs);
        let accountant: Arc<dyn JobAccountant> = mock.clone();

        let summary = run_cycle(&store, &accountant, &config(3)).await.unwrap();
        assert_eq!(summary.accounted, 5);
        assert_eq!(summary.failed, 1);
        assert_eq!(mock.processed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_job_timeout_counts_as_failure() {
        let (store, _sub, _jobs) = store_with_complete_jobs(2);
        let mock = MockAccountant::new(Duration::from_millis(200), Set::default());
        let accountant: Arc<dyn JobAccountant> = mock.clone();
        let config = AccountantConfig {
            worker_count: 2,
            job_timeout: Some(Duration::from_millis(10)),
            ..Default::default()
        };

        let summary = run_cycle(&store, &accountant, &config).await.unwrap();
        assert_eq!(summary.accounted, 0);
        assert_eq!(summary.failed, 2);
    }

    #[tokio::test]
    async fn test_store_accountant_success() {
        let (store, subscription, jobs) = store_with_complete_jobs(3);
        let mut reports = Map::default();
        for (job, _file) in &jobs {
            reports.insert(*job, success_report(*job));
        }
        let accountant: Arc<dyn JobAccountant> = Arc::new(StoreAccountant::new(
            store.clone(),
            Arc::new(InMemoryReports::new(reports)),
        ));

        let summary = run_cycle(&store, &accountant, &config(2)).await.unwrap();
        assert_eq!(summary.accounted, 3);
        assert_eq!(summary.failed, 0);

        let txn = store.begin_read().unwrap();
        for (job, file) in &jobs {
            assert_eq!(txn.job(*job).unwrap().state, JobState::Success);
            assert_eq!(
                txn.acquisition(*file, subscription),
                AcquisitionState::Complete
            );
        }
        // Output files were registered with their locations.
        let output = txn
            .file_by_lfn(&format!("/store/output/out-{}.root", jobs[0].0))
            .unwrap();
        assert!(output.locations.contains("siteA"));

        // A second cycle finds nothing left to account.
        drop(txn);
        let summary = run_cycle(&store, &accountant, &config(2)).await.unwrap();
        assert_eq!(summary, CycleSummary::default());
    }

    #[tokio::test]
    async fn test_store_accountant_failed_report() {
        let (store, subscription, jobs) = store_with_complete_jobs(1);
        let (job, file) = jobs[0];
        let mut reports = Map::default();
        reports.insert(
            job,
            format!(r#"{{"job": {job}, "success": false, "timestamp": "2024-03-01T12:00:00Z"}}"#),
        );
        let accountant: Arc<dyn JobAccountant> = Arc::new(StoreAccountant::new(
            store.clone(),
            Arc::new(InMemoryReports::new(reports)),
        ));

        let summary = run_cycle(&store, &accountant, &config(1)).await.unwrap();
        assert_eq!(summary.accounted, 1);

        let txn = store.begin_read().unwrap();
        assert_eq!(txn.job(job).unwrap().state, JobState::Failed);
        assert_eq!(txn.acquisition(file, subscription), AcquisitionState::Failed);
    }

    #[tokio::test]
    async fn test_malformed_report_leaves_job_for_retry() {
        let (store, _subscription, jobs) = store_with_complete_jobs(2);
        let (bad_job, _) = jobs[0];
        let (good_job, _) = jobs[1];
        let mut reports = Map::default();
        reports.insert(bad_job, "this is not a report".to_string());
        reports.insert(good_job, success_report(good_job));
        let accountant: Arc<dyn JobAccountant> = Arc::new(StoreAccountant::new(
            store.clone(),
            Arc::new(InMemoryReports::new(reports)),
        ));

        let summary = run_cycle(&store, &accountant, &config(2)).await.unwrap();
        assert_eq!(summary.accounted, 1);
        assert_eq!(summary.failed, 1);

        let txn = store.begin_read().unwrap();
        // The failed job stays in `Complete` and is retried next cycle.
        assert_eq!(txn.job(bad_job).unwrap().state, JobState::Complete);
        assert_eq!(txn.job(good_job).unwrap().state, JobState::Success);
        drop(txn);

        let summary = run_cycle(&store, &accountant, &config(2)).await.unwrap();
        assert_eq!(summary.accounted, 0);
        assert_eq!(summary.failed, 1);
    }
}
