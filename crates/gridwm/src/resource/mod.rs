//! Site registry and threshold query engine.
//!
//! Answers the two admission questions of the scheduling pipeline: is there
//! room to *create* more jobs against a site's budget, and is there room to
//! *submit* a job of a given task type. Creation counts jobs that are not yet
//! running, attributing unassigned jobs to every site eligible under their
//! subscription's constraints. Submission counts only jobs with an assigned
//! location and a batch-system status mirror.

use serde::Serialize;
use smallvec::SmallVec;

use crate::common::error::validation;
use crate::common::Map;
use crate::model::{
    BatchStatus, Site, SiteName, SiteState, TaskType, Threshold,
};
use crate::store::{StoreInner, StoreRef};
use crate::Priority;

/// Static site attributes plus current capacities.
#[derive(Debug, Clone, Serialize)]
pub struct SiteInfo {
    pub site_name: SiteName,
    pub storage_endpoints: SmallVec<[String; 2]>,
    pub compute_endpoint: String,
    pub cms_name: Option<String>,
    pub plugin: Option<String>,
    pub pending_slots: u32,
    pub running_slots: u32,
    pub state: SiteState,
}

/// Per-site creation budget: total pending-slot capacity and the number of
/// jobs currently counted against it.
#[derive(Debug, Clone, Serialize)]
pub struct CreateThresholdSummary {
    pub total_slots: u32,
    pub pending_jobs: u32,
    pub cms_name: Option<String>,
    pub state: SiteState,
}

/// One task-type threshold row of a submit summary.
#[derive(Debug, Clone, Serialize)]
pub struct TaskThreshold {
    pub task_type: TaskType,
    pub max_slots: u32,
    pub priority: Priority,
    pub task_running_jobs: u32,
}

/// Per-site submission picture: slot capacities, live job counts and the
/// task-type thresholds ordered by descending priority.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitThresholdSummary {
    pub cms_name: Option<String>,
    pub state: SiteState,
    pub total_pending_slots: u32,
    pub total_running_slots: u32,
    pub total_pending_jobs: u32,
    pub total_running_jobs: u32,
    pub thresholds: Vec<TaskThreshold>,
}

/// Flat per-task-type view of one site's thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct SiteThreshold {
    pub task_type: TaskType,
    pub pending_slots: u32,
    pub running_slots: u32,
    pub max_slots: u32,
}

/// Threshold specification for bulk provisioning.
#[derive(Debug, Clone)]
pub struct TaskThresholdSpec {
    pub task_type: TaskType,
    pub max_slots: u32,
    pub priority: Option<Priority>,
}

pub struct ResourceControl {
    store: StoreRef,
}

impl ResourceControl {
    pub fn new(store: StoreRef) -> Self {
        Self { store }
    }

    /// Idempotent site upsert: re-inserting an existing site is a silent
    /// no-op and does not overwrite its capacities.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_site(
        &self,
        name: &str,
        pending_slots: i64,
        running_slots: i64,
        storage_endpoints: &[&str],
        compute_endpoint: &str,
        cms_name: Option<&str>,
        plugin: Option<&str>,
    ) -> crate::Result<()> {
        if name.is_empty() {
            return validation("Site name must not be empty".to_string());
        }
        if pending_slots < 0 || running_slots < 0 {
            return validation(format!(
                "Site {name} slot capacities must not be negative \
                 (pending: {pending_slots}, running: {running_slots})"
            ));
        }
        if storage_endpoints.is_empty() {
            return validation(format!("Site {name} needs at least one storage endpoint"));
        }
        let site = Site {
            name: name.to_string(),
            pending_slots: pending_slots as u32,
            running_slots: running_slots as u32,
            storage_endpoints: storage_endpoints.iter().map(|se| se.to_string()).collect(),
            compute_endpoint: compute_endpoint.to_string(),
            cms_name: cms_name.map(str::to_string),
            plugin: plugin.map(str::to_string),
            state: SiteState::Normal,
        };
        let mut txn = self.store.begin_write()?;
        if !txn.insert_site_row(site) {
            log::debug!("Site {name} is already registered, insert is a no-op");
        }
        Ok(())
    }

    /// Upsert the threshold for (site, task type). Updating replaces the
    /// slot cap; the priority is only replaced when given explicitly. A fresh
    /// threshold without an explicit priority gets the next value in the
    /// site's insertion order.
    pub fn insert_threshold(
        &self,
        site: &str,
        task_type: &str,
        max_slots: i64,
        priority: Option<Priority>,
    ) -> crate::Result<()> {
        if task_type.is_empty() {
            return validation("Task type must not be empty".to_string());
        }
        if max_slots < 0 {
            return validation(format!(
                "Threshold for {task_type} at {site} must not be negative ({max_slots})"
            ));
        }
        let mut txn = self.store.begin_write()?;
        let thresholds = txn.thresholds_for_mut(site)?;
        if let Some(existing) = thresholds
            .iter_mut()
            .find(|threshold| threshold.task_type == task_type)
        {
            existing.max_slots = max_slots as u32;
            if let Some(priority) = priority {
                existing.priority = priority;
            }
        } else {
            let priority = priority.unwrap_or(thresholds.len() as Priority + 1);
            thresholds.push(Threshold {
                task_type: task_type.to_string(),
                max_slots: max_slots as u32,
                priority,
            });
        }
        Ok(())
    }

    /// Bulk provisioning: insert a site together with its task thresholds in
    /// one call.
    #[allow(clippy::too_many_arguments)]
    pub fn provision_site(
        &self,
        name: &str,
        pending_slots: i64,
        running_slots: i64,
        storage_endpoints: &[&str],
        compute_endpoint: &str,
        cms_name: Option<&str>,
        plugin: Option<&str>,
        task_list: &[TaskThresholdSpec],
    ) -> crate::Result<()> {
        self.insert_site(
            name,
            pending_slots,
            running_slots,
            storage_endpoints,
            compute_endpoint,
            cms_name,
            plugin,
        )?;
        for spec in task_list {
            self.insert_threshold(name, &spec.task_type, spec.max_slots as i64, spec.priority)?;
        }
        Ok(())
    }

    /// Partial capacity update; `None` parameters are left unchanged.
    pub fn set_job_slots_for_site(
        &self,
        site: &str,
        pending_slots: Option<i64>,
        running_slots: Option<i64>,
    ) -> crate::Result<()> {
        for slots in [pending_slots, running_slots].into_iter().flatten() {
            if slots < 0 {
                return validation(format!(
                    "Site {site} slot capacities must not be negative ({slots})"
                ));
            }
        }
        let mut txn = self.store.begin_write()?;
        let record = txn.site_mut(site)?;
        if let Some(pending) = pending_slots {
            record.pending_slots = pending as u32;
        }
        if let Some(running) = running_slots {
            record.running_slots = running as u32;
        }
        Ok(())
    }

    pub fn list_site_info(&self, site: &str) -> crate::Result<SiteInfo> {
        let txn = self.store.begin_read()?;
        let site = txn.site(site)?;
        Ok(SiteInfo {
            site_name: site.name.clone(),
            storage_endpoints: site.storage_endpoints.clone(),
            compute_endpoint: site.compute_endpoint.clone(),
            cms_name: site.cms_name.clone(),
            plugin: site.plugin.clone(),
            pending_slots: site.pending_slots,
            running_slots: site.running_slots,
            state: site.state,
        })
    }

    pub fn change_site_state(&self, site: &str, state: SiteState) -> crate::Result<()> {
        let mut txn = self.store.begin_write()?;
        let record = txn.site_mut(site)?;
        if record.state != state {
            log::info!("Site {site} changing state {:?} -> {state:?}", record.state);
            record.state = state;
        }
        Ok(())
    }

    /// Per-site creation budget and the jobs currently counted against it.
    pub fn list_thresholds_for_create(
        &self,
    ) -> crate::Result<Map<SiteName, CreateThresholdSummary>> {
        let txn = self.store.begin_read()?;
        let pending = count_create_pending(&txn, None)?;
        let mut summaries = Map::default();
        for site in txn.sites() {
            summaries.insert(
                site.name.clone(),
                CreateThresholdSummary {
                    total_slots: site.pending_slots,
                    pending_jobs: pending.get(&site.name).copied().unwrap_or(0),
                    cms_name: site.cms_name.clone(),
                    state: site.state,
                },
            );
        }
        Ok(summaries)
    }

    /// Per-site submission picture with thresholds ordered by descending
    /// priority (ties keep insertion order).
    pub fn list_thresholds_for_submit(
        &self,
    ) -> crate::Result<Map<SiteName, SubmitThresholdSummary>> {
        let txn = self.store.begin_read()?;
        let site_counts = count_submit_jobs(&txn)?;
        let task_running = count_task_running(&txn)?;
        let mut summaries = Map::default();
        for site in txn.sites() {
            let (total_pending_jobs, total_running_jobs) =
                site_counts.get(&site.name).copied().unwrap_or((0, 0));
            let mut thresholds: Vec<TaskThreshold> = txn
                .thresholds_for(&site.name)
                .iter()
                .map(|threshold| TaskThreshold {
                    task_type: threshold.task_type.clone(),
                    max_slots: threshold.max_slots,
                    priority: threshold.priority,
                    task_running_jobs: task_running
                        .get(&(site.name.clone(), threshold.task_type.clone()))
                        .copied()
                        .unwrap_or(0),
                })
                .collect();
            // Stable sort, so equal priorities stay in insertion order.
            thresholds.sort_by_key(|threshold| std::cmp::Reverse(threshold.priority));
            summaries.insert(
                site.name.clone(),
                SubmitThresholdSummary {
                    cms_name: site.cms_name.clone(),
                    state: site.state,
                    total_pending_slots: site.pending_slots,
                    total_running_slots: site.running_slots,
                    total_pending_jobs,
                    total_running_jobs,
                    thresholds,
                },
            );
        }
        Ok(summaries)
    }

    /// Flat list of per-task-type capacity tuples for one site.
    pub fn threshold_by_site(&self, site: &str) -> crate::Result<Vec<SiteThreshold>> {
        let txn = self.store.begin_read()?;
        let record = txn.site(site)?;
        Ok(txn
            .thresholds_for(site)
            .iter()
            .map(|threshold| SiteThreshold {
                task_type: threshold.task_type.clone(),
                pending_slots: record.pending_slots,
                running_slots: record.running_slots,
                max_slots: threshold.max_slots,
            })
            .collect())
    }

    /// May one more job of `task_type` be created against `site`'s budget?
    /// Both the site-wide pending budget and the task-type cap must hold.
    pub fn can_create_at(&self, site: &str, task_type: &str) -> crate::Result<bool> {
        let txn = self.store.begin_read()?;
        let record = txn.site(site)?;
        if !record.state.admits_work() {
            return Ok(false);
        }
        let Some(threshold) = find_threshold(&txn, site, task_type) else {
            // No threshold for the task type means the site does not take it.
            return Ok(false);
        };
        let total = count_create_pending(&txn, None)?
            .get(site)
            .copied()
            .unwrap_or(0);
        if total >= record.pending_slots {
            return Ok(false);
        }
        let typed = count_create_pending(&txn, Some(task_type))?
            .get(site)
            .copied()
            .unwrap_or(0);
        Ok(typed < threshold.max_slots)
    }

    /// May one more job of `task_type` be submitted to `site`? The aggregate
    /// pending/running counts must stay under the site capacities and the
    /// task-type running count under its threshold cap.
    pub fn can_submit_at(&self, site: &str, task_type: &str) -> crate::Result<bool> {
        let txn = self.store.begin_read()?;
        let record = txn.site(site)?;
        if !record.state.admits_work() {
            return Ok(false);
        }
        let Some(threshold) = find_threshold(&txn, site, task_type) else {
            return Ok(false);
        };
        let (pending, running) = count_submit_jobs(&txn)?
            .get(site)
            .copied()
            .unwrap_or((0, 0));
        if pending >= record.pending_slots || running >= record.running_slots {
            return Ok(false);
        }
        let task_running = count_task_running(&txn)?
            .get(&(site.to_string(), task_type.to_string()))
            .copied()
            .unwrap_or(0);
        Ok(task_running < threshold.max_slots)
    }
}

fn find_threshold<'a>(txn: &'a StoreInner, site: &str, task_type: &str) -> Option<&'a Threshold> {
    txn.thresholds_for(site)
        .iter()
        .find(|threshold| threshold.task_type == task_type)
}

/// Count jobs pending creation-admission per site, optionally restricted to
/// one task type. A job with an assigned location counts there; an unassigned
/// job counts at every site eligible under its subscription's constraints.
fn count_create_pending(
    txn: &StoreInner,
    task_filter: Option<&str>,
) -> crate::Result<Map<SiteName, u32>> {
    let mut counts: Map<SiteName, u32> = Map::default();
    for job in txn.jobs() {
        if !job.state.counts_for_admission() {
            continue;
        }
        // A running job no longer consumes creation budget.
        if txn.batch_status(job.id) == Some(BatchStatus::Running) {
            continue;
        }
        let subscription = txn.subscription(job.subscription)?;
        if let Some(task_type) = task_filter {
            if subscription.task_type != task_type {
                continue;
            }
        }
        match &job.location {
            Some(site) => *counts.entry(site.clone()).or_default() += 1,
            None => {
                let mode = subscription.constraint_mode();
                for site in txn.sites() {
                    if mode.allows(&site.name) {
                        *counts.entry(site.name.clone()).or_default() += 1;
                    }
                }
            }
        }
    }
    Ok(counts)
}

/// Count (pending, running) jobs per site for submission admission. Only jobs
/// with an assigned location and a batch-status mirror count; the mirror
/// decides the bucket.
fn count_submit_jobs(txn: &StoreInner) -> crate::Result<Map<SiteName, (u32, u32)>> {
    let mut counts: Map<SiteName, (u32, u32)> = Map::default();
    for job in txn.jobs() {
        if !job.state.counts_for_admission() {
            continue;
        }
        let Some(site) = &job.location else {
            continue;
        };
        let Some(status) = txn.batch_status(job.id) else {
            continue;
        };
        let entry = counts.entry(site.clone()).or_default();
        match status {
            BatchStatus::Pending => entry.0 += 1,
            BatchStatus::Running => entry.1 += 1,
        }
    }
    Ok(counts)
}

/// Count running jobs per (site, task type).
fn count_task_running(txn: &StoreInner) -> crate::Result<Map<(SiteName, TaskType), u32>> {
    let mut counts: Map<(SiteName, TaskType), u32> = Map::default();
    for job in txn.jobs() {
        if !job.state.counts_for_admission() {
            continue;
        }
        let Some(site) = &job.location else {
            continue;
        };
        if txn.batch_status(job.id) != Some(BatchStatus::Running) {
            continue;
        }
        let subscription = txn.subscription(job.subscription)?;
        *counts
            .entry((site.clone(), subscription.task_type.clone()))
            .or_default() += 1;
    }
    Ok(counts)
}
