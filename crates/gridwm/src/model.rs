use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::common::ids::{FileId, FilesetId, SubscriptionId, WorkflowId};
use crate::common::Set;
use crate::{JobId, Priority};

pub type SiteName = String;
pub type TaskType = String;

/// Lifecycle state of a site. `Down` and `Draining` sites are excluded from
/// admission; the distinction is kept for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteState {
    Normal,
    Down,
    Draining,
}

impl SiteState {
    pub fn admits_work(&self) -> bool {
        matches!(self, SiteState::Normal)
    }
}

/// Durable record of a remote compute/storage endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub name: SiteName,
    /// Cap on jobs waiting for execution at this site.
    pub pending_slots: u32,
    /// Cap on concurrently executing jobs at this site.
    pub running_slots: u32,
    /// Storage endpoints, first entry is the primary one.
    pub storage_endpoints: SmallVec<[String; 2]>,
    pub compute_endpoint: String,
    /// Canonical network name (e.g. "T1_US_FNAL"), if known.
    pub cms_name: Option<String>,
    /// Identifier of the batch-system submission plugin.
    pub plugin: Option<String>,
    pub state: SiteState,
}

/// Per-site cap on concurrent jobs of one task type.
///
/// The cap is independent of the site's total slot capacities; both
/// constraints are checked jointly at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub task_type: TaskType,
    pub max_slots: u32,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    New,
    Created,
    Executing,
    /// Finished execution, waiting for the accountant to ingest its report.
    Complete,
    Success,
    Failed,
    Cleanout,
}

impl JobState {
    /// States that still occupy (or will occupy) a slot for admission
    /// purposes. `Complete` jobs have left their slot, they only wait for
    /// accounting.
    pub fn counts_for_admission(&self) -> bool {
        matches!(self, JobState::New | JobState::Created | JobState::Executing)
    }
}

/// Two-valued classification of a job's external batch-system status,
/// supplied by the batch-system adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub subscription: SubscriptionId,
    pub state: JobState,
    /// Assigned site, set at most once per lifecycle unless resubmitted.
    pub location: Option<SiteName>,
    /// Input files the job was created for; their acquisition state is
    /// advanced when the job is accounted.
    pub input_files: Vec<FileId>,
}

/// One site allow/deny entry of a subscription.
/// `valid == true` is a whitelist entry, `valid == false` a blacklist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConstraint {
    pub site: SiteName,
    pub valid: bool,
}

/// Effective site restriction of a subscription. Any whitelist entry switches
/// the subscription into whitelist mode and blacklist entries are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintMode {
    Whitelist(Set<SiteName>),
    Blacklist(Set<SiteName>),
    Unrestricted,
}

impl ConstraintMode {
    pub fn from_constraints(constraints: &[SiteConstraint]) -> ConstraintMode {
        let whitelist: Set<SiteName> = constraints
            .iter()
            .filter(|c| c.valid)
            .map(|c| c.site.clone())
            .collect();
        if !whitelist.is_empty() {
            return ConstraintMode::Whitelist(whitelist);
        }
        let blacklist: Set<SiteName> = constraints
            .iter()
            .filter(|c| !c.valid)
            .map(|c| c.site.clone())
            .collect();
        if !blacklist.is_empty() {
            return ConstraintMode::Blacklist(blacklist);
        }
        ConstraintMode::Unrestricted
    }

    /// Is a single site eligible under this restriction?
    pub fn allows(&self, site: &str) -> bool {
        match self {
            ConstraintMode::Whitelist(sites) => sites.contains(site),
            ConstraintMode::Blacklist(sites) => !sites.contains(site),
            ConstraintMode::Unrestricted => true,
        }
    }
}

/// Binds a fileset and a workflow to a processing task type and owns the
/// site eligibility constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub fileset: FilesetId,
    pub workflow: WorkflowId,
    pub task_type: TaskType,
    pub constraints: Vec<SiteConstraint>,
}

impl Subscription {
    pub fn constraint_mode(&self) -> ConstraintMode {
        ConstraintMode::from_constraints(&self.constraints)
    }
}

/// Named collection of files processed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fileset {
    pub id: FilesetId,
    pub name: String,
    pub files: Set<FileId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Logical file name, globally unique.
    pub lfn: String,
    pub size_bytes: u64,
    /// Sites where the file is known to reside.
    pub locations: Set<SiteName>,
}

/// Per (file, subscription) lifecycle tag. A file with no stored tag for a
/// subscription is `Available`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    #[default]
    Available,
    Acquired,
    Complete,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::{ConstraintMode, SiteConstraint};

    fn constraint(site: &str, valid: bool) -> SiteConstraint {
        SiteConstraint {
            site: site.to_string(),
            valid,
        }
    }

    #[test]
    fn test_no_constraints_is_unrestricted() {
        assert_eq!(
            ConstraintMode::from_constraints(&[]),
            ConstraintMode::Unrestricted
        );
    }

    #[test]
    fn test_whitelist_entry_wins_over_blacklist_entries() {
        let mode = ConstraintMode::from_constraints(&[
            constraint("siteA", false),
            constraint("siteB", true),
            constraint("siteC", false),
        ]);
        assert!(matches!(mode, ConstraintMode::Whitelist(_)));
        assert!(mode.allows("siteB"));
        assert!(!mode.allows("siteA"));
        // Not whitelisted, even though it has no blacklist entry either.
        assert!(!mode.allows("siteD"));
    }

    #[test]
    fn test_blacklist_mode() {
        let mode = ConstraintMode::from_constraints(&[constraint("siteA", false)]);
        assert!(matches!(mode, ConstraintMode::Blacklist(_)));
        assert!(!mode.allows("siteA"));
        assert!(mode.allows("siteB"));
    }
}
