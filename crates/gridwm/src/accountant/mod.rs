//! Job accountant: a background process that periodically collects jobs
//! which finished execution and drives their accounting through a bounded
//! pool of workers. One batch is fully drained before the next poll begins,
//! so a slow accounting step delays but never overlaps the following cycle.

mod config;
mod process;
mod report;
mod service;
mod worker;

/// Per-job accounting failures are isolated and logged, never typed out.
pub type AccountingResult<T> = anyhow::Result<T>;

pub use config::AccountantConfig;
pub use process::{accountant_process, AccountantMessage, CycleSummary};
pub use report::{FrameworkJobReport, InMemoryReports, OutputFile, ReportSource, RunLumi};
pub use service::{create_accountant_service, AccountantService};
pub use worker::{JobAccountant, StoreAccountant};
