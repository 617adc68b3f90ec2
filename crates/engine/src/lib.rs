//! Feed synchronization engine: scheduling, cadence estimation and ingestion.

pub mod cadence;
pub mod db;
pub mod error;
pub mod gaps;
pub mod model;
pub mod planner;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod transform;
pub mod worker;

pub use cadence::{run_cadence_loop, CadenceEstimator, CadenceReport};
pub use db::init_pg_pool;
pub use error::{StoreError, SyncError, UpstreamDataError, WarehouseError};
pub use model::{EstimatorState, Feed, IngestResult, Job, NewFeed, NewJob, SyncParams};
pub use planner::PlanKind;
pub use runner::{spawn_signal_handler, RunnerConfig, WorkerRunner};
pub use scheduler::{parse_cron, run_scheduler, RetryReport, SyncScheduler, TickReport};
pub use worker::{IngestionWorker, JobOutcome};
