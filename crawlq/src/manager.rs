pub mod periodic;
pub mod stats;
pub mod worker;
pub mod workers_manager;

pub use periodic::{BackgroundTasks, PeriodicTask};
pub use stats::WorkerStats;
pub use worker::{
    worker_wrapper, Worker, WorkerCommand, WorkerOptions, WorkerOptionsBuilder,
    WorkerOptionsBuilderError,
};
pub use workers_manager::{
    WorkersManager, WorkersManagerOptions, WorkersManagerOptionsBuilder,
    WorkersManagerOptionsBuilderError,
};
