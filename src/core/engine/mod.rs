pub mod error;
pub mod executor;
pub mod governor;
pub mod retry;
pub mod runner;
pub mod supervisor;

pub use error::ExecutionError;
pub use executor::Executor;
pub use governor::Governor;
pub use retry::RetryPolicy;
pub use runner::ScheduleRunner;
pub use supervisor::CronSupervisor;
