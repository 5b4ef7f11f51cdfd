//! Training loop, optimizer schedules and run logs

mod logs;
mod scheduler;
mod session;
mod trainer;

pub use logs::{show_logs, untensor, update_logs, StepLogs, TrainingLogs};
pub use scheduler::{build_scheduler, ramp_scheduling_function, LrSchedule, RampLr, SchedulerCombiner, StepLr};
pub use session::{SegmentCostModel, TrainingSession};
pub use trainer::{set_seed, Trainer};
