//! Orchestration layer for the task lifecycle.
//!
//! The planner turns a validated request into concrete tasks, the state
//! machine walks each task through its phases against an execution
//! environment, and the scheduler runs many tasks concurrently in
//! prerequisite order.

pub mod environment;
pub mod machine;
pub mod planner;
pub mod scheduler;

pub use environment::{ExecutionEnvironment, JobOutcome, JobState, LocalShell};
pub use machine::{ExecutionStateMachine, Step, WaitReason};
pub use planner::FanOutPlanner;
pub use scheduler::{Scheduler, SchedulerEvent, SchedulerReport};
