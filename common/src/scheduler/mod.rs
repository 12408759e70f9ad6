// Scheduler module for cron-driven task triggering

pub mod engine;

pub use engine::SchedulerEngine;
