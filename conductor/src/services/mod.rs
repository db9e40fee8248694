pub mod backup_orchestrator;
pub mod provisioning;
pub mod schedule_dispatcher;
pub mod sweep_scheduler;
pub mod tasks;
