/// Topic-based publish/subscribe
pub mod event_bus;

/// Step handler capabilities and their registry
pub mod handler;

/// Step attempt execution under timeout and cancellation
pub mod step_executor;

/// Resume request arbitration
pub mod resume_coordinator;

/// Clocks and deadline tracking
pub mod timeout_scheduler;

/// Work queue and per-instance locks
pub mod dispatch;

/// Snapshot persistence followed by event publication
pub mod checkpoint;

/// Flow orchestration service
pub mod orchestrator;
