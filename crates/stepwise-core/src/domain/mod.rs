/// Flow instance domain models
pub mod flow_instance;

/// Flow definition domain models
pub mod flow_definition;

/// Step and flow status transitions
pub mod state_machine;

/// Condition expressions and their evaluation
pub mod condition;

/// Resume requests and outcomes
pub mod resume;

/// Domain events
pub mod events;

/// Repository interfaces
pub mod repository;
