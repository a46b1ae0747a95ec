pub mod classifier;
pub mod collaborators;
pub mod context;
pub mod index;
pub mod item_sync;
pub mod orchestrator;
pub mod queue;
