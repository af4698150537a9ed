pub mod admission;
pub mod dedup;
pub mod dispatcher;
pub mod orchestrator;
pub mod retry;
pub mod storage;
pub mod task;
pub mod types;
