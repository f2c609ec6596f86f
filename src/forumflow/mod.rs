// src/forumflow/mod.rs

pub mod agent;
pub mod blackboard;
pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod forum;
pub mod orchestrator;
pub mod query_cache;
pub mod reviewer;
pub mod synthesis;
pub mod task;
pub mod task_manager;

// Let's export the entry point so it can be reached as forumflow::TaskManager.
pub use task_manager::TaskManager;
