pub mod api;
pub mod config;
pub mod instagram;
pub mod notify;
pub mod observability;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod stages;
pub mod storage;
pub mod worker;
