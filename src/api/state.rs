use std::sync::Arc;

use crate::config::StagePolicy;
use crate::queue::Broker;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub scheduler: Arc<Scheduler>,
    /// Attempts and timeout given to manually triggered fetch jobs
    pub fetch_policy: StagePolicy,
}

impl AppState {
    pub fn new(broker: Broker, fetch_policy: StagePolicy) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new(broker.clone())),
            broker,
            fetch_policy,
        }
    }
}
