use async_trait::async_trait;
use std::time::Duration;

use super::{MpcProblem, PlanError};
use crate::domain::Schedule;

/// Search limits for one solve
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    /// Wall-clock budget; the best incumbent is returned when it runs out
    pub deadline: Duration,
    /// Node budget (bound evaluations plus leaf LPs), keeps runs reproducible
    pub max_nodes: u64,
    /// Consecutive steps sharing one pump combination
    pub block_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(60),
            max_nodes: 20_000,
            block_steps: 4,
        }
    }
}

#[async_trait]
pub trait ScheduleOptimizer: Send + Sync {
    async fn optimize(&self, problem: MpcProblem) -> Result<Schedule, PlanError>;
}
