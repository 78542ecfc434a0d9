use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::arithmetic::AggregationMode;
use crate::comparison::{ComparisonOp, Operand, SecureComparator};
use crate::error::{EngineError, EngineResult};
use crate::policy::Direction;
use crate::vault::CiphertextHandle;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkPosition {
    /// Own value strictly above the encrypted peer mean.
    pub above_mean: bool,
    /// Share of peers outperformed, in percent.
    pub percentile: f64,
    pub peers: usize,
    pub peer_mean: CiphertextHandle,
}

/// Positions an encrypted value among encrypted peers using only
/// comparison bits.
pub struct Benchmark {
    comparator: Arc<SecureComparator>,
    direction: Direction,
}

impl Benchmark {
    /// Scores by default: lower is worse.
    pub fn new(comparator: Arc<SecureComparator>) -> Self {
        Self {
            comparator,
            direction: Direction::LowerIsWorse,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn position(&self, own: CiphertextHandle, peers: &[CiphertextHandle]) -> EngineResult<BenchmarkPosition> {
        if peers.is_empty() {
            return Err(EngineError::InvalidParameters("benchmark needs at least one peer".into()));
        }
        let engine = self.comparator.engine();
        let (peer_mean, _) = engine.aggregate(peers, &AggregationMode::Mean)?;
        let above_mean = self
            .comparator
            .compare(own, Operand::Cipher(peer_mean), ComparisonOp::Greater)?
            .result;
        let better = match self.direction {
            Direction::LowerIsWorse => ComparisonOp::Greater,
            Direction::HigherIsWorse => ComparisonOp::Less,
        };
        let mut outperformed = 0usize;
        for peer in peers {
            if self.comparator.compare(own, Operand::Cipher(*peer), better)?.result {
                outperformed += 1;
            }
        }
        let percentile = 100.0 * outperformed as f64 / peers.len() as f64;
        info!(peers = peers.len(), above_mean, percentile, "benchmark position");
        Ok(BenchmarkPosition {
            above_mean,
            percentile,
            peers: peers.len(),
            peer_mean,
        })
    }
}
