/// Collective reductions seen by the operator set.
///
/// The only synchronization point the engine exposes is Chi2's global sum.
/// Partial sums travel as `FixedSum`, a 64.64 fixed-point integer: integer
/// addition is associative, so the reduced value is bit-identical however
/// the terms are split across ranks or ordered within one.

use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};

// ── Fixed-point accumulator ──────────────────────────────────────────

/// 2^64: one unit of the integer part.
const ONE: f64 = 18_446_744_073_709_551_616.0;

/// Largest magnitude a single term may have (2^62), leaving headroom for sums.
const MAX_TERM: f64 = 4_611_686_018_427_387_904.0;

/// Sum of f64 terms held in 64.64 fixed point (resolution 2⁻⁶⁴).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedSum(i128);

impl FixedSum {
    pub const ZERO: Self = FixedSum(0);

    /// Round one term to the fixed-point grid.
    pub fn from_f64(x: f64) -> Result<Self> {
        if !x.is_finite() || x.abs() >= MAX_TERM {
            return Err(EngineError::Reduction(format!("term {x} does not fit the fixed-point accumulator")));
        }
        Ok(FixedSum((x * ONE).round() as i128))
    }

    /// Exact sum of two partial sums.
    pub fn checked_add(self, other: FixedSum) -> Result<Self> {
        self.0
            .checked_add(other.0)
            .map(FixedSum)
            .ok_or_else(|| EngineError::Reduction("fixed-point sum overflowed".into()))
    }

    /// Round every term, then add exactly.
    pub fn sum<I: IntoIterator<Item = f64>>(terms: I) -> Result<Self> {
        terms.into_iter().try_fold(FixedSum::ZERO, |acc, x| acc.checked_add(FixedSum::from_f64(x)?))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / ONE
    }
}

// ── Communicator trait ───────────────────────────────────────────────

/// Abstract allreduce backend. SingleProcess for in-process runs,
/// MockCommunicator for tests.
pub trait Communicator: Send + Sync {
    /// Sum `local` across all ranks; every rank receives the same total.
    fn allreduce_sum(&self, local: FixedSum) -> Result<FixedSum>;
    /// Total number of ranks in the group.
    fn world_size(&self) -> usize;
    /// This rank's index (0-based).
    fn rank(&self) -> usize;
}

// ── SingleProcess ────────────────────────────────────────────────────

/// One rank holding the whole field. The reduction is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn allreduce_sum(&self, local: FixedSum) -> Result<FixedSum> {
        Ok(local)
    }

    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

// ── MockCommunicator ─────────────────────────────────────────────────

/// Simulates a multi-rank group for tests.
///
/// All ranks share one call log. allreduce_sum records the call and
/// simulates identical ranks: the total is `local * world_size`.
pub struct MockCommunicator {
    rank_id: usize,
    world: usize,
    call_log: Arc<Mutex<Vec<AllreduceCall>>>,
}

/// Record of a single allreduce invocation (for test assertions).
#[derive(Clone, Debug, PartialEq)]
pub struct AllreduceCall {
    pub rank: usize,
    pub local: FixedSum,
}

impl MockCommunicator {
    /// Create `world_size` communicators sharing one call log.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let log = Arc::new(Mutex::new(Vec::new()));
        (0..world_size)
            .map(|r| MockCommunicator { rank_id: r, world: world_size, call_log: log.clone() })
            .collect()
    }

    /// Snapshot of the call log. A poisoned lock yields whatever was recorded.
    pub fn call_log(&self) -> Vec<AllreduceCall> {
        match self.call_log.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Communicator for MockCommunicator {
    fn allreduce_sum(&self, local: FixedSum) -> Result<FixedSum> {
        let mut log = match self.call_log.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        log.push(AllreduceCall { rank: self.rank_id, local });
        (0..self.world).try_fold(FixedSum::ZERO, |acc, _| acc.checked_add(local))
    }

    fn world_size(&self) -> usize {
        self.world
    }

    fn rank(&self) -> usize {
        self.rank_id
    }
}
