use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::hash::sha256_hex;

pub const DEFAULT_DIFFICULTY: usize = 4;

/// Candidates tried between cancellation and deadline checks.
const CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Proof-of-work search cancelled after {0} candidates")]
    Cancelled(u64),
    #[error("Proof-of-work search exceeded its deadline after {0} candidates")]
    DeadlineExceeded(u64),
    #[error("Proof-of-work search space exhausted")]
    Exhausted,
}

/// Shared flag used to abort a running search from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Limits applied to a single proof search.
#[derive(Debug, Clone, Default)]
pub struct SearchBudget {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl SearchBudget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn check(&self, tried: u64) -> Result<(), PowError> {
        if self.cancel.as_ref().map_or(false, CancelToken::is_cancelled) {
            return Err(PowError::Cancelled(tried));
        }
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            return Err(PowError::DeadlineExceeded(tried));
        }
        Ok(())
    }
}

/// Proof-of-work over `sha256(str(n² - p²))` requiring `difficulty` leading
/// hex zeros.
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    difficulty: usize,
    target: String,
}

impl ProofOfWork {
    pub fn new(difficulty: usize) -> Self {
        ProofOfWork {
            difficulty,
            target: "0".repeat(difficulty),
        }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Digest of the puzzle for a candidate, `None` when `n² - p²` overflows.
    pub fn puzzle_digest(previous_proof: u64, candidate: u64) -> Option<String> {
        let n = i128::from(candidate);
        let p = i128::from(previous_proof);
        let value = n.checked_mul(n)?.checked_sub(p.checked_mul(p)?)?;
        Some(sha256_hex(value.to_string()))
    }

    pub fn is_valid_proof(&self, previous_proof: u64, candidate: u64) -> bool {
        Self::puzzle_digest(previous_proof, candidate)
            .map_or(false, |digest| digest.starts_with(&self.target))
    }

    /// Find the smallest `n >= 1` satisfying the predicate.
    ///
    /// The search is checked against `budget` every few candidates, so a
    /// cancelled or expired search returns promptly with an error.
    pub fn solve(&self, previous_proof: u64, budget: &SearchBudget) -> Result<u64, PowError> {
        budget.check(0)?;
        let mut candidate: u64 = 1;
        loop {
            let digest =
                Self::puzzle_digest(previous_proof, candidate).ok_or(PowError::Exhausted)?;
            if digest.starts_with(&self.target) {
                return Ok(candidate);
            }
            if candidate % CHECK_INTERVAL == 0 {
                budget.check(candidate)?;
            }
            candidate = candidate.checked_add(1).ok_or(PowError::Exhausted)?;
        }
    }
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new(DEFAULT_DIFFICULTY)
    }
}

impl fmt::Display for ProofOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Difficulty (leading zeros in hash) = {}", self.difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_returns_smallest_valid_candidate() {
        let pow = ProofOfWork::new(2);
        for previous in [1u64, 7, 533] {
            let proof = pow.solve(previous, &SearchBudget::unbounded()).unwrap();
            assert!(proof >= 1);
            assert!(pow.is_valid_proof(previous, proof));
            assert!((1..proof).all(|n| !pow.is_valid_proof(previous, n)));
        }
    }

    #[test]
    fn test_solve_is_deterministic() {
        let pow = ProofOfWork::new(3);
        let budget = SearchBudget::unbounded();
        assert_eq!(pow.solve(42, &budget), pow.solve(42, &budget));
    }

    #[test]
    fn test_puzzle_digest_uses_signed_difference() {
        // 1² - 2² = -3
        assert_eq!(ProofOfWork::puzzle_digest(2, 1), Some(sha256_hex("-3")));
        assert_eq!(ProofOfWork::puzzle_digest(0, u64::MAX), None);
    }

    #[test]
    fn test_cancelled_search_stops() {
        let token = CancelToken::new();
        token.cancel();
        let budget = SearchBudget::unbounded().with_cancel_token(token);
        assert_eq!(
            ProofOfWork::new(64).solve(1, &budget),
            Err(PowError::Cancelled(0))
        );
    }

    #[test]
    fn test_deadline_bounds_search() {
        // 64 leading zeros is never satisfied in practice
        let budget = SearchBudget::unbounded().with_timeout(Duration::from_millis(20));
        let result = ProofOfWork::new(64).solve(1, &budget);
        assert!(matches!(result, Err(PowError::DeadlineExceeded(_))));
    }

    #[test]
    fn test_default_difficulty() {
        let pow = ProofOfWork::default();
        assert_eq!(pow.difficulty(), 4);
        assert_eq!(pow.to_string(), "Difficulty (leading zeros in hash) = 4");
    }
}
