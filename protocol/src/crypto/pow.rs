//! # Proof-of-Work Solver
//!
//! The admission gate's puzzle: find a nonce such that
//! `SHA-256(prefix ++ nonce)` starts with at least `difficulty` zero bits.
//!
//! The [`PowSolver`] trait is deliberately narrow (bytes in, bytes out) so
//! the search routine can be swapped for a SIMD, GPU or out-of-process
//! implementation without the admission protocol noticing. The bundled
//! [`Sha256Solver`] walks a decimal counter from zero and renders it as ASCII,
//! which keeps it wire-compatible with every other dedi node: the nonce for
//! prefix `dfe041b4f60cb54d082e542b109e392a` at difficulty 22 is the byte
//! string `9642966`.
//!
//! Expected work doubles with each extra bit. Verification is one hash.
//!
//! Searches started through [`solve_detached`] stop when the awaiting
//! future is dropped, so a caller's timeout also ends the work on the
//! blocking pool.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::config::MAX_DIFFICULTY;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PowError {
    #[error("difficulty {0} exceeds the {MAX_DIFFICULTY}-bit digest")]
    DifficultyTooHigh(u32),

    #[error("nonce space exhausted without a solution")]
    Exhausted,

    #[error("difficulty {difficulty} is above the local solve limit of {limit}")]
    AboveSolveLimit { difficulty: u32, limit: u32 },

    #[error("solver task was cancelled")]
    Cancelled,
}

/// Candidates tried between checks of the cancel flag.
const CANCEL_CHECK_INTERVAL: u64 = 1 << 12;

/// Capability for solving and checking admission puzzles.
pub trait PowSolver: Send + Sync {
    /// Search for a nonce satisfying `difficulty` for `prefix`. Blocking and
    /// potentially long-running; async callers go through [`solve_detached`].
    fn solve(&self, prefix: &[u8], difficulty: u32) -> Result<Vec<u8>, PowError>;

    /// Like [`solve`](Self::solve), but gives up with
    /// [`PowError::Cancelled`] once `cancel` is set. Solvers that cannot be
    /// interrupted keep the default, which checks the flag only up front.
    fn solve_cancellable(
        &self,
        prefix: &[u8],
        difficulty: u32,
        cancel: &AtomicBool,
    ) -> Result<Vec<u8>, PowError> {
        if cancel.load(Ordering::Relaxed) {
            return Err(PowError::Cancelled);
        }
        self.solve(prefix, difficulty)
    }

    /// Recompute the digest once and check the predicate.
    fn verify(&self, prefix: &[u8], nonce: &[u8], difficulty: u32) -> bool;
}

/// Count leading zero bits of a digest.
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Pure-Rust SHA-256 counter search.
#[derive(Debug, Clone, Default)]
pub struct Sha256Solver {
    /// Give up after this many candidates. `None` searches the whole u64
    /// space, which in practice means "until the heat death of the CPU".
    max_iterations: Option<u64>,
}

impl Sha256Solver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounded variant, mostly useful to keep a misconfigured difficulty
    /// from pinning a core forever.
    /// A zero budget is treated as one candidate.
    pub fn with_max_iterations(max_iterations: u64) -> Self {
        Self {
            max_iterations: Some(max_iterations.max(1)),
        }
    }

    fn search(
        &self,
        prefix: &[u8],
        difficulty: u32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<u8>, PowError> {
        if difficulty > MAX_DIFFICULTY {
            return Err(PowError::DifficultyTooHigh(difficulty));
        }

        // Hash the prefix once; each candidate only pays for its own digits.
        let base = Sha256::new_with_prefix(prefix);
        let limit = self.max_iterations.unwrap_or(u64::MAX);
        let mut digits = [0u8; 20];

        let mut counter: u64 = 0;
        loop {
            let nonce = render_decimal(counter, &mut digits);
            let digest = base.clone().chain_update(nonce).finalize();
            if leading_zero_bits(&digest) >= difficulty {
                return Ok(nonce.to_vec());
            }
            if counter.saturating_add(1) >= limit || counter == u64::MAX {
                return Err(PowError::Exhausted);
            }
            counter += 1;
            if counter % CANCEL_CHECK_INTERVAL == 0
                && cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                return Err(PowError::Cancelled);
            }
        }
    }
}

impl PowSolver for Sha256Solver {
    fn solve(&self, prefix: &[u8], difficulty: u32) -> Result<Vec<u8>, PowError> {
        self.search(prefix, difficulty, None)
    }

    fn solve_cancellable(
        &self,
        prefix: &[u8],
        difficulty: u32,
        cancel: &AtomicBool,
    ) -> Result<Vec<u8>, PowError> {
        self.search(prefix, difficulty, Some(cancel))
    }

    fn verify(&self, prefix: &[u8], nonce: &[u8], difficulty: u32) -> bool {
        if difficulty > MAX_DIFFICULTY {
            return false;
        }
        let digest = Sha256::new_with_prefix(prefix)
            .chain_update(nonce)
            .finalize();
        leading_zero_bits(&digest) >= difficulty
    }
}

/// Write `value` as ASCII decimal into the tail of `buf` and return the
/// written slice. Avoids a heap allocation per candidate.
fn render_decimal(mut value: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

/// Sets the flag when dropped, whether the solve finished or its future was
/// abandoned.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Run a solve on the blocking pool so the caller's runtime keeps serving
/// other peers while the search burns a core. Dropping the returned future
/// (a timeout firing, a session shutting down) stops the search.
pub async fn solve_detached(
    solver: Arc<dyn PowSolver>,
    prefix: Vec<u8>,
    difficulty: u32,
) -> Result<Vec<u8>, PowError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let _guard = CancelOnDrop(cancel.clone());
    tokio::task::spawn_blocking(move || solver.solve_cancellable(&prefix, difficulty, &cancel))
        .await
        .map_err(|_| PowError::Cancelled)?
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR_PREFIX: &[u8] = b"dfe041b4f60cb54d082e542b109e392a";

    #[test]
    fn leading_zero_bits_counts_across_bytes() {
        assert_eq!(leading_zero_bits(&[0xff]), 0);
        assert_eq!(leading_zero_bits(&[0x00, 0x80]), 8);
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0x01]), 23);
        assert_eq!(leading_zero_bits(&[0x0f, 0x00]), 4);
        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn render_decimal_matches_to_string() {
        let mut buf = [0u8; 20];
        for value in [0u64, 7, 10, 9_642_966, u64::MAX] {
            assert_eq!(render_decimal(value, &mut buf), value.to_string().as_bytes());
        }
    }

    #[test]
    fn known_vector_verifies() {
        let solver = Sha256Solver::new();
        assert!(solver.verify(VECTOR_PREFIX, b"9642966", 22));
        assert!(!solver.verify(VECTOR_PREFIX, b"9642967", 22));
    }

    #[test]
    fn solve_finds_first_counter() {
        let solver = Sha256Solver::new();
        assert_eq!(solver.solve(VECTOR_PREFIX, 12).unwrap(), b"5298".to_vec());
        assert_eq!(
            solver.solve(b"00000000000000000000000000000000", 8).unwrap(),
            b"411".to_vec()
        );
    }

    #[test]
    fn solutions_always_verify() {
        let solver = Sha256Solver::new();
        for (i, difficulty) in (0..=14).enumerate() {
            let prefix = format!("prefix-{i:02}-{}", "ab".repeat(i));
            let nonce = solver.solve(prefix.as_bytes(), difficulty).unwrap();
            assert!(
                solver.verify(prefix.as_bytes(), &nonce, difficulty),
                "difficulty {difficulty} failed for {prefix}"
            );
        }
    }

    #[test]
    fn zero_difficulty_is_trivial() {
        let solver = Sha256Solver::new();
        assert_eq!(solver.solve(b"anything", 0).unwrap(), b"0".to_vec());
        assert!(solver.verify(b"anything", b"whatever", 0));
    }

    #[test]
    fn difficulty_above_digest_is_rejected() {
        let solver = Sha256Solver::new();
        assert_eq!(
            solver.solve(b"p", 257),
            Err(PowError::DifficultyTooHigh(257))
        );
        assert!(!solver.verify(b"p", b"0", 257));
    }

    #[test]
    fn bounded_search_gives_up() {
        let solver = Sha256Solver::with_max_iterations(16);
        assert_eq!(solver.solve(VECTOR_PREFIX, 40), Err(PowError::Exhausted));
    }

    #[test]
    fn zero_iteration_budget_still_tries_once() {
        let solver = Sha256Solver::with_max_iterations(0);
        assert_eq!(solver.solve(VECTOR_PREFIX, 0).unwrap(), b"0".to_vec());
        assert_eq!(solver.solve(VECTOR_PREFIX, 40), Err(PowError::Exhausted));
    }

    #[test]
    fn raised_cancel_flag_stops_the_search() {
        let solver = Sha256Solver::new();
        let cancel = AtomicBool::new(true);
        assert_eq!(
            solver.solve_cancellable(VECTOR_PREFIX, 200, &cancel),
            Err(PowError::Cancelled)
        );
    }

    /// Reports on a channel when the wrapped search returns.
    struct Reporting {
        inner: Sha256Solver,
        done: std::sync::Mutex<std::sync::mpsc::Sender<Result<Vec<u8>, PowError>>>,
    }

    impl PowSolver for Reporting {
        fn solve(&self, prefix: &[u8], difficulty: u32) -> Result<Vec<u8>, PowError> {
            self.inner.solve(prefix, difficulty)
        }

        fn verify(&self, prefix: &[u8], nonce: &[u8], difficulty: u32) -> bool {
            self.inner.verify(prefix, nonce, difficulty)
        }

        fn solve_cancellable(
            &self,
            prefix: &[u8],
            difficulty: u32,
            cancel: &AtomicBool,
        ) -> Result<Vec<u8>, PowError> {
            let result = self.inner.solve_cancellable(prefix, difficulty, cancel);
            let _ = self.done.lock().unwrap().send(result.clone());
            result
        }
    }

    #[tokio::test]
    async fn timed_out_detached_solve_stops_searching() {
        let (tx, rx) = std::sync::mpsc::channel();
        let solver: Arc<dyn PowSolver> = Arc::new(Reporting {
            inner: Sha256Solver::new(),
            done: std::sync::Mutex::new(tx),
        });

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            solve_detached(solver, VECTOR_PREFIX.to_vec(), 200),
        )
        .await;
        assert!(waited.is_err());

        let ended = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(std::time::Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert_eq!(ended, Ok(Err(PowError::Cancelled)));
    }

    #[tokio::test]
    async fn detached_solve_runs_off_the_runtime() {
        let solver: Arc<dyn PowSolver> = Arc::new(Sha256Solver::new());
        let nonce = solve_detached(solver.clone(), VECTOR_PREFIX.to_vec(), 12)
            .await
            .unwrap();
        assert!(solver.verify(VECTOR_PREFIX, &nonce, 12));
    }
}
