// ============================================================
// Layer 6 — Bounded Retry with Exponential Backoff
// ============================================================
// Checkpoint I/O can hit transient filesystem trouble (network
// mounts, a full disk being cleaned up). Each checkpoint read or
// write is attempted a bounded number of times:
//
//   attempt 1 ─fail─► sleep b ─► attempt 2 ─fail─► sleep 2b ─► ...
//
// After the last attempt the error is surfaced as CheckpointIo
// carrying the path and the number of attempts made.

use std::{fmt::Display, path::Path, thread, time::Duration};

use crate::domain::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts:        u32,
    pub initial_backoff: Duration,
    pub max_backoff:     Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts:        3,
            initial_backoff: Duration::from_millis(50),
            max_backoff:     Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(attempts: u32) -> Self {
        Self { attempts, initial_backoff: Duration::ZERO, max_backoff: Duration::ZERO }
    }

    pub fn run<T, E, F>(&self, path: &Path, mut op: F) -> PipelineResult<T>
    where
        E: Display,
        F: FnMut() -> Result<T, E>,
    {
        let attempts = self.attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    return Err(PipelineError::CheckpointIo {
                        path:     path.to_path_buf(),
                        attempts: attempt,
                        reason:   e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "'{}': attempt {}/{} failed ({}), retrying in {:?}",
                        path.display(),
                        attempt,
                        attempts,
                        e,
                        backoff
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let out = RetryPolicy::immediate(3).run(Path::new("x"), || {
            calls += 1;
            if calls < 3 { Err("busy") } else { Ok(calls) }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_with_checkpoint_io() {
        let mut calls = 0;
        let out: PipelineResult<()> = RetryPolicy::immediate(2).run(Path::new("ckpt/model.mpk"), || {
            calls += 1;
            Err("disk on fire")
        });
        assert_eq!(calls, 2);
        match out {
            Err(PipelineError::CheckpointIo { attempts, reason, path }) => {
                assert_eq!(attempts, 2);
                assert_eq!(reason, "disk on fire");
                assert!(path.ends_with("model.mpk"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = RetryPolicy::immediate(0).run(Path::new("x"), || {
            calls += 1;
            Err::<(), _>("no")
        });
        assert_eq!(calls, 1);
    }
}
