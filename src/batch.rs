//! Chunked parallel execution for batch embedding.
//!
//! Items run in chunks of `parallelism` on a dedicated rayon pool. Between
//! chunks the runner sleeps for the configured cooldown and checks the
//! cancel token; once cancelled, no further chunk is started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::config::BatchConfig;

/// Granularity at which a cooldown notices cancellation
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Default)]
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

#[derive(Debug)]
pub enum BatchOutcome<T, E> {
    Done(Result<T, E>),
    /// Never started because the batch was cancelled first
    Cancelled,
}

pub struct BatchRunner {
    pool: rayon::ThreadPool,
    chunk_size: usize,
    cooldown: Duration,
}

impl BatchRunner {
    pub fn new(config: &BatchConfig) -> Result<Self, rayon::ThreadPoolBuildError> {
        let chunk_size = config.parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(chunk_size)
            .thread_name(|i| format!("embed-batch-{i}"))
            .build()?;

        Ok(Self {
            pool,
            chunk_size,
            cooldown: Duration::from_millis(config.cooldown_ms),
        })
    }

    /// Apply `f` to every item. Outcomes keep the input order.
    pub fn run<I, T, E, F>(&self, items: &[I], cancel: &CancelToken, f: F) -> Vec<BatchOutcome<T, E>>
    where
        I: Sync,
        T: Send,
        E: Send,
        F: Fn(&I) -> Result<T, E> + Sync + Send,
    {
        let mut outcomes = Vec::with_capacity(items.len());
        let chunks = items.len().div_ceil(self.chunk_size);

        for (idx, chunk) in items.chunks(self.chunk_size).enumerate() {
            if cancel.is_cancelled() {
                outcomes.extend(chunk.iter().map(|_| BatchOutcome::Cancelled));
                continue;
            }

            let results: Vec<Result<T, E>> =
                self.pool.install(|| chunk.par_iter().map(&f).collect());
            outcomes.extend(results.into_iter().map(BatchOutcome::Done));

            log::debug!("batch chunk {}/{} finished", idx + 1, chunks);

            if idx + 1 < chunks {
                self.cool_down(cancel);
            }
        }

        outcomes
    }

    fn cool_down(&self, cancel: &CancelToken) {
        let deadline = Instant::now() + self.cooldown;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn runner(parallelism: usize, cooldown_ms: u64) -> BatchRunner {
        BatchRunner::new(&BatchConfig {
            parallelism,
            cooldown_ms,
        })
        .unwrap()
    }

    #[test]
    fn test_outcomes_keep_input_order() {
        let items: Vec<u32> = (0..13).collect();
        let outcomes = runner(5, 0).run(&items, &CancelToken::new(), |i| {
            if i % 4 == 0 {
                Err(format!("bad {i}"))
            } else {
                Ok(i * 10)
            }
        });

        assert_eq!(outcomes.len(), 13);
        for (i, outcome) in outcomes.iter().enumerate() {
            match outcome {
                BatchOutcome::Done(Ok(v)) => assert_eq!(*v, i as u32 * 10),
                BatchOutcome::Done(Err(e)) => assert_eq!(e, &format!("bad {i}")),
                BatchOutcome::Cancelled => panic!("nothing was cancelled"),
            }
        }
    }

    #[test]
    fn test_parallelism_is_bounded() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<u32> = (0..20).collect();

        runner(3, 0).run(&items, &CancelToken::new(), |_| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, ()>(())
        });

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_cancel_stops_remaining_chunks() {
        let cancel = CancelToken::new();
        let items: Vec<u32> = (0..10).collect();

        let outcomes = runner(2, 0).run(&items, &cancel, |&i| {
            if i == 1 {
                cancel.cancel();
            }
            Ok::<_, ()>(i)
        });

        let done = outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Done(_)))
            .count();
        let cancelled = outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Cancelled))
            .count();
        assert_eq!(done, 2);
        assert_eq!(cancelled, 8);
    }

    #[test]
    fn test_cooldown_between_chunks() {
        let items: Vec<u32> = (0..4).collect();
        let started = Instant::now();
        runner(2, 60).run(&items, &CancelToken::new(), |_| Ok::<_, ()>(()));
        // two chunks, one cooldown
        assert!(started.elapsed() >= Duration::from_millis(60));
    }
}
