//! Fixed-size worker pool for bootstrap trials
//!
//! Each worker thread owns a private state value (in practice its own
//! [`MeasurementStore`](crate::store::MeasurementStore) handle, since SQLite
//! connections cannot cross threads) and runs jobs pulled from one shared
//! crossbeam channel. Results come back tagged with the job id.
//!
//! ```text
//!  run_batch()                          worker 0 (state 0)
//!     │  Job(id, payload) ──┐        ┌─▶ f(&mut state, payload)
//!     │                     ├─ jobs ─┤                          ├─ results ─▶ barrier
//!     │  Stop × workers ────┘        └─▶ worker N (state N) ────┘
//! ```
//!
//! A job that fails or panics is logged and reported as a missing result;
//! the batch barrier turns that into [`NanownError::MissingJobResult`].

use crate::error::{NanownError, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work function shared by all workers
pub type JobFn<S, J, R> = Arc<dyn Fn(&mut S, J) -> Result<R> + Send + Sync>;

enum Message<J> {
    Job(usize, J),
    Stop,
}

/// Pool of threads, each bound to one state value
pub struct WorkerPool<J, R> {
    jobs: Sender<Message<J>>,
    results: Receiver<(usize, Option<R>)>,
    workers: Vec<JoinHandle<()>>,
}

impl<J, R> WorkerPool<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    /// Spawn one worker per state value
    ///
    /// # Errors
    ///
    /// `Config` when `states` is empty, `Io` when a thread cannot be spawned.
    pub fn new<S>(states: Vec<S>, work: JobFn<S, J, R>) -> Result<Self>
    where
        S: Send + 'static,
    {
        if states.is_empty() {
            return Err(NanownError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let (job_tx, job_rx) = channel::unbounded::<Message<J>>();
        let (result_tx, result_rx) = channel::unbounded();

        let mut workers = Vec::with_capacity(states.len());
        for (index, state) in states.into_iter().enumerate() {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let work = Arc::clone(&work);
            let handle = thread::Builder::new()
                .name(format!("nanown-worker-{index}"))
                .spawn(move || Self::worker_loop(index, state, &jobs, &results, &work))?;
            workers.push(handle);
        }

        Ok(Self {
            jobs: job_tx,
            results: result_rx,
            workers,
        })
    }

    fn worker_loop<S>(
        index: usize,
        mut state: S,
        jobs: &Receiver<Message<J>>,
        results: &Sender<(usize, Option<R>)>,
        work: &JobFn<S, J, R>,
    ) {
        for message in jobs.iter() {
            let (id, payload) = match message {
                Message::Job(id, payload) => (id, payload),
                Message::Stop => break,
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut state, payload)));
            let result = match outcome {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    tracing::warn!(worker = index, job = id, error = %e, "job failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(worker = index, job = id, "job panicked");
                    None
                }
            };

            if results.send((id, result)).is_err() {
                break;
            }
        }
    }

    /// Submit a batch and block until every job has reported back
    ///
    /// # Errors
    ///
    /// `MissingJobResult` for the first submitted job (in submission order)
    /// that failed; `PoolClosed` if the workers are gone.
    pub fn run_batch(&self, batch: Vec<(usize, J)>) -> Result<HashMap<usize, R>> {
        if self.workers.is_empty() {
            return Err(NanownError::PoolClosed);
        }

        let ids: Vec<usize> = batch.iter().map(|(id, _)| *id).collect();
        for (id, payload) in batch {
            self.jobs
                .send(Message::Job(id, payload))
                .map_err(|_| NanownError::PoolClosed)?;
        }

        let mut collected = HashMap::with_capacity(ids.len());
        for _ in 0..ids.len() {
            let (id, result) = self.results.recv().map_err(|_| NanownError::PoolClosed)?;
            if let Some(value) = result {
                collected.insert(id, value);
            }
        }

        if let Some(&missing) = ids.iter().find(|id| !collected.contains_key(id)) {
            return Err(NanownError::MissingJobResult(missing));
        }
        Ok(collected)
    }

    /// Run payloads in order and return their results in the same order
    pub fn map(&self, payloads: Vec<J>) -> Result<Vec<R>> {
        let n = payloads.len();
        let mut results = self.run_batch(payloads.into_iter().enumerate().collect())?;
        (0..n)
            .map(|id| results.remove(&id).ok_or(NanownError::MissingJobResult(id)))
            .collect()
    }
}

impl<J, R> WorkerPool<J, R> {
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Send one stop sentinel per worker and join them
    pub fn stop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.jobs.send(Message::Stop);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<J, R> Drop for WorkerPool<J, R> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squaring_pool(workers: usize) -> WorkerPool<i64, i64> {
        let states = vec![(); workers];
        WorkerPool::new(states, Arc::new(|_: &mut (), x: i64| Ok(x * x))).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        let states: Vec<()> = Vec::new();
        let pool = WorkerPool::<i64, i64>::new(states, Arc::new(|_: &mut (), x: i64| Ok(x)));
        assert!(matches!(pool, Err(NanownError::Config(_))));
    }

    #[test]
    fn test_batch_results_keyed_by_job_id() {
        let pool = squaring_pool(3);
        let results = pool
            .run_batch((0..20).map(|i| (i as usize, i)).collect())
            .unwrap();
        assert_eq!(results.len(), 20);
        assert_eq!(results[&7], 49);
    }

    #[test]
    fn test_map_preserves_order() {
        let pool = squaring_pool(4);
        assert_eq!(pool.map(vec![3, 1, 2]).unwrap(), vec![9, 1, 4]);
        // pool is reusable across batches
        assert_eq!(pool.map(vec![5]).unwrap(), vec![25]);
    }

    #[test]
    fn test_failed_job_reported_missing() {
        let pool: WorkerPool<i64, i64> = WorkerPool::new(
            vec![(), ()],
            Arc::new(|_: &mut (), x: i64| {
                if x == 3 {
                    Err(NanownError::MissingTsval)
                } else {
                    Ok(x)
                }
            }),
        )
        .unwrap();
        let err = pool.map(vec![1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, NanownError::MissingJobResult(2)));
        // barrier drained the batch; the next one is unaffected
        assert_eq!(pool.map(vec![1]).unwrap(), vec![1]);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool: WorkerPool<i64, i64> = WorkerPool::new(
            vec![()],
            Arc::new(|_: &mut (), x: i64| {
                assert!(x != 0, "zero job");
                Ok(x)
            }),
        )
        .unwrap();
        assert!(pool.map(vec![0]).is_err());
        assert_eq!(pool.map(vec![8]).unwrap(), vec![8]);
    }

    #[test]
    fn test_worker_state_is_private() {
        // each worker counts its own jobs; totals add up
        let pool: WorkerPool<(), usize> = WorkerPool::new(
            vec![0usize; 2],
            Arc::new(|count: &mut usize, ()| {
                *count += 1;
                Ok(*count)
            }),
        )
        .unwrap();
        let results = pool.map(vec![(); 1]).unwrap();
        assert_eq!(results, vec![1]);
    }

    #[test]
    fn test_stop_joins_workers() {
        let mut pool = squaring_pool(2);
        pool.stop();
        assert_eq!(pool.workers(), 0);
        assert!(matches!(pool.map(vec![1]), Err(NanownError::PoolClosed)));
    }
}
