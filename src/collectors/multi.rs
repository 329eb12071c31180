//! Collectors running one worker thread per environment
use super::runner::EnvRunner;
use super::{Collector, CollectorError, CollectorSettings};
use crate::envs::EnvFactory;
use crate::tensordict::TensorDict;
use crate::wiring::Component;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug)]
enum Command {
    /// Collect this many frames and send them back.
    Collect(usize),
    Stop,
}

type WorkerResult = (usize, Result<TensorDict, CollectorError>);

/// Worker threads that each own one environment.
#[derive(Debug)]
struct WorkerPool {
    commands: Vec<Sender<Command>>,
    results: Receiver<WorkerResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create every environment, then start one worker per environment.
    ///
    /// Environment construction errors are returned before any thread starts.
    fn spawn(
        factories: &[EnvFactory],
        policy: Option<&Arc<dyn Component>>,
        settings: &CollectorSettings,
    ) -> Result<Self, CollectorError> {
        if factories.is_empty() {
            return Err(CollectorError::Invalid("no environment factories".into()));
        }
        let num_workers = factories.len();
        let runners = factories
            .iter()
            .enumerate()
            .map(|(i, factory)| {
                let env = factory.create()?;
                Ok(EnvRunner::new(
                    env,
                    policy.cloned(),
                    settings.max_frames_per_traj,
                    settings.seed.wrapping_add(i as u64),
                )
                .with_traj_ids(i, num_workers))
            })
            .collect::<Result<Vec<_>, CollectorError>>()?;

        let (send_result, results) = channel::unbounded();
        let mut commands = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for (id, mut runner) in runners.into_iter().enumerate() {
            let (send_command, recv_command) = channel::unbounded();
            let send_result = send_result.clone();
            info!("starting collector worker {} on `{}`", id, runner.env_name());
            handles.push(thread::spawn(move || {
                while let Ok(Command::Collect(frames)) = recv_command.recv() {
                    if send_result.send((id, runner.collect(frames))).is_err() {
                        break;
                    }
                }
                runner.close();
                debug!("collector worker {} stopped", id);
            }));
            commands.push(send_command);
        }
        Ok(Self {
            commands,
            results,
            handles,
        })
    }

    fn num_workers(&self) -> usize {
        self.commands.len()
    }

    fn request(&self, worker: usize, frames: usize) -> Result<(), CollectorError> {
        self.commands[worker]
            .send(Command::Collect(frames))
            .map_err(|_| CollectorError::WorkerDisconnected(worker))
    }

    fn receive(&self) -> Result<WorkerResult, CollectorError> {
        self.results
            .recv()
            .map_err(|_| CollectorError::WorkerDisconnected(self.num_workers()))
    }

    fn shutdown(self) {
        for command in &self.commands {
            // A worker that already exited has dropped its receiver
            let _ = command.send(Command::Stop);
        }
        for (id, handle) in self.handles.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!("collector worker {} panicked", id);
            }
        }
    }
}

/// Frames each of `num_workers` workers collects for one batch of `frames_per_batch`.
fn worker_shares(frames_per_batch: usize, num_workers: usize) -> Vec<usize> {
    let base = frames_per_batch / num_workers;
    let extra = frames_per_batch % num_workers;
    (0..num_workers).map(|i| base + usize::from(i < extra)).collect()
}

/// Runs one environment per worker thread and joins the workers' steps into each batch.
///
/// Every batch holds `frames_per_batch` frames split as evenly as possible between the
/// workers, concatenated in worker order.
#[derive(Debug)]
pub struct MultiSyncDataCollector {
    pool: Option<WorkerPool>,
    settings: CollectorSettings,
    shares: Vec<usize>,
    frames_collected: usize,
}

impl MultiSyncDataCollector {
    pub fn new(
        factories: &[EnvFactory],
        policy: Option<Arc<dyn Component>>,
        settings: CollectorSettings,
    ) -> Result<Self, CollectorError> {
        if settings.frames_per_batch < factories.len() {
            return Err(CollectorError::Invalid(format!(
                "{} frames per batch cannot be split between {} workers",
                settings.frames_per_batch,
                factories.len()
            )));
        }
        let pool = WorkerPool::spawn(factories, policy.as_ref(), &settings)?;
        let shares = worker_shares(settings.frames_per_batch, pool.num_workers());
        Ok(Self {
            pool: Some(pool),
            settings,
            shares,
            frames_collected: 0,
        })
    }

    fn collect_batch(&self, pool: &WorkerPool) -> Result<TensorDict, CollectorError> {
        for (worker, &frames) in self.shares.iter().enumerate() {
            pool.request(worker, frames)?;
        }
        let mut parts: Vec<Option<TensorDict>> = vec![None; self.shares.len()];
        let mut first_error = None;
        for _ in 0..self.shares.len() {
            let (worker, result) = pool.receive()?;
            match result {
                Ok(part) => parts[worker] = Some(part),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        let parts: Vec<TensorDict> = parts.into_iter().flatten().collect();
        Ok(TensorDict::cat(&parts)?)
    }
}

impl Iterator for MultiSyncDataCollector {
    type Item = Result<TensorDict, CollectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.settings.exhausted(self.frames_collected) {
            return None;
        }
        let pool = self.pool.as_ref()?;
        let batch = self.collect_batch(pool);
        if let Ok(batch) = &batch {
            self.frames_collected += batch.numel();
            debug!("collected {} frames", self.frames_collected);
        }
        Some(batch)
    }
}

impl Collector for MultiSyncDataCollector {
    fn frames_per_batch(&self) -> usize {
        self.settings.frames_per_batch
    }

    fn total_frames(&self) -> Option<usize> {
        self.settings.total_frames
    }

    fn frames_collected(&self) -> usize {
        self.frames_collected
    }

    fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
            info!("multi-sync collector shut down after {} frames", self.frames_collected);
        }
    }
}

impl Drop for MultiSyncDataCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs one environment per worker thread; each batch comes from whichever worker
/// finishes first.
///
/// Every worker collects full batches of `frames_per_batch` frames. A worker starts
/// its next batch as soon as its previous one is taken.
#[derive(Debug)]
pub struct MultiaSyncDataCollector {
    pool: Option<WorkerPool>,
    settings: CollectorSettings,
    frames_collected: usize,
}

impl MultiaSyncDataCollector {
    pub fn new(
        factories: &[EnvFactory],
        policy: Option<Arc<dyn Component>>,
        settings: CollectorSettings,
    ) -> Result<Self, CollectorError> {
        let pool = WorkerPool::spawn(factories, policy.as_ref(), &settings)?;
        for worker in 0..pool.num_workers() {
            pool.request(worker, settings.frames_per_batch)?;
        }
        Ok(Self {
            pool: Some(pool),
            settings,
            frames_collected: 0,
        })
    }
}

impl Iterator for MultiaSyncDataCollector {
    type Item = Result<TensorDict, CollectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.settings.exhausted(self.frames_collected) {
            return None;
        }
        let pool = self.pool.as_ref()?;
        let batch = pool.receive().and_then(|(worker, result)| {
            debug!("batch from collector worker {}", worker);
            pool.request(worker, self.settings.frames_per_batch)?;
            result
        });
        if let Ok(batch) = &batch {
            self.frames_collected += batch.numel();
        }
        Some(batch)
    }
}

impl Collector for MultiaSyncDataCollector {
    fn frames_per_batch(&self) -> usize {
        self.settings.frames_per_batch
    }

    fn total_frames(&self) -> Option<usize> {
        self.settings.total_frames
    }

    fn frames_collected(&self) -> usize {
        self.frames_collected
    }

    fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
            info!("multi-async collector shut down after {} frames", self.frames_collected);
        }
    }
}

impl Drop for MultiaSyncDataCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
