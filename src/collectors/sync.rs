use super::runner::EnvRunner;
use super::{Collector, CollectorError, CollectorSettings};
use crate::envs::EnvFactory;
use crate::tensordict::TensorDict;
use crate::wiring::Component;
use log::{debug, info};
use std::sync::Arc;

/// Collects batches from a single environment in the calling thread.
#[derive(Debug)]
pub struct SyncDataCollector {
    runner: Option<EnvRunner>,
    settings: CollectorSettings,
    frames_collected: usize,
}

impl SyncDataCollector {
    pub fn new(
        create_env: &EnvFactory,
        policy: Option<Arc<dyn Component>>,
        settings: CollectorSettings,
    ) -> Result<Self, CollectorError> {
        let env = create_env.create()?;
        let runner = EnvRunner::new(env, policy, settings.max_frames_per_traj, settings.seed);
        info!(
            "sync collector on `{}`: {} frames per batch",
            runner.env_name(),
            settings.frames_per_batch
        );
        Ok(Self {
            runner: Some(runner),
            settings,
            frames_collected: 0,
        })
    }
}

impl Iterator for SyncDataCollector {
    type Item = Result<TensorDict, CollectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.settings.exhausted(self.frames_collected) {
            return None;
        }
        let runner = self.runner.as_mut()?;
        let batch = runner.collect(self.settings.frames_per_batch);
        if let Ok(batch) = &batch {
            self.frames_collected += batch.numel();
            debug!("collected {} frames", self.frames_collected);
        }
        Some(batch)
    }
}

impl Collector for SyncDataCollector {
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
        if let Some(mut runner) = self.runner.take() {
            runner.close();
            info!("sync collector shut down after {} frames", self.frames_collected);
        }
    }
}

impl Drop for SyncDataCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::{Environment, MockContinuousEnv, ACTION_KEY};

    fn factory() -> EnvFactory {
        EnvFactory::new(|| Ok(Box::new(MockContinuousEnv::default()) as Box<dyn Environment>))
    }

    #[test]
    fn first_batch_then_shutdown() {
        let mut collector =
            SyncDataCollector::new(&factory(), None, CollectorSettings::default()).unwrap();
        let batch = collector.next().unwrap().unwrap();
        assert_eq!(batch.numel(), 200);
        assert_eq!(batch.get(ACTION_KEY).unwrap().shape(), &[200, 7]);
        collector.shutdown();
        assert!(collector.next().is_none());
        collector.shutdown();
    }

    #[test]
    fn seeds_are_reproducible() {
        let settings = CollectorSettings {
            frames_per_batch: 5,
            seed: 4,
            ..CollectorSettings::default()
        };
        let a = SyncDataCollector::new(&factory(), None, settings).unwrap().next().unwrap().unwrap();
        let b = SyncDataCollector::new(&factory(), None, settings).unwrap().next().unwrap().unwrap();
        assert_eq!(a, b);
    }
}
