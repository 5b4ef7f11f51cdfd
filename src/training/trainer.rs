//! Optimizer wrapper with an epoch-level learning rate schedule

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::scheduler::{build_scheduler, LrSchedule};
use crate::config::CpcConfig;

/// Seed the device generator (GPU only) and return the host generator
pub fn set_seed(seed: u64, device: &Device) -> Result<StdRng> {
    if !device.is_cpu() {
        device.set_seed(seed)?;
    }
    Ok(StdRng::seed_from_u64(seed))
}

/// Adam without weight decay, `lr = base_lr * schedule factor`
pub struct Trainer {
    optimizer: AdamW,
    base_lr: f64,
    scheduler: Option<Box<dyn LrSchedule>>,
    step_count: usize,
}

impl Trainer {
    /// AdamW over `vars` with the configured schedule
    pub fn new(vars: Vec<Var>, config: &CpcConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.epsilon,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(vars, params)?;
        let scheduler = build_scheduler(config.scheduler_step, config.scheduler_ramp)?;
        let mut trainer = Self {
            optimizer,
            base_lr: config.learning_rate,
            scheduler,
            step_count: 0,
        };
        trainer.apply_schedule();
        Ok(trainer)
    }

    fn apply_schedule(&mut self) {
        let factor = self.scheduler.as_ref().map_or(1.0, |s| s.factor());
        self.optimizer.set_learning_rate(self.base_lr * factor);
    }

    /// Backpropagate `loss` and update every variable
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        self.optimizer.backward_step(loss)?;
        self.step_count += 1;
        Ok(())
    }

    /// Advance the schedule by one epoch
    pub fn scheduler_step(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step();
            self.apply_schedule();
            debug!("Learning rate set to {:.3e}", self.current_lr());
        }
    }

    /// Current learning rate
    pub fn current_lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Optimizer steps taken
    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_schedule_drives_learning_rate() {
        let config = CpcConfig {
            learning_rate: 1e-3,
            scheduler_step: Some(1),
            ..Default::default()
        };
        let w = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let mut trainer = Trainer::new(vec![w.clone()], &config).unwrap();
        assert!((trainer.current_lr() - 1e-3).abs() < 1e-12);
        trainer.scheduler_step();
        assert!((trainer.current_lr() - 5e-4).abs() < 1e-12);

        let target = Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let loss = (w.as_tensor() - &target).unwrap().sqr().unwrap().sum_all().unwrap();
        trainer.backward_step(&loss).unwrap();
        assert_eq!(trainer.step_count(), 1);
        let moved: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!(moved.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_ramp_starts_low() {
        let config = CpcConfig {
            learning_rate: 1e-3,
            scheduler_ramp: Some(4),
            ..Default::default()
        };
        let trainer = Trainer::new(vec![], &config).unwrap();
        assert!((trainer.current_lr() - 2.5e-4).abs() < 1e-12);
    }
}
