//! Epoch-level learning rate schedules

/// Multiplier on the base learning rate, advanced once per epoch
pub trait LrSchedule {
    fn step(&mut self);
    /// Current multiplier
    fn factor(&self) -> f64;
}

/// Multiply by `gamma` every `step_size` epochs
#[derive(Debug, Clone)]
pub struct StepLr {
    step_size: usize,
    gamma: f64,
    last_epoch: usize,
}

impl StepLr {
    /// Multiply by `gamma` every `step_size` steps
    pub fn new(step_size: usize, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }
}

impl LrSchedule for StepLr {
    fn step(&mut self) {
        self.last_epoch += 1;
    }

    fn factor(&self) -> f64 {
        self.gamma.powi((self.last_epoch / self.step_size) as i32)
    }
}

/// `(epoch + 1) / n_epoch_ramp` until `n_epoch_ramp`, then 1
pub fn ramp_scheduling_function(n_epoch_ramp: usize, epoch: usize) -> f64 {
    if epoch >= n_epoch_ramp {
        1.0
    } else {
        (epoch + 1) as f64 / n_epoch_ramp as f64
    }
}

/// Linear warm-up
#[derive(Debug, Clone)]
pub struct RampLr {
    n_epoch_ramp: usize,
    last_epoch: usize,
}

impl RampLr {
    /// Ramp linearly over `n_epoch_ramp` steps
    pub fn new(n_epoch_ramp: usize) -> Self {
        Self {
            n_epoch_ramp: n_epoch_ramp.max(1),
            last_epoch: 0,
        }
    }
}

impl LrSchedule for RampLr {
    fn step(&mut self) {
        self.last_epoch += 1;
    }

    fn factor(&self) -> f64 {
        ramp_scheduling_function(self.n_epoch_ramp, self.last_epoch)
    }
}

/// Schedules applied in sequence.
///
/// `activation_step[i]` is the step from which schedule `i` (and every one
/// after it) is stepped; the multiplier is the product of all schedules.
pub struct SchedulerCombiner {
    schedulers: Vec<Box<dyn LrSchedule>>,
    activation_step: Vec<usize>,
    curr_step: usize,
}

impl SchedulerCombiner {
    /// Run `schedulers[i]` from `activation_step[i]` on
    pub fn new(schedulers: Vec<Box<dyn LrSchedule>>, activation_step: Vec<usize>, curr_step: usize) -> anyhow::Result<Self> {
        if schedulers.len() != activation_step.len() {
            anyhow::bail!("The number of schedulers must match the number of activation steps");
        }
        if activation_step.first().map_or(false, |&first| first > curr_step) {
            anyhow::bail!("The first activation step cannot be higher than the current step");
        }
        Ok(Self {
            schedulers,
            activation_step,
            curr_step,
        })
    }
}

impl LrSchedule for SchedulerCombiner {
    fn step(&mut self) {
        self.curr_step += 1;
        let active = self.activation_step.partition_point(|&a| a < self.curr_step);
        let index = active.saturating_sub(1);
        for scheduler in self.schedulers[index..].iter_mut().rev() {
            scheduler.step();
        }
    }

    fn factor(&self) -> f64 {
        self.schedulers.iter().map(|s| s.factor()).product()
    }
}

/// Ramp, step decay, both or neither, as configured
pub fn build_scheduler(
    scheduler_step: Option<usize>,
    scheduler_ramp: Option<usize>,
) -> anyhow::Result<Option<Box<dyn LrSchedule>>> {
    let step = scheduler_step.filter(|&s| s > 0).map(|s| StepLr::new(s, 0.5));
    let ramp = scheduler_ramp.filter(|&r| r > 0);
    let scheduler: Option<Box<dyn LrSchedule>> = match (step, ramp) {
        (None, None) => None,
        (Some(step), None) => Some(Box::new(step)),
        (None, Some(n)) => Some(Box::new(RampLr::new(n))),
        (Some(step), Some(n)) => {
            let schedulers: Vec<Box<dyn LrSchedule>> = vec![Box::new(RampLr::new(n)), Box::new(step)];
            Some(Box::new(SchedulerCombiner::new(schedulers, vec![0, n], 0)?))
        }
    };
    Ok(scheduler)
}
