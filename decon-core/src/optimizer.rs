use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// Bold-driver learning-rate schedule shared by every group.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub increase_factor: f64,
    pub decrease_factor: f64,
    pub lr_lower_bound: f64,
    pub lr_upper_bound: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            increase_factor: 1.015,
            decrease_factor: 0.9,
            lr_lower_bound: 0.0,
            lr_upper_bound: 1e5,
        }
    }
}

struct ParamGroup {
    adam: AdamW,
    learning_rate: f64,
}

/// Round-robin optimizer over independent parameter groups.
///
/// Each group owns its Adam moments and learning rate. One `step`
/// updates exactly one group and adapts the rate of the group updated
/// on the previous call: the loss moved down (or held), its rate grows
/// by `increase_factor`; the loss moved up, it shrinks by
/// `decrease_factor`, clipped into the configured bounds. The
/// one-iteration lag is intentional: the loss observed now reflects
/// the previous group's update.
pub struct MultiGroupOptimizer {
    schedule: ScheduleConfig,
    groups: Vec<ParamGroup>,
    cursor: usize,
    last_loss: f32,
    started: bool,
}

impl MultiGroupOptimizer {
    pub fn new(schedule: ScheduleConfig) -> Self {
        Self {
            schedule,
            groups: Vec::new(),
            cursor: 0,
            last_loss: f32::INFINITY,
            started: false,
        }
    }

    /// Append a parameter group with its own Adam state and rate.
    /// The group set is fixed once stepping begins.
    pub fn register(&mut self, vars: Vec<Var>, learning_rate: f64) -> anyhow::Result<()> {
        if self.started {
            anyhow::bail!("cannot register a parameter group after optimization has started");
        }
        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        self.groups.push(ParamGroup {
            adam: AdamW::new(vars, params)?,
            learning_rate,
        });
        Ok(())
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Current learning rate of a group, for diagnostics and tests.
    pub fn learning_rate(&self, group: usize) -> Option<f64> {
        self.groups.get(group).map(|g| g.learning_rate)
    }

    /// One update: adapt the previously stepped group's rate against
    /// `loss`, then apply the cursor group's Adam step with `grads`.
    pub fn step(&mut self, loss: f32, grads: &GradStore) -> anyhow::Result<()> {
        if self.groups.is_empty() {
            return Ok(());
        }
        self.started = true;

        let previous = (self.cursor + self.groups.len() - 1) % self.groups.len();
        let factor = if loss <= self.last_loss {
            self.schedule.increase_factor
        } else {
            self.schedule.decrease_factor
        };
        let rate = (self.groups[previous].learning_rate * factor)
            .clamp(self.schedule.lr_lower_bound, self.schedule.lr_upper_bound);
        self.groups[previous].learning_rate = rate;
        self.groups[previous].adam.set_learning_rate(rate);
        self.last_loss = loss;

        self.groups[self.cursor].adam.step(grads)?;
        self.cursor = (self.cursor + 1) % self.groups.len();
        Ok(())
    }
}
