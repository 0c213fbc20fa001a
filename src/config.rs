use serde::{Deserialize, Serialize};

use crate::{
    error::{OptimErr, Result},
    kernel::UpdateOptions,
};

/// The serializable configuration of the optimizer, as loaded from JSON.
///
/// Missing fields take their default values. Nothing is validated here, convert it into
/// `HyperParams` before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct NAdamWConfig {
    pub lr: f32,
    pub betas: (f32, f32),
    pub eps: f32,
    pub weight_decay: f32,
    pub caution: bool,
    pub corrected_weight_decay: bool,
    pub maximize: bool,
    pub foreach: Option<bool>,
    pub capturable: bool,
}

impl Default for NAdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 1e-2,
            caution: false,
            corrected_weight_decay: false,
            maximize: false,
            foreach: None,
            capturable: false,
        }
    }
}

/// A validated set of NAdamW hyperparameters.
///
/// Every value is kept inside its domain, the setters refuse anything outside of it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HyperParams {
    config: NAdamWConfig,
}

impl HyperParams {
    pub fn lr(&self) -> f32 {
        self.config.lr
    }

    pub fn betas(&self) -> (f32, f32) {
        self.config.betas
    }

    pub fn eps(&self) -> f32 {
        self.config.eps
    }

    pub fn weight_decay(&self) -> f32 {
        self.config.weight_decay
    }

    pub fn caution(&self) -> bool {
        self.config.caution
    }

    pub fn corrected_weight_decay(&self) -> bool {
        self.config.corrected_weight_decay
    }

    pub fn maximize(&self) -> bool {
        self.config.maximize
    }

    pub fn foreach(&self) -> Option<bool> {
        self.config.foreach
    }

    pub fn capturable(&self) -> bool {
        self.config.capturable
    }

    /// Changes the learning rate, typically from a scheduler between steps.
    pub fn set_lr(&mut self, lr: f32) -> Result<()> {
        validate_lr(lr)?;
        self.config.lr = lr;
        Ok(())
    }

    pub fn set_betas(&mut self, betas: (f32, f32)) -> Result<()> {
        validate_betas(betas)?;
        self.config.betas = betas;
        Ok(())
    }

    pub fn set_eps(&mut self, eps: f32) -> Result<()> {
        validate_eps(eps)?;
        self.config.eps = eps;
        Ok(())
    }

    pub fn set_weight_decay(&mut self, weight_decay: f32) -> Result<()> {
        validate_weight_decay(weight_decay)?;
        self.config.weight_decay = weight_decay;
        Ok(())
    }

    pub fn set_caution(&mut self, caution: bool) {
        self.config.caution = caution;
    }

    pub fn set_corrected_weight_decay(&mut self, corrected_weight_decay: bool) {
        self.config.corrected_weight_decay = corrected_weight_decay;
    }

    pub fn set_maximize(&mut self, maximize: bool) {
        self.config.maximize = maximize;
    }

    pub fn set_foreach(&mut self, foreach: Option<bool>) {
        self.config.foreach = foreach;
    }

    pub fn set_capturable(&mut self, capturable: bool) {
        self.config.capturable = capturable;
    }

    /// The serializable form of these hyperparameters.
    pub fn to_config(&self) -> NAdamWConfig {
        self.config
    }

    /// Resolves the options of a single update.
    ///
    /// # Arguments
    /// * `max_lr` - The peak learning rate, only used when corrected weight decay is on.
    pub fn update_options(&self, max_lr: f32) -> UpdateOptions {
        let NAdamWConfig {
            lr,
            betas: (beta1, beta2),
            eps,
            weight_decay,
            caution,
            corrected_weight_decay,
            maximize,
            capturable,
            ..
        } = self.config;

        UpdateOptions {
            beta1,
            beta2,
            lr,
            weight_decay,
            eps,
            caution,
            maximize,
            capturable,
            max_lr: corrected_weight_decay.then_some(max_lr),
        }
    }
}

impl TryFrom<NAdamWConfig> for HyperParams {
    type Error = OptimErr;

    fn try_from(config: NAdamWConfig) -> Result<Self> {
        validate_lr(config.lr)?;
        validate_eps(config.eps)?;
        validate_betas(config.betas)?;
        validate_weight_decay(config.weight_decay)?;

        Ok(Self { config })
    }
}

fn validate_lr(lr: f32) -> Result<()> {
    if lr.is_nan() || lr < 0. {
        return Err(OptimErr::InvalidConfig(format!("Invalid learning rate: {lr}")));
    }

    Ok(())
}

fn validate_eps(eps: f32) -> Result<()> {
    if eps.is_nan() || eps < 0. {
        return Err(OptimErr::InvalidConfig(format!("Invalid epsilon value: {eps}")));
    }

    Ok(())
}

fn validate_betas((beta1, beta2): (f32, f32)) -> Result<()> {
    for (index, beta) in [beta1, beta2].into_iter().enumerate() {
        if !(0. ..1.).contains(&beta) {
            return Err(OptimErr::InvalidConfig(format!(
                "Invalid beta parameter at index {index}: {beta}"
            )));
        }
    }

    Ok(())
}

fn validate_weight_decay(weight_decay: f32) -> Result<()> {
    if weight_decay.is_nan() || weight_decay < 0. {
        return Err(OptimErr::InvalidConfig(format!(
            "Invalid weight_decay value: {weight_decay}"
        )));
    }

    Ok(())
}
