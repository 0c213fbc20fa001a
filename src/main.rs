use std::{env, fs};

use anyhow::{Context, Result};
use log::info;
use nadamw::{NAdamW, NAdamWConfig, ParamGroup, Parameter, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Deserialize;

/// The demo's configuration, every field is optional.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "snake_case")]
struct DemoConfig {
    optimizer: NAdamWConfig,
    steps: usize,
    log_every: usize,
    samples: usize,
    seed: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            optimizer: NAdamWConfig {
                lr: 0.05,
                ..NAdamWConfig::default()
            },
            steps: 500,
            log_every: 50,
            samples: 64,
            seed: 42,
        }
    }
}

/// Fits `y = 3x - 2` with a one weight linear model.
fn main() -> Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            let raw = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => DemoConfig::default(),
    };

    let mut rng = StdRng::seed_from_u64(config.seed);
    let xs: Vec<f32> = (0..config.samples)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    let ys: Vec<f32> = xs
        .iter()
        .map(|x| 3. * x - 2. + rng.random_range(-0.05..0.05))
        .collect();

    let mut optim = NAdamW::new(config.optimizer)?;
    let mut groups = [optim.group(vec![
        Parameter::new(Tensor::scalar(0.)),
        Parameter::new(Tensor::scalar(0.)),
    ])];

    info!(steps = config.steps, samples = config.samples; "training");

    for step in 1..=config.steps {
        let loss = optim.step_with(&mut groups, |groups| backward(&mut groups[0], &xs, &ys))?;

        if config.log_every > 0 && step % config.log_every == 0 {
            info!(step = step, loss = loss; "progress");
        }
    }

    let params = groups[0].params();
    let w = params[0].value().item().unwrap_or_default();
    let b = params[1].value().item().unwrap_or_default();
    info!("fitted y = {w:.4}x + {b:.4}");

    Ok(())
}

/// Computes the mean squared error and stores its gradient on the group's parameters.
fn backward(group: &mut ParamGroup, xs: &[f32], ys: &[f32]) -> f32 {
    let params = group.params_mut();
    let w = params[0].value().item().unwrap_or_default();
    let b = params[1].value().item().unwrap_or_default();

    let n = xs.len().max(1) as f32;
    let (mut loss, mut dw, mut db) = (0., 0., 0.);
    for (x, y) in xs.iter().zip(ys) {
        let err = w * x + b - y;
        loss += err * err / n;
        dw += 2. * err * x / n;
        db += 2. * err / n;
    }

    params[0].set_grad(Tensor::scalar(dw));
    params[1].set_grad(Tensor::scalar(db));
    loss
}
