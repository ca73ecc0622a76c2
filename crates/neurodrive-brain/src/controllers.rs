//! Controller variants: evolvable neural, random baseline, and manual.

use crate::network::{NetworkError, NeuralNetwork};
use neurodrive_core::{
    ACTUATION_DOF, Actuation, BrainSettings, Controller, ControlLimits, GenomeError,
};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::any::Any;
use tracing::warn;

/// Evolvable controller: sensor distances in, steer/force out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralController {
    network: NeuralNetwork,
    limits: ControlLimits,
}

impl NeuralController {
    /// Build a randomized network shaped `sensors -> hidden layers -> 2` per
    /// the world's brain settings.
    pub fn from_settings<R: Rng>(
        settings: &BrainSettings,
        limits: ControlLimits,
        sensor_count: usize,
        rng: &mut R,
    ) -> Result<Self, NetworkError> {
        let mut network = NeuralNetwork::new();
        network.add_layer(sensor_count)?;
        for &size in &settings.hidden_layers {
            network.add_layer(size)?;
        }
        network.add_layer(ACTUATION_DOF)?;
        network.randomize(rng, settings.weight_min, settings.weight_max);
        Ok(Self { network, limits })
    }

    #[must_use]
    pub fn network(&self) -> &NeuralNetwork {
        &self.network
    }
}

impl Controller for NeuralController {
    fn kind(&self) -> &'static str {
        "neural"
    }

    fn actuate(&mut self, _dt: f64, sensor_distances: &[f32]) -> Option<Actuation> {
        let output = match self.network.forward(sensor_distances) {
            Ok(output) => output,
            Err(err) => {
                warn!(%err, "skipping actuation this tick");
                return None;
            }
        };
        if output.len() < ACTUATION_DOF {
            warn!(
                outputs = output.len(),
                "network output layer too small for actuation; skipping tick"
            );
            return None;
        }
        let steer = output[0].clamp(-1.0, 1.0) * self.limits.steer_max;
        // Map the signed drive output onto [reverse_max, forward_max].
        let throttle = (output[1] * 0.5 + 0.5).clamp(0.0, 1.0);
        let force = self.limits.force_reverse_max
            + (self.limits.force_forward_max - self.limits.force_reverse_max) * throttle;
        Some(Actuation {
            steer,
            force,
            brake: 0.0,
        })
    }

    fn genome(&self) -> Option<Vec<f32>> {
        Some(self.network.genes())
    }

    fn apply_genome(&mut self, genes: &[f32]) -> Result<(), GenomeError> {
        self.network.set_genes(genes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Uniform-random baseline. Not evolvable.
#[derive(Debug)]
pub struct RandomController {
    rng: SmallRng,
    limits: ControlLimits,
}

impl RandomController {
    #[must_use]
    pub fn new(seed: u64, limits: ControlLimits) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            limits,
        }
    }
}

impl Controller for RandomController {
    fn kind(&self) -> &'static str {
        "random"
    }

    fn actuate(&mut self, _dt: f64, _sensor_distances: &[f32]) -> Option<Actuation> {
        Some(Actuation {
            steer: self
                .rng
                .random_range(-self.limits.steer_max..=self.limits.steer_max),
            force: self.rng.random_range(0.0..=self.limits.force_forward_max),
            brake: 0.0,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Input-device state for the manual controller, fed in by the windowing
/// layer through `as_any_mut`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualInput {
    pub steer_left: bool,
    pub steer_right: bool,
    pub throttle_forward: bool,
    pub throttle_reverse: bool,
    pub handbrake: bool,
}

/// Keyboard-driven controller. Not evolvable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualController {
    input: ManualInput,
    limits: ControlLimits,
}

impl ManualController {
    #[must_use]
    pub fn new(limits: ControlLimits) -> Self {
        Self {
            input: ManualInput::default(),
            limits,
        }
    }

    /// Replace the held input state. Opposing directions cancel out.
    pub fn set_input(&mut self, input: ManualInput) {
        self.input = input;
    }

    #[must_use]
    pub fn input(&self) -> ManualInput {
        self.input
    }
}

impl Controller for ManualController {
    fn kind(&self) -> &'static str {
        "manual"
    }

    fn actuate(&mut self, _dt: f64, _sensor_distances: &[f32]) -> Option<Actuation> {
        let input = self.input;
        let mut steer = 0.0;
        if input.steer_left {
            steer += self.limits.steer_max;
        }
        if input.steer_right {
            steer -= self.limits.steer_max;
        }
        let force = if input.throttle_forward {
            self.limits.force_forward_max
        } else if input.throttle_reverse {
            self.limits.force_reverse_max
        } else {
            0.0
        };
        // Rolling friction while the throttle is released.
        let brake = if input.handbrake {
            self.limits.brake_max
        } else if force == 0.0 {
            self.limits.idle_brake
        } else {
            0.0
        };
        Some(Actuation {
            steer,
            force,
            brake,
        })
    }

    fn reset(&mut self) {
        self.input = ManualInput::default();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
