//! Layered feed-forward network with a flat gene encoding.

use neurodrive_core::GenomeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topology and evaluation failures of [`NeuralNetwork`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Layers cannot be added once weights have been installed.
    #[error("network topology is frozen after weight installation")]
    TopologyFrozen,
    /// A layer must hold at least one neuron.
    #[error("layers must have a non-zero size")]
    ZeroLayerSize,
    /// Forward evaluation needs an input layer and an output layer.
    #[error("network needs at least two layers")]
    MissingLayers,
    #[error("input has {actual} values, input layer expects {expected}")]
    InputMismatch { expected: usize, actual: usize },
}

/// Full connection between two adjacent layers: an `outputs x inputs`
/// row-major weight matrix plus one bias per output neuron.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Link {
    inputs: usize,
    outputs: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
}

impl Link {
    fn zeroed(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            weights: vec![0.0; inputs * outputs],
            biases: vec![0.0; outputs],
        }
    }

    /// Weighted sum per output row, no activation.
    fn propagate(&self, input: &[f32], output: &mut Vec<f32>) {
        output.clear();
        for row in 0..self.outputs {
            let weights = &self.weights[row * self.inputs..(row + 1) * self.inputs];
            let sum: f32 = weights
                .iter()
                .zip(input)
                .map(|(&w, &x)| w * x)
                .sum::<f32>()
                + self.biases[row];
            output.push(sum);
        }
    }

    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

/// Fully connected feed-forward network. Hidden layers use `tanh`; the
/// output layer stays linear so outputs map directly onto signed control
/// ranges.
///
/// Topology is assembled with [`add_layer`](Self::add_layer) and freezes the
/// first time weights are installed, either by
/// [`randomize`](Self::randomize) or [`set_genes`](Self::set_genes).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NeuralNetwork {
    layers: Vec<usize>,
    links: Vec<Link>,
    frozen: bool,
}

impl NeuralNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a network from an ordered layer-size list.
    pub fn with_layers(sizes: &[usize]) -> Result<Self, NetworkError> {
        let mut network = Self::new();
        for &size in sizes {
            network.add_layer(size)?;
        }
        Ok(network)
    }

    /// Append a layer of `size` neurons, allocating the zeroed link to the
    /// previous layer.
    pub fn add_layer(&mut self, size: usize) -> Result<(), NetworkError> {
        if self.frozen {
            return Err(NetworkError::TopologyFrozen);
        }
        if size == 0 {
            return Err(NetworkError::ZeroLayerSize);
        }
        if let Some(&previous) = self.layers.last() {
            self.links.push(Link::zeroed(previous, size));
        }
        self.layers.push(size);
        Ok(())
    }

    #[must_use]
    pub fn layer_sizes(&self) -> &[usize] {
        &self.layers
    }

    /// Total number of evolvable parameters (weights plus biases).
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.links.iter().map(Link::parameter_count).sum()
    }

    /// Sample every weight and bias uniformly from `[min, max]`. Freezes the
    /// topology.
    pub fn randomize<R: Rng>(&mut self, rng: &mut R, min: f32, max: f32) {
        for link in &mut self.links {
            for weight in &mut link.weights {
                *weight = rng.random_range(min..=max);
            }
            for bias in &mut link.biases {
                *bias = rng.random_range(min..=max);
            }
        }
        self.frozen = true;
    }

    /// Evaluate the network on one input vector.
    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>, NetworkError> {
        if self.links.is_empty() {
            return Err(NetworkError::MissingLayers);
        }
        if input.len() != self.layers[0] {
            return Err(NetworkError::InputMismatch {
                expected: self.layers[0],
                actual: input.len(),
            });
        }

        let mut current = input.to_vec();
        let mut next = Vec::new();
        let last = self.links.len() - 1;
        for (index, link) in self.links.iter().enumerate() {
            link.propagate(&current, &mut next);
            if index != last {
                for value in &mut next {
                    *value = value.tanh();
                }
            }
            std::mem::swap(&mut current, &mut next);
        }
        Ok(current)
    }

    /// Flatten all parameters into one gene vector, link by link, row-major
    /// weights before biases. [`set_genes`](Self::set_genes) is the exact
    /// inverse.
    #[must_use]
    pub fn genes(&self) -> Vec<f32> {
        let mut genes = Vec::with_capacity(self.parameter_count());
        for link in &self.links {
            genes.extend_from_slice(&link.weights);
            genes.extend_from_slice(&link.biases);
        }
        genes
    }

    /// Install a flat gene vector produced by [`genes`](Self::genes) on a
    /// network of identical topology. Freezes the topology.
    pub fn set_genes(&mut self, genes: &[f32]) -> Result<(), GenomeError> {
        let expected = self.parameter_count();
        if genes.len() != expected {
            return Err(GenomeError::LengthMismatch {
                expected,
                actual: genes.len(),
            });
        }
        let mut offset = 0;
        for link in &mut self.links {
            let weight_count = link.weights.len();
            link.weights
                .copy_from_slice(&genes[offset..offset + weight_count]);
            offset += weight_count;
            let bias_count = link.biases.len();
            link.biases
                .copy_from_slice(&genes[offset..offset + bias_count]);
            offset += bias_count;
        }
        self.frozen = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn zeroed_network_outputs_biases_only() {
        let network = NeuralNetwork::with_layers(&[3, 4, 2]).expect("network");
        let out = network.forward(&[1.0, -2.0, 3.0]).expect("forward");
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn parameter_count_matches_topology() {
        let network = NeuralNetwork::with_layers(&[3, 4, 3, 2]).expect("network");
        // (3*4 + 4) + (4*3 + 3) + (3*2 + 2)
        assert_eq!(network.parameter_count(), 39);
    }

    #[test]
    fn gene_round_trip_is_identity() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut network = NeuralNetwork::with_layers(&[3, 4, 3, 2]).expect("network");
        network.randomize(&mut rng, -1.0, 1.0);

        let genes = network.genes();
        assert_eq!(genes.len(), network.parameter_count());

        let mut other = NeuralNetwork::with_layers(&[3, 4, 3, 2]).expect("network");
        other.set_genes(&genes).expect("set_genes");
        assert_eq!(other.genes(), genes);
        assert_eq!(
            other.forward(&[0.5, -0.5, 0.25]).expect("forward"),
            network.forward(&[0.5, -0.5, 0.25]).expect("forward"),
        );
    }

    #[test]
    fn set_genes_rejects_wrong_length() {
        let mut network = NeuralNetwork::with_layers(&[2, 2]).expect("network");
        assert_eq!(
            network.set_genes(&[0.0; 3]),
            Err(GenomeError::LengthMismatch {
                expected: 6,
                actual: 3
            })
        );
    }

    #[test]
    fn topology_freezes_after_weight_installation() {
        let mut rng = SmallRng::seed_from_u64(5);
        let mut network = NeuralNetwork::with_layers(&[2, 2]).expect("network");
        network.randomize(&mut rng, -1.0, 1.0);
        assert_eq!(network.add_layer(3), Err(NetworkError::TopologyFrozen));

        let mut network = NeuralNetwork::with_layers(&[2, 2]).expect("network");
        network.set_genes(&[0.0; 6]).expect("set_genes");
        assert_eq!(network.add_layer(3), Err(NetworkError::TopologyFrozen));
    }

    #[test]
    fn zero_size_layers_are_rejected() {
        let mut network = NeuralNetwork::new();
        assert_eq!(network.add_layer(0), Err(NetworkError::ZeroLayerSize));
    }

    #[test]
    fn forward_validates_dimensions() {
        let network = NeuralNetwork::new();
        assert_eq!(network.forward(&[]), Err(NetworkError::MissingLayers));

        let mut single = NeuralNetwork::new();
        single.add_layer(3).expect("layer");
        assert_eq!(single.forward(&[1.0; 3]), Err(NetworkError::MissingLayers));

        let network = NeuralNetwork::with_layers(&[3, 2]).expect("network");
        assert_eq!(
            network.forward(&[1.0, 2.0]),
            Err(NetworkError::InputMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn hidden_layers_saturate_outputs_stay_linear() {
        let mut network = NeuralNetwork::with_layers(&[1, 2, 1]).expect("network");
        // Large hidden weights saturate tanh at +/-1; the 10x output weights
        // then produce a value far outside [-1, 1].
        network
            .set_genes(&[100.0, 100.0, 0.0, 0.0, 10.0, 10.0, 0.0])
            .expect("set_genes");
        let out = network.forward(&[1.0]).expect("forward");
        assert!((out[0] - 20.0).abs() < 1e-3);
    }

    #[test]
    fn randomize_respects_bounds() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut network = NeuralNetwork::with_layers(&[4, 4, 2]).expect("network");
        network.randomize(&mut rng, -0.5, 0.5);
        assert!(network.genes().iter().all(|g| (-0.5..=0.5).contains(g)));
    }

    #[test]
    fn serde_round_trip() {
        let mut rng = SmallRng::seed_from_u64(11);
        let mut network = NeuralNetwork::with_layers(&[3, 4, 2]).expect("network");
        network.randomize(&mut rng, -1.0, 1.0);
        let json = serde_json::to_string(&network).expect("serialize");
        let back: NeuralNetwork = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, network);
    }
}
