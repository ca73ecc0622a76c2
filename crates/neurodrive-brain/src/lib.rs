//! Concrete controller implementations for neurodrive agents.
//!
//! [`network`] holds the layered feed-forward network and its flat gene
//! encoding; [`controllers`] wires it (plus a random baseline and a manual
//! variant) into the core crate's `Controller` trait.

pub mod controllers;
pub mod network;

pub use controllers::{ManualController, ManualInput, NeuralController, RandomController};
pub use network::{NetworkError, NeuralNetwork};
