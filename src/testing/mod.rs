//! Deterministic signal synthesis shared by the test suite and the `synth`
//! command. Everything here is seeded or purely periodic; two runs produce
//! identical streams.

pub mod signals;

pub use signals::{bundles_from_samples, clipped_square, noise_floor, pulse_wave};
