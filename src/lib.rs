// Pulsebeat - PPG signal-to-beat engine
// Per-sensor pipelines turning raw photoplethysmography samples into
// phase-locked, future-timestamped beat events for downstream audio,
// lighting, and visualization consumers.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod osc;
pub mod pipeline;
pub mod testing;
pub mod tunables;

// Re-exports for convenience
pub use analysis::{BeatEvent, Crossing, Sample};
pub use engine::Engine;
pub use pipeline::{SampleBundle, SensorPipeline, WallClock};
