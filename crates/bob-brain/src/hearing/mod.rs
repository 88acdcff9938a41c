//! Continuous sampling: the Hearing ability.
//!
//! Samples are read one at a time from a [`SampleReader`], buffered, and
//! dispatched as `samples` events once a full chunk has accumulated.

mod sine;

pub use sine::SineReader;

use std::time::Duration;

use async_trait::async_trait;
use bob_core::protocol::{EVENT_SAMPLES, SamplesPayload};
use bob_settings::HearingSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ability::{Ability, EventSink};
use crate::errors::{AbilityError, BoxError};

/// Ability name announced by [`Hearing`].
pub const HEARING: &str = "Hearing";

const DESCRIPTION: &str = "Listens to an audio input and dispatches audio samples";

/// Producer of audio samples.
#[async_trait]
pub trait SampleReader: Send + 'static {
    /// Block until the next sample is available.
    async fn read_sample(&mut self) -> Result<i32, BoxError>;

    /// Start/stop hooks, for producers backed by a device.
    fn lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        None
    }
}

/// Optional start/stop capability of a [`SampleReader`].
#[async_trait]
pub trait Lifecycle: Send {
    /// Open the underlying resource.
    async fn start(&mut self) -> Result<(), BoxError>;
    /// Close the underlying resource.
    async fn stop(&mut self) -> Result<(), BoxError>;
}

/// Audio format and chunking.
#[derive(Clone, Debug, PartialEq)]
pub struct HearingConfig {
    /// Samples per second.
    pub sample_rate: u32,
    /// Duration covered by one dispatched chunk. One second when unset.
    pub dispatch_period: Option<Duration>,
    /// Bit depth of each sample.
    pub significant_bits: u32,
    /// Silence threshold forwarded to consumers.
    pub silence_max_audio_level: f64,
}

impl From<&HearingSettings> for HearingConfig {
    fn from(settings: &HearingSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            dispatch_period: settings.dispatch_period(),
            significant_bits: settings.significant_bits,
            silence_max_audio_level: settings.silence_max_audio_level,
        }
    }
}

impl Default for HearingConfig {
    fn default() -> Self {
        Self::from(&HearingSettings::default())
    }
}

/// Number of samples per dispatched chunk: `floor(rate × period)`.
///
/// Without a period a chunk holds one second of audio. Never less than one.
pub fn chunk_size(sample_rate: u32, dispatch_period: Option<Duration>) -> usize {
    let Some(period) = dispatch_period else {
        return (sample_rate as usize).max(1);
    };
    let samples = u128::from(sample_rate) * period.as_nanos() / 1_000_000_000;
    (samples as usize).max(1)
}

/// Fixed-size accumulator for one chunk.
#[derive(Debug)]
struct SampleBuffer {
    samples: Vec<i32>,
    capacity: usize,
}

impl SampleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample. Returns the full chunk and empties the buffer once
    /// `capacity` samples are held.
    fn push(&mut self, sample: i32) -> Option<Vec<i32>> {
        self.samples.push(sample);
        if self.samples.len() < self.capacity {
            return None;
        }
        let chunk = self.samples.clone();
        self.samples.clear();
        Some(chunk)
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Reads samples continuously and dispatches them in chunks.
pub struct Hearing<R> {
    reader: R,
    config: HearingConfig,
}

impl<R: SampleReader> Hearing<R> {
    /// Hearing over `reader`.
    pub fn new(reader: R, config: HearingConfig) -> Self {
        Self { reader, config }
    }

    /// Samples per dispatched chunk.
    pub fn chunk_size(&self) -> usize {
        chunk_size(self.config.sample_rate, self.config.dispatch_period)
    }

    fn payload(&self, samples: Vec<i32>) -> SamplesPayload {
        SamplesPayload {
            sample_rate: self.config.sample_rate,
            samples,
            significant_bits: self.config.significant_bits,
            silence_max_audio_level: self.config.silence_max_audio_level,
        }
    }
}

#[async_trait]
impl<R: SampleReader> Ability for Hearing<R> {
    fn name(&self) -> &str {
        HEARING
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    async fn acquire(&mut self) -> Result<(), AbilityError> {
        if let Some(lifecycle) = self.reader.lifecycle() {
            lifecycle.start().await.map_err(|source| AbilityError::Acquire {
                ability: HEARING.to_owned(),
                source,
            })?;
        }
        Ok(())
    }

    async fn run(&mut self, cancel: CancellationToken, sink: &EventSink) -> Result<(), AbilityError> {
        let mut buffer = SampleBuffer::new(self.chunk_size());
        debug!(chunk = buffer.capacity, rate = self.config.sample_rate, "hearing loop started");

        loop {
            let sample = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(discarded = buffer.len(), "hearing loop cancelled");
                    return Ok(());
                }
                read = self.reader.read_sample() => read.map_err(AbilityError::Read)?,
            };

            if let Some(chunk) = buffer.push(sample) {
                trace!(samples = chunk.len(), "dispatching chunk");
                sink.emit_data(EVENT_SAMPLES, &self.payload(chunk))?;
            }
        }
    }

    async fn release(&mut self) -> Result<(), AbilityError> {
        if let Some(lifecycle) = self.reader.lifecycle() {
            lifecycle.stop().await.map_err(AbilityError::Release)?;
        }
        Ok(())
    }
}

impl<R> std::fmt::Debug for Hearing<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hearing")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
