//! Synthetic audio input paced in real time.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Interval, MissedTickBehavior};

use super::{Lifecycle, SampleReader};
use crate::errors::BoxError;

/// Samples are produced in blocks of this much audio.
const BLOCK: Duration = Duration::from_millis(10);

/// A sine tone at half of full scale.
#[derive(Debug)]
pub struct SineReader {
    sample_rate: u32,
    frequency: f64,
    amplitude: f64,
    position: u64,
    pending: VecDeque<i32>,
    pace: Option<Interval>,
}

impl SineReader {
    /// Tone of `frequency` Hz sampled at `sample_rate` with `significant_bits` depth.
    pub fn new(sample_rate: u32, frequency: f64, significant_bits: u32) -> Self {
        let full_scale = (1_u64 << significant_bits.clamp(1, 32).saturating_sub(1)) - 1;
        Self {
            sample_rate,
            frequency,
            amplitude: full_scale as f64 * 0.5,
            position: 0,
            pending: VecDeque::new(),
            pace: None,
        }
    }

    fn block_len(&self) -> usize {
        (self.sample_rate as usize / 100).max(1)
    }

    fn fill(&mut self) {
        let rate = f64::from(self.sample_rate.max(1));
        for _ in 0..self.block_len() {
            let t = self.position as f64 / rate;
            let value = self.amplitude * (TAU * self.frequency * t).sin();
            self.pending.push_back(value.round() as i32);
            self.position += 1;
        }
    }
}

#[async_trait]
impl SampleReader for SineReader {
    async fn read_sample(&mut self) -> Result<i32, BoxError> {
        if self.pending.is_empty() {
            let pace = self.pace.get_or_insert_with(paced);
            let _ = pace.tick().await;
            self.fill();
        }
        self.pending
            .pop_front()
            .ok_or_else(|| "sine reader produced no samples".into())
    }

    fn lifecycle(&mut self) -> Option<&mut dyn Lifecycle> {
        Some(self)
    }
}

#[async_trait]
impl Lifecycle for SineReader {
    async fn start(&mut self) -> Result<(), BoxError> {
        self.position = 0;
        self.pending.clear();
        self.pace = Some(paced());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BoxError> {
        self.pace = None;
        Ok(())
    }
}

fn paced() -> Interval {
    let mut interval = tokio::time::interval(BLOCK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
