//! Bit-tally telemetry for streamed randomness samples.
//!
//! Each binary message from the randomness source becomes one [`Sample`],
//! which is folded into one [`TrialResult`] (ones/zeros across every bit of
//! every byte) and appended to the run's [`ResultsBundle`] in arrival order.
//!
//! The aggregator performs no I/O and cannot fail.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::config::RawPayload;

/// One chunk of raw bytes from the randomness source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub raw_bytes: Vec<u8>,
    pub received_at_offset_ms: u64,
}

impl Sample {
    /// Build a sample. Returns `None` for an empty chunk, which is not a sample.
    pub fn new(raw_bytes: Vec<u8>, received_at_offset_ms: u64) -> Option<Self> {
        if raw_bytes.is_empty() {
            return None;
        }
        Some(Self {
            raw_bytes,
            received_at_offset_ms,
        })
    }
}

/// Bit statistics for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialResult {
    #[serde(rename = "nbOnes")]
    pub ones_count: u64,
    #[serde(rename = "nbZeros")]
    pub zeros_count: u64,
    #[serde(rename = "ms")]
    pub offset_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numbers: Option<Vec<u8>>,
    #[serde(
        rename = "numbersBase64",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub numbers_base64: Option<String>,
}

impl TrialResult {
    /// Number of bytes this trial covered.
    pub fn byte_len(&self) -> u64 {
        (self.ones_count + self.zeros_count) / 8
    }
}

/// The aggregated outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsBundle {
    /// Wall-clock start of the run, milliseconds since the Unix epoch.
    #[serde(rename = "date")]
    pub started_at: u64,
    #[serde(rename = "isControlRun")]
    pub is_control_run: bool,
    pub trials: Vec<TrialResult>,
}

impl ResultsBundle {
    fn start_now() -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            started_at,
            is_control_run: true,
            trials: Vec::new(),
        }
    }

    /// Total ones across every trial.
    pub fn total_ones(&self) -> u64 {
        self.trials.iter().map(|t| t.ones_count).sum()
    }

    /// Total zeros across every trial.
    pub fn total_zeros(&self) -> u64 {
        self.trials.iter().map(|t| t.zeros_count).sum()
    }
}

/// Count set and clear bits over every byte. Returns `(ones, zeros)`.
pub fn tally(bytes: &[u8]) -> (u64, u64) {
    let ones: u64 = bytes.iter().map(|b| u64::from(b.count_ones())).sum();
    let zeros = 8 * bytes.len() as u64 - ones;
    (ones, zeros)
}

/// Folds samples into a results bundle.
#[derive(Debug)]
pub struct Aggregator {
    raw_payload: RawPayload,
    started: Instant,
    bundle: ResultsBundle,
}

impl Aggregator {
    pub fn new(raw_payload: RawPayload) -> Self {
        Self {
            raw_payload,
            started: Instant::now(),
            bundle: ResultsBundle::start_now(),
        }
    }

    /// Discard the current bundle and start a fresh one stamped with the current time.
    pub fn reset(&mut self) -> &ResultsBundle {
        self.started = Instant::now();
        self.bundle = ResultsBundle::start_now();
        &self.bundle
    }

    /// Wrap raw bytes received now into a [`Sample`] with its offset from bundle start.
    pub fn sample(&self, raw_bytes: Vec<u8>) -> Option<Sample> {
        let offset = self.started.elapsed().as_millis() as u64;
        Sample::new(raw_bytes, offset)
    }

    /// Tally one sample and append the resulting trial.
    pub fn ingest(&mut self, sample: Sample) -> &TrialResult {
        let (ones_count, zeros_count) = tally(&sample.raw_bytes);
        let (numbers, numbers_base64) = match self.raw_payload {
            RawPayload::Omit => (None, None),
            RawPayload::Numbers => (Some(sample.raw_bytes), None),
            RawPayload::Base64 => (None, Some(STANDARD.encode(&sample.raw_bytes))),
        };
        self.bundle.trials.push(TrialResult {
            ones_count,
            zeros_count,
            offset_ms: sample.received_at_offset_ms,
            numbers,
            numbers_base64,
        });
        &self.bundle.trials[self.bundle.trials.len() - 1]
    }

    pub fn trial_count(&self) -> usize {
        self.bundle.trials.len()
    }

    pub fn bundle(&self) -> &ResultsBundle {
        &self.bundle
    }

    /// Seal the bundle for submission.
    pub fn into_bundle(self) -> ResultsBundle {
        self.bundle
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
