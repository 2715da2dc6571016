//! Ramp profile and the arrival-rate curve derived from it

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// Floating point slack when converting the rate integral to whole starts
const INTEGRAL_EPSILON: f64 = 1e-9;

/// One stage of the arrival-rate ramp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Rate reached at the end of the stage, per `time_unit`
    pub target: f64,

    /// How long the ramp towards `target` takes
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Stage {
    pub fn new(target: f64, duration: Duration) -> Self {
        Self { target, duration }
    }
}

/// Staged arrival-rate profile with its worker pool bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampProfile {
    /// Rate at the start of the first stage, per `time_unit`
    pub start_rate: f64,

    /// Unit all rates are expressed in
    #[serde(with = "humantime_serde")]
    pub time_unit: Duration,

    /// Workers instantiated before the first tick
    pub preallocated_workers: usize,

    /// Ceiling the pool may grow to
    pub max_workers: usize,

    /// Stages, consumed in order
    pub stages: Vec<Stage>,
}

impl Default for RampProfile {
    fn default() -> Self {
        Self {
            start_rate: 10.0,
            time_unit: Duration::from_secs(1),
            preallocated_workers: 50,
            max_workers: 2000,
            stages: vec![Stage::new(10_000.0, Duration::from_secs(600))],
        }
    }
}

impl RampProfile {
    /// Check every profile invariant
    pub fn validate(&self) -> Result<()> {
        if self.time_unit.is_zero() {
            return Err(LoadError::InvalidProfile("time_unit must be non-zero".into()));
        }
        if !self.start_rate.is_finite() || self.start_rate < 0.0 {
            return Err(LoadError::InvalidProfile(format!(
                "start_rate must be a non-negative number, got {}",
                self.start_rate
            )));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if !stage.target.is_finite() || stage.target < 0.0 {
                return Err(LoadError::InvalidProfile(format!(
                    "stage {} target must be a non-negative number, got {}",
                    i, stage.target
                )));
            }
        }
        if self.max_workers == 0 {
            return Err(LoadError::InvalidProfile("max_workers must be at least 1".into()));
        }
        if self.preallocated_workers > self.max_workers {
            return Err(LoadError::InvalidProfile(format!(
                "preallocated_workers ({}) exceeds max_workers ({})",
                self.preallocated_workers, self.max_workers
            )));
        }
        Ok(())
    }

    /// Total wall time covered by the stages
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

/// A single linear piece of the rate curve, in starts per second
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    stage: usize,
    offset: f64,
    duration: f64,
    from: f64,
    to: f64,
}

impl Segment {
    fn rate_at(&self, local: f64) -> f64 {
        self.from + (self.to - self.from) * (local / self.duration)
    }

    /// Integral of the rate over `[0, local]`
    fn area_until(&self, local: f64) -> f64 {
        let local = local.clamp(0.0, self.duration);
        self.from * local + 0.5 * ((self.to - self.from) / self.duration) * local * local
    }
}

/// Piecewise-linear arrival-rate curve built from a [`RampProfile`]
#[derive(Debug, Clone, PartialEq)]
pub struct RampSchedule {
    segments: Vec<Segment>,
    total: f64,
}

impl RampSchedule {
    pub fn from_profile(profile: &RampProfile) -> Self {
        let unit = profile.time_unit.as_secs_f64();
        let mut segments = Vec::with_capacity(profile.stages.len());
        let mut offset = 0.0;
        let mut previous = profile.start_rate / unit;

        for (stage, s) in profile.stages.iter().enumerate() {
            let duration = s.duration.as_secs_f64();
            if duration <= 0.0 {
                continue;
            }
            let to = s.target / unit;
            segments.push(Segment {
                stage,
                offset,
                duration,
                from: previous,
                to,
            });
            offset += duration;
            previous = to;
        }

        Self {
            segments,
            total: offset,
        }
    }

    /// Length of the schedule
    pub fn total_duration(&self) -> Duration {
        Duration::from_secs_f64(self.total)
    }

    fn segment_at(&self, t: f64) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| t >= s.offset && t < s.offset + s.duration)
    }

    /// Index of the profile stage active at `elapsed`, `None` once exhausted
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        self.segment_at(elapsed.as_secs_f64()).map(|s| s.stage)
    }

    /// Instantaneous target rate in starts per second
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64();
        self.segment_at(t)
            .map(|s| s.rate_at(t - s.offset))
            .unwrap_or(0.0)
    }

    /// Integral of the rate curve over `[0, elapsed]`
    pub fn expected_starts(&self, elapsed: Duration) -> f64 {
        let t = elapsed.as_secs_f64().min(self.total);
        self.segments
            .iter()
            .take_while(|s| s.offset < t)
            .map(|s| s.area_until(t - s.offset))
            .sum()
    }

    /// Whole iteration starts due by `elapsed`
    pub fn due_by(&self, elapsed: Duration) -> u64 {
        (self.expected_starts(elapsed) + INTEGRAL_EPSILON).floor() as u64
    }
}
