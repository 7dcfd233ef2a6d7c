//! Hooks an external auto-tuner drives.
//!
//! The tuner sets one candidate size at a time, asks for the resolved
//! counts, then times a few steps. It never looks inside the resolver.

use std::time::{Duration, Instant};

use crate::comm::Communicator;
use crate::dims::Idx;
use crate::settings::{adjust_settings, LevelCounts, TemporalTiling, TilingLevel};
use crate::solution::Solution;
use crate::tiling_error::TilingError;

/// What one candidate resolved to.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialReport {
    pub counts: LevelCounts,
    pub blocks_per_rank: Idx,
    pub points_per_block: Idx,
    pub flops_per_block: u64,
    pub bind_dim: String,
    pub temporal: TemporalTiling,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TrialTiming {
    pub elapsed: Duration,
    pub steps: u64,
}

impl TrialTiming {
    pub fn steps_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.steps as f64 / secs } else { 0.0 }
    }
}

pub trait TuningTarget {
    /// Set one tile size for the next trial.
    fn set_candidate(&mut self, level: TilingLevel, dim: &str, size: Idx) -> Result<(), TilingError>;

    /// Re-resolve all tiling levels with the current candidates.
    fn resolve_and_report(&mut self) -> Result<TrialReport, TilingError>;

    /// Call `step(i)` for `i = 0, 1, ...` until at least `min_duration` has
    /// passed (and at least once).
    fn measure<F>(&mut self, min_duration: Duration, step: F) -> Result<TrialTiming, TilingError>
    where
        F: FnMut(u64) -> Result<(), TilingError>;

    /// Trial length from the settings.
    fn min_trial_duration(&self) -> Duration;
}

impl<C: Communicator> TuningTarget for Solution<C> {
    /// Block candidates clear the mini-block and sub-block sizes so they are
    /// derived from the new block again. Halo buffers and thread pools are
    /// kept: candidates never change the local domain.
    fn set_candidate(&mut self, level: TilingLevel, dim: &str, size: Idx) -> Result<(), TilingError> {
        if level == TilingLevel::LocalDomain {
            return Err(TilingError::UnknownOption(format!("{level} size is not tunable")));
        }
        self.dims()
            .check_dim_type(dim, "set_candidate", level.allows_step(), true, false)?;
        log::debug!("tuning candidate: {level} size {size} in '{dim}' dimension");
        let domain: Vec<String> = self.dims().domain_dims().names().map(str::to_string).collect();
        let s = &mut self.settings;
        s.sizes_mut(level).set_val(dim, size);
        if level == TilingLevel::Block {
            for d in &domain {
                s.mini_block_sizes.set_val(d, 0);
                s.sub_block_sizes.set_val(d, 0);
            }
        }
        Ok(())
    }

    fn resolve_and_report(&mut self) -> Result<TrialReport, TilingError> {
        let p = self
            .prepared
            .as_ref()
            .ok_or(TilingError::NotPrepared("resolve_and_report"))?;
        // Keep the rank placement found by prepare_solution.
        let mut s = self.settings.clone();
        s.global_sizes = p.plan.sizes.global_sizes.clone();
        s.rank_sizes = p.plan.sizes.rank_sizes.clone();
        s.num_ranks = p.plan.sizes.num_ranks.clone();
        s.rank_indices = p.plan.sizes.rank_indices.clone();
        let plan = adjust_settings(&s, self.stencil.dims())?;

        let points_per_block = plan.points_per_block();
        let report = TrialReport {
            counts: plan.counts.clone(),
            blocks_per_rank: plan.counts.blocks_per_rank(),
            points_per_block,
            flops_per_block: u64::try_from(points_per_block).unwrap_or(0) * self.stencil.fpops_per_point(),
            bind_dim: plan.bind_dim.clone(),
            temporal: plan.temporal(),
        };
        if let Some(p) = self.prepared.as_mut() {
            p.plan = plan;
        }
        Ok(report)
    }

    fn measure<F>(&mut self, min_duration: Duration, mut step: F) -> Result<TrialTiming, TilingError>
    where
        F: FnMut(u64) -> Result<(), TilingError>,
    {
        if self.prepared.is_none() {
            return Err(TilingError::NotPrepared("measure"));
        }
        let start = Instant::now();
        let mut steps = 0;
        loop {
            step(steps)?;
            steps += 1;
            if start.elapsed() >= min_duration {
                break;
            }
        }
        let timing = TrialTiming {
            elapsed: start.elapsed(),
            steps,
        };
        log::debug!(
            "trial: {steps} step(s) in {:.3}s ({:.1} steps/s)",
            timing.elapsed.as_secs_f64(),
            timing.steps_per_sec()
        );
        Ok(timing)
    }

    fn min_trial_duration(&self) -> Duration {
        Duration::from_secs_f64(self.settings.auto_tune_min_secs.max(0.0))
    }
}
