//! Cooperative steps
//!
//! A step does a bounded amount of work and reports whether it made
//! progress. Nothing in this crate spawns threads; the caller interleaves
//! steps (pipeline processing, senders, pollers) in its own loop.

use crate::pipeline::EventPipeline;
use tributary_core::Result;

/// A unit of non-blocking work.
pub trait Step {
    /// Do some work. Returns `true` if anything changed.
    fn execute(&mut self) -> Result<bool>;
}

impl<F> Step for F
where
    F: FnMut() -> Result<bool>,
{
    fn execute(&mut self) -> Result<bool> {
        self()
    }
}

impl Step for EventPipeline {
    /// Progress means an upstream event was transformed or skipped.
    fn execute(&mut self) -> Result<bool> {
        let before = self.upstream_index();
        let processed = self.processor_step()?;
        Ok(processed > 0 || self.upstream_index() != before)
    }
}

/// Run `steps` round-robin until a full round makes no progress. Returns the
/// number of rounds that made progress.
pub fn run_until_idle(steps: &mut [&mut dyn Step]) -> Result<u64> {
    let mut rounds = 0;
    loop {
        let mut progressed = false;
        for step in steps.iter_mut() {
            progressed |= step.execute()?;
        }
        if !progressed {
            return Ok(rounds);
        }
        rounds += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_steps_run_until_idle() {
        let mut a = 3;
        let mut b = 1;
        let mut step_a = || -> Result<bool> {
            if a > 0 {
                a -= 1;
                Ok(true)
            } else {
                Ok(false)
            }
        };
        let mut step_b = || -> Result<bool> {
            if b > 0 {
                b -= 1;
                Ok(true)
            } else {
                Ok(false)
            }
        };
        let mut steps: [&mut dyn Step; 2] = [&mut step_a, &mut step_b];
        let rounds = run_until_idle(&mut steps).unwrap();
        assert_eq!(rounds, 3);
    }

    #[test]
    fn test_step_error_propagates() {
        let mut failing = || -> Result<bool> { Err(tributary_core::Error::transform("boom")) };
        let mut steps: [&mut dyn Step; 1] = [&mut failing];
        assert!(run_until_idle(&mut steps).is_err());
    }
}
