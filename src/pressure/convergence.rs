use crate::config::SolveConfig;
use crate::error::{Error, Result};
use std::fmt;




/**
 * Why an outer iteration asked for the timestep to be restarted
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RestartReason {
    ThresholdReached,
    SolverRequested,
    Diverging,
}




/**
 * What the outer loop should do after an iteration
 */
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Continue,
    Converged,
    Restart(Vec<RestartReason>),
    Exhausted,
}




/**
 * Tracks the residual history of the outer iterations and decides when to
 * stop: on convergence, on exhausting the iteration budget, or on one of
 * the restart triggers.
 */
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    max_iterations: usize,
    restart_threshold: usize,
    tolerance: f64,
    divergence_factor: f64,
    iteration: usize,
    residual: f64,
    smallest: f64,
}




// ============================================================================
impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ThresholdReached => write!(f, "the number of iterations exceeded the restart threshold"),
            Self::SolverRequested => write!(f, "the linear solver requested a restart"),
            Self::Diverging => write!(f, "the outer iteration is diverging"),
        }
    }
}




// ============================================================================
impl ConvergenceMonitor {


    pub fn new(config: &SolveConfig) -> Self {
        Self {
            max_iterations: config.max_outer_iterations,
            restart_threshold: config.restart_threshold,
            tolerance: config.outer_tolerance,
            divergence_factor: config.divergence_factor,
            iteration: 0,
            residual: f64::INFINITY,
            smallest: f64::INFINITY,
        }
    }


    pub fn iteration(&self) -> usize {
        self.iteration
    }


    pub fn residual(&self) -> f64 {
        self.residual
    }


    pub fn smallest(&self) -> f64 {
        self.smallest
    }


    /**
     * Whether another outer iteration should run.
     */
    pub fn should_iterate(&self) -> bool {
        self.iteration < self.max_iterations && self.residual > self.tolerance
    }


    /**
     * Record the residual after an iteration, and whether the linear solver
     * asked for a restart during it.
     */
    pub fn record(&mut self, residual: f64, solver_restart: bool) -> Verdict {
        self.iteration += 1;
        self.residual = residual;
        self.smallest = self.smallest.min(residual);

        let mut reasons = Vec::new();

        if self.iteration > self.restart_threshold {
            reasons.push(RestartReason::ThresholdReached);
        }
        if solver_restart {
            reasons.push(RestartReason::SolverRequested);
        }
        if !residual.is_finite() || residual - self.smallest > self.divergence_factor * self.smallest {
            reasons.push(RestartReason::Diverging);
        }

        if !reasons.is_empty() {
            Verdict::Restart(reasons)
        } else if residual <= self.tolerance {
            Verdict::Converged
        } else if self.iteration >= self.max_iterations {
            Verdict::Exhausted
        } else {
            Verdict::Continue
        }
    }


    /**
     * Fail if the iteration budget ran out with the residual still above
     * tolerance. A solve that ran a single iteration is let through.
     */
    pub fn check_exhausted(&self) -> Result<()> {
        if self.iteration == self.max_iterations && self.residual > self.tolerance && self.iteration > 1 {
            Err(Error::ConvergenceFailure {
                iterations: self.iteration,
                residual: self.residual,
                tolerance: self.tolerance,
            })
        } else {
            Ok(())
        }
    }
}
