//! The outer time-integration loop. Each timestep predicts the face
//! velocities, runs the pressure solve, and rotates the generations. A
//! timestep the solve asked to restart is thrown away and redone from the
//! same old generation with half the step size.

use crate::config::RunConfig;
use crate::data_store::{Warehouses, WhichDw};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::load_balancer::{ContiguousLoadBalancer, Distribution};
use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
use crate::message::Communicator;
use crate::pressure::{kernels, PressureSolve};
use crate::ranks;
use crate::scheduler::{PatchSelection, Processor, Scheduler};
use crate::solver::{JacobiSolver, LinearSolver};
use log::{info, warn};
use std::sync::Arc;




/**
 * How an attempted timestep ended
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    /// The step completed and the generations were rotated.
    Advanced,

    /// The step was thrown away; the old generation is untouched.
    Restarted,
}




/**
 * What a completed timestep looked like, as seen by every rank
 */
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub dt: f64,
    pub retries: usize,
    pub max_rhs: f64,
}




/**
 * Runs the pressure solve forward in time on a fixed grid
 */
pub struct Driver {
    config: RunConfig,
    grid: Grid,
    solve: PressureSolve,
}




// ============================================================================
impl Driver {


    /**
     * A driver for one velocity material, using the reference Jacobi
     * solver.
     */
    pub fn new(config: RunConfig) -> Self {
        Self::with_solver(config, Arc::new(JacobiSolver), MaterialSubset::single(0))
    }


    pub fn with_solver(config: RunConfig, solver: Arc<dyn LinearSolver>, vel_matls: MaterialSubset) -> Self {
        let grid = config.grid();
        let solve = PressureSolve::new(config.solve.clone(), solver, vel_matls);
        Self { config, grid, solve }
    }


    pub fn grid(&self) -> &Grid {
        &self.grid
    }


    pub fn config(&self) -> &RunConfig {
        &self.config
    }


    /**
     * Launch one thread per rank and run every timestep. Returns the
     * reports of rank 0, which agree with every other rank's.
     */
    pub fn run(&self) -> Result<Vec<StepReport>> {
        let mut reports = ranks::launch(self.config.num_ranks, self.config.pin_threads, |comm| self.run_rank(comm))?;
        Ok(reports.swap_remove(0))
    }


    /**
     * Run every timestep on one rank.
     */
    pub fn run_rank(&self, comm: &dyn Communicator) -> Result<Vec<StepReport>> {
        let lb = ContiguousLoadBalancer::new(self.config.num_ranks);
        let mut distribution = Distribution::new(&lb, &self.grid, None, comm.rank(), self.config.max_ghost);
        let mut stores = Warehouses::new(self.config.max_ghost);
        let mut dt = self.config.initial_dt;
        let mut reports = Vec::with_capacity(self.config.steps);

        self.initialize(&mut stores, Processor { grid: &self.grid, distribution: &distribution, comm })?;

        for step in 0..self.config.steps {
            let processor = Processor { grid: &self.grid, distribution: &distribution, comm };
            let mut retries = 0;

            if comm.rank() == 0 {
                info!("timestep {} begins with dt {:e}", step, dt);
            }
            let max_rhs = loop {
                match self.step(&mut stores, processor, dt)? {
                    (StepOutcome::Advanced, max_rhs) => break max_rhs,
                    (StepOutcome::Restarted, _) => {
                        if dt <= self.config.min_dt {
                            return Err(Error::TimestepRestartLimit { step, dt });
                        }
                        dt = (0.5 * dt).max(self.config.min_dt);
                        retries += 1;

                        if comm.rank() == 0 {
                            warn!("timestep {} restarted, retrying with dt {:e}", step, dt);
                        }
                    }
                }
            };
            if comm.rank() == 0 {
                info!("timestep {} done after {} retries, max_rhs {:e}", step, retries, max_rhs);
            }
            reports.push(StepReport { step, dt, retries, max_rhs });
            distribution.possibly_dynamically_reallocate(&lb, &self.grid, None, false);
        }
        Ok(reports)
    }


    /**
     * Fill the first old generation: zero pressure and velocities.
     */
    pub fn initialize(&self, stores: &mut Warehouses, processor: Processor) -> Result<()> {
        let l = self.solve.labels();
        let vel = self.solve.vel_matls().clone();
        let mut sched = Scheduler::new();

        sched.add_task(kernels::initialize(l, &vel), PatchSelection::Grid, vel)?;
        sched.compile()?;
        sched.execute(stores, processor)?;
        sched.advance_data_warehouse(stores);
        Ok(())
    }


    /**
     * Attempt one timestep of size `dt`. On success the generations are
     * rotated and the largest right-hand side left by the solve is
     * returned alongside the outcome. On a restart the new generation is
     * discarded.
     */
    pub fn step(&self, stores: &mut Warehouses, processor: Processor, dt: f64) -> Result<(StepOutcome, f64)> {
        let l = self.solve.labels();
        let vel = self.solve.vel_matls().clone();

        stores
            .at_mut(0, WhichDw::Old)
            .ok_or_else(|| Error::contract("driver", "no old generation to step from"))?
            .set_reduction(l.del_t, OUT_OF_DOMAIN, dt);

        let mut sched = Scheduler::new();
        sched.add_task(kernels::compute_vel_fc(l, &vel), PatchSelection::Grid, vel)?;
        self.solve.schedule_setup(&self.grid, &mut sched)?;
        self.solve.schedule_solve(&mut sched)?;
        self.solve.schedule_finalize(&mut sched)?;
        sched.compile()?;
        sched.execute(stores, processor)?;

        let new = stores
            .at(0, WhichDw::New)
            .ok_or_else(|| Error::contract("driver", "no new generation after the step"))?;

        if new.timestep_restarted() {
            stores.discard_new(0);
            return Ok((StepOutcome::Restarted, f64::NAN));
        }
        let max_rhs = new.reduction(l.max_rhs, OUT_OF_DOMAIN, "driver")?;
        sched.advance_data_warehouse(stores);
        Ok((StepOutcome::Advanced, max_rhs))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Driver, StepOutcome};
    use crate::config::{RunConfig, SolveConfig};
    use crate::data_store::{Warehouses, WhichDw as Dw};
    use crate::error::Error;
    use crate::load_balancer::Distribution;
    use crate::material::OUT_OF_DOMAIN;
    use crate::message::LocalCommunicator;
    use crate::scheduler::Processor;
    use crate::solver::SolverParams;

    fn small(num_ranks: usize) -> RunConfig {
        RunConfig {
            num_ranks,
            steps: 2,
            domain_cells: [8, 8, 8],
            fine_region: [[2, 6], [2, 6], [2, 6]],
            patch_size: [4, 4, 4],
            solve: SolveConfig {
                max_outer_iterations: 1,
                solver: SolverParams { sweeps: 20, ..Default::default() },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn run_advances_every_step() {
        let reports = Driver::new(small(1)).run().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.retries == 0 && r.dt == 0.01 && r.max_rhs.is_finite()));
    }

    #[test]
    fn ranks_agree_on_the_residual() {
        let serial = Driver::new(small(1)).run().unwrap();
        let parallel = Driver::new(small(2)).run().unwrap();

        for (a, b) in serial.iter().zip(&parallel) {
            assert!((a.max_rhs - b.max_rhs).abs() <= 1e-12 * a.max_rhs.abs().max(1.0));
        }
    }

    #[test]
    fn a_restarted_step_leaves_the_old_generation_alone() {
        let mut config = small(1);
        config.solve.restart_threshold = 0;
        let driver = Driver::new(config);
        let comm = LocalCommunicator::group(1).remove(0);
        let dist = Distribution::serial(driver.grid());
        let processor = Processor { grid: driver.grid(), distribution: &dist, comm: &comm };
        let mut stores = Warehouses::new(2);

        driver.initialize(&mut stores, processor).unwrap();
        let old = stores.at(0, Dw::Old).unwrap().generation();

        let (outcome, _) = driver.step(&mut stores, processor, 0.01).unwrap();
        assert_eq!(outcome, StepOutcome::Restarted);
        assert_eq!(stores.at(0, Dw::Old).unwrap().generation(), old);
        assert!(stores.at(0, Dw::New).unwrap().is_empty());
        assert_eq!(stores.at(0, Dw::Old).unwrap().get_reduction(driver.solve.labels().del_t, OUT_OF_DOMAIN), Some(0.01));
    }

    #[test]
    fn restarting_at_the_smallest_step_is_fatal() {
        let mut config = small(1);
        config.solve.restart_threshold = 0;
        config.min_dt = 0.0025;

        match Driver::new(config).run() {
            Err(Error::TimestepRestartLimit { step: 0, dt }) => assert_eq!(dt, 0.0025),
            other => panic!("expected a restart limit, got {:?}", other),
        }
    }
}
