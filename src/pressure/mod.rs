//! The multi-level implicit pressure solve. Each timestep the right-hand
//! side is built from the predicted face velocities and refluxed across the
//! coarse/fine interfaces. Then a single once-per-processor task drives a
//! private scheduler through outer iterations: build the matrix, solve for
//! a pressure increment on every level at once, coarsen it under the fine
//! patches, correct the face velocities, and rebuild and reflux the
//! right-hand side. The outer loop ends on convergence, on exhausting its
//! budget (fatal), or with a request that the timestep be restarted.

pub mod convergence;
pub mod kernels;
pub mod matrix;
pub mod reflux;

use crate::config::SolveConfig;
use crate::context::ProcContext;
use crate::data_store::{ScrubMode, Warehouses, WhichDw};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::index_space::Axis;
use crate::label::{Label, ReductionOp};
use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
use crate::patch::PatchId;
use crate::scheduler::{PatchSelection, Scheduler};
use crate::solver::{LinearSolver, SystemKey};
use crate::task::{Dependency, Task};
use convergence::{ConvergenceMonitor, Verdict};
use log::{debug, info, warn};
use std::sync::Arc;




/**
 * The labels of every quantity the pressure solve reads or writes
 */
#[derive(Clone, Copy, Debug)]
pub struct Labels {
    pub press_cc: Label,
    pub sum_imp_del_p: Label,
    pub imp_del_p: Label,
    pub del_p: Label,
    pub rhs: Label,
    pub matrix: Label,
    pub max_rhs: Label,
    pub del_t: Label,

    /// Predicted face velocities, before the pressure correction.
    pub vel_fc: [Label; 3],

    /// Face velocities after the pressure correction.
    pub vel_fcme: [Label; 3],

    /// Fine-side flux corrections on coarse/fine interface faces.
    pub reflux_flux: [Label; 3],
}




/**
 * Schedules the pressure solve for a set of materials, with a given linear
 * solver
 */
#[derive(Clone)]
pub struct PressureSolve {
    labels: Labels,
    config: SolveConfig,
    solver: Arc<dyn LinearSolver>,
    vel_matls: MaterialSubset,
}




// ============================================================================
impl Labels {
    pub fn new() -> Self {
        let faces = |prefix: &str| {
            let names = [("u", Axis::I), ("v", Axis::J), ("w", Axis::K)];
            names.map(|(c, axis)| Label::face(&format!("{}vel_{}", c, prefix), axis))
        };
        Self {
            press_cc: Label::cell("press_CC"),
            sum_imp_del_p: Label::cell("sum_imp_delP"),
            imp_del_p: Label::cell("imp_delP"),
            del_p: Label::cell("del_P"),
            rhs: Label::cell("rhs"),
            matrix: Label::stencil("matrix"),
            max_rhs: Label::reduction("max_RHS", ReductionOp::Max),
            del_t: Label::reduction("delT", ReductionOp::Min),
            vel_fc: faces("FC"),
            vel_fcme: faces("FCME"),
            reflux_flux: [
                Label::face("reflux_flux_X", Axis::I),
                Label::face("reflux_flux_Y", Axis::J),
                Label::face("reflux_flux_Z", Axis::K),
            ],
        }
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self::new()
    }
}




// ============================================================================
impl PressureSolve {


    pub fn new(config: SolveConfig, solver: Arc<dyn LinearSolver>, vel_matls: MaterialSubset) -> Self {
        Self {
            labels: Labels::new(),
            config,
            solver,
            vel_matls,
        }
    }


    pub fn labels(&self) -> &Labels {
        &self.labels
    }


    pub fn config(&self) -> &SolveConfig {
        &self.config
    }


    pub fn vel_matls(&self) -> &MaterialSubset {
        &self.vel_matls
    }


    /**
     * Schedule the right-hand side from the predicted face velocities, the
     * reflux of it across every coarse/fine interface, and its maximum.
     */
    pub fn schedule_setup(&self, grid: &Grid, sched: &mut Scheduler) -> Result<()> {
        let l = &self.labels;
        let task = kernels::setup_rhs(l, l.vel_fc, &self.vel_matls, true);
        sched.add_task(task, PatchSelection::Grid, self.vel_matls.clone())?;
        self.schedule_reflux(grid, sched, l.vel_fc)?;
        sched.add_task(kernels::compute_max_rhs(l), PatchSelection::Grid, press())
    }


    /**
     * Schedule the once-per-processor task running the outer iterations.
     * It reads the right-hand side and the predicted velocities from the new
     * generation, and leaves there the pressure, the corrected velocities,
     * and the flux corrections computed from them.
     */
    pub fn schedule_solve(&self, sched: &mut Scheduler) -> Result<()> {
        let l = self.labels;
        let this = self.clone();

        let mut task = Task::once_per_proc("implicit_pressure_solve", move |ctx| this.outer_iterations(ctx))
            .with_sub_scheduler()
            .requires(WhichDw::New, l.rhs, 0)
            .requires(WhichDw::New, l.max_rhs, 0)
            .requires(WhichDw::New, l.sum_imp_del_p, 0)
            .requires(WhichDw::Old, l.press_cc, 0)
            .requires(WhichDw::Old, l.del_t, 0)
            .computes(l.press_cc)
            .modifies(l.rhs)
            .modifies(l.sum_imp_del_p);

        for axis in 0..3 {
            task = task
                .require(Dependency::new(WhichDw::New, l.vel_fc[axis]).matls(self.vel_matls.clone()))
                .computes_matls(l.vel_fcme[axis], self.vel_matls.clone())
                .modifies_matls(l.reflux_flux[axis], press());
        }
        sched.add_task(task, PatchSelection::Grid, press())
    }


    /**
     * Schedule the pressure increment over the whole timestep.
     */
    pub fn schedule_finalize(&self, sched: &mut Scheduler) -> Result<()> {
        sched.add_task(kernels::compute_del_p(&self.labels), PatchSelection::Grid, press())
    }


    /**
     * Schedule the fine-side flux corrections on every level but the
     * coarsest, and their application on the level below.
     */
    fn schedule_reflux(&self, grid: &Grid, sched: &mut Scheduler, vel: [Label; 3]) -> Result<()> {
        for fine in 1..grid.num_levels() {
            let compute = reflux::compute_reflux_fluxes(&self.labels, vel, &self.vel_matls);
            let apply = reflux::apply_reflux_fluxes(&self.labels, vel, &self.vel_matls);
            sched.add_task(compute, PatchSelection::Level(fine), self.vel_matls.clone())?;
            sched.add_task(apply, PatchSelection::Level(fine - 1), self.vel_matls.clone())?;
        }
        Ok(())
    }


    /**
     * Add the task graph of one outer iteration to the private scheduler.
     * The matrix is built on the first iteration and carried over after.
     */
    fn schedule_iteration(&self, grid: &Grid, sched: &mut Scheduler, first: bool) -> Result<()> {
        let l = &self.labels;
        let weight = self.vel_matls.len() as f64;
        let coarse_levels = 0..grid.num_levels() - 1;

        if first {
            sched.add_task(matrix::setup_matrix(l, WhichDw::ParentOld, weight), PatchSelection::Grid, press())?;

            for level in coarse_levels.clone() {
                sched.add_task(matrix::zero_matrix_under_fine_patches(l), PatchSelection::Level(level), press())?;
                sched.add_task(matrix::matrix_bc_cfi_coarse_patch(l), PatchSelection::Level(level), press())?;
            }
        } else {
            sched.add_task(matrix::carry_matrix(l), PatchSelection::Grid, press())?;
        }

        self.solver.schedule_solve(
            grid,
            sched,
            &press(),
            SystemKey::new(l.matrix, WhichDw::New),
            l.imp_del_p,
            true,
            SystemKey::new(l.rhs, WhichDw::Old),
            None,
            &self.config.solver)?;

        for level in coarse_levels.rev() {
            sched.add_task(kernels::coarsen_del_p(l), PatchSelection::Level(level), press())?;
        }
        sched.add_task(kernels::update_pressure(l), PatchSelection::Grid, press())?;
        sched.add_task(kernels::recompute_vel_fc(l, &self.vel_matls), PatchSelection::Grid, self.vel_matls.clone())?;
        sched.add_task(kernels::setup_rhs(l, l.vel_fcme, &self.vel_matls, false), PatchSelection::Grid, self.vel_matls.clone())?;
        self.schedule_reflux(grid, sched, l.vel_fcme)?;
        sched.add_task(kernels::compute_max_rhs(l), PatchSelection::Grid, press())
    }


    fn outer_iterations(&self, ctx: &mut ProcContext) -> Result<()> {
        let l = &self.labels;
        let name = ctx.task_name();
        let processor = ctx.processor();
        let grid = ctx.grid();
        let rank = ctx.distribution().rank();
        let patches: Vec<PatchId> = ctx.patches().iter().map(|p| p.id()).collect();
        let parent_old = ctx.dw_index(WhichDw::Old)?;
        let parent_new = ctx.dw_index(WhichDw::New)?;
        let depth = ctx.depth() + 1;
        let mut sub = ctx.create_sub_scheduler()?;

        let mut scrubbed = ctx.stores_mut().scrub(&[parent_old, parent_new], ScrubMode::None);
        let mut stores = scrubbed.nest(depth);

        sub.advance_data_warehouse(&mut stores);
        let sub_new = generation(&sub, &stores, WhichDw::New, name)?;

        for &label in &[l.max_rhs, l.sum_imp_del_p, l.rhs] {
            stores.transfer(parent_new, sub_new, label, &patches, &press(), false)?;
        }

        let mut monitor = ConvergenceMonitor::new(&self.config);
        let mut restart = false;

        while monitor.should_iterate() {
            sub.initialize();
            self.schedule_iteration(grid, &mut sub, monitor.iteration() == 0)?;
            sub.compile()?;
            sub.advance_data_warehouse(&mut stores);

            let old = generation(&sub, &stores, WhichDw::Old, name)?;
            let new = generation(&sub, &stores, WhichDw::New, name)?;
            {
                let mut old_scrubbed = stores.scrub(&[old], ScrubMode::Complete);
                let mut new_scrubbed = old_scrubbed.scrub(&[new], ScrubMode::None);
                sub.execute(&mut new_scrubbed, processor)?;
            }
            let before = stores.get_dw(old).reduction(l.max_rhs, OUT_OF_DOMAIN, name)?;
            let after = stores.get_dw(new).reduction(l.max_rhs, OUT_OF_DOMAIN, name)?;
            let verdict = monitor.record(after, stores.get_dw(new).timestep_restarted());

            if rank == 0 {
                info!("Outer iteration {} max_rhs before solve {:e} after solve {:e}", monitor.iteration(), before, after);
            }
            if let Verdict::Restart(reasons) = verdict {
                if rank == 0 {
                    for reason in &reasons {
                        warn!("restarting the timestep after outer iteration {}: {}", monitor.iteration(), reason);
                    }
                }
                restart = true;
                break;
            }
        }

        if restart {
            let parent = stores.get_dw_mut(parent_new);
            parent.abort_timestep();
            parent.restart_timestep();
        } else {
            monitor.check_exhausted()?;
        }
        debug!("rank {} transferring solve products after {} outer iterations", rank, monitor.iteration());

        let sub_new = generation(&sub, &stores, WhichDw::New, name)?;

        for &label in &[l.press_cc, l.sum_imp_del_p, l.rhs] {
            stores.transfer(sub_new, parent_new, label, &patches, &press(), true)?;
        }
        for &label in &l.vel_fcme {
            stores.transfer(sub_new, parent_new, label, &patches, &self.vel_matls, true)?;
        }
        let fine: Vec<PatchId> = patches.iter().copied().filter(|&p| grid.patch(p).level() > 0).collect();

        for &label in &l.reflux_flux {
            stores.transfer(sub_new, parent_new, label, &fine, &press(), true)?;
        }
        Ok(())
    }
}

/// Look up the arena index of one of a scheduler's generations.
///
fn generation(sched: &Scheduler, stores: &Warehouses, which: WhichDw, task: &str) -> Result<usize> {
    sched
        .get_dw(stores, which)
        .ok_or_else(|| Error::contract(task, format!("no {:?} generation at depth {}", which, sched.depth())))
}

/// The material subset of whole-domain quantities: pressure, the matrix,
/// and the right-hand side.
///
fn press() -> MaterialSubset {
    MaterialSubset::out_of_domain()
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{kernels, Labels, PressureSolve};
    use crate::config::SolveConfig;
    use crate::error::{Error, Result};
    use crate::data_store::{ScrubMode, Warehouses, WhichDw as Dw};
    use crate::grid::test::two_level_grid;
    use crate::grid::Grid;
    use crate::load_balancer::{ContiguousLoadBalancer, Distribution, MAX_GHOST};
    use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
    use crate::message::{Communicator, LocalCommunicator};
    use crate::pressure::reflux::face_index;
    use crate::ranks;
    use crate::scheduler::{PatchSelection, Processor, Scheduler};
    use crate::solver::{JacobiSolver, SolverParams};
    use std::sync::Arc;

    fn solve_config(max_outer_iterations: usize, sweeps: usize) -> SolveConfig {
        SolveConfig {
            max_outer_iterations,
            restart_threshold: 5,
            outer_tolerance: 1e-6,
            solver: SolverParams { sweeps, ..Default::default() },
            ..Default::default()
        }
    }

    /// Fill the first old generation of one rank, with a step size of 0.1.
    ///
    fn initialize_on(solve: &PressureSolve, processor: Processor, stores: &mut Warehouses) -> Result<()> {
        let l = solve.labels();
        let vel = solve.vel_matls().clone();
        let mut init = Scheduler::new();
        init.add_task(kernels::initialize(l, &vel), PatchSelection::Grid, vel)?;
        init.compile()?;
        init.execute(stores, processor)?;
        init.advance_data_warehouse(stores);
        stores.at_mut(0, Dw::Old).unwrap().set_reduction(l.del_t, OUT_OF_DOMAIN, 0.1);
        Ok(())
    }

    /// Run one timestep of the solve on one rank: the predicted velocities,
    /// the setup, the solve itself, and the finalize.
    ///
    fn step_on(grid: &Grid, solve: &PressureSolve, processor: Processor, stores: &mut Warehouses) -> Result<()> {
        let l = solve.labels();
        let vel = solve.vel_matls().clone();
        let mut sched = Scheduler::new();
        sched.add_task(kernels::compute_vel_fc(l, &vel), PatchSelection::Grid, vel.clone())?;
        solve.schedule_setup(grid, &mut sched)?;
        solve.schedule_solve(&mut sched)?;
        solve.schedule_finalize(&mut sched)?;
        sched.compile()?;
        sched.execute(stores, processor)
    }

    /// Returns, per rank, the right-hand side maximum before and after the
    /// solve, the pressure on the owned patches, and whether a restart was
    /// requested.
    ///
    fn one_step(grid: &Grid, num_ranks: usize, config: SolveConfig) -> Result<Vec<(f64, f64, Vec<f64>, bool)>> {
        let lb = ContiguousLoadBalancer::new(num_ranks);
        let solve = PressureSolve::new(config, Arc::new(JacobiSolver), MaterialSubset::single(0));
        let l: Labels = *solve.labels();

        ranks::launch(num_ranks, false, |comm| {
            let dist = Distribution::new(&lb, grid, None, comm.rank(), MAX_GHOST);
            let processor = Processor { grid, distribution: &dist, comm };
            let mut stores = Warehouses::new(MAX_GHOST);
            initialize_on(&solve, processor, &mut stores)?;
            step_on(grid, &solve, processor, &mut stores)?;

            let new = stores.at(0, Dw::New).unwrap();
            let before = new.reduction(l.max_rhs, OUT_OF_DOMAIN, "test")?;
            let mut after = 0.0_f64;
            let mut pressure = Vec::new();

            for patch in dist.local_patches(grid, None) {
                let rhs = new.get_ref::<f64>(l.rhs, OUT_OF_DOMAIN, patch.id(), "test")?;
                for c in patch.cells().iter() {
                    if !grid.is_under_finer(patch.level(), c) {
                        after = after.max(rhs[c].abs());
                    }
                }
                let press = new.get_ref::<f64>(l.press_cc, OUT_OF_DOMAIN, patch.id(), "test")?;
                pressure.extend_from_slice(press.as_slice());
                assert!(new.contains(l.del_p, OUT_OF_DOMAIN, patch.id()));
            }
            Ok((before, after, pressure, new.timestep_restarted()))
        })
    }

    #[test]
    fn solve_reduces_the_right_hand_side() {
        let grid = two_level_grid();
        let result = one_step(&grid, 1, solve_config(1, 300)).unwrap();
        let (before, after, _, restarted) = &result[0];
        assert!(!restarted);
        assert!(*before > 0.0);
        assert!(after < before);
    }

    #[test]
    fn serial_and_parallel_solves_agree() {
        let grid = two_level_grid();
        let serial = one_step(&grid, 1, solve_config(1, 20)).unwrap();
        let parallel = one_step(&grid, 3, solve_config(1, 20)).unwrap();
        let joined: Vec<f64> = parallel.iter().flat_map(|r| r.2.clone()).collect();

        assert_eq!(serial[0].2.len(), joined.len());
        for (a, b) in serial[0].2.iter().zip(&joined) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!(parallel.iter().all(|r| r.0 == serial[0].0 && r.3 == serial[0].3));
    }

    #[test]
    fn flux_corrections_follow_the_corrected_velocities() {
        let grid = two_level_grid();
        let solve = PressureSolve::new(solve_config(1, 20), Arc::new(JacobiSolver), MaterialSubset::single(0));
        let l = *solve.labels();
        let dist = Distribution::serial(&grid);
        let comm = LocalCommunicator::group(1).remove(0);
        let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };
        let mut stores = Warehouses::new(MAX_GHOST);
        initialize_on(&solve, processor, &mut stores).unwrap();
        step_on(&grid, &solve, processor, &mut stores).unwrap();
        let new = stores.at(0, Dw::New).unwrap();

        let fine = grid.patch(8);
        let dx = grid.level(1).spacing();
        let mut stale = false;

        for link in grid.cfi_links(fine) {
            let a = link.face.axis().dim();
            let f = face_index(link.fine_cell, link.face);
            let sign = link.face.sign() as f64;
            let corrected = new.get_ref::<f64>(l.vel_fcme[a], 0, fine.id(), "test").unwrap()[f];
            let predicted = new.get_ref::<f64>(l.vel_fc[a], 0, fine.id(), "test").unwrap()[f];
            let flux = new.get_ref::<f64>(l.reflux_flux[a], OUT_OF_DOMAIN, fine.id(), "test").unwrap()[f];

            assert!((flux - sign * corrected / dx[a]).abs() < 1e-12);
            stale |= (flux - sign * predicted / dx[a]).abs() > 1e-12;
        }
        assert!(stale);
    }

    #[test]
    fn restart_threshold_restarts_the_timestep() {
        let grid = two_level_grid();
        let config = SolveConfig {
            max_outer_iterations: 10,
            restart_threshold: 1,
            outer_tolerance: 0.0,
            solver: SolverParams { sweeps: 2, ..Default::default() },
            ..Default::default()
        };
        let result = one_step(&grid, 2, config).unwrap();
        assert!(result.iter().all(|r| r.3));
    }

    #[test]
    fn exhausted_budget_is_a_convergence_failure() {
        let grid = two_level_grid();
        let config = SolveConfig {
            max_outer_iterations: 2,
            restart_threshold: 10,
            outer_tolerance: 0.0,
            solver: SolverParams { sweeps: 1, ..Default::default() },
            ..Default::default()
        };
        let result = one_step(&grid, 1, config);
        assert!(matches!(result, Err(Error::ConvergenceFailure { iterations: 2, .. })));
    }

    #[test]
    fn scrub_modes_survive_a_restart_and_a_convergence_failure() {
        let grid = two_level_grid();
        let dist = Distribution::serial(&grid);
        let comm = LocalCommunicator::group(1).remove(0);
        let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };
        let restarting = SolveConfig {
            max_outer_iterations: 10,
            restart_threshold: 0,
            ..solve_config(10, 2)
        };
        let exhausting = SolveConfig {
            outer_tolerance: 0.0,
            restart_threshold: 10,
            ..solve_config(2, 1)
        };

        for config in vec![restarting, exhausting] {
            let solve = PressureSolve::new(config, Arc::new(JacobiSolver), MaterialSubset::single(0));
            let mut stores = Warehouses::new(MAX_GHOST);
            initialize_on(&solve, processor, &mut stores).unwrap();

            for dw in [Dw::Old, Dw::New].iter() {
                stores.at_mut(0, *dw).unwrap().set_scrubbing(ScrubMode::Complete);
            }
            match step_on(&grid, &solve, processor, &mut stores) {
                Ok(()) => assert!(stores.at(0, Dw::New).unwrap().timestep_restarted()),
                Err(e) => assert!(matches!(e, Error::ConvergenceFailure { iterations: 2, .. })),
            }
            assert_eq!(stores.depths(), 1);
            assert_eq!(stores.at(0, Dw::Old).unwrap().scrub_mode(), ScrubMode::Complete);
            assert_eq!(stores.at(0, Dw::New).unwrap().scrub_mode(), ScrubMode::Complete);
        }
    }
}
