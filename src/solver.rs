//! The linear solver boundary of the pressure solve. A solver does not run
//! anything itself: `schedule_solve` adds tasks to the caller's scheduler, so
//! the solver's sweeps take part in the same dependency graph and ghost
//! exchange as the tasks around them. A solver that cannot produce a usable
//! answer requests a timestep restart on the generation it writes.

use crate::context::PatchContext;
use crate::data_store::WhichDw;
use crate::error::Result;
use crate::grid::Grid;
use crate::label::{Label, ReductionOp};
use crate::material::MaterialSubset;
use crate::patch::Face;
use crate::scheduler::{PatchSelection, Scheduler};
use crate::task::{Dependency, LevelDomain, Task};
use crate::variable::{Field, Stencil7};
use log::debug;
use serde::{Deserialize, Serialize};




/**
 * Parameters handed to a linear solver with each solve
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Number of relaxation sweeps scheduled per solve.
    pub sweeps: usize,

    /// Once a sweep changes no value by more than this, the remaining sweeps
    /// pass the solution through unchanged.
    pub tolerance: f64,

    /// A final residual above this (or one that is not finite) makes the
    /// solver request a timestep restart.
    pub restart_residual: f64,
}




/**
 * A generation-qualified key of the linear system
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemKey {
    pub label: Label,
    pub dw: WhichDw,
}




/**
 * Interface to a linear solver for `A x = b` on every level of the grid,
 * where `A` is a seven-point stencil per unit cell volume
 */
pub trait LinearSolver: Send + Sync {


    /**
     * Add the tasks that solve the system to a scheduler. The unknown `x`
     * is written in the new generation: computed, or modified in place if
     * `modifies_x` is set. If a `guess` is given the iteration starts from
     * it, otherwise from zero.
     */
    #[allow(clippy::too_many_arguments)]
    fn schedule_solve(
        &self,
        grid: &Grid,
        sched: &mut Scheduler,
        matls: &MaterialSubset,
        a: SystemKey,
        x: Label,
        modifies_x: bool,
        b: SystemKey,
        guess: Option<SystemKey>,
        params: &SolverParams,
    ) -> Result<()>;
}




/**
 * A reference solver doing a fixed number of Jacobi sweeps over the whole
 * grid at once. The levels are coupled through the coarse/fine links: a fine
 * cell on an interface sees the coarse cell across it as its neighbor, and
 * the coarse cell sees each of the fine cells, weighted by the fine stencil
 * coefficient and the ratio of cell volumes.
 */
#[derive(Clone, Copy, Debug, Default)]
pub struct JacobiSolver;




#[derive(Clone, Copy)]
struct System {
    a: SystemKey,
    b: SystemKey,
}




// ============================================================================
impl Default for SolverParams {
    fn default() -> Self {
        Self {
            sweeps: 60,
            tolerance: 1e-12,
            restart_residual: 1e10,
        }
    }
}




// ============================================================================
impl SystemKey {
    pub fn new(label: Label, dw: WhichDw) -> Self {
        Self { label, dw }
    }
}




// ============================================================================
impl LinearSolver for JacobiSolver {
    fn schedule_solve(
        &self,
        grid: &Grid,
        sched: &mut Scheduler,
        matls: &MaterialSubset,
        a: SystemKey,
        x: Label,
        modifies_x: bool,
        b: SystemKey,
        guess: Option<SystemKey>,
        params: &SolverParams,
    ) -> Result<()> {
        let system = System { a, b };
        let iterates = [
            Label::cell(&format!("{}_jacobi_a", x)),
            Label::cell(&format!("{}_jacobi_b", x)),
        ];
        let sweeps = params.sweeps.max(1);

        debug!("scheduling {} jacobi sweeps for {} on {} levels", sweeps, x, grid.num_levels());

        for n in 0..sweeps {
            let previous = match n {
                0 => guess,
                _ => Some(SystemKey::new(iterates[(n - 1) % 2], WhichDw::New)),
            };
            let task = sweep_task(system, previous, iterates[n % 2], n, params.tolerance);
            sched.add_task(task, PatchSelection::Grid, matls.clone())?;
        }
        let last = SystemKey::new(iterates[(sweeps - 1) % 2], WhichDw::New);
        let task = finish_task(system, last, x, modifies_x, params.restart_residual);
        sched.add_task(task, PatchSelection::Grid, matls.clone())
    }
}




/// The reduction holding the largest change made by one sweep.
///
fn change_label(target: Label, n: usize) -> Label {
    Label::reduction(&format!("{}_change_{}", target, n), ReductionOp::Max)
}

fn residual_label(x: Label) -> Label {
    Label::reduction(&format!("{}_jacobi_residual", x), ReductionOp::Max)
}

/// Declare the reads of the system and of an iterate, including the cells
/// across the coarse/fine interfaces in both directions.
///
fn requires_system(task: Task, system: System, iterate: Option<SystemKey>) -> Task {
    let task = task
        .requires(system.a.dw, system.a.label, 0)
        .require(Dependency::new(system.a.dw, system.a.label).domain(LevelDomain::Finer).ghost(1))
        .requires(system.b.dw, system.b.label, 0);

    match iterate {
        Some(x) => task
            .requires(x.dw, x.label, 1)
            .require(Dependency::new(x.dw, x.label).domain(LevelDomain::Coarser).ghost(1))
            .require(Dependency::new(x.dw, x.label).domain(LevelDomain::Finer).ghost(1)),
        None => task,
    }
}

fn sweep_task(system: System, previous: Option<SystemKey>, target: Label, n: usize, tolerance: f64) -> Task {
    let change = change_label(target, n);
    let last_change = previous.filter(|_| n > 0).map(|p| change_label(p.label, n - 1));

    let mut task = Task::per_patch(&format!("jacobi_sweep_{}", n), move |ctx| {
        for matl in ctx.matls().iter() {
            let converged = match last_change {
                Some(label) => ctx.get_reduction(WhichDw::New, label, matl)? <= tolerance,
                None => false,
            };
            let (next, delta) = {
                let x = match previous {
                    Some(p) => Some(ctx.get::<f64>(p.dw, p.label, matl, 0)?.into_owned()),
                    None => None,
                };
                match (&x, converged) {
                    (Some(x), true) => (x.clone(), 0.0),
                    _ => relax(ctx, system, previous, x.as_ref(), matl)?,
                }
            };
            let out = if n < 2 {
                ctx.allocate_and_put::<f64>(target, matl)?
            } else {
                ctx.get_modifiable::<f64>(target, matl)?
            };
            out.copy_region(&next, next.space());
            ctx.put_reduction(change, matl, delta)?;
        }
        Ok(())
    });
    task = requires_system(task, system, previous);

    if let Some(label) = last_change {
        task = task.requires(WhichDw::New, label, 0);
    }
    if n < 2 {
        task.computes(target).computes(change)
    } else {
        task.modifies(target).computes(change)
    }
}

fn finish_task(system: System, last: SystemKey, x: Label, modifies_x: bool, restart_residual: f64) -> Task {
    let residual_label = residual_label(x);

    let task = Task::per_patch("jacobi_finish", move |ctx| {
        for matl in ctx.matls().iter() {
            let solution = ctx.get::<f64>(last.dw, last.label, matl, 0)?.into_owned();
            let residual = residual(ctx, system, last, &solution, matl)?;

            if !residual.is_finite() || residual > restart_residual {
                debug!("patch {} jacobi residual {:e}: requesting a restart", ctx.patch().id(), residual);
                ctx.request_restart();
            }
            let out = if modifies_x {
                ctx.get_modifiable::<f64>(x, matl)?
            } else {
                ctx.allocate_and_put::<f64>(x, matl)?
            };
            out.copy_region(&solution, solution.space());
            ctx.put_reduction(residual_label, matl, residual)?;
        }
        Ok(())
    });
    let task = requires_system(task, system, Some(last)).computes(residual_label);

    if modifies_x {
        task.modifies(x)
    } else {
        task.computes(x)
    }
}

/// Do one Jacobi update on a patch, from the iterate `x` (zero if `None`).
/// Returns the update and the largest change it made.
///
fn relax(
    ctx: &PatchContext,
    system: System,
    iterate: Option<SystemKey>,
    x: Option<&Field<f64>>,
    matl: i32,
) -> Result<(Field<f64>, f64)> {
    let a = ctx.get::<Stencil7>(system.a.dw, system.a.label, matl, 0)?;
    let b = ctx.get::<f64>(system.b.dw, system.b.label, matl, 0)?;
    let cells = ctx.patch().cells().clone();

    let off = match iterate {
        Some(key) => neighbor_sum(ctx, system, key, &a, matl)?,
        None => Field::new(cells.clone()),
    };
    let mut delta = 0.0_f64;

    let next = Field::from_fn(cells, |c| {
        let value = (b[c] - off[c]) / a[c].p;
        let before = x.map(|x| x[c]).unwrap_or(0.0);
        delta = delta.max((value - before).abs());
        value
    });
    if next.as_slice().iter().any(|v| !v.is_finite()) {
        delta = f64::INFINITY;
    }
    Ok((next, delta))
}

/// The largest magnitude of `b - A x` over the patch.
///
fn residual(ctx: &PatchContext, system: System, key: SystemKey, x: &Field<f64>, matl: i32) -> Result<f64> {
    let a = ctx.get::<Stencil7>(system.a.dw, system.a.label, matl, 0)?;
    let b = ctx.get::<f64>(system.b.dw, system.b.label, matl, 0)?;
    let off = neighbor_sum(ctx, system, key, &a, matl)?;

    Ok(ctx
        .patch()
        .cells()
        .iter()
        .map(|c| (b[c] - a[c].p * x[c] - off[c]).abs())
        .fold(0.0, |r: f64, v| if v.is_nan() { f64::NAN } else { r.max(v) }))
}

/// The off-diagonal part of `A x` on a patch: the same-level neighbors, the
/// coarse cells across this patch's interface faces, and the fine cells
/// across the interfaces of finer patches that border it.
///
fn neighbor_sum(ctx: &PatchContext, system: System, key: SystemKey, a: &Field<Stencil7>, matl: i32) -> Result<Field<f64>> {
    let x = ctx.get::<f64>(key.dw, key.label, matl, 1)?;
    let mut sum = Field::from_fn(ctx.patch().cells().clone(), |c| {
        Face::ALL.iter().map(|&f| a[c][f] * x[f.neighbor(c)]).sum::<f64>()
    });

    for (link, coarse) in ctx.coarse_link_values::<f64>(key.dw, key.label, matl)? {
        sum[link.fine_cell] += a[link.fine_cell][link.face] * coarse;
    }
    if let Some(fine) = ctx.grid().finer(ctx.patch().level()) {
        let ratio = fine.cell_volume() / ctx.level().cell_volume();
        let fine_x = ctx.fine_link_values::<f64, _>(key.dw, key.label, matl, |l| Some(l.fine_cell))?;
        let fine_a = ctx.fine_link_values::<Stencil7, _>(system.a.dw, system.a.label, matl, |l| Some(l.fine_cell))?;

        for ((link, xf), (_, af)) in fine_x.into_iter().zip(fine_a) {
            sum[link.coarse_cell] += af[link.face] * ratio * xf;
        }
    }
    Ok(sum)
}
