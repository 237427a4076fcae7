//! Reference physics tasks around the pressure solve. The model is a set of
//! incompressible materials in a box with walls on every side but one: fluid
//! may leave through the upper x face, where the pressure is held at zero.
//! Velocities live on faces, pressure and the right-hand side in cells, and
//! the right-hand side is the negative divergence of the summed material
//! velocities.

use super::{press, Labels};
use crate::data_store::WhichDw;
use crate::error::Result;
use crate::index_space::{shift, Axis, Index, IndexSpace};
use crate::label::Label;
use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
use crate::patch::Face;
use crate::task::{Dependency, LevelDomain, Task};
use crate::variable::Field;
use std::collections::HashMap;
use std::f64::consts::PI;




/// The domain face through which fluid may leave. All other domain faces
/// are walls.
pub const OPEN_FACE: Face = Face::XPlus;




/**
 * Where a face lies relative to the domain of its level
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Boundary {
    Interior,
    Wall,
    Open,
}




/// Classify the face with index `face` normal to `axis`.
///
pub fn face_boundary(domain: &IndexSpace, axis: Axis, face: Index) -> Boundary {
    let n = axis.of(face);
    let range = domain.range(axis);

    let side = if n == range.start {
        Face::new(axis, false)
    } else if n == range.end {
        Face::new(axis, true)
    } else {
        return Boundary::Interior;
    };
    if side == OPEN_FACE {
        Boundary::Open
    } else {
        Boundary::Wall
    }
}

/// The position of the center of a face, with the domain starting at the
/// origin.
///
fn face_center(axis: Axis, face: Index, dx: [f64; 3]) -> [f64; 3] {
    let mut x = [
        (face.0 as f64 + 0.5) * dx[0],
        (face.1 as f64 + 0.5) * dx[1],
        (face.2 as f64 + 0.5) * dx[2],
    ];
    x[axis.dim()] -= 0.5 * dx[axis.dim()];
    x
}

/// Body force per unit mass along an axis.
///
fn forcing(axis: Axis, x: [f64; 3], length: [f64; 3]) -> f64 {
    match axis {
        Axis::I => x[0] / length[0],
        Axis::J => (PI * x[1] / length[1]).sin(),
        Axis::K => (PI * x[2] / length[2]).sin(),
    }
}

fn unit_cell(c: Index) -> IndexSpace {
    IndexSpace::new(c.0..c.0 + 1, c.1..c.1 + 1, c.2..c.2 + 1)
}




/**
 * Zero pressure and corrected face velocities, to start from.
 */
pub fn initialize(l: &Labels, vel_matls: &MaterialSubset) -> Task {
    let l = *l;
    let mut task = Task::per_patch("initialize_state", move |ctx| {
        ctx.allocate_and_put::<f64>(l.press_cc, OUT_OF_DOMAIN)?;

        for matl in ctx.matls().iter() {
            for &label in &l.vel_fcme {
                ctx.allocate_and_put::<f64>(label, matl)?;
            }
        }
        Ok(())
    })
    .computes_matls(l.press_cc, press());

    for &label in &l.vel_fcme {
        task = task.computes_matls(label, vel_matls.clone());
    }
    task
}




/**
 * Predict the face velocities over a step: the corrected velocities of the
 * previous step advanced by the body force. Wall faces carry no flow.
 */
pub fn compute_vel_fc(l: &Labels, vel_matls: &MaterialSubset) -> Task {
    let l = *l;
    let mut task = Task::per_patch("compute_vel_fc", move |ctx| {
        let dt = ctx.get_reduction(WhichDw::Old, l.del_t, OUT_OF_DOMAIN)?;
        let level = ctx.level();
        let dx = level.spacing();
        let domain = level.domain().clone();
        let length = [
            (domain.range(Axis::I).end - domain.range(Axis::I).start) as f64 * dx[0],
            (domain.range(Axis::J).end - domain.range(Axis::J).start) as f64 * dx[1],
            (domain.range(Axis::K).end - domain.range(Axis::K).start) as f64 * dx[2],
        ];

        for matl in ctx.matls().iter() {
            for &axis in &Axis::ALL {
                let predicted = {
                    let old = ctx.get::<f64>(WhichDw::Old, l.vel_fcme[axis.dim()], matl, 0)?;
                    Field::from_fn(old.space().clone(), |f| match face_boundary(&domain, axis, f) {
                        Boundary::Wall => 0.0,
                        _ => old[f] + dt * forcing(axis, face_center(axis, f, dx), length),
                    })
                };
                *ctx.allocate_and_put::<f64>(l.vel_fc[axis.dim()], matl)? = predicted;
            }
        }
        Ok(())
    })
    .require(Dependency::new(WhichDw::Old, l.del_t).matls(press()));

    for axis in 0..3 {
        task = task
            .requires(WhichDw::Old, l.vel_fcme[axis], 0)
            .computes_matls(l.vel_fc[axis], vel_matls.clone());
    }
    task
}




/**
 * Build the right-hand side, the negative divergence of the face
 * velocities summed over materials. The first call of a step also zeroes
 * the accumulated pressure correction.
 */
pub fn setup_rhs(l: &Labels, vel: [Label; 3], vel_matls: &MaterialSubset, initialize_sum: bool) -> Task {
    let l = *l;
    let mut task = Task::per_patch("setup_rhs", move |ctx| {
        let dx = ctx.level().spacing();
        let cells = ctx.patch().cells().clone();
        let mut rhs = Field::<f64>::new(cells.clone());

        for matl in ctx.matls().iter() {
            for &axis in &Axis::ALL {
                let u = ctx.get::<f64>(WhichDw::New, vel[axis.dim()], matl, 0)?;

                for c in cells.iter() {
                    rhs[c] -= (u[shift(c, axis, 1)] - u[c]) / dx[axis.dim()];
                }
            }
        }
        *ctx.allocate_and_put::<f64>(l.rhs, OUT_OF_DOMAIN)? = rhs;

        if initialize_sum {
            ctx.allocate_and_put::<f64>(l.sum_imp_del_p, OUT_OF_DOMAIN)?;
        }
        Ok(())
    })
    .computes_matls(l.rhs, press());

    for &label in &vel {
        task = task.require(Dependency::new(WhichDw::New, label).matls(vel_matls.clone()));
    }
    if initialize_sum {
        task = task.computes_matls(l.sum_imp_del_p, press());
    }
    task
}




/**
 * The largest magnitude of the right-hand side, over cells not covered by a
 * finer level.
 */
pub fn compute_max_rhs(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("compute_max_rhs", move |ctx| {
        let max = {
            let rhs = ctx.get::<f64>(WhichDw::New, l.rhs, OUT_OF_DOMAIN, 0)?;
            let grid = ctx.grid();
            let level = ctx.patch().level();

            ctx.patch()
                .cells()
                .iter()
                .filter(|&c| !grid.is_under_finer(level, c))
                .map(|c| rhs[c].abs())
                .fold(0.0, |m: f64, v| if v.is_nan() || m.is_nan() { f64::NAN } else { m.max(v) })
        };
        ctx.put_reduction(l.max_rhs, OUT_OF_DOMAIN, max)
    })
    .requires(WhichDw::New, l.rhs, 0)
    .computes(l.max_rhs)
}




/**
 * Replace the pressure increment in coarse cells under a finer level with
 * the volume-weighted sum of the fine cells they contain. Scheduled from
 * the finest level down, so that every level sees its finer level already
 * coarsened.
 */
pub fn coarsen_del_p(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("coarsen_del_p", move |ctx| {
        let grid = ctx.grid();
        let patch = ctx.patch();
        let fine_level = match grid.finer(patch.level()) {
            Some(fine) => fine,
            None => return Ok(()),
        };
        let ratio = fine_level.refinement_ratio();
        let weight = fine_level.cell_volume() / ctx.level().cell_volume();
        let mut coarsened: HashMap<Index, f64> = HashMap::new();

        for fine in grid.fine_patches(patch) {
            if let Some((coarse_cells, fine_cells)) = grid.fine_level_range(patch, fine) {
                let x = ctx.get_region::<f64>(WhichDw::New, l.imp_del_p, OUT_OF_DOMAIN, LevelDomain::Finer, &fine_cells)?;

                for c in coarse_cells.iter() {
                    if let Some(under) = unit_cell(c).refine(ratio).intersect(&fine_cells) {
                        *coarsened.entry(c).or_insert(0.0) += under.iter().map(|f| x[f] * weight).sum::<f64>();
                    }
                }
            }
        }
        if !coarsened.is_empty() {
            let x = ctx.get_modifiable::<f64>(l.imp_del_p, OUT_OF_DOMAIN)?;
            for (c, value) in coarsened {
                x[c] = value;
            }
        }
        Ok(())
    })
    .require(Dependency::new(WhichDw::New, l.imp_del_p).domain(LevelDomain::Finer))
    .modifies(l.imp_del_p)
}




/**
 * Accumulate the pressure increment into the step's total correction, and
 * update the pressure from the value at the start of the step.
 */
pub fn update_pressure(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("update_pressure", move |ctx| {
        let cells = ctx.patch().cells().clone();
        let (sum, pressure) = {
            let old_sum = ctx.get::<f64>(WhichDw::Old, l.sum_imp_del_p, OUT_OF_DOMAIN, 0)?;
            let delta = ctx.get::<f64>(WhichDw::New, l.imp_del_p, OUT_OF_DOMAIN, 0)?;
            let p0 = ctx.get::<f64>(WhichDw::ParentOld, l.press_cc, OUT_OF_DOMAIN, 0)?;
            let sum = Field::from_fn(cells.clone(), |c| old_sum[c] + delta[c]);
            let pressure = Field::from_fn(cells, |c| p0[c] + sum[c]);
            (sum, pressure)
        };
        *ctx.allocate_and_put::<f64>(l.sum_imp_del_p, OUT_OF_DOMAIN)? = sum;
        *ctx.allocate_and_put::<f64>(l.press_cc, OUT_OF_DOMAIN)? = pressure;
        Ok(())
    })
    .requires(WhichDw::Old, l.sum_imp_del_p, 0)
    .requires(WhichDw::New, l.imp_del_p, 0)
    .requires(WhichDw::ParentOld, l.press_cc, 0)
    .computes(l.sum_imp_del_p)
    .computes(l.press_cc)
}




/**
 * Correct the predicted face velocities with the gradient of the total
 * pressure correction. Across a coarse/fine interface the fine face sees
 * the coarse cell on the other side; through the open face it sees zero.
 */
pub fn recompute_vel_fc(l: &Labels, vel_matls: &MaterialSubset) -> Task {
    let l = *l;
    let mut task = Task::per_patch("recompute_vel_fc", move |ctx| {
        let dt = ctx.get_reduction(WhichDw::ParentOld, l.del_t, OUT_OF_DOMAIN)?;
        let level = ctx.level();
        let dx = level.spacing();
        let domain = level.domain().clone();
        let mut corrected = Vec::new();
        {
            let p = ctx.get::<f64>(WhichDw::New, l.sum_imp_del_p, OUT_OF_DOMAIN, 1)?;
            let across: HashMap<Index, f64> = ctx
                .coarse_link_values::<f64>(WhichDw::New, l.sum_imp_del_p, OUT_OF_DOMAIN)?
                .into_iter()
                .map(|(link, value)| (link.face.neighbor(link.fine_cell), value))
                .collect();
            let pressure = |c: Index| across.get(&c).copied().unwrap_or(p[c]);

            for matl in ctx.matls().iter() {
                for &axis in &Axis::ALL {
                    let a = axis.dim();
                    let u = ctx.get::<f64>(WhichDw::ParentNew, l.vel_fc[a], matl, 0)?;
                    let field = Field::from_fn(u.space().clone(), |f| {
                        let lo = shift(f, axis, -1);
                        match face_boundary(&domain, axis, f) {
                            Boundary::Wall => 0.0,
                            Boundary::Open => u[f] + dt * pressure(lo) / dx[a],
                            Boundary::Interior => u[f] - dt * (pressure(f) - pressure(lo)) / dx[a],
                        }
                    });
                    corrected.push((l.vel_fcme[a], matl, field));
                }
            }
        }
        for (label, matl, field) in corrected {
            *ctx.allocate_and_put::<f64>(label, matl)? = field;
        }
        Ok(())
    })
    .require(Dependency::new(WhichDw::ParentOld, l.del_t).matls(press()))
    .require(Dependency::new(WhichDw::New, l.sum_imp_del_p).matls(press()).ghost(1))
    .require(Dependency::new(WhichDw::New, l.sum_imp_del_p).matls(press()).domain(LevelDomain::Coarser).ghost(1));

    for axis in 0..3 {
        task = task
            .requires(WhichDw::ParentNew, l.vel_fc[axis], 0)
            .computes_matls(l.vel_fcme[axis], vel_matls.clone());
    }
    task
}




/**
 * The pressure change over the step.
 */
pub fn compute_del_p(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("compute_del_p", move |ctx| {
        let del_p = {
            let new = ctx.get::<f64>(WhichDw::New, l.press_cc, OUT_OF_DOMAIN, 0)?;
            let old = ctx.get::<f64>(WhichDw::Old, l.press_cc, OUT_OF_DOMAIN, 0)?;
            Field::from_fn(new.space().clone(), |c| new[c] - old[c])
        };
        *ctx.allocate_and_put::<f64>(l.del_p, OUT_OF_DOMAIN)? = del_p;
        Ok(())
    })
    .requires(WhichDw::New, l.press_cc, 0)
    .requires(WhichDw::Old, l.press_cc, 0)
    .computes(l.del_p)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{face_boundary, Boundary};
    use crate::data_store::{Warehouses, WhichDw as Dw};
    use crate::grid::test::two_level_grid;
    use crate::index_space::{range3d, Axis};
    use crate::load_balancer::Distribution;
    use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
    use crate::message::LocalCommunicator;
    use crate::pressure::Labels;
    use crate::scheduler::{PatchSelection, Processor, Scheduler};
    use crate::task::Task;

    #[test]
    fn only_the_upper_x_face_is_open() {
        let domain = range3d(0..8, 0..8, 0..8);
        assert_eq!(face_boundary(&domain, Axis::I, (8, 3, 3)), Boundary::Open);
        assert_eq!(face_boundary(&domain, Axis::I, (0, 3, 3)), Boundary::Wall);
        assert_eq!(face_boundary(&domain, Axis::J, (3, 8, 3)), Boundary::Wall);
        assert_eq!(face_boundary(&domain, Axis::K, (3, 3, 4)), Boundary::Interior);
    }

    #[test]
    fn rhs_of_a_linear_flow_is_its_divergence() {
        let grid = two_level_grid();
        let comm = LocalCommunicator::group(1).remove(0);
        let dist = Distribution::serial(&grid);
        let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };
        let l = Labels::new();
        let vel = MaterialSubset::new(vec![0, 1]);

        // u = x on both materials (spacing 1 on level 0, 1/2 on level 1)
        let flow = Task::per_patch("flow", move |ctx| {
            let dx = ctx.level().spacing()[0];
            for matl in ctx.matls().iter() {
                for axis in 0..3 {
                    let u = ctx.allocate_and_put::<f64>(l.vel_fc[axis], matl)?;
                    if axis == 0 {
                        let space = u.space().clone();
                        for f in space.iter() {
                            u[f] = f.0 as f64 * dx;
                        }
                    }
                }
            }
            Ok(())
        })
        .computes(l.vel_fc[0])
        .computes(l.vel_fc[1])
        .computes(l.vel_fc[2]);

        let mut stores = Warehouses::new(2);
        let mut sched = Scheduler::new();
        sched.add_task(flow, PatchSelection::Grid, vel.clone()).unwrap();
        sched.add_task(super::setup_rhs(&l, l.vel_fc, &vel, true), PatchSelection::Grid, vel.clone()).unwrap();
        sched.add_task(super::compute_max_rhs(&l), PatchSelection::Grid, MaterialSubset::out_of_domain()).unwrap();
        sched.compile().unwrap();
        sched.execute(&mut stores, processor).unwrap();

        let new = stores.at(0, Dw::New).unwrap();
        for patch in grid.patches() {
            let rhs = new.get_ref::<f64>(l.rhs, OUT_OF_DOMAIN, patch.id(), "test").unwrap();
            assert!(rhs.as_slice().iter().all(|&r| (r + 2.0).abs() < 1e-12));
        }
        assert!((new.get_reduction(l.max_rhs, OUT_OF_DOMAIN).unwrap() - 2.0).abs() < 1e-12);
    }
}
