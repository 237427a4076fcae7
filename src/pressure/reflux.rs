//! Refluxing keeps the right-hand side conservative across coarse/fine
//! interfaces. The divergence in a coarse cell bordering a finer level is
//! first built from the coarse face velocity; that term is then replaced by
//! the flux through the fine faces covering the same coarse face.

use super::{press, Labels};
use crate::data_store::WhichDw;
use crate::index_space::{shift, Axis, Index};
use crate::label::Label;
use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
use crate::patch::Face;
use crate::task::{Dependency, LevelDomain, Task};
use crate::variable::Field;
use std::collections::{HashMap, HashSet};




/**
 * The contribution of a set of fine-face fluxes to a coarse cell: each
 * flux is weighted by the fine to coarse cell volume ratio.
 */
pub fn fine_flux_correction<I: IntoIterator<Item = f64>>(fluxes: I, fine_volume: f64, coarse_volume: f64) -> f64 {
    let weight = fine_volume / coarse_volume;
    fluxes.into_iter().map(|f| f * weight).sum()
}




/// The index of the face of `cell` on the given side. A face index names
/// the low face of the cell with the same index.
///
pub(crate) fn face_index(cell: Index, face: Face) -> Index {
    if face.is_upper() {
        shift(cell, face.axis(), 1)
    } else {
        cell
    }
}




/**
 * On a fine level, record the divergence flux through every interface
 * face, summed over materials. The flux through a face on the upper side
 * of a fine cell counts positive.
 */
pub fn compute_reflux_fluxes(l: &Labels, vel: [Label; 3], vel_matls: &MaterialSubset) -> Task {
    let l = *l;
    let mut task = Task::per_patch("compute_reflux_fluxes", move |ctx| {
        let links = ctx.grid().cfi_links(ctx.patch());
        let dx = ctx.level().spacing();
        let cells = ctx.patch().cells().clone();

        for &axis in &Axis::ALL {
            let a = axis.dim();
            let mut flux = Field::<f64>::new(l.reflux_flux[a].location().space(&cells));

            for matl in ctx.matls().iter() {
                let u = ctx.get::<f64>(WhichDw::New, vel[a], matl, 0)?;

                for link in links.iter().filter(|link| link.face.axis() == axis) {
                    let f = face_index(link.fine_cell, link.face);
                    flux[f] += link.face.sign() as f64 * u[f] / dx[a];
                }
            }
            *ctx.allocate_and_put::<f64>(l.reflux_flux[a], OUT_OF_DOMAIN)? = flux;
        }
        Ok(())
    });

    for axis in 0..3 {
        task = task
            .require(Dependency::new(WhichDw::New, vel[axis]).matls(vel_matls.clone()))
            .computes_matls(l.reflux_flux[axis], press());
    }
    task
}




/**
 * On a coarse level, swap the coarse face term of the right-hand side for
 * the fine fluxes, in every coarse cell bordering the next finer level.
 */
pub fn apply_reflux_fluxes(l: &Labels, vel: [Label; 3], vel_matls: &MaterialSubset) -> Task {
    let l = *l;
    let mut task = Task::per_patch("apply_reflux_fluxes", move |ctx| {
        let fine = match ctx.grid().finer(ctx.patch().level()) {
            Some(fine) => fine,
            None => return Ok(()),
        };
        let links = ctx.grid().coarse_fine_links(ctx.patch());

        if links.is_empty() {
            return Ok(());
        }
        let dx = ctx.level().spacing();
        let sides: HashSet<(Index, Face)> = links.iter().map(|link| (link.coarse_cell, link.face.opposite())).collect();
        let mut correction: HashMap<Index, f64> = HashMap::new();

        for matl in ctx.matls().iter() {
            for &axis in &Axis::ALL {
                let u = ctx.get::<f64>(WhichDw::New, vel[axis.dim()], matl, 0)?;

                for &(c, side) in sides.iter().filter(|(_, side)| side.axis() == axis) {
                    *correction.entry(c).or_insert(0.0) += side.sign() as f64 * u[face_index(c, side)] / dx[axis.dim()];
                }
            }
        }

        for &axis in &Axis::ALL {
            let fluxes = ctx.fine_link_values::<f64, _>(WhichDw::New, l.reflux_flux[axis.dim()], OUT_OF_DOMAIN, |link| {
                if link.face.axis() == axis {
                    Some(face_index(link.fine_cell, link.face))
                } else {
                    None
                }
            })?;
            let mut by_cell: HashMap<Index, Vec<f64>> = HashMap::new();

            for (link, flux) in fluxes {
                by_cell.entry(link.coarse_cell).or_default().push(flux);
            }
            for (c, fluxes) in by_cell {
                *correction.entry(c).or_insert(0.0) += fine_flux_correction(fluxes, fine.cell_volume(), ctx.level().cell_volume());
            }
        }

        let rhs = ctx.get_modifiable::<f64>(l.rhs, OUT_OF_DOMAIN)?;
        for (c, value) in correction {
            rhs[c] += value;
        }
        Ok(())
    })
    .modifies_matls(l.rhs, press());

    for axis in 0..3 {
        task = task
            .require(Dependency::new(WhichDw::New, vel[axis]).matls(vel_matls.clone()))
            .require(Dependency::new(WhichDw::New, l.reflux_flux[axis]).matls(press()).domain(LevelDomain::Finer).ghost(1));
    }
    task
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::fine_flux_correction;
    use crate::data_store::{Warehouses, WhichDw as Dw};
    use crate::grid::test::two_level_grid;
    use crate::grid::Grid;
    use crate::index_space::Index;
    use crate::load_balancer::Distribution;
    use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
    use crate::message::LocalCommunicator;
    use crate::pressure::{kernels, Labels};
    use crate::scheduler::{PatchSelection, Processor, Scheduler};
    use crate::task::Task;

    /// Build and reflux the right-hand side of a flow along x, with the
    /// given speed on each level, and return the coarse right-hand side at
    /// the requested cells.
    ///
    fn refluxed_rhs(grid: &Grid, speed: [f64; 2], cells: &[Index]) -> Vec<f64> {
        let comm = LocalCommunicator::group(1).remove(0);
        let dist = Distribution::serial(grid);
        let processor = Processor { grid, distribution: &dist, comm: &comm };
        let l = Labels::new();
        let vel = MaterialSubset::single(0);

        let flow = Task::per_patch("flow", move |ctx| {
            let s = speed[ctx.level().index()];
            ctx.allocate_and_put::<f64>(l.vel_fc[0], 0)?.fill(s);
            ctx.allocate_and_put::<f64>(l.vel_fc[1], 0)?;
            ctx.allocate_and_put::<f64>(l.vel_fc[2], 0)?;
            Ok(())
        })
        .computes(l.vel_fc[0])
        .computes(l.vel_fc[1])
        .computes(l.vel_fc[2]);

        let mut stores = Warehouses::new(2);
        let mut sched = Scheduler::new();
        sched.add_task(flow, PatchSelection::Grid, vel.clone()).unwrap();
        sched.add_task(kernels::setup_rhs(&l, l.vel_fc, &vel, false), PatchSelection::Grid, vel.clone()).unwrap();
        sched.add_task(super::compute_reflux_fluxes(&l, l.vel_fc, &vel), PatchSelection::Level(1), vel.clone()).unwrap();
        sched.add_task(super::apply_reflux_fluxes(&l, l.vel_fc, &vel), PatchSelection::Level(0), vel.clone()).unwrap();
        sched.compile().unwrap();
        sched.execute(&mut stores, processor).unwrap();

        let new = stores.at(0, Dw::New).unwrap();
        cells
            .iter()
            .map(|&c| {
                let patch = grid.patches().find(|p| p.level() == 0 && p.contains(c)).unwrap();
                new.get_ref::<f64>(l.rhs, OUT_OF_DOMAIN, patch.id(), "test").unwrap()[c]
            })
            .collect()
    }

    #[test]
    fn fine_fluxes_are_weighted_by_volume() {
        assert_eq!(fine_flux_correction(vec![1.0; 8], 0.125, 1.0), 1.0);
        assert_eq!(fine_flux_correction(Vec::new(), 0.125, 1.0), 0.0);
    }

    #[test]
    fn uniform_flow_stays_divergence_free() {
        let grid = two_level_grid();
        let rhs = refluxed_rhs(&grid, [1.0, 1.0], &[(1, 2, 2), (4, 3, 3), (2, 1, 2), (0, 0, 0)]);
        assert!(rhs.iter().all(|r| r.abs() < 1e-12), "{:?}", rhs);
    }

    #[test]
    fn faster_fine_flow_is_seen_by_the_bordering_coarse_cells() {
        let grid = two_level_grid();
        let rhs = refluxed_rhs(&grid, [1.0, 2.0], &[(1, 2, 2), (4, 3, 3), (2, 1, 2), (0, 0, 0)]);

        // inflow face: the coarse unit flux is replaced by the fine one of 2
        assert!((rhs[0] + 1.0).abs() < 1e-12);
        // outflow face
        assert!((rhs[1] - 1.0).abs() < 1e-12);
        // faces along the flow carry none
        assert!(rhs[2].abs() < 1e-12);
        assert_eq!(rhs[3], 0.0);
    }
}
