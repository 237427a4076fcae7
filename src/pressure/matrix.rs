//! Assembly of the pressure matrix. Every level gets the seven-point
//! Laplacian scaled by the timestep; coarse cells under a finer level are
//! then reduced to the identity, and the coarse rows bordering them are
//! rewritten to couple to the fine cells across the interface instead.

use super::kernels::OPEN_FACE;
use super::{press, Labels};
use crate::data_store::WhichDw;
use crate::index_space::{Axis, Index};
use crate::material::OUT_OF_DOMAIN;
use crate::patch::Face;
use crate::task::{Dependency, LevelDomain, Task};
use crate::variable::{Field, Stencil7};
use std::collections::HashSet;




/**
 * Assemble the matrix on every patch, and zero the pressure increment the
 * linear solve will update. The coefficient for a face normal to axis `a`
 * is `weight * dt / dx[a]^2`, with `dt` read from the given generation.
 * Walls contribute nothing; the open face holds the pressure outside at
 * zero.
 */
pub fn setup_matrix(l: &Labels, dt_dw: WhichDw, weight: f64) -> Task {
    let l = *l;
    Task::per_patch("setup_matrix", move |ctx| {
        let dt = ctx.get_reduction(dt_dw, l.del_t, OUT_OF_DOMAIN)?;
        let level = ctx.level();
        let dx = level.spacing();
        let domain = level.domain();
        let k = Axis::ALL.map(|axis| weight * dt / (dx[axis.dim()] * dx[axis.dim()]));

        let matrix = Field::from_fn(ctx.patch().cells().clone(), |c: Index| {
            let mut s = Stencil7::default();

            for &face in &Face::ALL {
                let coefficient = k[face.axis().dim()];

                if domain.contains(face.neighbor(c)) {
                    s[face] = -coefficient;
                    s.p += coefficient;
                } else if face == OPEN_FACE {
                    s.p += coefficient;
                }
            }
            s
        });
        *ctx.allocate_and_put::<Stencil7>(l.matrix, OUT_OF_DOMAIN)? = matrix;
        ctx.allocate_and_put::<f64>(l.imp_del_p, OUT_OF_DOMAIN)?;
        Ok(())
    })
    .require(Dependency::new(dt_dw, l.del_t).matls(press()))
    .computes(l.matrix)
    .computes(l.imp_del_p)
}




/**
 * Carry the matrix of the previous outer iteration into this one, and zero
 * the pressure increment.
 */
pub fn carry_matrix(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("carry_matrix", move |ctx| {
        let matrix = ctx.get::<Stencil7>(WhichDw::Old, l.matrix, OUT_OF_DOMAIN, 0)?.into_owned();
        *ctx.allocate_and_put::<Stencil7>(l.matrix, OUT_OF_DOMAIN)? = matrix;
        ctx.allocate_and_put::<f64>(l.imp_del_p, OUT_OF_DOMAIN)?;
        Ok(())
    })
    .requires(WhichDw::Old, l.matrix, 0)
    .computes(l.matrix)
    .computes(l.imp_del_p)
}




/**
 * Replace the rows of coarse cells under a finer level with the identity.
 */
pub fn zero_matrix_under_fine_patches(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("zero_matrix_under_fine_patches", move |ctx| {
        let grid = ctx.grid();
        let patch = ctx.patch();
        let covered: Vec<Index> = grid
            .fine_patches(patch)
            .into_iter()
            .filter_map(|fine| grid.fine_level_range(patch, fine))
            .flat_map(|(coarse_cells, _)| coarse_cells.iter().collect::<Vec<_>>())
            .collect();

        if !covered.is_empty() {
            let matrix = ctx.get_modifiable::<Stencil7>(l.matrix, OUT_OF_DOMAIN)?;
            for c in covered {
                matrix[c] = Stencil7 { p: 1.0, ..Default::default() };
            }
        }
        Ok(())
    })
    .modifies(l.matrix)
}




/**
 * Rewrite the coarse rows bordering a finer level. The coupling to the
 * covered neighbor is dropped, and each fine cell across the interface is
 * coupled in with its own face coefficient, weighted by the fine to coarse
 * volume ratio.
 */
pub fn matrix_bc_cfi_coarse_patch(l: &Labels) -> Task {
    let l = *l;
    Task::per_patch("matrix_bc_cfi_coarse_patch", move |ctx| {
        let fine = match ctx.grid().finer(ctx.patch().level()) {
            Some(fine) => fine,
            None => return Ok(()),
        };
        let ratio = fine.cell_volume() / ctx.level().cell_volume();
        let links = ctx.fine_link_values::<Stencil7, _>(WhichDw::New, l.matrix, OUT_OF_DOMAIN, |link| Some(link.fine_cell))?;

        if links.is_empty() {
            return Ok(());
        }
        let matrix = ctx.get_modifiable::<Stencil7>(l.matrix, OUT_OF_DOMAIN)?;
        let mut dropped: HashSet<(Index, Face)> = HashSet::new();

        for (link, a_fine) in &links {
            let toward_fine = link.face.opposite();
            let row = &mut matrix[link.coarse_cell];

            if dropped.insert((link.coarse_cell, toward_fine)) {
                let coupling = row[toward_fine];
                row.p += coupling;
                row[toward_fine] = 0.0;
            }
            row.p -= a_fine[link.face] * ratio;
        }
        Ok(())
    })
    .require(Dependency::new(WhichDw::New, l.matrix).domain(LevelDomain::Finer).ghost(1))
    .modifies(l.matrix)
}




// ============================================================================
#[cfg(test)]
mod test {

    use crate::data_store::{Warehouses, WhichDw as Dw};
    use crate::grid::test::two_level_grid;
    use crate::grid::Grid;
    use crate::index_space::Index;
    use crate::load_balancer::Distribution;
    use crate::material::{MaterialSubset, OUT_OF_DOMAIN};
    use crate::message::LocalCommunicator;
    use crate::pressure::Labels;
    use crate::scheduler::{PatchSelection, Processor, Scheduler};
    use crate::variable::Stencil7;

    /// Assemble on the two level grid with dt = 0.5 and weight 2, so the
    /// coarse coefficient is 1 and the fine one is 4.
    ///
    fn assemble(grid: &Grid, with_interface: bool) -> Warehouses {
        let comm = LocalCommunicator::group(1).remove(0);
        let dist = Distribution::serial(grid);
        let processor = Processor { grid, distribution: &dist, comm: &comm };
        let l = Labels::new();
        let press = MaterialSubset::out_of_domain();

        let mut stores = Warehouses::new(2);
        stores.at_mut(0, Dw::Old).unwrap().set_reduction(l.del_t, OUT_OF_DOMAIN, 0.5);

        let mut sched = Scheduler::new();
        sched.add_task(super::setup_matrix(&l, Dw::Old, 2.0), PatchSelection::Grid, press.clone()).unwrap();
        if with_interface {
            sched.add_task(super::zero_matrix_under_fine_patches(&l), PatchSelection::Level(0), press.clone()).unwrap();
            sched.add_task(super::matrix_bc_cfi_coarse_patch(&l), PatchSelection::Level(0), press).unwrap();
        }
        sched.compile().unwrap();
        sched.execute(&mut stores, processor).unwrap();
        stores
    }

    fn row(grid: &Grid, stores: &Warehouses, level: usize, c: Index) -> Stencil7 {
        let patch = grid.patches().find(|p| p.level() == level && p.contains(c)).unwrap();
        let matrix = stores.at(0, Dw::New).unwrap().get_ref::<Stencil7>(Labels::new().matrix, OUT_OF_DOMAIN, patch.id(), "test").unwrap();
        matrix[c]
    }

    #[test]
    fn walls_drop_their_coupling_and_the_open_face_keeps_it_on_the_diagonal() {
        let grid = two_level_grid();
        let stores = assemble(&grid, false);

        let corner = row(&grid, &stores, 0, (0, 0, 0));
        assert_eq!(corner, Stencil7 { p: 3.0, e: -1.0, n: -1.0, t: -1.0, ..Default::default() });

        let open = row(&grid, &stores, 0, (7, 0, 0));
        assert_eq!(open, Stencil7 { p: 4.0, w: -1.0, n: -1.0, t: -1.0, ..Default::default() });

        let fine = row(&grid, &stores, 1, (4, 4, 4));
        assert_eq!(fine.p, 24.0);
        assert_eq!(fine.off_diagonal_sum(), -24.0);
    }

    #[test]
    fn coarse_rows_at_the_interface_couple_to_the_fine_cells() {
        let grid = two_level_grid();
        let stores = assemble(&grid, true);

        assert_eq!(row(&grid, &stores, 0, (2, 2, 2)), Stencil7 { p: 1.0, ..Default::default() });

        // four fine faces of coefficient 4 at volume ratio 1/8 replace the
        // unit coupling to the covered cell
        let bordering = row(&grid, &stores, 0, (1, 2, 2));
        assert_eq!(bordering.e, 0.0);
        assert_eq!(bordering.w, -1.0);
        assert!((bordering.p - 7.0).abs() < 1e-12);

        assert_eq!(row(&grid, &stores, 0, (0, 2, 2)).p, 5.0);
    }
}
