//! Assignment of patches to processing elements. A `LoadBalancer` is the
//! pluggable policy (which rank owns a patch, and which patches a rank must
//! be able to see); a `Distribution` is one rank's snapshot of that policy
//! applied to a particular grid, which is what the scheduler consults.

use crate::grid::Grid;
use crate::patch::{Patch, PatchId};
use log::info;
use std::collections::BTreeSet;

/// The largest ghost width any task may request; the neighborhood is built
/// wide enough to satisfy it.
///
pub const MAX_GHOST: usize = 2;




/// One ordered patch subset per processing element. Subset `r` holds the
/// patches owned by rank `r`, sorted by id.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerProcessorPatchSet {
    subsets: Vec<Vec<PatchId>>,
}




/// Interface for a policy mapping patches to processing elements. Only the
/// patchwise assignment is required; the patch sets and the neighborhood
/// are derived from it unless an implementor has a better idea.
///
pub trait LoadBalancer: Send + Sync {
    /// Must be implemented to return the number of processing elements.
    fn num_processors(&self) -> usize;

    /// Must be implemented to return the rank owning a patch. This must be a
    /// pure function of the patch and the grid.
    fn patchwise_processor_assignment(&self, grid: &Grid, patch: &Patch) -> usize;

    /// Return the rank that owned a patch of the previous grid. The default
    /// is the same policy applied to the old grid.
    fn old_processor_assignment(&self, old_grid: &Grid, patch: &Patch) -> usize {
        self.patchwise_processor_assignment(old_grid, patch)
    }

    /// Group the patches of one level (or of every level, if `level` is
    /// `None`) by owning rank.
    fn create_per_processor_patch_set(&self, grid: &Grid, level: Option<usize>) -> PerProcessorPatchSet {
        let mut subsets = vec![Vec::new(); self.num_processors()];
        let patches: Box<dyn Iterator<Item = &Patch> + '_> = match level {
            Some(level) => Box::new(grid.level(level).patches().iter()),
            None => Box::new(grid.patches()),
        };
        for patch in patches {
            let proc = self.patchwise_processor_assignment(grid, patch);
            assert!(proc < subsets.len(), "patch {} assigned to rank {} of {}", patch.id(), proc, subsets.len());
            subsets[proc].push(patch.id());
        }
        for subset in &mut subsets {
            subset.sort_unstable();
        }
        PerProcessorPatchSet { subsets }
    }

    /// Return the patches of `grid` the given rank may need data from: the
    /// patches within `max_ghost` cells of each patch it owns (or owned on
    /// the previous grid), the coarser patches under that halo widened by one
    /// coarse cell per unit of refinement, and the finer patches within one
    /// fine cell. On a regrid, the new patches overlapping the old patches
    /// this rank owned are added, so that old data can be moved.
    fn create_neighborhood(&self, grid: &Grid, old_grid: Option<&Grid>, rank: usize, max_ghost: usize) -> BTreeSet<PatchId> {
        let mut neighbors = BTreeSet::new();
        let regrid = old_grid.filter(|old| old.generation() != grid.generation());

        for patch in grid.patches() {
            let proc = self.patchwise_processor_assignment(grid, patch);
            let old_proc = match regrid {
                Some(old) if patch.id() < old.num_patches() => self.old_processor_assignment(old, old.patch(patch.id())),
                _ => proc,
            };
            if proc != rank && old_proc != rank {
                continue;
            }
            let level = grid.level(patch.level());
            let cells = patch.cells();

            for n in level.select_patches(&cells.extend_all(max_ghost as i64)) {
                neighbors.insert(n.id());
            }
            if let Some(coarse) = grid.coarser(patch.level()) {
                let r = level.refinement_ratio();
                let halo = cells.coarsen(r).extend_all(r.0.max(r.1).max(r.2));
                for n in coarse.select_patches(&halo) {
                    neighbors.insert(n.id());
                }
            }
            if let Some(fine) = grid.finer(patch.level()) {
                let halo = cells.refine(fine.refinement_ratio()).extend_all(1);
                for n in fine.select_patches(&halo) {
                    neighbors.insert(n.id());
                }
            }
        }
        if let Some(old) = regrid {
            for old_patch in old.patches() {
                if old_patch.level() >= grid.num_levels() || self.old_processor_assignment(old, old_patch) != rank {
                    continue;
                }
                for n in grid.level(old_patch.level()).select_patches(old_patch.cells()) {
                    neighbors.insert(n.id());
                }
            }
        }
        neighbors
    }
}




/// The default policy: the patches of each level, in level order, are split
/// into contiguous runs of nearly equal length, one run per processing
/// element.
///
#[derive(Clone, Copy, Debug)]
pub struct ContiguousLoadBalancer {
    num_processors: usize,
}




/// One rank's view of how a grid is distributed.
///
pub struct Distribution {
    rank: usize,
    num_processors: usize,
    max_ghost: usize,
    grid_generation: usize,
    owners: Vec<usize>,
    levels: Vec<PerProcessorPatchSet>,
    whole: PerProcessorPatchSet,
    neighborhood: BTreeSet<PatchId>,
}




// ============================================================================
impl PerProcessorPatchSet {


    pub fn len(&self) -> usize {
        self.subsets.len()
    }


    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }


    /**
     * Return the patches owned by a rank.
     */
    pub fn subset(&self, rank: usize) -> &[PatchId] {
        &self.subsets[rank]
    }


    pub fn iter(&self) -> impl Iterator<Item = &[PatchId]> {
        self.subsets.iter().map(|s| s.as_slice())
    }


    /**
     * Return the rank whose subset holds a patch, if any.
     */
    pub fn owner(&self, patch: PatchId) -> Option<usize> {
        self.subsets.iter().position(|s| s.binary_search(&patch).is_ok())
    }
}




// ============================================================================
impl ContiguousLoadBalancer {
    pub fn new(num_processors: usize) -> Self {
        assert!(num_processors > 0, "at least one processing element is needed");
        Self { num_processors }
    }
}

impl LoadBalancer for ContiguousLoadBalancer {
    fn num_processors(&self) -> usize {
        self.num_processors
    }

    fn patchwise_processor_assignment(&self, grid: &Grid, patch: &Patch) -> usize {
        let n = grid.level(patch.level()).patches().len();
        patch.index_in_level() * self.num_processors / n
    }
}




// ============================================================================
impl Distribution {


    /**
     * Apply a load balancer to a grid, from the point of view of one rank.
     */
    pub fn new(lb: &dyn LoadBalancer, grid: &Grid, old_grid: Option<&Grid>, rank: usize, max_ghost: usize) -> Self {
        assert!(rank < lb.num_processors(), "rank {} out of {}", rank, lb.num_processors());

        let levels = (0..grid.num_levels())
            .map(|l| lb.create_per_processor_patch_set(grid, Some(l)))
            .collect();
        let whole = lb.create_per_processor_patch_set(grid, None);
        let owners = grid
            .patches()
            .map(|p| lb.patchwise_processor_assignment(grid, p))
            .collect();

        Self {
            rank,
            num_processors: lb.num_processors(),
            max_ghost,
            grid_generation: grid.generation(),
            owners,
            levels,
            whole,
            neighborhood: lb.create_neighborhood(grid, old_grid, rank, max_ghost),
        }
    }


    /**
     * A distribution for a single processing element that owns everything.
     */
    pub fn serial(grid: &Grid) -> Self {
        Self::new(&ContiguousLoadBalancer::new(1), grid, None, 0, MAX_GHOST)
    }


    pub fn rank(&self) -> usize {
        self.rank
    }


    pub fn num_processors(&self) -> usize {
        self.num_processors
    }


    /**
     * Return the generation of the grid this snapshot was made for.
     */
    pub fn grid_generation(&self) -> usize {
        self.grid_generation
    }


    pub fn owner(&self, patch: PatchId) -> usize {
        self.owners[patch]
    }


    pub fn is_local(&self, patch: PatchId) -> bool {
        self.owners[patch] == self.rank
    }


    /**
     * Return the per-processor patch set of one level, or of the whole grid
     * if `level` is `None`.
     */
    pub fn patch_set(&self, level: Option<usize>) -> &PerProcessorPatchSet {
        match level {
            Some(level) => &self.levels[level],
            None => &self.whole,
        }
    }


    /**
     * Return the patches owned here, on one level or on the whole grid.
     */
    pub fn local_patches<'g>(&self, grid: &'g Grid, level: Option<usize>) -> Vec<&'g Patch> {
        self.patch_set(level)
            .subset(self.rank)
            .iter()
            .map(|&id| grid.patch(id))
            .collect()
    }


    pub fn neighborhood(&self) -> &BTreeSet<PatchId> {
        &self.neighborhood
    }


    /**
     * Determine whether any of the given patches is in this rank's
     * neighborhood. An empty list counts as being in the neighborhood.
     */
    pub fn in_neighborhood(&self, patches: &[PatchId]) -> bool {
        patches.is_empty() || patches.iter().any(|p| self.neighborhood.contains(p))
    }


    /**
     * Recompute the patch sets and the neighborhood if the grid has changed
     * since this snapshot was made, or unconditionally if `force` is set.
     * Returns whether the assignment of any patch changed.
     */
    pub fn possibly_dynamically_reallocate(
        &mut self,
        lb: &dyn LoadBalancer,
        grid: &Grid,
        old_grid: Option<&Grid>,
        force: bool,
    ) -> bool {
        if !force && grid.generation() == self.grid_generation {
            return false;
        }
        let next = Self::new(lb, grid, old_grid, self.rank, self.max_ghost);
        let changed = next.owners != self.owners || next.grid_generation != self.grid_generation;

        if changed {
            info!("rank {} reallocated {} patches on grid generation {}", self.rank, next.owners.len(), grid.generation());
        }
        *self = next;
        changed
    }
}
