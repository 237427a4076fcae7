use crate::index_space::{Axis, Index, IndexSpace};
use crate::patch::{Face, Patch, PatchId};
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_GENERATION: AtomicUsize = AtomicUsize::new(0);




/**
 * A uniform-resolution collection of patches. Level 0 is the coarsest; the
 * refinement ratio of level `n` is relative to level `n - 1`.
 */
#[derive(Clone, Debug)]
pub struct Level {
    index: usize,
    ratio: Index,
    spacing: [f64; 3],
    domain: IndexSpace,
    patches: Vec<Patch>,
}




/**
 * One link across a coarse/fine interface: the fine cell just inside a fine
 * patch's interface face, and the coarse cell on the other side of that face.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct CfiLink {
    pub fine_patch: PatchId,
    pub face: Face,
    pub fine_cell: Index,
    pub coarse_cell: Index,
}




/**
 * The ordered list of levels for one timestep. Every grid carries a
 * generation number, distinct for every grid built in the process, so that
 * consumers can tell when a regrid has happened.
 */
#[derive(Clone, Debug)]
pub struct Grid {
    levels: Vec<Level>,
    generation: usize,
}




/**
 * Accumulates level descriptions and produces a `Grid`.
 */
pub struct GridBuilder {
    domain: IndexSpace,
    spacing: [f64; 3],
    levels: Vec<(Index, Vec<IndexSpace>)>,
}




// ============================================================================
impl Level {


    pub fn index(&self) -> usize {
        self.index
    }


    /**
     * Return the refinement ratio relative to the next coarser level.
     */
    pub fn refinement_ratio(&self) -> Index {
        self.ratio
    }


    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }


    pub fn cell_volume(&self) -> f64 {
        self.spacing.iter().product()
    }


    /**
     * Return the area of a cell face normal to the given axis.
     */
    pub fn face_area(&self, axis: Axis) -> f64 {
        self.cell_volume() / self.spacing[axis.dim()]
    }


    /**
     * Return the whole problem domain in this level's index space.
     */
    pub fn domain(&self) -> &IndexSpace {
        &self.domain
    }


    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }


    /**
     * Return the patches of this level whose cells intersect the given
     * region.
     */
    pub fn select_patches(&self, region: &IndexSpace) -> Vec<&Patch> {
        self.patches
            .iter()
            .filter(|p| p.cells().overlaps(region))
            .collect()
    }


    /**
     * Determine whether some patch of this level owns the given cell.
     */
    pub fn covers(&self, cell: Index) -> bool {
        self.patches.iter().any(|p| p.contains(cell))
    }


    /**
     * Map a cell on this level to the cell containing it on the next
     * coarser level.
     */
    pub fn map_cell_to_coarser(&self, cell: Index) -> Index {
        let r = self.ratio;
        (cell.0.div_euclid(r.0), cell.1.div_euclid(r.1), cell.2.div_euclid(r.2))
    }
}




// ============================================================================
impl Grid {


    pub fn builder(domain: IndexSpace, spacing: [f64; 3]) -> GridBuilder {
        GridBuilder { domain, spacing, levels: Vec::new() }
    }


    pub fn generation(&self) -> usize {
        self.generation
    }


    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }


    pub fn levels(&self) -> &[Level] {
        &self.levels
    }


    pub fn level(&self, index: usize) -> &Level {
        &self.levels[index]
    }


    pub fn finer(&self, level: usize) -> Option<&Level> {
        self.levels.get(level + 1)
    }


    pub fn coarser(&self, level: usize) -> Option<&Level> {
        level.checked_sub(1).map(|l| &self.levels[l])
    }


    /**
     * Return an iterator over the patches of every level, coarsest first.
     */
    pub fn patches(&self) -> impl Iterator<Item = &Patch> {
        self.levels.iter().flat_map(|l| l.patches.iter())
    }


    pub fn num_patches(&self) -> usize {
        self.levels.iter().map(|l| l.patches.len()).sum()
    }


    /**
     * Look up a patch by id. Panics if the id does not belong to this grid.
     */
    pub fn patch(&self, id: PatchId) -> &Patch {
        let mut n = id;
        for level in &self.levels {
            if n < level.patches.len() {
                return &level.patches[n];
            }
            n -= level.patches.len();
        }
        panic!("patch {} is not part of grid generation {}", id, self.generation)
    }


    /**
     * Map a cell on the given level to the first cell it covers on the next
     * finer level.
     */
    pub fn map_cell_to_finer(&self, level: usize, cell: Index) -> Index {
        let r = self.levels[level + 1].ratio;
        (cell.0 * r.0, cell.1 * r.1, cell.2 * r.2)
    }


    /**
     * Return the patches on the next finer level lying over the given coarse
     * patch.
     */
    pub fn fine_patches(&self, coarse: &Patch) -> Vec<&Patch> {
        match self.finer(coarse.level()) {
            Some(fine) => fine.select_patches(&coarse.cells().refine(fine.ratio)),
            None => Vec::new(),
        }
    }


    /**
     * Return the patches on the next coarser level lying under the given fine
     * patch.
     */
    pub fn coarse_patches(&self, fine: &Patch) -> Vec<&Patch> {
        let ratio = self.levels[fine.level()].ratio;
        match self.coarser(fine.level()) {
            Some(coarse) => coarse.select_patches(&fine.cells().coarsen(ratio)),
            None => Vec::new(),
        }
    }


    /**
     * Return the overlap of a coarse patch and a fine patch, as a pair of
     * (coarse cells, fine cells). `None` if they do not overlap.
     */
    pub fn fine_level_range(&self, coarse: &Patch, fine: &Patch) -> Option<(IndexSpace, IndexSpace)> {
        let ratio = self.levels[fine.level()].ratio;
        let fine_cells = coarse.cells().refine(ratio).intersect(fine.cells())?;
        let coarse_cells = fine_cells.coarsen(ratio);
        Some((coarse_cells, fine_cells))
    }


    /**
     * Determine whether a cell on the given level lies under a patch of the
     * next finer level.
     */
    pub fn is_under_finer(&self, level: usize, cell: Index) -> bool {
        match self.finer(level) {
            Some(fine) => {
                let region = IndexSpace::new(cell.0..cell.0 + 1, cell.1..cell.1 + 1, cell.2..cell.2 + 1);
                !fine.select_patches(&region.refine(fine.ratio)).is_empty()
            }
            None => false,
        }
    }


    /**
     * Return the faces of a patch that lie on a coarse/fine interface: the
     * cells just outside the face are inside the domain but not covered by
     * another patch on the same level. Level 0 has no such faces.
     */
    pub fn coarse_fine_interface_faces(&self, patch: &Patch) -> Vec<Face> {
        if patch.level() == 0 {
            return Vec::new();
        }
        let level = &self.levels[patch.level()];

        Face::ALL
            .iter()
            .copied()
            .filter(|&face| {
                patch
                    .exterior_face_cells(face)
                    .intersect(&level.domain)
                    .map(|outside| outside.iter().any(|c| !level.covers(c)))
                    .unwrap_or(false)
            })
            .collect()
    }


    /**
     * Return every link across the coarse/fine interface faces of a fine
     * patch. Each fine cell just inside an interface face is paired with the
     * coarse cell across that face.
     */
    pub fn cfi_links(&self, fine_patch: &Patch) -> Vec<CfiLink> {
        let level = &self.levels[fine_patch.level()];
        let mut links = Vec::new();

        for face in self.coarse_fine_interface_faces(fine_patch) {
            let outside = match fine_patch.exterior_face_cells(face).intersect(&level.domain) {
                Some(outside) => outside,
                None => continue,
            };
            for exterior in outside.iter().filter(|&c| !level.covers(c)) {
                links.push(CfiLink {
                    fine_patch: fine_patch.id(),
                    face,
                    fine_cell: face.opposite().neighbor(exterior),
                    coarse_cell: level.map_cell_to_coarser(exterior),
                })
            }
        }
        links
    }


    /**
     * Return the coarse/fine links whose coarse cell is owned by the given
     * coarse patch, gathered from every fine patch on the next finer level
     * that borders it.
     */
    pub fn coarse_fine_links(&self, coarse_patch: &Patch) -> Vec<CfiLink> {
        let fine = match self.finer(coarse_patch.level()) {
            Some(fine) => fine,
            None => return Vec::new(),
        };
        let halo = coarse_patch.cells().extend_all(1).refine(fine.ratio);

        fine.select_patches(&halo)
            .into_iter()
            .flat_map(|p| self.cfi_links(p))
            .filter(|link| coarse_patch.contains(link.coarse_cell))
            .collect()
    }
}




// ============================================================================
impl GridBuilder {


    /**
     * Add level 0, covering the domain with the given patches.
     */
    pub fn base_level(self, patches: Vec<IndexSpace>) -> Self {
        self.level((1, 1, 1), patches)
    }


    /**
     * Add a finer level with the given refinement ratio relative to the
     * previous level. The patch boxes are in the new level's index space.
     */
    pub fn level(mut self, ratio: Index, patches: Vec<IndexSpace>) -> Self {
        self.levels.push((ratio, patches));
        self
    }


    pub fn build(self) -> Grid {
        let mut levels = Vec::new();
        let mut domain = self.domain;
        let mut spacing = self.spacing;
        let mut next_id = 0;

        for (index, (ratio, boxes)) in self.levels.into_iter().enumerate() {
            if index > 0 {
                domain = domain.refine(ratio);
                spacing = [
                    spacing[0] / ratio.0 as f64,
                    spacing[1] / ratio.1 as f64,
                    spacing[2] / ratio.2 as f64,
                ];
            }
            for (n, a) in boxes.iter().enumerate() {
                assert!(domain.contains_space(a), "patch {:?} lies outside level {} domain", a, index);
                assert!(
                    boxes[..n].iter().all(|b| !b.overlaps(a)),
                    "patches on level {} overlap",
                    index);
            }
            let patches = boxes
                .into_iter()
                .enumerate()
                .map(|(n, cells)| {
                    next_id += 1;
                    Patch::new(next_id - 1, index, n, cells)
                })
                .collect();

            levels.push(Level {
                index,
                ratio,
                spacing,
                domain: domain.clone(),
                patches,
            });
        }

        Grid {
            levels,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }
}




/**
 * Split an index space into boxes of at most the given size on each axis.
 */
pub fn tile(space: &IndexSpace, size: Index) -> Vec<IndexSpace> {
    let steps = |r: core::ops::Range<i64>, n: i64| {
        (r.start..r.end)
            .step_by(n as usize)
            .map(move |s| s..(s + n).min(r.end))
            .collect::<Vec<_>>()
    };
    let mut boxes = Vec::new();

    for di in steps(space.range(Axis::I), size.0) {
        for dj in steps(space.range(Axis::J), size.1) {
            for dk in steps(space.range(Axis::K), size.2) {
                boxes.push(IndexSpace::new(di.clone(), dj.clone(), dk))
            }
        }
    }
    boxes
}




// ============================================================================
#[cfg(test)]
pub(crate) mod test {

    use super::{tile, Grid};
    use crate::index_space::range3d;
    use crate::patch::Face;

    /// Two levels: an 8^3 coarse domain in eight 4^3 patches, and one 4^3
    /// fine patch (ratio 2) covering coarse cells 2..4 on every axis.
    ///
    pub(crate) fn two_level_grid() -> Grid {
        let domain = range3d(0..8, 0..8, 0..8);
        Grid::builder(domain.clone(), [1.0, 1.0, 1.0])
            .base_level(tile(&domain, (4, 4, 4)))
            .level((2, 2, 2), vec![range3d(4..8, 4..8, 4..8)])
            .build()
    }


    #[test]
    fn patch_ids_are_dense_across_levels() {
        let grid = two_level_grid();
        assert_eq!(grid.num_patches(), 9);
        assert_eq!(grid.patch(8).level(), 1);
        assert_eq!(grid.level(1).cell_volume(), 0.125);
    }


    #[test]
    fn fine_patch_has_six_interface_faces() {
        let grid = two_level_grid();
        let fine = grid.patch(8);
        assert_eq!(grid.coarse_fine_interface_faces(fine).len(), 6);
        assert_eq!(grid.cfi_links(fine).len(), 6 * 16);
    }


    #[test]
    fn coarse_fine_links_are_split_between_coarse_patches() {
        let grid = two_level_grid();
        let total: usize = grid.level(0).patches().iter().map(|p| grid.coarse_fine_links(p).len()).sum();
        assert_eq!(total, 6 * 16);

        let link = grid
            .cfi_links(grid.patch(8))
            .into_iter()
            .find(|l| l.face == Face::XMinus)
            .unwrap();
        assert_eq!(link.fine_cell.0, 4);
        assert_eq!(link.coarse_cell.0, 1);
    }


    #[test]
    fn cells_under_fine_patches_are_detected() {
        let grid = two_level_grid();
        assert!(grid.is_under_finer(0, (2, 3, 2)));
        assert!(!grid.is_under_finer(0, (1, 3, 2)));
        assert!(!grid.is_under_finer(1, (4, 4, 4)));
    }
}
