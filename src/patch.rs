use crate::index_space::{shift, Axis, Index, IndexSpace};
use serde::{Deserialize, Serialize};




/**
 * Grid-wide unique identifier of a patch. Ids are dense: they number the
 * patches of level 0 first, then level 1, and so on.
 */
pub type PatchId = usize;




/**
 * One of the six logical faces of a patch (or of a cell)
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Face {
    XMinus,
    XPlus,
    YMinus,
    YPlus,
    ZMinus,
    ZPlus,
}




// ============================================================================
impl Face {
    pub const ALL: [Face; 6] = [
        Face::XMinus,
        Face::XPlus,
        Face::YMinus,
        Face::YPlus,
        Face::ZMinus,
        Face::ZPlus,
    ];

    pub fn new(axis: Axis, upper: bool) -> Self {
        match (axis, upper) {
            (Axis::I, false) => Face::XMinus,
            (Axis::I, true) => Face::XPlus,
            (Axis::J, false) => Face::YMinus,
            (Axis::J, true) => Face::YPlus,
            (Axis::K, false) => Face::ZMinus,
            (Axis::K, true) => Face::ZPlus,
        }
    }

    pub fn axis(self) -> Axis {
        match self {
            Face::XMinus | Face::XPlus => Axis::I,
            Face::YMinus | Face::YPlus => Axis::J,
            Face::ZMinus | Face::ZPlus => Axis::K,
        }
    }

    /**
     * Whether this is the face at the upper end of its axis.
     */
    pub fn is_upper(self) -> bool {
        matches!(self, Face::XPlus | Face::YPlus | Face::ZPlus)
    }

    /**
     * The unit step from a cell to its neighbor across this face: +1 for
     * upper faces, -1 for lower ones.
     */
    pub fn sign(self) -> i64 {
        if self.is_upper() { 1 } else { -1 }
    }

    pub fn opposite(self) -> Self {
        Face::new(self.axis(), !self.is_upper())
    }

    /**
     * Return the index of the neighbor across this face.
     */
    pub fn neighbor(self, index: Index) -> Index {
        shift(index, self.axis(), self.sign())
    }
}




/**
 * A rectangular block of cells on one level of the AMR hierarchy. Patches
 * are immutable once the grid is built; a regrid produces a new grid.
 */
#[derive(Clone, Debug)]
pub struct Patch {
    id: PatchId,
    level: usize,
    index: usize,
    cells: IndexSpace,
}




// ============================================================================
impl Patch {


    pub(crate) fn new(id: PatchId, level: usize, index: usize, cells: IndexSpace) -> Self {
        assert!(!cells.is_empty(), "patch {} has no cells", id);
        Self { id, level, index, cells }
    }


    pub fn id(&self) -> PatchId {
        self.id
    }


    /**
     * Return the index of the level this patch lives on.
     */
    pub fn level(&self) -> usize {
        self.level
    }


    /**
     * Return the position of this patch within its level.
     */
    pub fn index_in_level(&self) -> usize {
        self.index
    }


    /**
     * Return the cells owned by this patch, in the level's index space.
     */
    pub fn cells(&self) -> &IndexSpace {
        &self.cells
    }


    pub fn contains(&self, index: Index) -> bool {
        self.cells.contains(index)
    }


    /**
     * Return the layer of interior cells that touch the given face.
     */
    pub fn interior_face_cells(&self, face: Face) -> IndexSpace {
        self.cells.layer(face.axis(), face.is_upper())
    }


    /**
     * Return the layer of cells just outside the given face.
     */
    pub fn exterior_face_cells(&self, face: Face) -> IndexSpace {
        let layer = self.interior_face_cells(face);
        let r = layer.range(face.axis());
        layer.with_range(face.axis(), r.start + face.sign() .. r.end + face.sign())
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Face, Patch};
    use crate::index_space::range3d;

    #[test]
    fn face_layers_sit_on_either_side_of_the_face() {
        let patch = Patch::new(0, 0, 0, range3d(0..4, 0..4, 0..4));
        assert_eq!(patch.interior_face_cells(Face::XPlus), range3d(3..4, 0..4, 0..4));
        assert_eq!(patch.exterior_face_cells(Face::XPlus), range3d(4..5, 0..4, 0..4));
        assert_eq!(patch.exterior_face_cells(Face::ZMinus), range3d(0..4, 0..4, -1..0));
        assert_eq!(Face::YMinus.neighbor((1, 1, 1)), (1, 0, 1));
        assert_eq!(Face::YMinus.opposite(), Face::YPlus);
    }
}
