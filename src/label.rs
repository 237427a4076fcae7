//! Field labels are process-wide identities for the quantities tasks read and
//! write. They are interned in an append-only table: a label is created once
//! (normally at startup, while tasks are being defined), and the returned
//! handle is a small `Copy` value that is cheap to hash and compare. Looking
//! a name up again returns the same handle, so ranks running in the same
//! process agree on label identities.

use crate::index_space::{Axis, IndexSpace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};




/**
 * Where a grid variable's values live relative to the cells of a patch
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Cell,
    FaceX,
    FaceY,
    FaceZ,
}




/**
 * The element type of a grid variable
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Double,
    Stencil7,
}




/**
 * The binary operator used to combine contributions to a reduction variable
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionOp {
    Max,
    Min,
    Sum,
}




#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LabelKind {
    Grid { element: ElementType, location: Location },
    Reduction(ReductionOp),
}




/**
 * Handle to an interned field label
 */
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);




struct LabelInfo {
    name: String,
    kind: LabelKind,
}

#[derive(Default)]
struct Registry {
    infos: Vec<&'static LabelInfo>,
    by_name: HashMap<String, Label>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}




// ============================================================================
impl Location {
    pub fn face(axis: Axis) -> Self {
        match axis {
            Axis::I => Location::FaceX,
            Axis::J => Location::FaceY,
            Axis::K => Location::FaceZ,
        }
    }

    /**
     * Return the normal axis of a face-centered location.
     */
    pub fn axis(self) -> Option<Axis> {
        match self {
            Location::Cell => None,
            Location::FaceX => Some(Axis::I),
            Location::FaceY => Some(Axis::J),
            Location::FaceZ => Some(Axis::K),
        }
    }

    /**
     * Map a space of cells onto the index space of values at this location.
     * Face index `i` is the face on the low side of cell `i`, so the faces of
     * a block of cells extend one index further on the normal axis.
     */
    pub fn space(self, cells: &IndexSpace) -> IndexSpace {
        match self.axis() {
            None => cells.clone(),
            Some(axis) => cells.extend_axis(axis, 0, 1),
        }
    }
}




// ============================================================================
impl ReductionOp {
    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            ReductionOp::Max => a.max(b),
            ReductionOp::Min => a.min(b),
            ReductionOp::Sum => a + b,
        }
    }
}




// ============================================================================
impl Label {


    /**
     * Intern a label. Registering an existing name again returns the existing
     * handle; registering it with a different kind is a programming error and
     * panics.
     */
    pub fn new(name: &str, kind: LabelKind) -> Self {
        if let Some(label) = Self::find(name) {
            assert!(
                label.kind() == kind,
                "label {} registered twice with different kinds", name);
            return label;
        }
        let mut reg = registry().write().unwrap_or_else(|e| e.into_inner());

        if let Some(&label) = reg.by_name.get(name) {
            return label;
        }
        let label = Label(reg.infos.len() as u32);
        let info: &'static LabelInfo = Box::leak(Box::new(LabelInfo { name: name.to_string(), kind }));
        reg.infos.push(info);
        reg.by_name.insert(name.to_string(), label);
        label
    }


    /**
     * A cell-centered label holding doubles.
     */
    pub fn cell(name: &str) -> Self {
        Self::new(name, LabelKind::Grid { element: ElementType::Double, location: Location::Cell })
    }


    /**
     * A cell-centered label holding seven-point stencils.
     */
    pub fn stencil(name: &str) -> Self {
        Self::new(name, LabelKind::Grid { element: ElementType::Stencil7, location: Location::Cell })
    }


    /**
     * A face-centered label holding doubles, on faces normal to `axis`.
     */
    pub fn face(name: &str, axis: Axis) -> Self {
        Self::new(name, LabelKind::Grid { element: ElementType::Double, location: Location::face(axis) })
    }


    pub fn reduction(name: &str, op: ReductionOp) -> Self {
        Self::new(name, LabelKind::Reduction(op))
    }


    pub fn find(name: &str) -> Option<Self> {
        let reg = registry().read().unwrap_or_else(|e| e.into_inner());
        reg.by_name.get(name).copied()
    }


    fn info(self) -> &'static LabelInfo {
        let reg = registry().read().unwrap_or_else(|e| e.into_inner());
        reg.infos[self.0 as usize]
    }


    pub fn name(self) -> &'static str {
        &self.info().name
    }


    pub fn kind(self) -> LabelKind {
        self.info().kind
    }


    pub fn is_reduction(self) -> bool {
        matches!(self.kind(), LabelKind::Reduction(_))
    }


    /**
     * Return the location of a grid label; reductions are reported as
     * cell-centered.
     */
    pub fn location(self) -> Location {
        match self.kind() {
            LabelKind::Grid { location, .. } => location,
            LabelKind::Reduction(_) => Location::Cell,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({})", self.name())
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Label, LabelKind, Location, ReductionOp};
    use crate::index_space::{range3d, Axis};

    #[test]
    fn labels_are_interned_by_name() {
        let a = Label::cell("label_test_a");
        let b = Label::cell("label_test_a");
        assert_eq!(a, b);
        assert_eq!(Label::find("label_test_a"), Some(a));
        assert_eq!(a.name(), "label_test_a");
        assert_ne!(a, Label::reduction("label_test_b", ReductionOp::Max));
    }

    #[test]
    #[should_panic]
    fn relabelling_with_another_kind_panics() {
        Label::cell("label_test_c");
        Label::new("label_test_c", LabelKind::Reduction(ReductionOp::Sum));
    }

    #[test]
    fn face_locations_extend_the_normal_axis() {
        let cells = range3d(0..4, 0..4, 0..4);
        assert_eq!(Location::face(Axis::J).space(&cells), range3d(0..4, 0..5, 0..4));
        assert_eq!(Location::Cell.space(&cells), cells);
    }
}
