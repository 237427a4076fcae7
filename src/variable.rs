use crate::index_space::{Index, IndexSpace};
use crate::label::ElementType;
use crate::patch::Face;
use serde::{Deserialize, Serialize};
use std::ops;




/**
 * An array of values over a rectangular index space, stored in row-major
 * order. This is the payload of a variable instance: its space is the owning
 * patch's cells (or faces) plus whatever ghost layer was requested.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    space: IndexSpace,
    data: Vec<T>,
}




/**
 * Coefficients of a seven-point stencil: the diagonal `p`, and the east/west,
 * north/south, top/bottom neighbors along x, y, and z.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stencil7 {
    pub p: f64,
    pub e: f64,
    pub w: f64,
    pub n: f64,
    pub s: f64,
    pub t: f64,
    pub b: f64,
}




/// The payload types a grid variable can hold. Each element type knows how
/// to wrap itself into, and find itself inside, the type-erased `Variable`
/// that the data store keeps.
///
pub trait Element: Clone + Default + Send + Sync + 'static {
    const TYPE: ElementType;

    fn wrap(field: Field<Self>) -> Variable;

    fn view(var: &Variable) -> Option<&Field<Self>>;

    fn view_mut(var: &mut Variable) -> Option<&mut Field<Self>>;
}




/**
 * A type-erased grid variable
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    Double(Field<f64>),
    Stencil(Field<Stencil7>),
}




// ============================================================================
impl<T: Clone + Default> Field<T> {


    /**
     * Allocate a field over the given space, with every value at the
     * element default.
     */
    pub fn new(space: IndexSpace) -> Self {
        Self::filled(space, T::default())
    }


    pub fn filled(space: IndexSpace, value: T) -> Self {
        let data = vec![value; space.len()];
        Self { space, data }
    }


    /**
     * Generate a field with values defined from a closure of the index.
     */
    pub fn from_fn<F: FnMut(Index) -> T>(space: IndexSpace, f: F) -> Self {
        let data = space.iter().map(f).collect();
        Self { space, data }
    }


    pub fn space(&self) -> &IndexSpace {
        &self.space
    }


    pub fn get(&self, index: Index) -> Option<&T> {
        if self.space.contains(index) {
            Some(&self.data[self.space.row_major_offset(index)])
        } else {
            None
        }
    }


    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        if self.space.contains(index) {
            let n = self.space.row_major_offset(index);
            Some(&mut self.data[n])
        } else {
            None
        }
    }


    pub fn fill(&mut self, value: T) {
        for x in &mut self.data {
            *x = value.clone()
        }
    }


    /**
     * Copy the values of another field into this one, over the part of the
     * region covered by both fields.
     */
    pub fn copy_region(&mut self, other: &Field<T>, region: &IndexSpace) {
        let overlap = region
            .intersect(&self.space)
            .and_then(|r| r.intersect(&other.space));

        if let Some(overlap) = overlap {
            for index in overlap.iter() {
                let n = self.space.row_major_offset(index);
                self.data[n] = other.data[other.space.row_major_offset(index)].clone();
            }
        }
    }


    /**
     * Return an iterator over (index, value) pairs in row-major order.
     */
    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> + '_ {
        self.space.iter().zip(self.data.iter())
    }


    pub fn as_slice(&self) -> &[T] {
        &self.data
    }


    fn validate_index(&self, index: Index) {
        if !self.space.contains(index) {
            let (s, e) = (self.space.start(), self.space.end());
            panic!("index {:?} out of range on field ({}..{} {}..{} {}..{})",
                index, s.0, e.0, s.1, e.1, s.2, e.2);
        }
    }
}

impl<T: Clone + Default> ops::Index<Index> for Field<T> {
    type Output = T;

    fn index(&self, index: Index) -> &T {
        self.validate_index(index);
        &self.data[self.space.row_major_offset(index)]
    }
}

impl<T: Clone + Default> ops::IndexMut<Index> for Field<T> {
    fn index_mut(&mut self, index: Index) -> &mut T {
        self.validate_index(index);
        let n = self.space.row_major_offset(index);
        &mut self.data[n]
    }
}




// ============================================================================
impl Stencil7 {
    /**
     * Return the sum of the six off-diagonal coefficients.
     */
    pub fn off_diagonal_sum(&self) -> f64 {
        self.e + self.w + self.n + self.s + self.t + self.b
    }
}

impl ops::Index<Face> for Stencil7 {
    type Output = f64;

    fn index(&self, face: Face) -> &f64 {
        match face {
            Face::XPlus => &self.e,
            Face::XMinus => &self.w,
            Face::YPlus => &self.n,
            Face::YMinus => &self.s,
            Face::ZPlus => &self.t,
            Face::ZMinus => &self.b,
        }
    }
}

impl ops::IndexMut<Face> for Stencil7 {
    fn index_mut(&mut self, face: Face) -> &mut f64 {
        match face {
            Face::XPlus => &mut self.e,
            Face::XMinus => &mut self.w,
            Face::YPlus => &mut self.n,
            Face::YMinus => &mut self.s,
            Face::ZPlus => &mut self.t,
            Face::ZMinus => &mut self.b,
        }
    }
}




// ============================================================================
impl Element for f64 {
    const TYPE: ElementType = ElementType::Double;

    fn wrap(field: Field<Self>) -> Variable {
        Variable::Double(field)
    }

    fn view(var: &Variable) -> Option<&Field<Self>> {
        match var {
            Variable::Double(f) => Some(f),
            _ => None,
        }
    }

    fn view_mut(var: &mut Variable) -> Option<&mut Field<Self>> {
        match var {
            Variable::Double(f) => Some(f),
            _ => None,
        }
    }
}

impl Element for Stencil7 {
    const TYPE: ElementType = ElementType::Stencil7;

    fn wrap(field: Field<Self>) -> Variable {
        Variable::Stencil(field)
    }

    fn view(var: &Variable) -> Option<&Field<Self>> {
        match var {
            Variable::Stencil(f) => Some(f),
            _ => None,
        }
    }

    fn view_mut(var: &mut Variable) -> Option<&mut Field<Self>> {
        match var {
            Variable::Stencil(f) => Some(f),
            _ => None,
        }
    }
}

impl Variable {
    pub fn space(&self) -> &IndexSpace {
        match self {
            Variable::Double(f) => f.space(),
            Variable::Stencil(f) => f.space(),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Variable::Double(_) => ElementType::Double,
            Variable::Stencil(_) => ElementType::Stencil7,
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Field, Stencil7};
    use crate::index_space::range3d;
    use crate::patch::Face;

    #[test]
    fn copy_region_only_touches_the_overlap() {
        let mut a = Field::filled(range3d(0..4, 0..4, 0..1), 0.0);
        let b = Field::filled(range3d(2..6, 0..4, 0..1), 1.0);
        a.copy_region(&b, &range3d(0..8, 0..8, 0..8));
        assert_eq!(a[(1, 0, 0)], 0.0);
        assert_eq!(a[(2, 3, 0)], 1.0);
        assert_eq!(a.as_slice().iter().sum::<f64>(), 8.0);
    }

    #[test]
    #[should_panic]
    fn writing_outside_the_field_panics() {
        let mut a: Field<f64> = Field::new(range3d(0..2, 0..2, 0..2));
        a[(2, 0, 0)] = 1.0;
    }

    #[test]
    fn stencil_is_indexed_by_face() {
        let mut a = Stencil7::default();
        a[Face::XPlus] = -1.0;
        a[Face::ZMinus] = -2.0;
        assert_eq!(a.e, -1.0);
        assert_eq!(a.b, -2.0);
        assert_eq!(a.off_diagonal_sum(), -3.0);
    }
}
