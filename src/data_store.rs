//! The versioned data store. A `DataStore` is one generation of variables
//! keyed by (label, material, patch); `Warehouses` is the arena of all live
//! generations, two per scheduler nesting depth. Variable payloads are held
//! under `Arc`, so transfers between generations share the payload instead
//! of copying it, and a modification after a transfer copies on write.

use crate::error::{Error, Result};
use crate::grid::{Grid, Level};
use crate::index_space::IndexSpace;
use crate::label::{Label, LabelKind, Location};
use crate::material::MaterialSubset;
use crate::patch::{Patch, PatchId};
use crate::variable::{Element, Field, Variable};
use log::debug;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;




/**
 * Key of a grid variable instance in a store
 */
pub type VarKey = (Label, i32, PatchId);




/**
 * Whether a store may release a variable once its last declared consumer has
 * run (`Complete`), or must keep everything (`None`).
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrubMode {
    None,
    Complete,
}




/**
 * Selects one of the four generations visible to a scheduler
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WhichDw {
    Old,
    New,
    ParentOld,
    ParentNew,
}




#[derive(Clone)]
struct Entry {
    var: Arc<Variable>,
    producer: Arc<str>,
    foreign: bool,
}




/**
 * One generation of variables
 */
pub struct DataStore {
    generation: usize,
    max_ghost: usize,
    vars: HashMap<VarKey, Entry>,
    reductions: HashMap<(Label, i32), f64>,
    scrub_mode: ScrubMode,
    scrub_counts: HashMap<VarKey, usize>,
    aborted: bool,
    restarted: bool,
}




/**
 * Arena of live generations. The scheduler at nesting depth `d` owns the
 * pair at indexes `2d` (old) and `2d + 1` (new); the pair below it is its
 * parent's.
 */
pub struct Warehouses {
    stores: Vec<DataStore>,
    max_ghost: usize,
    next_generation: usize,
}




/**
 * Holds a scrub mode on a set of generations, and restores the previous
 * modes when dropped, on every exit path.
 */
pub struct ScrubGuard<'a> {
    stores: &'a mut Warehouses,
    saved: Vec<(usize, ScrubMode)>,
}




/**
 * Holds the generations of a nested scheduler. Dropping it releases every
 * generation at or above its depth, leaving the outer generations untouched.
 */
pub struct NestedStores<'a> {
    stores: &'a mut Warehouses,
    depth: usize,
}




// ============================================================================
impl DataStore {


    pub fn new(generation: usize, max_ghost: usize) -> Self {
        Self {
            generation,
            max_ghost,
            vars: HashMap::new(),
            reductions: HashMap::new(),
            scrub_mode: ScrubMode::None,
            scrub_counts: HashMap::new(),
            aborted: false,
            restarted: false,
        }
    }


    pub fn generation(&self) -> usize {
        self.generation
    }


    /**
     * Return the number of grid variable instances held, foreign copies
     * included.
     */
    pub fn len(&self) -> usize {
        self.vars.len()
    }


    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.reductions.is_empty()
    }


    pub fn contains(&self, label: Label, matl: i32, patch: PatchId) -> bool {
        self.vars.contains_key(&(label, matl, patch))
    }


    /**
     * Return the type-erased instance under a key, if present.
     */
    pub fn variable(&self, label: Label, matl: i32, patch: PatchId) -> Option<&Arc<Variable>> {
        self.vars.get(&(label, matl, patch)).map(|e| &e.var)
    }


    /**
     * Return the name of the task that produced the instance under a key.
     */
    pub fn producer(&self, label: Label, matl: i32, patch: PatchId) -> Option<&str> {
        self.vars.get(&(label, matl, patch)).map(|e| &*e.producer)
    }


    /**
     * Read a variable on a patch, without ghost cells.
     */
    pub fn get_ref<T: Element>(&self, label: Label, matl: i32, patch: PatchId, requester: &str) -> Result<&Field<T>> {
        let entry = self.vars.get(&(label, matl, patch)).ok_or_else(|| Error::MissingDependency {
            task: requester.to_string(),
            label: label.name().to_string(),
            patch: Some(patch),
        })?;
        T::view(&entry.var).ok_or_else(|| Error::contract(requester, format!("{} read with the wrong element type", label)))
    }


    /**
     * Read a variable on a patch, padded with `ghost` layers of cells drawn
     * from the neighboring patches on the same level. Ghost cells outside
     * every patch of the level keep the element default. Fails if the width
     * exceeds the store's maximum, or if a neighbor's instance is not held
     * here (not owned, and not received through a ghost exchange).
     */
    pub fn get<T: Element>(
        &self,
        label: Label,
        matl: i32,
        patch: &Patch,
        ghost: usize,
        grid: &Grid,
        requester: &str,
    ) -> Result<Cow<'_, Field<T>>> {
        if ghost > self.max_ghost {
            return Err(Error::GhostRegionUnavailable {
                label: label.name().to_string(),
                patch: patch.id(),
                requested: ghost,
                available: self.max_ghost,
            });
        }
        let own = self.get_ref::<T>(label, matl, patch.id(), requester)?;

        if ghost == 0 {
            return Ok(Cow::Borrowed(own));
        }
        let halo = patch.cells().extend_all(ghost as i64);
        let space = label.location().space(&halo);
        let mut field = Field::new(space.clone());

        for neighbor in grid.level(patch.level()).select_patches(&halo) {
            if neighbor.id() == patch.id() {
                continue;
            }
            let data = self.get_ref::<T>(label, matl, neighbor.id(), requester).map_err(|_| {
                Error::GhostRegionUnavailable {
                    label: label.name().to_string(),
                    patch: patch.id(),
                    requested: ghost,
                    available: 0,
                }
            })?;
            field.copy_region(data, &space);
        }
        field.copy_region(own, &space);
        Ok(Cow::Owned(field))
    }


    /**
     * Read the values over an arbitrary region of a level, stitched together
     * from every instance on that level that covers part of it. Every index
     * of the region must be covered.
     */
    pub fn get_region<T: Element>(
        &self,
        label: Label,
        matl: i32,
        level: &Level,
        region: &IndexSpace,
        requester: &str,
    ) -> Result<Field<T>> {
        let location = label.location();
        let mut field = Field::new(region.clone());
        let mut covered = 0;

        for patch in level.patches() {
            let owned = location.space(patch.cells());

            if let Some(overlap) = owned.intersect(region) {
                let data = self.get_ref::<T>(label, matl, patch.id(), requester)?;
                field.copy_region(data, &overlap);
                covered += overlap.iter().filter(|&i| !counted_before(level, location, patch, i)).count();
            }
        }
        if covered < region.len() {
            return Err(Error::GhostRegionUnavailable {
                label: label.name().to_string(),
                patch: level.patches().first().map(|p| p.id()).unwrap_or(0),
                requested: region.len(),
                available: covered,
            });
        }
        Ok(field)
    }


    /**
     * Insert a variable instance. Fails if the key is already held, unless it
     * was produced by the same task or is a foreign copy.
     */
    pub fn put(&mut self, label: Label, matl: i32, patch: PatchId, var: Variable, producer: &str) -> Result<()> {
        self.insert(label, matl, patch, Arc::new(var), producer)
    }


    pub(crate) fn insert(&mut self, label: Label, matl: i32, patch: PatchId, var: Arc<Variable>, producer: &str) -> Result<()> {
        if let Some(existing) = self.vars.get(&(label, matl, patch)) {
            if !existing.foreign && &*existing.producer != producer {
                return Err(Error::DuplicateCompute {
                    label: label.name().to_string(),
                    patch: Some(patch),
                    first: existing.producer.to_string(),
                    second: producer.to_string(),
                });
            }
        }
        self.vars.insert((label, matl, patch), Entry {
            var,
            producer: Arc::from(producer),
            foreign: false,
        });
        Ok(())
    }


    /**
     * Allocate a variable over the patch (at the label's location), register
     * it, and return it for writing.
     */
    pub fn allocate_and_put<T: Element>(&mut self, label: Label, matl: i32, patch: &Patch, producer: &str) -> Result<&mut Field<T>> {
        let field = Field::<T>::new(label.location().space(patch.cells()));
        self.put(label, matl, patch.id(), T::wrap(field), producer)?;

        let entry = self.vars.get_mut(&(label, matl, patch.id())).ok_or_else(|| Error::MissingDependency {
            task: producer.to_string(),
            label: label.name().to_string(),
            patch: Some(patch.id()),
        })?;
        T::view_mut(Arc::make_mut(&mut entry.var))
            .ok_or_else(|| Error::contract(producer, format!("{} allocated with the wrong element type", label)))
    }


    /**
     * Allocate private scratch space over a patch plus a ghost layer. The
     * result is not registered under any key.
     */
    pub fn allocate_temporary<T: Element>(location: Location, patch: &Patch, ghost: usize) -> Field<T> {
        Field::new(location.space(&patch.cells().extend_all(ghost as i64)))
    }


    /**
     * Remove an instance for in-place modification. The caller puts it back
     * with `restore`.
     */
    pub(crate) fn take(&mut self, label: Label, matl: i32, patch: PatchId, requester: &str) -> Result<(Arc<Variable>, Arc<str>)> {
        match self.vars.remove(&(label, matl, patch)) {
            Some(entry) if !entry.foreign => Ok((entry.var, entry.producer)),
            _ => Err(Error::MissingDependency {
                task: requester.to_string(),
                label: label.name().to_string(),
                patch: Some(patch),
            }),
        }
    }


    pub(crate) fn restore(&mut self, label: Label, matl: i32, patch: PatchId, var: Arc<Variable>, producer: Arc<str>) {
        self.vars.insert((label, matl, patch), Entry { var, producer, foreign: false });
    }


    /**
     * Insert a copy of a remote patch's instance received through a ghost
     * exchange, replacing any earlier copy.
     */
    pub(crate) fn insert_foreign(&mut self, label: Label, matl: i32, patch: PatchId, var: Variable) {
        self.vars.insert((label, matl, patch), Entry {
            var: Arc::new(var),
            producer: Arc::from("<remote>"),
            foreign: true,
        });
    }


    /**
     * Share instances of another store under this one, for the given patches
     * and materials. Reduction labels ignore the patches. Without `replace`,
     * an occupied key is a duplicate compute. A key missing from the source
     * is a missing dependency.
     */
    pub fn transfer_from(
        &mut self,
        other: &DataStore,
        label: Label,
        patches: &[PatchId],
        matls: &MaterialSubset,
        replace: bool,
    ) -> Result<()> {
        let requester = "transfer_from";

        for matl in matls.iter() {
            if let LabelKind::Reduction(_) = label.kind() {
                let value = other.reduction(label, matl, requester)?;
                if !replace && self.reductions.contains_key(&(label, matl)) {
                    return Err(Error::DuplicateCompute {
                        label: label.name().to_string(),
                        patch: None,
                        first: format!("generation {}", self.generation),
                        second: format!("generation {}", other.generation),
                    });
                }
                self.reductions.insert((label, matl), value);
                continue;
            }
            for &patch in patches {
                let entry = other.vars.get(&(label, matl, patch)).ok_or_else(|| Error::MissingDependency {
                    task: requester.to_string(),
                    label: label.name().to_string(),
                    patch: Some(patch),
                })?;
                if !replace && self.vars.contains_key(&(label, matl, patch)) {
                    return Err(Error::DuplicateCompute {
                        label: label.name().to_string(),
                        patch: Some(patch),
                        first: self.producer(label, matl, patch).unwrap_or_default().to_string(),
                        second: entry.producer.to_string(),
                    });
                }
                self.vars.insert((label, matl, patch), Entry { foreign: false, ..entry.clone() });
            }
        }
        Ok(())
    }


    /**
     * Combine a contribution into a reduction variable. Fails for a label
     * that is not a reduction.
     */
    pub fn put_reduction(&mut self, label: Label, matl: i32, value: f64) -> Result<()> {
        let op = match label.kind() {
            LabelKind::Reduction(op) => op,
            LabelKind::Grid { .. } => {
                return Err(Error::contract("put_reduction", format!("{} is not a reduction label", label)))
            }
        };
        self.reductions
            .entry((label, matl))
            .and_modify(|x| *x = op.combine(*x, value))
            .or_insert(value);
        Ok(())
    }


    /**
     * Overwrite a reduction variable, discarding any earlier value. The
     * driver seeds the step size of the old generation this way.
     */
    pub(crate) fn set_reduction(&mut self, label: Label, matl: i32, value: f64) {
        self.reductions.insert((label, matl), value);
    }


    pub fn get_reduction(&self, label: Label, matl: i32) -> Option<f64> {
        self.reductions.get(&(label, matl)).copied()
    }


    pub fn reduction(&self, label: Label, matl: i32, requester: &str) -> Result<f64> {
        self.get_reduction(label, matl).ok_or_else(|| Error::MissingDependency {
            task: requester.to_string(),
            label: label.name().to_string(),
            patch: None,
        })
    }


    /**
     * Change the scrub mode, returning the previous one. Prefer
     * `ScrubGuard`, which restores the mode on every exit path.
     */
    pub fn set_scrubbing(&mut self, mode: ScrubMode) -> ScrubMode {
        std::mem::replace(&mut self.scrub_mode, mode)
    }


    pub fn scrub_mode(&self) -> ScrubMode {
        self.scrub_mode
    }


    pub(crate) fn add_scrub_count(&mut self, key: VarKey) {
        *self.scrub_counts.entry(key).or_insert(0) += 1;
    }


    pub(crate) fn clear_scrub_counts(&mut self) {
        self.scrub_counts.clear()
    }


    /**
     * Record that one declared consumer of a key has run. Under
     * `ScrubMode::Complete` the instance is released once its count is
     * exhausted.
     */
    pub(crate) fn consumed(&mut self, key: VarKey) {
        let exhausted = match self.scrub_counts.get_mut(&key) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                self.scrub_counts.remove(&key);
                true
            }
            None => false,
        };
        if exhausted && self.scrub_mode == ScrubMode::Complete && self.vars.remove(&key).is_some() {
            debug!("scrubbed {} matl {} patch {} from generation {}", key.0, key.1, key.2, self.generation);
        }
    }


    /**
     * Mark this generation as invalid: its contents must not be advanced to
     * become the next old generation.
     */
    pub fn abort_timestep(&mut self) {
        self.aborted = true;
    }


    /**
     * Request that the outer time-integration loop redo the step that
     * produced this generation with a smaller step size.
     */
    pub fn restart_timestep(&mut self) {
        self.restarted = true;
    }


    pub fn timestep_aborted(&self) -> bool {
        self.aborted
    }


    pub fn timestep_restarted(&self) -> bool {
        self.restarted
    }
}

/// Whether an index was already counted, because it is also inside a patch
/// listed earlier on the level. Face-centered variables share the faces on
/// patch boundaries.
///
fn counted_before(level: &Level, location: Location, patch: &Patch, index: crate::index_space::Index) -> bool {
    level
        .patches()
        .iter()
        .take_while(|p| p.id() != patch.id())
        .any(|p| location.space(p.cells()).contains(index))
}




// ============================================================================
impl Warehouses {


    /**
     * Create the arena with the outermost old/new pair.
     */
    pub fn new(max_ghost: usize) -> Self {
        let mut stores = Self {
            stores: Vec::new(),
            max_ghost,
            next_generation: 0,
        };
        stores.advance(0);
        stores
    }


    pub fn max_ghost(&self) -> usize {
        self.max_ghost
    }


    /**
     * Return the number of nesting depths holding generations.
     */
    pub fn depths(&self) -> usize {
        self.stores.len() / 2
    }


    /**
     * Map a generation selector to an arena index for a scheduler at the
     * given depth.
     */
    pub fn index(&self, depth: usize, which: WhichDw) -> Option<usize> {
        let index = match which {
            WhichDw::Old => 2 * depth,
            WhichDw::New => 2 * depth + 1,
            WhichDw::ParentOld => (2 * depth).checked_sub(2)?,
            WhichDw::ParentNew => (2 * depth).checked_sub(1)?,
        };
        if index < self.stores.len() {
            Some(index)
        } else {
            None
        }
    }


    /**
     * Return the generation at an arena index.
     */
    pub fn get_dw(&self, index: usize) -> &DataStore {
        &self.stores[index]
    }


    pub fn get_dw_mut(&mut self, index: usize) -> &mut DataStore {
        &mut self.stores[index]
    }


    pub fn at(&self, depth: usize, which: WhichDw) -> Option<&DataStore> {
        self.index(depth, which).map(|i| &self.stores[i])
    }


    pub fn at_mut(&mut self, depth: usize, which: WhichDw) -> Option<&mut DataStore> {
        let i = self.index(depth, which)?;
        Some(&mut self.stores[i])
    }


    /**
     * Rotate the pair at the given depth: the new generation becomes old,
     * and a fresh new generation is created. The first call at a depth
     * creates the pair, with an empty old generation.
     */
    pub fn advance(&mut self, depth: usize) {
        assert!(2 * depth <= self.stores.len(), "cannot advance depth {} before its parent exists", depth);

        if self.stores.len() < 2 * depth + 2 {
            self.stores.truncate(2 * depth);
            let old = self.fresh();
            let new = self.fresh();
            self.stores.push(old);
            self.stores.push(new);
        } else {
            let new = self.fresh();
            let old = std::mem::replace(&mut self.stores[2 * depth + 1], new);
            self.stores[2 * depth] = old;
        }
    }


    /**
     * Throw away the new generation at a depth, replacing it with an empty
     * one. Used to redo a restarted timestep from the same old generation.
     */
    pub fn discard_new(&mut self, depth: usize) {
        let fresh = self.fresh();
        self.stores[2 * depth + 1] = fresh;
    }


    /**
     * Release every generation at or above the given depth.
     */
    pub fn truncate(&mut self, depth: usize) {
        self.stores.truncate(2 * depth);
    }


    /**
     * Share instances from one generation into another (see
     * `DataStore::transfer_from`).
     */
    pub fn transfer(
        &mut self,
        from: usize,
        to: usize,
        label: Label,
        patches: &[PatchId],
        matls: &MaterialSubset,
        replace: bool,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let mut target = std::mem::replace(&mut self.stores[to], DataStore::new(usize::MAX, 0));
        let result = target.transfer_from(&self.stores[from], label, patches, matls, replace);
        self.stores[to] = target;
        result
    }


    /**
     * Set a scrub mode on some generations until the returned guard is
     * dropped.
     */
    pub fn scrub(&mut self, indices: &[usize], mode: ScrubMode) -> ScrubGuard<'_> {
        ScrubGuard::new(self, indices, mode)
    }


    /**
     * Lend the arena to a scheduler at the given depth. The generations at
     * that depth and above are released when the guard is dropped.
     */
    pub fn nest(&mut self, depth: usize) -> NestedStores<'_> {
        assert!(depth > 0, "the outermost generations cannot be nested");
        NestedStores { stores: self, depth }
    }


    fn fresh(&mut self) -> DataStore {
        self.next_generation += 1;
        DataStore::new(self.next_generation - 1, self.max_ghost)
    }
}




// ============================================================================
impl<'a> ScrubGuard<'a> {
    pub fn new(stores: &'a mut Warehouses, indices: &[usize], mode: ScrubMode) -> Self {
        let saved = indices
            .iter()
            .map(|&i| (i, stores.get_dw_mut(i).set_scrubbing(mode)))
            .collect();
        Self { stores, saved }
    }
}

impl Deref for ScrubGuard<'_> {
    type Target = Warehouses;

    fn deref(&self) -> &Warehouses {
        self.stores
    }
}

impl DerefMut for ScrubGuard<'_> {
    fn deref_mut(&mut self) -> &mut Warehouses {
        self.stores
    }
}

impl Drop for ScrubGuard<'_> {
    fn drop(&mut self) {
        for &(i, mode) in self.saved.iter().rev() {
            if i < self.stores.stores.len() {
                self.stores.stores[i].set_scrubbing(mode);
            }
        }
    }
}




// ============================================================================
impl NestedStores<'_> {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Deref for NestedStores<'_> {
    type Target = Warehouses;

    fn deref(&self) -> &Warehouses {
        self.stores
    }
}

impl DerefMut for NestedStores<'_> {
    fn deref_mut(&mut self) -> &mut Warehouses {
        self.stores
    }
}

impl Drop for NestedStores<'_> {
    fn drop(&mut self) {
        self.stores.truncate(self.depth)
    }
}
