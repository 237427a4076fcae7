//! The views a task's callable gets of the data store while it runs. A
//! per-patch task sees the generations through a `PatchContext`: reads are
//! checked against the task's declared requires, and writes are staged in
//! the context until the scheduler commits them after every patch of the
//! task has run. A once-per-processor task gets a `ProcContext`, which lends
//! it the whole arena along with everything it needs to drive a nested
//! scheduler.

use crate::data_store::{DataStore, Warehouses, WhichDw};
use crate::error::{Error, Result};
use crate::grid::{CfiLink, Grid, Level};
use crate::index_space::{Index, IndexSpace};
use crate::label::{Label, LabelKind, Location};
use crate::load_balancer::Distribution;
use crate::material::MaterialSubset;
use crate::message::Communicator;
use crate::patch::{Face, Patch, PatchId};
use crate::scheduler::{Processor, Scheduler};
use crate::task::{Dependency, LevelDomain, Task};
use crate::variable::{Element, Field, Variable};
use std::borrow::Cow;
use std::collections::HashMap;




/**
 * Outputs of one task on one patch, waiting to be committed to the new
 * generation
 */
#[derive(Default)]
pub(crate) struct Staged {
    pub(crate) computes: HashMap<(Label, i32), Variable>,
    pub(crate) modifies: HashMap<(Label, i32), Variable>,
    pub(crate) reductions: Vec<(Label, i32, f64)>,
    pub(crate) restart: bool,
}




/**
 * A per-patch task's view of the data store
 */
pub struct PatchContext<'a> {
    stores: &'a Warehouses,
    depth: usize,
    grid: &'a Grid,
    patch: &'a Patch,
    matls: &'a MaterialSubset,
    task: &'a Task,
    staged: Staged,
}




/**
 * A once-per-processor task's view of the data store: the whole arena, the
 * patches this processing element owns, and its communicator
 */
pub struct ProcContext<'a> {
    stores: &'a mut Warehouses,
    depth: usize,
    processor: Processor<'a>,
    patches: Vec<&'a Patch>,
    matls: &'a MaterialSubset,
    task: &'a Task,
    pub(crate) reductions: Vec<(Label, i32, f64)>,
}




// ============================================================================
impl<'a> PatchContext<'a> {


    pub(crate) fn new(
        stores: &'a Warehouses,
        depth: usize,
        grid: &'a Grid,
        patch: &'a Patch,
        matls: &'a MaterialSubset,
        task: &'a Task,
    ) -> Self {
        Self {
            stores,
            depth,
            grid,
            patch,
            matls,
            task,
            staged: Staged::default(),
        }
    }


    pub fn patch(&self) -> &'a Patch {
        self.patch
    }


    pub fn grid(&self) -> &'a Grid {
        self.grid
    }


    pub fn level(&self) -> &'a Level {
        self.grid.level(self.patch.level())
    }


    pub fn matls(&self) -> &'a MaterialSubset {
        self.matls
    }


    pub fn task_name(&self) -> &'a str {
        self.task.name()
    }


    /**
     * Read a variable on this patch with `ghost` layers of cells from the
     * neighboring patches. The read must be covered by a declared requires
     * of at least that width. A read of the new generation of a key this
     * task modifies observes the task's own modifiable copy.
     */
    pub fn get<T: Element>(&self, dw: WhichDw, label: Label, matl: i32, ghost: usize) -> Result<Cow<'_, Field<T>>> {
        let dep = self.declared_require(dw, label, matl, LevelDomain::This)?;

        if dep.ghost < ghost {
            return Err(self.undeclared(label));
        }
        if dw == WhichDw::New {
            if let Some(var) = self.staged.modifies.get(&(label, matl)) {
                return T::view(var).map(Cow::Borrowed).ok_or_else(|| self.wrong_type(label));
            }
        }
        self.store(dw)?.get(label, matl, self.patch, ghost, self.grid, self.task.name())
    }


    /**
     * Read a reduction variable from one of the visible generations.
     */
    pub fn get_reduction(&self, dw: WhichDw, label: Label, matl: i32) -> Result<f64> {
        self.declared_require(dw, label, matl, LevelDomain::This)?;
        self.store(dw)?.reduction(label, matl, self.task.name())
    }


    /**
     * Read an arbitrary region of this level, or of the next finer or
     * coarser level, stitched together from every instance covering it. The
     * region is in the index space of the level being read.
     */
    pub fn get_region<T: Element>(
        &self,
        dw: WhichDw,
        label: Label,
        matl: i32,
        domain: LevelDomain,
        region: &IndexSpace,
    ) -> Result<Field<T>> {
        self.declared_require(dw, label, matl, domain)?;

        let level = match domain {
            LevelDomain::This => Some(self.level()),
            LevelDomain::Finer => self.grid.finer(self.patch.level()),
            LevelDomain::Coarser => self.grid.coarser(self.patch.level()),
        };
        let level = level.ok_or_else(|| {
            Error::contract(self.task.name(), format!("{} read from a {:?} level that does not exist", label, domain))
        })?;
        self.store(dw)?.get_region(label, matl, level, region, self.task.name())
    }


    /**
     * For every coarse/fine link of this patch (it must be the fine side),
     * return the value of a cell-centered variable at the coarse cell across
     * the interface. The coarse cells are read face by face, so the coarser
     * level must cover the cells just outside this patch.
     */
    pub fn coarse_link_values<T: Element>(&self, dw: WhichDw, label: Label, matl: i32) -> Result<Vec<(CfiLink, T)>> {
        let links = self.grid.cfi_links(self.patch);
        let mut values = Vec::with_capacity(links.len());

        for face in Face::ALL.iter() {
            let on_face: Vec<&CfiLink> = links.iter().filter(|l| l.face == *face).collect();

            if let Some(region) = bounding_box(on_face.iter().map(|l| l.coarse_cell)) {
                let field = self.get_region::<T>(dw, label, matl, LevelDomain::Coarser, &region)?;
                values.extend(on_face.into_iter().map(|l| (l.clone(), field[l.coarse_cell].clone())));
            }
        }
        Ok(values)
    }


    /**
     * For every coarse/fine link whose coarse cell this patch owns, return
     * the value of a variable on the finer level at the index chosen by
     * `at` (the fine cell, or one of its faces). Links for which `at`
     * returns `None` are skipped.
     */
    pub fn fine_link_values<T, F>(&self, dw: WhichDw, label: Label, matl: i32, at: F) -> Result<Vec<(CfiLink, T)>>
    where
        T: Element,
        F: Fn(&CfiLink) -> Option<Index>,
    {
        let links = self.grid.coarse_fine_links(self.patch);
        let mut fields: HashMap<PatchId, Field<T>> = HashMap::new();

        for link in &links {
            if !fields.contains_key(&link.fine_patch) {
                let region = label.location().space(self.grid.patch(link.fine_patch).cells());
                let field = self.get_region::<T>(dw, label, matl, LevelDomain::Finer, &region)?;
                fields.insert(link.fine_patch, field);
            }
        }
        Ok(links
            .into_iter()
            .filter_map(|link| {
                let value = fields[&link.fine_patch][at(&link)?].clone();
                Some((link, value))
            })
            .collect())
    }


    /**
     * Return this patch's instance of a key the task declared it modifies,
     * for writing. The first call copies the instance out of the new
     * generation; the copy replaces it when the task is committed.
     */
    pub fn get_modifiable<T: Element>(&mut self, label: Label, matl: i32) -> Result<&mut Field<T>> {
        if !covers(self.task.modifies_list(), label, matl, self.matls) {
            return Err(Error::contract(self.task.name(), format!("{} modified without a modifies declaration", label)));
        }
        if !self.staged.modifies.contains_key(&(label, matl)) {
            let var = self
                .store(WhichDw::New)?
                .variable(label, matl, self.patch.id())
                .ok_or_else(|| self.missing(label))?;
            self.staged.modifies.insert((label, matl), Variable::clone(var));
        }
        let wrong_type = self.wrong_type(label);
        self.staged
            .modifies
            .get_mut(&(label, matl))
            .and_then(T::view_mut)
            .ok_or(wrong_type)
    }


    /**
     * Allocate this patch's instance of a key the task declared it
     * computes, and return it for writing.
     */
    pub fn allocate_and_put<T: Element>(&mut self, label: Label, matl: i32) -> Result<&mut Field<T>> {
        if !covers(self.task.computes_list(), label, matl, self.matls) {
            return Err(Error::contract(self.task.name(), format!("{} written without a computes declaration", label)));
        }
        if let LabelKind::Grid { element, .. } = label.kind() {
            if element != T::TYPE {
                return Err(self.wrong_type(label));
            }
        }
        let field = Field::<T>::new(label.location().space(self.patch.cells()));
        let wrong_type = self.wrong_type(label);

        let var = self.staged.computes.entry((label, matl)).or_insert_with(|| T::wrap(field));
        T::view_mut(var).ok_or(wrong_type)
    }


    /**
     * Contribute a value to a reduction variable the task computes.
     */
    pub fn put_reduction(&mut self, label: Label, matl: i32, value: f64) -> Result<()> {
        if !label.is_reduction() || !covers(self.task.computes_list(), label, matl, self.matls) {
            return Err(Error::contract(self.task.name(), format!("reduction {} written without a computes declaration", label)));
        }
        self.staged.reductions.push((label, matl, value));
        Ok(())
    }


    /**
     * Allocate private scratch space over this patch plus a ghost layer.
     */
    pub fn allocate_temporary<T: Element>(&self, location: Location, ghost: usize) -> Field<T> {
        DataStore::allocate_temporary(location, self.patch, ghost)
    }


    /**
     * Ask the outer time-integration loop to redo this timestep with a
     * smaller step.
     */
    pub fn request_restart(&mut self) {
        self.staged.restart = true;
    }


    pub(crate) fn into_staged(self) -> Staged {
        self.staged
    }


    fn store(&self, dw: WhichDw) -> Result<&'a DataStore> {
        self.stores
            .at(self.depth, dw)
            .ok_or_else(|| Error::contract(self.task.name(), format!("{:?} generation is not visible at depth {}", dw, self.depth)))
    }


    fn declared_require(&self, dw: WhichDw, label: Label, matl: i32, domain: LevelDomain) -> Result<&'a Dependency> {
        let task = self.task;
        task.find_require(dw, label, domain, matl, self.matls)
            .ok_or_else(|| self.undeclared(label))
    }


    fn undeclared(&self, label: Label) -> Error {
        Error::MissingDependency {
            task: self.task.name().to_string(),
            label: format!("{} (undeclared read)", label),
            patch: Some(self.patch.id()),
        }
    }


    fn missing(&self, label: Label) -> Error {
        Error::MissingDependency {
            task: self.task.name().to_string(),
            label: label.name().to_string(),
            patch: Some(self.patch.id()),
        }
    }


    fn wrong_type(&self, label: Label) -> Error {
        Error::contract(self.task.name(), format!("{} accessed with the wrong element type", label))
    }
}

/// Whether a list of declarations covers a label for the given material.
///
fn covers(deps: &[Dependency], label: Label, matl: i32, task_matls: &MaterialSubset) -> bool {
    deps.iter().any(|d| d.label == label && d.materials(task_matls).contains(matl))
}

/// The smallest index space containing every one of the given indexes.
///
fn bounding_box<I: Iterator<Item = Index>>(mut indexes: I) -> Option<IndexSpace> {
    let first = indexes.next()?;
    let (lo, hi) = indexes.fold((first, first), |(lo, hi), c| {
        ((lo.0.min(c.0), lo.1.min(c.1), lo.2.min(c.2)), (hi.0.max(c.0), hi.1.max(c.1), hi.2.max(c.2)))
    });
    Some(IndexSpace::new(lo.0..hi.0 + 1, lo.1..hi.1 + 1, lo.2..hi.2 + 1))
}





// ============================================================================
impl<'a> ProcContext<'a> {


    pub(crate) fn new(
        stores: &'a mut Warehouses,
        depth: usize,
        processor: Processor<'a>,
        patches: Vec<&'a Patch>,
        matls: &'a MaterialSubset,
        task: &'a Task,
    ) -> Self {
        Self {
            stores,
            depth,
            processor,
            patches,
            matls,
            task,
            reductions: Vec::new(),
        }
    }


    /**
     * Return the nesting depth of the scheduler running this task.
     */
    pub fn depth(&self) -> usize {
        self.depth
    }


    pub fn stores(&self) -> &Warehouses {
        self.stores
    }


    pub fn stores_mut(&mut self) -> &mut Warehouses {
        self.stores
    }


    /**
     * Return the arena index of one of the generations visible to the
     * running scheduler.
     */
    pub fn dw_index(&self, dw: WhichDw) -> Result<usize> {
        self.stores
            .index(self.depth, dw)
            .ok_or_else(|| Error::contract(self.task.name(), format!("{:?} generation is not visible at depth {}", dw, self.depth)))
    }


    pub fn processor(&self) -> Processor<'a> {
        self.processor
    }


    pub fn grid(&self) -> &'a Grid {
        self.processor.grid
    }


    pub fn distribution(&self) -> &'a Distribution {
        self.processor.distribution
    }


    pub fn comm(&self) -> &'a dyn Communicator {
        self.processor.comm
    }


    /**
     * Return the patches of the task's patch set owned here.
     */
    pub fn patches(&self) -> &[&'a Patch] {
        &self.patches
    }


    pub fn matls(&self) -> &'a MaterialSubset {
        self.matls
    }


    pub fn task_name(&self) -> &'a str {
        self.task.name()
    }


    /**
     * Create the private scheduler of a task that declared one. It runs one
     * nesting depth below the scheduler running this task.
     */
    pub fn create_sub_scheduler(&self) -> Result<Scheduler> {
        if !self.task.has_sub_scheduler() {
            return Err(Error::contract(self.task.name(), "a sub-scheduler was created without being declared"));
        }
        Ok(Scheduler::at_depth(self.depth + 1))
    }


    /**
     * Contribute a value to a reduction variable the task computes. The
     * contributions of every processing element are combined after the task
     * has run.
     */
    pub fn put_reduction(&mut self, label: Label, matl: i32, value: f64) -> Result<()> {
        if !label.is_reduction() || !covers(self.task.computes_list(), label, matl, self.matls) {
            return Err(Error::contract(self.task.name(), format!("reduction {} written without a computes declaration", label)));
        }
        self.reductions.push((label, matl, value));
        Ok(())
    }
}
