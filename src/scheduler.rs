//! The scheduler turns a set of task declarations into an execution order,
//! and runs it over the patches a processing element owns. Before each task
//! it pulls in the remote instances the task's requires imply; after it, it
//! commits the task's staged outputs, combines reductions across ranks, and
//! releases variables whose last consumer has run.
//!
//! Schedulers nest: a task that declares a sub-scheduler gets one at the
//! next depth, whose `Old`/`New` generations sit above the parent's in the
//! `Warehouses` arena.

use crate::adjacency_list::AdjacencyList;
use crate::context::{PatchContext, ProcContext, Staged};
use crate::data_store::{VarKey, Warehouses, WhichDw};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::label::{Label, LabelKind, ReductionOp};
use crate::load_balancer::Distribution;
use crate::material::MaterialSubset;
use crate::message::{util, Communicator};
use crate::patch::{Patch, PatchId};
use crate::task::{Action, Dependency, LevelDomain, Task};
use crate::variable::Variable;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;




/**
 * The patches a task is scheduled on: every patch of one level, or every
 * patch of the grid
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchSelection {
    Level(usize),
    Grid,
}




#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Uncompiled,
    Compiled,
    Executing,
    Idle,
}




/**
 * Everything a scheduler needs to know about the processing element it is
 * running on
 */
#[derive(Clone, Copy)]
pub struct Processor<'a> {
    pub grid: &'a Grid,
    pub distribution: &'a Distribution,
    pub comm: &'a dyn Communicator,
}




struct Scheduled {
    task: Task,
    patches: PatchSelection,
    matls: MaterialSubset,
}




/**
 * A task graph bound to one nesting depth
 */
pub struct Scheduler {
    depth: usize,
    state: SchedulerState,
    tasks: Vec<Scheduled>,
    order: Vec<usize>,
}




#[derive(Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Compute,
    Modify,
}




#[derive(Clone, Copy)]
enum Levels {
    One(usize),
    All,
}




#[derive(Serialize, Deserialize)]
struct GhostItem {
    dw: usize,
    label: String,
    matl: i32,
    patch: PatchId,
    var: Variable,
}




#[derive(Default, Serialize, Deserialize)]
struct GhostMessage {
    items: Vec<GhostItem>,
}




// ============================================================================
impl PatchSelection {
    pub fn level(self) -> Option<usize> {
        match self {
            PatchSelection::Level(level) => Some(level),
            PatchSelection::Grid => None,
        }
    }

    /**
     * Return every patch of the selection, whoever owns it.
     */
    pub fn patches<'g>(self, grid: &'g Grid) -> Vec<&'g Patch> {
        match self {
            PatchSelection::Level(level) => grid.level(level).patches().iter().collect(),
            PatchSelection::Grid => grid.patches().collect(),
        }
    }
}




// ============================================================================
impl Levels {
    fn overlaps(self, other: Levels) -> bool {
        match (self, other) {
            (Levels::One(a), Levels::One(b)) => a == b,
            _ => true,
        }
    }
}




// ============================================================================
impl Scheduler {


    /**
     * Create the outermost scheduler.
     */
    pub fn new() -> Self {
        Self::at_depth(0)
    }


    pub(crate) fn at_depth(depth: usize) -> Self {
        Self {
            depth,
            state: SchedulerState::Uncompiled,
            tasks: Vec::new(),
            order: Vec::new(),
        }
    }


    pub fn depth(&self) -> usize {
        self.depth
    }


    pub fn state(&self) -> SchedulerState {
        self.state
    }


    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }


    /**
     * Create a scheduler one nesting depth below this one.
     */
    pub fn create_sub_scheduler(&self) -> Scheduler {
        Self::at_depth(self.depth + 1)
    }


    /**
     * Discard the task graph and re-open the scheduler for `add_task`.
     */
    pub fn initialize(&mut self) {
        self.tasks.clear();
        self.order.clear();
        self.state = SchedulerState::Uncompiled;
    }


    /**
     * Map a generation selector to its index in the arena.
     */
    pub fn get_dw(&self, stores: &Warehouses, which: WhichDw) -> Option<usize> {
        stores.index(self.depth, which)
    }


    /**
     * Rotate this scheduler's pair of generations: new becomes old, and an
     * empty new generation is created. On a sub-scheduler's first call the
     * pair is created.
     */
    pub fn advance_data_warehouse(&self, stores: &mut Warehouses) {
        stores.advance(self.depth)
    }


    /**
     * Add a task, bound to a set of patches and materials. Only legal before
     * the graph is compiled.
     */
    pub fn add_task(&mut self, task: Task, patches: PatchSelection, matls: MaterialSubset) -> Result<()> {
        if self.state != SchedulerState::Uncompiled {
            return Err(Error::contract(task.name(), format!("added to a scheduler in state {:?}", self.state)));
        }
        task.validate()?;

        if self.depth == 0 {
            if let Some(dep) = task.requires_list().iter().find(|d| matches!(d.dw, WhichDw::ParentOld | WhichDw::ParentNew)) {
                return Err(Error::contract(task.name(), format!("{} read from a parent generation at depth 0", dep.label)));
            }
        }
        self.tasks.push(Scheduled { task, patches, matls });
        Ok(())
    }


    /**
     * Order the tasks so that every reader of the new generation runs after
     * the producers of what it reads. The unique computer of a key runs
     * before its modifiers, modifiers run in the order they were added, and
     * a reader added between two modifiers runs between them. Ties are
     * broken by the order the tasks were added.
     */
    pub fn compile(&mut self) -> Result<()> {
        if self.state != SchedulerState::Uncompiled {
            return Err(Error::contract("scheduler", format!("compile called in state {:?}", self.state)));
        }
        let accesses: Vec<Vec<(Label, Levels, Access)>> = self.tasks.iter().map(Self::accesses).collect();
        let mut edges = AdjacencyList::new();

        for b in 0..self.tasks.len() {
            for a in 0..b {
                for &(label, la, x) in &accesses[a] {
                    for &(_, _, y) in accesses[b].iter().filter(|(l, lb, _)| *l == label && la.overlaps(*lb)) {
                        match (x, y) {
                            (Access::Compute, Access::Compute) if !label.is_reduction() => {
                                return Err(Error::DuplicateCompute {
                                    label: label.name().to_string(),
                                    patch: None,
                                    first: self.tasks[a].task.name().to_string(),
                                    second: self.tasks[b].task.name().to_string(),
                                })
                            }
                            (Access::Read, Access::Read) => {}
                            (_, Access::Compute) => edges.insert(b, a),
                            _ => edges.insert(a, b),
                        }
                    }
                }
            }
        }
        for (b, scheduled) in self.tasks.iter().enumerate() {
            for &(label, lb, _) in accesses[b].iter().filter(|(_, _, x)| *x == Access::Read) {
                let produced = accesses.iter().enumerate().any(|(a, list)| {
                    a != b && list.iter().any(|&(l, la, x)| l == label && la.overlaps(lb) && x != Access::Read)
                });
                if !produced {
                    return Err(Error::MissingDependency {
                        task: scheduled.task.name().to_string(),
                        label: label.name().to_string(),
                        patch: None,
                    });
                }
            }
        }
        self.order = edges.topological_sort(0..self.tasks.len()).map_err(|stuck| Error::CyclicDependency {
            tasks: stuck.into_iter().map(|t| self.tasks[t].task.name().to_string()).collect(),
        })?;

        debug!("depth {} compiled: {}", self.depth, self.order().collect::<Vec<_>>().join(" -> "));
        self.state = SchedulerState::Compiled;
        Ok(())
    }


    /**
     * Return the names of the tasks in execution order.
     */
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(move |&t| self.tasks[t].task.name())
    }


    /**
     * Run the compiled graph on this processing element. Every rank must
     * execute the same graph, since ghost exchanges and reductions are
     * collective. When this returns, every rank sees the same timestep
     * restart and abort flags on the new generation.
     */
    pub fn execute(&mut self, stores: &mut Warehouses, processor: Processor) -> Result<()> {
        match self.state {
            SchedulerState::Compiled | SchedulerState::Idle => {}
            state => return Err(Error::contract("scheduler", format!("execute called in state {:?}", state))),
        }
        let new = self.get_dw(stores, WhichDw::New).ok_or_else(|| {
            Error::contract("scheduler", format!("no generations exist at depth {}", self.depth))
        })?;
        self.state = SchedulerState::Executing;
        let result = self.run(stores, processor).and_then(|_| synchronize_flags(stores, new, processor.comm));
        self.state = SchedulerState::Idle;
        result
    }


    fn run(&self, stores: &mut Warehouses, processor: Processor) -> Result<()> {
        let Processor { grid, distribution, .. } = processor;
        let new = stores.index(self.depth, WhichDw::New);

        self.count_consumers(stores, processor);

        for &t in &self.order {
            let scheduled = &self.tasks[t];
            let task = &scheduled.task;
            let patches = distribution.local_patches(grid, scheduled.patches.level());

            debug!("rank {} depth {} running {} on {} patches", distribution.rank(), self.depth, task.name(), patches.len());
            self.exchange_ghosts(scheduled, stores, processor)?;

            let contributions = match task.action() {
                Action::PerPatch(f) => {
                    let shared: &Warehouses = stores;
                    let depth = self.depth;
                    let staged = patches
                        .par_iter()
                        .map(|&patch| {
                            let mut ctx = PatchContext::new(shared, depth, grid, patch, &scheduled.matls, task);
                            f(&mut ctx)?;
                            Ok((patch.id(), ctx.into_staged()))
                        })
                        .collect::<Result<Vec<_>>>()?;

                    let new = new.ok_or_else(|| Error::contract(task.name(), "no new generation to write"))?;
                    commit(stores, new, task, staged)?
                }
                Action::OncePerProc(f) => {
                    let mut ctx = ProcContext::new(stores, self.depth, processor, patches, &scheduled.matls, task);
                    f(&mut ctx)?;
                    ctx.reductions
                }
            };
            if let Some(new) = new {
                reduce(stores, new, scheduled, contributions, processor.comm)?;
            }
            for (index, key) in self.consumed_keys(scheduled, stores, processor) {
                stores.get_dw_mut(index).consumed(key);
            }
        }
        Ok(())
    }


    /**
     * Count, for every locally owned key of this scheduler's old generation,
     * the number of local reads the graph will make of it. The new
     * generation is not counted: its keys are read again once it has been
     * advanced to become the next old generation.
     */
    fn count_consumers(&self, stores: &mut Warehouses, processor: Processor) {
        if let Some(index) = stores.index(self.depth, WhichDw::Old) {
            stores.get_dw_mut(index).clear_scrub_counts();
        }
        for scheduled in &self.tasks {
            for (index, key) in self.consumed_keys(scheduled, stores, processor) {
                stores.get_dw_mut(index).add_scrub_count(key);
            }
        }
    }


    fn consumed_keys(&self, scheduled: &Scheduled, stores: &Warehouses, processor: Processor) -> Vec<(usize, VarKey)> {
        let Processor { grid, distribution, .. } = processor;
        let task = &scheduled.task;
        let mut keys = Vec::new();

        let deps = task
            .requires_list()
            .iter()
            .filter(|d| d.dw == WhichDw::Old && !d.label.is_reduction());

        for dep in deps {
            let index = match stores.index(self.depth, dep.dw) {
                Some(index) => index,
                None => continue,
            };
            for patch in distribution.local_patches(grid, scheduled.patches.level()) {
                for source in source_patches(grid, patch, dep) {
                    if distribution.is_local(source.id()) {
                        for matl in dep.materials(&scheduled.matls).iter() {
                            keys.push((index, (dep.label, matl, source.id())))
                        }
                    }
                }
            }
        }
        keys
    }


    /**
     * Send the local instances remote patches of this task need, and receive
     * the remote instances the local patches need. Both sides derive the
     * same set of (receiver, sender) rank pairs from the task's requires, so
     * every expected message is sent, even when it is empty.
     */
    fn exchange_ghosts(&self, scheduled: &Scheduled, stores: &mut Warehouses, processor: Processor) -> Result<()> {
        let Processor { grid, distribution, comm } = processor;
        let tag = comm.next_tag();
        let me = distribution.rank();
        let mut outgoing: BTreeMap<usize, GhostMessage> = BTreeMap::new();
        let mut packed: HashSet<(usize, usize, Label, i32, PatchId)> = HashSet::new();
        let mut expected: BTreeSet<usize> = BTreeSet::new();

        if distribution.num_processors() == 1 {
            return Ok(());
        }
        for dep in scheduled.task.requires_list().iter().filter(|d| !d.label.is_reduction()) {
            let index = match stores.index(self.depth, dep.dw) {
                Some(index) => index,
                None => continue,
            };
            for patch in scheduled.patches.patches(grid) {
                let dest = distribution.owner(patch.id());

                for source in source_patches(grid, patch, dep) {
                    let from = distribution.owner(source.id());

                    if from == dest {
                        continue;
                    }
                    if dest == me {
                        if !distribution.in_neighborhood(&[source.id()]) {
                            return Err(Error::GhostRegionUnavailable {
                                label: dep.label.name().to_string(),
                                patch: patch.id(),
                                requested: dep.ghost,
                                available: 0,
                            });
                        }
                        expected.insert(from);
                    } else if from == me {
                        let message = outgoing.entry(dest).or_default();

                        for matl in dep.materials(&scheduled.matls).iter() {
                            if !packed.insert((dest, index, dep.label, matl, source.id())) {
                                continue;
                            }
                            if let Some(var) = stores.get_dw(index).variable(dep.label, matl, source.id()) {
                                message.items.push(GhostItem {
                                    dw: index,
                                    label: dep.label.name().to_string(),
                                    matl,
                                    patch: source.id(),
                                    var: Variable::clone(var),
                                })
                            }
                        }
                    }
                }
            }
        }
        for (rank, message) in outgoing {
            debug!("rank {} sends {} instances to rank {} for {}", me, message.items.len(), rank, scheduled.task.name());
            comm.send(rank, tag, util::encode(&message)?)?;
        }
        for _ in 0..expected.len() {
            let message: GhostMessage = util::decode(&comm.recv(tag)?)?;

            for item in message.items {
                let label = Label::find(&item.label)
                    .ok_or_else(|| Error::Communication(format!("unknown label {} received", item.label)))?;
                stores.get_dw_mut(item.dw).insert_foreign(label, item.matl, item.patch, item.var);
            }
        }
        Ok(())
    }


    fn accesses(scheduled: &Scheduled) -> Vec<(Label, Levels, Access)> {
        let task = &scheduled.task;
        let levels = |dep: &Dependency| -> Option<Levels> {
            if dep.label.is_reduction() {
                return Some(Levels::All);
            }
            match (scheduled.patches, dep.domain) {
                (PatchSelection::Grid, _) => Some(Levels::All),
                (PatchSelection::Level(l), LevelDomain::This) => Some(Levels::One(l)),
                (PatchSelection::Level(l), LevelDomain::Finer) => Some(Levels::One(l + 1)),
                (PatchSelection::Level(l), LevelDomain::Coarser) => l.checked_sub(1).map(Levels::One),
            }
        };
        let reads = task
            .requires_list()
            .iter()
            .filter(|d| d.dw == WhichDw::New)
            .map(|d| (d, Access::Read));
        let computes = task.computes_list().iter().map(|d| (d, Access::Compute));
        let modifies = task.modifies_list().iter().map(|d| (d, Access::Modify));

        reads
            .chain(computes)
            .chain(modifies)
            .filter_map(|(d, access)| levels(d).map(|l| (d.label, l, access)))
            .collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}




/**
 * Return the patches whose instances a dependency of a task running on the
 * given patch reads: the same-level patches under the ghost halo, or the
 * finer or coarser patches under it.
 */
pub(crate) fn source_patches<'g>(grid: &'g Grid, patch: &Patch, dep: &Dependency) -> Vec<&'g Patch> {
    let ghost = dep.ghost as i64;
    let cells = patch.cells();

    match dep.domain {
        LevelDomain::This => grid.level(patch.level()).select_patches(&cells.extend_all(ghost)),
        LevelDomain::Finer => match grid.finer(patch.level()) {
            Some(fine) => fine.select_patches(&cells.refine(fine.refinement_ratio()).extend_all(ghost)),
            None => Vec::new(),
        },
        LevelDomain::Coarser => match grid.coarser(patch.level()) {
            Some(coarse) => {
                let ratio = grid.level(patch.level()).refinement_ratio();
                coarse.select_patches(&cells.coarsen(ratio).extend_all(ghost))
            }
            None => Vec::new(),
        },
    }
}

/// Move the staged outputs of a per-patch task into the new generation,
/// returning its reduction contributions.
///
fn commit(stores: &mut Warehouses, new: usize, task: &Task, staged: Vec<(PatchId, Staged)>) -> Result<Vec<(Label, i32, f64)>> {
    let store = stores.get_dw_mut(new);
    let mut reductions = Vec::new();

    for (patch, outputs) in staged {
        for ((label, matl), var) in outputs.computes {
            store.put(label, matl, patch, var, task.name())?;
        }
        for ((label, matl), var) in outputs.modifies {
            let (_, producer) = store.take(label, matl, patch, task.name())?;
            store.restore(label, matl, patch, Arc::new(var), producer);
        }
        if outputs.restart {
            store.restart_timestep();
        }
        reductions.extend(outputs.reductions);
    }
    Ok(reductions)
}

/// Combine a task's reduction contributions locally, then across ranks, and
/// fold the result into the new generation. Every rank takes part for every
/// reduction the task computes, whether or not it contributed.
///
fn reduce(
    stores: &mut Warehouses,
    new: usize,
    scheduled: &Scheduled,
    contributions: Vec<(Label, i32, f64)>,
    comm: &dyn Communicator,
) -> Result<()> {
    for dep in scheduled.task.computes_list() {
        let op = match dep.label.kind() {
            LabelKind::Reduction(op) => op,
            LabelKind::Grid { .. } => continue,
        };
        for matl in dep.materials(&scheduled.matls).iter() {
            let local = contributions
                .iter()
                .filter(|c| c.0 == dep.label && c.1 == matl)
                .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c.2, |a| op.combine(a, c.2))));

            if let Some(value) = all_reduce_value(comm, op, local)? {
                stores.get_dw_mut(new).put_reduction(dep.label, matl, value)?;
            }
        }
    }
    Ok(())
}

/// Reduce an optional value over every rank. Ranks without a value do not
/// take part in the combination; the result is `None` only if no rank had
/// one.
///
pub fn all_reduce_value(comm: &dyn Communicator, op: ReductionOp, value: Option<f64>) -> Result<Option<f64>> {
    let combine = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
        let a: Option<f64> = util::decode(&a)?;
        let b: Option<f64> = util::decode(&b)?;
        let c = match (a, b) {
            (Some(a), Some(b)) => Some(op.combine(a, b)),
            (a, b) => a.or(b),
        };
        util::encode(&c)
    };
    util::decode(&comm.all_reduce(&combine, util::encode(&value)?)?)
}

/// Make the restart and abort flags of a generation agree across ranks: if
/// any rank raised one, every rank has it raised.
///
fn synchronize_flags(stores: &mut Warehouses, index: usize, comm: &dyn Communicator) -> Result<()> {
    let store = stores.get_dw(index);
    let local = (store.timestep_restarted(), store.timestep_aborted());

    let combine = |a: Vec<u8>, b: Vec<u8>| -> Result<Vec<u8>> {
        let a: (bool, bool) = util::decode(&a)?;
        let b: (bool, bool) = util::decode(&b)?;
        util::encode(&(a.0 || b.0, a.1 || b.1))
    };
    let (restarted, aborted): (bool, bool) = util::decode(&comm.all_reduce(&combine, util::encode(&local)?)?)?;
    let store = stores.get_dw_mut(index);

    if restarted {
        store.restart_timestep();
    }
    if aborted {
        store.abort_timestep();
    }
    Ok(())
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{PatchSelection, Processor, Scheduler, SchedulerState};
    use crate::data_store::{ScrubMode, Warehouses, WhichDw as Dw};
    use crate::error::{Error, Result};
    use crate::grid::test::two_level_grid;
    use crate::label::{Label, ReductionOp};
    use crate::load_balancer::{ContiguousLoadBalancer, Distribution, MAX_GHOST};
    use crate::material::MaterialSubset;
    use crate::message::{Communicator, LocalCommunicator};
    use crate::ranks;
    use crate::task::Task;
    use std::sync::{Arc, Mutex};

    fn matls() -> MaterialSubset {
        MaterialSubset::single(0)
    }

    fn fill(x: Label, value: f64) -> Task {
        Task::per_patch("fill", move |ctx| {
            let id = ctx.patch().id() as f64;
            ctx.allocate_and_put::<f64>(x, 0)?.fill(value + id);
            Ok(())
        })
        .computes(x)
    }

    fn scale(x: Label, factor: f64) -> Task {
        Task::per_patch("scale", move |ctx| {
            let field = ctx.get_modifiable::<f64>(x, 0)?;
            let values: Vec<_> = field.iter().map(|(i, v)| (i, v * factor)).collect();
            for (i, v) in values {
                field[i] = v
            }
            Ok(())
        })
        .modifies(x)
    }

    fn copy(x: Label, y: Label, name: &str) -> Task {
        Task::per_patch(name, move |ctx| {
            let source = ctx.get::<f64>(Dw::New, x, 0, 0)?.into_owned();
            ctx.allocate_and_put::<f64>(y, 0)?.copy_region(&source, source.space());
            Ok(())
        })
        .requires(Dw::New, x, 0)
        .computes(y)
    }

    #[test]
    fn execution_order_follows_the_declared_edges() {
        let x = Label::cell("sched_test_order_x");
        let y = Label::cell("sched_test_order_y");
        let z = Label::cell("sched_test_order_z");
        let mut sched = Scheduler::new();
        sched.add_task(copy(y, z, "second"), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(copy(x, y, "first"), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(fill(x, 0.0), PatchSelection::Level(0), matls()).unwrap();
        sched.compile().unwrap();
        assert_eq!(sched.order().collect::<Vec<_>>(), vec!["fill", "first", "second"]);
        assert_eq!(sched.state(), SchedulerState::Compiled);
    }

    #[test]
    fn removing_a_producer_is_a_missing_dependency() {
        let x = Label::cell("sched_test_missing_x");
        let y = Label::cell("sched_test_missing_y");
        let mut sched = Scheduler::new();
        sched.add_task(copy(x, y, "reader"), PatchSelection::Level(0), matls()).unwrap();

        match sched.compile() {
            Err(e @ Error::MissingDependency { patch: None, .. }) => {
                assert_eq!(e.to_string(), "task 'reader' read sched_test_missing_x, which no earlier task produced")
            }
            other => panic!("expected a missing dependency, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn a_reader_on_another_level_does_not_see_the_producer() {
        let x = Label::cell("sched_test_level_x");
        let y = Label::cell("sched_test_level_y");
        let mut sched = Scheduler::new();
        sched.add_task(fill(x, 0.0), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(copy(x, y, "reader"), PatchSelection::Level(1), matls()).unwrap();
        assert!(matches!(sched.compile(), Err(Error::MissingDependency { .. })));
    }

    #[test]
    fn two_computers_of_one_key_are_rejected() {
        let x = Label::cell("sched_test_dup_x");
        let mut sched = Scheduler::new();
        sched.add_task(fill(x, 0.0), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(fill(x, 1.0), PatchSelection::Grid, matls()).unwrap();
        assert!(matches!(sched.compile(), Err(Error::DuplicateCompute { patch: None, .. })));
    }

    #[test]
    fn a_cycle_is_reported() {
        let x = Label::cell("sched_test_cycle_x");
        let y = Label::cell("sched_test_cycle_y");
        let mut sched = Scheduler::new();
        sched.add_task(copy(x, y, "a"), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(copy(y, x, "b"), PatchSelection::Level(0), matls()).unwrap();
        match sched.compile() {
            Err(Error::CyclicDependency { tasks }) => assert_eq!(tasks, vec!["a", "b"]),
            other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn tasks_can_only_be_added_before_compiling() {
        let x = Label::cell("sched_test_state_x");
        let mut sched = Scheduler::new();
        sched.add_task(fill(x, 0.0), PatchSelection::Level(0), matls()).unwrap();
        sched.compile().unwrap();
        assert!(sched.add_task(scale(x, 2.0), PatchSelection::Level(0), matls()).is_err());
        sched.initialize();
        assert_eq!(sched.num_tasks(), 0);
        assert!(sched.add_task(fill(x, 0.0), PatchSelection::Level(0), matls()).is_ok());
    }

    #[test]
    fn parent_reads_are_rejected_at_depth_zero() {
        let x = Label::cell("sched_test_parent_x");
        let task = Task::per_patch("t", |_| Ok(())).requires(Dw::ParentNew, x, 0);
        assert!(Scheduler::new().add_task(task, PatchSelection::Grid, matls()).is_err());
        assert!(Scheduler::new().create_sub_scheduler().add_task(
            Task::per_patch("t", |_| Ok(())).requires(Dw::ParentNew, x, 0),
            PatchSelection::Grid,
            matls()).is_ok());
    }

    #[test]
    fn modifiers_run_in_order_and_readers_between_them_see_the_partial_result() {
        let grid = two_level_grid();
        let dist = Distribution::serial(&grid);
        let comm = LocalCommunicator::group(1).remove(0);
        let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };

        let x = Label::cell("sched_test_chain_x");
        let y = Label::cell("sched_test_chain_y");
        let mut stores = Warehouses::new(MAX_GHOST);
        let mut sched = Scheduler::new();
        sched.add_task(scale(x, 3.0), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(copy(x, y, "snapshot"), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(scale(x, 5.0), PatchSelection::Level(0), matls()).unwrap();
        sched.add_task(fill(x, 1.0), PatchSelection::Level(0), matls()).unwrap();
        sched.compile().unwrap();
        sched.execute(&mut stores, processor).unwrap();

        let new = stores.at(0, Dw::New).unwrap();
        let x2 = new.get_ref::<f64>(x, 0, 2, "test").unwrap();
        let y2 = new.get_ref::<f64>(y, 0, 2, "test").unwrap();
        assert_eq!(x2[(0, 4, 0)], 45.0);
        assert_eq!(y2[(0, 4, 0)], 9.0);
    }

    #[test]
    fn computed_data_survives_a_generation_advance() {
        let grid = two_level_grid();
        let dist = Distribution::serial(&grid);
        let comm = LocalCommunicator::group(1).remove(0);
        let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };

        let x = Label::cell("sched_test_advance_x");
        let seen = Label::reduction("sched_test_advance_sum", ReductionOp::Sum);
        let mut stores = Warehouses::new(MAX_GHOST);

        let mut first = Scheduler::new();
        first.add_task(fill(x, 10.0), PatchSelection::Level(0), matls()).unwrap();
        first.compile().unwrap();
        first.execute(&mut stores, processor).unwrap();
        first.advance_data_warehouse(&mut stores);

        let read = Task::per_patch("read_old", move |ctx| {
            let field = ctx.get::<f64>(Dw::Old, x, 0, 2)?;
            let patch = ctx.patch();
            let interior: f64 = patch.cells().iter().map(|i| field[i]).sum();
            assert_eq!(interior, (10.0 + patch.id() as f64) * 64.0);
            ctx.put_reduction(seen, 0, 1.0)
        })
        .requires(Dw::Old, x, 2)
        .computes(seen);

        let mut second = Scheduler::new();
        second.add_task(read, PatchSelection::Level(0), matls()).unwrap();
        second.compile().unwrap();
        second.execute(&mut stores, processor).unwrap();
        assert_eq!(stores.at(0, Dw::New).unwrap().get_reduction(seen, 0), Some(8.0));
    }

    #[test]
    fn complete_scrubbing_keeps_the_new_generation_for_the_next_step() {
        let grid = two_level_grid();
        let dist = Distribution::serial(&grid);
        let comm = LocalCommunicator::group(1).remove(0);
        let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };

        let x = Label::cell("sched_test_scrub_x");
        let y = Label::cell("sched_test_scrub_y");
        let z = Label::cell("sched_test_scrub_z");
        let mut stores = Warehouses::new(MAX_GHOST);
        stores.at_mut(0, Dw::New).unwrap().set_scrubbing(ScrubMode::Complete);

        let mut first = Scheduler::new();
        first.add_task(fill(x, 1.0), PatchSelection::Level(0), matls()).unwrap();
        first.add_task(copy(x, y, "copy"), PatchSelection::Level(0), matls()).unwrap();
        first.compile().unwrap();
        first.execute(&mut stores, processor).unwrap();
        first.advance_data_warehouse(&mut stores);

        let old = stores.at(0, Dw::Old).unwrap();
        assert!((0..8).all(|p| old.contains(x, 0, p) && old.contains(y, 0, p)));

        let read_old = Task::per_patch("read_old", move |ctx| {
            let source = ctx.get::<f64>(Dw::Old, x, 0, 0)?.into_owned();
            ctx.allocate_and_put::<f64>(z, 0)?.copy_region(&source, source.space());
            Ok(())
        })
        .requires(Dw::Old, x, 0)
        .computes(z);

        let mut second = Scheduler::new();
        second.add_task(read_old, PatchSelection::Level(0), matls()).unwrap();
        second.compile().unwrap();
        second.execute(&mut stores, processor).unwrap();

        let old = stores.at(0, Dw::Old).unwrap();
        assert!((0..8).all(|p| !old.contains(x, 0, p) && old.contains(y, 0, p)));
        assert!((0..8).all(|p| stores.at(0, Dw::New).unwrap().contains(z, 0, p)));
    }

    #[test]
    fn ghost_exchange_and_reductions_span_ranks() -> Result<()> {
        let grid = two_level_grid();
        let lb = ContiguousLoadBalancer::new(4);
        let x = Label::cell("sched_test_ranks_x");
        let total = Label::reduction("sched_test_ranks_total", ReductionOp::Sum);

        let sums = ranks::launch(4, false, |comm| {
            let dist = Distribution::new(&lb, &grid, None, comm.rank(), MAX_GHOST);
            let processor = Processor { grid: &grid, distribution: &dist, comm };
            let mut stores = Warehouses::new(MAX_GHOST);

            let halo = Task::per_patch("halo", move |ctx| {
                let field = ctx.get::<f64>(Dw::New, x, 0, 1)?;
                let cells = ctx.patch().cells().extend_all(1);
                let sum: f64 = cells.iter().map(|i| field[i]).sum();
                ctx.put_reduction(total, 0, sum)
            })
            .requires(Dw::New, x, 1)
            .computes(total);

            let mut sched = Scheduler::new();
            sched.add_task(fill(x, 1.0), PatchSelection::Level(0), matls())?;
            sched.add_task(halo, PatchSelection::Level(0), matls())?;
            sched.compile()?;
            sched.execute(&mut stores, processor)?;
            stores.at(0, Dw::New).unwrap().reduction(total, 0, "test")
        })?;

        let serial = {
            let dist = Distribution::serial(&grid);
            let comm = LocalCommunicator::group(1).remove(0);
            let processor = Processor { grid: &grid, distribution: &dist, comm: &comm };
            let mut stores = Warehouses::new(MAX_GHOST);
            let halo = Task::per_patch("halo", move |ctx| {
                let field = ctx.get::<f64>(Dw::New, x, 0, 1)?;
                let cells = ctx.patch().cells().extend_all(1);
                ctx.put_reduction(total, 0, cells.iter().map(|i| field[i]).sum())
            })
            .requires(Dw::New, x, 1)
            .computes(total);
            let mut sched = Scheduler::new();
            sched.add_task(fill(x, 1.0), PatchSelection::Level(0), matls())?;
            sched.add_task(halo, PatchSelection::Level(0), matls())?;
            sched.compile()?;
            sched.execute(&mut stores, processor)?;
            stores.at(0, Dw::New).unwrap().reduction(total, 0, "test")?
        };
        assert!(sums.iter().all(|&s| s == serial));
        Ok(())
    }

    #[test]
    fn once_per_proc_tasks_run_on_every_rank_over_its_own_patches() -> Result<()> {
        let grid = two_level_grid();
        let lb = ContiguousLoadBalancer::new(3);
        let runs = Label::reduction("sched_test_once_runs", ReductionOp::Sum);

        let seen = ranks::launch(3, false, |comm| {
            let dist = Distribution::new(&lb, &grid, None, comm.rank(), MAX_GHOST);
            let processor = Processor { grid: &grid, distribution: &dist, comm };
            let mut stores = Warehouses::new(MAX_GHOST);
            let owned = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&owned);

            let task = Task::once_per_proc("once", move |ctx| {
                sink.lock().unwrap().extend(ctx.patches().iter().map(|p| p.id()));
                ctx.put_reduction(runs, 0, 1.0)
            })
            .computes(runs);

            let mut sched = Scheduler::new();
            sched.add_task(task, PatchSelection::Level(1), matls())?;
            sched.compile()?;
            sched.execute(&mut stores, processor)?;
            let total = stores.at(0, Dw::New).unwrap().reduction(runs, 0, "test")?;
            let owned = owned.lock().unwrap().clone();
            Ok((total, owned))
        })?;

        assert!(seen.iter().all(|(total, _)| *total == 3.0));
        assert_eq!(seen.iter().map(|(_, owned)| owned.clone()).collect::<Vec<_>>(), vec![vec![8], vec![], vec![]]);
        Ok(())
    }

    #[test]
    fn a_restart_on_one_rank_is_seen_by_every_rank() -> Result<()> {
        let grid = two_level_grid();
        let lb = ContiguousLoadBalancer::new(3);

        let flags = ranks::launch(3, false, |comm| {
            let dist = Distribution::new(&lb, &grid, None, comm.rank(), MAX_GHOST);
            let processor = Processor { grid: &grid, distribution: &dist, comm };
            let mut stores = Warehouses::new(MAX_GHOST);
            let mut sched = Scheduler::new();
            let task = Task::per_patch("maybe_restart", |ctx| {
                if ctx.patch().id() == 7 {
                    ctx.request_restart();
                }
                Ok(())
            });
            sched.add_task(task, PatchSelection::Level(0), matls())?;
            sched.compile()?;
            sched.execute(&mut stores, processor)?;
            Ok(stores.at(0, Dw::New).unwrap().timestep_restarted())
        })?;
        assert_eq!(flags, vec![true, true, true]);
        Ok(())
    }
}
