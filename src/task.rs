//! Task descriptors: a named callable plus the contract it declares over
//! the data store. The scheduler derives the execution order, the ghost
//! exchange, and the scrub counts from these declarations alone.

use crate::context::{PatchContext, ProcContext};
use crate::error::{Error, Result};
use crate::label::Label;
use crate::material::MaterialSubset;
use std::fmt;
use std::sync::Arc;

pub use crate::data_store::WhichDw;




/**
 * Which level's patches a dependency refers to, relative to the patch the
 * task runs on
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LevelDomain {
    This,
    Finer,
    Coarser,
}




/**
 * How a task is executed: once for every patch in its patch set, or once per
 * processing element over the union of the patches it owns
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    PerPatch,
    OncePerProc,
}




/**
 * One entry of a task's contract
 */
#[derive(Clone, Debug, PartialEq)]
pub struct Dependency {
    pub dw: WhichDw,
    pub label: Label,
    pub matls: Option<MaterialSubset>,
    pub ghost: usize,
    pub domain: LevelDomain,
}




pub type PatchAction = dyn Fn(&mut PatchContext) -> Result<()> + Send + Sync;
pub type ProcAction = dyn Fn(&mut ProcContext) -> Result<()> + Send + Sync;

#[derive(Clone)]
pub(crate) enum Action {
    PerPatch(Arc<PatchAction>),
    OncePerProc(Arc<ProcAction>),
}




/**
 * A unit of work and its declared reads and writes. Immutable once it has
 * been handed to a scheduler.
 */
#[derive(Clone)]
pub struct Task {
    name: String,
    action: Action,
    requires: Vec<Dependency>,
    computes: Vec<Dependency>,
    modifies: Vec<Dependency>,
    has_sub_scheduler: bool,
}




// ============================================================================
impl Dependency {


    pub fn new(dw: WhichDw, label: Label) -> Self {
        Self {
            dw,
            label,
            matls: None,
            ghost: 0,
            domain: LevelDomain::This,
        }
    }


    pub fn ghost(mut self, width: usize) -> Self {
        self.ghost = width;
        self
    }


    pub fn matls(mut self, matls: MaterialSubset) -> Self {
        self.matls = Some(matls);
        self
    }


    pub fn domain(mut self, domain: LevelDomain) -> Self {
        self.domain = domain;
        self
    }


    /**
     * Return the materials this dependency covers, given the materials the
     * task was scheduled with.
     */
    pub fn materials<'a>(&'a self, task_matls: &'a MaterialSubset) -> &'a MaterialSubset {
        self.matls.as_ref().unwrap_or(task_matls)
    }


    fn collides(&self, other: &Dependency) -> bool {
        self.label == other.label && self.domain == other.domain && match (&self.matls, &other.matls) {
            (Some(a), Some(b)) => a.iter().any(|m| b.contains(m)),
            _ => true,
        }
    }
}




// ============================================================================
impl Task {


    /**
     * Create a task that runs once for every patch it is scheduled on.
     */
    pub fn per_patch<F>(name: &str, action: F) -> Self
    where
        F: Fn(&mut PatchContext) -> Result<()> + Send + Sync + 'static,
    {
        Self::with_action(name, Action::PerPatch(Arc::new(action)))
    }


    /**
     * Create a task that runs once per processing element, over the union of
     * the patches assigned to it.
     */
    pub fn once_per_proc<F>(name: &str, action: F) -> Self
    where
        F: Fn(&mut ProcContext) -> Result<()> + Send + Sync + 'static,
    {
        Self::with_action(name, Action::OncePerProc(Arc::new(action)))
    }


    fn with_action(name: &str, action: Action) -> Self {
        Self {
            name: name.to_string(),
            action,
            requires: Vec::new(),
            computes: Vec::new(),
            modifies: Vec::new(),
            has_sub_scheduler: false,
        }
    }


    pub fn requires(self, dw: WhichDw, label: Label, ghost: usize) -> Self {
        self.require(Dependency::new(dw, label).ghost(ghost))
    }


    /**
     * Add a fully specified read dependency.
     */
    pub fn require(mut self, dep: Dependency) -> Self {
        self.requires.push(dep);
        self
    }


    /**
     * Declare a variable this task produces in the new generation.
     */
    pub fn computes(mut self, label: Label) -> Self {
        self.computes.push(Dependency::new(WhichDw::New, label));
        self
    }


    pub fn computes_matls(mut self, label: Label, matls: MaterialSubset) -> Self {
        self.computes.push(Dependency::new(WhichDw::New, label).matls(matls));
        self
    }


    /**
     * Declare a variable of the new generation this task updates in place.
     */
    pub fn modifies(mut self, label: Label) -> Self {
        self.modifies.push(Dependency::new(WhichDw::New, label));
        self
    }


    pub fn modifies_matls(mut self, label: Label, matls: MaterialSubset) -> Self {
        self.modifies.push(Dependency::new(WhichDw::New, label).matls(matls));
        self
    }


    /**
     * Mark this task as owning a private scheduler for its own execution.
     */
    pub fn with_sub_scheduler(mut self) -> Self {
        self.has_sub_scheduler = true;
        self
    }


    pub fn name(&self) -> &str {
        &self.name
    }


    pub fn kind(&self) -> TaskKind {
        match self.action {
            Action::PerPatch(_) => TaskKind::PerPatch,
            Action::OncePerProc(_) => TaskKind::OncePerProc,
        }
    }


    pub fn requires_list(&self) -> &[Dependency] {
        &self.requires
    }


    pub fn computes_list(&self) -> &[Dependency] {
        &self.computes
    }


    pub fn modifies_list(&self) -> &[Dependency] {
        &self.modifies
    }


    pub fn has_sub_scheduler(&self) -> bool {
        self.has_sub_scheduler
    }


    pub(crate) fn action(&self) -> &Action {
        &self.action
    }


    /**
     * Find the read dependency covering one material of a label in a
     * generation. Dependencies without their own materials cover those the
     * task was scheduled with.
     */
    pub fn find_require(
        &self,
        dw: WhichDw,
        label: Label,
        domain: LevelDomain,
        matl: i32,
        task_matls: &MaterialSubset,
    ) -> Option<&Dependency> {
        self.requires
            .iter()
            .find(|d| d.dw == dw && d.label == label && d.domain == domain && d.materials(task_matls).contains(matl))
    }


    /**
     * Check the contract for internal conflicts: a key both computed and
     * modified, a read of the new generation of a key the task itself
     * computes, or a ghosted read of a key the task modifies.
     */
    pub fn validate(&self) -> Result<()> {
        for c in &self.computes {
            if self.modifies.iter().any(|m| m.collides(c)) {
                return Err(Error::contract(&self.name, format!("{} is both computed and modified", c.label)));
            }
            if self.requires.iter().any(|r| r.dw == WhichDw::New && r.collides(c)) {
                return Err(Error::contract(&self.name, format!("{} is required from the new generation it computes", c.label)));
            }
        }
        for m in &self.modifies {
            if self.requires.iter().any(|r| r.dw == WhichDw::New && r.ghost > 0 && r.collides(m)) {
                return Err(Error::contract(&self.name, format!("{} is modified and required with ghost cells", m.label)));
            }
        }
        if let Some(m) = self.modifies.iter().find(|m| m.label.is_reduction()) {
            return Err(Error::contract(&self.name, format!("reduction {} cannot be modified", m.label)));
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("requires", &self.requires)
            .field("computes", &self.computes)
            .field("modifies", &self.modifies)
            .finish()
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Dependency, LevelDomain, Task, TaskKind, WhichDw as Dw};
    use crate::error::Error;
    use crate::label::Label;
    use crate::material::MaterialSubset;

    #[test]
    fn computing_and_modifying_one_key_is_rejected() {
        let x = Label::cell("task_test_x");
        let task = Task::per_patch("t", |_| Ok(())).computes(x).modifies(x);
        assert!(matches!(task.validate(), Err(Error::ContractViolation { .. })));
    }

    #[test]
    fn reading_a_key_the_task_computes_is_rejected() {
        let x = Label::cell("task_test_y");
        let task = Task::per_patch("t", |_| Ok(())).requires(Dw::New, x, 0).computes(x);
        assert!(task.validate().is_err());

        let ok = Task::per_patch("t", |_| Ok(())).requires(Dw::Old, x, 1).computes(x);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn a_finer_level_read_does_not_collide_with_this_level() {
        let x = Label::cell("task_test_z");
        let task = Task::per_patch("coarsen", |_| Ok(()))
            .require(Dependency::new(Dw::New, x).domain(LevelDomain::Finer))
            .modifies(x);
        assert!(task.validate().is_ok());
        assert_eq!(task.kind(), TaskKind::PerPatch);
        let matls = MaterialSubset::single(0);
        assert!(task.find_require(Dw::New, x, LevelDomain::Finer, 0, &matls).is_some());
        assert!(task.find_require(Dw::New, x, LevelDomain::This, 0, &matls).is_none());
        assert!(task.find_require(Dw::New, x, LevelDomain::Finer, 1, &matls).is_none());
    }
}
