//! Gridflow is a task-graph runtime for adaptive mesh refinement (AMR)
//! simulations on structured, rectilinear grid patches. Computations are
//! written as tasks that declare which variables they read, produce, and
//! update on which generation of the data store; a scheduler orders the
//! tasks from those declarations, runs each one over the patches a rank
//! owns, and exchanges ghost data and reductions between ranks. Schedulers
//! nest, so a single task can drive a private task graph through an
//! iterative solve. The multi-level implicit pressure solve, with reflux
//! across coarse/fine interfaces, is built this way.

pub mod adjacency_list;
pub mod config;
pub mod context;
pub mod data_store;
pub mod driver;
pub mod error;
pub mod grid;
pub mod index_space;
pub mod label;
pub mod load_balancer;
pub mod material;
pub mod message;
pub mod patch;
pub mod pressure;
pub mod ranks;
pub mod scheduler;
pub mod solver;
pub mod task;
pub mod variable;

pub use error::{Error, Result};
