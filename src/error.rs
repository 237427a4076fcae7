use thiserror::Error;




/**
 * Errors raised by the task engine and the multi-level solve. Everything here
 * is fatal to the run: a timestep restart is reported as data, never as an
 * `Error`.
 */
#[derive(Error, Debug)]
pub enum Error {
    /// `patch` is `None` for reductions, and for reads found unproduced
    /// when the graph is compiled.
    #[error("task '{task}' read {label}{}, which no earlier task produced", on_patch(.patch))]
    MissingDependency {
        task: String,
        label: String,
        patch: Option<usize>,
    },

    #[error("{label}{} was produced by both '{first}' and '{second}'", on_patch(.patch))]
    DuplicateCompute {
        label: String,
        patch: Option<usize>,
        first: String,
        second: String,
    },

    #[error("ghost region of width {requested} for {label} on patch {patch} is unavailable (at most {available})")]
    GhostRegionUnavailable {
        label: String,
        patch: usize,
        requested: usize,
        available: usize,
    },

    #[error("no valid execution order: cycle through tasks {tasks:?}")]
    CyclicDependency { tasks: Vec<String> },

    #[error("task '{task}' violated its contract: {detail}")]
    ContractViolation { task: String, detail: String },

    #[error("the maximum number of outer iterations was reached ({iterations}): max_rhs {residual:e} > tolerance {tolerance:e}; try increasing max_outer_iterations or the outer tolerance")]
    ConvergenceFailure {
        iterations: usize,
        residual: f64,
        tolerance: f64,
    },

    #[error("timestep {step} was restarted at the smallest allowed step size {dt:e}")]
    TimestepRestartLimit { step: usize, dt: f64 },

    #[error("communication failure: {0}")]
    Communication(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;




fn on_patch(patch: &Option<usize>) -> String {
    match patch {
        Some(id) => format!(" on patch {}", id),
        None => String::new(),
    }
}




// ============================================================================
impl Error {
    pub(crate) fn contract<T: Into<String>>(task: &str, detail: T) -> Self {
        Self::ContractViolation {
            task: task.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Communication(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Communication(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
