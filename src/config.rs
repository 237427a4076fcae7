use crate::error::{Error, Result};
use crate::grid::{tile, Grid};
use crate::index_space::IndexSpace;
use crate::solver::SolverParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;




/**
 * Parameters of the multi-level implicit pressure solve
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveConfig {
    /// Upper bound on the outer iterations of one solve.
    pub max_outer_iterations: usize,

    /// Iterations before a timestep restart is requested.
    pub restart_threshold: usize,

    /// The solve has converged when the largest right-hand side magnitude
    /// is at or below this value.
    pub outer_tolerance: f64,

    /// A residual that exceeds the smallest residual seen so far by more
    /// than this multiple of it is treated as divergence.
    pub divergence_factor: f64,

    pub solver: SolverParams,
}




/**
 * Parameters of a demonstration run: the grid, the time stepping, and the
 * processing elements
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub num_ranks: usize,
    pub steps: usize,
    pub initial_dt: f64,
    pub min_dt: f64,
    pub max_ghost: usize,

    /// Number of level 0 cells along each axis.
    pub domain_cells: [i64; 3],

    /// Physical extent of the domain.
    pub domain_size: [f64; 3],

    pub refinement_ratio: i64,

    /// Lower and upper level 0 cell bounds of the refined region along each
    /// axis. An empty region means a single-level grid.
    pub fine_region: [[i64; 2]; 3],

    /// Largest patch extent along each axis, on every level.
    pub patch_size: [i64; 3],

    pub pin_threads: bool,

    pub solve: SolveConfig,
}




// ============================================================================
impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            max_outer_iterations: 20,
            restart_threshold: 15,
            outer_tolerance: 1e-8,
            divergence_factor: 100.0,
            solver: SolverParams::default(),
        }
    }
}

impl SolveConfig {


    /**
     * Check the values are usable.
     */
    pub fn validate(&self) -> Result<()> {
        if self.max_outer_iterations < 1 {
            return Err(Error::Config("max_outer_iterations must be at least 1".into()));
        }
        if !(self.outer_tolerance >= 0.0) {
            return Err(Error::Config(format!("outer_tolerance {} must be non-negative", self.outer_tolerance)));
        }
        if !(self.divergence_factor > 0.0) {
            return Err(Error::Config(format!("divergence_factor {} must be positive", self.divergence_factor)));
        }
        if self.solver.sweeps < 1 {
            return Err(Error::Config("solver.sweeps must be at least 1".into()));
        }
        Ok(())
    }
}




// ============================================================================
impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_ranks: 1,
            steps: 4,
            initial_dt: 0.01,
            min_dt: 1e-6,
            max_ghost: 2,
            domain_cells: [16, 16, 16],
            domain_size: [1.0, 1.0, 1.0],
            refinement_ratio: 2,
            fine_region: [[4, 12], [4, 12], [4, 12]],
            patch_size: [8, 8, 8],
            pin_threads: false,
            solve: SolveConfig::default(),
        }
    }
}

impl RunConfig {


    /**
     * Read a configuration from a TOML file. Missing keys take their
     * default values.
     */
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }


    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }


    /**
     * Check the values are usable, including that the refined region lies
     * inside the domain.
     */
    pub fn validate(&self) -> Result<()> {
        self.solve.validate()?;

        if self.num_ranks < 1 {
            return Err(Error::Config("num_ranks must be at least 1".into()));
        }
        if self.max_ghost < 1 {
            return Err(Error::Config("max_ghost must be at least 1".into()));
        }
        if !(self.min_dt > 0.0 && self.min_dt <= self.initial_dt) {
            return Err(Error::Config(format!("need 0 < min_dt ({}) <= initial_dt ({})", self.min_dt, self.initial_dt)));
        }
        if self.refinement_ratio < 1 {
            return Err(Error::Config("refinement_ratio must be at least 1".into()));
        }
        if self.domain_cells.iter().chain(self.patch_size.iter()).any(|&n| n < 1) {
            return Err(Error::Config("domain_cells and patch_size must be positive".into()));
        }
        if let Some(region) = self.fine_space() {
            if !self.domain().contains_space(&region) {
                return Err(Error::Config(format!("fine_region {:?} lies outside the domain", self.fine_region)));
            }
        }
        Ok(())
    }


    pub fn domain(&self) -> IndexSpace {
        let [ni, nj, nk] = self.domain_cells;
        IndexSpace::new(0..ni, 0..nj, 0..nk)
    }


    fn fine_space(&self) -> Option<IndexSpace> {
        let [i, j, k] = self.fine_region;
        if i[0] >= i[1] || j[0] >= j[1] || k[0] >= k[1] {
            None
        } else {
            Some(IndexSpace::new(i[0]..i[1], j[0]..j[1], k[0]..k[1]))
        }
    }


    /**
     * Build the grid: level 0 tiled over the domain, and if the refined
     * region is not empty, one finer level tiled over it.
     */
    pub fn grid(&self) -> Grid {
        let domain = self.domain();
        let spacing = [
            self.domain_size[0] / self.domain_cells[0] as f64,
            self.domain_size[1] / self.domain_cells[1] as f64,
            self.domain_size[2] / self.domain_cells[2] as f64,
        ];
        let size = (self.patch_size[0], self.patch_size[1], self.patch_size[2]);
        let builder = Grid::builder(domain.clone(), spacing).base_level(tile(&domain, size));

        match self.fine_space() {
            Some(region) => {
                let r = self.refinement_ratio;
                builder.level((r, r, r), tile(&region.refine((r, r, r)), size)).build()
            }
            None => builder.build(),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{RunConfig, SolveConfig};
    use crate::error::Error;

    #[test]
    fn missing_keys_take_defaults() {
        let config = RunConfig::from_toml("steps = 2\n[solve]\nrestart_threshold = 5\n").unwrap();
        assert_eq!(config.steps, 2);
        assert_eq!(config.solve.restart_threshold, 5);
        assert_eq!(config.solve.max_outer_iterations, 20);
        assert_eq!(config.solve.solver.sweeps, 60);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(RunConfig::from_toml("steps = \"many\""), Err(Error::Config(_))));
    }

    #[test]
    fn zero_outer_iterations_is_rejected() {
        let config = SolveConfig { max_outer_iterations: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn fine_region_must_lie_in_the_domain() {
        let config = RunConfig { fine_region: [[4, 20], [0, 4], [0, 4]], ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_grid_has_two_levels() {
        let grid = RunConfig::default().grid();
        assert_eq!(grid.num_levels(), 2);
        assert_eq!(grid.level(0).patches().len(), 8);
        assert_eq!(grid.level(1).patches().len(), 8);
    }

    #[test]
    fn empty_fine_region_gives_one_level() {
        let config = RunConfig { fine_region: [[0, 0], [0, 0], [0, 0]], ..Default::default() };
        assert_eq!(config.grid().num_levels(), 1);
    }
}
