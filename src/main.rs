use clap::Parser;
use gridflow::config::RunConfig;
use gridflow::driver::Driver;
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::process;




/// Run the multi-level pressure solve forward in time on an in-process
/// group of ranks.
#[derive(Debug, Parser)]
#[clap(version, author = "J. Zrake <jzrake@clemson.edu>")]
struct Opts {
    /// TOML file with the run configuration; defaults are used without one
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(short = 'n', long)]
    num_ranks: Option<usize>,

    #[clap(short, long)]
    steps: Option<usize>,

    #[clap(long)]
    dt: Option<f64>,

    #[clap(long)]
    max_outer_iterations: Option<usize>,

    #[clap(long)]
    sweeps: Option<usize>,

    /// Pin rank r to core r
    #[clap(long)]
    pin: bool,

    /// One of off, error, warn, info, debug, trace
    #[clap(short, long, default_value = "info")]
    log_level: String,
}




// ============================================================================
impl Opts {
    fn run_config(&self) -> gridflow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(n) = self.num_ranks {
            config.num_ranks = n;
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        if let Some(dt) = self.dt {
            config.initial_dt = dt;
        }
        if let Some(n) = self.max_outer_iterations {
            config.solve.max_outer_iterations = n;
        }
        if let Some(sweeps) = self.sweeps {
            config.solve.solver.sweeps = sweeps;
        }
        config.pin_threads |= self.pin;
        config.validate()?;
        Ok(config)
    }
}




fn run(opts: &Opts) -> gridflow::Result<()> {
    let config = opts.run_config()?;
    let driver = Driver::new(config);

    info!("{:?}", driver.config());
    info!(
        "grid has {} levels and {} patches on {} ranks",
        driver.grid().num_levels(),
        driver.grid().num_patches(),
        driver.config().num_ranks);

    let start = std::time::Instant::now();
    let reports = driver.run()?;

    for r in &reports {
        info!("step {:>4} dt {:.3e} retries {} max_rhs {:.6e}", r.step, r.dt, r.retries, r.max_rhs);
    }
    info!("{} steps in {:.3}s", reports.len(), start.elapsed().as_secs_f64());
    Ok(())
}




fn main() {
    let opts = Opts::parse();

    let level = match opts.log_level.parse::<LevelFilter>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("unknown log level '{}'", opts.log_level);
            process::exit(2);
        }
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("could not install the logger: {}", e);
        process::exit(2);
    }
    if let Err(e) = run(&opts) {
        error!("{}", e);
        process::exit(1);
    }
}
