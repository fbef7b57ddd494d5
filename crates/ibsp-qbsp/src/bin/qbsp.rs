// qbsp — Compile a .map source into a .bsp

use std::path::PathBuf;
use std::process::exit;
use std::time::Instant;

use clap::Parser;
use log::{error, info};

use ibsp_common::common::init_logging;
use ibsp_qbsp::{compile_file, CompileOptions};

#[derive(Parser, Debug)]
#[command(name = "qbsp", version, about = "BSP compiler for brush maps")]
struct Args {
    /// Map source; outputs are written next to it.
    #[arg(value_name = "MAPFILE")]
    map: PathBuf,

    #[arg(long, short = 'v')]
    verbose: bool,

    /// Worker threads, 0 for one per core.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Fail instead of warning when the map leaks.
    #[arg(long)]
    leaktest: bool,

    #[arg(long)]
    nofill: bool,

    #[arg(long)]
    notjunc: bool,

    #[arg(long)]
    nomerge: bool,

    #[arg(long, default_value_t = 0.125)]
    micro: f32,

    #[arg(long, default_value_t = 1024.0)]
    blocksize: f32,

    /// Where to write the leak trail, default MAPFILE.lin.
    #[arg(long, value_name = "PATH")]
    leakfile: Option<PathBuf>,
}

impl Args {
    fn options(&self) -> CompileOptions {
        CompileOptions {
            microvolume: self.micro,
            blocksize: self.blocksize,
            leaktest: self.leaktest,
            nofill: self.nofill,
            notjunc: self.notjunc,
            nomerge: self.nomerge,
            threads: self.threads,
            leakfile: self.leakfile.clone(),
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    info!("---- qbsp ----");
    let start = Instant::now();
    match compile_file(&args.map, args.options()) {
        Ok(out) => {
            if out.leaked {
                info!("map leaked, {} point leak trail written", out.leak_points.len());
            }
            info!("{:5.1} seconds elapsed", start.elapsed().as_secs_f32());
        }
        Err(e) => {
            error!("{}: {}", args.map.display(), e);
            exit(1);
        }
    }
}
