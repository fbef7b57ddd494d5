// options.rs — Compiler switches

use std::path::PathBuf;

/// Knobs for one compile. The `qbsp` binary fills these from its command
/// line; library users construct them directly.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    /// Brush fragments and regions smaller than this volume are dropped.
    pub microvolume: f32,
    /// Edge length of the x/y grid the world is cut into before building.
    pub blocksize: f32,
    /// A leak is a hard error instead of a warning.
    pub leaktest: bool,
    /// Never fill the outside, even when the map is sealed.
    pub nofill: bool,
    pub notjunc: bool,
    pub nomerge: bool,
    /// Worker threads, 0 for one per core.
    pub threads: usize,
    /// Where to write the leak trail when the world is open.
    pub leakfile: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            microvolume: 0.125,
            blocksize: 1024.0,
            leaktest: false,
            nofill: false,
            notjunc: false,
            nomerge: false,
            threads: 0,
            leakfile: None,
        }
    }
}
