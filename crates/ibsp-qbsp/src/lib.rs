#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::collapsible_if,
         clippy::collapsible_else_if, clippy::manual_range_contains, clippy::float_cmp)]

pub mod options;
pub mod context;
pub mod map;
pub mod brush;
pub mod tree;
pub mod portals;
pub mod blocktree;
pub mod outside;
pub mod faces;
pub mod tjunc;
pub mod writebsp;
pub mod prtfile;
pub mod compile;

pub use compile::{compile_file, compile_map, CompileOutput};
pub use context::CompilationContext;
pub use options::CompileOptions;
