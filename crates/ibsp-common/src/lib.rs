#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::collapsible_if,
         clippy::collapsible_else_if, clippy::manual_range_contains, clippy::comparison_chain,
         clippy::float_cmp, clippy::identity_op, clippy::manual_clamp)]

pub mod q_shared;
pub mod qfiles;
pub mod common;
pub mod polylib;
pub mod cm_local;
pub mod cm_load;
pub mod cm_test;
pub mod cm_trace;
pub mod cm_boxhull;
