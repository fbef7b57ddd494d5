#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp)]

pub mod sv_world;

pub use sv_world::{
    AreaType, CollisionModel, CollisionQuery, Entity, ServerFlags, Solid, World, WorldConfig,
};
