// cm_local.rs — Runtime collision structures shared by the map and box hulls

use crate::q_shared::{CPlane, SurfaceFlags};

// ============================================================
// Internal structures (not in the BSP file, but used at runtime)
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CNode {
    pub plane_idx: usize,
    pub children: [i32; 2], // negative numbers are leafs
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBrushSide {
    pub plane_idx: usize,
    pub surface_flags: SurfaceFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CLeaf {
    pub contents: i32,
    pub cluster: i32,
    pub area: i32,
    pub firstleafbrush: usize,
    pub numleafbrushes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CBrush {
    pub contents: i32,
    pub firstbrushside: usize,
    pub numsides: usize,
}

/// Side-of-plane tolerance for the tracer. Matches the compiler's clip
/// epsilon scale so positions resting on a plane do not flicker.
pub const DIST_EPSILON: f32 = 0.03125;

/// Leaf lists are truncated at this size.
pub const MAX_LEAF_LIST: usize = 1024;

// ============================================================
// CollisionTree — the read-only view the tracer walks
// ============================================================

/// Anything the box tracer can descend: a loaded map, or a synthesized box
/// hull. Implementations are immutable during a trace, so any number of
/// traces may run against one tree at once.
pub trait CollisionTree: Sync {
    fn planes(&self) -> &[CPlane];
    fn nodes(&self) -> &[CNode];
    fn leafs(&self) -> &[CLeaf];
    fn leaf_brushes(&self) -> &[usize];
    fn brushes(&self) -> &[CBrush];
    fn brush_sides(&self) -> &[CBrushSide];

    /// Panics on a head node that does not exist. Tracing against a bogus
    /// hull would silently report "no collision".
    fn check_headnode(&self, headnode: i32) {
        let ok = if headnode >= 0 {
            (headnode as usize) < self.nodes().len()
        } else {
            ((-1 - headnode) as usize) < self.leafs().len()
        };
        if !ok {
            panic!(
                "bad headnode {} ({} nodes, {} leafs)",
                headnode,
                self.nodes().len(),
                self.leafs().len()
            );
        }
    }
}
