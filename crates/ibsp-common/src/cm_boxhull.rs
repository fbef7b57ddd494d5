// cm_boxhull.rs — Six-plane hulls for bounding-box entities
//
// Entities without a brush model still need to be traced with the same code
// as the world. A BoxHull is a tiny stand-alone tree: six chained axial nodes
// around one box brush. It is owned by whoever is tracing, so it can be
// rebuilt per trace without touching the loaded map.

use crate::cm_local::{CBrush, CBrushSide, CLeaf, CNode, CollisionTree};
use crate::q_shared::{CPlane, SurfaceFlags, Vec3};

const EMPTY_LEAF: i32 = -1; // leaf 0
const BOX_LEAF: i32 = -2; // leaf 1

#[derive(Debug, Clone)]
pub struct BoxHull {
    planes: [CPlane; 12],
    nodes: [CNode; 6],
    leafs: [CLeaf; 2],
    leaf_brushes: [usize; 1],
    brushes: [CBrush; 1],
    brush_sides: [CBrushSide; 6],
}

impl BoxHull {
    pub fn new(mins: &Vec3, maxs: &Vec3, contents: i32) -> Self {
        let mut nodes = [CNode::default(); 6];
        let mut brush_sides = [CBrushSide::default(); 6];

        for i in 0..6 {
            let side = i & 1;

            // brush sides face outward
            brush_sides[i] = CBrushSide { plane_idx: i * 2 + side, surface_flags: SurfaceFlags::empty() };

            // nodes
            nodes[i].plane_idx = i * 2;
            nodes[i].children[side] = EMPTY_LEAF;
            nodes[i].children[side ^ 1] = if i != 5 { i as i32 + 1 } else { BOX_LEAF };
        }

        let mut hull = BoxHull {
            planes: [CPlane::default(); 12],
            nodes,
            leafs: [
                CLeaf { contents: 0, cluster: -1, area: 0, firstleafbrush: 0, numleafbrushes: 0 },
                CLeaf { contents, cluster: -1, area: 0, firstleafbrush: 0, numleafbrushes: 1 },
            ],
            leaf_brushes: [0],
            brushes: [CBrush { contents, firstbrushside: 0, numsides: 6 }],
            brush_sides,
        };
        hull.set_bounds(mins, maxs);
        hull
    }

    /// Move the hull's faces to a new box, keeping its contents.
    pub fn set_bounds(&mut self, mins: &Vec3, maxs: &Vec3) {
        for i in 0..6 {
            let axis = i >> 1;
            let dist = if i & 1 == 0 { maxs[axis] } else { mins[axis] };
            let mut normal = [0.0f32; 3];
            normal[axis] = 1.0;
            self.planes[i * 2] = CPlane::new(normal, dist);
            self.planes[i * 2 + 1] = self.planes[i * 2].flipped();
        }
    }

    pub fn contents(&self) -> i32 {
        self.brushes[0].contents
    }

    /// Trace against the hull from here.
    pub fn headnode(&self) -> i32 {
        0
    }
}

impl CollisionTree for BoxHull {
    fn planes(&self) -> &[CPlane] {
        &self.planes
    }
    fn nodes(&self) -> &[CNode] {
        &self.nodes
    }
    fn leafs(&self) -> &[CLeaf] {
        &self.leafs
    }
    fn leaf_brushes(&self) -> &[usize] {
        &self.leaf_brushes
    }
    fn brushes(&self) -> &[CBrush] {
        &self.brushes
    }
    fn brush_sides(&self) -> &[CBrushSide] {
        &self.brush_sides
    }
}
