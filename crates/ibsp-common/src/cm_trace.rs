// cm_trace.rs — Swept box traces through a collision tree
//
// The tree is never written during a trace: the per-brush "already tested"
// marks and the running result live in a TraceWork owned by the call, so any
// number of traces may run against one map at the same time.

use crate::cm_load::ClipMap;
use crate::cm_local::{CollisionTree, DIST_EPSILON};
use crate::q_shared::{
    create_rotation_matrix, dot_product, rotate_point, transpose_matrix, vector_add,
    vector_lerp, vector_subtract, CPlane, Mat3, SurfaceFlags, Trace, Vec3,
};

// ============================================================
// Model placement
// ============================================================

/// Where a brush model sits in the world: translation, rotation matrix and
/// its inverse. World = matrix * local + origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelTransform {
    pub origin: Vec3,
    pub matrix: Mat3,
    pub inverse: Mat3,
    pub rotated: bool,
}

impl ModelTransform {
    pub fn new(origin: &Vec3, angles: &Vec3) -> Self {
        let rotated = angles[0] != 0.0 || angles[1] != 0.0 || angles[2] != 0.0;
        let matrix = if rotated {
            create_rotation_matrix(angles)
        } else {
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
        };
        Self::from_matrix(origin, matrix, transpose_matrix(&matrix))
    }

    /// Use a caller-supplied matrix pair. `inverse` must undo `matrix`.
    pub fn from_matrix(origin: &Vec3, matrix: Mat3, inverse: Mat3) -> Self {
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        ModelTransform { origin: *origin, matrix, inverse, rotated: matrix != identity }
    }

    pub fn point_to_local(&self, p: &Vec3) -> Vec3 {
        let d = vector_subtract(p, &self.origin);
        if self.rotated {
            rotate_point(&self.inverse, &d)
        } else {
            d
        }
    }

    pub fn direction_to_world(&self, v: &Vec3) -> Vec3 {
        if self.rotated {
            rotate_point(&self.matrix, v)
        } else {
            *v
        }
    }

    /// Bring a plane found in model space back out into the world.
    pub fn plane_to_world(&self, plane: &CPlane) -> CPlane {
        let normal = self.direction_to_world(&plane.normal);
        CPlane::new(normal, plane.dist + dot_product(&normal, &self.origin))
    }
}

// ============================================================
// Per-trace state
// ============================================================

struct TraceWork<'a, T: CollisionTree + ?Sized> {
    tree: &'a T,
    start: Vec3,
    end: Vec3,
    size: [Vec3; 2], // symmetric around the origin
    extents: Vec3,
    contents: i32,
    ispoint: bool,
    ispos: bool,
    checked: Vec<u64>,
    trace: Trace,
}

impl<'a, T: CollisionTree + ?Sized> TraceWork<'a, T> {
    /// Mark a brush as tested; false if it already was.
    fn check_brush(&mut self, brushnum: usize) -> bool {
        let (word, bit) = (brushnum / 64, 1u64 << (brushnum % 64));
        if self.checked[word] & bit != 0 {
            return false;
        }
        self.checked[word] |= bit;
        true
    }

    fn clip_box_to_brush(&mut self, brushnum: usize) {
        let tree = self.tree;
        let (p1, p2) = (&self.start, &self.end);
        let brush = &tree.brushes()[brushnum];
        if brush.numsides == 0 {
            return;
        }

        let mut enterfrac: f32 = -1.0;
        let mut leavefrac: f32 = 1.0;
        let mut clipplane: Option<CPlane> = None;
        let mut leadside: Option<usize> = None;

        let mut getout = false;
        let mut startout = false;

        for side_idx in brush.firstbrushside..brush.firstbrushside + brush.numsides {
            let plane = &tree.planes()[tree.brush_sides()[side_idx].plane_idx];

            // push the plane out by the box's extent along the normal
            let dist = if self.ispoint {
                plane.dist
            } else {
                let mut ofs = [0.0f32; 3];
                for j in 0..3 {
                    ofs[j] = if plane.normal[j] < 0.0 { self.size[1][j] } else { self.size[0][j] };
                }
                plane.dist - dot_product(&ofs, &plane.normal)
            };

            let d1 = dot_product(p1, &plane.normal) - dist;
            let d2 = dot_product(p2, &plane.normal) - dist;

            if d2 > 0.0 {
                getout = true; // endpoint is not in solid
            }
            if d1 > 0.0 {
                startout = true;
            }

            // if completely in front of face, no intersection
            if d1 > 0.0 && d2 >= d1 {
                return;
            }
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            // crosses face
            if d1 > d2 {
                // enter
                let f = (d1 - DIST_EPSILON) / (d1 - d2);
                if f > enterfrac {
                    enterfrac = f;
                    clipplane = Some(*plane);
                    leadside = Some(side_idx);
                }
            } else {
                // leave
                let f = (d1 + DIST_EPSILON) / (d1 - d2);
                if f < leavefrac {
                    leavefrac = f;
                }
            }
        }

        if !startout {
            // original point was inside brush
            self.trace.startsolid = true;
            if !getout {
                self.trace.allsolid = true;
                self.trace.fraction = 0.0;
                self.trace.contents = brush.contents;
            }
            return;
        }

        if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < self.trace.fraction {
            self.trace.fraction = enterfrac.max(0.0);
            if let Some(plane) = clipplane {
                self.trace.plane = plane;
            }
            if let Some(side) = leadside {
                self.trace.surface_flags = tree.brush_sides()[side].surface_flags;
            }
            self.trace.contents = brush.contents;
        }
    }

    fn test_box_in_brush(&mut self, brushnum: usize) {
        let tree = self.tree;
        let brush = &tree.brushes()[brushnum];
        if brush.numsides == 0 {
            return;
        }

        for side_idx in brush.firstbrushside..brush.firstbrushside + brush.numsides {
            let plane = &tree.planes()[tree.brush_sides()[side_idx].plane_idx];
            let mut ofs = [0.0f32; 3];
            for j in 0..3 {
                ofs[j] = if plane.normal[j] < 0.0 { self.size[1][j] } else { self.size[0][j] };
            }
            let dist = plane.dist - dot_product(&ofs, &plane.normal);
            let d1 = dot_product(&self.start, &plane.normal) - dist;

            // if completely in front of face, no intersection
            if d1 > 0.0 {
                return;
            }
        }

        // inside this brush
        self.trace.startsolid = true;
        self.trace.allsolid = true;
        self.trace.fraction = 0.0;
        self.trace.contents = brush.contents;
    }

    /// `entry` is the plane crossed to get into this leaf's part of the
    /// segment, facing the mover; `None` means the segment starts here.
    fn trace_to_leaf(&mut self, leafnum: usize, p1f: f32, p2f: f32, entry: Option<CPlane>) {
        let tree = self.tree;
        let leaf = tree.leafs()[leafnum];
        if leaf.contents & self.contents == 0 {
            return;
        }

        if leaf.numleafbrushes == 0 {
            // no brushes to refine against: the leaf volume itself blocks
            match entry {
                None => {
                    self.trace.startsolid = true;
                    if p2f >= 1.0 {
                        self.trace.allsolid = true;
                        self.trace.fraction = 0.0;
                    }
                    self.trace.contents = leaf.contents;
                }
                Some(plane) => {
                    if p1f < self.trace.fraction {
                        self.trace.fraction = p1f.max(0.0);
                        self.trace.plane = plane;
                        self.trace.surface_flags = SurfaceFlags::empty();
                        self.trace.contents = leaf.contents;
                    }
                }
            }
            return;
        }

        // trace line against all brushes in the leaf
        for k in leaf.firstleafbrush..leaf.firstleafbrush + leaf.numleafbrushes {
            let brushnum = tree.leaf_brushes()[k];
            if !self.check_brush(brushnum) {
                continue; // already checked this brush in another leaf
            }
            if tree.brushes()[brushnum].contents & self.contents == 0 {
                continue;
            }
            if self.ispos {
                self.test_box_in_brush(brushnum);
            } else {
                self.clip_box_to_brush(brushnum);
            }
            if self.trace.fraction == 0.0 {
                return;
            }
        }
    }

    fn recursive_hull_check(&mut self, num: i32, p1f: f32, p2f: f32, p1: &Vec3, p2: &Vec3, entry: Option<CPlane>) {
        if self.trace.fraction <= p1f {
            return; // already hit something nearer
        }

        // if < 0, we are in a leaf node
        if num < 0 {
            self.trace_to_leaf((-1 - num) as usize, p1f, p2f, entry);
            return;
        }

        let tree = self.tree;
        let node = tree.nodes()[num as usize];
        let plane = tree.planes()[node.plane_idx];

        // find the point distances to the separating plane
        // and the offset for the size of the box
        let (t1, t2, offset);
        if (plane.plane_type as usize) < 3 {
            let pt = plane.plane_type as usize;
            t1 = p1[pt] - plane.dist;
            t2 = p2[pt] - plane.dist;
            offset = self.extents[pt];
        } else {
            t1 = dot_product(&plane.normal, p1) - plane.dist;
            t2 = dot_product(&plane.normal, p2) - plane.dist;
            offset = if self.ispoint {
                0.0
            } else {
                (self.extents[0] * plane.normal[0]).abs()
                    + (self.extents[1] * plane.normal[1]).abs()
                    + (self.extents[2] * plane.normal[2]).abs()
            };
        }

        // see which sides we need to consider
        if t1 >= offset && t2 >= offset {
            self.recursive_hull_check(node.children[0], p1f, p2f, p1, p2, entry);
            return;
        }
        if t1 < -offset && t2 < -offset {
            self.recursive_hull_check(node.children[1], p1f, p2f, p1, p2, entry);
            return;
        }

        // put the crosspoint DIST_EPSILON pixels on the near side
        let (side, frac, frac2);
        if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            side = 1usize;
            frac2 = ((t1 + offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
            frac = ((t1 - offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            side = 0usize;
            frac2 = ((t1 - offset - DIST_EPSILON) * idist).clamp(0.0, 1.0);
            frac = ((t1 + offset + DIST_EPSILON) * idist).clamp(0.0, 1.0);
        } else {
            side = 0;
            frac = 1.0;
            frac2 = 0.0;
        }

        // move up to the node
        let midf = p1f + (p2f - p1f) * frac;
        let mid = vector_lerp(p1, p2, frac);
        self.recursive_hull_check(node.children[side], p1f, midf, p1, &mid, entry);

        // go past the node. The far half is entered through this plane
        // unless the box already overlapped it at the start.
        let far_entry = if side == 0 && t1 > t2 && t1 >= offset {
            Some(plane)
        } else if side == 1 && t1 <= -offset {
            Some(plane.flipped())
        } else {
            entry
        };
        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2 = vector_lerp(p1, p2, frac2);
        self.recursive_hull_check(node.children[side ^ 1], midf2, p2f, &mid2, p2, far_entry);
    }
}

// ============================================================
// Box trace entry points
// ============================================================

/// Sweep the box `mins..maxs` from `start` to `end` through the tree rooted
/// at `headnode`, stopping at the first brush or leaf whose contents
/// intersect `brushmask`. `start == end` is a position test.
pub fn box_trace<T: CollisionTree + ?Sized>(
    tree: &T,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    headnode: i32,
    brushmask: i32,
) -> Trace {
    tree.check_headnode(headnode);

    // adjust so that mins and maxs are always symmetric, which
    // avoids some complications with plane expanding of rotated
    // bmodels
    let mut offset = [0.0f32; 3];
    let mut size = [[0.0f32; 3]; 2];
    for i in 0..3 {
        offset[i] = (mins[i] + maxs[i]) * 0.5;
        size[0][i] = mins[i] - offset[i];
        size[1][i] = maxs[i] - offset[i];
    }
    let w_start = vector_add(start, &offset);
    let w_end = vector_add(end, &offset);

    let ispoint = size[1] == [0.0; 3];
    let extents = size[1];

    let mut tw = TraceWork {
        tree,
        start: w_start,
        end: w_end,
        size,
        extents,
        contents: brushmask,
        ispoint,
        ispos: start == end,
        checked: vec![0u64; tree.brushes().len().div_ceil(64)],
        trace: Trace::default(),
    };

    tw.recursive_hull_check(headnode, 0.0, 1.0, &w_start, &w_end, None);

    let mut trace = tw.trace;
    // generate endpos from the original, unmodified start/end
    trace.endpos = if trace.fraction == 1.0 { *end } else { vector_lerp(start, end, trace.fraction) };
    trace
}

/// Trace against a model placed by `xform`. The segment is moved into model
/// space, traced, and the impact plane is brought back out.
#[allow(clippy::too_many_arguments)]
pub fn transformed_box_trace<T: CollisionTree + ?Sized>(
    tree: &T,
    start: &Vec3,
    end: &Vec3,
    mins: &Vec3,
    maxs: &Vec3,
    headnode: i32,
    brushmask: i32,
    xform: &ModelTransform,
) -> Trace {
    // rotate around the box center so asymmetric boxes keep their place
    let mut offset = [0.0f32; 3];
    let mut half = [0.0f32; 3];
    for i in 0..3 {
        offset[i] = (mins[i] + maxs[i]) * 0.5;
        half[i] = maxs[i] - offset[i];
    }
    let neg_half = [-half[0], -half[1], -half[2]];

    let start_l = xform.point_to_local(&vector_add(start, &offset));
    let end_l = xform.point_to_local(&vector_add(end, &offset));

    let mut trace = box_trace(tree, &start_l, &end_l, &neg_half, &half, headnode, brushmask);

    if trace.fraction != 1.0 {
        trace.plane = xform.plane_to_world(&trace.plane);
    }

    // fraction is the same in both spaces
    trace.endpos = vector_lerp(start, end, trace.fraction);
    trace
}

// ============================================================
// ClipMap conveniences
// ============================================================

impl ClipMap {
    pub fn box_trace(&self, start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, headnode: i32, brushmask: i32) -> Trace {
        box_trace(self, start, end, mins, maxs, headnode, brushmask)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: i32,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Trace {
        let xform = ModelTransform::new(origin, angles);
        transformed_box_trace(self, start, end, mins, maxs, headnode, brushmask, &xform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm_load::fixtures::{cube_bsp, ground_bsp};
    use crate::q_shared::{CONTENTS_SOLID, CONTENTS_WATER, MASK_SOLID};
    use rand::Rng;

    const BOX_MINS: Vec3 = [-16.0, -16.0, -16.0];
    const BOX_MAXS: Vec3 = [16.0, 16.0, 16.0];

    fn ground() -> ClipMap {
        ClipMap::from_bsp(&ground_bsp(), "ground").expect("load")
    }

    fn cube() -> ClipMap {
        ClipMap::from_bsp(&cube_bsp(), "cube").expect("load")
    }

    // ============================================================
    // Leaf-granular solids
    // ============================================================

    #[test]
    fn box_falls_onto_ground_leaf() {
        let map = ground();
        let t = map.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, -100.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        let expected = (100.0 - 16.0 - DIST_EPSILON) / 200.0;
        assert!((t.fraction - expected).abs() < 1e-5, "fraction {} expected {}", t.fraction, expected);
        assert!((t.fraction - 0.42).abs() < 0.001);
        assert!(!t.startsolid);
        assert!(!t.allsolid);
        assert_eq!(t.plane.normal, [0.0, 0.0, 1.0]);
        assert_eq!(t.contents, CONTENTS_SOLID);
        assert!(t.endpos[2] > 16.0 && t.endpos[2] < 16.1, "endpos {:?}", t.endpos);
    }

    #[test]
    fn rising_out_of_ground_is_startsolid() {
        let map = ground();
        let t = map.box_trace(&[0.0, 0.0, 8.0], &[0.0, 0.0, 100.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        assert!(t.startsolid, "box overlaps the ground at its start");
        assert!(!t.allsolid);
    }

    #[test]
    fn buried_position_test_is_allsolid() {
        let map = ground();
        let t = map.box_trace(&[0.0, 0.0, -100.0], &[0.0, 0.0, -100.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        assert!(t.startsolid && t.allsolid);
        assert_eq!(t.fraction, 0.0);
    }

    #[test]
    fn content_mask_filters_leaf() {
        let map = ground();
        let t = map.box_trace(&[0.0, 0.0, 100.0], &[0.0, 0.0, -100.0], &BOX_MINS, &BOX_MAXS, 0, CONTENTS_WATER);
        assert_eq!(t.fraction, 1.0);
        assert_eq!(t.endpos, [0.0, 0.0, -100.0]);
    }

    // ============================================================
    // Brush-precise clipping
    // ============================================================

    #[test]
    fn point_trace_hits_cube_face() {
        let map = cube();
        let t = map.box_trace(&[-100.0, 0.0, 0.0], &[100.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], 0, MASK_SOLID);
        let expected = (68.0 - DIST_EPSILON) / 200.0;
        assert!((t.fraction - expected).abs() < 1e-5, "fraction {}", t.fraction);
        assert_eq!(t.plane.normal, [-1.0, 0.0, 0.0]);
        assert!(!t.startsolid);
    }

    #[test]
    fn box_trace_hits_cube_top() {
        let map = cube();
        let t = map.box_trace(&[0.0, 0.0, 200.0], &[0.0, 0.0, 0.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        // bottom of the box stops on z = 32
        let expected = (200.0 - 48.0 - DIST_EPSILON) / 200.0;
        assert!((t.fraction - expected).abs() < 1e-5, "fraction {}", t.fraction);
        assert_eq!(t.plane.normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn grazing_trace_misses() {
        let map = cube();
        let t = map.box_trace(&[-100.0, 60.0, 0.0], &[100.0, 60.0, 0.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        assert_eq!(t.fraction, 1.0);
        assert!(!t.startsolid);
    }

    #[test]
    fn asymmetric_box_uses_true_extent() {
        let map = cube();
        // a box that only reaches 8 units down
        let t = map.box_trace(&[0.0, 0.0, 200.0], &[0.0, 0.0, 0.0], &[-16.0, -16.0, -8.0], &[16.0, 16.0, 40.0], 0, MASK_SOLID);
        let expected = (200.0 - 40.0 - DIST_EPSILON) / 200.0;
        assert!((t.fraction - expected).abs() < 1e-4, "fraction {}", t.fraction);
        assert!((t.endpos[2] - 40.0).abs() < 0.1, "endpos {:?}", t.endpos);
    }

    #[test]
    fn position_test_inside_brush() {
        let map = cube();
        let t = map.box_trace(&[0.0; 3], &[0.0; 3], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        assert!(t.startsolid && t.allsolid);
        let t = map.box_trace(&[100.0, 0.0, 0.0], &[100.0, 0.0, 0.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
        assert!(!t.startsolid && !t.allsolid);
        assert_eq!(t.fraction, 1.0);
    }

    // ============================================================
    // Monotonicity: nothing is hit before the reported impact
    // ============================================================

    #[test]
    fn retrace_to_impact_is_clear() {
        let maps = [ground(), cube()];
        let mut rng = rand::thread_rng();
        for map in &maps {
            for _ in 0..500 {
                let start = [
                    rng.gen_range(-200.0..200.0),
                    rng.gen_range(-200.0..200.0),
                    rng.gen_range(60.0..200.0),
                ];
                let end = [
                    rng.gen_range(-200.0..200.0),
                    rng.gen_range(-200.0..200.0),
                    rng.gen_range(-200.0..200.0),
                ];
                let t = map.box_trace(&start, &end, &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
                assert!((0.0..=1.0).contains(&t.fraction));
                if t.startsolid || t.fraction >= 1.0 {
                    continue;
                }
                let short = vector_lerp(&start, &end, (t.fraction - 0.001).max(0.0));
                let t2 = map.box_trace(&start, &short, &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID);
                assert_eq!(t2.fraction, 1.0, "earlier impact missed: {:?} -> {:?} frac {}", start, end, t.fraction);
            }
        }
    }

    // ============================================================
    // Transformed traces
    // ============================================================

    #[test]
    fn translated_model_trace() {
        let map = cube();
        let xform = ModelTransform::new(&[0.0, 0.0, 500.0], &[0.0; 3]);
        let t = transformed_box_trace(&map, &[0.0, 0.0, 700.0], &[0.0, 0.0, 500.0], &BOX_MINS, &BOX_MAXS, 0, MASK_SOLID, &xform);
        let expected = (200.0 - 48.0 - DIST_EPSILON) / 200.0;
        assert!((t.fraction - expected).abs() < 1e-5, "fraction {}", t.fraction);
        assert!((t.plane.dist - 532.0).abs() < 1e-3, "plane must be moved to world space, got {}", t.plane.dist);
        assert!((t.endpos[2] - 548.0).abs() < 0.1);
    }

    #[test]
    fn rotated_model_returns_world_normal() {
        let map = cube();
        let xform = ModelTransform::new(&[0.0; 3], &[0.0, 90.0, 0.0]);
        let t = transformed_box_trace(&map, &[-100.0, 0.0, 0.0], &[100.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], 0, MASK_SOLID, &xform);
        assert!(t.fraction < 1.0);
        assert!((t.plane.normal[0] + 1.0).abs() < 1e-4, "normal {:?}", t.plane.normal);
        assert!(t.plane.normal[1].abs() < 1e-4);
    }

    #[test]
    fn concurrent_traces_share_one_map() {
        use rayon::prelude::*;
        let map = cube();
        let fractions: Vec<f32> = (0..64)
            .into_par_iter()
            .map(|i| {
                let y = (i % 8) as f32;
                map.box_trace(&[-100.0, y, 0.0], &[100.0, y, 0.0], &[0.0; 3], &[0.0; 3], 0, MASK_SOLID).fraction
            })
            .collect();
        assert!(fractions.iter().all(|&f| (f - fractions[0]).abs() < 1e-6));
    }
}
