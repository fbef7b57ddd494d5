// cm_test.rs — Point and box classification against a collision tree

use crate::cm_load::ClipMap;
use crate::cm_local::{CollisionTree, MAX_LEAF_LIST};
use crate::cm_trace::ModelTransform;
use crate::q_shared::{box_on_plane_side, dot_product, Vec3};

/// Descend from `headnode` to the leaf containing `p`.
pub fn point_leafnum<T: CollisionTree + ?Sized>(tree: &T, p: &Vec3, headnode: i32) -> usize {
    tree.check_headnode(headnode);
    let nodes = tree.nodes();
    let planes = tree.planes();

    let mut num = headnode;
    while num >= 0 {
        let node = &nodes[num as usize];
        let d = planes[node.plane_idx].distance_to(p);
        num = if d < 0.0 { node.children[1] } else { node.children[0] };
    }
    (-1 - num) as usize
}

/// Collect the leafs touched by a box, along with the first node that
/// splits the box (or the leaf code if none does).
pub fn box_leafnums<T: CollisionTree + ?Sized>(
    tree: &T,
    mins: &Vec3,
    maxs: &Vec3,
    headnode: i32,
    max_count: usize,
) -> (Vec<usize>, i32) {
    tree.check_headnode(headnode);
    let mut list = Vec::new();
    let mut topnode = -1;
    box_leafnums_r(tree, mins, maxs, headnode, max_count, &mut list, &mut topnode);
    (list, topnode)
}

fn box_leafnums_r<T: CollisionTree + ?Sized>(
    tree: &T,
    mins: &Vec3,
    maxs: &Vec3,
    mut nodenum: i32,
    max_count: usize,
    list: &mut Vec<usize>,
    topnode: &mut i32,
) {
    loop {
        if nodenum < 0 {
            if list.len() >= max_count {
                return;
            }
            list.push((-1 - nodenum) as usize);
            return;
        }

        let node = &tree.nodes()[nodenum as usize];
        let plane = &tree.planes()[node.plane_idx];
        match box_on_plane_side(mins, maxs, plane) {
            1 => nodenum = node.children[0],
            2 => nodenum = node.children[1],
            _ => {
                // go down both
                if *topnode == -1 {
                    *topnode = nodenum;
                }
                box_leafnums_r(tree, mins, maxs, node.children[0], max_count, list, topnode);
                nodenum = node.children[1];
            }
        }
    }
}

/// Contents at a point. Leafs carrying brushes are tested brush by brush so
/// the answer is exact below leaf granularity; other leafs report their
/// own contents.
pub fn point_contents<T: CollisionTree + ?Sized>(tree: &T, p: &Vec3, headnode: i32) -> i32 {
    let leafnum = point_leafnum(tree, p, headnode);
    let leaf = &tree.leafs()[leafnum];

    if leaf.numleafbrushes == 0 {
        return leaf.contents;
    }

    let mut contents = 0;
    let first = leaf.firstleafbrush;
    for &brushnum in &tree.leaf_brushes()[first..first + leaf.numleafbrushes] {
        let brush = &tree.brushes()[brushnum];
        let sides = &tree.brush_sides()[brush.firstbrushside..brush.firstbrushside + brush.numsides];
        let inside = sides.iter().all(|side| {
            let plane = &tree.planes()[side.plane_idx];
            dot_product(p, &plane.normal) - plane.dist <= 0.0
        });
        if inside {
            contents |= brush.contents;
        }
    }
    contents
}

/// Point contents against a model placed somewhere in the world.
pub fn transformed_point_contents<T: CollisionTree + ?Sized>(
    tree: &T,
    p: &Vec3,
    headnode: i32,
    xform: &ModelTransform,
) -> i32 {
    let p_l = xform.point_to_local(p);
    point_contents(tree, &p_l, headnode)
}

// ============================================================
// ClipMap conveniences
// ============================================================

impl ClipMap {
    pub fn point_leafnum(&self, p: &Vec3) -> usize {
        point_leafnum(self, p, self.world_model().headnode)
    }

    pub fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, headnode: i32) -> (Vec<usize>, i32) {
        box_leafnums(self, mins, maxs, headnode, MAX_LEAF_LIST)
    }

    pub fn point_contents(&self, p: &Vec3, headnode: i32) -> i32 {
        point_contents(self, p, headnode)
    }

    pub fn transformed_point_contents(&self, p: &Vec3, headnode: i32, origin: &Vec3, angles: &Vec3) -> i32 {
        transformed_point_contents(self, p, headnode, &ModelTransform::new(origin, angles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm_load::fixtures::{cube_bsp, ground_bsp};
    use crate::q_shared::CONTENTS_SOLID;
    use rand::Rng;

    fn cube() -> ClipMap {
        ClipMap::from_bsp(&cube_bsp(), "cube").expect("load")
    }

    // ============================================================
    // Point classification
    // ============================================================

    #[test]
    fn point_inside_brush_is_solid() {
        let map = cube();
        assert_eq!(map.point_contents(&[0.0, 0.0, 0.0], 0), CONTENTS_SOLID);
        assert_eq!(map.point_contents(&[31.0, -31.0, 5.0], 0), CONTENTS_SOLID);
    }

    #[test]
    fn point_outside_all_brushes_is_empty() {
        let map = cube();
        assert_eq!(map.point_contents(&[100.0, 0.0, 0.0], 0), 0);
        assert_eq!(map.point_contents(&[0.0, 0.0, -33.0], 0), 0);
    }

    #[test]
    fn point_contents_of_brushless_leaf() {
        let map = ClipMap::from_bsp(&ground_bsp(), "ground").expect("load");
        assert_eq!(map.point_contents(&[0.0, 0.0, -1.0], 0), CONTENTS_SOLID);
        assert_eq!(map.point_contents(&[0.0, 0.0, 1.0], 0), 0);
    }

    #[test]
    fn transformed_point_contents_follows_origin() {
        let map = cube();
        let origin = [200.0, 0.0, 0.0];
        assert_eq!(map.transformed_point_contents(&[200.0, 0.0, 0.0], 0, &origin, &[0.0; 3]), CONTENTS_SOLID);
        assert_eq!(map.transformed_point_contents(&[0.0, 0.0, 0.0], 0, &origin, &[0.0; 3]), 0);
        // yawed 45 degrees, the cube's corner reaches past 32 units on x
        let rotated = map.transformed_point_contents(&[200.0 + 40.0, 0.0, 0.0], 0, &origin, &[0.0, 45.0, 0.0]);
        assert_eq!(rotated, CONTENTS_SOLID, "point at 40 units lies inside the rotated diagonal");
    }

    // ============================================================
    // Tree completeness
    // ============================================================

    #[test]
    fn every_point_reaches_exactly_one_leaf() {
        let map = cube();
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let p = [
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
            ];
            let leaf = map.point_leafnum(&p);
            assert!(leaf < map.leafs.len());
            let inside = p.iter().all(|c: &f32| c.abs() < 32.0);
            let outside = p.iter().any(|c: &f32| c.abs() > 32.0);
            if inside {
                assert_eq!(leaf, 1, "{:?} should be in the solid leaf", p);
            } else if outside {
                assert_eq!(leaf, 0, "{:?} should be in the empty leaf", p);
            }
        }
    }

    #[test]
    fn box_leafnums_finds_both_sides() {
        let map = cube();
        let (leafs, topnode) = map.box_leafnums(&[20.0, -8.0, -8.0], &[40.0, 8.0, 8.0], 0);
        assert!(leafs.contains(&0));
        assert!(leafs.contains(&1));
        assert_eq!(topnode, 0, "the +x face node splits the box first");

        let (leafs, topnode) = map.box_leafnums(&[-8.0; 3], &[8.0; 3], 0);
        assert_eq!(leafs, vec![1]);
        assert_eq!(topnode, -1);
    }

    #[test]
    #[should_panic(expected = "bad headnode")]
    fn bad_headnode_is_fatal() {
        let map = cube();
        map.point_contents(&[0.0; 3], 40);
    }
}
