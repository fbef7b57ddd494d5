// tree.rs — Brush BSP: split selection, recursive partition, the node arena

use log::debug;

use ibsp_common::q_shared::{add_point_to_bounds, clear_bounds, dot_product, Vec3};

use crate::brush::{BspBrush, PSIDE_BACK, PSIDE_BOTH, PSIDE_FACING, PSIDE_FRONT};
use crate::context::PlaneTable;
use crate::portals::{Portal, PortalId};

pub type NodeId = usize;

pub const PLANENUM_LEAF: i32 = -1;

#[derive(Debug, Clone)]
pub struct Node {
    /// Even plane of the split, or PLANENUM_LEAF.
    pub plane_num: i32,
    pub parent: Option<NodeId>,
    pub children: [NodeId; 2],
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Convex region of the node, only needed while building.
    pub volume: Option<BspBrush>,
    pub detail_separator: bool,

    // leafs only
    pub contents: i32,
    pub brushes: Vec<BspBrush>,
    pub portals: Vec<PortalId>,
    /// Flood distance from the nearest entity, 0 when never reached.
    pub occupied: u32,
    pub occupant: Option<usize>,
    pub cluster: i32,
    pub area: i32,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            plane_num: PLANENUM_LEAF,
            parent: None,
            children: [0; 2],
            mins: [0.0; 3],
            maxs: [0.0; 3],
            volume: None,
            detail_separator: false,
            contents: 0,
            brushes: Vec::new(),
            portals: Vec::new(),
            occupied: 0,
            occupant: None,
            cluster: -1,
            area: 0,
        }
    }
}

impl Node {
    pub fn leaf(contents: i32) -> Self {
        Node { contents, ..Default::default() }
    }

    pub fn is_leaf(&self) -> bool {
        self.plane_num == PLANENUM_LEAF
    }
}

/// Node arena for one model. `headnode` is the root; `outside_node` exists
/// once portals have been built and stands for everything beyond the
/// model bounds.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    pub nodes: Vec<Node>,
    pub portals: Vec<Portal>,
    pub headnode: NodeId,
    pub outside_node: Option<NodeId>,
    pub mins: Vec3,
    pub maxs: Vec3,
}

impl Tree {
    pub fn single_leaf(contents: i32) -> Self {
        Tree { nodes: vec![Node::leaf(contents)], ..Default::default() }
    }

    pub fn alloc_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn leaf_for_point(&self, p: &Vec3, planes: &PlaneTable) -> NodeId {
        let mut n = self.headnode;
        while !self.nodes[n].is_leaf() {
            let plane = planes.get(self.nodes[n].plane_num);
            let d = dot_product(p, &plane.normal) - plane.dist;
            n = self.nodes[n].children[if d >= 0.0 { 0 } else { 1 }];
        }
        n
    }

    /// Every leaf under the head node, front children first.
    pub fn leafs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.headnode];
        while let Some(n) = stack.pop() {
            if self.nodes[n].is_leaf() {
                out.push(n);
            } else {
                stack.push(self.nodes[n].children[1]);
                stack.push(self.nodes[n].children[0]);
            }
        }
        out
    }

    /// Append another tree's nodes and return the new index of its head.
    pub fn graft(&mut self, mut sub: Tree, parent: Option<NodeId>) -> NodeId {
        let offset = self.nodes.len();
        for n in &mut sub.nodes {
            if !n.is_leaf() {
                n.children[0] += offset;
                n.children[1] += offset;
            }
            n.parent = n.parent.map(|p| p + offset);
        }
        sub.nodes[sub.headnode].parent = parent;
        self.nodes.extend(sub.nodes);
        sub.headnode + offset
    }
}

// ============================================================
// Split selection
// ============================================================

fn check_plane_against_volume(tree: &Tree, node: NodeId, plane_num: i32, planes: &PlaneTable, microvolume: f32) -> bool {
    match &tree.nodes[node].volume {
        Some(v) => {
            let (front, back) = v.split(plane_num, planes, microvolume);
            front.is_some() && back.is_some()
        }
        None => false,
    }
}

/// Pick the brush side whose plane best divides the brush list. Visible
/// structural sides are tried first, then visible detail, then the
/// invisible ones; the first pass that finds anything wins. On success
/// every brush's `side` holds its classification against the plane.
fn select_split_side(
    tree: &Tree,
    node: NodeId,
    brushes: &mut [BspBrush],
    planes: &PlaneTable,
    microvolume: f32,
) -> Option<(i32, bool)> {
    let mut best: Option<i32> = None;
    let mut best_value = -99999;
    let mut best_sides: Vec<i32> = Vec::new();
    let mut detail = false;

    for pass in 0..4 {
        for bi in 0..brushes.len() {
            if (pass & 1 != 0) != brushes[bi].is_detail() {
                continue;
            }
            for si in 0..brushes[bi].sides.len() {
                let (pnum, side_hint) = {
                    let side = &brushes[bi].sides[si];
                    if side.bevel || side.winding.is_none() || side.on_node || side.tested {
                        continue;
                    }
                    if side.visible != (pass < 2) {
                        continue;
                    }
                    (side.plane_num & !1, side.is_hint())
                };

                if !check_plane_against_volume(tree, node, pnum, planes, microvolume) {
                    continue; // would produce a tiny volume
                }

                let (mut front, mut back, mut facing, mut splits) = (0i32, 0i32, 0i32, 0i32);
                let mut epsilon_brush = 0;
                let mut hint_split = false;
                let mut test_sides = Vec::with_capacity(brushes.len());
                for test in brushes.iter_mut() {
                    let mut bsplits = 0;
                    let mut bhint = false;
                    let s = test.test_to_plane_num(pnum, planes, &mut bsplits, &mut bhint, &mut epsilon_brush);
                    splits += bsplits;
                    hint_split |= bhint;
                    test.test_side = s;
                    test_sides.push(s);

                    // if the brush shares this face, don't bother testing
                    // that facenum as a splitter again
                    if s & PSIDE_FACING != 0 {
                        facing += 1;
                        for ts in &mut test.sides {
                            if ts.plane_num & !1 == pnum {
                                ts.tested = true;
                            }
                        }
                    }
                    if s & PSIDE_FRONT != 0 {
                        front += 1;
                    }
                    if s & PSIDE_BACK != 0 {
                        back += 1;
                    }
                }

                // give a value estimate for using this plane
                let mut value = 5 * facing - 5 * splits - (front - back).abs();
                if planes.get(pnum).plane_type < 3 {
                    value += 5; // axial is better
                }
                value -= epsilon_brush * 1000; // avoid!

                // never split a hint side except with another hint
                if hint_split && !side_hint {
                    value = -9999999;
                }

                if value > best_value {
                    best_value = value;
                    best = Some(pnum);
                    best_sides = test_sides;
                }
            }
        }

        // if we found a good plane, don't bother trying any other passes
        if best.is_some() {
            detail = pass & 1 != 0;
            break;
        }
    }

    for b in brushes.iter_mut() {
        for s in &mut b.sides {
            s.tested = false;
        }
    }

    let plane_num = best?;
    for (b, s) in brushes.iter_mut().zip(best_sides) {
        b.side = s;
    }
    Some((plane_num, detail))
}

fn split_brush_list(
    brushes: Vec<BspBrush>,
    plane_num: i32,
    planes: &PlaneTable,
    microvolume: f32,
) -> (Vec<BspBrush>, Vec<BspBrush>) {
    let mut front = Vec::new();
    let mut back = Vec::new();

    for mut b in brushes {
        let sides = b.side;
        if sides == PSIDE_BOTH {
            // split into two brushes
            let (f, bk) = b.split(plane_num, planes, microvolume);
            front.extend(f);
            back.extend(bk);
            continue;
        }

        // if the plane is actually a part of the brush, flag it as used so
        // it won't be tried as a splitter again
        if sides & PSIDE_FACING != 0 {
            for s in &mut b.sides {
                if s.plane_num & !1 == plane_num {
                    s.on_node = true;
                }
            }
        }

        match (sides & PSIDE_FRONT != 0, sides & PSIDE_BACK != 0) {
            (true, true) => {
                back.push(b.clone());
                front.push(b);
            }
            (true, false) => front.push(b),
            (false, true) => back.push(b),
            (false, false) => {}
        }
    }
    (front, back)
}

// ============================================================
// Build
// ============================================================

#[derive(Debug, Default)]
struct BuildCounts {
    visible_nodes: usize,
    nonvis_nodes: usize,
    leafs: usize,
}

fn leaf_node(tree: &mut Tree, node: NodeId, brushes: Vec<BspBrush>, counts: &mut BuildCounts) {
    let n = &mut tree.nodes[node];
    n.plane_num = PLANENUM_LEAF;
    n.contents = brushes.iter().fold(0, |c, b| c | b.contents);
    n.brushes = brushes;
    n.volume = None;
    counts.leafs += 1;
}

fn build_tree_r(
    tree: &mut Tree,
    node: NodeId,
    mut brushes: Vec<BspBrush>,
    planes: &PlaneTable,
    microvolume: f32,
    counts: &mut BuildCounts,
) {
    // find the best plane to use as a splitter
    let Some((plane_num, detail)) = select_split_side(tree, node, &mut brushes, planes, microvolume) else {
        leaf_node(tree, node, brushes, counts);
        return;
    };

    if detail {
        counts.nonvis_nodes += 1;
    } else {
        counts.visible_nodes += 1;
    }

    let (front_list, back_list) = split_brush_list(brushes, plane_num, planes, microvolume);

    let volume = tree.nodes[node].volume.take();
    let (front_vol, back_vol) = match &volume {
        Some(v) => v.split(plane_num, planes, microvolume),
        None => (None, None),
    };

    let (pmins, pmaxs) = (tree.nodes[node].mins, tree.nodes[node].maxs);
    let mut children = [0; 2];
    for (i, vol) in [front_vol, back_vol].into_iter().enumerate() {
        let (mins, maxs) = match &vol {
            Some(v) => (v.mins, v.maxs),
            None => (pmins, pmaxs),
        };
        children[i] = tree.alloc_node(Node { parent: Some(node), volume: vol, mins, maxs, ..Default::default() });
    }

    let n = &mut tree.nodes[node];
    n.plane_num = plane_num;
    n.detail_separator = detail;
    n.children = children;

    build_tree_r(tree, children[0], front_list, planes, microvolume, counts);
    build_tree_r(tree, children[1], back_list, planes, microvolume, counts);
}

/// Partition a brush list into a tree whose root region is `volume`.
/// Every plane the brushes and the volume use must already be in `planes`.
pub fn build_tree(brushes: Vec<BspBrush>, volume: BspBrush, planes: &PlaneTable, microvolume: f32) -> Tree {
    let mut tree = Tree::default();
    clear_bounds(&mut tree.mins, &mut tree.maxs);
    for b in &brushes {
        add_point_to_bounds(&b.mins, &mut tree.mins, &mut tree.maxs);
        add_point_to_bounds(&b.maxs, &mut tree.mins, &mut tree.maxs);
    }

    let (mins, maxs) = (volume.mins, volume.maxs);
    tree.headnode = tree.alloc_node(Node { volume: Some(volume), mins, maxs, ..Default::default() });

    let mut counts = BuildCounts::default();
    let headnode = tree.headnode;
    build_tree_r(&mut tree, headnode, brushes, planes, microvolume, &mut counts);

    debug!(
        "{:5} visible nodes, {:5} nonvis nodes, {:5} leafs",
        counts.visible_nodes, counts.nonvis_nodes, counts.leafs
    );
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::{brush_from_bounds, TEXINFO_NODE};
    use ibsp_common::q_shared::{CONTENTS_DETAIL, CONTENTS_SOLID, CONTENTS_WATER};
    use rand::Rng;

    fn solid_box(planes: &mut PlaneTable, mins: Vec3, maxs: Vec3, contents: i32, original: usize) -> BspBrush {
        let mut b = brush_from_bounds(&mins, &maxs, planes).unwrap();
        b.contents = contents;
        b.original = original;
        for s in &mut b.sides {
            s.visible = true;
            s.texinfo = 0;
        }
        b
    }

    fn build(planes: &mut PlaneTable, brushes: Vec<BspBrush>, lo: f32, hi: f32) -> Tree {
        let volume = brush_from_bounds(&[lo; 3], &[hi; 3], planes).unwrap();
        build_tree(brushes, volume, planes, 0.125)
    }

    fn inside(b: &BspBrush, p: &Vec3) -> bool {
        (0..3).all(|i| p[i] > b.mins[i] && p[i] < b.maxs[i])
    }

    // ============================================================
    // Single brush
    // ============================================================

    #[test]
    fn one_brush_splits_into_solid_and_empty() {
        let mut planes = PlaneTable::default();
        let b = solid_box(&mut planes, [-16.0; 3], [16.0; 3], CONTENTS_SOLID, 0);
        let tree = build(&mut planes, vec![b], -64.0, 64.0);

        // six splits, seven leafs
        assert_eq!(tree.leafs().len(), 7);
        let inner = tree.leaf_for_point(&[0.0; 3], &planes);
        assert_eq!(tree.nodes[inner].contents, CONTENTS_SOLID);
        assert_eq!(tree.nodes[inner].brushes.len(), 1);
        let outer = tree.leaf_for_point(&[40.0, 0.0, 0.0], &planes);
        assert_eq!(tree.nodes[outer].contents, 0);
        assert!(tree.nodes[outer].brushes.is_empty());

        assert_eq!(tree.mins, [-16.0; 3]);
        assert_eq!(tree.maxs, [16.0; 3]);
    }

    #[test]
    fn node_planes_are_even_and_children_linked() {
        let mut planes = PlaneTable::default();
        let b = solid_box(&mut planes, [0.0; 3], [8.0, 24.0, 40.0], CONTENTS_SOLID, 0);
        let tree = build(&mut planes, vec![b], -64.0, 64.0);
        for (i, n) in tree.nodes.iter().enumerate() {
            if n.is_leaf() {
                continue;
            }
            assert_eq!(n.plane_num & 1, 0);
            for c in n.children {
                assert_eq!(tree.nodes[c].parent, Some(i));
            }
        }
        assert_eq!(tree.nodes[tree.headnode].parent, None);
    }

    #[test]
    fn empty_list_is_one_empty_leaf() {
        let mut planes = PlaneTable::default();
        let tree = build(&mut planes, Vec::new(), -8.0, 8.0);
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes[tree.headnode].is_leaf());
        assert_eq!(tree.nodes[tree.headnode].contents, 0);
    }

    // ============================================================
    // Detail and overlap
    // ============================================================

    #[test]
    fn structural_planes_split_before_detail() {
        let mut planes = PlaneTable::default();
        let wall = solid_box(&mut planes, [-64.0, -64.0, -8.0], [64.0, 64.0, 0.0], CONTENTS_SOLID, 0);
        let crate_ = solid_box(&mut planes, [0.0, 0.0, 0.0], [16.0, 16.0, 16.0], CONTENTS_SOLID | CONTENTS_DETAIL, 1);
        let tree = build(&mut planes, vec![wall, crate_], -128.0, 128.0);

        // every structural node sits above every detail node
        for n in &tree.nodes {
            if n.is_leaf() || n.detail_separator {
                continue;
            }
            let mut p = n.parent;
            while let Some(i) = p {
                assert!(!tree.nodes[i].detail_separator);
                p = tree.nodes[i].parent;
            }
        }
        assert!(tree.nodes.iter().any(|n| n.detail_separator));
    }

    #[test]
    fn overlapping_contents_are_ored() {
        let mut planes = PlaneTable::default();
        let a = solid_box(&mut planes, [0.0; 3], [32.0; 3], CONTENTS_WATER, 0);
        let b = solid_box(&mut planes, [16.0; 3], [48.0; 3], CONTENTS_SOLID, 1);
        let tree = build(&mut planes, vec![a, b], -64.0, 128.0);
        let both = tree.leaf_for_point(&[24.0; 3], &planes);
        assert_eq!(tree.nodes[both].contents, CONTENTS_WATER | CONTENTS_SOLID);
        let water = tree.leaf_for_point(&[8.0; 3], &planes);
        assert_eq!(tree.nodes[water].contents, CONTENTS_WATER);
    }

    #[test]
    fn split_sides_are_never_reused() {
        let mut planes = PlaneTable::default();
        let a = solid_box(&mut planes, [0.0; 3], [32.0; 3], CONTENTS_SOLID, 0);
        let tree = build(&mut planes, vec![a], -64.0, 64.0);
        let mut used = Vec::new();
        let mut n = tree.headnode;
        // walk down to the solid leaf and collect the planes on the way
        let p = [16.0; 3];
        while !tree.nodes[n].is_leaf() {
            assert!(!used.contains(&tree.nodes[n].plane_num));
            used.push(tree.nodes[n].plane_num);
            let pl = planes.get(tree.nodes[n].plane_num);
            n = tree.nodes[n].children[if dot_product(&p, &pl.normal) - pl.dist >= 0.0 { 0 } else { 1 }];
        }
        assert_eq!(used.len(), 6);
        assert!(tree.nodes[n].brushes[0].sides.iter().all(|s| s.on_node || s.texinfo == TEXINFO_NODE));
    }

    // ============================================================
    // Completeness
    // ============================================================

    #[test]
    fn random_points_land_in_correctly_classified_leafs() {
        let mut planes = PlaneTable::default();
        let brushes = vec![
            solid_box(&mut planes, [-64.0, -64.0, -16.0], [64.0, 64.0, 0.0], CONTENTS_SOLID, 0),
            solid_box(&mut planes, [-64.0, -64.0, 0.0], [-48.0, 64.0, 64.0], CONTENTS_SOLID, 1),
            solid_box(&mut planes, [8.0, 8.0, 0.0], [24.0, 40.0, 12.0], CONTENTS_WATER, 2),
        ];
        let copies = brushes.clone();
        let tree = build(&mut planes, brushes, -128.0, 128.0);

        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let p: Vec3 = [rng.gen_range(-100.0..100.0), rng.gen_range(-100.0..100.0), rng.gen_range(-100.0..100.0)];
            let expected = copies.iter().filter(|b| inside(b, &p)).fold(0, |c, b| c | b.contents);
            let on_face = copies.iter().any(|b| (0..3).any(|i| (p[i] - b.mins[i]).abs() < 0.01 || (p[i] - b.maxs[i]).abs() < 0.01));
            if on_face {
                continue;
            }
            let leaf = tree.leaf_for_point(&p, &planes);
            assert!(tree.nodes[leaf].is_leaf());
            assert_eq!(tree.nodes[leaf].contents, expected, "point {:?}", p);
        }
    }

    #[test]
    fn graft_offsets_indices() {
        let mut planes = PlaneTable::default();
        let b = solid_box(&mut planes, [0.0; 3], [8.0; 3], CONTENTS_SOLID, 0);
        let sub = build(&mut planes, vec![b], -16.0, 16.0);
        let sub_len = sub.nodes.len();

        let mut tree = Tree::single_leaf(0);
        let head = tree.graft(sub, Some(0));
        assert_eq!(head, 1);
        assert_eq!(tree.nodes.len(), 1 + sub_len);
        assert_eq!(tree.nodes[head].parent, Some(0));
        for n in &tree.nodes[1..] {
            if !n.is_leaf() {
                assert!(n.children.iter().all(|&c| c >= 1 && c < tree.nodes.len()));
            }
        }
    }
}
