// portals.rs — Leaf adjacency: head portals, node portals and their splits

use log::{debug, warn};

use ibsp_common::polylib::{Winding, ON_EPSILON};
use ibsp_common::q_shared::{add_point_to_bounds, clear_bounds, vector_negate, Vec3};

use crate::context::PlaneTable;
use crate::faces::FaceId;
use crate::tree::{Node, NodeId, Tree};

pub type PortalId = usize;

/// Space left between the model bounds and the head portals so no leaf
/// ever has a null volume.
pub const SIDESPACE: f32 = 8.0;

const SPLIT_WINDING_EPSILON: f32 = 0.001;

#[derive(Debug, Clone, Default)]
pub struct Portal {
    pub normal: Vec3,
    pub dist: f32,
    /// Node whose plane the portal lies on, `None` for the head portals.
    pub on_node: Option<NodeId>,
    /// `nodes[0]` is on the front of the plane.
    pub nodes: [NodeId; 2],
    pub winding: Winding,
    pub side_found: bool,
    /// Map brush and side index the faces on this portal are textured from.
    pub side: Option<(usize, usize)>,
    pub face: [Option<FaceId>; 2],
}

impl Portal {
    /// Which of the two nodes `node` is.
    pub fn side_of(&self, node: NodeId) -> usize {
        if self.nodes[0] == node {
            0
        } else {
            1
        }
    }

    pub fn other(&self, node: NodeId) -> NodeId {
        self.nodes[1 - self.side_of(node)]
    }
}

fn add_portal_to_nodes(tree: &mut Tree, p: PortalId, front: NodeId, back: NodeId) {
    tree.portals[p].nodes = [front, back];
    tree.nodes[front].portals.push(p);
    tree.nodes[back].portals.push(p);
}

fn remove_portal_from_node(tree: &mut Tree, p: PortalId, node: NodeId) {
    let list = &mut tree.nodes[node].portals;
    match list.iter().position(|&x| x == p) {
        Some(i) => {
            list.remove(i);
        }
        None => warn!("RemovePortalFromNode: portal not in leaf"),
    }
}

/// The six portals boxing in the head node, all leading to the outside.
fn make_headnode_portals(tree: &mut Tree) {
    let outside = tree.alloc_node(Node::leaf(0));
    tree.outside_node = Some(outside);

    let mut bounds = [[0.0f32; 3]; 2];
    for i in 0..3 {
        bounds[0][i] = tree.mins[i] - SIDESPACE;
        bounds[1][i] = tree.maxs[i] + SIDESPACE;
    }

    let mut bplanes = [([0.0f32; 3], 0.0f32); 6];
    let mut ids = [0; 6];
    let head = tree.headnode;
    for i in 0..3 {
        for j in 0..2 {
            let n = j * 3 + i;
            let mut normal = [0.0; 3];
            let dist;
            if j == 1 {
                normal[i] = -1.0;
                dist = -bounds[j][i];
            } else {
                normal[i] = 1.0;
                dist = bounds[j][i];
            }
            bplanes[n] = (normal, dist);
            tree.portals.push(Portal {
                normal,
                dist,
                winding: Winding::base_for_plane(&normal, dist),
                ..Default::default()
            });
            ids[n] = tree.portals.len() - 1;
            add_portal_to_nodes(tree, ids[n], head, outside);
        }
    }

    // clip the basewindings by all the other planes
    for i in 0..6 {
        for (j, (normal, dist)) in bplanes.iter().enumerate() {
            if j == i {
                continue;
            }
            tree.portals[ids[i]].winding.chop_in_place(normal, *dist, ON_EPSILON);
        }
    }
}

/// Bounds of a node from the windings of the portals around it.
fn calc_node_bounds(tree: &mut Tree, node: NodeId) {
    let mut mins = [0.0; 3];
    let mut maxs = [0.0; 3];
    clear_bounds(&mut mins, &mut maxs);
    for &p in &tree.nodes[node].portals {
        for v in &tree.portals[p].winding.p {
            add_point_to_bounds(v, &mut mins, &mut maxs);
        }
    }
    tree.nodes[node].mins = mins;
    tree.nodes[node].maxs = maxs;
}

/// Create the portal on a node's plane, clipped to the node's region.
fn make_node_portal(tree: &mut Tree, node: NodeId, planes: &PlaneTable) -> bool {
    let plane = planes.get(tree.nodes[node].plane_num);
    let mut w = Winding::base_for_plane(&plane.normal, plane.dist);

    // clip the portal by all the other portals in the node
    for &p in &tree.nodes[node].portals {
        let portal = &tree.portals[p];
        let (normal, dist) = if portal.nodes[0] == node {
            (portal.normal, portal.dist)
        } else {
            (vector_negate(&portal.normal), -portal.dist)
        };
        if !w.chop_in_place(&normal, dist, ON_EPSILON) {
            return false;
        }
    }

    if w.is_tiny() {
        return false;
    }

    let [front, back] = tree.nodes[node].children;
    tree.portals.push(Portal {
        normal: plane.normal,
        dist: plane.dist,
        on_node: Some(node),
        winding: w,
        ..Default::default()
    });
    let id = tree.portals.len() - 1;
    add_portal_to_nodes(tree, id, front, back);
    true
}

/// Move or split the portals bounding a node onto its children.
fn split_node_portals(tree: &mut Tree, node: NodeId, planes: &PlaneTable) {
    let plane = planes.get(tree.nodes[node].plane_num);
    let [f, b] = tree.nodes[node].children;

    let list = std::mem::take(&mut tree.nodes[node].portals);
    for p in list {
        let side = tree.portals[p].side_of(node);
        let other = tree.portals[p].nodes[1 - side];
        let [n0, n1] = tree.portals[p].nodes;
        if n0 != node {
            remove_portal_from_node(tree, p, n0);
        }
        if n1 != node {
            remove_portal_from_node(tree, p, n1);
        }

        // cut the portal into two portals, one on each side of the cut plane
        let (front_w, back_w) = tree.portals[p].winding.clip_epsilon(&plane.normal, plane.dist, SPLIT_WINDING_EPSILON);
        let front_w = front_w.filter(|w| !w.is_tiny());
        let back_w = back_w.filter(|w| !w.is_tiny());

        let link = |tree: &mut Tree, p: PortalId, child: NodeId| {
            if side == 0 {
                add_portal_to_nodes(tree, p, child, other);
            } else {
                add_portal_to_nodes(tree, p, other, child);
            }
        };

        match (front_w, back_w) {
            (None, None) => {} // tiny windings on both sides
            (None, Some(_)) => link(tree, p, b),
            (Some(_), None) => link(tree, p, f),
            (Some(fw), Some(bw)) => {
                // the winding is split
                let mut new_portal = tree.portals[p].clone();
                new_portal.winding = bw;
                tree.portals[p].winding = fw;
                tree.portals.push(new_portal);
                let np = tree.portals.len() - 1;
                link(tree, p, f);
                link(tree, np, b);
            }
        }
    }
}

fn make_tree_portals_r(tree: &mut Tree, node: NodeId, planes: &PlaneTable, tiny: &mut usize) {
    calc_node_bounds(tree, node);
    let n = &tree.nodes[node];
    if n.mins[0] >= n.maxs[0] {
        warn!("node without a volume");
    }

    if n.is_leaf() {
        return;
    }

    if !make_node_portal(tree, node, planes) {
        *tiny += 1;
    }
    split_node_portals(tree, node, planes);

    let [front, back] = tree.nodes[node].children;
    make_tree_portals_r(tree, front, planes, tiny);
    make_tree_portals_r(tree, back, planes, tiny);
}

/// Build the portal graph for the whole tree. Afterwards every leaf's
/// `portals` lists exactly the windings it shares with its neighbours,
/// the outside node included.
pub fn make_tree_portals(tree: &mut Tree, planes: &PlaneTable) {
    make_headnode_portals(tree);
    let mut tiny = 0;
    let head = tree.headnode;
    make_tree_portals_r(tree, head, planes, &mut tiny);
    debug!("{:5} tiny portals", tiny);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::brush_from_bounds;
    use crate::tree::build_tree;
    use ibsp_common::q_shared::CONTENTS_SOLID;

    fn cube_tree(planes: &mut PlaneTable) -> Tree {
        let mut b = brush_from_bounds(&[-16.0; 3], &[16.0; 3], planes).unwrap();
        b.contents = CONTENTS_SOLID;
        for s in &mut b.sides {
            s.visible = true;
        }
        let volume = brush_from_bounds(&[-17.0; 3], &[17.0; 3], planes).unwrap();
        build_tree(vec![b], volume, planes, 0.125)
    }

    #[test]
    fn head_portals_box_the_model() {
        let planes = PlaneTable::default();
        let mut tree = Tree::single_leaf(0);
        tree.mins = [0.0; 3];
        tree.maxs = [16.0; 3];
        make_tree_portals(&mut tree, &planes);

        let outside = tree.outside_node.unwrap();
        assert_eq!(tree.nodes[outside].portals.len(), 6);
        assert_eq!(tree.nodes[tree.headnode].portals.len(), 6);
        for p in &tree.portals {
            assert_eq!(p.winding.len(), 4);
            assert!((p.winding.area() - 32.0 * 32.0).abs() < 1.0);
            assert_eq!(p.nodes, [tree.headnode, outside]);
        }
    }

    #[test]
    fn portals_link_exactly_two_nodes() {
        let mut planes = PlaneTable::default();
        let mut tree = cube_tree(&mut planes);
        make_tree_portals(&mut tree, &planes);

        for leaf in tree.leafs() {
            for &p in &tree.nodes[leaf].portals {
                let portal = &tree.portals[p];
                assert!(portal.nodes.contains(&leaf));
                let other = portal.other(leaf);
                assert!(tree.nodes[other].portals.contains(&p));
                assert!(tree.nodes[other].is_leaf());
                assert!(!portal.winding.is_degenerate());
            }
        }
    }

    #[test]
    fn solid_cube_leaf_has_six_faces_worth_of_portals() {
        let mut planes = PlaneTable::default();
        let mut tree = cube_tree(&mut planes);
        make_tree_portals(&mut tree, &planes);

        let inner = tree.leaf_for_point(&[0.0; 3], &planes);
        assert_eq!(tree.nodes[inner].contents, CONTENTS_SOLID);
        let portals = &tree.nodes[inner].portals;
        assert_eq!(portals.len(), 6);
        let area: f32 = portals.iter().map(|&p| tree.portals[p].winding.area()).sum();
        assert!((area - 6.0 * 32.0 * 32.0).abs() < 1.0);

        // leaf bounds come from the portals
        let n = &tree.nodes[inner];
        for i in 0..3 {
            assert!((n.mins[i] + 16.0).abs() < 0.01);
            assert!((n.maxs[i] - 16.0).abs() < 0.01);
        }
    }

    #[test]
    fn empty_leafs_reach_the_outside() {
        let mut planes = PlaneTable::default();
        let mut tree = cube_tree(&mut planes);
        make_tree_portals(&mut tree, &planes);
        let outside = tree.outside_node.unwrap();

        let empty: Vec<_> = tree.leafs().into_iter().filter(|&l| tree.nodes[l].contents == 0).collect();
        assert_eq!(empty.len(), 6);
        for l in empty {
            assert!(tree.nodes[l].portals.iter().any(|&p| tree.portals[p].other(l) == outside));
        }
    }
}
