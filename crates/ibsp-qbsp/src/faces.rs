// faces.rs — Drawable faces from portals, and merging coplanar ones

use std::collections::BTreeMap;

use log::{debug, info};
use rayon::prelude::*;

use ibsp_common::polylib::{Winding, MAX_POINTS_ON_WINDING};
use ibsp_common::q_shared::{
    cross_product, dot_product, vector_normalize, vector_subtract, Vec3, CONTENTS_SOLID, CONTENTS_WINDOW,
    LAST_VISIBLE_CONTENTS,
};

use crate::context::PlaneTable;
use crate::map::MapBrush;
use crate::portals::PortalId;
use crate::tree::{NodeId, Tree};

pub type FaceId = usize;

const EQUAL_EPSILON: f32 = 0.001;
const CONTINUOUS_EPSILON: f32 = 0.005;

#[derive(Debug, Clone, Default)]
pub struct Face {
    /// Plane the face lies on; odd when it faces the back of its node.
    pub plane_num: i32,
    pub texinfo: i32,
    /// Contents of the leaf the face is seen from.
    pub contents: i32,
    pub winding: Winding,
    pub on_node: NodeId,
    /// Set once this face has been absorbed into a larger one.
    pub merged: Option<FaceId>,
}

impl Face {
    pub fn is_active(&self) -> bool {
        self.merged.is_none() && self.winding.len() >= 3
    }
}

/// The strongest visible content bit: solid beats window beats lava and
/// so on down to mist. Zero if nothing visible.
pub fn visible_contents(contents: i32) -> i32 {
    let mut i = 1;
    while i <= LAST_VISIBLE_CONTENTS {
        if contents & i != 0 {
            return i;
        }
        i <<= 1;
    }
    0
}

// ============================================================
// Portal sides
// ============================================================

/// Find the brush side a portal's face should be textured from. Sides on
/// the portal's own plane win outright, otherwise the closest facing one.
fn find_portal_side(tree: &Tree, p: PortalId, map_brushes: &[MapBrush], planes: &PlaneTable) -> Option<(usize, usize)> {
    let portal = &tree.portals[p];

    // decide which content change is strongest
    let viscontents = visible_contents(tree.nodes[portal.nodes[0]].contents ^ tree.nodes[portal.nodes[1]].contents);
    if viscontents == 0 {
        return None;
    }

    let on_node = portal.on_node?;
    let planenum = tree.nodes[on_node].plane_num;
    let p1 = planes.get(planenum);
    let mut best: Option<(usize, usize)> = None;
    let mut bestdot = 0.0;

    for &n in &portal.nodes {
        for bb in &tree.nodes[n].brushes {
            let brush = &map_brushes[bb.original];
            if brush.contents & viscontents == 0 {
                continue;
            }
            for (i, side) in brush.sides.iter().enumerate() {
                if side.bevel || !side.visible {
                    continue;
                }
                if side.plane_num & !1 == planenum {
                    // exact match
                    return Some((bb.original, i));
                }
                // see how close the match is
                let p2 = planes.get(side.plane_num & !1);
                let dot = dot_product(&p1.normal, &p2.normal);
                if dot > bestdot {
                    bestdot = dot;
                    best = Some((bb.original, i));
                }
            }
        }
    }

    if best.is_none() {
        debug!("side not found for portal");
    }
    best
}

fn mark_visible_sides(tree: &mut Tree, map_brushes: &[MapBrush], planes: &PlaneTable) {
    for leaf in tree.leafs() {
        // empty leafs are never boundary leafs
        if tree.nodes[leaf].contents == 0 {
            continue;
        }
        for pi in 0..tree.nodes[leaf].portals.len() {
            let p = tree.nodes[leaf].portals[pi];
            if tree.portals[p].on_node.is_none() || tree.portals[p].side_found {
                continue; // edge of world
            }
            let side = find_portal_side(tree, p, map_brushes, planes);
            tree.portals[p].side_found = true;
            tree.portals[p].side = side;
        }
    }
}

fn face_from_portal(tree: &Tree, p: PortalId, pside: usize, map_brushes: &[MapBrush]) -> Option<Face> {
    let portal = &tree.portals[p];
    let (b, s) = portal.side?;
    let side = &map_brushes[b].sides[s];
    let on_node = portal.on_node?;

    let this = tree.nodes[portal.nodes[pside]].contents;
    let other = tree.nodes[portal.nodes[1 - pside]].contents;

    // don't show insides of windows
    if this & CONTENTS_WINDOW != 0 && visible_contents(this ^ other) == CONTENTS_WINDOW {
        return None;
    }

    let winding = if pside == 1 { portal.winding.reversed() } else { portal.winding.clone() };
    Some(Face {
        plane_num: tree.nodes[on_node].plane_num | pside as i32,
        texinfo: side.texinfo,
        contents: this,
        winding,
        on_node,
        merged: None,
    })
}

/// One face for every portal side that looks out of a non-solid leaf
/// across a visible content change.
pub fn make_faces(tree: &mut Tree, map_brushes: &[MapBrush], planes: &PlaneTable) -> Vec<Face> {
    mark_visible_sides(tree, map_brushes, planes);

    let mut faces = Vec::new();
    for leaf in tree.leafs() {
        if tree.nodes[leaf].contents & CONTENTS_SOLID != 0 {
            continue;
        }
        for pi in 0..tree.nodes[leaf].portals.len() {
            let p = tree.nodes[leaf].portals[pi];
            let s = tree.portals[p].side_of(leaf);
            if let Some(f) = face_from_portal(tree, p, s, map_brushes) {
                faces.push(f);
                tree.portals[p].face[s] = Some(faces.len() - 1);
            }
        }
    }

    info!("{:5} makefaces", faces.len());
    faces
}

/// Follow merges to the face that finally carries this one's area.
pub fn final_face(faces: &[Face], mut f: FaceId) -> FaceId {
    while let Some(next) = faces[f].merged {
        f = next;
    }
    f
}

/// Faces visible from a leaf, after merging, without repeats.
pub fn leaf_faces(tree: &Tree, leaf: NodeId, faces: &[Face]) -> Vec<FaceId> {
    let mut out = Vec::new();
    for &p in &tree.nodes[leaf].portals {
        let portal = &tree.portals[p];
        let Some(f) = portal.face[portal.side_of(leaf)] else {
            continue;
        };
        let f = final_face(faces, f);
        if faces[f].is_active() && !out.contains(&f) {
            out.push(f);
        }
    }
    out
}

// ============================================================
// Merging
// ============================================================

/// Join two convex windings that share an edge, if the result is still
/// convex. The windings must lie on the plane with the given normal.
pub fn try_merge_winding(f1: &Winding, f2: &Winding, planenormal: &Vec3) -> Option<Winding> {
    let n1 = f1.len();
    let n2 = f2.len();

    // find a common edge
    let mut found = None;
    'search: for i in 0..n1 {
        let p1 = &f1.p[i];
        let p2 = &f1.p[(i + 1) % n1];
        for j in 0..n2 {
            let p3 = &f2.p[j];
            let p4 = &f2.p[(j + 1) % n2];
            if (0..3).all(|k| (p1[k] - p4[k]).abs() <= EQUAL_EPSILON && (p2[k] - p3[k]).abs() <= EQUAL_EPSILON) {
                found = Some((i, j));
                break 'search;
            }
        }
    }
    let (i, j) = found?;
    let p1 = f1.p[i];
    let p2 = f1.p[(i + 1) % n1];

    // check slope of connected lines
    // if the slopes are colinear, the point can be removed
    let back = f1.p[(i + n1 - 1) % n1];
    let mut normal = cross_product(planenormal, &vector_subtract(&p1, &back));
    vector_normalize(&mut normal);
    let back = f2.p[(j + 2) % n2];
    let dot = dot_product(&vector_subtract(&back, &p1), &normal);
    if dot > CONTINUOUS_EPSILON {
        return None; // not a convex polygon
    }
    let keep1 = dot < -CONTINUOUS_EPSILON;

    let back = f1.p[(i + 2) % n1];
    let mut normal = cross_product(planenormal, &vector_subtract(&back, &p2));
    vector_normalize(&mut normal);
    let back = f2.p[(j + n2 - 1) % n2];
    let dot = dot_product(&vector_subtract(&back, &p2), &normal);
    if dot > CONTINUOUS_EPSILON {
        return None;
    }
    let keep2 = dot < -CONTINUOUS_EPSILON;

    // build the new polygon
    let mut p = Vec::with_capacity(n1 + n2);
    let mut k = (i + 1) % n1;
    while k != i {
        if !(k == (i + 1) % n1 && !keep2) {
            p.push(f1.p[k]);
        }
        k = (k + 1) % n1;
    }
    let mut l = (j + 1) % n2;
    while l != j {
        if !(l == (j + 1) % n2 && !keep1) {
            p.push(f2.p[l]);
        }
        l = (l + 1) % n2;
    }

    if p.len() > MAX_POINTS_ON_WINDING {
        return None;
    }
    Some(Winding::from_points(p))
}

/// Merge within one bucket. Returns (a, b, winding) steps in bucket-local
/// numbering, where indices past the input are earlier steps' results.
fn merge_bucket(windings: Vec<Winding>, normal: &Vec3) -> Vec<(usize, usize, Winding)> {
    let mut list: Vec<Option<Winding>> = windings.into_iter().map(Some).collect();
    let mut steps = Vec::new();

    let mut i = 0;
    while i < list.len() {
        for j in 0..i {
            let merged = match (&list[i], &list[j]) {
                (Some(w1), Some(w2)) => try_merge_winding(w1, w2, normal),
                _ => None,
            };
            if let Some(w) = merged {
                // add merged to the end so it will be checked against all
                // the faces again
                list[i] = None;
                list[j] = None;
                list.push(Some(w.clone()));
                steps.push((i, j, w));
                break;
            }
        }
        i += 1;
    }
    steps
}

/// Merge coplanar faces on the same node with the same texture and
/// contents. Buckets are independent, so they are merged in parallel and
/// the results applied in bucket order.
pub fn merge_faces(faces: &mut Vec<Face>, planes: &PlaneTable) -> usize {
    let mut buckets: BTreeMap<(NodeId, i32, i32, i32), Vec<FaceId>> = BTreeMap::new();
    for (id, f) in faces.iter().enumerate() {
        if f.is_active() {
            buckets.entry((f.on_node, f.plane_num, f.texinfo, f.contents)).or_default().push(id);
        }
    }
    let buckets: Vec<((NodeId, i32, i32, i32), Vec<FaceId>)> =
        buckets.into_iter().filter(|(_, ids)| ids.len() > 1).collect();

    let shared: &[Face] = &faces[..];
    let results: Vec<Vec<(usize, usize, Winding)>> = buckets
        .par_iter()
        .map(|((_, plane_num, _, _), ids)| {
            let windings = ids.iter().map(|&id| shared[id].winding.clone()).collect();
            merge_bucket(windings, &planes.get(*plane_num).normal)
        })
        .collect();

    let mut merged = 0;
    for ((_, ids), steps) in buckets.iter().zip(results) {
        let mut local: Vec<FaceId> = ids.clone();
        for (a, b, w) in steps {
            let (fa, fb) = (local[a], local[b]);
            let new_face = Face { winding: w, merged: None, ..faces[fa].clone() };
            faces.push(new_face);
            let id = faces.len() - 1;
            faces[fa].merged = Some(id);
            faces[fb].merged = Some(id);
            local.push(id);
            merged += 1;
        }
    }

    info!("{:5} mergefaces", merged);
    merged
}
