// tjunc.rs — Splice coplanar vertices into the edges of neighbouring faces

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use ibsp_common::polylib::{Winding, MAX_POINTS_ON_WINDING};
use ibsp_common::q_shared::{dot_product, vector_length, vector_ma, vector_normalize, vector_subtract, Vec3};

use crate::faces::Face;

/// Largest distance off an edge for a vertex to count as lying on it.
const OFF_EPSILON: f32 = 0.1;
/// Vertices this close to an edge's ends are the ends themselves.
const END_EPSILON: f32 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TjuncStats {
    pub faces_fixed: usize,
    pub points_added: usize,
    pub faces_skipped: usize,
}

fn weld_key(p: &Vec3) -> [i64; 3] {
    [(p[0] * 8.0).round() as i64, (p[1] * 8.0).round() as i64, (p[2] * 8.0).round() as i64]
}

/// Distinct vertices of the active faces, bucketed by plane pair.
fn collect_candidates(faces: &[Face]) -> HashMap<i32, Vec<Vec3>> {
    let mut seen: HashMap<i32, HashSet<[i64; 3]>> = HashMap::new();
    let mut buckets: HashMap<i32, Vec<Vec3>> = HashMap::new();
    for f in faces.iter().filter(|f| f.is_active()) {
        let key = f.plane_num & !1;
        let seen = seen.entry(key).or_default();
        let list = buckets.entry(key).or_default();
        for p in &f.winding.p {
            if seen.insert(weld_key(p)) {
                list.push(*p);
            }
        }
    }
    buckets
}

/// The winding with every candidate that lies strictly inside one of its
/// edges spliced in, in order along the edge.
fn splice_winding(w: &Winding, candidates: &[Vec3]) -> Vec<Vec3> {
    let n = w.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let p1 = w.p[i];
        let p2 = w.p[(i + 1) % n];
        out.push(p1);

        let mut dir = vector_subtract(&p2, &p1);
        let len = vector_normalize(&mut dir);
        if len <= 2.0 * END_EPSILON {
            continue;
        }

        let mut on_edge: Vec<(f32, Vec3)> = Vec::new();
        for c in candidates {
            let t = dot_product(&vector_subtract(c, &p1), &dir);
            if t <= END_EPSILON || t >= len - END_EPSILON {
                continue;
            }
            let off = vector_subtract(c, &vector_ma(&p1, t, &dir));
            if vector_length(&off) > OFF_EPSILON {
                continue;
            }
            on_edge.push((t, *c));
        }
        on_edge.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut last_t = 0.0;
        for (t, c) in on_edge {
            if t - last_t < END_EPSILON {
                continue;
            }
            out.push(c);
            last_t = t;
        }
    }
    out
}

/// Remove T-junctions between coplanar faces. Candidate vertices are
/// gathered up front and only read while the faces are fixed in parallel,
/// so running this twice changes nothing the second time.
pub fn fix_tjunctions(faces: &mut [Face]) -> TjuncStats {
    let candidates = collect_candidates(faces);

    let points_added = AtomicUsize::new(0);
    let stats = Mutex::new(TjuncStats::default());
    let skipped = SegQueue::new();

    faces.par_iter_mut().enumerate().for_each(|(i, f)| {
        if !f.is_active() {
            return;
        }
        let Some(list) = candidates.get(&(f.plane_num & !1)) else {
            return;
        };
        let spliced = splice_winding(&f.winding, list);
        let added = spliced.len() - f.winding.len();
        if added == 0 {
            return;
        }
        if spliced.len() > MAX_POINTS_ON_WINDING {
            skipped.push((i, spliced.len()));
            stats.lock().faces_skipped += 1;
            return;
        }
        f.winding = Winding::from_points(spliced);
        points_added.fetch_add(added, Ordering::Relaxed);
        stats.lock().faces_fixed += 1;
    });

    while let Some((i, n)) = skipped.pop() {
        warn!("face {} would have {} points after tjunction fix, left alone", i, n);
    }

    let mut stats = stats.into_inner();
    stats.points_added = points_added.into_inner();
    info!("{:5} faces fixed", stats.faces_fixed);
    info!("{:5} tjunction points", stats.points_added);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(x0: f32, y0: f32, x1: f32, y1: f32) -> Face {
        Face {
            plane_num: 4,
            winding: Winding::from_points(vec![[x0, y0, 0.0], [x0, y1, 0.0], [x1, y1, 0.0], [x1, y0, 0.0]]),
            ..Default::default()
        }
    }

    #[test]
    fn vertex_inside_an_edge_is_spliced() {
        // one wide face below two narrow ones
        let mut faces = vec![quad(0.0, 0.0, 2.0, 1.0), quad(0.0, 1.0, 1.0, 2.0), quad(1.0, 1.0, 2.0, 2.0)];
        let stats = fix_tjunctions(&mut faces);
        assert_eq!(stats.faces_fixed, 1);
        assert_eq!(stats.points_added, 1);
        assert_eq!(faces[0].winding.p, vec![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0], [2.0, 1.0, 0.0], [2.0, 0.0, 0.0]]);
        assert_eq!(faces[1].winding.len(), 4);
        assert_eq!(faces[2].winding.len(), 4);
    }

    #[test]
    fn second_pass_changes_nothing() {
        let mut faces = vec![
            quad(0.0, 0.0, 4.0, 1.0),
            quad(0.0, 1.0, 1.0, 2.0),
            quad(1.0, 1.0, 3.0, 2.0),
            quad(3.0, 1.0, 4.0, 2.0),
            quad(-2.0, 0.0, 0.0, 2.0),
        ];
        fix_tjunctions(&mut faces);
        let once: Vec<Winding> = faces.iter().map(|f| f.winding.clone()).collect();
        let stats = fix_tjunctions(&mut faces);
        assert_eq!(stats, TjuncStats::default());
        let twice: Vec<Winding> = faces.iter().map(|f| f.winding.clone()).collect();
        assert_eq!(once, twice);
        // the left face picked up the corner at (0,1)
        assert_eq!(faces[4].winding.len(), 5);
    }

    #[test]
    fn other_planes_and_merged_faces_are_ignored() {
        let mut other = quad(0.0, 1.0, 1.0, 2.0);
        other.plane_num = 8;
        let mut merged = quad(1.0, 1.0, 2.0, 2.0);
        merged.merged = Some(0);
        let mut faces = vec![quad(0.0, 0.0, 2.0, 1.0), other, merged];
        let stats = fix_tjunctions(&mut faces);
        assert_eq!(stats.points_added, 0);
        assert_eq!(faces[0].winding.len(), 4);
    }

    #[test]
    fn opposite_sides_of_a_plane_share_candidates() {
        let mut back = quad(0.0, 1.0, 1.0, 2.0);
        back.plane_num = 5;
        let mut faces = vec![quad(0.0, 0.0, 2.0, 1.0), back];
        fix_tjunctions(&mut faces);
        assert_eq!(faces[0].winding.len(), 5);
    }

    #[test]
    fn near_endpoint_candidates_are_not_spliced() {
        let w = Winding::from_points(vec![[0.0, 0.0, 0.0], [0.0, 10.0, 0.0], [10.0, 10.0, 0.0], [10.0, 0.0, 0.0]]);
        let out = splice_winding(&w, &[[0.05, 10.0, 0.0], [5.0, 10.3, 0.0], [5.0, 10.05, 0.0]]);
        assert_eq!(out.len(), 5);
        assert_eq!(out[2], [5.0, 10.05, 0.0]);
    }
}
