// polylib.rs — Convex polygon (winding) utilities
//
// Windings are built by chopping a huge quad lying on a plane with the other
// half-spaces of a brush, and are the currency of the compiler: brush sides,
// portals and faces are all windings.

use log::warn;

use crate::q_shared::{
    add_point_to_bounds, clear_bounds, cross_product, dot_product, vector_add, vector_length,
    vector_ma, vector_normalize, vector_scale, vector_subtract, Vec3,
};

pub const MAX_POINTS_ON_WINDING: usize = 64;

// you can define on_epsilon in the makefile as tighter
pub const ON_EPSILON: f32 = 0.1;
pub const CLIP_EPSILON: f32 = 0.1;

pub const MAX_MAP_BOUNDS: f32 = 65535.0;

/// Windings smaller than this are considered noise and discarded.
pub const MIN_WINDING_AREA: f32 = 0.1;
const EDGE_LENGTH: f32 = 0.2;

pub const SIDE_FRONT: usize = 0;
pub const SIDE_BACK: usize = 1;
pub const SIDE_ON: usize = 2;
pub const SIDE_CROSS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Winding {
    pub p: Vec<Vec3>,
}

impl Winding {
    pub fn from_points(p: Vec<Vec3>) -> Self {
        Winding { p }
    }

    pub fn len(&self) -> usize {
        self.p.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p.is_empty()
    }

    /// A square of MAX_MAP_BOUNDS half-size lying on the plane, wound
    /// clockwise when viewed from the front.
    pub fn base_for_plane(normal: &Vec3, dist: f32) -> Self {
        // find the major axis
        let mut max = -MAX_MAP_BOUNDS;
        let mut x = usize::MAX;
        for (i, n) in normal.iter().enumerate() {
            let v = n.abs();
            if v > max {
                x = i;
                max = v;
            }
        }

        let mut vup = [0.0f32; 3];
        match x {
            0 | 1 => vup[2] = 1.0,
            _ => vup[0] = 1.0,
        }

        let v = dot_product(&vup, normal);
        let mut vup = vector_ma(&vup, -v, normal);
        vector_normalize(&mut vup);

        let org = vector_scale(normal, dist);
        let vright = vector_scale(&cross_product(&vup, normal), MAX_MAP_BOUNDS);
        let vup = vector_scale(&vup, MAX_MAP_BOUNDS);

        // project a really big axis aligned box onto the plane
        Winding {
            p: vec![
                vector_add(&vector_subtract(&org, &vright), &vup),
                vector_add(&vector_add(&org, &vright), &vup),
                vector_subtract(&vector_add(&org, &vright), &vup),
                vector_subtract(&vector_subtract(&org, &vright), &vup),
            ],
        }
    }

    pub fn area(&self) -> f32 {
        let mut total = 0.0;
        for i in 2..self.p.len() {
            let d1 = vector_subtract(&self.p[i - 1], &self.p[0]);
            let d2 = vector_subtract(&self.p[i], &self.p[0]);
            total += 0.5 * vector_length(&cross_product(&d1, &d2));
        }
        total
    }

    pub fn bounds(&self) -> (Vec3, Vec3) {
        let mut mins = [0.0; 3];
        let mut maxs = [0.0; 3];
        clear_bounds(&mut mins, &mut maxs);
        for p in &self.p {
            add_point_to_bounds(p, &mut mins, &mut maxs);
        }
        (mins, maxs)
    }

    pub fn center(&self) -> Vec3 {
        let mut center = [0.0f32; 3];
        for p in &self.p {
            center = vector_add(&center, p);
        }
        vector_scale(&center, 1.0 / self.p.len().max(1) as f32)
    }

    /// Plane the winding lies on, derived from its first three points.
    pub fn plane(&self) -> (Vec3, f32) {
        let v1 = vector_subtract(&self.p[1], &self.p[0]);
        let v2 = vector_subtract(&self.p[2], &self.p[0]);
        let mut normal = cross_product(&v2, &v1);
        vector_normalize(&mut normal);
        let dist = dot_product(&self.p[0], &normal);
        (normal, dist)
    }

    pub fn reversed(&self) -> Self {
        Winding { p: self.p.iter().rev().copied().collect() }
    }

    fn classify(&self, normal: &Vec3, dist: f32, epsilon: f32) -> (Vec<f32>, Vec<usize>, [usize; 3]) {
        let n = self.p.len();
        let mut dists = Vec::with_capacity(n + 1);
        let mut sides = Vec::with_capacity(n + 1);
        let mut counts = [0usize; 3];

        // determine sides for each point
        for p in &self.p {
            let d = dot_product(p, normal) - dist;
            let side = if d > epsilon {
                SIDE_FRONT
            } else if d < -epsilon {
                SIDE_BACK
            } else {
                SIDE_ON
            };
            dists.push(d);
            sides.push(side);
            counts[side] += 1;
        }
        if n > 0 {
            sides.push(sides[0]);
            dists.push(dists[0]);
        }
        (dists, sides, counts)
    }

    fn split_point(&self, i: usize, normal: &Vec3, dist: f32, dists: &[f32]) -> Vec3 {
        let p1 = &self.p[i];
        let p2 = &self.p[(i + 1) % self.p.len()];
        let dot = dists[i] / (dists[i] - dists[i + 1]);
        let mut mid = [0.0f32; 3];
        for j in 0..3 {
            // avoid round off error when possible
            mid[j] = if normal[j] == 1.0 {
                dist
            } else if normal[j] == -1.0 {
                -dist
            } else {
                p1[j] + dot * (p2[j] - p1[j])
            };
        }
        mid
    }

    /// Split by a plane. Either half is `None` when nothing lies on that side.
    pub fn clip_epsilon(&self, normal: &Vec3, dist: f32, epsilon: f32) -> (Option<Winding>, Option<Winding>) {
        let (dists, sides, counts) = self.classify(normal, dist, epsilon);

        if counts[SIDE_FRONT] == 0 && counts[SIDE_BACK] == 0 {
            // coplanar: hand it to the side the winding faces
            let (wn, _) = self.plane();
            return if dot_product(&wn, normal) > 0.0 {
                (Some(self.clone()), None)
            } else {
                (None, Some(self.clone()))
            };
        }
        if counts[SIDE_FRONT] == 0 {
            return (None, Some(self.clone()));
        }
        if counts[SIDE_BACK] == 0 {
            return (Some(self.clone()), None);
        }

        let maxpts = self.p.len() + 4;
        let mut f = Vec::with_capacity(maxpts);
        let mut b = Vec::with_capacity(maxpts);

        for (i, &p1) in self.p.iter().enumerate() {
            if sides[i] == SIDE_ON {
                f.push(p1);
                b.push(p1);
                continue;
            }
            if sides[i] == SIDE_FRONT {
                f.push(p1);
            } else {
                b.push(p1);
            }
            if sides[i + 1] == SIDE_ON || sides[i + 1] == sides[i] {
                continue;
            }

            // generate a split point
            let mid = self.split_point(i, normal, dist, &dists);
            f.push(mid);
            b.push(mid);
        }

        if f.len() > MAX_POINTS_ON_WINDING || b.len() > MAX_POINTS_ON_WINDING {
            warn!("ClipWinding: MAX_POINTS_ON_WINDING");
        }

        (Some(Winding { p: f }), Some(Winding { p: b }))
    }

    /// Keep only the part in front of the plane. Returns false when nothing
    /// is left, in which case the winding is emptied.
    pub fn chop_in_place(&mut self, normal: &Vec3, dist: f32, epsilon: f32) -> bool {
        let (dists, sides, counts) = self.classify(normal, dist, epsilon);

        if counts[SIDE_FRONT] == 0 {
            self.p.clear();
            return false;
        }
        if counts[SIDE_BACK] == 0 {
            return true;
        }

        let mut f = Vec::with_capacity(self.p.len() + 4);
        for (i, &p1) in self.p.iter().enumerate() {
            if sides[i] == SIDE_ON {
                f.push(p1);
                continue;
            }
            if sides[i] == SIDE_FRONT {
                f.push(p1);
            }
            if sides[i + 1] == SIDE_ON || sides[i + 1] == sides[i] {
                continue;
            }
            f.push(self.split_point(i, normal, dist, &dists));
        }

        if f.len() > MAX_POINTS_ON_WINDING {
            warn!("ChopWinding: MAX_POINTS_ON_WINDING");
        }
        self.p = f;
        true
    }

    /// Returns the fragment on the front side of the plane.
    pub fn chop(mut self, normal: &Vec3, dist: f32) -> Option<Winding> {
        if self.chop_in_place(normal, dist, ON_EPSILON) {
            Some(self)
        } else {
            None
        }
    }

    pub fn on_plane_side(&self, normal: &Vec3, dist: f32) -> usize {
        let mut front = false;
        let mut back = false;
        for p in &self.p {
            let d = dot_product(p, normal) - dist;
            if d < -ON_EPSILON {
                if front {
                    return SIDE_CROSS;
                }
                back = true;
                continue;
            }
            if d > ON_EPSILON {
                if back {
                    return SIDE_CROSS;
                }
                front = true;
            }
        }
        if back {
            SIDE_BACK
        } else if front {
            SIDE_FRONT
        } else {
            SIDE_ON
        }
    }

    /// Fewer than three edges longer than EDGE_LENGTH.
    pub fn is_tiny(&self) -> bool {
        let mut edges = 0;
        for i in 0..self.p.len() {
            let j = if i == self.p.len() - 1 { 0 } else { i + 1 };
            let delta = vector_subtract(&self.p[j], &self.p[i]);
            if vector_length(&delta) > EDGE_LENGTH {
                edges += 1;
                if edges == 3 {
                    return false;
                }
            }
        }
        true
    }

    /// Any point outside the legal map bounds.
    pub fn is_huge(&self) -> bool {
        self.p.iter().any(|p| p.iter().any(|&c| c <= -MAX_MAP_BOUNDS + 1.0 || c >= MAX_MAP_BOUNDS - 1.0))
    }

    /// Degenerate windings must never reach the tree or the face list.
    pub fn is_degenerate(&self) -> bool {
        self.p.len() < 3 || self.area() < MIN_WINDING_AREA
    }

    pub fn remove_colinear_points(&mut self) {
        let n = self.p.len();
        if n < 3 {
            return;
        }
        let mut kept = Vec::with_capacity(n);
        for i in 0..n {
            let j = (i + 1) % n;
            let k = (i + n - 1) % n;
            let mut v1 = vector_subtract(&self.p[j], &self.p[i]);
            let mut v2 = vector_subtract(&self.p[i], &self.p[k]);
            vector_normalize(&mut v1);
            vector_normalize(&mut v2);
            if dot_product(&v1, &v2) < 0.999 {
                kept.push(self.p[i]);
            }
        }
        if kept.len() != n {
            self.p = kept;
        }
    }

    /// Log anything that would indicate a broken winding. Returns false if
    /// a problem was found.
    pub fn check(&self) -> bool {
        if self.p.len() < 3 {
            warn!("CheckWinding: {} points", self.p.len());
            return false;
        }
        let area = self.area();
        if area < 1.0 {
            warn!("CheckWinding: {} area", area);
            return false;
        }

        let (facenormal, facedist) = self.plane();
        for i in 0..self.p.len() {
            let p1 = &self.p[i];
            if p1.iter().any(|c| c.abs() > MAX_MAP_BOUNDS) {
                warn!("CheckFace: BUGUS_RANGE: {}", p1[0]);
                return false;
            }

            let j = if i + 1 == self.p.len() { 0 } else { i + 1 };

            // check the point is on the face plane
            let d = dot_product(p1, &facenormal) - facedist;
            if !(-ON_EPSILON..=ON_EPSILON).contains(&d) {
                warn!("CheckWinding: point off plane");
                return false;
            }

            // check the edge isn't degenerate
            let p2 = &self.p[j];
            let dir = vector_subtract(p2, p1);
            if vector_length(&dir) < ON_EPSILON {
                warn!("CheckWinding: degenerate edge");
                return false;
            }

            let mut edgenormal = cross_product(&facenormal, &dir);
            vector_normalize(&mut edgenormal);
            let edgedist = dot_product(p1, &edgenormal) + ON_EPSILON;

            // all other points must be on front side
            for (k, p) in self.p.iter().enumerate() {
                if k == i {
                    continue;
                }
                if dot_product(p, &edgenormal) > edgedist {
                    warn!("CheckWinding: non-convex");
                    return false;
                }
            }
        }
        true
    }
}
