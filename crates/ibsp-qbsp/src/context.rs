// context.rs — Compilation state: plane and texinfo tables, map contents
//
// Everything the stages share lives in one CompilationContext passed by
// reference, so two compiles never see each other's tables.

use std::collections::HashMap;

use ibsp_common::common::{BspError, Result};
use ibsp_common::q_shared::{plane_type_for_normal, vector_negate, Vec3};
use ibsp_common::qfiles::{DTexinfo, MAX_MAP_PLANES, MAX_MAP_TEXINFO};

use crate::map::{MapBrush, MapEntity};
use crate::options::CompileOptions;

pub const NORMAL_EPSILON: f32 = 0.00001;
pub const DIST_EPSILON: f32 = 0.01;

const PLANE_HASHES: i32 = 1024;

// ============================================================
// Planes
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
}

impl Plane {
    fn new(normal: Vec3, dist: f32) -> Self {
        Plane { normal, dist, plane_type: plane_type_for_normal(&normal) }
    }

    fn equals(&self, normal: &Vec3, dist: f32) -> bool {
        (self.normal[0] - normal[0]).abs() < NORMAL_EPSILON
            && (self.normal[1] - normal[1]).abs() < NORMAL_EPSILON
            && (self.normal[2] - normal[2]).abs() < NORMAL_EPSILON
            && (self.dist - dist).abs() < DIST_EPSILON
    }

    /// True for the member of a pair stored at the even slot: the one whose
    /// largest normal component is positive.
    pub fn is_positive(normal: &Vec3) -> bool {
        let mut axis = 0;
        for i in 1..3 {
            if normal[i].abs() > normal[axis].abs() {
                axis = i;
            }
        }
        normal[axis] > 0.0
    }
}

/// Snap near-axial normals to the axis and near-integer distances to the
/// integer, so slightly different inputs share a plane.
pub fn snap_plane(normal: &Vec3, dist: f32) -> (Vec3, f32) {
    let mut normal = *normal;
    for i in 0..3 {
        if (normal[i] - 1.0).abs() < NORMAL_EPSILON {
            normal = [0.0; 3];
            normal[i] = 1.0;
            break;
        }
        if (normal[i] - -1.0).abs() < NORMAL_EPSILON {
            normal = [0.0; 3];
            normal[i] = -1.0;
            break;
        }
    }

    let rounded = dist.round();
    let dist = if (dist - rounded).abs() < DIST_EPSILON { rounded } else { dist };
    (normal, dist)
}

/// Deduplicated plane table. Planes come in pairs: `n` and `n ^ 1` are the
/// same boundary facing opposite ways, the positive one at the even index.
#[derive(Debug, Clone, Default)]
pub struct PlaneTable {
    planes: Vec<Plane>,
    hash: HashMap<i32, Vec<usize>>,
}

impl PlaneTable {
    fn hash_key(dist: f32) -> i32 {
        ((dist.abs() as i32) / 8) & (PLANE_HASHES - 1)
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn get(&self, num: i32) -> &Plane {
        &self.planes[num as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plane> {
        self.planes.iter()
    }

    pub fn find_float_plane(&mut self, normal: &Vec3, dist: f32) -> Result<i32> {
        let (normal, dist) = snap_plane(normal, dist);
        let hash = Self::hash_key(dist);

        for h in [hash - 1, hash, hash + 1] {
            let Some(bucket) = self.hash.get(&(h & (PLANE_HASHES - 1))) else {
                continue;
            };
            for &i in bucket {
                if self.planes[i].equals(&normal, dist) {
                    return Ok(i as i32);
                }
            }
        }

        self.create_new_float_plane(normal, dist)
    }

    fn create_new_float_plane(&mut self, normal: Vec3, dist: f32) -> Result<i32> {
        if self.planes.len() + 2 > MAX_MAP_PLANES {
            return Err(BspError::LimitExceeded { table: "MAX_MAP_PLANES", max: MAX_MAP_PLANES });
        }

        let p = Plane::new(normal, dist);
        let q = Plane::new(vector_negate(&normal), -dist);
        let base = self.planes.len();

        // always put the positive facing plane first
        let (first, found) = if Plane::is_positive(&normal) { ((p, q), base) } else { ((q, p), base + 1) };
        self.planes.push(first.0);
        self.planes.push(first.1);

        let key = Self::hash_key(dist);
        self.hash.entry(key).or_default().push(base);
        self.hash.entry(key).or_default().push(base + 1);

        Ok(found as i32)
    }
}

// ============================================================
// Texinfo
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct TexinfoTable {
    list: Vec<DTexinfo>,
}

impl TexinfoTable {
    pub fn find_texinfo(&mut self, name: &str, surface_flags: i32, content_flags: i32) -> Result<i32> {
        let tx = DTexinfo::new(name, surface_flags, content_flags);
        if let Some(i) = self.list.iter().position(|t| *t == tx) {
            return Ok(i as i32);
        }
        if self.list.len() == MAX_MAP_TEXINFO {
            return Err(BspError::LimitExceeded { table: "MAX_MAP_TEXINFO", max: MAX_MAP_TEXINFO });
        }
        self.list.push(tx);
        Ok(self.list.len() as i32 - 1)
    }

    pub fn get(&self, num: i32) -> &DTexinfo {
        &self.list[num as usize]
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn as_slice(&self) -> &[DTexinfo] {
        &self.list
    }
}

// ============================================================
// CompilationContext
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct CompilationContext {
    pub options: CompileOptions,
    pub planes: PlaneTable,
    pub texinfo: TexinfoTable,
    pub map_brushes: Vec<MapBrush>,
    pub entities: Vec<MapEntity>,
}

impl CompilationContext {
    pub fn new(options: CompileOptions) -> Self {
        Self { options, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Plane table
    // ============================================================

    #[test]
    fn planes_are_shared_within_tolerance() {
        let mut t = PlaneTable::default();
        let a = t.find_float_plane(&[0.0, 0.0, 1.0], 64.0).unwrap();
        let b = t.find_float_plane(&[0.000001, 0.0, 0.9999995], 64.004).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn pairs_keep_positive_plane_even() {
        let mut t = PlaneTable::default();
        let down = t.find_float_plane(&[0.0, 0.0, -1.0], -16.0).unwrap();
        assert_eq!(down, 1);
        let up = t.find_float_plane(&[0.0, 0.0, 1.0], 16.0).unwrap();
        assert_eq!(up, 0);
        assert_eq!(up ^ 1, down);
        assert_eq!(t.get(0).normal, [0.0, 0.0, 1.0]);
        assert_eq!(t.get(1).dist, -16.0);

        let diag = t.find_float_plane(&[-0.6, 0.0, -0.8], 10.0).unwrap();
        assert_eq!(diag & 1, 1, "negative major component lands on the odd slot");
    }

    #[test]
    fn snapping_rounds_near_integers() {
        let (n, d) = snap_plane(&[0.999999, 0.0, 0.0], 31.995);
        assert_eq!(n, [1.0, 0.0, 0.0]);
        assert_eq!(d, 32.0);
        let (_, d) = snap_plane(&[0.0, 0.6, 0.8], 31.5);
        assert_eq!(d, 31.5);
    }

    #[test]
    fn neighbouring_hash_buckets_are_searched() {
        let mut t = PlaneTable::default();
        let a = t.find_float_plane(&[0.6, 0.8, 0.0], 15.995).unwrap();
        let b = t.find_float_plane(&[0.6, 0.8, 0.0], 16.004).unwrap();
        assert_eq!(a, b);
    }

    // ============================================================
    // Texinfo
    // ============================================================

    #[test]
    fn texinfo_is_deduplicated() {
        let mut t = TexinfoTable::default();
        let a = t.find_texinfo("e1u1/floor", 0, 1).unwrap();
        let b = t.find_texinfo("e1u1/wall", 0, 1).unwrap();
        let c = t.find_texinfo("e1u1/floor", 0, 1).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(b).name_str(), "e1u1/wall");
    }

    #[test]
    fn texinfo_overflow_is_fatal() {
        let mut t = TexinfoTable::default();
        for i in 0..MAX_MAP_TEXINFO {
            t.find_texinfo("e1u1/wall", i as i32, 0).unwrap();
        }
        // existing entries are still found once the table is full
        assert_eq!(t.find_texinfo("e1u1/wall", 7, 0).unwrap(), 7);
        let err = t.find_texinfo("e1u1/wall", -1, 0).unwrap_err();
        assert!(matches!(err, BspError::LimitExceeded { table: "MAX_MAP_TEXINFO", max: MAX_MAP_TEXINFO }));
    }

    #[test]
    fn plane_overflow_is_fatal() {
        let mut t = PlaneTable::default();
        for i in 0..MAX_MAP_PLANES / 2 {
            t.find_float_plane(&[0.0, 0.0, 1.0], i as f32).unwrap();
        }
        assert_eq!(t.len(), MAX_MAP_PLANES);
        let err = t.find_float_plane(&[1.0, 0.0, 0.0], 0.5).unwrap_err();
        assert!(matches!(err, BspError::LimitExceeded { table: "MAX_MAP_PLANES", .. }));
    }
}
