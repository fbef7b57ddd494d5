// brush.rs — Brush sides, working brushes and the split that carves them

use log::{debug, warn};

use ibsp_common::common::Result;
use ibsp_common::polylib::{Winding, MAX_MAP_BOUNDS};
use ibsp_common::q_shared::{
    add_point_to_bounds, box_on_plane_side, clear_bounds, dot_product, CPlane, SurfaceFlags, Vec3,
};

use crate::context::PlaneTable;
use crate::map::MapBrush;

pub const PSIDE_FRONT: i32 = 1;
pub const PSIDE_BACK: i32 = 2;
pub const PSIDE_BOTH: i32 = PSIDE_FRONT | PSIDE_BACK;
pub const PSIDE_FACING: i32 = 4;

/// Texinfo of sides that never produce a face.
pub const TEXINFO_NODE: i32 = -1;

// ============================================================
// Side
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct Side {
    pub plane_num: i32,
    pub texinfo: i32,
    pub surface_flags: i32,
    pub contents: i32,
    pub winding: Option<Winding>,
    /// Can produce a face; false for clip, hint, skip and split sides.
    pub visible: bool,
    /// Added for collision only, never a splitter.
    pub bevel: bool,
    /// Already used as a node plane above this fragment.
    pub on_node: bool,
    /// Scratch flag for one split selection.
    pub tested: bool,
}

impl Side {
    pub fn is_hint(&self) -> bool {
        self.surface_flags & SurfaceFlags::HINT.bits() != 0
    }

    pub fn is_skip(&self) -> bool {
        self.surface_flags & SurfaceFlags::SKIP.bits() != 0
    }
}

/// Rebuild every non-bevel side's winding by chopping its base winding
/// with the other sides, and return the bounds of the result.
pub fn make_side_windings(sides: &mut [Side], planes: &PlaneTable) -> (Vec3, Vec3) {
    let mut mins = [0.0; 3];
    let mut maxs = [0.0; 3];
    clear_bounds(&mut mins, &mut maxs);

    for i in 0..sides.len() {
        if sides[i].bevel {
            sides[i].winding = None;
            continue;
        }
        let p = planes.get(sides[i].plane_num);
        let mut w = Some(Winding::base_for_plane(&p.normal, p.dist));
        for (j, other) in sides.iter().enumerate() {
            if i == j || other.bevel {
                continue;
            }
            if other.plane_num == (sides[i].plane_num ^ 1) {
                continue; // back side clipaway
            }
            let flip = planes.get(other.plane_num ^ 1);
            w = match w {
                Some(w) => w.chop(&flip.normal, flip.dist),
                None => break,
            };
        }
        if let Some(w) = &w {
            for v in &w.p {
                add_point_to_bounds(v, &mut mins, &mut maxs);
            }
        }
        sides[i].winding = w;
    }

    (mins, maxs)
}

/// Volume enclosed by the side windings: a pyramid from one corner to
/// every face.
pub fn volume_of_sides(sides: &[Side], planes: &PlaneTable) -> f32 {
    let Some(corner) = sides.iter().find_map(|s| s.winding.as_ref().map(|w| w.p[0])) else {
        return 0.0;
    };

    let mut volume = 0.0;
    for s in sides {
        let Some(w) = &s.winding else {
            continue;
        };
        let p = planes.get(s.plane_num);
        let d = -(dot_product(&corner, &p.normal) - p.dist);
        volume += d * w.area();
    }
    volume / 3.0
}

/// Bounds that are inverted or reach the edge of the legal map are the
/// signature of a brush whose sides do not enclose anything.
pub fn bounds_are_valid(mins: &Vec3, maxs: &Vec3) -> bool {
    (0..3).all(|i| mins[i] < maxs[i] && mins[i] > -MAX_MAP_BOUNDS && maxs[i] < MAX_MAP_BOUNDS)
}

// ============================================================
// BspBrush
// ============================================================

/// A convex piece of a map brush carried through tree construction.
#[derive(Debug, Clone, Default)]
pub struct BspBrush {
    /// Index into the context's map brush list.
    pub original: usize,
    pub contents: i32,
    pub sides: Vec<Side>,
    pub mins: Vec3,
    pub maxs: Vec3,
    /// Side of the chosen split plane, filled in during split selection.
    pub side: i32,
    pub test_side: i32,
}

impl BspBrush {
    /// A working copy of a map brush. Bevels only matter for collision and
    /// stay behind.
    pub fn from_map(mb: &MapBrush, original: usize) -> Self {
        let sides: Vec<Side> = mb.sides.iter().filter(|s| !s.bevel).cloned().collect();
        BspBrush { original, contents: mb.contents, sides, mins: mb.mins, maxs: mb.maxs, ..Default::default() }
    }

    pub fn bound(&mut self) {
        clear_bounds(&mut self.mins, &mut self.maxs);
        for s in &self.sides {
            if let Some(w) = &s.winding {
                for v in &w.p {
                    add_point_to_bounds(v, &mut self.mins, &mut self.maxs);
                }
            }
        }
    }

    pub fn create_windings(&mut self, planes: &PlaneTable) {
        let (mins, maxs) = make_side_windings(&mut self.sides, planes);
        self.mins = mins;
        self.maxs = maxs;
    }

    pub fn volume(&self, planes: &PlaneTable) -> f32 {
        volume_of_sides(&self.sides, planes)
    }

    pub fn is_detail(&self) -> bool {
        self.contents & ibsp_common::q_shared::CONTENTS_DETAIL != 0
    }

    /// Which side of the plane holds the larger part of the brush.
    pub fn most_on_side(&self, plane: &CPlane) -> i32 {
        let mut max = 0.0;
        let mut side = PSIDE_FRONT;
        for s in &self.sides {
            let Some(w) = &s.winding else {
                continue;
            };
            for p in &w.p {
                let d = dot_product(p, &plane.normal) - plane.dist;
                if d > max {
                    max = d;
                    side = PSIDE_FRONT;
                }
                if -d > max {
                    max = -d;
                    side = PSIDE_BACK;
                }
            }
        }
        side
    }

    /// Classify the brush against a plane. Also counts the visible faces
    /// the plane would split and whether any of them is a hint, and bumps
    /// `epsilon_brush` when the brush barely crosses the plane.
    pub fn test_to_plane_num(
        &self,
        plane_num: i32,
        planes: &PlaneTable,
        num_splits: &mut i32,
        hint_split: &mut bool,
        epsilon_brush: &mut i32,
    ) -> i32 {
        *num_splits = 0;
        *hint_split = false;

        // if the brush actually uses the plane, we can tell the side for sure
        for s in &self.sides {
            if s.plane_num == plane_num {
                return PSIDE_BACK | PSIDE_FACING;
            }
            if s.plane_num == (plane_num ^ 1) {
                return PSIDE_FRONT | PSIDE_FACING;
            }
        }

        let p = planes.get(plane_num);
        let plane = CPlane::new(p.normal, p.dist);
        let s = box_on_plane_side(&self.mins, &self.maxs, &plane);
        if s != PSIDE_BOTH {
            return s;
        }

        // if on both sides, count the visible faces split
        let mut d_front: f32 = 0.0;
        let mut d_back: f32 = 0.0;
        for side in &self.sides {
            if side.on_node || !side.visible {
                continue;
            }
            let Some(w) = &side.winding else {
                continue;
            };
            let mut front = false;
            let mut back = false;
            for v in &w.p {
                let d = dot_product(v, &p.normal) - p.dist;
                d_front = d_front.max(d);
                d_back = d_back.min(d);
                if d > 0.1 {
                    front = true;
                }
                if d < -0.1 {
                    back = true;
                }
            }
            if front && back && !side.is_skip() {
                *num_splits += 1;
                if side.is_hint() {
                    *hint_split = true;
                }
            }
        }

        if (d_front > 0.0 && d_front < 1.0) || (d_back < 0.0 && d_back > -1.0) {
            *epsilon_brush += 1;
        }

        s
    }

    /// Cut the brush by a plane. Either half is `None` when nothing of
    /// useful volume lies on that side.
    pub fn split(&self, plane_num: i32, planes: &PlaneTable, microvolume: f32) -> (Option<BspBrush>, Option<BspBrush>) {
        let p = planes.get(plane_num);
        let plane = CPlane::new(p.normal, p.dist);

        // check all points
        let mut d_front: f32 = 0.0;
        let mut d_back: f32 = 0.0;
        for s in &self.sides {
            let Some(w) = &s.winding else {
                continue;
            };
            for v in &w.p {
                let d = dot_product(v, &plane.normal) - plane.dist;
                d_front = d_front.max(d);
                d_back = d_back.min(d);
            }
        }
        if d_front < 0.1 {
            return (None, Some(self.clone())); // only on back
        }
        if d_back > -0.1 {
            return (Some(self.clone()), None); // only on front
        }

        // create a new winding from the split plane
        let mut w = Some(Winding::base_for_plane(&plane.normal, plane.dist));
        for s in &self.sides {
            let flip = planes.get(s.plane_num ^ 1);
            w = match w {
                Some(w) => w.chop(&flip.normal, flip.dist),
                None => break,
            };
        }

        let midwinding = match w {
            Some(w) if !w.is_tiny() => w,
            _ => {
                // the brush isn't really split
                return if self.most_on_side(&plane) == PSIDE_FRONT {
                    (Some(self.clone()), None)
                } else {
                    (None, Some(self.clone()))
                };
            }
        };
        if midwinding.is_huge() {
            warn!("huge winding");
        }

        // split it for real
        let mut halves: [BspBrush; 2] = [
            BspBrush { original: self.original, contents: self.contents, ..Default::default() },
            BspBrush { original: self.original, contents: self.contents, ..Default::default() },
        ];
        for s in &self.sides {
            let Some(w) = &s.winding else {
                continue;
            };
            let (front, back) = w.clip_epsilon(&plane.normal, plane.dist, 0.0);
            for (half, cw) in halves.iter_mut().zip([front, back]) {
                if let Some(cw) = cw {
                    let mut ns = s.clone();
                    ns.winding = Some(cw);
                    ns.tested = false;
                    half.sides.push(ns);
                }
            }
        }

        // see if we have valid polygons on both sides
        let mut valid = [false; 2];
        for (i, half) in halves.iter_mut().enumerate() {
            half.bound();
            valid[i] = half.sides.len() >= 3 && bounds_are_valid(&half.mins, &half.maxs);
        }

        if !(valid[0] && valid[1]) {
            if !valid[0] && !valid[1] {
                debug!("split removed brush");
            } else {
                debug!("split not on both sides");
            }
            return match (valid[0], valid[1]) {
                (true, _) => (Some(self.clone()), None),
                (_, true) => (None, Some(self.clone())),
                _ => (None, None),
            };
        }

        // add the midwinding to both sides
        let [mut front, mut back] = halves;
        for (i, half) in [&mut front, &mut back].into_iter().enumerate() {
            half.sides.push(Side {
                plane_num: plane_num ^ i as i32 ^ 1,
                texinfo: TEXINFO_NODE,
                winding: Some(if i == 0 { midwinding.reversed() } else { midwinding.clone() }),
                visible: false,
                on_node: true,
                ..Default::default()
            });
        }

        let front = (front.volume(planes) >= microvolume).then_some(front);
        let back = (back.volume(planes) >= microvolume).then_some(back);
        (front, back)
    }
}

/// An axial box brush, used for node volumes and block clipping.
pub fn brush_from_bounds(mins: &Vec3, maxs: &Vec3, planes: &mut PlaneTable) -> Result<BspBrush> {
    let mut b = BspBrush::default();
    for i in 0..3 {
        let mut normal = [0.0; 3];
        normal[i] = 1.0;
        b.sides.push(Side {
            plane_num: planes.find_float_plane(&normal, maxs[i])?,
            texinfo: TEXINFO_NODE,
            ..Default::default()
        });
        normal[i] = -1.0;
        b.sides.push(Side {
            plane_num: planes.find_float_plane(&normal, -mins[i])?,
            texinfo: TEXINFO_NODE,
            ..Default::default()
        });
    }
    b.create_windings(planes);
    Ok(b)
}
