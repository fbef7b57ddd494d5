// q_shared.rs — Shared math, content flags, planes and trace results
//
// Everything here is plain data: used by the runtime collision model, the
// world query layer and the map compiler alike.

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

// angle indexes
pub const PITCH: usize = 0;
pub const YAW: usize = 1;
pub const ROLL: usize = 2;

/// Half-size of the coordinate space the tools and the runtime agree on.
pub const MAX_WORLD_COORD: f32 = 65536.0;
pub const MIN_WORLD_COORD: f32 = -65536.0;
pub const WORLD_SIZE: f32 = MAX_WORLD_COORD - MIN_WORLD_COORD;

// ============================================================
// Contents flags
// ============================================================

// lower bits are stronger, and will eat weaker brushes completely
pub const CONTENTS_SOLID: i32 = 1;
pub const CONTENTS_WINDOW: i32 = 2;
pub const CONTENTS_AUX: i32 = 4;
pub const CONTENTS_LAVA: i32 = 8;
pub const CONTENTS_SLIME: i32 = 16;
pub const CONTENTS_WATER: i32 = 32;
pub const CONTENTS_MIST: i32 = 64;
pub const LAST_VISIBLE_CONTENTS: i32 = 64;

// remaining contents are non-visible, and don't eat brushes
pub const CONTENTS_AREAPORTAL: i32 = 0x8000;
pub const CONTENTS_PLAYERCLIP: i32 = 0x10000;
pub const CONTENTS_MONSTERCLIP: i32 = 0x20000;

pub const CONTENTS_ORIGIN: i32 = 0x1000000; // removed before bsping an entity
pub const CONTENTS_MONSTER: i32 = 0x2000000; // should never be on a brush, only in game
pub const CONTENTS_DEADMONSTER: i32 = 0x4000000;
pub const CONTENTS_DETAIL: i32 = 0x8000000; // brushes to be added after vis leafs
pub const CONTENTS_TRANSLUCENT: i32 = 0x10000000; // auto set if any surface has trans
pub const CONTENTS_LADDER: i32 = 0x20000000;

pub const MASK_ALL: i32 = -1;
pub const MASK_SOLID: i32 = CONTENTS_SOLID | CONTENTS_WINDOW;
pub const MASK_PLAYERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_DEADSOLID: i32 = CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW;
pub const MASK_MONSTERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_MONSTERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_WATER: i32 = CONTENTS_WATER | CONTENTS_LAVA | CONTENTS_SLIME;
pub const MASK_OPAQUE: i32 = CONTENTS_SOLID | CONTENTS_SLIME | CONTENTS_LAVA;
pub const MASK_SHOT: i32 =
    CONTENTS_SOLID | CONTENTS_MONSTER | CONTENTS_WINDOW | CONTENTS_DEADMONSTER;

// ============================================================
// Surface flags
// ============================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SurfaceFlags: i32 {
        const LIGHT    = 0x1;   // value will hold the light strength
        const SLICK    = 0x2;   // effects game physics
        const SKY      = 0x4;   // don't draw, but add to skybox
        const WARP     = 0x8;   // turbulent water warp
        const TRANS33  = 0x10;
        const TRANS66  = 0x20;
        const FLOWING  = 0x40;
        const NODRAW   = 0x80;  // don't bother referencing the texture
        const HINT     = 0x100; // make a primary bsp splitter
        const SKIP     = 0x200; // completely ignore, allowing non-closed brushes
    }
}

// ============================================================
// Entity sentinels carried in trace results
// ============================================================

pub const ENTITYNUM_NONE: i32 = -1;
pub const ENTITYNUM_WORLD: i32 = 0;

// ============================================================
// Plane
// ============================================================

// 0-2 are axial planes
pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;

// 3-5 are non-axial planes snapped to the nearest
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_ANYY: u8 = 4;
pub const PLANE_ANYZ: u8 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8, // for fast side tests
    pub signbits: u8,   // signx + (signy<<1) + (signz<<2)
}

impl CPlane {
    pub fn new(normal: Vec3, dist: f32) -> Self {
        Self {
            normal,
            dist,
            plane_type: plane_type_for_normal(&normal),
            signbits: signbits_for_normal(&normal),
        }
    }

    /// Signed distance of `p` from the plane.
    #[inline]
    pub fn distance_to(&self, p: &Vec3) -> f32 {
        if (self.plane_type as usize) < 3 {
            p[self.plane_type as usize] - self.dist
        } else {
            dot_product(&self.normal, p) - self.dist
        }
    }

    /// The same half-space boundary facing the other way.
    pub fn flipped(&self) -> Self {
        CPlane::new(vector_negate(&self.normal), -self.dist)
    }
}

pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    // only the positive axis gets the fast path: p[type] - dist
    if normal[0] == 1.0 {
        return PLANE_X;
    }
    if normal[1] == 1.0 {
        return PLANE_Y;
    }
    if normal[2] == 1.0 {
        return PLANE_Z;
    }

    let ax = normal[0].abs();
    let ay = normal[1].abs();
    let az = normal[2].abs();

    if ax >= ay && ax >= az {
        PLANE_ANYX
    } else if ay >= ax && ay >= az {
        PLANE_ANYY
    } else {
        PLANE_ANYZ
    }
}

pub fn signbits_for_normal(normal: &Vec3) -> u8 {
    let mut bits = 0u8;
    for (j, n) in normal.iter().enumerate() {
        if *n < 0.0 {
            bits |= 1 << j;
        }
    }
    bits
}

// ============================================================
// Collision model
// ============================================================

/// A world or brush-entity model: bounds plus the root of its tree.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3, // for sounds or lights
    pub headnode: i32,
}

// ============================================================
// Trace
// ============================================================

/// Result of a swept box query.
///
/// `fraction == 1.0` means the move completed; anything less means the box
/// stopped at `endpos` against `plane`. `startsolid` is set when the start
/// position was already embedded and `allsolid` when it never left solid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trace {
    pub allsolid: bool,
    pub startsolid: bool,
    pub fraction: f32,
    pub endpos: Vec3,
    pub plane: CPlane,
    pub surface_flags: SurfaceFlags,
    pub contents: i32,
    /// ENTITYNUM_WORLD, ENTITYNUM_NONE or an entity number.
    pub ent: i32,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: CPlane::default(),
            surface_flags: SurfaceFlags::empty(),
            contents: 0,
            ent: ENTITYNUM_NONE,
        }
    }
}

impl Trace {
    #[inline]
    pub fn hit(&self) -> bool {
        self.fraction < 1.0
    }
}

// ============================================================
// MATHLIB — Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vector_negate(v: &Vec3) -> Vec3 {
    [-v[0], -v[1], -v[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

/// a + frac * (b - a)
pub fn vector_lerp(a: &Vec3, b: &Vec3, frac: f32) -> Vec3 {
    [
        a[0] + frac * (b[0] - a[0]),
        a[1] + frac * (b[1] - a[1]),
        a[2] + frac * (b[2] - a[2]),
    ]
}

pub fn vector_compare(v1: &Vec3, v2: &Vec3) -> bool {
    v1[0] == v2[0] && v1[1] == v2[1] && v1[2] == v2[2]
}

pub fn vector_length(v: &Vec3) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

pub fn clear_bounds(mins: &mut Vec3, maxs: &mut Vec3) {
    *mins = [99999.0; 3];
    *maxs = [-99999.0; 3];
}

pub fn add_point_to_bounds(v: &Vec3, mins: &mut Vec3, maxs: &mut Vec3) {
    for i in 0..3 {
        if v[i] < mins[i] {
            mins[i] = v[i];
        }
        if v[i] > maxs[i] {
            maxs[i] = v[i];
        }
    }
}

pub fn bounds_intersect(mins1: &Vec3, maxs1: &Vec3, mins2: &Vec3, maxs2: &Vec3) -> bool {
    !(mins1[0] > maxs2[0]
        || mins1[1] > maxs2[1]
        || mins1[2] > maxs2[2]
        || maxs1[0] < mins2[0]
        || maxs1[1] < mins2[1]
        || maxs1[2] < mins2[2])
}

// ============================================================
// Angle functions
// ============================================================

/// Returns (forward, right, up) for the given pitch/yaw/roll in degrees.
pub fn angle_vectors(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let (sy, cy) = angles[YAW].to_radians().sin_cos();
    let (sp, cp) = angles[PITCH].to_radians().sin_cos();
    let (sr, cr) = angles[ROLL].to_radians().sin_cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + -cr * -sy,
        -sr * sp * sy + -cr * cy,
        -sr * cp,
    ];
    let up = [cr * sp * cy + -sr * -sy, cr * sp * sy + -sr * cy, cr * cp];
    (forward, right, up)
}

/// Rotation matrix for an entity orientation. Rows are forward, left, up,
/// so `matrix * local` yields a world-space direction.
pub type Mat3 = [[f32; 3]; 3];

pub fn create_rotation_matrix(angles: &Vec3) -> Mat3 {
    let (forward, right, up) = angle_vectors(angles);
    let left = vector_negate(&right);
    [
        [forward[0], left[0], up[0]],
        [forward[1], left[1], up[1]],
        [forward[2], left[2], up[2]],
    ]
}

pub fn transpose_matrix(m: &Mat3) -> Mat3 {
    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = m[j][i];
        }
    }
    out
}

pub fn rotate_point(m: &Mat3, p: &Vec3) -> Vec3 {
    [
        dot_product(&m[0], p),
        dot_product(&m[1], p),
        dot_product(&m[2], p),
    ]
}

/// Returns 1 (front), 2 (back), or 3 (crossing) for a box vs. plane test.
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &CPlane) -> i32 {
    // fast axial cases
    if (p.plane_type as usize) < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    // general case: pick the corners nearest and farthest along the normal
    let mut near = [0.0f32; 3];
    let mut far = [0.0f32; 3];
    for i in 0..3 {
        if p.signbits & (1 << i) != 0 {
            far[i] = emins[i];
            near[i] = emaxs[i];
        } else {
            far[i] = emaxs[i];
            near[i] = emins[i];
        }
    }
    let dist1 = dot_product(&p.normal, &far);
    let dist2 = dot_product(&p.normal, &near);

    let mut sides = 0;
    if dist1 >= p.dist {
        sides = 1;
    }
    if dist2 < p.dist {
        sides |= 2;
    }
    sides
}
