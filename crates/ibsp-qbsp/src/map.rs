// map.rs — .map source parsing: entities, brushes, origins and bevels

use std::path::Path;

use log::{debug, info, warn};

use ibsp_common::common::{BspError, Result};
use ibsp_common::q_shared::*;

use crate::brush::{bounds_are_valid, make_side_windings, volume_of_sides, Side};
use crate::context::CompilationContext;

// ============================================================
// Script
// ============================================================

/// Token reader over map source. Tracks the line for diagnostics and can
/// tell whether more tokens remain on the current line.
pub struct Script<'a> {
    data: &'a [u8],
    pos: usize,
    pub line: usize,
}

impl<'a> Script<'a> {
    pub fn new(text: &'a str) -> Self {
        Script { data: text.as_bytes(), pos: 0, line: 1 }
    }

    pub fn error(&self, msg: impl Into<String>) -> BspError {
        BspError::Parse { line: self.line, msg: msg.into() }
    }

    /// Next token, or `None` at end of data. With `crossline` false a
    /// newline also ends the search.
    pub fn get_token(&mut self, crossline: bool) -> Option<String> {
        // skip space
        loop {
            while self.pos < self.data.len() && self.data[self.pos] <= b' ' {
                if self.data[self.pos] == b'\n' {
                    if !crossline {
                        return None;
                    }
                    self.line += 1;
                }
                self.pos += 1;
            }
            if self.pos >= self.data.len() {
                return None;
            }

            // skip // comments
            if self.data[self.pos..].starts_with(b"//") {
                while self.pos < self.data.len() && self.data[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }

        let start;
        let end;
        if self.data[self.pos] == b'"' {
            // quoted token
            self.pos += 1;
            start = self.pos;
            while self.pos < self.data.len() && self.data[self.pos] != b'"' {
                if self.data[self.pos] == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            }
            end = self.pos;
            if self.pos < self.data.len() {
                self.pos += 1;
            }
        } else {
            start = self.pos;
            while self.pos < self.data.len() && self.data[self.pos] > b' ' {
                self.pos += 1;
            }
            end = self.pos;
        }

        Some(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }

    /// Anything left before the end of the line?
    pub fn token_available(&self) -> bool {
        let mut p = self.pos;
        while p < self.data.len() {
            match self.data[p] {
                b'\n' => return false,
                c if c <= b' ' => p += 1,
                b'/' if self.data[p..].starts_with(b"//") => return false,
                _ => return true,
            }
        }
        false
    }

    fn expect(&mut self, want: &str) -> Result<()> {
        match self.get_token(false) {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(self.error(format!("expected {} found {}", want, t))),
            None => Err(self.error(format!("expected {} found end of line", want))),
        }
    }

    fn number(&mut self) -> Result<f32> {
        let t = self.get_token(false).ok_or_else(|| self.error("missing number"))?;
        t.parse::<f32>().map_err(|_| self.error(format!("bad number {}", t)))
    }

    fn integer(&mut self) -> Result<i32> {
        let t = self.get_token(false).ok_or_else(|| self.error("missing number"))?;
        t.parse::<i32>().map_err(|_| self.error(format!("bad integer {}", t)))
    }
}

// ============================================================
// Map types
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct MapEntity {
    pub epairs: Vec<(String, String)>,
    pub origin: Vec3,
    /// Indices into the context's map brush list.
    pub brushes: Vec<usize>,
    /// Areas on either side of a func_areaportal, filled by the area flood.
    pub portal_areas: [i32; 2],
}

impl MapEntity {
    pub fn value_for_key(&self, key: &str) -> &str {
        self.epairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str()).unwrap_or("")
    }

    pub fn set_key_value(&mut self, key: &str, value: &str) {
        match self.epairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => self.epairs.push((key.to_string(), value.to_string())),
        }
    }

    pub fn vector_for_key(&self, key: &str) -> Vec3 {
        let mut v = [0.0; 3];
        for (i, s) in self.value_for_key(key).split_whitespace().take(3).enumerate() {
            v[i] = s.parse().unwrap_or(0.0);
        }
        v
    }

    pub fn classname(&self) -> &str {
        self.value_for_key("classname")
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapBrush {
    /// Entity the brush was written in. Area portal brushes keep this
    /// after they move to the world.
    pub entity_num: usize,
    /// Brush number within its entity, for diagnostics.
    pub brush_num: usize,
    pub contents: i32,
    pub sides: Vec<Side>,
    pub mins: Vec3,
    pub maxs: Vec3,
}

/// Contents and surface flags implied by a texture name when the brush
/// line does not spell them out.
pub fn texture_flags(name: &str) -> (i32, i32) {
    let lower = name.to_ascii_lowercase();
    let base = lower.rsplit('/').next().unwrap_or(&lower);
    if base == "clip" {
        (CONTENTS_PLAYERCLIP | CONTENTS_MONSTERCLIP, SurfaceFlags::NODRAW.bits())
    } else if base == "origin" {
        (CONTENTS_ORIGIN, SurfaceFlags::NODRAW.bits())
    } else if base.starts_with("*lava") {
        (CONTENTS_LAVA, SurfaceFlags::WARP.bits())
    } else if base.starts_with("*slime") {
        (CONTENTS_SLIME, SurfaceFlags::WARP.bits())
    } else if base.starts_with('*') {
        (CONTENTS_WATER, SurfaceFlags::WARP.bits())
    } else if base == "hint" {
        (0, SurfaceFlags::HINT.bits())
    } else if base == "skip" {
        (0, SurfaceFlags::SKIP.bits())
    } else if base.starts_with("sky") {
        (CONTENTS_SOLID, SurfaceFlags::SKY.bits())
    } else {
        (CONTENTS_SOLID, 0)
    }
}

fn plane_from_points(p0: &Vec3, p1: &Vec3, p2: &Vec3) -> (Vec3, f32) {
    let t1 = vector_subtract(p0, p1);
    let t2 = vector_subtract(p2, p1);
    let mut normal = cross_product(&t1, &t2);
    let len = vector_normalize(&mut normal);
    if len == 0.0 {
        return ([0.0; 3], 0.0);
    }
    (normal, dot_product(p0, &normal))
}

fn brush_contents(b: &MapBrush, surface_flags: i32) -> i32 {
    let mut contents = b.sides.iter().fold(0, |c, s| c | s.contents);

    // if any side is translucent, mark the contents and change solid to window
    if surface_flags & (SurfaceFlags::TRANS33 | SurfaceFlags::TRANS66).bits() != 0 {
        contents |= CONTENTS_TRANSLUCENT;
        if contents & CONTENTS_SOLID != 0 {
            contents = (contents & !CONTENTS_SOLID) | CONTENTS_WINDOW;
        }
    }
    contents
}

/// Add any of the six axial planes the brush is missing, so boxes swept
/// along an edge of a sloped brush stop at its bounds.
fn add_brush_bevels(ctx: &mut CompilationContext, b: &mut MapBrush) -> Result<()> {
    let texinfo = b.sides.first().map(|s| s.texinfo).unwrap_or(-1);
    for axis in 0..3 {
        for dir in [-1.0f32, 1.0] {
            let has = b.sides.iter().any(|s| {
                let p = ctx.planes.get(s.plane_num);
                p.normal[axis] == dir
            });
            if has {
                continue;
            }
            let mut normal = [0.0; 3];
            normal[axis] = dir;
            let dist = if dir < 0.0 { -b.mins[axis] } else { b.maxs[axis] };
            b.sides.push(Side {
                plane_num: ctx.planes.find_float_plane(&normal, dist)?,
                texinfo,
                bevel: true,
                ..Default::default()
            });
        }
    }
    Ok(())
}

/// Windings, bounds and a sanity check. False means the brush should be
/// thrown away.
fn finish_brush(ctx: &CompilationContext, b: &mut MapBrush) -> bool {
    let (mins, maxs) = make_side_windings(&mut b.sides, &ctx.planes);
    b.mins = mins;
    b.maxs = maxs;

    if !bounds_are_valid(&b.mins, &b.maxs) {
        warn!("Entity {}, Brush {}: bad brush bounds", b.entity_num, b.brush_num);
        return false;
    }
    let volume = volume_of_sides(&b.sides, &ctx.planes);
    if volume < ctx.options.microvolume {
        warn!("Entity {}, Brush {}: microbrush, volume {}", b.entity_num, b.brush_num, volume);
        return false;
    }
    true
}

fn parse_brush(ctx: &mut CompilationContext, script: &mut Script, entity_num: usize, brush_num: usize) -> Result<Option<MapBrush>> {
    let mut b = MapBrush { entity_num, brush_num, ..Default::default() };
    let mut all_flags = 0;

    loop {
        let token = script.get_token(true).ok_or_else(|| script.error("end of file inside brush"))?;
        if token == "}" {
            break;
        }
        if token != "(" {
            return Err(script.error(format!("expected ( found {}", token)));
        }

        // read the three point plane definition
        let mut pts = [[0.0f32; 3]; 3];
        for (i, pt) in pts.iter_mut().enumerate() {
            if i != 0 {
                script.expect("(")?;
            }
            for v in pt.iter_mut() {
                *v = script.number()?;
            }
            script.expect(")")?;
        }

        // read the texdef
        let texture = script.get_token(false).ok_or_else(|| script.error("missing texture name"))?;
        for _ in 0..5 {
            script.number()?; // shift, rotate and scale only matter to a renderer
        }

        let (name_contents, name_flags) = texture_flags(&texture);
        let (mut contents, flags) = if script.token_available() {
            let contents = script.integer()?;
            let flags = script.integer()?;
            script.integer()?; // value
            (contents, flags)
        } else {
            (name_contents, name_flags)
        };

        // translucent objects are automatically classified as detail
        if flags & (SurfaceFlags::TRANS33 | SurfaceFlags::TRANS66).bits() != 0 {
            contents |= CONTENTS_DETAIL;
        }
        if contents & ((LAST_VISIBLE_CONTENTS - 1) | CONTENTS_PLAYERCLIP | CONTENTS_MONSTERCLIP | CONTENTS_MIST | CONTENTS_ORIGIN) == 0
            && flags & (SurfaceFlags::HINT | SurfaceFlags::SKIP).bits() == 0
        {
            contents |= CONTENTS_SOLID;
        }
        // hints and skips only ever split, they have no content
        if flags & (SurfaceFlags::HINT | SurfaceFlags::SKIP).bits() != 0 {
            contents = 0;
        }
        all_flags |= flags;

        let (normal, dist) = plane_from_points(&pts[0], &pts[1], &pts[2]);
        if normal == [0.0; 3] {
            return Err(script.error(format!("Entity {}, Brush {}: plane with no normal", entity_num, brush_num)));
        }
        let plane_num = ctx.planes.find_float_plane(&normal, dist)?;

        // see if the plane has been used already
        if b.sides.iter().any(|s| s.plane_num == plane_num) {
            debug!("Entity {}, Brush {}: duplicate plane", entity_num, brush_num);
            continue;
        }
        if b.sides.iter().any(|s| s.plane_num == (plane_num ^ 1)) {
            warn!("Entity {}, Brush {}: mirrored plane", entity_num, brush_num);
            continue;
        }

        // hints stay visible so they win the splitter search
        let nodraw = flags & (SurfaceFlags::NODRAW | SurfaceFlags::SKIP).bits() != 0
            && flags & (SurfaceFlags::SKY | SurfaceFlags::HINT).bits() == 0;
        let clip = contents & (CONTENTS_PLAYERCLIP | CONTENTS_MONSTERCLIP) != 0;
        b.sides.push(Side {
            plane_num,
            texinfo: ctx.texinfo.find_texinfo(&texture, flags, contents)?,
            surface_flags: flags,
            contents,
            visible: !nodraw && !clip,
            ..Default::default()
        });
    }

    b.contents = brush_contents(&b, all_flags);

    // clip brushes never block vis or produce faces
    if b.contents & (CONTENTS_PLAYERCLIP | CONTENTS_MONSTERCLIP) != 0 {
        b.contents |= CONTENTS_DETAIL;
    }

    if !finish_brush(ctx, &mut b) {
        return Ok(None);
    }
    add_brush_bevels(ctx, &mut b)?;
    Ok(Some(b))
}

/// Move a brush from world space into its entity's model space.
fn adjust_brush_for_origin(ctx: &mut CompilationContext, b: &mut MapBrush, origin: &Vec3) -> Result<()> {
    for s in &mut b.sides {
        let p = *ctx.planes.get(s.plane_num);
        let dist = p.dist - dot_product(&p.normal, origin);
        s.plane_num = ctx.planes.find_float_plane(&p.normal, dist)?;
    }
    let (mins, maxs) = make_side_windings(&mut b.sides, &ctx.planes);
    b.mins = mins;
    b.maxs = maxs;
    Ok(())
}

fn format_vec(v: &Vec3) -> String {
    let f = |x: f32| {
        if x == x.round() {
            format!("{}", x as i32)
        } else {
            format!("{}", x)
        }
    };
    format!("{} {} {}", f(v[0]), f(v[1]), f(v[2]))
}

#[derive(Debug, Default)]
struct ParseCounts {
    brushes: usize,
    origin_brushes: usize,
    area_portals: usize,
}

fn parse_entity(ctx: &mut CompilationContext, script: &mut Script, counts: &mut ParseCounts) -> Result<bool> {
    let Some(token) = script.get_token(true) else {
        return Ok(false);
    };
    if token != "{" {
        return Err(script.error(format!("ParseEntity: {{ not found, found {}", token)));
    }

    let entity_num = ctx.entities.len();
    let mut ent = MapEntity::default();
    let mut brushes: Vec<MapBrush> = Vec::new();
    let mut brush_num = 0;

    loop {
        let token = script.get_token(true).ok_or_else(|| script.error("ParseEntity: EOF without closing brace"))?;
        if token == "}" {
            break;
        }
        if token == "{" {
            if let Some(b) = parse_brush(ctx, script, entity_num, brush_num)? {
                brushes.push(b);
            }
            brush_num += 1;
        } else {
            let value = script.get_token(false).ok_or_else(|| script.error(format!("key {} has no value", token)))?;
            ent.set_key_value(&token, &value);
        }
    }

    // origin brushes set the model origin and are removed
    let mut origin_brushes = Vec::new();
    brushes.retain(|b| {
        if b.contents & CONTENTS_ORIGIN != 0 {
            origin_brushes.push((b.mins, b.maxs));
            false
        } else {
            true
        }
    });
    if let Some((mins, maxs)) = origin_brushes.last() {
        if entity_num == 0 {
            return Err(script.error("origin brushes not allowed in world"));
        }
        let origin = vector_scale(&vector_add(mins, maxs), 0.5);
        ent.set_key_value("origin", &format_vec(&origin));
        counts.origin_brushes += origin_brushes.len();
    }

    ent.origin = ent.vector_for_key("origin");

    // brush entities with an origin keep their brushes in model space
    if entity_num != 0 && ent.origin != VEC3_ORIGIN {
        for b in &mut brushes {
            adjust_brush_for_origin(ctx, b, &ent.origin)?;
        }
    }

    // area portals are moved into the world
    let mut to_world = false;
    if ent.classname() == "func_areaportal" {
        if brushes.len() != 1 {
            return Err(script.error(format!(
                "Entity {}: func_areaportal can only be a single brush",
                entity_num
            )));
        }
        brushes[0].contents = CONTENTS_AREAPORTAL;
        counts.area_portals += 1;
        ent.set_key_value("style", &counts.area_portals.to_string());
        to_world = true;
    }

    counts.brushes += brushes.len();
    for b in brushes {
        let index = ctx.map_brushes.len();
        ctx.map_brushes.push(b);
        if to_world {
            if let Some(world) = ctx.entities.first_mut() {
                world.brushes.push(index);
                continue;
            }
        }
        ent.brushes.push(index);
    }

    ctx.entities.push(ent);
    Ok(true)
}

/// Parse map source text into the context's entity and brush lists.
pub fn load_map_source(ctx: &mut CompilationContext, text: &str) -> Result<()> {
    let mut script = Script::new(text);
    let mut counts = ParseCounts::default();
    while parse_entity(ctx, &mut script, &mut counts)? {}

    if ctx.entities.is_empty() {
        return Err(script.error("map has no entities"));
    }

    let mut mins = [0.0; 3];
    let mut maxs = [0.0; 3];
    clear_bounds(&mut mins, &mut maxs);
    for &b in &ctx.entities[0].brushes {
        add_point_to_bounds(&ctx.map_brushes[b].mins, &mut mins, &mut maxs);
        add_point_to_bounds(&ctx.map_brushes[b].maxs, &mut mins, &mut maxs);
    }

    info!("{:5} brushes", counts.brushes);
    info!("{:5} origin brushes", counts.origin_brushes);
    info!("{:5} areaportals", counts.area_portals);
    info!("{:5} entities", ctx.entities.len());
    info!("{:5} planes", ctx.planes.len());
    info!("{:5} texinfo", ctx.texinfo.len());
    if !ctx.entities[0].brushes.is_empty() {
        info!("size: {} to {}", format_vec(&mins), format_vec(&maxs));
    }
    Ok(())
}

pub fn load_map_file(ctx: &mut CompilationContext, path: &Path) -> Result<()> {
    info!("--- LoadMapFile ---");
    info!("{}", path.display());
    let text = std::fs::read_to_string(path)?;
    load_map_source(ctx, &text)
}
