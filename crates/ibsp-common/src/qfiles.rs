// qfiles.rs — BSP file format: header, lump directory, record layouts
//
// All fields are little-endian int32/float32. Lumps follow the header in
// directory order and are padded to 4-byte boundaries.

use std::path::Path;

use log::{debug, warn};
use rayon::prelude::*;

use crate::common::{BspError, Result};
use crate::q_shared::Vec3;

// ============================================================
// BSP file format
// ============================================================

/// BSP magic: "IBSP" in little-endian
pub const IDBSPHEADER: i32 =
    (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'I' as i32;
pub const BSPVERSION: i32 = 71;

// Upper design bounds
pub const MAX_MAP_MODELS: usize = 1024;
pub const MAX_MAP_BRUSHES: usize = 32768;
pub const MAX_MAP_ENTITIES: usize = 4096;
pub const MAX_MAP_ENTSTRING: usize = 0x100000;
pub const MAX_MAP_TEXINFO: usize = 8192;
pub const MAX_MAP_AREAS: usize = 256;
pub const MAX_MAP_PLANES: usize = 0x20000;
pub const MAX_MAP_NODES: usize = 0x20000;
pub const MAX_MAP_BRUSHSIDES: usize = 0x20000;
pub const MAX_MAP_LEAFS: usize = 0x20000;
pub const MAX_MAP_VERTS: usize = 0x80000;
pub const MAX_MAP_ELEMENTS: usize = 0x80000;
pub const MAX_MAP_DRAW_ELEMENTS: usize = 0x100000;
pub const MAX_MAP_FACES: usize = 0x20000;
pub const MAX_MAP_LEAFFACES: usize = 0x20000;
pub const MAX_MAP_LEAFBRUSHES: usize = 0x40000;
pub const MAX_MAP_PORTALS: usize = 0x20000;
pub const MAX_MAP_LIGHTING: usize = 0x800000;
pub const MAX_MAP_LIGHTGRID: usize = 0x800000;
pub const MAX_MAP_VISIBILITY: usize = 0x200000;

pub const MAX_TEXNAME: usize = 64;

// Lump indices
pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_TEXINFO: usize = 1;
pub const LUMP_PLANES: usize = 2;
pub const LUMP_BRUSHSIDES: usize = 3;
pub const LUMP_BRUSHES: usize = 4;
pub const LUMP_VERTEXES: usize = 5;
pub const LUMP_ELEMENTS: usize = 6;
pub const LUMP_FACES: usize = 7;
pub const LUMP_DRAWELEMENTS: usize = 8;
pub const LUMP_NODES: usize = 9;
pub const LUMP_LEAFBRUSHES: usize = 10;
pub const LUMP_LEAFFACES: usize = 11;
pub const LUMP_LEAFS: usize = 12;
pub const LUMP_MODELS: usize = 13;
pub const LUMP_LIGHTMAP: usize = 14;
pub const LUMP_LIGHTGRID: usize = 15;
pub const LUMP_VISIBILITY: usize = 16;
pub const HEADER_LUMPS: usize = 17;

pub const LUMP_NAMES: [&str; HEADER_LUMPS] = [
    "entities",
    "texinfo",
    "planes",
    "brushsides",
    "brushes",
    "vertexes",
    "elements",
    "faces",
    "drawelements",
    "nodes",
    "leafbrushes",
    "leaffaces",
    "leafs",
    "models",
    "lightmap",
    "lightgrid",
    "visibility",
];

pub const HEADER_SIZE: usize = 8 + HEADER_LUMPS * 8;

/// Lumps with at least this many records are decoded on the rayon pool.
const PARALLEL_LUMP_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct DTexinfo {
    pub name: [u8; MAX_TEXNAME],
    pub surface_flags: i32,
    pub content_flags: i32,
}

impl Default for DTexinfo {
    fn default() -> Self {
        Self { name: [0; MAX_TEXNAME], surface_flags: 0, content_flags: 0 }
    }
}

impl DTexinfo {
    pub fn new(name: &str, surface_flags: i32, content_flags: i32) -> Self {
        let mut t = DTexinfo { surface_flags, content_flags, ..Default::default() };
        let mut n = name.len().min(MAX_TEXNAME - 1);
        while !name.is_char_boundary(n) {
            n -= 1;
        }
        if n < name.len() {
            warn!("texture name {} truncated to {} bytes", name, n);
        }
        t.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        t
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_TEXNAME);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DPlane {
    pub normal: [f32; 3],
    pub dist: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DBrushSide {
    pub plane_num: i32, // positive plane side faces out of the leaf
    pub texinfo: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DBrush {
    pub first_side: i32,
    pub num_sides: i32,
    pub contents: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DVertex {
    pub point: [f32; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DFace {
    pub plane_num: i32,
    pub texinfo: i32,
    pub first_element: i32, // polygon outline, indexes into the vertex lump
    pub num_elements: i32,
    pub first_draw_element: i32, // triangle list, indexes relative to the outline
    pub num_draw_elements: i32,
    pub contents: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DNode {
    pub plane_num: i32,
    pub children: [i32; 2], // negative numbers are -(leafs+1), not nodes
    pub mins: [i32; 3],     // for frustum culling
    pub maxs: [i32; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DLeaf {
    pub contents: i32,
    pub cluster: i32,
    pub area: i32,
    pub mins: [i32; 3],
    pub maxs: [i32; 3],
    pub first_leaf_face: i32,
    pub num_leaf_faces: i32,
    pub first_leaf_brush: i32,
    pub num_leaf_brushes: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct DModel {
    pub mins: [f32; 3],
    pub maxs: [f32; 3],
    pub head_node: i32,
    pub first_face: i32,
    pub num_faces: i32,
    pub first_brush: i32,
    pub num_brushes: i32,
}

// ============================================================
// Record encoding
// ============================================================

fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_vec3(data: &[u8], offset: usize) -> Vec3 {
    [
        read_f32_le(data, offset),
        read_f32_le(data, offset + 4),
        read_f32_le(data, offset + 8),
    ]
}

fn read_ivec3(data: &[u8], offset: usize) -> [i32; 3] {
    [
        read_i32_le(data, offset),
        read_i32_le(data, offset + 4),
        read_i32_le(data, offset + 8),
    ]
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// A fixed-size record stored in one of the array lumps.
pub trait LumpRecord: Sized + Send {
    const SIZE: usize;
    fn read(b: &[u8]) -> Self;
    fn write(&self, out: &mut Vec<u8>);
}

impl LumpRecord for i32 {
    const SIZE: usize = 4;
    fn read(b: &[u8]) -> Self {
        read_i32_le(b, 0)
    }
    fn write(&self, out: &mut Vec<u8>) {
        put_i32(out, *self);
    }
}

impl LumpRecord for DTexinfo {
    const SIZE: usize = 72;
    fn read(b: &[u8]) -> Self {
        let mut name = [0u8; MAX_TEXNAME];
        name.copy_from_slice(&b[..MAX_TEXNAME]);
        DTexinfo {
            name,
            surface_flags: read_i32_le(b, 64),
            content_flags: read_i32_le(b, 68),
        }
    }
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name);
        put_i32(out, self.surface_flags);
        put_i32(out, self.content_flags);
    }
}

impl LumpRecord for DPlane {
    const SIZE: usize = 16;
    fn read(b: &[u8]) -> Self {
        DPlane { normal: read_vec3(b, 0), dist: read_f32_le(b, 12) }
    }
    fn write(&self, out: &mut Vec<u8>) {
        self.normal.iter().for_each(|&v| put_f32(out, v));
        put_f32(out, self.dist);
    }
}

impl LumpRecord for DBrushSide {
    const SIZE: usize = 8;
    fn read(b: &[u8]) -> Self {
        DBrushSide { plane_num: read_i32_le(b, 0), texinfo: read_i32_le(b, 4) }
    }
    fn write(&self, out: &mut Vec<u8>) {
        put_i32(out, self.plane_num);
        put_i32(out, self.texinfo);
    }
}

impl LumpRecord for DBrush {
    const SIZE: usize = 12;
    fn read(b: &[u8]) -> Self {
        DBrush {
            first_side: read_i32_le(b, 0),
            num_sides: read_i32_le(b, 4),
            contents: read_i32_le(b, 8),
        }
    }
    fn write(&self, out: &mut Vec<u8>) {
        put_i32(out, self.first_side);
        put_i32(out, self.num_sides);
        put_i32(out, self.contents);
    }
}

impl LumpRecord for DVertex {
    const SIZE: usize = 12;
    fn read(b: &[u8]) -> Self {
        DVertex { point: read_vec3(b, 0) }
    }
    fn write(&self, out: &mut Vec<u8>) {
        self.point.iter().for_each(|&v| put_f32(out, v));
    }
}

impl LumpRecord for DFace {
    const SIZE: usize = 28;
    fn read(b: &[u8]) -> Self {
        DFace {
            plane_num: read_i32_le(b, 0),
            texinfo: read_i32_le(b, 4),
            first_element: read_i32_le(b, 8),
            num_elements: read_i32_le(b, 12),
            first_draw_element: read_i32_le(b, 16),
            num_draw_elements: read_i32_le(b, 20),
            contents: read_i32_le(b, 24),
        }
    }
    fn write(&self, out: &mut Vec<u8>) {
        put_i32(out, self.plane_num);
        put_i32(out, self.texinfo);
        put_i32(out, self.first_element);
        put_i32(out, self.num_elements);
        put_i32(out, self.first_draw_element);
        put_i32(out, self.num_draw_elements);
        put_i32(out, self.contents);
    }
}

impl LumpRecord for DNode {
    const SIZE: usize = 36;
    fn read(b: &[u8]) -> Self {
        DNode {
            plane_num: read_i32_le(b, 0),
            children: [read_i32_le(b, 4), read_i32_le(b, 8)],
            mins: read_ivec3(b, 12),
            maxs: read_ivec3(b, 24),
        }
    }
    fn write(&self, out: &mut Vec<u8>) {
        put_i32(out, self.plane_num);
        put_i32(out, self.children[0]);
        put_i32(out, self.children[1]);
        self.mins.iter().chain(self.maxs.iter()).for_each(|&v| put_i32(out, v));
    }
}

impl LumpRecord for DLeaf {
    const SIZE: usize = 52;
    fn read(b: &[u8]) -> Self {
        DLeaf {
            contents: read_i32_le(b, 0),
            cluster: read_i32_le(b, 4),
            area: read_i32_le(b, 8),
            mins: read_ivec3(b, 12),
            maxs: read_ivec3(b, 24),
            first_leaf_face: read_i32_le(b, 36),
            num_leaf_faces: read_i32_le(b, 40),
            first_leaf_brush: read_i32_le(b, 44),
            num_leaf_brushes: read_i32_le(b, 48),
        }
    }
    fn write(&self, out: &mut Vec<u8>) {
        put_i32(out, self.contents);
        put_i32(out, self.cluster);
        put_i32(out, self.area);
        self.mins.iter().chain(self.maxs.iter()).for_each(|&v| put_i32(out, v));
        put_i32(out, self.first_leaf_face);
        put_i32(out, self.num_leaf_faces);
        put_i32(out, self.first_leaf_brush);
        put_i32(out, self.num_leaf_brushes);
    }
}

impl LumpRecord for DModel {
    const SIZE: usize = 44;
    fn read(b: &[u8]) -> Self {
        DModel {
            mins: read_vec3(b, 0),
            maxs: read_vec3(b, 12),
            head_node: read_i32_le(b, 24),
            first_face: read_i32_le(b, 28),
            num_faces: read_i32_le(b, 32),
            first_brush: read_i32_le(b, 36),
            num_brushes: read_i32_le(b, 40),
        }
    }
    fn write(&self, out: &mut Vec<u8>) {
        self.mins.iter().chain(self.maxs.iter()).for_each(|&v| put_f32(out, v));
        put_i32(out, self.head_node);
        put_i32(out, self.first_face);
        put_i32(out, self.num_faces);
        put_i32(out, self.first_brush);
        put_i32(out, self.num_brushes);
    }
}

// ============================================================
// BspFile — the whole file in memory
// ============================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BspFile {
    pub entity_string: String,
    pub texinfo: Vec<DTexinfo>,
    pub planes: Vec<DPlane>,
    pub brush_sides: Vec<DBrushSide>,
    pub brushes: Vec<DBrush>,
    pub vertexes: Vec<DVertex>,
    pub elements: Vec<i32>,
    pub faces: Vec<DFace>,
    pub draw_elements: Vec<i32>,
    pub nodes: Vec<DNode>,
    pub leaf_brushes: Vec<i32>,
    pub leaf_faces: Vec<i32>,
    pub leafs: Vec<DLeaf>,
    pub models: Vec<DModel>,
    pub lightmap: Vec<u8>,
    pub lightgrid: Vec<u8>,
    pub visibility: Vec<u8>,
}

fn lump_slice<'a>(data: &'a [u8], header: &[Lump; HEADER_LUMPS], lump: usize) -> Result<&'a [u8]> {
    let l = header[lump];
    let ofs = usize::try_from(l.fileofs);
    let len = usize::try_from(l.filelen);
    match (ofs, len) {
        (Ok(ofs), Ok(len)) if ofs.checked_add(len).is_some_and(|end| end <= data.len()) => {
            Ok(&data[ofs..ofs + len])
        }
        _ => Err(BspError::LumpBounds {
            lump: LUMP_NAMES[lump],
            ofs: l.fileofs,
            len: l.filelen,
        }),
    }
}

fn copy_lump<T: LumpRecord>(
    data: &[u8],
    header: &[Lump; HEADER_LUMPS],
    lump: usize,
    max: usize,
) -> Result<Vec<T>> {
    let bytes = lump_slice(data, header, lump)?;
    if bytes.len() % T::SIZE != 0 {
        return Err(BspError::FunnyLumpSize {
            lump: LUMP_NAMES[lump],
            len: bytes.len(),
            record: T::SIZE,
        });
    }
    let count = bytes.len() / T::SIZE;
    if count > max {
        return Err(BspError::LimitExceeded { table: LUMP_NAMES[lump], max });
    }

    let records: Vec<T> = if count >= PARALLEL_LUMP_THRESHOLD {
        bytes.par_chunks_exact(T::SIZE).map(T::read).collect()
    } else {
        bytes.chunks_exact(T::SIZE).map(T::read).collect()
    };
    Ok(records)
}

fn copy_blob(data: &[u8], header: &[Lump; HEADER_LUMPS], lump: usize, max: usize) -> Result<Vec<u8>> {
    let bytes = lump_slice(data, header, lump)?;
    if bytes.len() > max {
        return Err(BspError::LimitExceeded { table: LUMP_NAMES[lump], max });
    }
    Ok(bytes.to_vec())
}

fn add_lump<T: LumpRecord>(out: &mut Vec<u8>, header: &mut [Lump; HEADER_LUMPS], lump: usize, items: &[T]) {
    let start = out.len();
    out.reserve(items.len() * T::SIZE);
    for item in items {
        item.write(out);
    }
    finish_lump(out, header, lump, start);
}

fn add_blob(out: &mut Vec<u8>, header: &mut [Lump; HEADER_LUMPS], lump: usize, bytes: &[u8]) {
    let start = out.len();
    out.extend_from_slice(bytes);
    finish_lump(out, header, lump, start);
}

fn finish_lump(out: &mut Vec<u8>, header: &mut [Lump; HEADER_LUMPS], lump: usize, start: usize) {
    header[lump] = Lump { fileofs: start as i32, filelen: (out.len() - start) as i32 };
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

impl BspFile {
    /// Decode a BSP image. `name` is only used in diagnostics.
    pub fn from_bytes(data: &[u8], name: &str) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(BspError::Truncated { path: name.to_string(), len: data.len() });
        }

        let ident = read_i32_le(data, 0);
        if ident != IDBSPHEADER {
            return Err(BspError::BadMagic { path: name.to_string(), magic: ident });
        }
        let version = read_i32_le(data, 4);
        if version != BSPVERSION {
            return Err(BspError::BadVersion {
                path: name.to_string(),
                found: version,
                expected: BSPVERSION,
            });
        }

        let mut header = [Lump::default(); HEADER_LUMPS];
        for (i, l) in header.iter_mut().enumerate() {
            l.fileofs = read_i32_le(data, 8 + i * 8);
            l.filelen = read_i32_le(data, 12 + i * 8);
        }

        let ents = copy_blob(data, &header, LUMP_ENTITIES, MAX_MAP_ENTSTRING)?;
        let ents_end = ents.iter().position(|&b| b == 0).unwrap_or(ents.len());
        let entity_string = String::from_utf8_lossy(&ents[..ents_end]).into_owned();

        let bsp = BspFile {
            entity_string,
            texinfo: copy_lump(data, &header, LUMP_TEXINFO, MAX_MAP_TEXINFO)?,
            planes: copy_lump(data, &header, LUMP_PLANES, MAX_MAP_PLANES)?,
            brush_sides: copy_lump(data, &header, LUMP_BRUSHSIDES, MAX_MAP_BRUSHSIDES)?,
            brushes: copy_lump(data, &header, LUMP_BRUSHES, MAX_MAP_BRUSHES)?,
            vertexes: copy_lump(data, &header, LUMP_VERTEXES, MAX_MAP_VERTS)?,
            elements: copy_lump(data, &header, LUMP_ELEMENTS, MAX_MAP_ELEMENTS)?,
            faces: copy_lump(data, &header, LUMP_FACES, MAX_MAP_FACES)?,
            draw_elements: copy_lump(data, &header, LUMP_DRAWELEMENTS, MAX_MAP_DRAW_ELEMENTS)?,
            nodes: copy_lump(data, &header, LUMP_NODES, MAX_MAP_NODES)?,
            leaf_brushes: copy_lump(data, &header, LUMP_LEAFBRUSHES, MAX_MAP_LEAFBRUSHES)?,
            leaf_faces: copy_lump(data, &header, LUMP_LEAFFACES, MAX_MAP_LEAFFACES)?,
            leafs: copy_lump(data, &header, LUMP_LEAFS, MAX_MAP_LEAFS)?,
            models: copy_lump(data, &header, LUMP_MODELS, MAX_MAP_MODELS)?,
            lightmap: copy_blob(data, &header, LUMP_LIGHTMAP, MAX_MAP_LIGHTING)?,
            lightgrid: copy_blob(data, &header, LUMP_LIGHTGRID, MAX_MAP_LIGHTGRID)?,
            visibility: copy_blob(data, &header, LUMP_VISIBILITY, MAX_MAP_VISIBILITY)?,
        };

        debug!(
            "{}: {} planes, {} nodes, {} leafs, {} brushes, {} models",
            name,
            bsp.planes.len(),
            bsp.nodes.len(),
            bsp.leafs.len(),
            bsp.brushes.len(),
            bsp.models.len()
        );
        Ok(bsp)
    }

    /// Encode into a complete file image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = [Lump::default(); HEADER_LUMPS];
        let mut out = vec![0u8; HEADER_SIZE];

        let mut ents = self.entity_string.as_bytes().to_vec();
        ents.push(0);
        add_blob(&mut out, &mut header, LUMP_ENTITIES, &ents);
        add_lump(&mut out, &mut header, LUMP_TEXINFO, &self.texinfo);
        add_lump(&mut out, &mut header, LUMP_PLANES, &self.planes);
        add_lump(&mut out, &mut header, LUMP_BRUSHSIDES, &self.brush_sides);
        add_lump(&mut out, &mut header, LUMP_BRUSHES, &self.brushes);
        add_lump(&mut out, &mut header, LUMP_VERTEXES, &self.vertexes);
        add_lump(&mut out, &mut header, LUMP_ELEMENTS, &self.elements);
        add_lump(&mut out, &mut header, LUMP_FACES, &self.faces);
        add_lump(&mut out, &mut header, LUMP_DRAWELEMENTS, &self.draw_elements);
        add_lump(&mut out, &mut header, LUMP_NODES, &self.nodes);
        add_lump(&mut out, &mut header, LUMP_LEAFBRUSHES, &self.leaf_brushes);
        add_lump(&mut out, &mut header, LUMP_LEAFFACES, &self.leaf_faces);
        add_lump(&mut out, &mut header, LUMP_LEAFS, &self.leafs);
        add_lump(&mut out, &mut header, LUMP_MODELS, &self.models);
        add_blob(&mut out, &mut header, LUMP_LIGHTMAP, &self.lightmap);
        add_blob(&mut out, &mut header, LUMP_LIGHTGRID, &self.lightgrid);
        add_blob(&mut out, &mut header, LUMP_VISIBILITY, &self.visibility);

        out[0..4].copy_from_slice(&IDBSPHEADER.to_le_bytes());
        out[4..8].copy_from_slice(&BSPVERSION.to_le_bytes());
        for (i, l) in header.iter().enumerate() {
            let at = 8 + i * 8;
            out[at..at + 4].copy_from_slice(&l.fileofs.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&l.filelen.to_le_bytes());
        }
        out
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data, &path.display().to_string())
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
