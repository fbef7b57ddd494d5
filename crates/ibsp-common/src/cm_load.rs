// cm_load.rs — Build the runtime clip map from a decoded BSP file

use std::path::Path;

use log::{debug, info};

use crate::cm_local::{CBrush, CBrushSide, CLeaf, CNode, CollisionTree};
use crate::common::{block_checksum, BspError, Result};
use crate::q_shared::{CModel, CPlane, SurfaceFlags, Vec3};
use crate::qfiles::BspFile;

/// Read-only collision data for one level. Shared freely between threads
/// once loaded; every query takes `&self`.
#[derive(Debug, Clone, Default)]
pub struct ClipMap {
    pub name: String,
    pub checksum: u32,

    pub planes: Vec<CPlane>,
    pub nodes: Vec<CNode>,
    pub leafs: Vec<CLeaf>,
    pub leaf_brushes: Vec<usize>,
    pub brushes: Vec<CBrush>,
    pub brush_sides: Vec<CBrushSide>,
    pub models: Vec<CModel>,

    pub entity_string: String,
    pub num_clusters: usize,
    pub num_areas: usize,
}

fn check_index(what: &'static str, index: i32, count: usize) -> Result<usize> {
    if index < 0 || index as usize >= count {
        return Err(BspError::BadIndex { what, index, count });
    }
    Ok(index as usize)
}

fn check_range(what: &'static str, first: i32, num: i32, count: usize) -> Result<(usize, usize)> {
    if first < 0 || num < 0 || first as usize + num as usize > count {
        return Err(BspError::BadIndex { what, index: first.saturating_add(num), count });
    }
    Ok((first as usize, num as usize))
}

fn check_child(child: i32, num_nodes: usize, num_leafs: usize) -> Result<i32> {
    if child >= 0 {
        check_index("node child", child, num_nodes)?;
    } else {
        check_index("leaf child", -1 - child, num_leafs)?;
    }
    Ok(child)
}

impl ClipMap {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data, &path.display().to_string())
    }

    pub fn from_bytes(data: &[u8], name: &str) -> Result<Self> {
        let bsp = BspFile::from_bytes(data, name)?;
        let mut map = Self::from_bsp(&bsp, name)?;
        map.checksum = block_checksum(data);
        info!("loaded {} (checksum {:08x})", name, map.checksum);
        Ok(map)
    }

    /// Convert the file records into runtime form, validating every index
    /// so the tracer never has to.
    pub fn from_bsp(bsp: &BspFile, name: &str) -> Result<Self> {
        if bsp.models.is_empty() {
            return Err(BspError::NoWorldModel);
        }

        let planes: Vec<CPlane> = bsp.planes.iter().map(|p| CPlane::new(p.normal, p.dist)).collect();

        let mut brush_sides = Vec::with_capacity(bsp.brush_sides.len());
        for s in &bsp.brush_sides {
            let plane_idx = check_index("brushside plane", s.plane_num, planes.len())?;
            let surface_flags = if s.texinfo < 0 {
                SurfaceFlags::empty()
            } else {
                let ti = check_index("brushside texinfo", s.texinfo, bsp.texinfo.len())?;
                SurfaceFlags::from_bits_truncate(bsp.texinfo[ti].surface_flags)
            };
            brush_sides.push(CBrushSide { plane_idx, surface_flags });
        }

        let mut brushes = Vec::with_capacity(bsp.brushes.len());
        for b in &bsp.brushes {
            let (first, num) = check_range("brush sides", b.first_side, b.num_sides, brush_sides.len())?;
            brushes.push(CBrush { contents: b.contents, firstbrushside: first, numsides: num });
        }

        let mut leaf_brushes = Vec::with_capacity(bsp.leaf_brushes.len());
        for &lb in &bsp.leaf_brushes {
            leaf_brushes.push(check_index("leafbrush", lb, brushes.len())?);
        }

        let mut leafs = Vec::with_capacity(bsp.leafs.len());
        let mut num_clusters = 0usize;
        let mut num_areas = 0usize;
        for l in &bsp.leafs {
            let (first, num) =
                check_range("leaf brushes", l.first_leaf_brush, l.num_leaf_brushes, leaf_brushes.len())?;
            if l.cluster >= 0 {
                num_clusters = num_clusters.max(l.cluster as usize + 1);
            }
            if l.area >= 0 {
                num_areas = num_areas.max(l.area as usize + 1);
            }
            leafs.push(CLeaf {
                contents: l.contents,
                cluster: l.cluster,
                area: l.area,
                firstleafbrush: first,
                numleafbrushes: num,
            });
        }

        let mut nodes = Vec::with_capacity(bsp.nodes.len());
        for n in &bsp.nodes {
            let plane_idx = check_index("node plane", n.plane_num, planes.len())?;
            let children = [
                check_child(n.children[0], bsp.nodes.len(), leafs.len())?,
                check_child(n.children[1], bsp.nodes.len(), leafs.len())?,
            ];
            nodes.push(CNode { plane_idx, children });
        }

        let mut models = Vec::with_capacity(bsp.models.len());
        for m in &bsp.models {
            check_child(m.head_node, nodes.len(), leafs.len())
                .map_err(|_| BspError::BadHeadnode(m.head_node))?;
            let origin: Vec3 = [
                (m.mins[0] + m.maxs[0]) * 0.5,
                (m.mins[1] + m.maxs[1]) * 0.5,
                (m.mins[2] + m.maxs[2]) * 0.5,
            ];
            models.push(CModel { mins: m.mins, maxs: m.maxs, origin, headnode: m.head_node });
        }

        debug!(
            "{}: {} planes {} nodes {} leafs {} brushes {} models",
            name,
            planes.len(),
            nodes.len(),
            leafs.len(),
            brushes.len(),
            models.len()
        );

        Ok(ClipMap {
            name: name.to_string(),
            checksum: 0,
            planes,
            nodes,
            leafs,
            leaf_brushes,
            brushes,
            brush_sides,
            models,
            entity_string: bsp.entity_string.clone(),
            num_clusters,
            num_areas,
        })
    }

    pub fn num_inline_models(&self) -> usize {
        self.models.len()
    }

    /// Model by number: 0 is the world, brush entities follow.
    pub fn inline_model(&self, num: usize) -> Option<&CModel> {
        self.models.get(num)
    }

    /// Parses the `*N` form brush entities use in their "model" key.
    pub fn inline_model_by_name(&self, name: &str) -> Option<&CModel> {
        let num: usize = name.strip_prefix('*')?.parse().ok()?;
        self.inline_model(num)
    }

    pub fn world_model(&self) -> &CModel {
        // from_bsp guarantees at least one model
        &self.models[0]
    }

    pub fn leaf_contents(&self, leafnum: usize) -> i32 {
        self.leafs[leafnum].contents
    }

    pub fn leaf_cluster(&self, leafnum: usize) -> i32 {
        self.leafs[leafnum].cluster
    }

    pub fn leaf_area(&self, leafnum: usize) -> i32 {
        self.leafs[leafnum].area
    }
}

impl CollisionTree for ClipMap {
    fn planes(&self) -> &[CPlane] {
        &self.planes
    }
    fn nodes(&self) -> &[CNode] {
        &self.nodes
    }
    fn leafs(&self) -> &[CLeaf] {
        &self.leafs
    }
    fn leaf_brushes(&self) -> &[usize] {
        &self.leaf_brushes
    }
    fn brushes(&self) -> &[CBrush] {
        &self.brushes
    }
    fn brush_sides(&self) -> &[CBrushSide] {
        &self.brush_sides
    }
}

// ============================================================
// Test fixtures shared by the cm_* modules
// ============================================================

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::qfiles::*;

    /// A ground plane at z=0 as the only node: empty above, a solid leaf
    /// with no brushes below.
    pub fn ground_bsp() -> BspFile {
        BspFile {
            planes: vec![
                DPlane { normal: [0.0, 0.0, 1.0], dist: 0.0 },
                DPlane { normal: [0.0, 0.0, -1.0], dist: 0.0 },
            ],
            nodes: vec![DNode { plane_num: 0, children: [-1, -2], ..Default::default() }],
            leafs: vec![
                DLeaf { contents: 0, cluster: 0, ..Default::default() },
                DLeaf { contents: 1, cluster: -1, ..Default::default() },
            ],
            models: vec![DModel {
                mins: [-4096.0; 3],
                maxs: [4096.0, 4096.0, 0.0],
                head_node: 0,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn axial_planes(out: &mut Vec<DPlane>, mins: [f32; 3], maxs: [f32; 3]) -> i32 {
        let first = out.len() as i32;
        for axis in 0..3 {
            let mut n = [0.0f32; 3];
            n[axis] = 1.0;
            out.push(DPlane { normal: n, dist: maxs[axis] });
            out.push(DPlane { normal: [-n[0], -n[1], -n[2]], dist: -maxs[axis] });
            out.push(DPlane { normal: n, dist: mins[axis] });
            out.push(DPlane { normal: [-n[0], -n[1], -n[2]], dist: -mins[axis] });
        }
        first
    }

    /// A single solid cube brush from -32..32, carved out of space by its
    /// six planes. Leaf 0 is outside, leaf 1 holds the brush.
    pub fn cube_bsp() -> BspFile {
        let mut planes = Vec::new();
        let first = axial_planes(&mut planes, [-32.0; 3], [32.0; 3]);
        // plane order per axis: +max, -max, +min, -min
        let mut nodes = Vec::new();
        let mut brush_sides = Vec::new();
        for axis in 0..3 {
            let base = first + axis * 4;
            let next = |i: i32| if i < 5 { i + 1 } else { -2 };
            // max face: front (beyond max) is outside
            let i = nodes.len() as i32;
            nodes.push(DNode { plane_num: base, children: [-1, next(i)], ..Default::default() });
            // min face: back (below min) is outside
            let i = nodes.len() as i32;
            nodes.push(DNode { plane_num: base + 2, children: [next(i), -1], ..Default::default() });
            brush_sides.push(DBrushSide { plane_num: base, texinfo: -1 });
            brush_sides.push(DBrushSide { plane_num: base + 3, texinfo: -1 });
        }
        BspFile {
            planes,
            nodes,
            brush_sides,
            brushes: vec![DBrush { first_side: 0, num_sides: 6, contents: 1 }],
            leaf_brushes: vec![0],
            leafs: vec![
                DLeaf { contents: 0, cluster: 0, ..Default::default() },
                DLeaf { contents: 1, cluster: -1, first_leaf_brush: 0, num_leaf_brushes: 1, ..Default::default() },
            ],
            models: vec![DModel { mins: [-32.0; 3], maxs: [32.0; 3], head_node: 0, ..Default::default() }],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn loads_ground_plane() {
        let map = ClipMap::from_bsp(&ground_bsp(), "ground").expect("load");
        assert_eq!(map.nodes.len(), 1);
        assert_eq!(map.leafs.len(), 2);
        assert_eq!(map.planes[0].plane_type, crate::q_shared::PLANE_Z);
        assert_eq!(map.world_model().headnode, 0);
        assert_eq!(map.num_clusters, 1);
    }

    #[test]
    fn loads_from_bytes_with_checksum() {
        let bytes = cube_bsp().to_bytes();
        let map = ClipMap::from_bytes(&bytes, "cube").expect("load");
        assert_eq!(map.checksum, block_checksum(&bytes));
        assert_eq!(map.brushes[0].numsides, 6);
        assert_eq!(map.inline_model_by_name("*0").map(|m| m.headnode), Some(0));
        assert!(map.inline_model_by_name("*7").is_none());
    }

    #[test]
    fn missing_world_model_is_an_error() {
        let mut bsp = ground_bsp();
        bsp.models.clear();
        assert!(matches!(ClipMap::from_bsp(&bsp, "x"), Err(BspError::NoWorldModel)));
    }

    #[test]
    fn bad_child_index_is_rejected() {
        let mut bsp = ground_bsp();
        bsp.nodes[0].children[1] = -9;
        assert!(matches!(ClipMap::from_bsp(&bsp, "x"), Err(BspError::BadIndex { .. })));
    }

    #[test]
    fn bad_model_headnode_is_rejected() {
        let mut bsp = ground_bsp();
        bsp.models[0].head_node = 5;
        assert!(matches!(ClipMap::from_bsp(&bsp, "x"), Err(BspError::BadHeadnode(5))));
    }
}
