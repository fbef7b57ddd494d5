// writebsp.rs — Flatten compiled trees into BSP lumps

use std::collections::HashMap;

use log::{debug, info};

use ibsp_common::common::{BspError, Result};
use ibsp_common::q_shared::{Vec3, CONTENTS_SOLID};
use ibsp_common::qfiles::*;

use crate::context::CompilationContext;
use crate::faces::{leaf_faces, Face, FaceId};
use crate::map::{MapBrush, MapEntity};
use crate::tree::{NodeId, Tree};

fn check_limit(table: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(BspError::LimitExceeded { table, max });
    }
    Ok(())
}

fn floor_bounds(v: &Vec3) -> [i32; 3] {
    [v[0].floor() as i32, v[1].floor() as i32, v[2].floor() as i32]
}

fn ceil_bounds(v: &Vec3) -> [i32; 3] {
    [v[0].ceil() as i32, v[1].ceil() as i32, v[2].ceil() as i32]
}

/// Accumulates lumps model by model. Leaf 0 is reserved as the solid error
/// leaf, so no real leaf is ever referenced as `-1`.
#[derive(Debug)]
pub struct BspWriter {
    bsp: BspFile,
    /// Welded vertex lookup, keyed on eighth-unit grid coordinates.
    vertex_map: HashMap<[i64; 3], i32>,
    /// Output brush number of each map brush that was written.
    brush_map: HashMap<usize, i32>,
}

impl Default for BspWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BspWriter {
    pub fn new() -> Self {
        let mut bsp = BspFile::default();
        // leave leaf 0 as an error, because leafs are referenced as
        // negative number nodes
        bsp.leafs.push(DLeaf { contents: CONTENTS_SOLID, cluster: -1, ..Default::default() });
        BspWriter { bsp, vertex_map: HashMap::new(), brush_map: HashMap::new() }
    }

    /// Write every entity's brushes, bevels included, grouped per entity so
    /// each model owns a contiguous range. Hint brushes carry no contents
    /// and are left out.
    pub fn emit_brushes(&mut self, map_brushes: &[MapBrush], entities: &[MapEntity]) -> Result<Vec<(i32, i32)>> {
        let mut ranges = Vec::with_capacity(entities.len());
        for ent in entities {
            let first = self.bsp.brushes.len() as i32;
            for &b in &ent.brushes {
                let mb = &map_brushes[b];
                if mb.contents == 0 {
                    continue;
                }
                let first_side = self.bsp.brush_sides.len() as i32;
                for s in &mb.sides {
                    self.bsp.brush_sides.push(DBrushSide { plane_num: s.plane_num, texinfo: s.texinfo });
                }
                self.bsp.brushes.push(DBrush { first_side, num_sides: mb.sides.len() as i32, contents: mb.contents });
                self.brush_map.insert(b, self.bsp.brushes.len() as i32 - 1);
            }
            ranges.push((first, self.bsp.brushes.len() as i32 - first));
        }
        check_limit("MAX_MAP_BRUSHES", self.bsp.brushes.len(), MAX_MAP_BRUSHES)?;
        check_limit("MAX_MAP_BRUSHSIDES", self.bsp.brush_sides.len(), MAX_MAP_BRUSHSIDES)?;
        Ok(ranges)
    }

    fn weld_vertex(&mut self, p: &Vec3) -> Result<i32> {
        let key = [(p[0] * 8.0).round() as i64, (p[1] * 8.0).round() as i64, (p[2] * 8.0).round() as i64];
        if let Some(&v) = self.vertex_map.get(&key) {
            return Ok(v);
        }
        let v = self.bsp.vertexes.len() as i32;
        self.bsp.vertexes.push(DVertex { point: *p });
        check_limit("MAX_MAP_VERTS", self.bsp.vertexes.len(), MAX_MAP_VERTS)?;
        self.vertex_map.insert(key, v);
        Ok(v)
    }

    /// The outline goes to ELEMENTS, a triangle fan over it to
    /// DRAWELEMENTS, numbered relative to the outline.
    fn emit_face(&mut self, f: &Face) -> Result<()> {
        let first_element = self.bsp.elements.len() as i32;
        for p in &f.winding.p {
            let v = self.weld_vertex(p)?;
            self.bsp.elements.push(v);
        }
        let n = f.winding.len() as i32;

        let first_draw_element = self.bsp.draw_elements.len() as i32;
        for i in 1..n - 1 {
            self.bsp.draw_elements.extend_from_slice(&[0, i, i + 1]);
        }

        self.bsp.faces.push(DFace {
            plane_num: f.plane_num,
            texinfo: f.texinfo,
            first_element,
            num_elements: n,
            first_draw_element,
            num_draw_elements: self.bsp.draw_elements.len() as i32 - first_draw_element,
            contents: f.contents,
        });
        check_limit("MAX_MAP_FACES", self.bsp.faces.len(), MAX_MAP_FACES)?;
        check_limit("MAX_MAP_ELEMENTS", self.bsp.elements.len(), MAX_MAP_ELEMENTS)?;
        check_limit("MAX_MAP_DRAW_ELEMENTS", self.bsp.draw_elements.len(), MAX_MAP_DRAW_ELEMENTS)?;
        Ok(())
    }

    fn emit_leaf(&mut self, tree: &Tree, leaf: NodeId, faces: &[Face], face_map: &HashMap<FaceId, i32>) -> Result<i32> {
        let node = &tree.nodes[leaf];

        // write the leafbrushes
        let first_leaf_brush = self.bsp.leaf_brushes.len() as i32;
        let mut seen: Vec<usize> = Vec::new();
        for b in &node.brushes {
            if seen.contains(&b.original) {
                continue;
            }
            seen.push(b.original);
            if let Some(&out) = self.brush_map.get(&b.original) {
                self.bsp.leaf_brushes.push(out);
            }
        }
        check_limit("MAX_MAP_LEAFBRUSHES", self.bsp.leaf_brushes.len(), MAX_MAP_LEAFBRUSHES)?;

        // write the leaffaces
        let first_leaf_face = self.bsp.leaf_faces.len() as i32;
        if node.contents & CONTENTS_SOLID == 0 {
            for f in leaf_faces(tree, leaf, faces) {
                if let Some(&out) = face_map.get(&f) {
                    self.bsp.leaf_faces.push(out);
                }
            }
        }
        check_limit("MAX_MAP_LEAFFACES", self.bsp.leaf_faces.len(), MAX_MAP_LEAFFACES)?;

        self.bsp.leafs.push(DLeaf {
            contents: node.contents,
            cluster: node.cluster,
            area: node.area,
            mins: floor_bounds(&node.mins),
            maxs: ceil_bounds(&node.maxs),
            first_leaf_face,
            num_leaf_faces: self.bsp.leaf_faces.len() as i32 - first_leaf_face,
            first_leaf_brush,
            num_leaf_brushes: self.bsp.leaf_brushes.len() as i32 - first_leaf_brush,
        });
        check_limit("MAX_MAP_LEAFS", self.bsp.leafs.len(), MAX_MAP_LEAFS)?;
        Ok(-(self.bsp.leafs.len() as i32))
    }

    /// Emit a subtree and return its child reference: a node number, or
    /// `-(leaf+1)` for a leaf.
    fn emit_draw_node(
        &mut self,
        tree: &Tree,
        node: NodeId,
        faces: &[Face],
        face_map: &HashMap<FaceId, i32>,
    ) -> Result<i32> {
        let n = &tree.nodes[node];
        if n.is_leaf() {
            return self.emit_leaf(tree, node, faces, face_map);
        }
        assert!(n.plane_num & 1 == 0, "odd planenum {} on node", n.plane_num);

        let num = self.bsp.nodes.len();
        self.bsp.nodes.push(DNode {
            plane_num: n.plane_num,
            children: [0; 2],
            mins: floor_bounds(&n.mins),
            maxs: ceil_bounds(&n.maxs),
        });
        check_limit("MAX_MAP_NODES", self.bsp.nodes.len(), MAX_MAP_NODES)?;

        for i in 0..2 {
            let child = self.emit_draw_node(tree, n.children[i], faces, face_map)?;
            self.bsp.nodes[num].children[i] = child;
        }
        Ok(num as i32)
    }

    /// Write one model: its faces, then its nodes and leafs.
    pub fn emit_model(&mut self, tree: &Tree, faces: &[Face], brushes: (i32, i32)) -> Result<()> {
        let first_face = self.bsp.faces.len() as i32;
        let mut face_map = HashMap::new();
        for (id, f) in faces.iter().enumerate() {
            if !f.is_active() {
                continue;
            }
            face_map.insert(id, self.bsp.faces.len() as i32);
            self.emit_face(f)?;
        }

        let head_node = self.emit_draw_node(tree, tree.headnode, faces, &face_map)?;

        let (mins, maxs) = if tree.mins[0] <= tree.maxs[0] { (tree.mins, tree.maxs) } else { ([0.0; 3], [0.0; 3]) };
        self.bsp.models.push(DModel {
            mins,
            maxs,
            head_node,
            first_face,
            num_faces: self.bsp.faces.len() as i32 - first_face,
            first_brush: brushes.0,
            num_brushes: brushes.1,
        });
        check_limit("MAX_MAP_MODELS", self.bsp.models.len(), MAX_MAP_MODELS)?;

        debug!(
            "model {}: {:5} nodes {:5} leafs {:5} faces",
            self.bsp.models.len() - 1,
            self.bsp.nodes.len(),
            self.bsp.leafs.len(),
            self.bsp.faces.len() - first_face as usize
        );
        Ok(())
    }

    /// Add the shared tables and the entity string and hand back the file.
    pub fn finish(mut self, ctx: &CompilationContext) -> Result<BspFile> {
        check_limit("MAX_MAP_PLANES", ctx.planes.len(), MAX_MAP_PLANES)?;
        self.bsp.planes = ctx.planes.iter().map(|p| DPlane { normal: p.normal, dist: p.dist }).collect();
        check_limit("MAX_MAP_TEXINFO", ctx.texinfo.len(), MAX_MAP_TEXINFO)?;
        self.bsp.texinfo = ctx.texinfo.as_slice().to_vec();

        check_limit("MAX_MAP_ENTITIES", ctx.entities.len(), MAX_MAP_ENTITIES)?;
        self.bsp.entity_string = unparse_entities(&ctx.entities);
        check_limit("MAX_MAP_ENTSTRING", self.bsp.entity_string.len() + 1, MAX_MAP_ENTSTRING)?;

        info!("{:5} models", self.bsp.models.len());
        info!("{:5} nodes", self.bsp.nodes.len());
        info!("{:5} leafs", self.bsp.leafs.len());
        info!("{:5} faces", self.bsp.faces.len());
        info!("{:5} vertexes", self.bsp.vertexes.len());
        info!("{:5} brushes", self.bsp.brushes.len());
        info!("{:5} planes", self.bsp.planes.len());
        Ok(self.bsp)
    }
}

/// Entity text as stored in the ENTITIES lump. Entities without any key
/// pairs left are dropped.
pub fn unparse_entities(entities: &[MapEntity]) -> String {
    let mut out = String::new();
    for ent in entities {
        if ent.epairs.is_empty() {
            continue;
        }
        out.push_str("{\n");
        for (k, v) in &ent.epairs {
            out.push_str(&format!("\"{}\" \"{}\"\n", k, v));
        }
        out.push_str("}\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PlaneTable;
    use ibsp_common::polylib::Winding;

    #[test]
    fn leaf_zero_is_the_error_leaf() {
        let w = BspWriter::new();
        assert_eq!(w.bsp.leafs.len(), 1);
        assert_eq!(w.bsp.leafs[0].contents, CONTENTS_SOLID);
        assert_eq!(w.bsp.leafs[0].cluster, -1);
    }

    #[test]
    fn faces_weld_shared_vertices() {
        let mut planes = PlaneTable::default();
        let pn = planes.find_float_plane(&[0.0, 0.0, 1.0], 0.0).unwrap();
        let quad = |x: f32| Face {
            plane_num: pn,
            winding: Winding::from_points(vec![
                [x, 0.0, 0.0],
                [x, 1.0, 0.0],
                [x + 1.0, 1.0, 0.0],
                [x + 1.0, 0.0, 0.0],
            ]),
            ..Default::default()
        };
        let mut w = BspWriter::new();
        w.emit_face(&quad(0.0)).unwrap();
        w.emit_face(&quad(1.0)).unwrap();
        assert_eq!(w.bsp.vertexes.len(), 6, "the shared edge is welded");
        assert_eq!(w.bsp.elements.len(), 8);
        assert_eq!(w.bsp.draw_elements, vec![0, 1, 2, 0, 2, 3, 0, 1, 2, 0, 2, 3]);
        let f = &w.bsp.faces[1];
        assert_eq!((f.first_element, f.num_elements), (4, 4));
        assert_eq!((f.first_draw_element, f.num_draw_elements), (6, 6));
        assert_eq!(w.bsp.elements[4], w.bsp.elements[3]);
    }

    #[test]
    fn table_overflow_names_the_table() {
        assert!(check_limit("MAX_MAP_PLANES", MAX_MAP_PLANES, MAX_MAP_PLANES).is_ok());
        let err = check_limit("MAX_MAP_PLANES", MAX_MAP_PLANES + 1, MAX_MAP_PLANES).unwrap_err();
        assert!(matches!(err, BspError::LimitExceeded { table: "MAX_MAP_PLANES", max: MAX_MAP_PLANES }));
        assert_eq!(err.to_string(), format!("MAX_MAP_PLANES: more than {} entries", MAX_MAP_PLANES));
    }

    #[test]
    fn near_vertices_weld_on_the_eighth_grid() {
        let mut w = BspWriter::new();
        let a = w.weld_vertex(&[1.0, 2.0, 3.0]).unwrap();
        let b = w.weld_vertex(&[1.01, 2.0, 2.99]).unwrap();
        let c = w.weld_vertex(&[1.125, 2.0, 3.0]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn entity_string_keeps_pairs_in_order() {
        let mut world = MapEntity::default();
        world.set_key_value("classname", "worldspawn");
        world.set_key_value("message", "test");
        let mut door = MapEntity::default();
        door.set_key_value("classname", "func_door");
        door.set_key_value("model", "*1");
        let s = unparse_entities(&[world, MapEntity::default(), door]);
        assert_eq!(
            s,
            "{\n\"classname\" \"worldspawn\"\n\"message\" \"test\"\n}\n{\n\"classname\" \"func_door\"\n\"model\" \"*1\"\n}\n"
        );
    }
}
