// outside.rs — Entity flood, leak trail, outside fill, areas and clusters

use std::collections::VecDeque;
use std::fmt::Write as _;

use log::{debug, info, warn};

use ibsp_common::q_shared::{vector_compare, Vec3, CONTENTS_AREAPORTAL, CONTENTS_SOLID, VEC3_ORIGIN};

use crate::context::PlaneTable;
use crate::map::{MapBrush, MapEntity};
use crate::portals::PortalId;
use crate::tree::{NodeId, Tree};

/// What the entity flood found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FloodResult {
    /// At least one entity sits in an open leaf.
    pub inside: bool,
    /// The flood reached the outside node.
    pub leaked: bool,
}

impl FloodResult {
    /// Filling is only safe when something is inside and the hull is sealed.
    pub fn can_fill(&self) -> bool {
        self.inside && !self.leaked
    }
}

/// The flood can cross a portal unless solid lies on either side.
fn portal_entity_flood(tree: &Tree, p: PortalId) -> bool {
    let [a, b] = tree.portals[p].nodes;
    tree.nodes[a].contents & CONTENTS_SOLID == 0 && tree.nodes[b].contents & CONTENTS_SOLID == 0
}

/// Breadth-first flood from one leaf. `occupied` ends up as the portal
/// distance from the nearest entity plus one.
fn flood_portals(tree: &mut Tree, start: NodeId) {
    let mut queue = VecDeque::new();
    tree.nodes[start].occupied = 1;
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        let dist = tree.nodes[node].occupied;
        for i in 0..tree.nodes[node].portals.len() {
            let p = tree.nodes[node].portals[i];
            let other = tree.portals[p].other(node);
            if tree.nodes[other].occupied != 0 {
                continue;
            }
            if !portal_entity_flood(tree, p) {
                continue;
            }
            tree.nodes[other].occupied = dist + 1;
            queue.push_back(other);
        }
    }
}

fn place_occupant(tree: &mut Tree, origin: &Vec3, occupant: usize, planes: &PlaneTable) -> bool {
    let node = tree.leaf_for_point(origin, planes);
    if tree.nodes[node].contents & CONTENTS_SOLID != 0 {
        return false;
    }
    tree.nodes[node].occupant = Some(occupant);
    if tree.nodes[node].occupied == 0 {
        flood_portals(tree, node);
    }
    true
}

/// Mark every leaf reachable from a point entity. The tree must have its
/// portals built.
pub fn flood_entities(tree: &mut Tree, entities: &[MapEntity], planes: &PlaneTable) -> FloodResult {
    let mut result = FloodResult::default();

    for (r, ent) in entities.iter().enumerate().skip(1) {
        let mut origin = ent.vector_for_key("origin");
        if vector_compare(&origin, &VEC3_ORIGIN) {
            continue;
        }
        // so objects on floor are ok
        origin[2] += 1.0;

        if ent.classname() == "info_player_start" {
            // nudge playerstart around if needed so clipping hulls always
            // have a valid point
            'nudge: for x in [-16.0, 0.0, 16.0] {
                for y in [-16.0, 0.0, 16.0] {
                    let p = [origin[0] + x, origin[1] + y, origin[2]];
                    if place_occupant(tree, &p, r, planes) {
                        result.inside = true;
                        break 'nudge;
                    }
                }
            }
        } else if place_occupant(tree, &origin, r, planes) {
            result.inside = true;
        }
    }

    if let Some(outside) = tree.outside_node {
        result.leaked = tree.nodes[outside].occupied != 0;
    }

    if !result.inside {
        info!("no entities in open -- no filling");
    } else if result.leaked {
        warn!("entity reached from outside -- no filling");
    }
    result
}

/// Path from a flooding entity to the void: the entity origin first, then
/// the centres of the portals crossed on the way out. Empty if the flood
/// never reached the outside.
pub fn leak_trail(tree: &Tree, entities: &[MapEntity]) -> Vec<Vec3> {
    let Some(outside) = tree.outside_node else {
        return Vec::new();
    };
    if tree.nodes[outside].occupied == 0 {
        return Vec::new();
    }

    let mut points = Vec::new();
    let mut node = outside;
    while tree.nodes[node].occupied > 1 {
        let mut next = tree.nodes[node].occupied;
        let mut step = None;
        for &p in &tree.nodes[node].portals {
            let other = tree.portals[p].other(node);
            let o = tree.nodes[other].occupied;
            if o != 0 && o < next {
                next = o;
                step = Some((p, other));
            }
        }
        let Some((p, other)) = step else {
            break;
        };
        points.push(tree.portals[p].winding.center());
        node = other;
    }

    // add the occupant's origin
    if let Some(ent) = tree.nodes[node].occupant.and_then(|e| entities.get(e)) {
        points.push(ent.vector_for_key("origin"));
    }
    points.reverse();
    points
}

/// Text of a `.lin` leak file, one point per line.
pub fn leak_file_text(points: &[Vec3]) -> String {
    let mut out = String::new();
    for p in points {
        let _ = writeln!(out, "{:.6} {:.6} {:.6}", p[0], p[1], p[2]);
    }
    out
}

/// Turn every leaf the flood never reached into solid. Returns the number
/// of leafs filled.
pub fn fill_outside(tree: &mut Tree) -> usize {
    let mut outleafs = 0;
    let mut inleafs = 0;
    for leaf in tree.leafs() {
        let n = &mut tree.nodes[leaf];
        if n.occupied == 0 {
            if n.contents & CONTENTS_SOLID == 0 {
                outleafs += 1;
            }
            n.contents = CONTENTS_SOLID;
        } else {
            inleafs += 1;
        }
    }
    info!("{:5} solid leafs", tree.leafs().len() - inleafs - outleafs);
    info!("{:5} leafs filled", outleafs);
    info!("{:5} inside leafs", inleafs);
    outleafs
}

// ============================================================
// Areas
// ============================================================

/// Entity of the areaportal brush in a leaf.
fn areaportal_entity(tree: &Tree, leaf: NodeId, map_brushes: &[MapBrush]) -> Option<usize> {
    tree.nodes[leaf]
        .brushes
        .iter()
        .map(|b| &map_brushes[b.original])
        .find(|mb| mb.contents & CONTENTS_AREAPORTAL != 0)
        .map(|mb| mb.entity_num)
}

fn is_areaportal(tree: &Tree, leaf: NodeId) -> bool {
    tree.nodes[leaf].contents & CONTENTS_AREAPORTAL != 0
}

fn flood_area(
    tree: &mut Tree,
    start: NodeId,
    area: i32,
    map_brushes: &[MapBrush],
    entities: &mut [MapEntity],
) {
    let outside = tree.outside_node;
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if is_areaportal(tree, node) {
            // this node is part of an area portal
            let Some(e) = areaportal_entity(tree, node, map_brushes) else {
                continue;
            };
            let pa = &mut entities[e].portal_areas;
            // if the current area has already touched this portal, we are done
            if pa[0] == area || pa[1] == area {
                continue;
            }
            // note the current area as bounding the portal
            if pa[1] != 0 {
                warn!("areaportal entity {} touches > 2 areas", e);
                continue;
            }
            if pa[0] != 0 {
                pa[1] = area;
            } else {
                pa[0] = area;
            }
            continue;
        }

        if tree.nodes[node].area != 0 {
            continue; // already got it
        }
        tree.nodes[node].area = area;

        for &p in &tree.nodes[node].portals {
            let other = tree.portals[p].other(node);
            if Some(other) == outside || !portal_entity_flood(tree, p) {
                continue;
            }
            stack.push(other);
        }
    }
}

/// Number the open regions separated by areaportals, 1 based. Every
/// areaportal entity records the two areas it joins, and its leafs take
/// the first of them. Returns the area count.
pub fn flood_areas(tree: &mut Tree, map_brushes: &[MapBrush], entities: &mut [MapEntity]) -> usize {
    let mut areas = 0;
    for leaf in tree.leafs() {
        let n = &tree.nodes[leaf];
        if n.contents & CONTENTS_SOLID != 0 || n.area != 0 || is_areaportal(tree, leaf) {
            continue;
        }
        areas += 1;
        flood_area(tree, leaf, areas, map_brushes, entities);
    }

    // the areaportal leafs themselves belong to the first area they touch
    for leaf in tree.leafs() {
        if !is_areaportal(tree, leaf) {
            continue;
        }
        let Some(e) = areaportal_entity(tree, leaf, map_brushes) else {
            continue;
        };
        let pa = entities[e].portal_areas;
        tree.nodes[leaf].area = pa[0];
        if pa[1] == 0 {
            warn!("areaportal entity {} doesn't touch two areas", e);
        }
    }

    info!("{:5} areas", areas);
    areas as usize
}

/// One cluster per open leaf in front-first order, -1 for solid leafs.
pub fn number_clusters(tree: &mut Tree) -> usize {
    let mut clusters = 0;
    for leaf in tree.leafs() {
        let n = &mut tree.nodes[leaf];
        if n.contents & CONTENTS_SOLID != 0 {
            n.cluster = -1;
        } else {
            n.cluster = clusters;
            clusters += 1;
        }
    }
    debug!("{:5} clusters", clusters);
    clusters as usize
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::brush::{brush_from_bounds, BspBrush};
    use crate::context::CompilationContext;
    use crate::map::load_map_source;
    use crate::map::tests::{box_brush, entity};
    use crate::options::CompileOptions;
    use crate::portals::make_tree_portals;
    use crate::tree::build_tree;

    /// A 256 unit hollow room with walls 16 thick. `skip` leaves walls out
    /// by index: -x, +x, -y, +y, -z, +z.
    pub(crate) fn room(skip: &[usize]) -> Vec<String> {
        let walls = [
            ([-144.0, -144.0, -144.0], [-128.0, 144.0, 144.0]),
            ([128.0, -144.0, -144.0], [144.0, 144.0, 144.0]),
            ([-128.0, -144.0, -144.0], [128.0, -128.0, 144.0]),
            ([-128.0, 128.0, -144.0], [128.0, 144.0, 144.0]),
            ([-128.0, -128.0, -144.0], [128.0, 128.0, -128.0]),
            ([-128.0, -128.0, 128.0], [128.0, 128.0, 144.0]),
        ];
        walls
            .iter()
            .enumerate()
            .filter(|(i, _)| !skip.contains(i))
            .map(|(_, (mins, maxs))| box_brush(*mins, *maxs, "wall"))
            .collect()
    }

    fn build(text: &str) -> (CompilationContext, Tree) {
        let mut ctx = CompilationContext::new(CompileOptions::default());
        load_map_source(&mut ctx, text).unwrap();
        let brushes: Vec<BspBrush> =
            ctx.entities[0].brushes.iter().map(|&i| BspBrush::from_map(&ctx.map_brushes[i], i)).collect();
        let volume = brush_from_bounds(&[-200.0; 3], &[200.0; 3], &mut ctx.planes).unwrap();
        let mut tree = build_tree(brushes, volume, &ctx.planes, 0.125);
        make_tree_portals(&mut tree, &ctx.planes);
        (ctx, tree)
    }

    fn player() -> String {
        entity(&[("classname", "info_player_start"), ("origin", "0 0 0.5")], &[])
    }

    #[test]
    fn sealed_room_does_not_leak() {
        let text = entity(&[("classname", "worldspawn")], &room(&[])) + &player();
        let (ctx, mut tree) = build(&text);
        let r = flood_entities(&mut tree, &ctx.entities, &ctx.planes);
        assert!(r.inside);
        assert!(!r.leaked);
        assert!(r.can_fill());
        assert!(leak_trail(&tree, &ctx.entities).is_empty());

        let filled = fill_outside(&mut tree);
        assert!(filled > 0);
        // only the room interior stays open
        let inside = tree.leaf_for_point(&[0.0, 0.0, 1.0], &ctx.planes);
        assert_eq!(tree.nodes[inside].contents, 0);
        for leaf in tree.leafs() {
            if tree.nodes[leaf].contents == 0 {
                assert_ne!(tree.nodes[leaf].occupied, 0);
            }
        }
        assert_eq!(tree.nodes[tree.leaf_for_point(&[180.0; 3], &ctx.planes)].contents, CONTENTS_SOLID);
    }

    #[test]
    fn room_missing_a_wall_leaks() {
        let text = entity(&[("classname", "worldspawn")], &room(&[3])) + &player();
        let (ctx, mut tree) = build(&text);
        let r = flood_entities(&mut tree, &ctx.entities, &ctx.planes);
        assert!(r.inside);
        assert!(r.leaked);
        assert!(!r.can_fill());

        let trail = leak_trail(&tree, &ctx.entities);
        assert!(trail.len() >= 2);
        assert_eq!(trail[0], [0.0, 0.0, 0.5], "trail starts at the entity");
        let last = trail[trail.len() - 1];
        assert!(last.iter().any(|c| c.abs() > 128.0), "trail ends outside the room: {:?}", last);

        let text = leak_file_text(&trail);
        assert_eq!(text.lines().count(), trail.len());
        assert!(text.starts_with("0.000000 0.000000 0.500000\n"));
    }

    #[test]
    fn entity_inside_solid_does_not_count() {
        let text = entity(&[("classname", "worldspawn")], &room(&[]))
            + &entity(&[("classname", "light"), ("origin", "-136 0 0")], &[]);
        let (ctx, mut tree) = build(&text);
        let r = flood_entities(&mut tree, &ctx.entities, &ctx.planes);
        assert!(!r.inside);
        assert!(!r.leaked);
    }

    #[test]
    fn areaportal_splits_two_areas() {
        // two sealed rooms side by side, joined through a hole in the shared
        // wall that an areaportal plugs
        let mut brushes = room(&[1]);
        brushes.push(box_brush([128.0, -144.0, -144.0], [144.0, -32.0, 144.0], "wall"));
        brushes.push(box_brush([128.0, 32.0, -144.0], [144.0, 144.0, 144.0], "wall"));
        brushes.push(box_brush([128.0, -32.0, -144.0], [144.0, 32.0, -32.0], "wall"));
        brushes.push(box_brush([128.0, -32.0, 32.0], [144.0, 32.0, 144.0], "wall"));
        brushes.push(box_brush([144.0, -144.0, -144.0], [400.0, -128.0, 144.0], "wall"));
        brushes.push(box_brush([144.0, 128.0, -144.0], [400.0, 144.0, 144.0], "wall"));
        brushes.push(box_brush([144.0, -128.0, -144.0], [400.0, 128.0, -128.0], "wall"));
        brushes.push(box_brush([144.0, -128.0, 128.0], [400.0, 128.0, 144.0], "wall"));
        brushes.push(box_brush([400.0, -144.0, -144.0], [416.0, 144.0, 144.0], "wall"));

        let text = entity(&[("classname", "worldspawn")], &brushes)
            + &entity(&[("classname", "func_areaportal")], &[box_brush([128.0, -32.0, -32.0], [144.0, 32.0, 32.0], "wall")])
            + &player();
        let mut ctx = CompilationContext::new(CompileOptions::default());
        load_map_source(&mut ctx, &text).unwrap();
        let brushes: Vec<BspBrush> =
            ctx.entities[0].brushes.iter().map(|&i| BspBrush::from_map(&ctx.map_brushes[i], i)).collect();
        let volume = brush_from_bounds(&[-500.0; 3], &[500.0; 3], &mut ctx.planes).unwrap();
        let mut tree = build_tree(brushes, volume, &ctx.planes, 0.125);
        make_tree_portals(&mut tree, &ctx.planes);

        let r = flood_entities(&mut tree, &ctx.entities, &ctx.planes);
        assert!(r.can_fill());
        fill_outside(&mut tree);

        let areas = flood_areas(&mut tree, &ctx.map_brushes, &mut ctx.entities);
        assert_eq!(areas, 2);
        let a = tree.nodes[tree.leaf_for_point(&[0.0, 0.0, 1.0], &ctx.planes)].area;
        let b = tree.nodes[tree.leaf_for_point(&[272.0, 0.0, 1.0], &ctx.planes)].area;
        assert!(a != 0 && b != 0 && a != b);

        let mut pa = ctx.entities[1].portal_areas;
        pa.sort();
        let mut ab = [a, b];
        ab.sort();
        assert_eq!(pa, ab);
        let portal_leaf = tree.leaf_for_point(&[136.0, 0.0, 0.0], &ctx.planes);
        assert_eq!(tree.nodes[portal_leaf].area, ctx.entities[1].portal_areas[0]);
    }

    #[test]
    fn clusters_skip_solid_leafs() {
        let text = entity(&[("classname", "worldspawn")], &room(&[])) + &player();
        let (ctx, mut tree) = build(&text);
        flood_entities(&mut tree, &ctx.entities, &ctx.planes);
        fill_outside(&mut tree);
        let n = number_clusters(&mut tree);
        assert!(n >= 1);
        let mut seen = Vec::new();
        for leaf in tree.leafs() {
            let node = &tree.nodes[leaf];
            if node.contents & CONTENTS_SOLID != 0 {
                assert_eq!(node.cluster, -1);
            } else {
                assert!(node.cluster >= 0 && (node.cluster as usize) < n);
                assert!(!seen.contains(&node.cluster));
                seen.push(node.cluster);
            }
        }
        assert_eq!(seen.len(), n);
    }
}
