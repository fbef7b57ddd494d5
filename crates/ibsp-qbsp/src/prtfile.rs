// prtfile.rs — Cluster portal file for the visibility tools

use std::fmt::Write as _;

use log::info;

use ibsp_common::q_shared::{dot_product, CONTENTS_SOLID};

use crate::portals::PortalId;
use crate::tree::{NodeId, Tree};

fn write_float(out: &mut String, f: f32) {
    if (f - f.round()).abs() < 0.001 {
        let _ = write!(out, "{}", f.round() as i32);
    } else {
        let _ = write!(out, "{:.6}", f);
    }
}

/// Portals between two open leafs, each listed once from its front leaf.
fn vis_portals(tree: &Tree) -> Vec<(NodeId, PortalId)> {
    let mut out = Vec::new();
    for leaf in tree.leafs() {
        for &p in &tree.nodes[leaf].portals {
            let portal = &tree.portals[p];
            if portal.nodes[0] != leaf || portal.on_node.is_none() {
                continue;
            }
            if Some(portal.nodes[1]) == tree.outside_node {
                continue;
            }
            let [a, b] = portal.nodes;
            if (tree.nodes[a].contents | tree.nodes[b].contents) & CONTENTS_SOLID != 0 {
                continue;
            }
            out.push((leaf, p));
        }
    }
    out
}

/// The `.prt` text: `PRT1`, the cluster and portal counts, then one line
/// per portal with its point count, the clusters on either side and the
/// winding points. Clusters are listed front first as seen from the
/// winding's own facing.
pub fn portal_file_text(tree: &Tree, num_clusters: usize) -> String {
    let portals = vis_portals(tree);

    let mut out = String::new();
    let _ = writeln!(out, "PRT1");
    let _ = writeln!(out, "{}", num_clusters);
    let _ = writeln!(out, "{}", portals.len());

    for &(_, p) in &portals {
        let portal = &tree.portals[p];
        let w = &portal.winding;
        let c0 = tree.nodes[portal.nodes[0]].cluster;
        let c1 = tree.nodes[portal.nodes[1]].cluster;

        // the winding may face the other way from the portal plane
        let (normal, _) = w.plane();
        if dot_product(&portal.normal, &normal) < 0.99 {
            let _ = write!(out, "{} {} {}", w.len(), c1, c0);
        } else {
            let _ = write!(out, "{} {} {}", w.len(), c0, c1);
        }
        for v in &w.p {
            out.push_str(" (");
            for (i, &c) in v.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_float(&mut out, c);
            }
            out.push(')');
        }
        out.push('\n');
    }

    info!("{:5} vis clusters", num_clusters);
    info!("{:5} vis portals", portals.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brush::{brush_from_bounds, BspBrush};
    use crate::context::CompilationContext;
    use crate::map::load_map_source;
    use crate::map::tests::{box_brush, entity};
    use crate::options::CompileOptions;
    use crate::outside::tests::room;
    use crate::outside::{fill_outside, flood_entities, number_clusters};
    use crate::portals::make_tree_portals;
    use crate::tree::build_tree;

    #[test]
    fn floats_print_as_integers_when_integral() {
        let mut s = String::new();
        write_float(&mut s, 16.0);
        s.push(' ');
        write_float(&mut s, -0.0004);
        s.push(' ');
        write_float(&mut s, 0.5);
        assert_eq!(s, "16 0 0.500000");
    }

    #[test]
    fn pillar_room_portal_file() {
        let mut brushes = room(&[]);
        brushes.push(box_brush([-16.0, -16.0, -128.0], [16.0, 16.0, 128.0], "wall"));
        let text = entity(&[("classname", "worldspawn")], &brushes)
            + &entity(&[("classname", "info_player_start"), ("origin", "64 64 0")], &[]);

        let mut ctx = CompilationContext::new(CompileOptions::default());
        load_map_source(&mut ctx, &text).unwrap();
        let list: Vec<BspBrush> =
            ctx.entities[0].brushes.iter().map(|&i| BspBrush::from_map(&ctx.map_brushes[i], i)).collect();
        let volume = brush_from_bounds(&[-200.0; 3], &[200.0; 3], &mut ctx.planes).unwrap();
        let mut tree = build_tree(list, volume, &ctx.planes, 0.125);
        make_tree_portals(&mut tree, &ctx.planes);
        assert!(flood_entities(&mut tree, &ctx.entities, &ctx.planes).can_fill());
        fill_outside(&mut tree);
        let clusters = number_clusters(&mut tree);

        let prt = portal_file_text(&tree, clusters);
        let mut lines = prt.lines();
        assert_eq!(lines.next(), Some("PRT1"));
        assert_eq!(lines.next().and_then(|l| l.parse::<usize>().ok()), Some(clusters));
        let count: usize = lines.next().and_then(|l| l.parse().ok()).unwrap();
        let rest: Vec<&str> = lines.collect();
        assert_eq!(rest.len(), count);
        // the pillar cuts the room into several open leafs
        assert!(clusters > 1);
        assert!(count > 0);

        for line in rest {
            let mut fields = line.split_whitespace();
            let numpts: usize = fields.next().unwrap().parse().unwrap();
            let c0: i32 = fields.next().unwrap().parse().unwrap();
            let c1: i32 = fields.next().unwrap().parse().unwrap();
            assert!(c0 >= 0 && (c0 as usize) < clusters);
            assert!(c1 >= 0 && (c1 as usize) < clusters);
            assert_ne!(c0, c1);
            assert_eq!(line.matches('(').count(), numpts);
        }
    }
}
