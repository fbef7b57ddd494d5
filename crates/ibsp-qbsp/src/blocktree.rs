// blocktree.rs — World split into an x/y grid of blocks built in parallel

use log::{debug, info};
use rayon::prelude::*;

use ibsp_common::common::Result;
use ibsp_common::q_shared::{add_point_to_bounds, clear_bounds, Vec3};

use crate::brush::{brush_from_bounds, BspBrush, TEXINFO_NODE};
use crate::context::PlaneTable;
use crate::tree::{build_tree, Node, NodeId, Tree};

/// Grid coordinates covered by the brushes, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRange {
    xl: i32,
    yl: i32,
    xh: i32,
    yh: i32,
}

impl BlockRange {
    fn width(&self) -> usize {
        (self.xh - self.xl + 1) as usize
    }

    fn height(&self) -> usize {
        (self.yh - self.yl + 1) as usize
    }

    fn index(&self, x: i32, y: i32) -> usize {
        (x - self.xl) as usize * self.height() + (y - self.yl) as usize
    }
}

/// One grid cell, ready to be built on its own.
struct Block {
    mins: Vec3,
    maxs: Vec3,
    /// Clip planes for the low and high x and y faces of the cell.
    min_planes: [i32; 2],
    max_planes: [i32; 2],
    volume: BspBrush,
}

/// Cut a brush down to the x/y extent of a block. Sides left lying on the
/// block faces are spent as splitters.
fn clip_brush_to_block(brush: &BspBrush, block: &Block, planes: &PlaneTable, microvolume: f32) -> Option<BspBrush> {
    let mut b = brush.clone();
    for i in 0..2 {
        if b.maxs[i] > block.maxs[i] {
            let (_, back) = b.split(block.max_planes[i], planes, microvolume);
            b = back?;
        }
        if b.mins[i] < block.mins[i] {
            let (front, _) = b.split(block.min_planes[i], planes, microvolume);
            b = front?;
        }
    }

    // remove any colinear faces
    for s in &mut b.sides {
        let p = s.plane_num & !1;
        if block.min_planes.contains(&p) || block.max_planes.contains(&p) {
            s.texinfo = TEXINFO_NODE;
            s.visible = false;
            s.on_node = true;
        }
    }
    Some(b)
}

fn overlaps(b: &BspBrush, block: &Block) -> bool {
    (0..2).all(|i| b.mins[i] < block.maxs[i] && b.maxs[i] > block.mins[i])
}

/// Link the grid cells under axial separator nodes, halving the larger
/// range each time. The upper half is always the front child.
fn block_tree_r(
    tree: &mut Tree,
    range: BlockRange,
    full: &BlockRange,
    cells: &mut [Option<Tree>],
    grid_planes: &[Vec<i32>; 2],
    parent: Option<NodeId>,
) -> NodeId {
    if range.xl == range.xh && range.yl == range.yh {
        return match cells[full.index(range.xl, range.yl)].take() {
            Some(sub) => tree.graft(sub, parent),
            None => tree.alloc_node(Node { parent, ..Node::leaf(0) }),
        };
    }

    let node = tree.alloc_node(Node { parent, ..Default::default() });
    let (plane_num, front, back) = if range.xh - range.xl > range.yh - range.yl {
        let mid = range.xl + (range.xh - range.xl) / 2 + 1;
        (
            grid_planes[0][(mid - full.xl) as usize],
            BlockRange { xl: mid, ..range },
            BlockRange { xh: mid - 1, ..range },
        )
    } else {
        let mid = range.yl + (range.yh - range.yl) / 2 + 1;
        (
            grid_planes[1][(mid - full.yl) as usize],
            BlockRange { yl: mid, ..range },
            BlockRange { yh: mid - 1, ..range },
        )
    };

    let f = block_tree_r(tree, front, full, cells, grid_planes, Some(node));
    let b = block_tree_r(tree, back, full, cells, grid_planes, Some(node));
    let n = &mut tree.nodes[node];
    n.plane_num = plane_num;
    n.children = [f, b];
    node
}

/// Build a model's tree one grid block at a time. Blocks are clipped and
/// partitioned in parallel, then stitched together under a grid of axial
/// nodes, which leaves every point in the same kind of leaf as a single
/// build would.
pub fn block_tree(brushes: Vec<BspBrush>, planes: &mut PlaneTable, blocksize: f32, microvolume: f32) -> Result<Tree> {
    let mut mins = [0.0; 3];
    let mut maxs = [0.0; 3];
    clear_bounds(&mut mins, &mut maxs);
    for b in &brushes {
        add_point_to_bounds(&b.mins, &mut mins, &mut maxs);
        add_point_to_bounds(&b.maxs, &mut mins, &mut maxs);
    }

    if brushes.is_empty() {
        return Ok(Tree::single_leaf(0));
    }

    let full = BlockRange {
        xl: (mins[0] / blocksize).floor() as i32,
        yl: (mins[1] / blocksize).floor() as i32,
        xh: ((maxs[0] / blocksize).ceil() as i32 - 1).max((mins[0] / blocksize).floor() as i32),
        yh: ((maxs[1] / blocksize).ceil() as i32 - 1).max((mins[1] / blocksize).floor() as i32),
    };

    // every plane the parallel phase needs is created up front
    let mut grid_planes: [Vec<i32>; 2] = [Vec::new(), Vec::new()];
    for (axis, (lo, hi)) in [(full.xl, full.xh), (full.yl, full.yh)].into_iter().enumerate() {
        let mut normal = [0.0; 3];
        normal[axis] = 1.0;
        for g in lo..=hi + 1 {
            grid_planes[axis].push(planes.find_float_plane(&normal, g as f32 * blocksize)?);
        }
    }

    let mut blocks = Vec::with_capacity(full.width() * full.height());
    for x in full.xl..=full.xh {
        for y in full.yl..=full.yh {
            let bmins = [x as f32 * blocksize, y as f32 * blocksize, mins[2] - 1.0];
            let bmaxs = [(x + 1) as f32 * blocksize, (y + 1) as f32 * blocksize, maxs[2] + 1.0];
            let gx = (x - full.xl) as usize;
            let gy = (y - full.yl) as usize;
            blocks.push(Block {
                mins: bmins,
                maxs: bmaxs,
                min_planes: [grid_planes[0][gx], grid_planes[1][gy]],
                max_planes: [grid_planes[0][gx + 1], grid_planes[1][gy + 1]],
                volume: brush_from_bounds(&bmins, &bmaxs, planes)?,
            });
        }
    }
    info!("{:5} blocks", blocks.len());

    let shared: &PlaneTable = planes;
    let mut cells: Vec<Option<Tree>> = blocks
        .into_par_iter()
        .map(|block| {
            let list: Vec<BspBrush> = brushes
                .iter()
                .filter(|b| overlaps(b, &block))
                .filter_map(|b| clip_brush_to_block(b, &block, shared, microvolume))
                .collect();
            if list.is_empty() {
                return None;
            }
            Some(build_tree(list, block.volume, shared, microvolume))
        })
        .collect();

    let mut tree = Tree::default();
    tree.headnode = block_tree_r(&mut tree, full, &full, &mut cells, &grid_planes, None);
    tree.mins = mins;
    tree.maxs = maxs;
    debug!("{:5} nodes after blocks", tree.nodes.len());
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibsp_common::q_shared::{CONTENTS_SOLID, CONTENTS_WATER};
    use rand::Rng;

    fn solid_box(planes: &mut PlaneTable, mins: Vec3, maxs: Vec3, contents: i32) -> BspBrush {
        let mut b = brush_from_bounds(&mins, &maxs, planes).unwrap();
        b.contents = contents;
        for s in &mut b.sides {
            s.visible = true;
            s.texinfo = 0;
        }
        b
    }

    fn inside(b: &BspBrush, p: &Vec3) -> bool {
        (0..3).all(|i| p[i] > b.mins[i] && p[i] < b.maxs[i])
    }

    #[test]
    fn ranges_cover_brush_bounds() {
        let mut planes = PlaneTable::default();
        let brushes = vec![solid_box(&mut planes, [-100.0, -10.0, 0.0], [300.0, 10.0, 16.0], CONTENTS_SOLID)];
        let tree = block_tree(brushes, &mut planes, 128.0, 0.125).unwrap();
        // x spans four cells, y two, so three x and one y separator
        let grid = tree.nodes.iter().filter(|n| {
            !n.is_leaf() && planes.get(n.plane_num).plane_type < 2 && planes.get(n.plane_num).dist % 128.0 == 0.0
        });
        assert!(grid.count() >= 4);
        for n in &tree.nodes {
            if !n.is_leaf() {
                assert_eq!(n.plane_num & 1, 0);
            }
        }
    }

    #[test]
    fn blocks_agree_with_a_single_build() {
        let mut planes = PlaneTable::default();
        let brushes = vec![
            solid_box(&mut planes, [-200.0, -200.0, -16.0], [200.0, 200.0, 0.0], CONTENTS_SOLID),
            solid_box(&mut planes, [-40.0, 60.0, 0.0], [90.0, 70.0, 64.0], CONTENTS_SOLID),
            solid_box(&mut planes, [100.0, -150.0, 0.0], [180.0, -20.0, 30.0], CONTENTS_WATER),
        ];
        let whole = {
            let volume = brush_from_bounds(&[-201.0, -201.0, -17.0], &[201.0, 201.0, 65.0], &mut planes).unwrap();
            build_tree(brushes.clone(), volume, &planes, 0.125)
        };
        let blocked = block_tree(brushes.clone(), &mut planes, 64.0, 0.125).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let p = [
                rng.gen_range(-199.5..199.5f32),
                rng.gen_range(-199.5..199.5f32),
                rng.gen_range(-15.5..63.5f32),
            ];
            // stay clear of brush faces where rounding decides the side
            if brushes.iter().any(|b| (0..3).any(|i| (p[i] - b.mins[i]).abs() < 0.05 || (p[i] - b.maxs[i]).abs() < 0.05)) {
                continue;
            }
            let expect = brushes.iter().filter(|b| inside(b, &p)).fold(0, |c, b| c | b.contents);
            let a = whole.nodes[whole.leaf_for_point(&p, &planes)].contents;
            let b = blocked.nodes[blocked.leaf_for_point(&p, &planes)].contents;
            assert_eq!(a, expect, "single build at {:?}", p);
            assert_eq!(b, expect, "blocked build at {:?}", p);
        }
    }

    #[test]
    fn empty_world_is_one_leaf() {
        let mut planes = PlaneTable::default();
        let tree = block_tree(Vec::new(), &mut planes, 1024.0, 0.125).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes[tree.headnode].is_leaf());
        assert_eq!(tree.nodes[tree.headnode].contents, 0);
    }

    #[test]
    fn parents_point_back_to_grid_nodes() {
        let mut planes = PlaneTable::default();
        let brushes = vec![solid_box(&mut planes, [0.0, 0.0, 0.0], [256.0, 256.0, 16.0], CONTENTS_SOLID)];
        let tree = block_tree(brushes, &mut planes, 128.0, 0.125).unwrap();
        assert!(tree.nodes[tree.headnode].parent.is_none());
        for (i, n) in tree.nodes.iter().enumerate() {
            if !n.is_leaf() {
                for &c in &n.children {
                    assert_eq!(tree.nodes[c].parent, Some(i));
                }
            }
        }
    }
}
