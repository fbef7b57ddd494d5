// sv_world.rs -- world query functions
//
// Entity area checking: spatial partitioning via area nodes,
// linking/unlinking entities, box queries, point contents, and tracing.

use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, warn};
use rayon::prelude::*;

use ibsp_common::cm_boxhull::BoxHull;
use ibsp_common::cm_load::ClipMap;
use ibsp_common::cm_test;
use ibsp_common::cm_trace::{self, ModelTransform};
use ibsp_common::common::{BspError, Result};
use ibsp_common::q_shared::*;

// ===============================================================================
// ENTITY AREA CHECKING
// ===============================================================================

const MAX_TOTAL_ENT_LEAFS: usize = 128;
pub const MAX_ENT_CLUSTERS: usize = 16;

/// Tunables for the entity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldConfig {
    /// Depth of the area node grid; 2^(depth+1)-1 nodes are built.
    pub area_depth: usize,
    /// Most entities a single area query will return.
    pub max_area_entities: usize,
    /// Candidate count at which entity clipping fans out across threads.
    pub parallel_threshold: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self { area_depth: 4, max_area_entities: 1024, parallel_threshold: 32 }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ServerFlags: u32 {
        const NOCLIENT    = 0x1; // don't send entity to clients
        const DEADMONSTER = 0x2; // treat as CONTENTS_DEADMONSTER for collision
        const MONSTER     = 0x4; // treat as CONTENTS_MONSTER for collision
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Solid {
    #[default]
    Not, // no interaction with other objects
    Trigger, // only touch when inside, after moving
    Bbox,    // touch on edge
    Bsp,     // bsp clip, touch on edge
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaType {
    Solid,
    Triggers,
}

// ============================================================
// Entity
// ============================================================

#[derive(Debug, Clone)]
pub struct Entity {
    pub inuse: bool,
    pub origin: Vec3,
    pub angles: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub solid: Solid,
    pub svflags: ServerFlags,
    pub modelindex: usize, // inline model for Solid::Bsp
    pub owner: i32,        // ENTITYNUM_NONE when unowned
    pub contents: i32,     // what a Solid::Bbox entity reports when hit

    // maintained by link_entity
    pub size: Vec3,
    pub absmin: Vec3,
    pub absmax: Vec3,
    pub areanum: i32,
    pub areanum2: i32,
    pub num_clusters: i32, // -1 if too many, use headnode
    pub clusternums: [i32; MAX_ENT_CLUSTERS],
    pub headnode: i32, // unused if num_clusters != -1
    pub linkcount: i32,
    area_node: Option<usize>,
}

impl Default for Entity {
    fn default() -> Self {
        Self {
            inuse: false,
            origin: VEC3_ORIGIN,
            angles: VEC3_ORIGIN,
            mins: VEC3_ORIGIN,
            maxs: VEC3_ORIGIN,
            solid: Solid::Not,
            svflags: ServerFlags::empty(),
            modelindex: 0,
            owner: ENTITYNUM_NONE,
            contents: CONTENTS_MONSTER,
            size: VEC3_ORIGIN,
            absmin: VEC3_ORIGIN,
            absmax: VEC3_ORIGIN,
            areanum: 0,
            areanum2: 0,
            num_clusters: 0,
            clusternums: [0; MAX_ENT_CLUSTERS],
            headnode: 0,
            linkcount: 0,
            area_node: None,
        }
    }
}

impl Entity {
    /// A solid box of the given size.
    pub fn bbox(origin: Vec3, mins: Vec3, maxs: Vec3) -> Self {
        Self { inuse: true, origin, mins, maxs, solid: Solid::Bbox, ..Default::default() }
    }

    pub fn is_linked(&self) -> bool {
        self.area_node.is_some()
    }
}

// ============================================================
// Area node (spatial partitioning BSP for entities)
// ============================================================

#[derive(Debug, Clone)]
pub struct AreaNode {
    pub axis: i32, // -1 = leaf node
    pub dist: f32,
    pub children: [usize; 2],
    pub trigger_entities: Vec<usize>,
    pub solid_entities: Vec<usize>,
}

impl Default for AreaNode {
    fn default() -> Self {
        Self {
            axis: -1,
            dist: 0.0,
            children: [usize::MAX; 2],
            trigger_entities: Vec::new(),
            solid_entities: Vec::new(),
        }
    }
}

// ============================================================
// Collision model traits
// ============================================================

/// The collision model functions the world layer needs. Implemented by the
/// loaded map; tests substitute their own.
pub trait CollisionModel: Send + Sync {
    fn num_inline_models(&self) -> usize;
    fn inline_model(&self, num: usize) -> Option<CModel>;
    fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, max_count: usize) -> (Vec<usize>, i32);
    fn leaf_cluster(&self, leafnum: usize) -> i32;
    fn leaf_area(&self, leafnum: usize) -> i32;
    fn point_contents(&self, p: &Vec3, headnode: i32) -> i32;
    fn transformed_point_contents(&self, p: &Vec3, headnode: i32, xform: &ModelTransform) -> i32;
    fn box_trace(&self, start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, headnode: i32, brushmask: i32) -> Trace;
    #[allow(clippy::too_many_arguments)]
    fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: i32,
        xform: &ModelTransform,
    ) -> Trace;
}

impl CollisionModel for ClipMap {
    fn num_inline_models(&self) -> usize {
        ClipMap::num_inline_models(self)
    }

    fn inline_model(&self, num: usize) -> Option<CModel> {
        ClipMap::inline_model(self, num).copied()
    }

    fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, max_count: usize) -> (Vec<usize>, i32) {
        cm_test::box_leafnums(self, mins, maxs, self.world_model().headnode, max_count)
    }

    fn leaf_cluster(&self, leafnum: usize) -> i32 {
        ClipMap::leaf_cluster(self, leafnum)
    }

    fn leaf_area(&self, leafnum: usize) -> i32 {
        ClipMap::leaf_area(self, leafnum)
    }

    fn point_contents(&self, p: &Vec3, headnode: i32) -> i32 {
        cm_test::point_contents(self, p, headnode)
    }

    fn transformed_point_contents(&self, p: &Vec3, headnode: i32, xform: &ModelTransform) -> i32 {
        cm_test::transformed_point_contents(self, p, headnode, xform)
    }

    fn box_trace(&self, start: &Vec3, end: &Vec3, mins: &Vec3, maxs: &Vec3, headnode: i32, brushmask: i32) -> Trace {
        cm_trace::box_trace(self, start, end, mins, maxs, headnode, brushmask)
    }

    fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: i32,
        xform: &ModelTransform,
    ) -> Trace {
        cm_trace::transformed_box_trace(self, start, end, mins, maxs, headnode, brushmask, xform)
    }
}

/// What movement and AI code asks of the world.
pub trait CollisionQuery {
    /// Sweep `mins..maxs` from `start` to `end`. `passent` and anything it
    /// owns, or that owns it, is ignored.
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, passent: i32, contentmask: i32) -> Trace;
    fn point_contents(&self, p: &Vec3) -> i32;
}

// ============================================================
// MoveClip — internal trace structure
// ============================================================

struct MoveClip {
    boxmins: Vec3, // enclose the test object along entire move
    boxmaxs: Vec3,
    mins: Vec3,
    maxs: Vec3,
    start: Vec3,
    end: Vec3,
    passent: i32,
    contentmask: i32,
}

enum Hull {
    Model(i32),
    Box(BoxHull),
}

// ============================================================
// World — map, area nodes and entities
// ============================================================

pub struct World<M: CollisionModel = ClipMap> {
    map: Arc<M>,
    config: WorldConfig,
    world_model: CModel,
    areanodes: Vec<AreaNode>,
    entities: Vec<Entity>,
}

impl<M: CollisionModel> World<M> {
    /// Entity 0 is the world itself and is never linked.
    pub fn new(map: Arc<M>, config: WorldConfig) -> Result<Self> {
        let world_model = map.inline_model(0).ok_or(BspError::NoWorldModel)?;
        let world_ent = Entity { inuse: true, solid: Solid::Bsp, modelindex: 0, ..Default::default() };
        let mut world = Self { map, config, world_model, areanodes: Vec::new(), entities: vec![world_ent] };
        world.clear_world();
        Ok(world)
    }

    pub fn map(&self) -> &M {
        &self.map
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn entity(&self, num: usize) -> &Entity {
        &self.entities[num]
    }

    /// Changes that move the entity take effect on the next link_entity.
    pub fn entity_mut(&mut self, num: usize) -> &mut Entity {
        &mut self.entities[num]
    }

    /// Add an entity, returning its number. It is not linked yet.
    pub fn spawn(&mut self, ent: Entity) -> usize {
        self.entities.push(ent);
        self.entities.len() - 1
    }

    /// Make the entity a brush model, taking its bounds from the model.
    pub fn set_model(&mut self, num: usize, modelindex: usize) -> Result<()> {
        let model = self.map.inline_model(modelindex).ok_or(BspError::BadIndex {
            what: "inline model",
            index: modelindex as i32,
            count: self.map.num_inline_models(),
        })?;
        let ent = &mut self.entities[num];
        ent.solid = Solid::Bsp;
        ent.modelindex = modelindex;
        ent.mins = model.mins;
        ent.maxs = model.maxs;
        Ok(())
    }

    // ================================================================
    // Area nodes
    // ================================================================

    /// Builds a uniformly subdivided tree for the given world size.
    fn create_area_node(&mut self, depth: usize, mins: &Vec3, maxs: &Vec3) -> usize {
        let anode_idx = self.areanodes.len();
        self.areanodes.push(AreaNode::default());

        if depth == self.config.area_depth {
            return anode_idx;
        }

        let size = vector_subtract(maxs, mins);
        let axis = if size[0] > size[1] { 0 } else { 1 };
        let dist = 0.5 * (maxs[axis] + mins[axis]);

        let mut maxs1 = *maxs;
        let mut mins2 = *mins;
        maxs1[axis] = dist;
        mins2[axis] = dist;

        let child0 = self.create_area_node(depth + 1, &mins2, maxs);
        let child1 = self.create_area_node(depth + 1, mins, &maxs1);

        let node = &mut self.areanodes[anode_idx];
        node.axis = axis as i32;
        node.dist = dist;
        node.children = [child0, child1];
        anode_idx
    }

    /// Rebuild the area nodes over the world model's bounds. Every entity
    /// is left unlinked.
    pub fn clear_world(&mut self) {
        self.areanodes.clear();
        let (mins, maxs) = (self.world_model.mins, self.world_model.maxs);
        self.create_area_node(0, &mins, &maxs);
        for ent in &mut self.entities {
            ent.area_node = None;
        }
    }

    pub fn num_area_nodes(&self) -> usize {
        self.areanodes.len()
    }

    pub fn area_node(&self, num: usize) -> &AreaNode {
        &self.areanodes[num]
    }

    // ================================================================
    // Linking
    // ================================================================

    pub fn unlink_entity(&mut self, num: usize) {
        let Some(node_idx) = self.entities[num].area_node.take() else {
            return; // not linked in anywhere
        };
        let node = &mut self.areanodes[node_idx];
        node.trigger_entities.retain(|&e| e != num);
        node.solid_entities.retain(|&e| e != num);
    }

    /// Needs to be called any time an entity changes origin, mins, maxs, or
    /// solid. Sets the abs box, clusters and areas, and links into the
    /// area node the box first crosses.
    pub fn link_entity(&mut self, num: usize) {
        self.unlink_entity(num); // unlink from old position

        if num == ENTITYNUM_WORLD as usize {
            return; // don't add the world
        }
        if !self.entities[num].inuse {
            return;
        }

        let ent = &mut self.entities[num];
        ent.size = vector_subtract(&ent.maxs, &ent.mins);

        // set the abs box
        if ent.solid == Solid::Bsp && !vector_compare(&ent.angles, &VEC3_ORIGIN) {
            // expand for rotation
            let mut max: f32 = 0.0;
            for i in 0..3 {
                max = max.max(ent.mins[i].abs()).max(ent.maxs[i].abs());
            }
            for i in 0..3 {
                ent.absmin[i] = ent.origin[i] - max;
                ent.absmax[i] = ent.origin[i] + max;
            }
        } else {
            // normal
            ent.absmin = vector_add(&ent.origin, &ent.mins);
            ent.absmax = vector_add(&ent.origin, &ent.maxs);
        }

        // because movement is clipped an epsilon away from an actual edge,
        // we must fully check even when bounding boxes don't quite touch
        for i in 0..3 {
            ent.absmin[i] -= 1.0;
            ent.absmax[i] += 1.0;
        }

        // link to PVS leafs
        ent.num_clusters = 0;
        ent.areanum = 0;
        ent.areanum2 = 0;

        // get all leafs, including solids
        let (leafs, topnode) = self.map.box_leafnums(&ent.absmin, &ent.absmax, MAX_TOTAL_ENT_LEAFS);

        // set areas
        let mut clusters = Vec::with_capacity(leafs.len());
        for &leaf in &leafs {
            clusters.push(self.map.leaf_cluster(leaf));
            let area = self.map.leaf_area(leaf);
            if area != 0 {
                // doors may legally straddle two areas,
                // but nothing should ever need more than that
                if ent.areanum != 0 && ent.areanum != area {
                    if ent.areanum2 != 0 && ent.areanum2 != area {
                        debug!("Object touching 3 areas at {} {} {}", ent.absmin[0], ent.absmin[1], ent.absmin[2]);
                    }
                    ent.areanum2 = area;
                } else {
                    ent.areanum = area;
                }
            }
        }

        if leafs.len() >= MAX_TOTAL_ENT_LEAFS {
            // assume we missed some leafs, and mark by headnode
            ent.num_clusters = -1;
            ent.headnode = topnode;
        } else {
            for (i, &cluster) in clusters.iter().enumerate() {
                if cluster == -1 {
                    continue; // not a visible leaf
                }
                if clusters[..i].contains(&cluster) {
                    continue;
                }
                if ent.num_clusters == MAX_ENT_CLUSTERS as i32 {
                    // assume we missed some leafs, and mark by headnode
                    ent.num_clusters = -1;
                    ent.headnode = topnode;
                    break;
                }
                ent.clusternums[ent.num_clusters as usize] = cluster;
                ent.num_clusters += 1;
            }
        }

        ent.linkcount += 1;

        if ent.solid == Solid::Not {
            return;
        }

        // find the first node that the ent's box crosses
        let (absmin, absmax, solid) = (ent.absmin, ent.absmax, ent.solid);
        let mut node_idx = 0;
        loop {
            let node = &self.areanodes[node_idx];
            if node.axis == -1 {
                break;
            }
            let axis = node.axis as usize;
            if absmin[axis] > node.dist {
                node_idx = node.children[0];
            } else if absmax[axis] < node.dist {
                node_idx = node.children[1];
            } else {
                break; // crosses the node
            }
        }

        // link it in
        if solid == Solid::Trigger {
            self.areanodes[node_idx].trigger_entities.push(num);
        } else {
            self.areanodes[node_idx].solid_entities.push(num);
        }
        self.entities[num].area_node = Some(node_idx);
    }

    // ================================================================
    // Area queries
    // ================================================================

    fn area_entities_r(&self, node_idx: usize, mins: &Vec3, maxs: &Vec3, area_type: AreaType, list: &mut Vec<usize>) {
        let node = &self.areanodes[node_idx];

        // touch linked entities
        let linked = match area_type {
            AreaType::Solid => &node.solid_entities,
            AreaType::Triggers => &node.trigger_entities,
        };

        for &check_idx in linked {
            let check = &self.entities[check_idx];
            if check.solid == Solid::Not {
                continue; // deactivated
            }
            if !bounds_intersect(&check.absmin, &check.absmax, mins, maxs) {
                continue; // not touching
            }
            if list.len() == self.config.max_area_entities {
                warn!("area_entities: MAXCOUNT");
                return;
            }
            list.push(check_idx);
        }

        if node.axis == -1 {
            return; // terminal node
        }

        // recurse down both sides
        let axis = node.axis as usize;
        if maxs[axis] > node.dist {
            self.area_entities_r(node.children[0], mins, maxs, area_type, list);
        }
        if mins[axis] < node.dist {
            self.area_entities_r(node.children[1], mins, maxs, area_type, list);
        }
    }

    /// Linked entities of one kind whose abs box touches `mins..maxs`.
    pub fn area_entities(&self, mins: &Vec3, maxs: &Vec3, area_type: AreaType) -> Vec<usize> {
        let mut list = Vec::new();
        if !self.areanodes.is_empty() {
            self.area_entities_r(0, mins, maxs, area_type, &mut list);
        }
        list
    }

    // ================================================================
    // Hulls and contents
    // ================================================================

    /// Returns a hull that can be used for testing or clipping an object of
    /// mins/maxs size.
    fn hull_for_entity(&self, ent: &Entity) -> Hull {
        // decide which clipping hull to use, based on the size
        if ent.solid == Solid::Bsp {
            // explicit hulls in the BSP model
            match self.map.inline_model(ent.modelindex) {
                Some(m) => return Hull::Model(m.headnode),
                None => panic!("Solid::Bsp entity with bad model {}", ent.modelindex),
            }
        }

        // create a temp hull from bounding box sizes
        Hull::Box(BoxHull::new(&ent.mins, &ent.maxs, ent.contents))
    }

    fn entity_transform(ent: &Entity) -> ModelTransform {
        let angles = if ent.solid != Solid::Bsp {
            &VEC3_ORIGIN // boxes don't rotate
        } else {
            &ent.angles
        };
        ModelTransform::new(&ent.origin, angles)
    }

    /// World contents at `p` combined with every solid entity covering it.
    pub fn point_contents(&self, p: &Vec3) -> i32 {
        // get base contents from world
        let mut contents = self.map.point_contents(p, self.world_model.headnode);

        // or in contents from all the other entities
        for touch_idx in self.area_entities(p, p, AreaType::Solid) {
            let hit = &self.entities[touch_idx];
            let xform = Self::entity_transform(hit);

            // might intersect, so do an exact clip
            contents |= match self.hull_for_entity(hit) {
                Hull::Model(headnode) => self.map.transformed_point_contents(p, headnode, &xform),
                Hull::Box(hull) => cm_test::transformed_point_contents(&hull, p, hull.headnode(), &xform),
            };
        }
        contents
    }

    // ================================================================
    // Tracing
    // ================================================================

    fn should_clip(&self, clip: &MoveClip, touch_idx: usize) -> bool {
        let touch = &self.entities[touch_idx];
        if touch.solid == Solid::Not {
            return false;
        }
        if touch_idx as i32 == clip.passent {
            return false;
        }
        if clip.passent >= 0 {
            let passent = &self.entities[clip.passent as usize];
            if touch.owner == clip.passent {
                return false; // don't clip against own missiles
            }
            if passent.owner == touch_idx as i32 {
                return false; // don't clip against owner
            }
        }
        if clip.contentmask & CONTENTS_DEADMONSTER == 0 && touch.svflags.contains(ServerFlags::DEADMONSTER) {
            return false;
        }
        true
    }

    fn clip_to_entity(&self, clip: &MoveClip, touch_idx: usize) -> Trace {
        let touch = &self.entities[touch_idx];
        let xform = Self::entity_transform(touch);

        // might intersect, so do an exact clip
        let mut trace = match self.hull_for_entity(touch) {
            Hull::Model(headnode) => self.map.transformed_box_trace(
                &clip.start,
                &clip.end,
                &clip.mins,
                &clip.maxs,
                headnode,
                clip.contentmask,
                &xform,
            ),
            Hull::Box(hull) => cm_trace::transformed_box_trace(
                &hull,
                &clip.start,
                &clip.end,
                &clip.mins,
                &clip.maxs,
                hull.headnode(),
                clip.contentmask,
                &xform,
            ),
        };
        trace.ent = touch_idx as i32;
        trace
    }

    fn clip_move_to_entities(&self, clip: &MoveClip, world_trace: Trace) -> Trace {
        let candidates: Vec<usize> = self
            .area_entities(&clip.boxmins, &clip.boxmaxs, AreaType::Solid)
            .into_iter()
            .filter(|&n| self.should_clip(clip, n))
            .collect();

        if candidates.len() >= self.config.parallel_threshold {
            // clip in parallel, then reduce in entity order
            let traces: Vec<Trace> = candidates.par_iter().map(|&n| self.clip_to_entity(clip, n)).collect();
            Self::nearest_trace(world_trace, traces.into_iter())
        } else {
            Self::nearest_trace(world_trace, candidates.iter().map(|&n| self.clip_to_entity(clip, n)))
        }
    }

    /// Earliest impact wins. Starting inside an entity marks the result
    /// startsolid against that entity but keeps the earliest fraction, plane
    /// and end position; only an allsolid clip ends the search.
    fn nearest_trace(mut best: Trace, traces: impl Iterator<Item = Trace>) -> Trace {
        let mut started_in = None;
        for trace in traces {
            if trace.allsolid {
                return trace;
            }
            if trace.startsolid && started_in.is_none() {
                started_in = Some(trace.ent);
            }
            if trace.fraction < best.fraction {
                best = trace;
            }
        }
        if let Some(ent) = started_in {
            best.startsolid = true;
            best.ent = ent;
        }
        best
    }

    fn trace_bounds(start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> (Vec3, Vec3) {
        let mut boxmins = [0.0f32; 3];
        let mut boxmaxs = [0.0f32; 3];
        for i in 0..3 {
            if end[i] > start[i] {
                boxmins[i] = start[i] + mins[i] - 1.0;
                boxmaxs[i] = end[i] + maxs[i] + 1.0;
            } else {
                boxmins[i] = end[i] + mins[i] - 1.0;
                boxmaxs[i] = start[i] + maxs[i] + 1.0;
            }
        }
        (boxmins, boxmaxs)
    }

    /// Moves the given mins/maxs volume through the world from start to end.
    /// `passent` and entities owned by it are explicitly not checked.
    pub fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, passent: i32, contentmask: i32) -> Trace {
        // clip to world
        let mut trace = self.map.box_trace(start, end, mins, maxs, self.world_model.headnode, contentmask);
        trace.ent = if trace.fraction < 1.0 || trace.startsolid { ENTITYNUM_WORLD } else { ENTITYNUM_NONE };
        if trace.startsolid || trace.fraction == 0.0 {
            return trace; // blocked by the world
        }

        // create the bounding box of the entire move
        let (boxmins, boxmaxs) = Self::trace_bounds(start, mins, maxs, end);
        let clip = MoveClip {
            boxmins,
            boxmaxs,
            mins: *mins,
            maxs: *maxs,
            start: *start,
            end: *end,
            passent,
            contentmask,
        };

        // clip to other solid entities
        self.clip_move_to_entities(&clip, trace)
    }
}

impl<M: CollisionModel> CollisionQuery for World<M> {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3, passent: i32, contentmask: i32) -> Trace {
        World::trace(self, start, mins, maxs, end, passent, contentmask)
    }

    fn point_contents(&self, p: &Vec3) -> i32 {
        World::point_contents(self, p)
    }
}
