// compile.rs — Phase driver: world and submodel builds, output files

use std::path::Path;

use log::{info, warn};

use ibsp_common::common::{BspError, Result};
use ibsp_common::q_shared::Vec3;
use ibsp_common::qfiles::BspFile;

use crate::blocktree::block_tree;
use crate::brush::{brush_from_bounds, BspBrush};
use crate::context::CompilationContext;
use crate::faces::{make_faces, merge_faces};
use crate::map::load_map_file;
use crate::options::CompileOptions;
use crate::outside::{fill_outside, flood_areas, flood_entities, leak_file_text, leak_trail, number_clusters};
use crate::portals::make_tree_portals;
use crate::prtfile::portal_file_text;
use crate::tjunc::fix_tjunctions;
use crate::tree::{build_tree, Tree};
use crate::writebsp::BspWriter;

/// Everything one compile produced.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub bsp: BspFile,
    pub leaked: bool,
    /// Leak trail, entity first. Empty unless `leaked`.
    pub leak_points: Vec<Vec3>,
    /// `.prt` text; only a sealed world has one.
    pub portal_file: Option<String>,
}

fn entity_brushes(ctx: &CompilationContext, entity: usize) -> Vec<BspBrush> {
    ctx.entities[entity].brushes.iter().map(|&i| BspBrush::from_map(&ctx.map_brushes[i], i)).collect()
}

/// Faces, merging and T-junction repair for a tree whose leaf contents are
/// final, then out to the writer.
fn emit_tree(ctx: &CompilationContext, writer: &mut BspWriter, tree: &mut Tree, brushes: (i32, i32)) -> Result<()> {
    let mut faces = make_faces(tree, &ctx.map_brushes, &ctx.planes);
    if !ctx.options.nomerge {
        merge_faces(&mut faces, &ctx.planes);
    }
    if !ctx.options.notjunc {
        fix_tjunctions(&mut faces);
    }
    writer.emit_model(tree, &faces, brushes)
}

fn process_world_model(
    ctx: &mut CompilationContext,
    writer: &mut BspWriter,
    brushes: (i32, i32),
    out: &mut CompileOutput,
) -> Result<()> {
    info!("--- ProcessWorldModel ---");
    let list = entity_brushes(ctx, 0);
    let mut tree = block_tree(list, &mut ctx.planes, ctx.options.blocksize, ctx.options.microvolume)?;
    make_tree_portals(&mut tree, &ctx.planes);

    let flood = flood_entities(&mut tree, &ctx.entities, &ctx.planes);
    if flood.leaked {
        warn!("**** leaked ****");
        out.leaked = true;
        out.leak_points = leak_trail(&tree, &ctx.entities);
        if let Some(path) = &ctx.options.leakfile {
            info!("writing {}", path.display());
            std::fs::write(path, leak_file_text(&out.leak_points))?;
        }
        if ctx.options.leaktest {
            return Err(BspError::Leaked);
        }
    }
    if flood.can_fill() && !ctx.options.nofill {
        fill_outside(&mut tree);
    }

    flood_areas(&mut tree, &ctx.map_brushes, &mut ctx.entities);
    let clusters = number_clusters(&mut tree);

    emit_tree(ctx, writer, &mut tree, brushes)?;

    if !out.leaked {
        out.portal_file = Some(portal_file_text(&tree, clusters));
    }
    Ok(())
}

fn process_submodel(
    ctx: &mut CompilationContext,
    entity: usize,
    writer: &mut BspWriter,
    brushes: (i32, i32),
) -> Result<()> {
    let list = entity_brushes(ctx, entity);
    let mut mins = [0.0f32; 3];
    let mut maxs = [0.0f32; 3];
    ibsp_common::q_shared::clear_bounds(&mut mins, &mut maxs);
    for b in &list {
        ibsp_common::q_shared::add_point_to_bounds(&b.mins, &mut mins, &mut maxs);
        ibsp_common::q_shared::add_point_to_bounds(&b.maxs, &mut mins, &mut maxs);
    }
    for i in 0..3 {
        mins[i] -= 1.0;
        maxs[i] += 1.0;
    }

    let volume = brush_from_bounds(&mins, &maxs, &mut ctx.planes)?;
    let mut tree = build_tree(list, volume, &ctx.planes, ctx.options.microvolume);
    make_tree_portals(&mut tree, &ctx.planes);
    emit_tree(ctx, writer, &mut tree, brushes)
}

/// Compile a loaded map. The world becomes model 0 and every other entity
/// with brushes gets the next model number, written into its "model" key.
pub fn compile_map(ctx: &mut CompilationContext) -> Result<CompileOutput> {
    if ctx.entities.is_empty() {
        return Err(BspError::NoWorldModel);
    }

    let mut models = vec![0];
    for e in 1..ctx.entities.len() {
        if !ctx.entities[e].brushes.is_empty() {
            let name = format!("*{}", models.len());
            ctx.entities[e].set_key_value("model", &name);
            models.push(e);
        }
    }

    let mut out = CompileOutput::default();
    let mut writer = BspWriter::new();
    let ranges = writer.emit_brushes(&ctx.map_brushes, &ctx.entities)?;

    for &e in &models {
        if e == 0 {
            process_world_model(ctx, &mut writer, ranges[0], &mut out)?;
        } else {
            process_submodel(ctx, e, &mut writer, ranges[e])?;
        }
    }

    out.bsp = writer.finish(ctx)?;
    Ok(out)
}

/// Run `f` on a pool of `threads` workers, 0 meaning one per core. Falls
/// back to the global pool if a dedicated one cannot be made.
pub fn with_thread_pool<T: Send>(threads: usize, f: impl FnOnce() -> T + Send) -> T {
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(f),
        Err(e) => {
            warn!("thread pool: {}, using the global pool", e);
            f()
        }
    }
}

/// Compile `source` and write the `.bsp`, plus the `.prt` for a sealed map
/// or the `.lin` for a leaking one, next to it.
pub fn compile_file(source: &Path, mut options: CompileOptions) -> Result<CompileOutput> {
    let bsp_path = source.with_extension("bsp");
    let prt_path = source.with_extension("prt");
    if options.leakfile.is_none() {
        options.leakfile = Some(source.with_extension("lin"));
    }

    let threads = options.threads;
    let mut ctx = CompilationContext::new(options);
    load_map_file(&mut ctx, source)?;

    let out = with_thread_pool(threads, || compile_map(&mut ctx))?;

    info!("writing {}", bsp_path.display());
    out.bsp.write_file(&bsp_path)?;
    if let Some(prt) = &out.portal_file {
        info!("writing {}", prt_path.display());
        std::fs::write(&prt_path, prt)?;
    }
    Ok(out)
}
