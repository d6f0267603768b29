// cmodel.rs — Collision model: runtime structures and BSP loading
//
// Only the lumps that matter for collision are loaded: textures, planes,
// nodes, leafs, leafbrushes, brushes and brushsides. Faces, lightmaps,
// visibility and the other rendering lumps are ignored.

use crate::bspfile::{
    Lump, BRUSHSIDE_RECORD_SIZE, BRUSH_RECORD_SIZE, BSPVERSION, HEADER_LUMPS, IDBSPHEADER,
    LEAFBRUSH_RECORD_SIZE, LEAF_RECORD_SIZE, LUMP_BRUSHES, LUMP_BRUSHSIDES, LUMP_LEAFBRUSHES,
    LUMP_LEAFS, LUMP_NODES, LUMP_PLANES, LUMP_TEXTURES, MAX_MAP_BRUSHES, MAX_MAP_BRUSHSIDES,
    MAX_MAP_LEAFBRUSHES, MAX_MAP_LEAFS, MAX_MAP_NODES, MAX_MAP_PLANES, MAX_MAP_TEXTURES,
    NODE_RECORD_SIZE, PLANE_RECORD_SIZE, TEXTURE_RECORD_SIZE,
};
use crate::math::{dot_product, vector_max, vector_min, CPlane, Vec3};
use rayon::prelude::*;
use thiserror::Error;

// ============================================================
// Runtime structures
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct CNode {
    pub plane_idx: usize,
    pub children: [i32; 2], // negative numbers are leafs: leaf index = -(child + 1)
}

#[derive(Debug, Clone, Default)]
pub struct CLeaf {
    pub cluster: i32,
    pub area: i32,
    pub firstleafbrush: usize,
    pub numleafbrushes: usize,
}

/// A convex brush. After loading, sides `0..6` are the synthesized faces
/// of the brush's bounding box (in -x/+x/-y/+y/-z/+z order) and the
/// original sides follow from index 6.
#[derive(Debug, Clone, Default)]
pub struct CBrush {
    pub firstbrushside: usize,
    pub numsides: usize,
    pub texture_idx: i32, // negative = no texture, never collides
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

#[derive(Debug, Clone, Default)]
pub struct CBrushSide {
    pub plane_idx: usize,
}

#[derive(Debug, Clone)]
pub struct CTexture {
    pub name: [u8; 64],
    pub flags: i32,
    pub contents: i32,
}

impl CTexture {
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(64);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

/// An immutable collision BSP. Built once by [`CollisionBsp::from_bytes`]
/// (or by hand for tests) and then queried freely; concurrent traces from
/// multiple threads need no synchronization.
#[derive(Debug, Clone, Default)]
pub struct CollisionBsp {
    pub textures: Vec<CTexture>,
    pub planes: Vec<CPlane>,
    pub nodes: Vec<CNode>,
    pub leafs: Vec<CLeaf>,
    pub leafbrushes: Vec<i32>,
    pub brushes: Vec<CBrush>,
    pub brushsides: Vec<CBrushSide>,
}

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Error)]
pub enum BspError {
    #[error("bsp file too short for header")]
    Truncated,
    #[error("wrong ident {0:#010x}, not an IBSP file")]
    WrongIdent(i32),
    #[error("wrong version number ({found} should be {expected})")]
    WrongVersion { found: i32, expected: i32 },
    #[error("{0} lump extends past end of file")]
    LumpOutOfRange(&'static str),
    #[error("funny lump size ({0})")]
    FunnyLumpSize(&'static str),
    #[error("map has too many {0}")]
    TooMany(&'static str),
    #[error("map has no {0}")]
    Missing(&'static str),
    #[error("plane {0} has a degenerate normal")]
    DegeneratePlane(usize),
    #[error("bad {kind} index {index} in {referrer} {referrer_index}")]
    BadIndex {
        kind: &'static str,
        index: i64,
        referrer: &'static str,
        referrer_index: usize,
    },
    #[error("brush {0} does not begin with its six axial sides")]
    MalformedBrush(usize),
}

// ============================================================
// Byte helpers
// ============================================================

fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Parallel threshold for lump parsing - below this count, sequential is faster
const PARALLEL_LUMP_THRESHOLD: usize = 64;

/// Checks a lump's extents against the file and its length against the
/// record stride, returning (offset, record count).
fn check_lump(
    data: &[u8],
    lump: &Lump,
    stride: usize,
    max: usize,
    name: &'static str,
) -> Result<(usize, usize), BspError> {
    if lump.fileofs < 0 || lump.filelen < 0 {
        return Err(BspError::LumpOutOfRange(name));
    }
    let ofs = lump.fileofs as usize;
    let len = lump.filelen as usize;
    if ofs.checked_add(len).map_or(true, |end| end > data.len()) {
        return Err(BspError::LumpOutOfRange(name));
    }
    if !len.is_multiple_of(stride) {
        return Err(BspError::FunnyLumpSize(name));
    }
    let count = len / stride;
    if count > max {
        return Err(BspError::TooMany(name));
    }
    Ok((ofs, count))
}

// ============================================================
// Lump loaders
// ============================================================

fn load_textures(data: &[u8], lump: &Lump) -> Result<Vec<CTexture>, BspError> {
    let (ofs, count) = check_lump(data, lump, TEXTURE_RECORD_SIZE, MAX_MAP_TEXTURES, "textures")?;

    let parse = |i: usize| {
        let base = ofs + i * TEXTURE_RECORD_SIZE;
        let mut name = [0u8; 64];
        name.copy_from_slice(&data[base..base + 64]);
        CTexture {
            name,
            flags: read_i32_le(data, base + 64),
            contents: read_i32_le(data, base + 68),
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(parse).collect())
    } else {
        Ok((0..count).map(parse).collect())
    }
}

fn load_planes(data: &[u8], lump: &Lump) -> Result<Vec<CPlane>, BspError> {
    let (ofs, count) = check_lump(data, lump, PLANE_RECORD_SIZE, MAX_MAP_PLANES, "planes")?;
    if count < 1 {
        return Err(BspError::Missing("planes"));
    }

    // Normals in the file are expected to be unit length already, but
    // renormalizing costs nothing at load time and the tracer depends on it.
    let parse = |i: usize| {
        let base = ofs + i * PLANE_RECORD_SIZE;
        let mut normal = [
            read_f32_le(data, base),
            read_f32_le(data, base + 4),
            read_f32_le(data, base + 8),
        ];
        let mut dist = read_f32_le(data, base + 12);
        let length = crate::math::vector_normalize(&mut normal);
        if length > 0.0 {
            dist /= length;
        }
        (length, CPlane::new(normal, dist))
    };

    let parsed: Vec<(f32, CPlane)> = if count >= PARALLEL_LUMP_THRESHOLD {
        (0..count).into_par_iter().map(parse).collect()
    } else {
        (0..count).map(parse).collect()
    };

    let mut planes = Vec::with_capacity(count);
    for (i, (length, plane)) in parsed.into_iter().enumerate() {
        if length == 0.0 {
            return Err(BspError::DegeneratePlane(i));
        }
        planes.push(plane);
    }
    Ok(planes)
}

fn load_nodes(data: &[u8], lump: &Lump) -> Result<Vec<CNode>, BspError> {
    let (ofs, count) = check_lump(data, lump, NODE_RECORD_SIZE, MAX_MAP_NODES, "nodes")?;
    if count < 1 {
        return Err(BspError::Missing("nodes"));
    }

    let parse = |i: usize| {
        let base = ofs + i * NODE_RECORD_SIZE;
        CNode {
            plane_idx: read_i32_le(data, base) as usize,
            children: [read_i32_le(data, base + 4), read_i32_le(data, base + 8)],
            // node bounds at +12..+36 are not needed for tracing
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(parse).collect())
    } else {
        Ok((0..count).map(parse).collect())
    }
}

fn load_leafs(data: &[u8], lump: &Lump) -> Result<Vec<CLeaf>, BspError> {
    let (ofs, count) = check_lump(data, lump, LEAF_RECORD_SIZE, MAX_MAP_LEAFS, "leafs")?;
    if count < 1 {
        return Err(BspError::Missing("leafs"));
    }

    let parse = |i: usize| {
        let base = ofs + i * LEAF_RECORD_SIZE;
        CLeaf {
            cluster: read_i32_le(data, base),
            area: read_i32_le(data, base + 4),
            // leaf bounds at +8, leaffaces at +32
            firstleafbrush: read_i32_le(data, base + 40) as usize,
            numleafbrushes: read_i32_le(data, base + 44) as usize,
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(parse).collect())
    } else {
        Ok((0..count).map(parse).collect())
    }
}

fn load_leaf_brushes(data: &[u8], lump: &Lump) -> Result<Vec<i32>, BspError> {
    let (ofs, count) = check_lump(
        data,
        lump,
        LEAFBRUSH_RECORD_SIZE,
        MAX_MAP_LEAFBRUSHES,
        "leafbrushes",
    )?;

    let parse = |i: usize| read_i32_le(data, ofs + i * LEAFBRUSH_RECORD_SIZE);

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(parse).collect())
    } else {
        Ok((0..count).map(parse).collect())
    }
}

fn load_brushes(data: &[u8], lump: &Lump) -> Result<Vec<CBrush>, BspError> {
    let (ofs, count) = check_lump(data, lump, BRUSH_RECORD_SIZE, MAX_MAP_BRUSHES, "brushes")?;

    let parse = |i: usize| {
        let base = ofs + i * BRUSH_RECORD_SIZE;
        CBrush {
            firstbrushside: read_i32_le(data, base) as usize,
            numsides: read_i32_le(data, base + 4) as usize,
            texture_idx: read_i32_le(data, base + 8),
            bounds_min: [0.0; 3],
            bounds_max: [0.0; 3],
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(parse).collect())
    } else {
        Ok((0..count).map(parse).collect())
    }
}

fn load_brush_sides(data: &[u8], lump: &Lump) -> Result<Vec<CBrushSide>, BspError> {
    let (ofs, count) = check_lump(
        data,
        lump,
        BRUSHSIDE_RECORD_SIZE,
        MAX_MAP_BRUSHSIDES,
        "brushsides",
    )?;

    let parse = |i: usize| {
        let base = ofs + i * BRUSHSIDE_RECORD_SIZE;
        CBrushSide {
            plane_idx: read_i32_le(data, base) as usize,
            // side texture at +4 is only used for surface flags, which the
            // trace result does not carry
        }
    };

    if count >= PARALLEL_LUMP_THRESHOLD {
        Ok((0..count).into_par_iter().map(parse).collect())
    } else {
        Ok((0..count).map(parse).collect())
    }
}

// ============================================================
// Loading
// ============================================================

impl CollisionBsp {
    /// Builds a collision BSP from the raw bytes of a Quake 3 `.bsp` file.
    ///
    /// All cross-indices are validated here; queries trust them afterwards.
    pub fn from_bytes(data: &[u8]) -> Result<Self, BspError> {
        if data.len() < 8 + HEADER_LUMPS * 8 {
            return Err(BspError::Truncated);
        }

        let ident = read_i32_le(data, 0);
        if ident != IDBSPHEADER {
            return Err(BspError::WrongIdent(ident));
        }
        let version = read_i32_le(data, 4);
        if version != BSPVERSION {
            return Err(BspError::WrongVersion {
                found: version,
                expected: BSPVERSION,
            });
        }

        let mut lumps = [Lump::default(); HEADER_LUMPS];
        for (i, lump) in lumps.iter_mut().enumerate() {
            let base = 8 + i * 8;
            lump.fileofs = read_i32_le(data, base);
            lump.filelen = read_i32_le(data, base + 4);
        }

        let mut bsp = CollisionBsp {
            textures: load_textures(data, &lumps[LUMP_TEXTURES])?,
            planes: load_planes(data, &lumps[LUMP_PLANES])?,
            nodes: load_nodes(data, &lumps[LUMP_NODES])?,
            leafs: load_leafs(data, &lumps[LUMP_LEAFS])?,
            leafbrushes: load_leaf_brushes(data, &lumps[LUMP_LEAFBRUSHES])?,
            brushes: load_brushes(data, &lumps[LUMP_BRUSHES])?,
            brushsides: load_brush_sides(data, &lumps[LUMP_BRUSHSIDES])?,
        };

        bsp.validate()?;
        bsp.bound_and_bevel_brushes()?;

        log::info!(
            "loaded collision bsp: {} planes, {} nodes, {} leafs, {} brushes, {} brushsides",
            bsp.planes.len(),
            bsp.nodes.len(),
            bsp.leafs.len(),
            bsp.brushes.len(),
            bsp.brushsides.len()
        );

        Ok(bsp)
    }

    fn validate(&self) -> Result<(), BspError> {
        for (i, node) in self.nodes.iter().enumerate() {
            if node.plane_idx >= self.planes.len() {
                return Err(BspError::BadIndex {
                    kind: "plane",
                    index: node.plane_idx as i64,
                    referrer: "node",
                    referrer_index: i,
                });
            }
            for &child in &node.children {
                let ok = if child >= 0 {
                    (child as usize) < self.nodes.len()
                } else {
                    ((-1 - child) as usize) < self.leafs.len()
                };
                if !ok {
                    return Err(BspError::BadIndex {
                        kind: "child",
                        index: child as i64,
                        referrer: "node",
                        referrer_index: i,
                    });
                }
            }
        }

        for (i, leaf) in self.leafs.iter().enumerate() {
            let end = leaf.firstleafbrush.checked_add(leaf.numleafbrushes);
            if end.map_or(true, |e| e > self.leafbrushes.len()) {
                return Err(BspError::BadIndex {
                    kind: "leafbrush",
                    index: leaf.firstleafbrush as i64,
                    referrer: "leaf",
                    referrer_index: i,
                });
            }
        }

        for (i, &brushnum) in self.leafbrushes.iter().enumerate() {
            if brushnum < 0 || brushnum as usize >= self.brushes.len() {
                return Err(BspError::BadIndex {
                    kind: "brush",
                    index: brushnum as i64,
                    referrer: "leafbrush",
                    referrer_index: i,
                });
            }
        }

        for (i, brush) in self.brushes.iter().enumerate() {
            let end = brush.firstbrushside.checked_add(brush.numsides);
            if end.map_or(true, |e| e > self.brushsides.len()) {
                return Err(BspError::BadIndex {
                    kind: "brushside",
                    index: brush.firstbrushside as i64,
                    referrer: "brush",
                    referrer_index: i,
                });
            }
            if brush.texture_idx >= 0 && brush.texture_idx as usize >= self.textures.len() {
                return Err(BspError::BadIndex {
                    kind: "texture",
                    index: brush.texture_idx as i64,
                    referrer: "brush",
                    referrer_index: i,
                });
            }
        }

        for (i, side) in self.brushsides.iter().enumerate() {
            if side.plane_idx >= self.planes.len() {
                return Err(BspError::BadIndex {
                    kind: "plane",
                    index: side.plane_idx as i64,
                    referrer: "brushside",
                    referrer_index: i,
                });
            }
        }

        Ok(())
    }

    /// Computes every brush's bounding box from its six leading axial
    /// sides, then rebuilds the side array so those bounds are materialized
    /// as sides 0..6 of each brush and the original sides follow.
    ///
    /// The clipper relies on this: it skips sides 0..6 (the broad phase
    /// already tested the box) and clips against everything after them.
    fn bound_and_bevel_brushes(&mut self) -> Result<(), BspError> {
        let mut new_sides =
            Vec::with_capacity(self.brushsides.len() + self.brushes.len() * 6);
        let mut brushes = std::mem::take(&mut self.brushes);

        for (brushnum, brush) in brushes.iter_mut().enumerate() {
            if brush.numsides < 6 {
                return Err(BspError::MalformedBrush(brushnum));
            }

            // The compiler writes the axial pair for each axis as the first
            // six sides of every brush; accept either order within a pair.
            let mut mins = [0.0f32; 3];
            let mut maxs = [0.0f32; 3];
            for axis in 0..3 {
                let mut have_min = false;
                let mut have_max = false;
                for k in 0..2 {
                    let side = &self.brushsides[brush.firstbrushside + axis * 2 + k];
                    let plane = &self.planes[side.plane_idx];
                    if plane.normal[axis] > 0.99 {
                        maxs[axis] = plane.dist;
                        have_max = true;
                    } else if plane.normal[axis] < -0.99 {
                        mins[axis] = -plane.dist;
                        have_min = true;
                    }
                }
                if !have_min || !have_max || mins[axis] > maxs[axis] {
                    return Err(BspError::MalformedBrush(brushnum));
                }
            }
            brush.bounds_min = mins;
            brush.bounds_max = maxs;

            let new_first = new_sides.len();
            for axis in 0..3 {
                let mut neg = [0.0f32; 3];
                neg[axis] = -1.0;
                self.planes.push(CPlane::new(neg, -mins[axis]));
                new_sides.push(CBrushSide {
                    plane_idx: self.planes.len() - 1,
                });

                let mut pos = [0.0f32; 3];
                pos[axis] = 1.0;
                self.planes.push(CPlane::new(pos, maxs[axis]));
                new_sides.push(CBrushSide {
                    plane_idx: self.planes.len() - 1,
                });
            }

            for i in 0..brush.numsides {
                new_sides.push(self.brushsides[brush.firstbrushside + i].clone());
            }
            brush.firstbrushside = new_first;
            brush.numsides += 6;
        }

        self.brushes = brushes;
        self.brushsides = new_sides;
        Ok(())
    }

    // ============================================================
    // Point queries
    // ============================================================

    /// Returns the index of the leaf containing `p`.
    pub fn point_leafnum(&self, p: &Vec3) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }
        let mut num: i32 = 0;
        while num >= 0 {
            let node = &self.nodes[num as usize];
            let plane = &self.planes[node.plane_idx];
            let d = if (plane.plane_type as usize) < 3 {
                p[plane.plane_type as usize] - plane.dist
            } else {
                dot_product(&plane.normal, p) - plane.dist
            };
            num = if d < 0.0 {
                node.children[1]
            } else {
                node.children[0]
            };
        }
        (-1 - num) as usize
    }

    /// ORs together the contents of every brush in the point's leaf that
    /// actually contains the point.
    pub fn point_contents(&self, p: &Vec3) -> i32 {
        if self.nodes.is_empty() {
            return 0;
        }
        let leaf = &self.leafs[self.point_leafnum(p)];
        let mut contents = 0;

        'brushes: for i in 0..leaf.numleafbrushes {
            let brushnum = self.leafbrushes[leaf.firstleafbrush + i] as usize;
            let brush = &self.brushes[brushnum];
            if brush.texture_idx < 0 || brush.numsides < 6 {
                continue;
            }
            for j in 0..3 {
                if p[j] < brush.bounds_min[j] || p[j] > brush.bounds_max[j] {
                    continue 'brushes;
                }
            }
            for k in 6..brush.numsides {
                let side = &self.brushsides[brush.firstbrushside + k];
                let plane = &self.planes[side.plane_idx];
                if dot_product(&plane.normal, p) - plane.dist > 0.0 {
                    continue 'brushes;
                }
            }
            contents |= self.textures[brush.texture_idx as usize].contents;
        }

        contents
    }

    /// Bounding box of all brushes; zeros for a map without brushes.
    pub fn world_bounds(&self) -> (Vec3, Vec3) {
        let mut iter = self.brushes.iter();
        let Some(first) = iter.next() else {
            return ([0.0; 3], [0.0; 3]);
        };
        let mut mins = first.bounds_min;
        let mut maxs = first.bounds_max;
        for brush in iter {
            mins = vector_min(&mins, &brush.bounds_min);
            maxs = vector_max(&maxs, &brush.bounds_max);
        }
        (mins, maxs)
    }
}

// ============================================================
// Tests
// ============================================================
