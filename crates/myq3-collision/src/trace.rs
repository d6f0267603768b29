// trace.rs — Swept-volume collision traces through the BSP tree
//
// A trace sweeps a point, sphere or axis-aligned box from a start to an
// end position and reports the first fraction of the path at which the
// volume touches solid geometry. Ray, sphere and box queries share one
// recursive descent; the shape only changes how plane distances and node
// offsets are computed.

use crate::bspfile::CONTENTS_SOLID;
use crate::cmodel::{CBrush, CollisionBsp};
use crate::math::{
    clamp01, dot_product, vector_lerp, vector_max, vector_min, CPlane, Vec3, PLANE_NON_AXIAL,
};

/// Contact fractions are pulled back by 1/8 unit so the resolved position
/// stays cleanly outside the struck half-space after float rounding and
/// network coordinate snapping.
pub const SURFACE_CLIP_EPSILON: f32 = 0.125;

/// Margin added around brush bounds before the broad-phase overlap test,
/// wide enough that the epsilon pullback can never be culled away.
const BOUNDS_TEST_EPSILON: f32 = 1.0;

// ============================================================
// Query and result types
// ============================================================

/// The shape swept along the trace segment.
///
/// A sphere of radius 0 and a box with all-zero extents both degrade to
/// `Ray`. Sphere and box are separate variants, so combining them is
/// unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceShape {
    Ray,
    Sphere { radius: f32 },
    Aabb { mins: Vec3, maxs: Vec3 },
}

/// A swept-volume query: move `shape` from `start` to `end`.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub start: Vec3,
    pub end: Vec3,
    pub shape: TraceShape,
}

impl Bounds {
    pub fn ray(start: Vec3, end: Vec3) -> Self {
        Self {
            start,
            end,
            shape: TraceShape::Ray,
        }
    }

    pub fn sphere(start: Vec3, end: Vec3, radius: f32) -> Self {
        Self {
            start,
            end,
            shape: TraceShape::Sphere { radius },
        }
    }

    pub fn aabb(start: Vec3, end: Vec3, mins: Vec3, maxs: Vec3) -> Self {
        Self {
            start,
            end,
            shape: TraceShape::Aabb { mins, maxs },
        }
    }
}

/// How the path relates to solid space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathInfo {
    /// The path begins in free space. If `fraction < 1` it ends against a
    /// brush face; otherwise nothing was hit.
    OutsideSolid,
    /// The path begins embedded in a brush and leaves it somewhere along
    /// the segment.
    StartsInsideEndsOutsideSolid,
    /// The path begins and ends embedded in the same brush.
    InsideSolid,
}

#[derive(Debug, Clone)]
pub struct TraceResult {
    /// 0.0 - collision straight away, 1.0 - no collision at all,
    /// 0.5 - collision half way along the path, and so on.
    pub fraction: f32,
    pub info: PathInfo,
    /// The plane that was struck. Present only for a strict collision in
    /// free space.
    pub plane: Option<CPlane>,
}

impl Default for TraceResult {
    fn default() -> Self {
        Self {
            fraction: 1.0,
            info: PathInfo::OutsideSolid,
            plane: None,
        }
    }
}

impl TraceResult {
    pub fn hit(&self) -> bool {
        self.fraction < 1.0
    }

    /// Where the swept volume ends up: `lerp(start, end, fraction)`.
    pub fn end_position(&self, start: &Vec3, end: &Vec3) -> Vec3 {
        vector_lerp(start, end, self.fraction)
    }
}

// ============================================================
// Trace entry
// ============================================================

/// Sweeps `bounds` through the BSP and returns the first contact.
///
/// Never allocates; all intermediate state lives on the stack, so any
/// number of traces may run concurrently against one `CollisionBsp`.
pub fn trace(bsp: &CollisionBsp, bounds: &Bounds) -> TraceResult {
    let shape = match bounds.shape {
        TraceShape::Sphere { radius } => {
            debug_assert!(radius >= 0.0, "sphere radius must be non-negative");
            if radius <= 0.0 {
                TraceShape::Ray
            } else {
                bounds.shape
            }
        }
        TraceShape::Aabb { mins, maxs } => {
            if mins == [0.0; 3] && maxs == [0.0; 3] {
                TraceShape::Ray
            } else {
                bounds.shape
            }
        }
        TraceShape::Ray => TraceShape::Ray,
    };

    // Symmetric half-extents for the node offset dot product.
    let extents = match shape {
        TraceShape::Aabb { mins, maxs } => [
            if -mins[0] > maxs[0] { -mins[0] } else { maxs[0] },
            if -mins[1] > maxs[1] { -mins[1] } else { maxs[1] },
            if -mins[2] > maxs[2] { -mins[2] } else { maxs[2] },
        ],
        _ => [0.0; 3],
    };

    // World-space bounds of the whole swept volume, for leaf broad phase.
    let env_min = vector_min(&bounds.start, &bounds.end);
    let env_max = vector_max(&bounds.start, &bounds.end);
    let (aabb_min, aabb_max) = match shape {
        TraceShape::Ray => (env_min, env_max),
        TraceShape::Sphere { radius } => (
            [
                env_min[0] - radius,
                env_min[1] - radius,
                env_min[2] - radius,
            ],
            [
                env_max[0] + radius,
                env_max[1] + radius,
                env_max[2] + radius,
            ],
        ),
        TraceShape::Aabb { mins, maxs } => (
            [
                env_min[0] + mins[0],
                env_min[1] + mins[1],
                env_min[2] + mins[2],
            ],
            [
                env_max[0] + maxs[0],
                env_max[1] + maxs[1],
                env_max[2] + maxs[2],
            ],
        ),
    };

    let mut tw = TraceWork {
        bsp,
        start: bounds.start,
        end: bounds.end,
        shape,
        extents,
        aabb_min,
        aabb_max,
        result: TraceResult::default(),
    };

    if bsp.nodes.is_empty() {
        return tw.result;
    }

    tw.check_node(0, 0.0, 1.0, bounds.start, bounds.end);
    tw.result
}

// ============================================================
// Per-trace state
// ============================================================

struct TraceWork<'a> {
    bsp: &'a CollisionBsp,
    start: Vec3,
    end: Vec3,
    shape: TraceShape,
    /// Symmetrized box half-extents; zero for ray and sphere.
    extents: Vec3,
    aabb_min: Vec3,
    aabb_max: Vec3,
    result: TraceResult,
}

impl TraceWork<'_> {
    // ============================================================
    // Node traversal
    // ============================================================

    fn check_node(&mut self, num: i32, p1f: f32, p2f: f32, p1: Vec3, p2: Vec3) {
        // An earlier brush already stopped the path before this span.
        if self.result.fraction <= p1f {
            return;
        }

        if num < 0 {
            self.trace_to_leaf((-1 - num) as usize);
            return;
        }

        let bsp = self.bsp;
        let node = &bsp.nodes[num as usize];
        let children = node.children;
        let plane = &bsp.planes[node.plane_idx];

        let (t1, t2, offset);
        if plane.plane_type < PLANE_NON_AXIAL {
            let pt = plane.plane_type as usize;
            t1 = p1[pt] - plane.dist;
            t2 = p2[pt] - plane.dist;
            offset = match self.shape {
                TraceShape::Ray => 0.0,
                TraceShape::Sphere { radius } => radius,
                TraceShape::Aabb { .. } => self.extents[pt],
            };
        } else {
            t1 = dot_product(&plane.normal, &p1) - plane.dist;
            t2 = dot_product(&plane.normal, &p2) - plane.dist;
            offset = match self.shape {
                TraceShape::Ray => 0.0,
                TraceShape::Sphere { radius } => radius,
                TraceShape::Aabb { .. } => {
                    (self.extents[0] * plane.normal[0]).abs()
                        + (self.extents[1] * plane.normal[1]).abs()
                        + (self.extents[2] * plane.normal[2]).abs()
                }
            };
        }

        // Whole span clear of the plane on one side: descend that child.
        if t1 >= offset && t2 >= offset {
            self.check_node(children[0], p1f, p2f, p1, p2);
            return;
        }
        if t1 < -offset && t2 < -offset {
            self.check_node(children[1], p1f, p2f, p1, p2);
            return;
        }

        // The span straddles the plane. Split it twice, extending the near
        // half slightly past the plane and starting the far half slightly
        // before it, so a volume sitting on the plane is tested in both
        // subtrees.
        let (side, frac, frac2) = if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            (
                1usize,
                clamp01((t1 - offset + SURFACE_CLIP_EPSILON) * idist),
                clamp01((t1 + offset + SURFACE_CLIP_EPSILON) * idist),
            )
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            (
                0usize,
                clamp01((t1 + offset + SURFACE_CLIP_EPSILON) * idist),
                clamp01((t1 - offset - SURFACE_CLIP_EPSILON) * idist),
            )
        } else {
            // On-plane span: near child sees the full segment, far child
            // an empty one.
            (0usize, 1.0, 0.0)
        };

        let midf = p1f + (p2f - p1f) * frac;
        let mid = vector_lerp(&p1, &p2, frac);
        self.check_node(children[side], p1f, midf, p1, mid);

        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2 = vector_lerp(&p1, &p2, frac2);
        self.check_node(children[side ^ 1], midf2, p2f, mid2, p2);
    }

    // ============================================================
    // Leaf handling
    // ============================================================

    fn trace_to_leaf(&mut self, leafnum: usize) {
        let bsp = self.bsp;
        let leaf = &bsp.leafs[leafnum];

        'brushes: for i in 0..leaf.numleafbrushes {
            let brushnum = bsp.leafbrushes[leaf.firstleafbrush + i] as usize;
            let brush = &bsp.brushes[brushnum];

            if brush.numsides < 6 {
                continue;
            }
            if brush.texture_idx < 0 {
                continue;
            }
            if bsp.textures[brush.texture_idx as usize].contents & CONTENTS_SOLID == 0 {
                continue;
            }

            for j in 0..3 {
                if self.aabb_min[j] > brush.bounds_max[j] + BOUNDS_TEST_EPSILON
                    || self.aabb_max[j] < brush.bounds_min[j] - BOUNDS_TEST_EPSILON
                {
                    continue 'brushes;
                }
            }

            self.check_brush(brush);
            if self.result.fraction == 0.0 {
                return;
            }
        }
    }

    // ============================================================
    // Brush clipping
    // ============================================================

    /// Clips the swept volume against one brush, improving the
    /// accumulated result when the volume enters it earlier than anything
    /// found so far.
    ///
    /// Sides 0..6 are the brush's bounding-box faces and are skipped; the
    /// broad phase has already accounted for them.
    fn check_brush(&mut self, brush: &CBrush) {
        let bsp = self.bsp;

        let mut enter_frac = -1.0f32;
        let mut leave_frac = 1.0f32;
        let mut clip_plane: Option<&CPlane> = None;
        let mut starts_out = false;
        let mut ends_out = false;

        for i in 6..brush.numsides {
            let side = &bsp.brushsides[brush.firstbrushside + i];
            let plane = &bsp.planes[side.plane_idx];

            let (d1, d2) = match self.shape {
                TraceShape::Ray => (
                    dot_product(&plane.normal, &self.start) - plane.dist,
                    dot_product(&plane.normal, &self.end) - plane.dist,
                ),
                TraceShape::Sphere { radius } => (
                    dot_product(&plane.normal, &self.start) - (plane.dist + radius),
                    dot_product(&plane.normal, &self.end) - (plane.dist + radius),
                ),
                TraceShape::Aabb { mins, maxs } => {
                    // The box corner that reaches into this half-space
                    // first: maxs where the normal points negative.
                    let mut ofs = [0.0f32; 3];
                    for j in 0..3 {
                        ofs[j] = if plane.normal[j] < 0.0 {
                            maxs[j]
                        } else {
                            mins[j]
                        };
                    }
                    (
                        (self.start[0] + ofs[0]) * plane.normal[0]
                            + (self.start[1] + ofs[1]) * plane.normal[1]
                            + (self.start[2] + ofs[2]) * plane.normal[2]
                            - plane.dist,
                        (self.end[0] + ofs[0]) * plane.normal[0]
                            + (self.end[1] + ofs[1]) * plane.normal[1]
                            + (self.end[2] + ofs[2]) * plane.normal[2]
                            - plane.dist,
                    )
                }
            };

            if d1 > 0.0 {
                starts_out = true;
            }
            if d2 > 0.0 {
                ends_out = true;
            }

            // Completely in front of this half-space: the brush can never
            // be entered along this segment.
            if d1 > 0.0 && d2 > 0.0 {
                return;
            }
            // Completely behind: this plane never limits the path.
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            if d1 > d2 {
                // Entering the brush through this plane.
                let f = (d1 - SURFACE_CLIP_EPSILON) / (d1 - d2);
                if f > enter_frac {
                    enter_frac = f;
                    clip_plane = Some(plane);
                }
            } else {
                // Leaving the brush through this plane.
                let f = (d1 + SURFACE_CLIP_EPSILON) / (d1 - d2);
                if f < leave_frac {
                    leave_frac = f;
                }
            }
        }

        if !starts_out {
            // Started embedded in this brush. Not a collision in Quake 3
            // semantics; only the classification changes.
            self.result.info = if ends_out {
                PathInfo::StartsInsideEndsOutsideSolid
            } else {
                PathInfo::InsideSolid
            };
            return;
        }

        if enter_frac < leave_frac && enter_frac > -1.0 && enter_frac < self.result.fraction {
            self.result.fraction = clamp01(enter_frac);
            self.result.plane = clip_plane.copied();
            self.result.info = PathInfo::OutsideSolid;
        }
    }
}

// ============================================================
// Tests
// ============================================================
