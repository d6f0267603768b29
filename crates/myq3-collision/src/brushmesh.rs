// brushmesh.rs — Rebuilding renderable geometry from collision brushes
//
// A brush is stored only as bounding half-spaces. To visualize one, every
// triple of planes is intersected, candidate points outside the brush are
// discarded, and the surviving vertex cloud is stitched back into per-face
// triangle fans.

use std::cmp::Ordering;

use crate::bspfile::CONTENTS_SOLID;
use crate::cmodel::{CBrush, CollisionBsp};
use crate::math::{
    cross_product, dot_product, vector_add, vector_length_squared, vector_ma, vector_normalize,
    vector_scale, vector_subtract, Vec3,
};

/// A bounding half-space in the geometric convention: `normal·p + dist <= 0`
/// is inside. This is the *negated* form of the BSP's stored plane
/// distance; [`brush_planes`] flips the sign when collecting brush sides.
#[derive(Debug, Clone, Copy)]
pub struct HalfSpace {
    pub normal: Vec3,
    pub dist: f32,
}

/// Plane triples closer to parallel than this (squared cross length) do
/// not produce a stable intersection point.
const DEGENERATE_CROSS_EPSILON: f32 = 1e-4;
const DEGENERATE_DENOM_EPSILON: f32 = 1e-6;
/// Distance inside which a point counts as on (or behind) a plane.
const POINT_ON_PLANE_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, Copy)]
pub struct MeshVertex {
    pub position: Vec3,
    pub normal: Vec3,
}

/// A triangle list: every three consecutive vertices form one triangle,
/// wound counter-clockwise seen from outside.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<MeshVertex>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.vertices.len() / 3
    }
}

// ============================================================
// Vertex reconstruction
// ============================================================

pub fn point_inside_planes(planes: &[HalfSpace], point: &Vec3, epsilon: f32) -> bool {
    for plane in planes {
        if dot_product(&plane.normal, point) + plane.dist - epsilon > 0.0 {
            return false;
        }
    }
    true
}

/// Enumerates the vertices of the convex polytope bounded by `planes`:
/// every unordered plane triple that meets in a single point inside all
/// the other planes contributes it.
///
/// Corners where more than three planes meet are emitted once per triple;
/// callers that care should deduplicate.
pub fn vertices_from_intersecting_planes(planes: &[HalfSpace]) -> Vec<Vec3> {
    let count = planes.len();
    let mut result = Vec::new();

    for i in 0..count {
        let n1 = &planes[i];
        for j in i..count {
            let n2 = &planes[j];
            for k in j..count {
                let n3 = &planes[k];

                let c23 = cross_product(&n2.normal, &n3.normal);
                let c31 = cross_product(&n3.normal, &n1.normal);
                let c12 = cross_product(&n1.normal, &n2.normal);

                if vector_length_squared(&c23) < DEGENERATE_CROSS_EPSILON
                    || vector_length_squared(&c31) < DEGENERATE_CROSS_EPSILON
                    || vector_length_squared(&c12) < DEGENERATE_CROSS_EPSILON
                {
                    continue;
                }

                let denom = dot_product(&n1.normal, &c23);
                if denom.abs() <= DEGENERATE_DENOM_EPSILON {
                    continue;
                }

                // The point solving normal·p = -dist for all three planes:
                //
                //         d1(n2 x n3) + d2(n3 x n1) + d3(n1 x n2)
                //  p = -  ---------------------------------------
                //                   n1 . (n2 x n3)
                let mut point = vector_scale(&c23, n1.dist);
                point = vector_ma(&point, n2.dist, &c31);
                point = vector_ma(&point, n3.dist, &c12);
                point = vector_scale(&point, -1.0 / denom);

                if !point_inside_planes(planes, &point, POINT_ON_PLANE_EPSILON) {
                    continue;
                }

                result.push(point);
            }
        }
    }

    result
}

fn dedupe_points(points: Vec<Vec3>) -> Vec<Vec3> {
    let mut out: Vec<Vec3> = Vec::with_capacity(points.len());
    'points: for p in points {
        for q in &out {
            let d = vector_subtract(&p, q);
            if vector_length_squared(&d) < POINT_ON_PLANE_EPSILON * POINT_ON_PLANE_EPSILON {
                continue 'points;
            }
        }
        out.push(p);
    }
    out
}

// ============================================================
// Brush faces
// ============================================================

/// Collects a brush's clipping sides (from index 6, past the synthesized
/// bounding-box sides) as geometric half-spaces.
pub fn brush_planes(bsp: &CollisionBsp, brush: &CBrush) -> Vec<HalfSpace> {
    let mut planes = Vec::with_capacity(brush.numsides.saturating_sub(6));
    for i in 6..brush.numsides {
        let side = &bsp.brushsides[brush.firstbrushside + i];
        let plane = &bsp.planes[side.plane_idx];
        planes.push(HalfSpace {
            normal: plane.normal,
            dist: -plane.dist,
        });
    }
    planes
}

/// The deduplicated vertex cloud of one brush's polytope.
pub fn brush_vertices(bsp: &CollisionBsp, brush: &CBrush) -> Vec<Vec3> {
    dedupe_points(vertices_from_intersecting_planes(&brush_planes(bsp, brush)))
}

/// Gathers the vertices lying on `plane` and orders them
/// counter-clockwise around the face, seen from the outside.
fn face_polygon(plane: &HalfSpace, vertices: &[Vec3]) -> Vec<Vec3> {
    let mut face: Vec<Vec3> = vertices
        .iter()
        .copied()
        .filter(|v| (dot_product(&plane.normal, v) + plane.dist).abs() <= POINT_ON_PLANE_EPSILON)
        .collect();
    if face.len() < 3 {
        return Vec::new();
    }

    let mut centroid = [0.0f32; 3];
    for v in &face {
        centroid = vector_add(&centroid, v);
    }
    let centroid = vector_scale(&centroid, 1.0 / face.len() as f32);

    let mut u = vector_subtract(&face[0], &centroid);
    if vector_normalize(&mut u) == 0.0 {
        return Vec::new();
    }
    let v_axis = cross_product(&plane.normal, &u);

    face.sort_by(|a, b| {
        let da = vector_subtract(a, &centroid);
        let db = vector_subtract(b, &centroid);
        let angle_a = dot_product(&da, &v_axis).atan2(dot_product(&da, &u));
        let angle_b = dot_product(&db, &v_axis).atan2(dot_product(&db, &u));
        angle_a.partial_cmp(&angle_b).unwrap_or(Ordering::Equal)
    });
    face
}

/// Triangulates one brush into a fan per face, normals taken from the
/// face planes.
pub fn mesh_from_brush(bsp: &CollisionBsp, brush: &CBrush) -> Mesh {
    let planes = brush_planes(bsp, brush);
    let vertices = dedupe_points(vertices_from_intersecting_planes(&planes));

    let mut mesh = Mesh::default();
    for plane in &planes {
        let face = face_polygon(plane, &vertices);
        for i in 1..face.len().saturating_sub(1) {
            for position in [face[0], face[i], face[i + 1]] {
                mesh.vertices.push(MeshVertex {
                    position,
                    normal: plane.normal,
                });
            }
        }
    }
    mesh
}

/// Meshes for every solid brush reachable through the leaf lists. A brush
/// shared by several leaves is meshed once.
pub fn brush_meshes(bsp: &CollisionBsp) -> Vec<Mesh> {
    let mut visited = vec![false; bsp.brushes.len()];
    let mut result = Vec::new();

    for leaf in &bsp.leafs {
        for i in 0..leaf.numleafbrushes {
            let brushnum = bsp.leafbrushes[leaf.firstleafbrush + i] as usize;
            if visited[brushnum] {
                continue;
            }
            visited[brushnum] = true;

            let brush = &bsp.brushes[brushnum];
            if brush.texture_idx < 0 || brush.numsides < 6 {
                continue;
            }
            if bsp.textures[brush.texture_idx as usize].contents & CONTENTS_SOLID == 0 {
                continue;
            }

            let mesh = mesh_from_brush(bsp, brush);
            if !mesh.vertices.is_empty() {
                result.push(mesh);
            }
        }
    }

    result
}

/// All solid brush meshes flattened to interleaved
/// `[x y z nx ny nz]` floats, ready for a vertex buffer.
pub fn brush_meshes_as_triangle_list(bsp: &CollisionBsp) -> Vec<f32> {
    let meshes = brush_meshes(bsp);
    let mut out = Vec::with_capacity(meshes.iter().map(|m| m.vertices.len() * 6).sum());
    for mesh in &meshes {
        for vertex in &mesh.vertices {
            out.extend_from_slice(&vertex.position);
            out.extend_from_slice(&vertex.normal);
        }
    }
    out
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmodel::{CBrushSide, CLeaf, CTexture};
    use crate::math::CPlane;
    use approx::assert_relative_eq;

    /// Half-spaces of the cube spanning [-5,5] on every axis.
    fn cube_halfspaces() -> Vec<HalfSpace> {
        let mut planes = Vec::new();
        for axis in 0..3 {
            let mut neg = [0.0f32; 3];
            neg[axis] = -1.0;
            planes.push(HalfSpace {
                normal: neg,
                dist: -5.0,
            });
            let mut pos = [0.0f32; 3];
            pos[axis] = 1.0;
            planes.push(HalfSpace {
                normal: pos,
                dist: -5.0,
            });
        }
        planes
    }

    fn make_cube_bsp(contents: i32) -> CollisionBsp {
        let mut bsp = CollisionBsp::default();

        let mut name = [0u8; 64];
        name[..18].copy_from_slice(b"textures/test/cube");
        bsp.textures.push(CTexture {
            name,
            flags: 0,
            contents,
        });

        for axis in 0..3 {
            let mut neg = [0.0f32; 3];
            neg[axis] = -1.0;
            bsp.planes.push(CPlane::new(neg, 5.0));
            let mut pos = [0.0f32; 3];
            pos[axis] = 1.0;
            bsp.planes.push(CPlane::new(pos, 5.0));
        }
        for _ in 0..2 {
            for p in 0..6 {
                bsp.brushsides.push(CBrushSide { plane_idx: p });
            }
        }
        bsp.brushes.push(CBrush {
            firstbrushside: 0,
            numsides: 12,
            texture_idx: 0,
            bounds_min: [-5.0; 3],
            bounds_max: [5.0; 3],
        });

        bsp.leafs.push(CLeaf::default());
        bsp.leafs.push(CLeaf {
            cluster: 0,
            area: 0,
            firstleafbrush: 0,
            numleafbrushes: 1,
        });
        bsp.leafbrushes.push(0);
        bsp
    }

    #[test]
    fn test_cube_has_eight_corners() {
        let vertices = vertices_from_intersecting_planes(&cube_halfspaces());
        // Exactly one valid triple per corner: the parallel pairs are all
        // rejected by the cross-product checks.
        assert_eq!(vertices.len(), 8);
        for v in &vertices {
            for c in v {
                assert_relative_eq!(c.abs(), 5.0, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_every_vertex_inside_every_plane() {
        let planes = cube_halfspaces();
        let vertices = vertices_from_intersecting_planes(&planes);
        for v in &vertices {
            for p in &planes {
                let d = dot_product(&p.normal, v) + p.dist;
                assert!(d <= POINT_ON_PLANE_EPSILON, "vertex {:?} outside: {}", v, d);
            }
        }
    }

    #[test]
    fn test_centroid_strictly_inside() {
        let planes = cube_halfspaces();
        let vertices = vertices_from_intersecting_planes(&planes);
        let mut centroid = [0.0f32; 3];
        for v in &vertices {
            centroid = vector_add(&centroid, v);
        }
        let centroid = vector_scale(&centroid, 1.0 / vertices.len() as f32);
        for p in &planes {
            assert!(dot_product(&p.normal, &centroid) + p.dist < 0.0);
        }
    }

    #[test]
    fn test_truncated_corner_gains_vertices() {
        let mut planes = cube_halfspaces();
        // Shave the (+,+,+) corner with x+y+z = 9.
        let mut n = [1.0f32, 1.0, 1.0];
        let len = vector_normalize(&mut n);
        planes.push(HalfSpace {
            normal: n,
            dist: -9.0 / len,
        });

        let vertices = dedupe_points(vertices_from_intersecting_planes(&planes));
        // One corner removed, three cut points added.
        assert_eq!(vertices.len(), 10);
        for v in &vertices {
            assert!(v[0] + v[1] + v[2] <= 9.0 + 0.05);
        }
    }

    #[test]
    fn test_unbounded_plane_set_has_no_vertices() {
        // Only x and y planes: every triple contains a parallel pair.
        let planes: Vec<HalfSpace> = cube_halfspaces().into_iter().take(4).collect();
        assert!(vertices_from_intersecting_planes(&planes).is_empty());
    }

    #[test]
    fn test_near_parallel_triples_are_skipped() {
        let planes = vec![
            HalfSpace {
                normal: [0.0, 0.0, 1.0],
                dist: -1.0,
            },
            HalfSpace {
                normal: [0.0, 1e-3, 1.0],
                dist: -1.0,
            },
            HalfSpace {
                normal: [1e-3, 0.0, 1.0],
                dist: -1.0,
            },
        ];
        assert!(vertices_from_intersecting_planes(&planes).is_empty());
    }

    #[test]
    fn test_cube_mesh_triangles_and_winding() {
        let bsp = make_cube_bsp(CONTENTS_SOLID);
        let mesh = mesh_from_brush(&bsp, &bsp.brushes[0]);

        // Six quad faces, two triangles each.
        assert_eq!(mesh.triangle_count(), 12);

        for tri in mesh.vertices.chunks(3) {
            let e1 = vector_subtract(&tri[1].position, &tri[0].position);
            let e2 = vector_subtract(&tri[2].position, &tri[0].position);
            let geometric = cross_product(&e1, &e2);
            assert!(
                dot_product(&geometric, &tri[0].normal) > 0.0,
                "triangle wound against its face normal"
            );
        }
    }

    #[test]
    fn test_brush_meshes_walks_leaves() {
        let bsp = make_cube_bsp(CONTENTS_SOLID);
        let meshes = brush_meshes(&bsp);
        assert_eq!(meshes.len(), 1);
        assert_eq!(meshes[0].triangle_count(), 12);
    }

    #[test]
    fn test_brush_meshes_skips_non_solid() {
        let bsp = make_cube_bsp(0);
        assert!(brush_meshes(&bsp).is_empty());
    }

    #[test]
    fn test_shared_brush_meshed_once() {
        let mut bsp = make_cube_bsp(CONTENTS_SOLID);
        // A second leaf referencing the same brush.
        bsp.leafbrushes.push(0);
        bsp.leafs.push(CLeaf {
            cluster: 0,
            area: 0,
            firstleafbrush: 1,
            numleafbrushes: 1,
        });
        assert_eq!(brush_meshes(&bsp).len(), 1);
    }

    #[test]
    fn test_triangle_list_interleaving() {
        let bsp = make_cube_bsp(CONTENTS_SOLID);
        let floats = brush_meshes_as_triangle_list(&bsp);
        assert_eq!(floats.len(), 12 * 3 * 6);
    }

    #[test]
    fn test_brush_vertices_deduplicated() {
        let bsp = make_cube_bsp(CONTENTS_SOLID);
        let vertices = brush_vertices(&bsp, &bsp.brushes[0]);
        assert_eq!(vertices.len(), 8);
    }
}
