#![allow(clippy::needless_range_loop, clippy::comparison_chain)]

// Quake 3 BSP collision detection.
//
// Load a map with `CollisionBsp::from_bytes`, then sweep rays, spheres or
// boxes through it with `trace`. `brushmesh` turns the collision brushes
// back into triangle meshes for visualization.

pub mod bspfile;
pub mod brushmesh;
pub mod cmodel;
pub mod math;
pub mod trace;

pub use cmodel::{BspError, CollisionBsp};
pub use trace::{trace, Bounds, PathInfo, TraceResult, TraceShape};
