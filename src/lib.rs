//! # tetmesh
//!
//! Quality tetrahedral mesh generation and 3D Delaunay tetrahedralization.
//!
//! The crate computes exact Delaunay tetrahedralizations of point sets,
//! constrained Delaunay tetrahedralizations of piecewise-linear complexes
//! (PLCs), and quality meshes whose tetrahedra have bounded radius-edge
//! ratio, for consumption by numerical-simulation toolchains.
//!
//! ```
//! use tetmesh::{tetrahedralize, Behavior, MeshData};
//!
//! // The eight corners of the unit cube.
//! let mut input = MeshData::new();
//! input.points = vec![
//!     0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0,
//!     0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0,
//! ];
//!
//! let out = tetrahedralize(&Behavior::default(), &input).unwrap();
//! assert!(out.num_tetrahedra() == 5 || out.num_tetrahedra() == 6);
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub use engine::{tetrahedralize, tetrahedralize_with_stats};
pub use exchange::{Behavior, Facet, MeshData, Polygon, Region, Statistics};

mod constrain;
mod engine;
pub mod exchange;
mod flip;
pub mod geometry;
mod hilbert;
mod insert;
mod intersect;
mod locate;
pub mod mesh;
pub mod predicates;
mod quality;
mod surface;
