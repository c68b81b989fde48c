//! The in-memory geometry exchange structures: everything the engine
//! consumes and produces, as plain arrays, plus the behavior switches that
//! control a run.

/// A planar polygon, given as an ordered list of vertex indices (indices are
/// `first_number`-based, like every index in [`MeshData`]).
#[derive(Clone, Debug, Default)]
pub struct Polygon {
    pub vertices: Vec<usize>,
}

/// A planar facet: one or more polygons, optionally with hole points lying
/// inside the facet plane.
#[derive(Clone, Debug, Default)]
pub struct Facet {
    pub polygons: Vec<Polygon>,
    pub holes: Vec<[f64; 3]>,
}

/// A region marker: a point inside a region, the attribute to propagate and
/// the volume bound for that region (non-positive means unbounded).
#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub point: [f64; 3],
    pub attribute: f64,
    pub volume: f64,
}

/// The array-based exchange structure passed into and out of the engine.
///
/// Coordinates are flat (three reals per point); every index is based at
/// `first_number` (0 or 1).
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    /// Index base of every index stored here, 0 or 1.
    pub first_number: usize,

    /// Flat point coordinates, three per point.
    pub points: Vec<f64>,
    /// Per-point attributes, `num_point_attrs` per point.
    pub point_attrs: Vec<f64>,
    pub num_point_attrs: usize,
    /// One marker per point.
    pub point_markers: Vec<i32>,

    pub facets: Vec<Facet>,
    /// One marker per facet.
    pub facet_markers: Vec<i32>,

    /// Points marking cavities to carve out entirely.
    pub holes: Vec<[f64; 3]>,
    /// Region markers for attribute and volume-bound propagation.
    pub regions: Vec<Region>,

    /// Tetrahedron corners, `corners_per_tet` per tetrahedron (4 linear, 10
    /// with mid-edge nodes). Input in refine mode, output otherwise.
    pub tetrahedra: Vec<usize>,
    pub corners_per_tet: usize,
    /// Per-tetrahedron attributes, `num_tet_attrs` per tetrahedron.
    pub tet_attrs: Vec<f64>,
    pub num_tet_attrs: usize,
    /// Per-tetrahedron volume constraints (refine-mode input).
    pub tet_volumes: Vec<f64>,
    /// Four neighbor tetrahedron indices per tetrahedron, -1 at the hull.
    pub neighbors: Vec<i64>,

    /// Boundary triangles, three corners each, with markers.
    pub tri_faces: Vec<usize>,
    pub tri_face_markers: Vec<i32>,

    /// Boundary edges, two endpoints each, with markers.
    pub edges: Vec<usize>,
    pub edge_markers: Vec<i32>,
}

impl MeshData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_points(&self) -> usize {
        self.points.len() / 3
    }

    /// The coordinates of point `i` (0-based, regardless of
    /// `first_number`).
    pub fn point(&self, i: usize) -> [f64; 3] {
        [
            self.points[3 * i],
            self.points[3 * i + 1],
            self.points[3 * i + 2],
        ]
    }

    pub fn num_tetrahedra(&self) -> usize {
        if self.corners_per_tet == 0 {
            0
        } else {
            self.tetrahedra.len() / self.corners_per_tet
        }
    }

    /// Convenience: a facet that is one simple polygon.
    pub fn push_polygon_facet(&mut self, vertices: Vec<usize>, marker: i32) {
        self.facets.push(Facet {
            polygons: vec![Polygon { vertices }],
            holes: Vec::new(),
        });
        self.facet_markers.push(marker);
    }
}

/// The behavior switches controlling one run, mirroring the command-line
/// surface of the external driver.
#[derive(Clone, Debug)]
pub struct Behavior {
    /// Treat the input as a PLC: triangulate facets, recover segments and
    /// facets, carve holes.
    pub plc: bool,
    /// Refine an existing mesh given in the input arrays.
    pub refine: bool,
    /// Enable quality refinement.
    pub quality: bool,
    /// Radius-edge ratio bound for quality refinement.
    pub min_ratio: f64,
    /// Apply per-tetrahedron volume constraints from region markers.
    pub var_volume: bool,
    /// Apply one global volume constraint.
    pub fixed_volume: bool,
    pub max_volume: f64,
    /// Run the sliver-removal pass.
    pub remove_sliver: bool,
    /// Minimum acceptable dihedral angle (degrees) for sliver removal.
    pub max_dihedral: f64,
    /// Propagate region attributes onto tetrahedra.
    pub region_attrib: bool,
    /// Relative tolerance for snapping nearly-coincident configurations.
    pub epsilon: f64,
    /// Suppress merging of coplanar facets.
    pub no_merge: bool,
    /// Run the exact facet-intersection check before meshing.
    pub detect_inter: bool,
    /// Element order: 1 (linear) or 2 (one mid-edge node per edge).
    pub order: usize,
    /// Suppress Steiner points on boundary segments/facets.
    pub no_bisect: bool,
    /// Suppress flips entirely (diagnostic).
    pub no_flip: bool,
    /// Output boundary faces / edges / neighbors.
    pub faces_out: bool,
    pub edges_out: bool,
    pub neighbors_out: bool,
    /// Cap on refinement-added points; `None` picks a heuristic bound.
    pub max_steiner: Option<usize>,
    pub quiet: bool,
    pub verbose: u8,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            plc: false,
            refine: false,
            quality: false,
            min_ratio: std::f64::consts::SQRT_2,
            var_volume: false,
            fixed_volume: false,
            max_volume: -1.0,
            remove_sliver: false,
            max_dihedral: 0.0,
            region_attrib: false,
            epsilon: 1.0e-8,
            no_merge: false,
            detect_inter: false,
            order: 1,
            no_bisect: false,
            no_flip: false,
            faces_out: false,
            edges_out: false,
            neighbors_out: false,
            max_steiner: None,
            quiet: false,
            verbose: 0,
        }
    }
}

/// Per-run statistics, reported alongside the output mesh.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    pub input_points: usize,
    pub inserted_points: usize,
    pub duplicate_points: usize,
    pub steiner_points: usize,
    pub out_tetrahedra: usize,
    pub hull_faces: usize,
    pub flip23: u64,
    pub flip32: u64,
    pub flip22: u64,
    pub flip44: u64,
    /// Quality refinement hit its iteration bound before satisfying the
    /// ratio everywhere.
    pub non_convergent: bool,
    /// Slivers that could not be repaired and remain in the mesh.
    pub irreparable_slivers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_data_accessors() {
        let mut data = MeshData::new();
        data.points = vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0];
        assert_eq!(data.num_points(), 2);
        assert_eq!(data.point(1), [1.0, 2.0, 3.0]);

        data.push_polygon_facet(vec![0, 1], 7);
        assert_eq!(data.facets.len(), 1);
        assert_eq!(data.facet_markers, vec![7]);
    }

    #[test]
    fn default_behavior_matches_documented_defaults() {
        let b = Behavior::default();
        assert_eq!(b.min_ratio, std::f64::consts::SQRT_2);
        assert_eq!(b.epsilon, 1.0e-8);
        assert_eq!(b.order, 1);
        assert!(!b.plc && !b.quality && !b.refine);
    }
}
