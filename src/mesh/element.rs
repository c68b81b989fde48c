use super::arena::Key;
use super::handle::{SubHandle, TriFace};

/// Identifier aliases into the three element arenas.
pub type TetId = Key;
pub type ShellId = Key;
pub type PointId = Key;

/// The role a vertex plays in the mesh.
///
/// Input vertices are classified once the boundary is known; vertices created
/// by refinement are `Free*` and may be relocated or deleted again.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VertexKind {
    /// Read from input, not yet classified.
    Input,
    /// Input vertex with two incident segments forming a small angle.
    Acute,
    /// Input vertex without such a segment pair.
    NonAcute,
    /// Input vertex interior to a facet.
    Facet,
    /// Steiner vertex on a segment.
    FreeSegment,
    /// Steiner vertex on a subface.
    FreeSubface,
    /// Steiner vertex in the interior.
    FreeVolume,
    /// Deleted, slot awaiting recycling.
    Dead,
}

/// The role a subsegment plays for refinement priorities.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SegmentKind {
    Input,
    /// Two facets meet at this segment at a dihedral angle below 90 degrees.
    Sharp,
    NonSharp,
}

/// Discriminates the two uses of the shared boundary-element record.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ShellKind {
    Subface,
    Subsegment,
}

/// A mesh vertex.
#[derive(Clone, Debug)]
pub struct Point {
    pub coords: [f64; 3],
    pub attrs: Vec<f64>,
    pub marker: i32,
    pub kind: VertexKind,
    /// One incident tetrahedron, the seed for point location. May be stale;
    /// readers check liveness.
    pub tet: TetId,
    /// Before full insertion: the coincident vertex this one duplicates.
    pub dual: PointId,
}

impl Point {
    pub fn new(coords: [f64; 3]) -> Self {
        Self {
            coords,
            attrs: Vec::new(),
            marker: 0,
            kind: VertexKind::Input,
            tet: Key::NONE,
            dual: Key::NONE,
        }
    }
}

/// A tetrahedron.
///
/// Corners are ordered so the fourth lies above the oriented plane of the
/// first three (negative orientation). Neighbors and subface bonds are stored
/// per face, indexed by the face opposite the same-numbered corner layout of
/// the navigation tables. Absent neighbors hold the outer sentinel, absent
/// subfaces the vacuous sentinel.
#[derive(Clone, Debug)]
pub struct Tetra {
    pub corners: [PointId; 4],
    pub neighbors: [TriFace; 4],
    pub subs: [SubHandle; 4],
    pub attrs: Vec<f64>,
    pub volume_bound: Option<f64>,
    /// Mid-edge nodes for second-order output, in the fixed edge order
    /// (01, 12, 20, 03, 13, 23).
    pub high_order: Option<[PointId; 6]>,
    pub infected: bool,
}

impl Tetra {
    pub fn new(corners: [PointId; 4]) -> Self {
        Self {
            corners,
            neighbors: [TriFace::NONE; 4],
            subs: [SubHandle::NONE; 4],
            attrs: Vec::new(),
            volume_bound: None,
            high_order: None,
            infected: false,
        }
    }
}

/// The shared boundary-element record: a subface (boundary triangle) or a
/// subsegment (boundary edge).
///
/// For a subface, `ring[e]` is the next element in the face ring around edge
/// `e` and `segs[e]` the subsegment bonded to edge `e`. For a subsegment,
/// `ring[0]`/`ring[1]` are the collinear neighbor segments at its two
/// endpoints and `segs[0]` backlinks one subface containing it.
#[derive(Clone, Debug)]
pub struct Shell {
    pub kind: ShellKind,
    pub verts: [PointId; 3],
    pub ring: [SubHandle; 3],
    pub segs: [ShellId; 3],
    pub tets: [TriFace; 2],
    pub marker: i32,
    pub seg_kind: SegmentKind,
    pub infected: bool,
}

impl Shell {
    pub fn subface(verts: [PointId; 3]) -> Self {
        Self {
            kind: ShellKind::Subface,
            verts,
            ring: [SubHandle::NONE; 3],
            segs: [Key::NONE; 3],
            tets: [TriFace::NONE; 2],
            marker: 0,
            seg_kind: SegmentKind::Input,
            infected: false,
        }
    }

    pub fn subsegment(org: PointId, dest: PointId) -> Self {
        Self {
            kind: ShellKind::Subsegment,
            verts: [org, dest, Key::NONE],
            ring: [SubHandle::NONE; 3],
            segs: [Key::NONE; 3],
            tets: [TriFace::NONE; 2],
            marker: 0,
            seg_kind: SegmentKind::Input,
            infected: false,
        }
    }
}
