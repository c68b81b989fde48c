use core::fmt;

use super::arena::Key;
use super::element::{ShellId, TetId};

// For each face index within a tetrahedron, the corner indices of that face
// in edge-ring order. Corner layout: face 0 = (v0, v1, v2), face 1 =
// (v0, v3, v1), face 2 = (v1, v3, v2), face 3 = (v2, v3, v0).
//
// A directed handle is (tet, face 0..3, ver 0..5). Even versions walk the
// face's edge ring counterclockwise, odd versions are their reversals.

/// Edge-version successor within a face ring.
pub(crate) const VER_NEXT: [u8; 6] = [2, 5, 4, 1, 0, 3];

/// Face-relative corner of the version's origin / destination / apex.
pub(crate) const VER_ORG: [usize; 6] = [0, 1, 1, 2, 2, 0];
pub(crate) const VER_DEST: [usize; 6] = [1, 0, 2, 1, 0, 2];
pub(crate) const VER_APEX: [usize; 6] = [2, 2, 0, 0, 1, 1];

/// Tet-relative corner of a handle's origin, by (face, ver).
pub(crate) const FACE_ORG: [[usize; 6]; 4] = [
    [0, 1, 1, 2, 2, 0],
    [0, 3, 3, 1, 1, 0],
    [1, 3, 3, 2, 2, 1],
    [2, 3, 3, 0, 0, 2],
];
pub(crate) const FACE_DEST: [[usize; 6]; 4] = [
    [1, 0, 2, 1, 0, 2],
    [3, 0, 1, 3, 0, 1],
    [3, 1, 2, 3, 1, 2],
    [3, 2, 0, 3, 2, 0],
];
pub(crate) const FACE_APEX: [[usize; 6]; 4] = [
    [2, 2, 0, 0, 1, 1],
    [1, 1, 0, 0, 3, 3],
    [2, 2, 1, 1, 3, 3],
    [0, 0, 2, 2, 3, 3],
];

/// Tet-relative corner opposite each face.
pub(crate) const FACE_OPPO: [usize; 4] = [3, 2, 0, 1];

/// Face-ring successor within the same tetrahedron, by (face, ver).
/// Valid for even versions only; odd versions cross to the neighbor tet.
pub(crate) const FACE_RING_NEXT: [[[i8; 2]; 6]; 4] = [
    [[1, 5], [-1, -1], [2, 5], [-1, -1], [3, 5], [-1, -1]],
    [[3, 3], [-1, -1], [2, 1], [-1, -1], [0, 1], [-1, -1]],
    [[1, 3], [-1, -1], [3, 1], [-1, -1], [0, 3], [-1, -1]],
    [[2, 3], [-1, -1], [1, 1], [-1, -1], [0, 5], [-1, -1]],
];

/// For enumerating a triangle's edges.
pub(crate) const PLUS1_MOD3: [usize; 3] = [1, 2, 0];
pub(crate) const MINUS1_MOD3: [usize; 3] = [2, 0, 1];

/// A directed face handle: one face of a tetrahedron together with one of the
/// face's six oriented edges.
///
/// Handles are plain values. Navigation that only permutes the handle is
/// implemented here; navigation that follows stored topology lives on
/// [`super::Mesh`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TriFace {
    pub tet: TetId,
    pub face: u8,
    pub ver: u8,
}

impl Default for TriFace {
    fn default() -> Self {
        Self::NONE
    }
}

impl TriFace {
    pub const NONE: TriFace = TriFace {
        tet: Key::NONE,
        face: 0,
        ver: 0,
    };

    pub const fn new(tet: TetId, face: u8, ver: u8) -> Self {
        Self { tet, face, ver }
    }

    pub const fn is_none(&self) -> bool {
        self.tet.is_none()
    }

    /// Same directed edge, other face of the same undirected edge ring.
    pub const fn esym(self) -> Self {
        Self {
            ver: self.ver ^ 1,
            ..self
        }
    }

    /// Successor edge in the face's edge ring.
    pub const fn enext(self) -> Self {
        Self {
            ver: VER_NEXT[self.ver as usize],
            ..self
        }
    }

    /// Predecessor edge in the face's edge ring.
    pub const fn enext2(self) -> Self {
        Self {
            ver: VER_NEXT[VER_NEXT[self.ver as usize] as usize],
            ..self
        }
    }

    /// Force the handle onto the counterclockwise (even) edge ring.
    pub const fn ccw(self) -> Self {
        if self.ver & 1 == 1 {
            self.esym()
        } else {
            self
        }
    }

    /// True if the two handles denote the same undirected face.
    pub fn same_face(&self, other: &TriFace) -> bool {
        self.tet == other.tet && self.face == other.face
    }
}

impl fmt::Display for TriFace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{}.f{}.v{}", self.tet, self.face, self.ver)
    }
}

/// A directed boundary-element handle: a subface with one of its six oriented
/// edges, or a subsegment with one of its two orientations.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SubHandle {
    pub shell: ShellId,
    pub ver: u8,
}

impl Default for SubHandle {
    fn default() -> Self {
        Self::NONE
    }
}

impl SubHandle {
    pub const NONE: SubHandle = SubHandle {
        shell: Key::NONE,
        ver: 0,
    };

    pub const fn new(shell: ShellId, ver: u8) -> Self {
        Self { shell, ver }
    }

    pub const fn is_none(&self) -> bool {
        self.shell.is_none()
    }

    /// The edge slot (0..3) this version addresses.
    pub const fn edge(&self) -> usize {
        (self.ver >> 1) as usize
    }

    /// The side (0 or 1) this version addresses for tet bonds.
    pub const fn side(&self) -> usize {
        (self.ver & 1) as usize
    }

    pub const fn sesym(self) -> Self {
        Self {
            ver: self.ver ^ 1,
            ..self
        }
    }

    pub const fn senext(self) -> Self {
        Self {
            ver: VER_NEXT[self.ver as usize],
            ..self
        }
    }

    pub const fn senext2(self) -> Self {
        Self {
            ver: VER_NEXT[VER_NEXT[self.ver as usize] as usize],
            ..self
        }
    }

    pub const fn ccw(self) -> Self {
        if self.ver & 1 == 1 {
            self.sesym()
        } else {
            self
        }
    }
}

impl fmt::Display for SubHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "s{}.v{}", self.shell, self.ver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_ring_cycles() {
        // The even and odd rings are disjoint three-cycles.
        for start in 0..6u8 {
            let mut ver = start;
            for _ in 0..3 {
                ver = VER_NEXT[ver as usize];
                assert_eq!(ver & 1, start & 1);
            }
            assert_eq!(ver, start);
        }
    }

    #[test]
    fn version_tables_are_consistent() {
        // Origin of the reversed version equals the destination, per face.
        for face in 0..4 {
            for ver in 0..6 {
                assert_eq!(FACE_ORG[face][ver ^ 1], FACE_DEST[face][ver]);
                assert_eq!(FACE_DEST[face][ver ^ 1], FACE_ORG[face][ver]);
                assert_eq!(FACE_APEX[face][ver ^ 1], FACE_APEX[face][ver]);
                // Each version touches three distinct corners, none opposite.
                assert_ne!(FACE_ORG[face][ver], FACE_OPPO[face]);
                assert_ne!(FACE_DEST[face][ver], FACE_OPPO[face]);
                assert_ne!(FACE_APEX[face][ver], FACE_OPPO[face]);
            }
        }
    }

    #[test]
    fn face_ring_successor_shares_the_edge() {
        // For every even version, the in-tet ring successor addresses the
        // same directed edge on the other face containing it.
        for face in 0..4usize {
            for ver in (0..6).step_by(2) {
                let [nface, nver] = FACE_RING_NEXT[face][ver];
                assert!(nface >= 0);
                let (nface, nver) = (nface as usize, nver as usize);
                assert_ne!(nface, face);
                assert_eq!(FACE_ORG[face][ver], FACE_ORG[nface][nver]);
                assert_eq!(FACE_DEST[face][ver], FACE_DEST[nface][nver]);
            }
        }
    }
}
