//! Pooled mesh storage and the directed-handle algebra over it.
//!
//! The mesh owns three generational arenas (tetrahedra, boundary elements,
//! points) plus two sentinels: the outer tetrahedron occupying unbounded
//! space, so every face always has two sides, and the vacuous boundary
//! element filling absent subface/subsegment bonds.
//!
//! All navigation primitives are closed-form table lookups plus one arena
//! access; the only searching helpers are the explicitly named `find_*`
//! routines.

pub mod arena;
pub mod element;
pub mod handle;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::predicates;
use arena::{Arena, Key};
use element::{Point, PointId, SegmentKind, Shell, ShellId, ShellKind, Tetra, TetId, VertexKind};
use handle::{SubHandle, TriFace, FACE_APEX, FACE_DEST, FACE_OPPO, FACE_ORG, FACE_RING_NEXT};

/// The mutable mesh: tetrahedra, subfaces, subsegments and points, exclusively
/// owned by one engine instance for the duration of a run.
pub struct Mesh {
    pub(crate) tets: Arena<Tetra>,
    pub(crate) shells: Arena<Shell>,
    pub(crate) points: Arena<Point>,

    /// Sentinel tetrahedron filling outer space.
    pub(crate) outer: TetId,
    /// Sentinel boundary element filling absent bonds.
    pub(crate) vacuous: ShellId,

    /// Recently visited tetrahedron, seeds point location.
    pub(crate) recent: TriFace,

    /// Seeded generator for the random-sample location scheme; a fixed seed
    /// keeps runs deterministic for a given input and insertion order.
    pub(crate) rng: StdRng,

    // Bounding box of the input points and the longest representable edge.
    pub(crate) xmin: f64,
    pub(crate) xmax: f64,
    pub(crate) ymin: f64,
    pub(crate) ymax: f64,
    pub(crate) zmin: f64,
    pub(crate) zmax: f64,
    pub(crate) longest: f64,

    /// Are subfaces present yet? Flips consult bonds only when set.
    pub(crate) check_subfaces: bool,

    // Flip statistics.
    pub(crate) flip23s: u64,
    pub(crate) flip32s: u64,
    pub(crate) flip22s: u64,
    pub(crate) flip44s: u64,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

#[cold]
fn stale_handle(what: &str) -> ! {
    panic!("internal error: stale {what} handle, mesh topology is inconsistent");
}

impl Mesh {
    pub fn new() -> Self {
        let mut tets = Arena::new();
        let mut shells = Arena::new();
        let outer = tets.insert(Tetra::new([Key::NONE; 4]));
        let vacuous = shells.insert(Shell::subface([Key::NONE; 3]));
        Self {
            tets,
            shells,
            points: Arena::new(),
            outer,
            vacuous,
            recent: TriFace::NONE,
            rng: StdRng::seed_from_u64(0x7e7),
            xmin: 0.0,
            xmax: 0.0,
            ymin: 0.0,
            ymax: 0.0,
            zmin: 0.0,
            zmax: 0.0,
            longest: 0.0,
            check_subfaces: false,
            flip23s: 0,
            flip32s: 0,
            flip22s: 0,
            flip44s: 0,
        }
    }

    // ------------------------------------------------------------------
    // Record access. A stale handle here is a logic defect; continuing
    // would silently corrupt the mesh, so these abort with a diagnostic.
    // ------------------------------------------------------------------

    #[track_caller]
    pub fn tet(&self, t: TetId) -> &Tetra {
        match self.tets.get(t) {
            Some(tet) => tet,
            None => stale_handle("tetrahedron"),
        }
    }

    #[track_caller]
    pub(crate) fn tet_mut(&mut self, t: TetId) -> &mut Tetra {
        match self.tets.get_mut(t) {
            Some(tet) => tet,
            None => stale_handle("tetrahedron"),
        }
    }

    #[track_caller]
    pub fn shell(&self, s: ShellId) -> &Shell {
        match self.shells.get(s) {
            Some(sh) => sh,
            None => stale_handle("boundary element"),
        }
    }

    #[track_caller]
    pub(crate) fn shell_mut(&mut self, s: ShellId) -> &mut Shell {
        match self.shells.get_mut(s) {
            Some(sh) => sh,
            None => stale_handle("boundary element"),
        }
    }

    #[track_caller]
    pub fn point(&self, p: PointId) -> &Point {
        match self.points.get(p) {
            Some(pt) => pt,
            None => stale_handle("point"),
        }
    }

    #[track_caller]
    pub(crate) fn point_mut(&mut self, p: PointId) -> &mut Point {
        match self.points.get_mut(p) {
            Some(pt) => pt,
            None => stale_handle("point"),
        }
    }

    #[track_caller]
    pub fn pos(&self, p: PointId) -> [f64; 3] {
        self.point(p).coords
    }

    // ------------------------------------------------------------------
    // Element creation and recycling.
    // ------------------------------------------------------------------

    pub(crate) fn make_point(&mut self, coords: [f64; 3], kind: VertexKind) -> PointId {
        let mut point = Point::new(coords);
        point.kind = kind;
        self.points.insert(point)
    }

    pub(crate) fn kill_point(&mut self, p: PointId) {
        if let Some(point) = self.points.get_mut(p) {
            point.kind = VertexKind::Dead;
        }
        self.points.remove(p);
    }

    /// Creates a tetrahedron over the four corners, swapping the first two if
    /// needed so the fourth corner has negative orientation with respect to
    /// the first three. Corner points get their location seed updated.
    pub(crate) fn make_tet(&mut self, a: PointId, b: PointId, c: PointId, d: PointId) -> TetId {
        let corners = if self.orient4_sign(a, b, c, d) < 0 {
            [a, b, c, d]
        } else {
            [b, a, c, d]
        };
        let t = self.tets.insert(Tetra::new(corners));
        for p in corners {
            self.point_mut(p).tet = t;
        }
        t
    }

    pub(crate) fn kill_tet(&mut self, t: TetId) {
        debug_assert_ne!(t, self.outer);
        self.tets.remove(t);
    }

    pub(crate) fn make_subface(
        &mut self,
        verts: [PointId; 3],
        marker: i32,
    ) -> ShellId {
        let mut sh = Shell::subface(verts);
        sh.marker = marker;
        self.shells.insert(sh)
    }

    pub(crate) fn make_subsegment(&mut self, org: PointId, dest: PointId, marker: i32) -> ShellId {
        let mut sh = Shell::subsegment(org, dest);
        sh.marker = marker;
        sh.seg_kind = SegmentKind::Input;
        self.shells.insert(sh)
    }

    pub(crate) fn kill_shell(&mut self, s: ShellId) {
        debug_assert_ne!(s, self.vacuous);
        self.shells.remove(s);
    }

    /// Live tetrahedra, excluding the outer sentinel.
    pub fn tet_ids(&self) -> Vec<TetId> {
        self.tets
            .iter()
            .map(|(k, _)| k)
            .filter(|&k| k != self.outer)
            .collect()
    }

    /// Live boundary elements of the given kind.
    pub fn shell_ids(&self, kind: ShellKind) -> Vec<ShellId> {
        self.shells
            .iter()
            .filter(|&(k, sh)| k != self.vacuous && sh.kind == kind)
            .map(|(k, _)| k)
            .collect()
    }

    pub fn num_tets(&self) -> usize {
        self.tets.len() - 1
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Number of hull faces.
    pub fn hull_size(&self) -> usize {
        let mut n = 0;
        for (t, tet) in self.tets.iter() {
            if t == self.outer {
                continue;
            }
            n += tet
                .neighbors
                .iter()
                .filter(|nb| nb.is_none() || nb.tet == self.outer)
                .count();
        }
        n
    }

    // ------------------------------------------------------------------
    // Tetrahedron navigation primitives.
    // ------------------------------------------------------------------

    pub fn is_outer(&self, t: TriFace) -> bool {
        t.is_none() || t.tet == self.outer
    }

    /// The opposite handle across the face: same face, other tetrahedron.
    /// Returns a handle on the outer sentinel at the hull.
    pub fn sym(&self, t: TriFace) -> TriFace {
        let nb = self.tet(t.tet).neighbors[t.face as usize];
        if nb.is_none() {
            TriFace::new(self.outer, 0, 0)
        } else {
            nb
        }
    }

    pub fn sym_exists(&self, t: TriFace) -> bool {
        !self.is_outer(self.sym(t))
    }

    /// Glues two handles referring to the same geometric face.
    pub fn bond(&mut self, t1: TriFace, t2: TriFace) {
        self.tet_mut(t1.tet).neighbors[t1.face as usize] = TriFace::new(t2.tet, t2.face, 0);
        self.tet_mut(t2.tet).neighbors[t2.face as usize] = TriFace::new(t1.tet, t1.face, 0);
    }

    /// Detaches the neighbor: `t` becomes a hull face. The outer sentinel
    /// keeps a backlink to one hull face for hull walks.
    pub fn dissolve(&mut self, t: TriFace) {
        self.tet_mut(t.tet).neighbors[t.face as usize] = TriFace::new(self.outer, 0, 0);
        self.tet_mut(self.outer).neighbors[0] = TriFace::new(t.tet, t.face, 0);
    }

    /// One hull face, if the mesh has any.
    pub fn hull_face(&self) -> Option<TriFace> {
        let seed = self.tet(self.outer).neighbors[0];
        if !seed.is_none() && self.tets.contains(seed.tet) && !self.sym_exists(seed) {
            return Some(seed);
        }
        for (t, tet) in self.tets.iter() {
            if t == self.outer {
                continue;
            }
            for face in 0..4u8 {
                let nb = tet.neighbors[face as usize];
                if nb.is_none() || nb.tet == self.outer {
                    return Some(TriFace::new(t, face, 0));
                }
            }
        }
        None
    }

    pub fn org(&self, t: TriFace) -> PointId {
        self.tet(t.tet).corners[FACE_ORG[t.face as usize][t.ver as usize]]
    }

    pub fn dest(&self, t: TriFace) -> PointId {
        self.tet(t.tet).corners[FACE_DEST[t.face as usize][t.ver as usize]]
    }

    pub fn apex(&self, t: TriFace) -> PointId {
        self.tet(t.tet).corners[FACE_APEX[t.face as usize][t.ver as usize]]
    }

    pub fn oppo(&self, t: TriFace) -> PointId {
        self.tet(t.tet).corners[FACE_OPPO[t.face as usize]]
    }

    pub fn set_org(&mut self, t: TriFace, p: PointId) {
        self.tet_mut(t.tet).corners[FACE_ORG[t.face as usize][t.ver as usize]] = p;
    }

    pub fn set_dest(&mut self, t: TriFace, p: PointId) {
        self.tet_mut(t.tet).corners[FACE_DEST[t.face as usize][t.ver as usize]] = p;
    }

    pub fn set_apex(&mut self, t: TriFace, p: PointId) {
        self.tet_mut(t.tet).corners[FACE_APEX[t.face as usize][t.ver as usize]] = p;
    }

    pub fn set_oppo(&mut self, t: TriFace, p: PointId) {
        self.tet_mut(t.tet).corners[FACE_OPPO[t.face as usize]] = p;
    }

    pub fn face_verts(&self, t: TriFace) -> [PointId; 3] {
        [self.org(t), self.dest(t), self.apex(t)]
    }

    /// Successor in the face ring around the directed edge of `t`.
    /// `None` when the ring leaves the hull.
    pub fn fnext(&self, t: TriFace) -> Option<TriFace> {
        let [nf, nv] = FACE_RING_NEXT[t.face as usize][t.ver as usize];
        if nf >= 0 {
            return Some(TriFace::new(t.tet, nf as u8, nv as u8));
        }
        // The successor lives in the neighbor; re-find the directed edge
        // there, then step within that tetrahedron.
        let mut s = self.sym(t);
        if self.is_outer(s) {
            return None;
        }
        let torg = self.org(t);
        s.ver = 0;
        for _ in 0..3 {
            if self.org(s) == torg {
                break;
            }
            s = s.enext();
        }
        debug_assert_eq!(self.org(s), torg);
        let [nf2, nv2] = FACE_RING_NEXT[s.face as usize][s.ver as usize];
        Some(TriFace::new(s.tet, nf2 as u8, nv2 as u8))
    }

    /// Rotates `t` within its face so that its origin is `p`.
    /// False if `p` is not a vertex of the face.
    pub fn find_org(&self, t: &mut TriFace, p: PointId) -> bool {
        for _ in 0..3 {
            if self.org(*t) == p {
                return true;
            }
            *t = t.enext();
        }
        *t = t.esym();
        for _ in 0..3 {
            if self.org(*t) == p {
                return true;
            }
            *t = t.enext();
        }
        false
    }

    /// Rotates `t` within its tetrahedron so that its directed edge is
    /// `eorg -> edest`, keeping the face fixed. False if the face lacks the
    /// edge.
    pub fn find_edge(&self, t: &mut TriFace, eorg: PointId, edest: PointId) -> bool {
        for ver in 0..6u8 {
            let cand = TriFace::new(t.tet, t.face, ver);
            if self.org(cand) == eorg && self.dest(cand) == edest {
                *t = cand;
                return true;
            }
        }
        false
    }

    /// The face of tetrahedron `t` whose vertex set is `{a, b, c}`, oriented
    /// so that org = `a`, dest = `b`, apex = `c`.
    pub fn face_of(&self, t: TetId, a: PointId, b: PointId, c: PointId) -> Option<TriFace> {
        for face in 0..4u8 {
            for ver in 0..6u8 {
                let cand = TriFace::new(t, face, ver);
                if self.org(cand) == a && self.dest(cand) == b && self.apex(cand) == c {
                    return Some(cand);
                }
            }
        }
        None
    }

    /// Searches the mesh for the face with vertex set `{a, b, c}`; the
    /// returned handle is oriented org = `a`, dest = `b`, apex = `c`.
    /// Tries the vertices' location seeds, then falls back to a full
    /// traversal.
    pub fn find_face(&self, a: PointId, b: PointId, c: PointId) -> Option<TriFace> {
        for seed in [a, b, c] {
            let t = self.point(seed).tet;
            if self.tets.contains(t) && t != self.outer {
                if let Some(h) = self.face_of(t, a, b, c) {
                    return Some(h);
                }
            }
        }
        for (t, tet) in self.tets.iter() {
            if t == self.outer {
                continue;
            }
            if tet.corners.contains(&a) && tet.corners.contains(&b) && tet.corners.contains(&c) {
                if let Some(h) = self.face_of(t, a, b, c) {
                    return Some(h);
                }
            }
        }
        None
    }

    /// Searches the mesh for a tetrahedron carrying the directed edge
    /// `a -> b`.
    pub fn find_tet_edge(&self, a: PointId, b: PointId) -> Option<TriFace> {
        let seed = self.point(a).tet;
        if self.tets.contains(seed) && seed != self.outer {
            let corners = self.tet(seed).corners;
            if corners.contains(&a) && corners.contains(&b) {
                let mut h = TriFace::new(seed, 0, 0);
                for face in 0..4u8 {
                    h.face = face;
                    if self.find_edge(&mut h, a, b) {
                        return Some(h);
                    }
                }
            }
        }
        for (t, tet) in self.tets.iter() {
            if t == self.outer {
                continue;
            }
            if tet.corners.contains(&a) && tet.corners.contains(&b) {
                let mut h = TriFace::new(t, 0, 0);
                for face in 0..4u8 {
                    h.face = face;
                    if self.find_edge(&mut h, a, b) {
                        return Some(h);
                    }
                }
            }
        }
        None
    }

    /// Handles (one per tetrahedron, edge re-found in each) around the
    /// undirected edge of `start`, in rotation order. The second value is
    /// true for an open (hull-bounded) ring.
    pub fn edge_ring(&self, start: TriFace) -> (Vec<TriFace>, bool) {
        let a = self.org(start);
        let b = self.dest(start);
        let mut ring = vec![start];
        let mut open = false;

        let mut cur = start;
        loop {
            match self.ring_step(cur, a, b) {
                Some(next) => {
                    if next.tet == start.tet {
                        break;
                    }
                    ring.push(next);
                    cur = next;
                }
                None => {
                    open = true;
                    break;
                }
            }
        }
        if open {
            // The ring is a fan; collect the part behind the start handle.
            let mut cur = start;
            loop {
                let back = self.sym(TriFace::new(cur.tet, cur.face, 0));
                if self.is_outer(back) {
                    break;
                }
                let mut h = back;
                if !self.find_edge(&mut h, a, b) {
                    stale_handle("edge ring");
                }
                ring.insert(0, h);
                cur = h;
            }
        }
        (ring, open)
    }

    /// Crosses from `h` (a handle on edge a->b) through the other face of its
    /// tetrahedron containing the edge. `None` at the hull.
    pub(crate) fn ring_step(&self, h: TriFace, a: PointId, b: PointId) -> Option<TriFace> {
        let e = h.ccw();
        let [nf, _] = FACE_RING_NEXT[e.face as usize][e.ver as usize];
        let nxt = self.sym(TriFace::new(h.tet, nf as u8, 0));
        if self.is_outer(nxt) {
            return None;
        }
        let mut r = nxt;
        if !self.find_edge(&mut r, a, b) {
            stale_handle("edge ring");
        }
        Some(r)
    }

    /// All live tetrahedra incident to `p`, found by flooding from the
    /// point's location seed (falling back to a full traversal).
    pub fn star_tets(&self, p: PointId) -> Vec<TetId> {
        let mut seed = self.point(p).tet;
        if !self.tets.contains(seed) || seed == self.outer || !self.tet(seed).corners.contains(&p) {
            seed = Key::NONE;
            for (t, tet) in self.tets.iter() {
                if t != self.outer && tet.corners.contains(&p) {
                    seed = t;
                    break;
                }
            }
        }
        let mut star = Vec::new();
        if seed.is_none() {
            return star;
        }
        let mut stack = vec![seed];
        while let Some(t) = stack.pop() {
            if star.contains(&t) {
                continue;
            }
            star.push(t);
            for face in 0..4u8 {
                let nb = self.sym(TriFace::new(t, face, 0));
                if self.is_outer(nb) || star.contains(&nb.tet) {
                    continue;
                }
                if self.tet(nb.tet).corners.contains(&p) {
                    stack.push(nb.tet);
                }
            }
        }
        star
    }

    // ------------------------------------------------------------------
    // Boundary-element navigation primitives.
    // ------------------------------------------------------------------

    pub fn is_vacuous(&self, s: SubHandle) -> bool {
        s.is_none() || s.shell == self.vacuous
    }

    pub fn sorg(&self, s: SubHandle) -> PointId {
        self.shell(s.shell).verts[handle::VER_ORG[s.ver as usize]]
    }

    pub fn sdest(&self, s: SubHandle) -> PointId {
        self.shell(s.shell).verts[handle::VER_DEST[s.ver as usize]]
    }

    pub fn sapex(&self, s: SubHandle) -> PointId {
        self.shell(s.shell).verts[handle::VER_APEX[s.ver as usize]]
    }

    pub fn set_sorg(&mut self, s: SubHandle, p: PointId) {
        self.shell_mut(s.shell).verts[handle::VER_ORG[s.ver as usize]] = p;
    }

    pub fn set_sdest(&mut self, s: SubHandle, p: PointId) {
        self.shell_mut(s.shell).verts[handle::VER_DEST[s.ver as usize]] = p;
    }

    pub fn set_sapex(&mut self, s: SubHandle, p: PointId) {
        self.shell_mut(s.shell).verts[handle::VER_APEX[s.ver as usize]] = p;
    }

    pub fn sub_verts(&self, s: SubHandle) -> [PointId; 3] {
        [self.sorg(s), self.sdest(s), self.sapex(s)]
    }

    /// The adjoining boundary element at the edge of `s` (its ring link).
    /// Vacuous when unbonded.
    pub fn spivot(&self, s: SubHandle) -> SubHandle {
        let link = self.shell(s.shell).ring[s.edge()];
        if link.is_none() {
            SubHandle::new(self.vacuous, 0)
        } else {
            link
        }
    }

    /// Bonds both elements at their current edges.
    pub fn sbond(&mut self, s1: SubHandle, s2: SubHandle) {
        self.shell_mut(s1.shell).ring[s1.edge()] = s2;
        self.shell_mut(s2.shell).ring[s2.edge()] = s1;
    }

    /// Bonds only `s1`'s slot, for building face rings of three or more.
    pub fn sbond1(&mut self, s1: SubHandle, s2: SubHandle) {
        self.shell_mut(s1.shell).ring[s1.edge()] = s2;
    }

    pub fn sdissolve(&mut self, s: SubHandle) {
        self.shell_mut(s.shell).ring[s.edge()] = SubHandle::new(self.vacuous, 0);
    }

    /// Successor in the face ring around the directed edge of `s`, with the
    /// edge re-oriented to match.
    pub fn sfnext(&self, s: SubHandle) -> SubHandle {
        let next = self.spivot(s);
        if self.is_vacuous(next) {
            return next;
        }
        if self.sorg(next) == self.sorg(s) {
            next
        } else {
            next.sesym()
        }
    }

    // ------------------------------------------------------------------
    // Tetrahedron <-> subface and subface <-> subsegment bonds.
    // ------------------------------------------------------------------

    /// The subface adjoining the face of `t`, vacuous when absent.
    pub fn tspivot(&self, t: TriFace) -> SubHandle {
        let s = self.tet(t.tet).subs[t.face as usize];
        if s.is_none() {
            SubHandle::new(self.vacuous, 0)
        } else {
            s
        }
    }

    /// The tetrahedron adjoining side `s.side()` of the subface; a handle on
    /// the outer sentinel when absent.
    pub fn stpivot(&self, s: SubHandle) -> TriFace {
        let t = self.shell(s.shell).tets[s.side()];
        if t.is_none() {
            TriFace::new(self.outer, 0, 0)
        } else {
            t
        }
    }

    /// Bonds a tetrahedron face and a subface representing the same triangle.
    /// The subface handle is re-oriented to the face's counterclockwise edge
    /// ring; the two tetrahedra sharing a face see the ring in opposite
    /// directions, so each of the subface's two sides consistently names one
    /// adjoining tetrahedron.
    pub fn tsbond(&mut self, t: TriFace, s: SubHandle) {
        let t = t.ccw();
        let mut s = s;
        let (o, d) = (self.org(t), self.dest(t));
        let mut matched = false;
        for ver in 0..6u8 {
            let cand = SubHandle::new(s.shell, ver);
            if self.sorg(cand) == o && self.sdest(cand) == d {
                s = cand;
                matched = true;
                break;
            }
        }
        debug_assert!(matched, "subface does not match tetrahedron face");
        self.tet_mut(t.tet).subs[t.face as usize] = s;
        self.shell_mut(s.shell).tets[s.side()] = TriFace::new(t.tet, t.face, 0);
    }

    pub fn tsdissolve(&mut self, t: TriFace) {
        self.tet_mut(t.tet).subs[t.face as usize] = SubHandle::new(self.vacuous, 0);
    }

    pub fn stdissolve(&mut self, s: SubHandle) {
        self.shell_mut(s.shell).tets[s.side()] = TriFace::new(self.outer, 0, 0);
    }

    /// The subsegment adjoining the edge of subface `s`, vacuous when absent.
    pub fn sspivot(&self, s: SubHandle) -> SubHandle {
        let seg = self.shell(s.shell).segs[s.edge()];
        if seg.is_none() {
            SubHandle::new(self.vacuous, 0)
        } else {
            SubHandle::new(seg, 0)
        }
    }

    /// Bonds subface edge and subsegment; the segment backlinks one
    /// containing subface.
    pub fn ssbond(&mut self, s: SubHandle, seg: ShellId) {
        self.shell_mut(s.shell).segs[s.edge()] = seg;
        self.shell_mut(seg).segs[0] = s.shell;
    }

    pub fn ssdissolve(&mut self, s: SubHandle) {
        self.shell_mut(s.shell).segs[s.edge()] = Key::NONE;
    }

    /// A subsegment with endpoints {a, b}, by scanning the boundary arena.
    pub fn find_subsegment(&self, a: PointId, b: PointId) -> Option<ShellId> {
        for (s, sh) in self.shells.iter() {
            if s == self.vacuous || sh.kind != ShellKind::Subsegment {
                continue;
            }
            if (sh.verts[0] == a && sh.verts[1] == b) || (sh.verts[0] == b && sh.verts[1] == a) {
                return Some(s);
            }
        }
        None
    }

    /// The subsegment lying on the edge of `t`, found by walking the face
    /// ring and querying each face's subface bonds, falling back to an
    /// endpoint scan while subfaces are not yet bonded. Vacuous when absent.
    pub fn tsspivot(&self, t: TriFace) -> SubHandle {
        if self.shells.len() <= 1 {
            return SubHandle::new(self.vacuous, 0);
        }
        let a = self.org(t);
        let b = self.dest(t);
        if !self.check_subfaces {
            return match self.find_subsegment(a, b) {
                Some(s) => SubHandle::new(s, 0),
                None => SubHandle::new(self.vacuous, 0),
            };
        }
        let (ring, _) = self.edge_ring(t);
        for h in ring {
            let s = self.tspivot(TriFace::new(h.tet, h.face, 0));
            if !self.is_vacuous(s) {
                let mut sh = s;
                if self.sub_find_edge(&mut sh, a, b) {
                    let seg = self.sspivot(sh);
                    if !self.is_vacuous(seg) {
                        return seg;
                    }
                }
            }
            // Also check the second face of this tetrahedron containing the
            // edge; rings at the hull may not cover it from the other side.
            let e = h.ccw();
            let [nf, _] = FACE_RING_NEXT[e.face as usize][e.ver as usize];
            let s2 = self.tspivot(TriFace::new(h.tet, nf as u8, 0));
            if !self.is_vacuous(s2) {
                let mut sh = s2;
                if self.sub_find_edge(&mut sh, a, b) {
                    let seg = self.sspivot(sh);
                    if !self.is_vacuous(seg) {
                        return seg;
                    }
                }
            }
        }
        match self.find_subsegment(a, b) {
            Some(s) => SubHandle::new(s, 0),
            None => SubHandle::new(self.vacuous, 0),
        }
    }

    /// A tetrahedron carrying the subsegment's edge, via its parent subface.
    pub fn sstpivot(&self, seg: ShellId) -> Option<TriFace> {
        let sh = self.shell(seg);
        debug_assert_eq!(sh.kind, ShellKind::Subsegment);
        let (a, b) = (sh.verts[0], sh.verts[1]);
        let parent = sh.segs[0];
        if !parent.is_none() && self.shells.contains(parent) {
            for side in 0..2u8 {
                let t = self.stpivot(SubHandle::new(parent, side));
                if !self.is_outer(t) && self.tets.contains(t.tet) {
                    let mut h = TriFace::new(t.tet, t.face, 0);
                    if self.find_edge(&mut h, a, b) {
                        return Some(h);
                    }
                }
            }
        }
        self.find_tet_edge(a, b)
    }

    /// Rotates a subface handle so its directed edge is `a -> b`.
    pub fn sub_find_edge(&self, s: &mut SubHandle, a: PointId, b: PointId) -> bool {
        for ver in 0..6u8 {
            let cand = SubHandle::new(s.shell, ver);
            if self.sorg(cand) == a && self.sdest(cand) == b {
                *s = cand;
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Predicate wrappers.
    // ------------------------------------------------------------------

    /// Raw exact orientation of the four points (may be zero).
    pub(crate) fn orient4(&self, a: PointId, b: PointId, c: PointId, d: PointId) -> f64 {
        predicates::orient3d(&self.pos(a), &self.pos(b), &self.pos(c), &self.pos(d))
    }

    /// Symbolically perturbed orientation, never zero.
    pub(crate) fn orient4_sign(&self, a: PointId, b: PointId, c: PointId, d: PointId) -> i8 {
        predicates::orient3d_sos(
            [self.pos(a), self.pos(b), self.pos(c), self.pos(d)],
            [a.id(), b.id(), c.id(), d.id()],
        )
    }

    /// Positive if `e` lies strictly inside the circumsphere of `t`
    /// (symbolically perturbed, never zero). Accounts for the stored
    /// negative corner orientation.
    pub(crate) fn in_sphere_sign(&self, t: TetId, e: PointId) -> i8 {
        let [v0, v1, v2, v3] = self.tet(t).corners;
        // Stored corners are negatively oriented; swap two for the
        // positively-oriented tuple the in-sphere test expects.
        predicates::insphere_sos(
            [
                self.pos(v1),
                self.pos(v0),
                self.pos(v2),
                self.pos(v3),
                self.pos(e),
            ],
            [v1.id(), v0.id(), v2.id(), v3.id(), e.id()],
        )
    }

    // ------------------------------------------------------------------
    // Topology self-checks.
    // ------------------------------------------------------------------

    /// Checks the symmetry of face bonds and corner consistency across every
    /// live tetrahedron.
    pub fn check_mesh(&self) -> Result<()> {
        for t in self.tet_ids() {
            let corners = self.tet(t).corners;
            for p in corners {
                if !self.points.contains(p) {
                    bail!("tetrahedron {t} references dead point {p}");
                }
            }
            if self.orient4_sign(corners[0], corners[1], corners[2], corners[3]) >= 0 {
                bail!("tetrahedron {t} has non-negative corner orientation");
            }
            for face in 0..4u8 {
                let h = TriFace::new(t, face, 0);
                let nb = self.sym(h);
                if self.is_outer(nb) {
                    continue;
                }
                if !self.tets.contains(nb.tet) {
                    bail!("tetrahedron {t} face {face} bonded to dead neighbor");
                }
                let back = self.sym(nb);
                if back.tet != t || back.face != face {
                    bail!("asymmetric bond at tetrahedron {t} face {face}");
                }
                let mine: Vec<PointId> = {
                    let mut v = self.face_verts(h).to_vec();
                    v.sort();
                    v
                };
                let theirs: Vec<PointId> = {
                    let mut v = self.face_verts(nb).to_vec();
                    v.sort();
                    v
                };
                if mine != theirs {
                    bail!("bonded faces disagree on vertices at tetrahedron {t} face {face}");
                }
            }
        }
        Ok(())
    }

    /// Brute-force Delaunay validity: the fraction of live tetrahedra whose
    /// circumsphere holds no other live point strictly inside, checked in
    /// parallel.
    pub fn check_delaunay(&self) -> f64 {
        use rayon::prelude::*;
        let tets = self.tet_ids();
        if tets.is_empty() {
            return 1.0;
        }
        let points: Vec<PointId> = self.points.iter().map(|(k, _)| k).collect();
        let violated: usize = tets
            .par_iter()
            .map(|&t| {
                let [v0, v1, v2, v3] = self.tet(t).corners;
                for &p in &points {
                    if p == v0 || p == v1 || p == v2 || p == v3 {
                        continue;
                    }
                    // Swapped corners give the positive orientation the
                    // in-sphere test expects.
                    let r = predicates::insphere(
                        &self.pos(v1),
                        &self.pos(v0),
                        &self.pos(v2),
                        &self.pos(v3),
                        &self.pos(p),
                    );
                    if r > 0.0 {
                        return 1usize;
                    }
                }
                0usize
            })
            .sum();
        1.0 - violated as f64 / tets.len() as f64
    }

    /// Checks boundary-element rings, subsegment bonds and tet bonds.
    pub fn check_shells(&self) -> Result<()> {
        for s in self.shell_ids(ShellKind::Subface) {
            let sh = self.shell(s);
            for edge in 0..3 {
                let h = SubHandle::new(s, (edge * 2) as u8);
                let link = self.spivot(h);
                if self.is_vacuous(link) {
                    continue;
                }
                if !self.shells.contains(link.shell) {
                    bail!("subface {s} edge {edge} linked to dead element");
                }
                // Walk the ring back to this subface.
                let mut cur = link;
                let mut steps = 0;
                while cur.shell != s {
                    cur = self.spivot(cur);
                    steps += 1;
                    if steps > 64 || self.is_vacuous(cur) {
                        bail!("broken face ring at subface {s} edge {edge}");
                    }
                }
            }
            for side in 0..2u8 {
                let t = self.stpivot(SubHandle::new(s, side));
                if self.is_outer(t) {
                    continue;
                }
                if !self.tets.contains(t.tet) {
                    bail!("subface {s} bonded to dead tetrahedron");
                }
                let back = self.tspivot(t);
                if back.shell != s {
                    bail!("asymmetric tet bond at subface {s}");
                }
            }
            let _ = sh;
        }
        Ok(())
    }
}

impl core::fmt::Display for Mesh {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "Mesh with {} points, {} tetrahedra, {} boundary elements",
            self.points.len(),
            self.num_tets(),
            self.shells.len() - 1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(mesh: &mut Mesh, coords: &[[f64; 3]]) -> Vec<PointId> {
        coords
            .iter()
            .map(|&c| mesh.make_point(c, VertexKind::Input))
            .collect()
    }

    /// Two tetrahedra sharing the face (a, b, c).
    fn two_tets() -> (Mesh, Vec<PointId>, TetId, TetId) {
        let mut mesh = Mesh::new();
        let v = pts(
            &mut mesh,
            &[
                [0.0, 0.0, 0.0],
                [2.0, 0.0, 0.0],
                [0.0, 2.0, 0.0],
                [0.5, 0.5, 1.0],
                [0.5, 0.5, -1.0],
            ],
        );
        let t1 = mesh.make_tet(v[0], v[1], v[2], v[3]);
        let t2 = mesh.make_tet(v[0], v[1], v[2], v[4]);
        let f1 = mesh.face_of(t1, v[0], v[1], v[2]).unwrap();
        let f2 = mesh.face_of(t2, v[0], v[1], v[2]).unwrap();
        mesh.bond(f1, f2);
        for t in [t1, t2] {
            for face in 0..4u8 {
                let h = TriFace::new(t, face, 0);
                if mesh.sym(h).is_none() {
                    mesh.dissolve(h);
                }
            }
        }
        (mesh, v, t1, t2)
    }

    #[test]
    fn corner_orientation_invariant() {
        let (mesh, _, t1, t2) = two_tets();
        for t in [t1, t2] {
            let [a, b, c, d] = mesh.tet(t).corners;
            assert!(mesh.orient4_sign(a, b, c, d) < 0);
        }
    }

    #[test]
    fn handle_algebra_is_consistent() {
        let (mesh, _, t1, _) = two_tets();
        for face in 0..4u8 {
            for ver in 0..6u8 {
                let h = TriFace::new(t1, face, ver);
                // esym swaps origin and destination, keeps the apex.
                assert_eq!(mesh.org(h.esym()), mesh.dest(h));
                assert_eq!(mesh.dest(h.esym()), mesh.org(h));
                assert_eq!(mesh.apex(h.esym()), mesh.apex(h));
                // enext walks the ring: destination becomes origin.
                assert_eq!(mesh.org(h.enext()), mesh.dest(h));
                // three enexts close the cycle.
                assert_eq!(h.enext().enext().enext(), h);
                assert_eq!(h.enext2(), h.enext().enext());
                // the opposite corner is none of the face corners.
                let oppo = mesh.oppo(h);
                assert!(mesh.face_verts(h).iter().all(|&p| p != oppo));
            }
        }
    }

    #[test]
    fn sym_is_an_involution() {
        let (mesh, v, t1, t2) = two_tets();
        let f1 = mesh.face_of(t1, v[0], v[1], v[2]).unwrap();
        let nb = mesh.sym(f1);
        assert_eq!(nb.tet, t2);
        let back = mesh.sym(nb);
        assert_eq!(back.tet, t1);
        assert_eq!(back.face, f1.face);
        mesh.check_mesh().unwrap();
    }

    #[test]
    fn edge_ring_of_a_shared_edge() {
        let (mesh, v, t1, _) = two_tets();
        let mut h = TriFace::new(t1, 0, 0);
        let mut found = false;
        for face in 0..4u8 {
            h.face = face;
            if mesh.find_edge(&mut h, v[0], v[1]) {
                found = true;
                break;
            }
        }
        assert!(found);
        let (ring, open) = mesh.edge_ring(h);
        assert!(open);
        assert_eq!(ring.len(), 2);
        for r in &ring {
            assert_eq!(mesh.org(*r), v[0]);
            assert_eq!(mesh.dest(*r), v[1]);
        }
    }

    #[test]
    fn fnext_visits_both_faces_of_the_edge() {
        let (mesh, v, t1, _) = two_tets();
        let mut h = TriFace::new(t1, 0, 0);
        for face in 0..4u8 {
            h.face = face;
            if mesh.find_edge(&mut h, v[0], v[1]) {
                break;
            }
        }
        let h = h.ccw();
        let next = mesh.fnext(h).unwrap();
        assert_eq!(next.tet, t1);
        assert_ne!(next.face, h.face);
        // The successor addresses the same directed edge.
        assert_eq!(mesh.org(next), mesh.org(h));
        assert_eq!(mesh.dest(next), mesh.dest(h));
    }

    #[test]
    fn subface_bonds_are_symmetric() {
        let (mut mesh, v, t1, t2) = two_tets();
        let s = mesh.make_subface([v[0], v[1], v[2]], 7);
        let f1 = mesh.face_of(t1, v[0], v[1], v[2]).unwrap();
        let f2 = mesh.face_of(t2, v[0], v[1], v[2]).unwrap();
        mesh.tsbond(f1, SubHandle::new(s, 0));
        mesh.tsbond(f2, SubHandle::new(s, 0));

        let got = mesh.tspivot(f1);
        assert_eq!(got.shell, s);
        // Both sides resolve to the two different tetrahedra.
        let side0 = mesh.stpivot(SubHandle::new(s, 0));
        let side1 = mesh.stpivot(SubHandle::new(s, 1));
        assert_ne!(side0.tet, side1.tet);
        mesh.check_shells().unwrap();
    }

    #[test]
    fn subsegment_bonds() {
        let (mut mesh, v, _, _) = two_tets();
        let s = mesh.make_subface([v[0], v[1], v[2]], 0);
        let seg = mesh.make_subsegment(v[0], v[1], 3);
        let mut h = SubHandle::new(s, 0);
        assert!(mesh.sub_find_edge(&mut h, v[0], v[1]));
        mesh.ssbond(h, seg);
        let got = mesh.sspivot(h);
        assert_eq!(got.shell, seg);
        // The segment backlinks a containing subface.
        assert_eq!(mesh.shell(seg).segs[0], s);
    }

    #[test]
    fn arena_traversal_skips_the_sentinels() {
        let (mesh, _, _, _) = two_tets();
        assert_eq!(mesh.num_tets(), 2);
        assert!(mesh.tet_ids().iter().all(|&t| t != mesh.outer));
    }

    #[test]
    fn star_collects_incident_tets() {
        let (mesh, v, _, _) = two_tets();
        assert_eq!(mesh.star_tets(v[0]).len(), 2);
        assert_eq!(mesh.star_tets(v[3]).len(), 1);
    }
}
