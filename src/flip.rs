//! The bistellar-flip engine.
//!
//! A worklist of candidate faces is seeded around each freshly modified
//! region; faces are popped, classified by [`categorize_face`] and flipped
//! when the in-sphere test demands it, pushing the newly exposed faces back
//! onto the worklist. Every performed flip is appended to a history log so a
//! whole insertion can be undone by replaying inverse flips in reverse.
//!
//! All four flips share one mechanism: collect the bonds on the cavity
//! boundary, delete the old tetrahedra, create the new ones and re-bond by
//! vertex lookup. This keeps the delicate pointer surgery in a single place.

use std::collections::{HashMap, VecDeque};

use crate::mesh::element::{PointId, TetId};
use crate::mesh::handle::{SubHandle, TriFace};
use crate::mesh::Mesh;

/// How a face was classified for flipping.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FlipClass {
    /// Replace the two tetrahedra sharing the face by three around a new edge.
    TwoThree,
    /// Replace the three tetrahedra around this edge by two sharing a face.
    ThreeTwo(TriFace),
    /// Swap the diagonal of a coplanar hull quad (two tetrahedra).
    TwoTwo(TriFace, PointId, PointId),
    /// Swap the degenerate interior edge shared by four tetrahedra.
    FourFour(TriFace, PointId, PointId),
    /// No flip improves this face.
    Unflippable,
    /// The face carries a subface and must not be flipped away.
    ForbiddenFace,
    /// The candidate edge carries a subsegment.
    ForbiddenEdge,
    /// The link is non-convex and the matching edge is not three-shared.
    Nonconvex,
}

/// One performed flip, recorded by its pre-flip vertices so it can be located
/// again and inverted even after later flips moved the handles.
#[derive(Clone, Copy, Debug)]
pub enum FlipRecord {
    TwoThree { d: PointId, e: PointId },
    ThreeTwo { c: PointId, d: PointId, e: PointId },
    TwoTwo { d: PointId, e: PointId },
    FourFour { d: PointId, e: PointId, a: PointId, b: PointId },
}

pub type FlipLog = Vec<FlipRecord>;

#[derive(Clone, Copy, Debug)]
struct QueuedFace {
    face: TriFace,
    verts: [PointId; 3],
}

/// Worklist of faces to re-check for local Delaunay-hood.
#[derive(Default)]
pub struct FlipQueue {
    items: VecDeque<QueuedFace>,
}

impl FlipQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Queues a face together with the vertices it has right now; the fingerprint
/// is re-validated at pop time since the mesh may have mutated in between.
pub(crate) fn enqueue_flip_face(mesh: &Mesh, queue: &mut FlipQueue, face: TriFace) {
    if mesh.is_outer(face) {
        return;
    }
    let mut verts = mesh.face_verts(face);
    verts.sort();
    queue.items.push_back(QueuedFace { face, verts });
}

fn enqueue_cavity_boundary(mesh: &Mesh, queue: &mut FlipQueue, new_tets: &[TetId]) {
    for &t in new_tets {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let nb = mesh.sym(h);
            if mesh.is_outer(nb) || !new_tets.contains(&nb.tet) {
                enqueue_flip_face(mesh, queue, h);
            }
        }
    }
}

/// A bond on the boundary of a cavity about to be re-triangulated.
pub(crate) struct CavityBond {
    /// The outside handle across the boundary face (may be the outer
    /// sentinel).
    out: TriFace,
    /// The subface adjoining the boundary face (may be vacuous).
    sub: SubHandle,
    /// The boundary face's vertices as seen from inside the cavity.
    verts: [PointId; 3],
}

fn sorted3(mut v: [PointId; 3]) -> [PointId; 3] {
    v.sort();
    v
}

/// Records every bond on the boundary of the cavity formed by `old`.
pub(crate) fn cavity_bonds(mesh: &Mesh, old: &[TetId]) -> Vec<CavityBond> {
    let mut bonds = Vec::new();
    for &t in old {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let nb = mesh.sym(h);
            if !mesh.is_outer(nb) && old.contains(&nb.tet) {
                continue;
            }
            bonds.push(CavityBond {
                out: nb,
                sub: mesh.tspivot(h),
                verts: mesh.face_verts(h),
            });
        }
    }
    bonds
}

/// Replaces the tetrahedra `old` by tetrahedra over the corner quadruples
/// `new`, re-bonding neighbors and subfaces across the cavity boundary.
/// The new tetrahedralization must fill the same cavity.
pub(crate) fn rebuild_cavity(mesh: &mut Mesh, old: &[TetId], new: &[[PointId; 4]]) -> Vec<TetId> {
    let bonds = cavity_bonds(mesh, old);
    // Children inherit region attributes; the tightest volume bound wins.
    let attrs = old
        .first()
        .map(|&t| mesh.tet(t).attrs.clone())
        .unwrap_or_default();
    let volume_bound = old
        .iter()
        .filter_map(|&t| mesh.tet(t).volume_bound)
        .fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.min(v)))
        });
    for &t in old {
        mesh.kill_tet(t);
    }
    let ids: Vec<TetId> = new
        .iter()
        .map(|q| {
            let t = mesh.make_tet(q[0], q[1], q[2], q[3]);
            mesh.tet_mut(t).attrs = attrs.clone();
            mesh.tet_mut(t).volume_bound = volume_bound;
            t
        })
        .collect();

    // Pair up interior faces among the new tetrahedra.
    let mut open: HashMap<[PointId; 3], TriFace> = HashMap::new();
    for &t in &ids {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let key = sorted3(mesh.face_verts(h));
            if let Some(other) = open.remove(&key) {
                mesh.bond(h, other);
            } else {
                open.insert(key, h);
            }
        }
    }

    // Re-attach the cavity boundary.
    for bond in bonds {
        let Some(mut inner) = open.remove(&sorted3(bond.verts)) else {
            panic!("internal error: cavity boundary face lost during rebuild");
        };
        if mesh.is_outer(bond.out) {
            mesh.dissolve(inner);
        } else {
            mesh.bond(inner, bond.out);
        }
        if !mesh.is_vacuous(bond.sub) {
            if !mesh.find_edge(&mut inner, bond.verts[0], bond.verts[1]) {
                panic!("internal error: cavity boundary face lost its edge");
            }
            mesh.tsbond(inner, bond.sub);
        }
    }

    // Anything left over is a freshly exposed hull face.
    let leftovers: Vec<TriFace> = open.into_values().collect();
    for h in leftovers {
        if mesh.is_outer(mesh.sym(h)) {
            mesh.dissolve(h);
        }
    }
    ids
}

/// Classifies the face for flipping using the vertices around it.
pub(crate) fn categorize_face(mesh: &Mesh, t: TriFace) -> FlipClass {
    let ts = mesh.sym(t);
    if mesh.is_outer(ts) {
        return FlipClass::Unflippable;
    }
    if mesh.check_subfaces && !mesh.is_vacuous(mesh.tspivot(t)) {
        return FlipClass::ForbiddenFace;
    }
    let (a, b, c) = (mesh.org(t), mesh.dest(t), mesh.apex(t));
    let d = mesh.oppo(t);
    let e = mesh.oppo(ts);
    let (pa, pb, pc) = (mesh.pos(a), mesh.pos(b), mesh.pos(c));
    let (pd, pe) = (mesh.pos(d), mesh.pos(e));

    // Where does segment d-e pass relative to triangle a-b-c?
    let s_ab = crate::predicates::orient3d(&pd, &pe, &pa, &pb);
    let s_bc = crate::predicates::orient3d(&pd, &pe, &pb, &pc);
    let s_ca = crate::predicates::orient3d(&pd, &pe, &pc, &pa);
    let signs = [s_ab, s_bc, s_ca];
    let edges = [(a, b), (b, c), (c, a)];

    let zeros = signs.iter().filter(|s| **s == 0.0).count();
    if zeros >= 2 {
        // d-e passes through a corner: nothing local helps.
        return FlipClass::Unflippable;
    }
    if zeros == 1 {
        // d-e passes through an edge line: the four points around that edge
        // are coplanar. A 4-4 (interior) or 2-2 (hull) flip applies.
        let idx = signs.iter().position(|s| *s == 0.0).unwrap();
        let (x, y) = edges[idx];
        let mut h = t;
        if !mesh.find_edge(&mut h, x, y) {
            return FlipClass::Unflippable;
        }
        if !mesh.is_vacuous(mesh.tsspivot(h)) {
            return FlipClass::ForbiddenEdge;
        }
        let (ring, open) = mesh.edge_ring(h);
        if mesh.check_subfaces && ring_has_subface(mesh, &ring) {
            return FlipClass::ForbiddenFace;
        }
        if open && ring.len() == 2 {
            return FlipClass::TwoTwo(h, d, e);
        }
        if !open && ring.len() == 4 {
            return FlipClass::FourFour(h, d, e);
        }
        return FlipClass::Unflippable;
    }

    let positives = signs.iter().filter(|s| **s > 0.0).count();
    if positives == 0 || positives == 3 {
        return FlipClass::TwoThree;
    }

    // Non-convex across the minority edge; a 3-2 flip applies when exactly
    // three tetrahedra share it.
    let want_positive = positives == 1;
    let idx = signs
        .iter()
        .position(|s| (*s > 0.0) == want_positive)
        .unwrap();
    let (x, y) = edges[idx];
    let mut h = t;
    if !mesh.find_edge(&mut h, x, y) {
        return FlipClass::Nonconvex;
    }
    if !mesh.is_vacuous(mesh.tsspivot(h)) {
        return FlipClass::ForbiddenEdge;
    }
    let (ring, open) = mesh.edge_ring(h);
    if open || ring.len() != 3 {
        return FlipClass::Nonconvex;
    }
    if mesh.check_subfaces && ring_has_subface(mesh, &ring) {
        return FlipClass::ForbiddenFace;
    }
    FlipClass::ThreeTwo(h)
}

fn ring_has_subface(mesh: &Mesh, ring: &[TriFace]) -> bool {
    for h in ring {
        let e = h.ccw();
        let [nf, _] = crate::mesh::handle::FACE_RING_NEXT[e.face as usize][e.ver as usize];
        for face in [h.face, nf as u8] {
            if !mesh.is_vacuous(mesh.tspivot(TriFace::new(h.tet, face, 0))) {
                return true;
            }
        }
    }
    false
}

/// Performs a 2-3 flip on the face `t`.
pub(crate) fn flip23(
    mesh: &mut Mesh,
    t: TriFace,
    queue: &mut FlipQueue,
    log: Option<&mut FlipLog>,
) {
    let (a, b, c) = (mesh.org(t), mesh.dest(t), mesh.apex(t));
    let d = mesh.oppo(t);
    let ts = mesh.sym(t);
    let e = mesh.oppo(ts);
    let old = [t.tet, ts.tet];
    let new = [[e, d, a, b], [e, d, b, c], [e, d, c, a]];
    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_cavity_boundary(mesh, queue, &ids);
    if let Some(log) = log {
        log.push(FlipRecord::TwoThree { d, e });
    }
    mesh.flip23s += 1;
}

/// Performs a 3-2 flip around the edge of `h`, which must be shared by
/// exactly three tetrahedra.
pub(crate) fn flip32(
    mesh: &mut Mesh,
    h: TriFace,
    queue: &mut FlipQueue,
    log: Option<&mut FlipLog>,
) {
    let a = mesh.org(h);
    let b = mesh.dest(h);
    let (ring, open) = mesh.edge_ring(h);
    debug_assert!(!open && ring.len() == 3);
    let mut link = Vec::with_capacity(3);
    for r in &ring {
        for p in mesh.tet(r.tet).corners {
            if p != a && p != b && !link.contains(&p) {
                link.push(p);
            }
        }
    }
    debug_assert_eq!(link.len(), 3);
    let (c, d, e) = (link[0], link[1], link[2]);
    let old: Vec<TetId> = ring.iter().map(|r| r.tet).collect();
    let new = [[c, d, e, a], [c, d, e, b]];
    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_cavity_boundary(mesh, queue, &ids);
    if let Some(log) = log {
        log.push(FlipRecord::ThreeTwo { c, d, e });
    }
    mesh.flip32s += 1;
}

/// Performs a 2-2 flip on the hull edge of `h`: the two tetrahedra sharing
/// it trade the coplanar hull diagonal.
pub(crate) fn flip22(
    mesh: &mut Mesh,
    h: TriFace,
    queue: &mut FlipQueue,
    log: Option<&mut FlipLog>,
) {
    let a = mesh.org(h);
    let b = mesh.dest(h);
    let (ring, open) = mesh.edge_ring(h);
    debug_assert!(open && ring.len() == 2);
    let t1 = ring[0].tet;
    let t2 = ring[1].tet;
    let others1: Vec<PointId> = mesh
        .tet(t1)
        .corners
        .iter()
        .copied()
        .filter(|&p| p != a && p != b)
        .collect();
    let others2: Vec<PointId> = mesh
        .tet(t2)
        .corners
        .iter()
        .copied()
        .filter(|&p| p != a && p != b)
        .collect();
    // Shared apex c, and the two coplanar opposites d, e.
    let c = *others1.iter().find(|p| others2.contains(p)).unwrap();
    let d = *others1.iter().find(|&&p| p != c).unwrap();
    let e = *others2.iter().find(|&&p| p != c).unwrap();
    let old = [t1, t2];
    let new = [[d, e, a, c], [d, e, b, c]];
    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_cavity_boundary(mesh, queue, &ids);
    if let Some(log) = log {
        log.push(FlipRecord::TwoTwo { d, e });
    }
    mesh.flip22s += 1;
}

/// Performs a 4-4 flip on the interior edge of `h` (four tetrahedra around a
/// degenerate edge), replacing it with the diagonal (d, e).
pub(crate) fn flip44(
    mesh: &mut Mesh,
    h: TriFace,
    d: PointId,
    e: PointId,
    queue: &mut FlipQueue,
    log: Option<&mut FlipLog>,
) {
    let a = mesh.org(h);
    let b = mesh.dest(h);
    let (ring, open) = mesh.edge_ring(h);
    debug_assert!(!open && ring.len() == 4);
    let mut link = Vec::with_capacity(4);
    for r in &ring {
        for p in mesh.tet(r.tet).corners {
            if p != a && p != b && !link.contains(&p) {
                link.push(p);
            }
        }
    }
    debug_assert_eq!(link.len(), 4);
    // The other two link vertices pair with both halves of the new edge.
    let rest: Vec<PointId> = link.iter().copied().filter(|&p| p != d && p != e).collect();
    debug_assert_eq!(rest.len(), 2);
    let old: Vec<TetId> = ring.iter().map(|r| r.tet).collect();
    let new = [
        [d, e, rest[0], a],
        [d, e, rest[0], b],
        [d, e, rest[1], a],
        [d, e, rest[1], b],
    ];
    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_cavity_boundary(mesh, queue, &ids);
    if let Some(log) = log {
        log.push(FlipRecord::FourFour { d, e, a, b });
    }
    mesh.flip44s += 1;
}

/// Drains the worklist, flipping every face that violates the local Delaunay
/// criterion and can be flipped. Returns the number of flips performed.
pub(crate) fn flip(mesh: &mut Mesh, queue: &mut FlipQueue, mut log: Option<&mut FlipLog>) -> u64 {
    let mut flips = 0;
    while let Some(qf) = queue.items.pop_front() {
        if !mesh.tets.contains(qf.face.tet) {
            continue;
        }
        let t = qf.face;
        if sorted3(mesh.face_verts(t)) != qf.verts {
            continue;
        }
        let ts = mesh.sym(t);
        if mesh.is_outer(ts) {
            continue;
        }
        // The face is locally Delaunay when the far corner lies outside the
        // circumsphere of the near tetrahedron.
        let e = mesh.oppo(ts);
        if mesh.in_sphere_sign(t.tet, e) <= 0 {
            continue;
        }
        match categorize_face(mesh, t) {
            FlipClass::TwoThree => {
                flip23(mesh, t, queue, log.as_deref_mut());
                flips += 1;
            }
            FlipClass::ThreeTwo(h) => {
                flip32(mesh, h, queue, log.as_deref_mut());
                flips += 1;
            }
            FlipClass::TwoTwo(h, ..) => {
                flip22(mesh, h, queue, log.as_deref_mut());
                flips += 1;
            }
            FlipClass::FourFour(h, d, e) => {
                flip44(mesh, h, d, e, queue, log.as_deref_mut());
                flips += 1;
            }
            // Non-performable flips are skipped; other queued faces or a
            // later boundary split repair the spot.
            _ => {}
        }
    }
    flips
}

/// Replays the flip history in reverse, applying the inverse flip for each
/// record, fully restoring the pre-insertion topology.
pub(crate) fn undo_flips(mesh: &mut Mesh, log: &mut FlipLog) {
    let mut scratch = FlipQueue::new();
    while let Some(record) = log.pop() {
        match record {
            FlipRecord::TwoThree { d, e } => {
                let h = mesh
                    .find_tet_edge(d, e)
                    .unwrap_or_else(|| panic!("internal error: lost flip edge during undo"));
                flip32(mesh, h, &mut scratch, None);
                mesh.flip32s -= 1;
                mesh.flip23s -= 1;
            }
            FlipRecord::ThreeTwo { c, d, e } => {
                let h = mesh
                    .find_face(c, d, e)
                    .unwrap_or_else(|| panic!("internal error: lost flip face during undo"));
                flip23(mesh, h, &mut scratch, None);
                mesh.flip23s -= 1;
                mesh.flip32s -= 1;
            }
            FlipRecord::TwoTwo { d, e } => {
                let h = mesh
                    .find_tet_edge(d, e)
                    .unwrap_or_else(|| panic!("internal error: lost flip edge during undo"));
                flip22(mesh, h, &mut scratch, None);
                mesh.flip22s -= 2;
            }
            FlipRecord::FourFour { d, e, a, b } => {
                let h = mesh
                    .find_tet_edge(d, e)
                    .unwrap_or_else(|| panic!("internal error: lost flip edge during undo"));
                flip44(mesh, h, a, b, &mut scratch, None);
                mesh.flip44s -= 2;
            }
        }
        scratch.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::element::VertexKind;

    /// Two tetrahedra whose shared face violates nothing yet is flippable:
    /// the segment between the opposite corners passes through the face.
    fn flippable_pair() -> (Mesh, Vec<PointId>) {
        let mut mesh = Mesh::new();
        let v: Vec<PointId> = [
            [0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [0.0, 2.0, 0.0],
            [0.5, 0.5, 1.0],
            [0.5, 0.5, -1.0],
        ]
        .iter()
        .map(|&c| mesh.make_point(c, VertexKind::Input))
        .collect();
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
        (mesh, v)
    }

    fn tet_corner_sets(mesh: &Mesh) -> Vec<Vec<PointId>> {
        let mut sets: Vec<Vec<PointId>> = mesh
            .tet_ids()
            .into_iter()
            .map(|t| {
                let mut c = mesh.tet(t).corners.to_vec();
                c.sort();
                c
            })
            .collect();
        sets.sort();
        sets
    }

    #[test]
    fn categorize_recognizes_the_convex_pair() {
        let (mesh, v) = flippable_pair();
        let t1 = mesh.find_face(v[0], v[1], v[2]).unwrap();
        assert_eq!(categorize_face(&mesh, t1), FlipClass::TwoThree);
    }

    #[test]
    fn flip23_then_flip32_restores_the_pair() {
        let (mut mesh, v) = flippable_pair();
        let before = tet_corner_sets(&mesh);

        let f = mesh.find_face(v[0], v[1], v[2]).unwrap();
        let mut queue = FlipQueue::new();
        flip23(&mut mesh, f, &mut queue, None);
        assert_eq!(mesh.num_tets(), 3);
        mesh.check_mesh().unwrap();

        // The new edge joins the two old opposite corners.
        let edge = mesh.find_tet_edge(v[4], v[3]).unwrap();
        let (ring, open) = mesh.edge_ring(edge);
        assert!(!open);
        assert_eq!(ring.len(), 3);

        flip32(&mut mesh, edge, &mut queue, None);
        assert_eq!(mesh.num_tets(), 2);
        mesh.check_mesh().unwrap();
        assert_eq!(tet_corner_sets(&mesh), before);
    }

    #[test]
    fn flip_history_undoes_in_reverse() {
        let (mut mesh, v) = flippable_pair();
        let before = tet_corner_sets(&mesh);

        let f = mesh.find_face(v[0], v[1], v[2]).unwrap();
        let mut queue = FlipQueue::new();
        let mut log = FlipLog::new();
        flip23(&mut mesh, f, &mut queue, Some(&mut log));
        assert_eq!(log.len(), 1);

        undo_flips(&mut mesh, &mut log);
        assert!(log.is_empty());
        assert_eq!(mesh.num_tets(), 2);
        assert_eq!(tet_corner_sets(&mesh), before);
        mesh.check_mesh().unwrap();
    }

    #[test]
    fn forbidden_face_is_not_flipped() {
        let (mut mesh, v) = flippable_pair();
        mesh.check_subfaces = true;
        let s = mesh.make_subface([v[0], v[1], v[2]], 1);
        let f = mesh.find_face(v[0], v[1], v[2]).unwrap();
        mesh.tsbond(f, crate::mesh::handle::SubHandle::new(s, 0));
        let fs = mesh.sym(f);
        mesh.tsbond(fs, crate::mesh::handle::SubHandle::new(s, 0));

        assert_eq!(categorize_face(&mesh, f), FlipClass::ForbiddenFace);
    }

    #[test]
    fn hull_face_is_unflippable() {
        let (mesh, v) = flippable_pair();
        // Any face of t1 other than the shared one is on the hull.
        let hull = mesh.find_face(v[0], v[1], v[3]).unwrap();
        assert_eq!(categorize_face(&mesh, hull), FlipClass::Unflippable);
    }

    #[test]
    fn flip_queue_revalidates_fingerprints() {
        let (mut mesh, v) = flippable_pair();
        let f = mesh.find_face(v[0], v[1], v[2]).unwrap();
        let mut queue = FlipQueue::new();
        enqueue_flip_face(&mesh, &mut queue, f);
        // Mutate the mesh so the queued fingerprint goes stale.
        flip23(&mut mesh, f, &mut queue, None);
        // Draining must not panic on the stale entry.
        flip(&mut mesh, &mut queue, None);
        mesh.check_mesh().unwrap();
    }
}
