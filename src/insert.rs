//! Site insertion and the incremental Delaunay builder.
//!
//! A located point splits its containing tetrahedron (1 to 4), face (2 to 6)
//! or edge (ring n to 2n); the freshly created faces then go through the flip
//! engine until local Delaunay-hood is restored. Points outside the hull take
//! the dedicated hull-extension path. A full insertion can be rolled back:
//! inverse flips first, then the inverse split, then the point is recycled.

use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::flip::{
    enqueue_flip_face, flip, rebuild_cavity, undo_flips, FlipLog, FlipQueue,
};
use crate::hilbert::sort_along_hilbert_curve_3d;
use crate::locate::{adjust_locate, locate, LocateResult};
use crate::mesh::arena::Key;
use crate::mesh::element::{PointId, SegmentKind, ShellId, ShellKind, TetId};
use crate::mesh::handle::{SubHandle, TriFace, FACE_RING_NEXT};
use crate::mesh::Mesh;

/// Outcome of inserting one site.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum InsertResult {
    /// Inserted by splitting a tetrahedron (or after a hull extension).
    InTet,
    /// Inserted on an existing face.
    OnFace,
    /// Inserted on an existing edge.
    OnEdge,
    /// Rejected: coincides with this existing vertex.
    Duplicate(PointId),
    /// Rejected: lies outside the hull and hull extension was not allowed.
    Outside,
}

/// Everything needed to undo one insertion.
pub(crate) struct SiteUndo {
    pub point: PointId,
    pub flips: FlipLog,
    /// Corner quadruples of the tetrahedra the split replaced.
    old_tets: Vec<[PointId; 4]>,
    /// Subfaces the split replaced (each became two or three children).
    old_subfaces: Vec<SavedShell>,
    /// The subsegment the split replaced, if the site landed on one.
    old_segment: Option<SavedShell>,
    /// Children shells created by the split.
    new_shells: Vec<ShellId>,
    /// The edge the site split, for ring reconstruction on undo.
    split_edge: Option<(PointId, PointId)>,
}

#[derive(Clone)]
struct SavedShell {
    verts: [PointId; 3],
    marker: i32,
    seg_kind: SegmentKind,
    kind: ShellKind,
}

fn save_shell(mesh: &Mesh, s: ShellId) -> SavedShell {
    let sh = mesh.shell(s);
    SavedShell {
        verts: sh.verts,
        marker: sh.marker,
        seg_kind: sh.seg_kind,
        kind: sh.kind,
    }
}

/// Repoints the face ring entry occupied by `old` to `new` (same edge),
/// keeping the cyclic order.
pub(crate) fn replace_in_ring(mesh: &mut Mesh, old: SubHandle, new: SubHandle) {
    let next = mesh.spivot(old);
    if mesh.is_vacuous(next) {
        return;
    }
    let mut cur = next;
    let mut guard = 0;
    while mesh.spivot(cur).shell != old.shell {
        cur = mesh.spivot(cur);
        guard += 1;
        if guard > 1024 {
            panic!("internal error: face ring does not close");
        }
    }
    mesh.sbond1(cur, new);
    mesh.sbond1(new, next);
}

/// Splits the subface of `s` (oriented a -> b with apex c) at interior point
/// `p` into three children; rings, subsegment bonds and markers carry over.
/// Tetrahedron bonds are left to the caller. Returns the children in edge
/// order (ab, bc, ca).
pub(crate) fn split_subface(mesh: &mut Mesh, s: SubHandle, p: PointId) -> [ShellId; 3] {
    let a = mesh.sorg(s);
    let b = mesh.sdest(s);
    let c = mesh.sapex(s);
    let marker = mesh.shell(s.shell).marker;

    let edges = [(a, b), (b, c), (c, a)];
    let mut outer_rings = [SubHandle::NONE; 3];
    let mut outer_segs = [Key::NONE; 3];
    let mut old_handles = [SubHandle::NONE; 3];
    for (i, (x, y)) in edges.iter().enumerate() {
        let mut h = s;
        if !mesh.sub_find_edge(&mut h, *x, *y) {
            panic!("internal error: subface lost an edge during split");
        }
        old_handles[i] = h;
        outer_rings[i] = mesh.spivot(h);
        outer_segs[i] = mesh.shell(s.shell).segs[h.edge()];
    }

    let children = [
        mesh.make_subface([a, b, p], marker),
        mesh.make_subface([b, c, p], marker),
        mesh.make_subface([c, a, p], marker),
    ];

    for i in 0..3 {
        // Child edge 0 is the parent's outer edge.
        let child_h = SubHandle::new(children[i], 0);
        if !mesh.is_vacuous(outer_rings[i]) {
            replace_in_ring(mesh, old_handles[i], child_h);
        }
        if !outer_segs[i].is_none() {
            mesh.ssbond(child_h, outer_segs[i]);
        }
    }
    // Interior edges pair consecutive children: (x, p) against (p, x).
    for i in 0..3 {
        let j = (i + 1) % 3;
        // Child i edge 1 runs (second vertex, p); child j edge 2 runs
        // (p, first vertex) over the same segment.
        mesh.sbond(SubHandle::new(children[i], 2), SubHandle::new(children[j], 4));
    }
    mesh.kill_shell(s.shell);
    children
}

/// Bonds the subface `child` into both tetrahedra adjoining the face with
/// its vertices. No-op while the face is not represented in the
/// tetrahedralization (pre-recovery surface meshing).
pub(crate) fn bond_subface_both_sides(mesh: &mut Mesh, child: ShellId) -> bool {
    let [a, b, c] = mesh.shell(child).verts;
    let Some(h) = mesh.find_face(a, b, c) else {
        return false;
    };
    mesh.tsbond(h, SubHandle::new(child, 0));
    let hs = mesh.sym(h);
    if !mesh.is_outer(hs) {
        mesh.tsbond(hs, SubHandle::new(child, 0));
    }
    true
}

/// Splits the tetrahedron of `t` at interior point `p` into four.
pub(crate) fn split_tetrahedron(
    mesh: &mut Mesh,
    p: PointId,
    t: TriFace,
    queue: &mut FlipQueue,
) -> SiteUndo {
    let [a, b, c, d] = mesh.tet(t.tet).corners;
    let old = [t.tet];
    let new = [[a, b, c, p], [a, b, d, p], [b, c, d, p], [c, a, d, p]];
    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_new_tets(mesh, queue, &ids);
    SiteUndo {
        point: p,
        flips: FlipLog::new(),
        old_tets: vec![[a, b, c, d]],
        old_subfaces: Vec::new(),
        old_segment: None,
        new_shells: Vec::new(),
        split_edge: None,
    }
}

/// Splits the face of `f` at point `p`: the two adjoining tetrahedra become
/// six (three on the hull), and a subface on the face splits into three.
pub(crate) fn split_tet_face(
    mesh: &mut Mesh,
    p: PointId,
    f: TriFace,
    queue: &mut FlipQueue,
) -> SiteUndo {
    let f = f.ccw();
    let (a, b, c) = (mesh.org(f), mesh.dest(f), mesh.apex(f));
    let d = mesh.oppo(f);
    let fs = mesh.sym(f);
    let mut sub = mesh.tspivot(f);

    let mut old = vec![f.tet];
    let mut old_tets = vec![mesh.tet(f.tet).corners];
    let mut new = vec![[a, b, d, p], [b, c, d, p], [c, a, d, p]];
    if !mesh.is_outer(fs) {
        let e = mesh.oppo(fs);
        old.push(fs.tet);
        old_tets.push(mesh.tet(fs.tet).corners);
        new.extend([[a, b, e, p], [b, c, e, p], [c, a, e, p]]);
    }

    let mut old_subfaces = Vec::new();
    let mut new_shells = Vec::new();
    let has_sub = !mesh.is_vacuous(sub);
    if has_sub {
        old_subfaces.push(save_shell(mesh, sub.shell));
        if !mesh.sub_find_edge(&mut sub, a, b) {
            panic!("internal error: subface does not match its face");
        }
    }

    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_new_tets(mesh, queue, &ids);

    if has_sub {
        let children = split_subface(mesh, sub, p);
        for child in children {
            bond_subface_both_sides(mesh, child);
        }
        new_shells.extend(children);
    }

    SiteUndo {
        point: p,
        flips: FlipLog::new(),
        old_tets,
        old_subfaces,
        old_segment: None,
        new_shells,
        split_edge: None,
    }
}

/// Splits the edge of `e` at point `p`: every tetrahedron around the edge
/// becomes two; a subsegment on the edge splits into two halves and every
/// subface containing the edge splits into two.
pub(crate) fn split_tet_edge(
    mesh: &mut Mesh,
    p: PointId,
    e: TriFace,
    queue: &mut FlipQueue,
) -> SiteUndo {
    let a = mesh.org(e);
    let b = mesh.dest(e);
    let (ring, _open) = mesh.edge_ring(e);

    // Capture boundary elements on the edge before the tetrahedra change.
    let seg = mesh.tsspivot(e);
    let mut subs_ab: Vec<SubHandle> = Vec::new();
    if mesh.check_subfaces {
        for r in &ring {
            let rc = r.ccw();
            let [nf, _] = FACE_RING_NEXT[rc.face as usize][rc.ver as usize];
            for face in [r.face, nf as u8] {
                let mut s = mesh.tspivot(TriFace::new(r.tet, face, 0));
                if !mesh.is_vacuous(s)
                    && mesh.sub_find_edge(&mut s, a, b)
                    && !subs_ab.iter().any(|q| q.shell == s.shell)
                {
                    subs_ab.push(s);
                }
            }
        }
    } else if !mesh.is_vacuous(seg) {
        // Subfaces are not bonded to tetrahedra yet; find the ones carrying
        // the edge by scanning.
        for f in mesh.shell_ids(ShellKind::Subface) {
            let mut s = SubHandle::new(f, 0);
            if mesh.sub_find_edge(&mut s, a, b) {
                subs_ab.push(s);
            }
        }
    }

    let old: Vec<TetId> = ring.iter().map(|r| r.tet).collect();
    let mut old_tets = Vec::with_capacity(old.len());
    let mut new = Vec::with_capacity(2 * old.len());
    for r in &ring {
        let corners = mesh.tet(r.tet).corners;
        old_tets.push(corners);
        let others: Vec<PointId> = corners
            .iter()
            .copied()
            .filter(|&q| q != a && q != b)
            .collect();
        new.push([a, others[0], others[1], p]);
        new.push([b, others[0], others[1], p]);
    }
    let ids = rebuild_cavity(mesh, &old, &new);
    enqueue_new_tets(mesh, queue, &ids);

    let mut undo = SiteUndo {
        point: p,
        flips: FlipLog::new(),
        old_tets,
        old_subfaces: Vec::new(),
        old_segment: None,
        new_shells: Vec::new(),
        split_edge: Some((a, b)),
    };

    // Split the subsegment into (a, p) and (p, b).
    let mut seg_halves: Option<(ShellId, ShellId)> = None;
    if !mesh.is_vacuous(seg) {
        undo.old_segment = Some(save_shell(mesh, seg.shell));
        let sh = mesh.shell(seg.shell);
        let (marker, seg_kind) = (sh.marker, sh.seg_kind);
        let (na, nb) = (sh.ring[0], sh.ring[1]);
        let (sorg, _sdest) = (sh.verts[0], sh.verts[1]);
        // Keep the stored orientation of the original segment.
        let (first, second) = if sorg == a { (a, b) } else { (b, a) };
        let h1 = mesh.make_subsegment(first, p, marker);
        let h2 = mesh.make_subsegment(p, second, marker);
        mesh.shell_mut(h1).seg_kind = seg_kind;
        mesh.shell_mut(h2).seg_kind = seg_kind;
        // Collinear neighbor links: outer ends keep theirs, the joint links
        // the halves.
        if !na.is_none() && !mesh.is_vacuous(na) {
            mesh.shell_mut(h1).ring[0] = na;
            relink_collinear(mesh, na.shell, seg.shell, SubHandle::new(h1, 0));
        }
        if !nb.is_none() && !mesh.is_vacuous(nb) {
            mesh.shell_mut(h2).ring[1] = nb;
            relink_collinear(mesh, nb.shell, seg.shell, SubHandle::new(h2, 0));
        }
        mesh.shell_mut(h1).ring[1] = SubHandle::new(h2, 0);
        mesh.shell_mut(h2).ring[0] = SubHandle::new(h1, 0);
        mesh.kill_shell(seg.shell);
        undo.new_shells.extend([h1, h2]);
        seg_halves = Some(if first == a { (h1, h2) } else { (h2, h1) });
    }

    // Split the subfaces containing the edge.
    let mut halves_a: Vec<ShellId> = Vec::new();
    let mut halves_b: Vec<ShellId> = Vec::new();
    for s in subs_ab {
        undo.old_subfaces.push(save_shell(mesh, s.shell));
        let w = mesh.sapex(s);
        let marker = mesh.shell(s.shell).marker;
        let child_a = mesh.make_subface([a, p, w], marker);
        let child_b = mesh.make_subface([p, b, w], marker);
        // Outer edges keep their context.
        let mut h_bw = s;
        if mesh.sub_find_edge(&mut h_bw, b, w) {
            let seg_bw = mesh.shell(s.shell).segs[h_bw.edge()];
            let mut ch = SubHandle::new(child_b, 0);
            let ok = mesh.sub_find_edge(&mut ch, b, w);
            debug_assert!(ok);
            replace_in_ring(mesh, h_bw, ch);
            if !seg_bw.is_none() {
                mesh.ssbond(ch, seg_bw);
            }
        }
        let mut h_wa = s;
        if mesh.sub_find_edge(&mut h_wa, w, a) {
            let seg_wa = mesh.shell(s.shell).segs[h_wa.edge()];
            let mut ch = SubHandle::new(child_a, 0);
            let ok = mesh.sub_find_edge(&mut ch, w, a);
            debug_assert!(ok);
            replace_in_ring(mesh, h_wa, ch);
            if !seg_wa.is_none() {
                mesh.ssbond(ch, seg_wa);
            }
        }
        // Interior edge (p, w) pairs the two children.
        let mut ha = SubHandle::new(child_a, 0);
        let mut hb = SubHandle::new(child_b, 0);
        let ok = mesh.sub_find_edge(&mut ha, p, w) && mesh.sub_find_edge(&mut hb, w, p);
        debug_assert!(ok);
        mesh.sbond(ha, hb);
        // Segment halves bond to the split edges.
        if let Some((sa, sb)) = seg_halves {
            let mut ea = SubHandle::new(child_a, 0);
            let mut eb = SubHandle::new(child_b, 0);
            let ok = mesh.sub_find_edge(&mut ea, a, p) && mesh.sub_find_edge(&mut eb, p, b);
            debug_assert!(ok);
            mesh.ssbond(ea, sa);
            mesh.ssbond(eb, sb);
        }
        mesh.kill_shell(s.shell);
        halves_a.push(child_a);
        halves_b.push(child_b);
        undo.new_shells.extend([child_a, child_b]);
    }
    // Rebuild the face rings around the two half edges in the inherited
    // rotation order.
    link_ring_cycle(mesh, &halves_a, a, p);
    link_ring_cycle(mesh, &halves_b, p, b);
    for child in halves_a.into_iter().chain(halves_b) {
        bond_subface_both_sides(mesh, child);
    }

    undo
}

/// Repoints the collinear link of segment `seg` that referenced `dead`.
fn relink_collinear(mesh: &mut Mesh, seg: ShellId, dead: ShellId, new: SubHandle) {
    for k in 0..2 {
        if mesh.shell(seg).ring[k].shell == dead {
            mesh.shell_mut(seg).ring[k] = new;
        }
    }
}

/// Links the subfaces (each containing directed edge x -> y) into a cyclic
/// face ring in the given order.
pub(crate) fn link_ring_cycle(mesh: &mut Mesh, members: &[ShellId], x: PointId, y: PointId) {
    if members.len() < 2 {
        return;
    }
    for i in 0..members.len() {
        let j = (i + 1) % members.len();
        let mut hi = SubHandle::new(members[i], 0);
        let mut hj = SubHandle::new(members[j], 0);
        let ok = mesh.sub_find_edge(&mut hi, x, y) && mesh.sub_find_edge(&mut hj, x, y);
        debug_assert!(ok);
        mesh.sbond1(hi, hj);
    }
}

fn enqueue_new_tets(mesh: &Mesh, queue: &mut FlipQueue, ids: &[TetId]) {
    for &t in ids {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let nb = mesh.sym(h);
            if mesh.is_outer(nb) || !ids.contains(&nb.tet) {
                enqueue_flip_face(mesh, queue, h);
            }
        }
    }
}

/// Inserts an already-created point into the tetrahedralization.
///
/// `hull_ok` permits extending the hull for points outside it. With
/// `with_undo` the returned record allows [`undo_site`] to fully roll the
/// insertion back.
pub(crate) fn insert_site(
    mesh: &mut Mesh,
    p: PointId,
    eps: f64,
    hull_ok: bool,
    with_undo: bool,
) -> Result<(InsertResult, Option<SiteUndo>)> {
    let coords = mesh.pos(p);
    let located = locate(mesh, &coords)?;
    let located = adjust_locate(mesh, &coords, located, eps);

    let mut queue = FlipQueue::new();
    let mut undo = match located {
        LocateResult::OnVertex(h) => {
            let dual = mesh.org(h);
            mesh.point_mut(p).dual = dual;
            return Ok((InsertResult::Duplicate(dual), None));
        }
        LocateResult::Outside(h) => {
            if !hull_ok {
                return Ok((InsertResult::Outside, None));
            }
            insert_hull_site(mesh, p, h, &mut queue)?;
            let mut log = FlipLog::new();
            flip(mesh, &mut queue, Some(&mut log));
            return Ok((InsertResult::InTet, None));
        }
        LocateResult::InTet(h) => split_tetrahedron(mesh, p, h, &mut queue),
        LocateResult::OnFace(h) => split_tet_face(mesh, p, h, &mut queue),
        LocateResult::OnEdge(h) => split_tet_edge(mesh, p, h, &mut queue),
    };
    let result = match located {
        LocateResult::InTet(_) => InsertResult::InTet,
        LocateResult::OnFace(_) => InsertResult::OnFace,
        _ => InsertResult::OnEdge,
    };

    let mut log = FlipLog::new();
    flip(mesh, &mut queue, Some(&mut log));
    undo.flips = log;
    Ok((result, with_undo.then_some(undo)))
}

/// Rolls back one insertion completely: inverse flips, then the inverse
/// split, then the point is recycled.
pub(crate) fn undo_site(mesh: &mut Mesh, mut undo: SiteUndo) {
    let p = undo.point;
    undo_flips(mesh, &mut undo.flips);

    // After the inverse flips the star of p is exactly the split result;
    // rebuilding it over the recorded quadruples restores the old tetrahedra.
    let star = mesh.star_tets(p);
    let restored = rebuild_cavity(mesh, &star, &undo.old_tets);

    // Restore replaced boundary elements.
    if let Some(saved) = undo.old_segment.take() {
        let seg = mesh.make_subsegment(saved.verts[0], saved.verts[1], saved.marker);
        mesh.shell_mut(seg).seg_kind = saved.seg_kind;
        // Re-take the collinear links from the two halves.
        for &child in &undo.new_shells {
            if !mesh.shells.contains(child) || mesh.shell(child).kind != ShellKind::Subsegment {
                continue;
            }
            for k in 0..2 {
                let link = mesh.shell(child).ring[k];
                if link.is_none() || mesh.is_vacuous(link) {
                    continue;
                }
                if undo.new_shells.contains(&link.shell) {
                    continue;
                }
                mesh.shell_mut(seg).ring[k] = link;
                relink_collinear(mesh, link.shell, child, SubHandle::new(seg, 0));
            }
        }
    }
    let mut restored_subs = Vec::new();
    for saved in &undo.old_subfaces {
        debug_assert_eq!(saved.kind, ShellKind::Subface);
        let sub = mesh.make_subface(saved.verts, saved.marker);
        restored_subs.push(sub);
        let [a, b, c] = saved.verts;
        for (x, y) in [(a, b), (b, c), (c, a)] {
            // The child owning this outer edge still holds its ring context.
            for &child in &undo.new_shells {
                if !mesh.shells.contains(child) || mesh.shell(child).kind != ShellKind::Subface {
                    continue;
                }
                let mut ch = SubHandle::new(child, 0);
                if !mesh.sub_find_edge(&mut ch, x, y) {
                    continue;
                }
                let next = mesh.spivot(ch);
                let seg = mesh.shell(child).segs[ch.edge()];
                let mut sh = SubHandle::new(sub, 0);
                let ok = mesh.sub_find_edge(&mut sh, x, y);
                debug_assert!(ok);
                if !mesh.is_vacuous(next) && !undo.new_shells.contains(&next.shell) {
                    replace_in_ring(mesh, ch, sh);
                }
                if !seg.is_none() && mesh.shells.contains(seg) {
                    mesh.ssbond(sh, seg);
                }
                break;
            }
        }
        bond_subface_both_sides(mesh, sub);
    }
    // A split edge's face ring was distributed over the half edges; link the
    // restored subfaces back into one ring and rebond the restored segment.
    if let Some((a, b)) = undo.split_edge {
        let on_edge: Vec<ShellId> = restored_subs
            .iter()
            .copied()
            .filter(|&s| {
                let v = mesh.shell(s).verts;
                v.contains(&a) && v.contains(&b)
            })
            .collect();
        link_ring_cycle(mesh, &on_edge, a, b);
        let seg = mesh
            .shell_ids(ShellKind::Subsegment)
            .into_iter()
            .find(|&s| {
                let v = mesh.shell(s).verts;
                (v[0] == a && v[1] == b) || (v[0] == b && v[1] == a)
            });
        if let Some(seg) = seg {
            for &s in &on_edge {
                let mut h = SubHandle::new(s, 0);
                if mesh.sub_find_edge(&mut h, a, b) {
                    mesh.ssbond(h, seg);
                }
            }
        }
    }
    for child in undo.new_shells {
        if mesh.shells.contains(child) {
            mesh.kill_shell(child);
        }
    }

    mesh.recent = TriFace::new(restored[0], 0, 0);
    mesh.kill_point(p);
}

/// Extends the hull to a point outside it: collects the hull faces visible
/// from `p`, cones the point onto them and closes the silhouette.
pub(crate) fn insert_hull_site(
    mesh: &mut Mesh,
    p: PointId,
    start: TriFace,
    queue: &mut FlipQueue,
) -> Result<()> {
    let start = TriFace::new(start.tet, start.face, 0);
    if !visible_from(mesh, start, p) {
        bail!("hull insertion started from an invisible face");
    }

    // Flood the visible part of the hull.
    let mut visible: Vec<TriFace> = vec![start];
    let mut visited: Vec<(TetId, u8)> = vec![(start.tet, start.face)];
    let mut stack = vec![start];
    while let Some(h) = stack.pop() {
        for ver in [0u8, 2, 4] {
            let edge = TriFace::new(h.tet, h.face, ver);
            let nb = hull_neighbor(mesh, edge);
            if visited.contains(&(nb.tet, nb.face)) {
                continue;
            }
            visited.push((nb.tet, nb.face));
            if visible_from(mesh, nb, p) {
                visible.push(nb);
                stack.push(nb);
            }
        }
    }

    // Cone the point onto every visible face.
    let mut old_face: HashMap<[PointId; 3], TriFace> = HashMap::new();
    for &h in &visible {
        old_face.insert(sorted3(mesh.face_verts(h)), h);
    }
    let mut ids = Vec::with_capacity(visible.len());
    for &h in &visible {
        let [a, b, c] = mesh.face_verts(h);
        ids.push(mesh.make_tet(a, b, c, p));
    }
    let mut open: HashMap<[PointId; 3], TriFace> = HashMap::new();
    for &t in &ids {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let key = sorted3(mesh.face_verts(h));
            if let Some(base) = old_face.get(&key) {
                mesh.bond(h, *base);
                continue;
            }
            if let Some(other) = open.remove(&key) {
                mesh.bond(h, other);
            } else {
                open.insert(key, h);
            }
        }
    }
    let leftovers: Vec<TriFace> = open.into_values().collect();
    for h in leftovers {
        mesh.dissolve(h);
    }

    // The covered hull faces are now interior and may violate Delaunay-hood.
    for h in visible {
        enqueue_flip_face(mesh, queue, h);
    }
    mesh.recent = TriFace::new(ids[0], 0, 0);
    Ok(())
}

fn sorted3(mut v: [PointId; 3]) -> [PointId; 3] {
    v.sort();
    v
}

/// Strict visibility: a coplanar hull face is not coned over, so no
/// zero-volume tetrahedron enters the hull extension.
fn visible_from(mesh: &Mesh, h: TriFace, p: PointId) -> bool {
    let [a, b, c] = mesh.face_verts(h);
    mesh.orient4(a, b, c, p) > 0.0
}

/// The hull face adjacent to the hull face of `h` across its directed edge.
pub(crate) fn hull_neighbor(mesh: &Mesh, h: TriFace) -> TriFace {
    let a = mesh.org(h);
    let b = mesh.dest(h);
    let mut cur = h;
    let mut guard = 0;
    while let Some(next) = mesh.ring_step(cur, a, b) {
        cur = next;
        guard += 1;
        if guard > 1024 {
            panic!("internal error: hull edge ring does not terminate");
        }
    }
    let e = cur.ccw();
    let [nf, _] = FACE_RING_NEXT[e.face as usize][e.ver as usize];
    TriFace::new(cur.tet, nf as u8, 0)
}

/// Builds the Delaunay tetrahedralization of the given points by incremental
/// insertion in Hilbert-curve order. Returns the number of points actually
/// inserted (the rest were duplicates).
pub(crate) fn build_delaunay(mesh: &mut Mesh, ids: &[PointId]) -> Result<usize> {
    if ids.len() < 4 {
        bail!("needs at least 4 points to tetrahedralize");
    }
    let coords: Vec<[f64; 3]> = ids.iter().map(|&p| mesh.pos(p)).collect();
    let order = sort_along_hilbert_curve_3d(&coords, (0..ids.len()).collect());
    let mut pending: Vec<PointId> = order.into_iter().map(|i| ids[i]).collect();

    bootstrap_first_tet(mesh, &mut pending)?;

    let mut inserted = 4usize;
    let mut duplicates = 0usize;
    while let Some(p) = pending.pop() {
        match insert_site(mesh, p, 1e-12, true, false)? {
            (InsertResult::Duplicate(of), _) => {
                log::debug!("skipping duplicate of point {of}");
                duplicates += 1;
            }
            _ => inserted += 1,
        }
    }
    if duplicates > 0 {
        log::warn!("{duplicates} duplicate input points were not inserted");
    }
    Ok(inserted)
}

/// Picks four affinely independent points from the back of `pending` (the
/// front of the insertion order) and creates the first tetrahedron.
fn bootstrap_first_tet(mesh: &mut Mesh, pending: &mut Vec<PointId>) -> Result<()> {
    let p0 = pending.pop().unwrap();
    // Second point: first with distinct coordinates.
    let p1 = loop {
        let Some(q) = pending.pop() else {
            bail!("all input points are coincident");
        };
        if mesh.pos(q) != mesh.pos(p0) {
            break q;
        }
        mesh.point_mut(q).dual = p0;
        log::debug!("skipping duplicate of point {p0}");
    };
    // Third point: the one spanning the largest triangle.
    let (a, b) = (mesh.pos(p0), mesh.pos(p1));
    let mut best = None;
    let mut best_area = 0.0f64;
    for (i, &q) in pending.iter().enumerate().rev() {
        let area = crate::geometry::tri_area(&a, &b, &mesh.pos(q));
        if area > best_area {
            best_area = area;
            best = Some(i);
        }
    }
    let Some(i2) = best else {
        bail!("all input points are collinear");
    };
    let p2 = pending.remove(i2);

    // Fourth point: the first not coplanar with the triangle; coplanar ones
    // are deferred and re-inserted later.
    let mut deferred = Vec::new();
    let p3 = loop {
        let Some(q) = pending.pop() else {
            bail!("all input points are coplanar");
        };
        if mesh.orient4(p0, p1, p2, q) != 0.0 {
            break q;
        }
        deferred.push(q);
    };
    pending.append(&mut deferred);

    let t = mesh.make_tet(p0, p1, p2, p3);
    for face in 0..4u8 {
        mesh.dissolve(TriFace::new(t, face, 0));
    }
    mesh.recent = TriFace::new(t, 0, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::element::VertexKind;

    fn build(coords: &[[f64; 3]]) -> (Mesh, Vec<PointId>) {
        let mut mesh = Mesh::new();
        let ids: Vec<PointId> = coords
            .iter()
            .map(|&c| mesh.make_point(c, VertexKind::Input))
            .collect();
        let (mut lo, mut hi) = ([f64::INFINITY; 3], [f64::NEG_INFINITY; 3]);
        for c in coords {
            for k in 0..3 {
                lo[k] = lo[k].min(c[k]);
                hi[k] = hi[k].max(c[k]);
            }
        }
        mesh.longest = crate::geometry::distance(&lo, &hi);
        build_delaunay(&mut mesh, &ids).unwrap();
        (mesh, ids)
    }

    const CUBE: [[f64; 3]; 8] = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];

    #[test]
    fn delaunay_of_the_unit_cube() {
        let (mesh, _) = build(&CUBE);
        // The cube splits into five or six tetrahedra.
        assert!(
            mesh.num_tets() == 5 || mesh.num_tets() == 6,
            "got {} tetrahedra",
            mesh.num_tets()
        );
        mesh.check_mesh().unwrap();
        assert_eq!(mesh.check_delaunay(), 1.0);

        // Their volumes fill the cube exactly.
        let mut volume = 0.0;
        for t in mesh.tet_ids() {
            let [a, b, c, d] = mesh.tet(t).corners;
            volume += crate::geometry::tet_volume(
                &mesh.pos(a),
                &mesh.pos(b),
                &mesh.pos(c),
                &mesh.pos(d),
            )
            .abs();
        }
        assert!((volume - 1.0).abs() < 1e-12);
        // Every hull face is on the cube surface: 12 triangles.
        assert_eq!(mesh.hull_size(), 12);
    }

    #[test]
    fn delaunay_of_a_fixed_cloud() {
        let coords = [
            [-2.91, 4.7, 6.85],
            [6.49, -5.9, 9.69],
            [-7.1, -9.17, 0.85],
            [8.7, -4.5, -6.4],
            [9.8, 4.9, 4.29],
            [-4.165, 6.3, 2.69],
            [4.105, -1.8, -9.71],
            [5.3, -3.2, 2.68],
            [7.62, 5.3, -1.57],
            [0.28, 0.49, -0.181],
        ];
        let (mesh, _) = build(&coords);
        mesh.check_mesh().unwrap();
        assert_eq!(mesh.check_delaunay(), 1.0);
    }

    #[test]
    fn duplicate_points_are_rejected() {
        let mut coords = CUBE.to_vec();
        coords.push([1.0, 1.0, 1.0]); // repeats a corner
        let mut mesh = Mesh::new();
        let ids: Vec<PointId> = coords
            .iter()
            .map(|&c| mesh.make_point(c, VertexKind::Input))
            .collect();
        mesh.longest = 3.0f64.sqrt();
        let inserted = build_delaunay(&mut mesh, &ids).unwrap();
        assert_eq!(inserted, 8);
        assert_eq!(mesh.check_delaunay(), 1.0);
    }

    #[test]
    fn insertion_splits_and_keeps_delaunay() {
        let (mut mesh, _) = build(&CUBE);
        let before_tets = mesh.num_tets();
        let p = mesh.make_point([0.5, 0.5, 0.5], VertexKind::FreeVolume);
        let (result, _) = insert_site(&mut mesh, p, 1e-12, false, false).unwrap();
        assert_eq!(result, InsertResult::InTet);
        assert!(mesh.num_tets() > before_tets);
        mesh.check_mesh().unwrap();
        assert_eq!(mesh.check_delaunay(), 1.0);
    }

    #[test]
    fn undo_restores_the_pre_insertion_topology() {
        let (mut mesh, _) = build(&CUBE);
        let before_tets = mesh.num_tets();
        let before_points = mesh.num_points();
        let before_sets = {
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
        };

        let p = mesh.make_point([0.4, 0.35, 0.3], VertexKind::FreeVolume);
        let (result, undo) = insert_site(&mut mesh, p, 1e-12, false, true).unwrap();
        assert_eq!(result, InsertResult::InTet);
        undo_site(&mut mesh, undo.unwrap());

        assert_eq!(mesh.num_tets(), before_tets);
        assert_eq!(mesh.num_points(), before_points);
        let after_sets = {
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
        };
        assert_eq!(after_sets, before_sets);
        mesh.check_mesh().unwrap();
    }

    #[test]
    fn outside_point_extends_the_hull() {
        let (mut mesh, _) = build(&CUBE);
        let p = mesh.make_point([0.5, 0.5, 2.0], VertexKind::Input);
        let (result, _) = insert_site(&mut mesh, p, 1e-12, true, false).unwrap();
        assert_eq!(result, InsertResult::InTet);
        mesh.check_mesh().unwrap();
        assert_eq!(mesh.check_delaunay(), 1.0);
        // The new point is on the hull now.
        assert!(mesh.star_tets(p).iter().any(|&t| {
            (0..4u8).any(|f| mesh.is_outer(mesh.sym(TriFace::new(t, f, 0))))
        }));
    }

    #[test]
    fn outside_point_is_rejected_when_hull_is_closed() {
        let (mut mesh, _) = build(&CUBE);
        let tets = mesh.num_tets();
        let p = mesh.make_point([5.0, 5.0, 5.0], VertexKind::FreeVolume);
        let (result, _) = insert_site(&mut mesh, p, 1e-12, false, false).unwrap();
        assert_eq!(result, InsertResult::Outside);
        assert_eq!(mesh.num_tets(), tets);
    }

    #[test]
    fn point_count_is_monotone_through_insertions() {
        let (mut mesh, _) = build(&CUBE);
        let mut last = mesh.num_points();
        for (i, &coords) in [[0.3, 0.3, 0.3], [0.7, 0.6, 0.5], [0.2, 0.8, 0.4]]
            .iter()
            .enumerate()
        {
            let p = mesh.make_point(coords, VertexKind::FreeVolume);
            insert_site(&mut mesh, p, 1e-12, false, false).unwrap();
            let now = mesh.num_points();
            assert!(now > last, "insertion {i} shrank the point count");
            last = now;
        }
    }
}
