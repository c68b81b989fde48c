//! Constrained recovery: after unconstrained Delaunay construction, every
//! input segment and facet must appear in the tetrahedralization as a chain
//! of boundary elements.
//!
//! Missing segments are recovered by splitting them at reference points
//! chosen to respect acute-vertex protecting spheres; missing facet regions
//! are recovered by matching surface diagonals to the tetrahedralization and,
//! where tetrahedron edges cross the region, by inserting the crossing
//! points. Hole carving and region-attribute propagation run last, by virus
//! infection bounded by the recovered boundary.

use std::collections::HashMap;

use anyhow::Result;

use crate::flip::{flip, FlipQueue};
use crate::geometry;
use crate::insert::{
    bond_subface_both_sides, link_ring_cycle, replace_in_ring, split_subface, split_tet_edge,
};
use crate::locate::{locate, LocateResult};
use crate::mesh::arena::Key;
use crate::mesh::element::{PointId, SegmentKind, ShellId, ShellKind, VertexKind};
use crate::mesh::handle::{SubHandle, TriFace};
use crate::mesh::Mesh;
use crate::predicates;

/// Protecting radii of acute vertices, by point id.
pub(crate) type ProtectRadii = HashMap<PointId, f64>;

/// Classifies input vertices as acute or non-acute: a vertex is acute when
/// two of its incident segments meet at less than 60 degrees. Returns the
/// protecting radius of each acute vertex (a third of its shortest incident
/// segment).
pub(crate) fn mark_acute_vertices(mesh: &mut Mesh) -> ProtectRadii {
    let segs = mesh.shell_ids(ShellKind::Subsegment);
    let mut incident: HashMap<PointId, Vec<PointId>> = HashMap::new();
    for &s in &segs {
        let v = mesh.shell(s).verts;
        incident.entry(v[0]).or_default().push(v[1]);
        incident.entry(v[1]).or_default().push(v[0]);
    }
    let threshold = 60.0f64.to_radians();
    let mut radii = ProtectRadii::new();
    for (&v, others) in &incident {
        let pv = mesh.pos(v);
        let mut acute = false;
        for i in 0..others.len() {
            for j in (i + 1)..others.len() {
                let angle =
                    geometry::interior_angle(&pv, &mesh.pos(others[i]), &mesh.pos(others[j]));
                if angle < threshold {
                    acute = true;
                }
            }
        }
        let kind = if acute {
            let shortest = others
                .iter()
                .map(|&o| geometry::distance(&pv, &mesh.pos(o)))
                .fold(f64::INFINITY, f64::min);
            radii.insert(v, shortest / 3.0);
            VertexKind::Acute
        } else {
            VertexKind::NonAcute
        };
        if mesh.point(v).kind == VertexKind::Input || mesh.point(v).kind == VertexKind::Facet {
            mesh.point_mut(v).kind = kind;
        }
    }
    radii
}

/// Marks segments where two facets meet at a dihedral angle below 90
/// degrees as sharp.
pub(crate) fn mark_sharp_segments(mesh: &mut Mesh) {
    let threshold = 90.0f64.to_radians();
    for s in mesh.shell_ids(ShellKind::Subsegment) {
        let [a, b, _] = mesh.shell(s).verts;
        // Consecutive faces in the ring around the segment.
        let mut apexes: Vec<PointId> = Vec::new();
        for f in mesh.shell_ids(ShellKind::Subface) {
            let v = mesh.shell(f).verts;
            if v.contains(&a) && v.contains(&b) {
                apexes.push(v.iter().copied().find(|&q| q != a && q != b).unwrap());
            }
        }
        let (pa, pb) = (mesh.pos(a), mesh.pos(b));
        let mut sharp = false;
        for i in 0..apexes.len() {
            for j in (i + 1)..apexes.len() {
                let angle =
                    geometry::face_dihedral(&pa, &pb, &mesh.pos(apexes[i]), &mesh.pos(apexes[j]));
                if angle < threshold {
                    sharp = true;
                }
            }
        }
        mesh.shell_mut(s).seg_kind = if sharp {
            SegmentKind::Sharp
        } else {
            SegmentKind::NonSharp
        };
    }
}

/// How a walk from a segment's origin toward its destination leaves the
/// origin's star.
#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum SegmentDirection {
    /// The segment is already an edge of the tetrahedralization.
    Along(TriFace),
    /// The segment leaves through the interior of this face.
    AcrossFace(TriFace),
    /// The segment leaves along one of this face's edges.
    AcrossEdge(TriFace),
    /// No exit found (degenerate star).
    Lost,
}

/// Walks the star of `a` to classify how the segment (a, b) departs.
pub(crate) fn find_direction(mesh: &Mesh, a: PointId, b: PointId) -> SegmentDirection {
    let star = mesh.star_tets(a);
    for &t in &star {
        if mesh.tet(t).corners.contains(&b) {
            let mut h = TriFace::new(t, 0, 0);
            for face in 0..4u8 {
                h.face = face;
                if mesh.find_edge(&mut h, a, b) {
                    return SegmentDirection::Along(h);
                }
            }
        }
    }
    let pa = mesh.pos(a);
    let pb = mesh.pos(b);
    for &t in &star {
        // The face opposite a.
        let corners = mesh.tet(t).corners;
        let Some(pos_a) = corners.iter().position(|&v| v == a) else {
            continue;
        };
        let opp_face = match pos_a {
            0 => 2u8, // corner v0 is opposite face 2 (v1, v3, v2)
            1 => 3,
            2 => 1,
            _ => 0,
        };
        let h = TriFace::new(t, opp_face, 0);
        let [x, y, z] = mesh.face_verts(h);
        let (px, py, pz) = (mesh.pos(x), mesh.pos(y), mesh.pos(z));
        // Does the ray a -> b pass through the face?
        let sx = predicates::orient3d(&pa, &pb, &px, &py);
        let sy = predicates::orient3d(&pa, &pb, &py, &pz);
        let sz = predicates::orient3d(&pa, &pb, &pz, &px);
        let pos = [sx, sy, sz].iter().filter(|s| **s > 0.0).count();
        let neg = [sx, sy, sz].iter().filter(|s| **s < 0.0).count();
        if pos > 0 && neg > 0 {
            continue;
        }
        // And on the b side of the star.
        let plane = predicates::orient3d(&px, &py, &pz, &pa);
        let plane_b = predicates::orient3d(&px, &py, &pz, &pb);
        if plane == 0.0 || plane.signum() == plane_b.signum() {
            continue;
        }
        let zeros = [sx, sy, sz].iter().filter(|s| **s == 0.0).count();
        if zeros > 0 {
            return SegmentDirection::AcrossEdge(h);
        }
        return SegmentDirection::AcrossFace(h);
    }
    SegmentDirection::Lost
}

/// True if the tetrahedralization carries edge (a, b).
fn tet_edge_exists(mesh: &Mesh, a: PointId, b: PointId) -> bool {
    matches!(find_direction(mesh, a, b), SegmentDirection::Along(_))
}

/// Splits the boundary elements on edge (a, b) at `p`: the subsegment
/// becomes two halves and every ringed subface splits in two. The
/// tetrahedralization is untouched.
pub(crate) fn split_boundary_edge(mesh: &mut Mesh, seg: ShellId, p: PointId) -> (ShellId, ShellId) {
    let sh = mesh.shell(seg);
    let (a, b) = (sh.verts[0], sh.verts[1]);
    let (marker, seg_kind) = (sh.marker, sh.seg_kind);
    let (na, nb) = (sh.ring[0], sh.ring[1]);

    let h1 = mesh.make_subsegment(a, p, marker);
    let h2 = mesh.make_subsegment(p, b, marker);
    mesh.shell_mut(h1).seg_kind = seg_kind;
    mesh.shell_mut(h2).seg_kind = seg_kind;
    if !na.is_none() && !mesh.is_vacuous(na) {
        mesh.shell_mut(h1).ring[0] = na;
        relink_collinear(mesh, na.shell, seg, SubHandle::new(h1, 0));
    }
    if !nb.is_none() && !mesh.is_vacuous(nb) {
        mesh.shell_mut(h2).ring[1] = nb;
        relink_collinear(mesh, nb.shell, seg, SubHandle::new(h2, 0));
    }
    mesh.shell_mut(h1).ring[1] = SubHandle::new(h2, 0);
    mesh.shell_mut(h2).ring[0] = SubHandle::new(h1, 0);

    // Split every subface carrying the edge.
    let mut on_edge: Vec<ShellId> = Vec::new();
    for f in mesh.shell_ids(ShellKind::Subface) {
        let v = mesh.shell(f).verts;
        if v.contains(&a) && v.contains(&b) {
            on_edge.push(f);
        }
    }
    let mut halves_a = Vec::new();
    let mut halves_b = Vec::new();
    for f in on_edge {
        let mut s_ab = SubHandle::new(f, 0);
        if !mesh.sub_find_edge(&mut s_ab, a, b) {
            continue;
        }
        let w = mesh.sapex(s_ab);
        let marker = mesh.shell(f).marker;
        let child_a = mesh.make_subface([a, p, w], marker);
        let child_b = mesh.make_subface([p, b, w], marker);
        for (x, y, child) in [(b, w, child_b), (w, a, child_a)] {
            let mut oh = SubHandle::new(f, 0);
            if mesh.sub_find_edge(&mut oh, x, y) {
                let edge_seg = mesh.shell(f).segs[oh.edge()];
                let mut ch = SubHandle::new(child, 0);
                let ok = mesh.sub_find_edge(&mut ch, x, y);
                debug_assert!(ok);
                if !mesh.is_vacuous(mesh.spivot(oh)) {
                    replace_in_ring(mesh, oh, ch);
                }
                if !edge_seg.is_none() {
                    mesh.ssbond(ch, edge_seg);
                }
            }
        }
        let mut ha = SubHandle::new(child_a, 0);
        let mut hb = SubHandle::new(child_b, 0);
        let ok = mesh.sub_find_edge(&mut ha, p, w) && mesh.sub_find_edge(&mut hb, w, p);
        debug_assert!(ok);
        mesh.sbond(ha, hb);
        let mut ea = SubHandle::new(child_a, 0);
        let mut eb = SubHandle::new(child_b, 0);
        let ok = mesh.sub_find_edge(&mut ea, a, p) && mesh.sub_find_edge(&mut eb, p, b);
        debug_assert!(ok);
        mesh.ssbond(ea, h1);
        mesh.ssbond(eb, h2);
        mesh.kill_shell(f);
        halves_a.push(child_a);
        halves_b.push(child_b);
    }
    link_ring_cycle(mesh, &halves_a, a, p);
    link_ring_cycle(mesh, &halves_b, p, b);
    for child in halves_a.into_iter().chain(halves_b) {
        bond_subface_both_sides(mesh, child);
    }
    mesh.kill_shell(seg);
    (h1, h2)
}

fn relink_collinear(mesh: &mut Mesh, seg: ShellId, dead: ShellId, new: SubHandle) {
    for k in 0..2 {
        if mesh.shell(seg).ring[k].shell == dead {
            mesh.shell_mut(seg).ring[k] = new;
        }
    }
}

/// A vertex near the missing segment (a, b) to steer the split position: the
/// corner of the walked tetrahedra that encroaches the segment's diametral
/// sphere the deepest.
fn scout_ref_point(mesh: &Mesh, a: PointId, b: PointId) -> Option<PointId> {
    let (pa, pb) = (mesh.pos(a), mesh.pos(b));
    let mut best: Option<(PointId, f64)> = None;
    for t in mesh.star_tets(a) {
        for v in mesh.tet(t).corners {
            if v == a || v == b || v.is_none() {
                continue;
            }
            let pv = mesh.pos(v);
            if !geometry::encroaches_segment(&pa, &pb, &pv) {
                continue;
            }
            let angle = geometry::interior_angle(&pv, &pa, &pb);
            match best {
                Some((_, a0)) if a0 >= angle => {}
                _ => best = Some((v, angle)),
            }
        }
    }
    best.map(|(v, _)| v)
}

/// The split position on segment (a, b), honoring protecting spheres: near
/// an acute endpoint the split lands on its protecting sphere, elsewhere the
/// reference point's projection rounded to a power of two keeps split points
/// from cascading.
pub(crate) fn split_point_for(
    mesh: &Mesh,
    a: PointId,
    b: PointId,
    refpt: Option<PointId>,
    radii: &ProtectRadii,
) -> [f64; 3] {
    let pa = mesh.pos(a);
    let pb = mesh.pos(b);
    let len = geometry::distance(&pa, &pb);
    let lerp = |t: f64| {
        [
            pa[0] + t * (pb[0] - pa[0]),
            pa[1] + t * (pb[1] - pa[1]),
            pa[2] + t * (pb[2] - pa[2]),
        ]
    };
    if let Some(&r) = radii.get(&a) {
        if r < len {
            return lerp(r / len);
        }
    }
    if let Some(&r) = radii.get(&b) {
        if r < len {
            return lerp(1.0 - r / len);
        }
    }
    let t = match refpt {
        Some(v) => {
            let proj = geometry::proj_point(&mesh.pos(v), &pa, &pb);
            (geometry::distance(&pa, &proj) / len).clamp(0.125, 0.875)
        }
        None => 0.5,
    };
    // Round to the nearest power of two so repeated splits share endpoints.
    let rounded = (2.0f64).powi(t.log2().round() as i32).clamp(0.125, 0.875);
    lerp(rounded)
}

/// Recovers every input segment into the tetrahedralization, inserting
/// protected Steiner points where a segment is missing.
pub(crate) fn delaunize_segments(
    mesh: &mut Mesh,
    radii: &ProtectRadii,
    eps: f64,
) -> Result<usize> {
    let mut pending: Vec<ShellId> = mesh.shell_ids(ShellKind::Subsegment);
    let mut added = 0usize;
    let budget = 100 * pending.len().max(16);
    let mut rounds = 0usize;
    while let Some(seg) = pending.pop() {
        if !mesh.shells.contains(seg) {
            continue;
        }
        let [a, b, _] = mesh.shell(seg).verts;
        if tet_edge_exists(mesh, a, b) {
            continue;
        }
        rounds += 1;
        if rounds > budget {
            log::warn!("segment recovery did not converge; input may have tiny angles");
            break;
        }
        let refpt = scout_ref_point(mesh, a, b);
        let coords = split_point_for(mesh, a, b, refpt, radii);
        let p = mesh.make_point(coords, VertexKind::FreeSegment);
        match crate::insert::insert_site(mesh, p, eps, false, false)? {
            (crate::insert::InsertResult::Duplicate(_), _)
            | (crate::insert::InsertResult::Outside, _) => {
                // The split point was unusable; revisit the segment (the
                // reference point changes as the mesh around it does).
                mesh.kill_point(p);
                pending.push(seg);
                continue;
            }
            _ => added += 1,
        }
        let (h1, h2) = split_boundary_edge(mesh, seg, p);
        pending.push(h1);
        pending.push(h2);
    }
    if added > 0 {
        log::debug!("segment recovery added {added} Steiner points");
    }
    Ok(added)
}

/// Bonds every subface whose triangle exists in the tetrahedralization and
/// recovers the regions that do not, by diagonal matching and crossing-edge
/// splitting.
pub(crate) fn constrained_facets(mesh: &mut Mesh, eps: f64) -> Result<usize> {
    mesh.check_subfaces = true;
    let mut added = 0usize;
    let budget = 20 * mesh.shell_ids(ShellKind::Subface).len().max(32);
    let mut rounds = 0usize;
    loop {
        let missing: Vec<ShellId> = mesh
            .shell_ids(ShellKind::Subface)
            .into_iter()
            .filter(|&s| {
                let [a, b, c] = mesh.shell(s).verts;
                mesh.find_face(a, b, c).is_none()
            })
            .collect();
        if missing.is_empty() {
            break;
        }
        rounds += 1;
        if rounds > budget {
            log::warn!(
                "facet recovery did not converge; {} subfaces remain unbonded",
                missing.len()
            );
            break;
        }
        // First try matching diagonals: a missing surface diagonal whose
        // opposite diagonal is a tetrahedralization edge can be swapped in
        // the surface.
        if rearrange_subfaces(mesh, &missing) {
            continue;
        }
        // Otherwise split a crossing tetrahedron edge on the facet plane.
        let Some((edge, point)) = scout_crossing_edge(mesh, &missing) else {
            log::warn!(
                "facet recovery is stuck; {} subfaces remain unbonded",
                missing.len()
            );
            break;
        };
        let p = mesh.make_point(point, VertexKind::FreeSubface);
        let mut queue = FlipQueue::new();
        let h = match mesh.find_tet_edge(edge.0, edge.1) {
            Some(h) => h,
            None => {
                mesh.kill_point(p);
                continue;
            }
        };
        split_tet_edge(mesh, p, h, &mut queue);
        flip(mesh, &mut queue, None);
        added += 1;
        // Split the surface subface containing the new point.
        if let Some((s, on_edge)) = surface_containing(mesh, &missing, p, eps) {
            if let Some((x, y)) = on_edge {
                if let Some(seg) = subface_edge_segment(mesh, s, x, y) {
                    split_boundary_edge(mesh, seg, p);
                } else {
                    split_surface_edge(mesh, s, x, y, p);
                }
            } else {
                let children = split_subface(mesh, SubHandle::new(s, 0), p);
                for child in children {
                    bond_subface_both_sides(mesh, child);
                }
            }
        }
    }
    // Bond everything that is representable.
    for s in mesh.shell_ids(ShellKind::Subface) {
        bond_subface_both_sides(mesh, s);
    }
    Ok(added)
}

/// Swaps surface diagonals to match the tetrahedralization: for a missing
/// subface pair whose shared (unprotected) diagonal is absent from the
/// tetrahedralization while the opposite diagonal is present, swap. Returns
/// true if progress was made.
fn rearrange_subfaces(mesh: &mut Mesh, missing: &[ShellId]) -> bool {
    for &s in missing {
        if !mesh.shells.contains(s) {
            continue;
        }
        let verts = mesh.shell(s).verts;
        for (i, j) in [(0usize, 1usize), (1, 2), (2, 0)] {
            let (u, v) = (verts[i], verts[j]);
            let mut h = SubHandle::new(s, 0);
            if !mesh.sub_find_edge(&mut h, u, v) {
                continue;
            }
            if !mesh.is_vacuous(mesh.sspivot(h)) {
                continue; // protected by a segment, not swappable
            }
            let next = mesh.spivot(h);
            if mesh.is_vacuous(next) {
                continue;
            }
            let mut other = next;
            if !mesh.sub_find_edge(&mut other, v, u) {
                continue;
            }
            let w1 = mesh.sapex(h);
            let w2 = mesh.sapex(other);
            if tet_edge_exists(mesh, u, v) || !tet_edge_exists(mesh, w1, w2) {
                continue;
            }
            // Swap (u, v) for (w1, w2) in the surface.
            swap_surface_diagonal(mesh, h, other, u, v, w1, w2);
            return true;
        }
    }
    false
}

/// The plain shell-level diagonal swap used outside facet triangulation.
fn swap_surface_diagonal(
    mesh: &mut Mesh,
    h: SubHandle,
    other: SubHandle,
    u: PointId,
    v: PointId,
    w1: PointId,
    w2: PointId,
) {
    let (t1, t2) = (h.shell, other.shell);
    let mut contexts = Vec::with_capacity(4);
    for (shell, x, y) in [(t1, v, w1), (t1, w1, u), (t2, u, w2), (t2, w2, v)] {
        let mut oh = SubHandle::new(shell, 0);
        if !mesh.sub_find_edge(&mut oh, x, y) {
            continue;
        }
        let ring = mesh.spivot(oh);
        let seg = mesh.shell(shell).segs[oh.edge()];
        contexts.push((x, y, oh, ring, seg));
    }
    let marker = mesh.shell(t1).marker;
    let n1 = mesh.make_subface([u, w2, w1], marker);
    let n2 = mesh.make_subface([v, w1, w2], marker);
    for (x, y, oh, ring, seg) in contexts {
        let owner = if (x == v && y == w1) || (x == w2 && y == v) {
            n2
        } else {
            n1
        };
        let mut ch = SubHandle::new(owner, 0);
        if !mesh.sub_find_edge(&mut ch, x, y) {
            continue;
        }
        if !mesh.is_vacuous(ring) {
            replace_in_ring(mesh, oh, ch);
        }
        if !seg.is_none() {
            mesh.ssbond(ch, seg);
        }
    }
    let mut d1 = SubHandle::new(n1, 0);
    let mut d2 = SubHandle::new(n2, 0);
    if mesh.sub_find_edge(&mut d1, w2, w1) && mesh.sub_find_edge(&mut d2, w1, w2) {
        mesh.sbond(d1, d2);
    }
    mesh.kill_shell(t1);
    mesh.kill_shell(t2);
    bond_subface_both_sides(mesh, n1);
    bond_subface_both_sides(mesh, n2);
}

/// Finds a tetrahedron edge properly crossing one of the missing subfaces
/// and the crossing point on the facet plane.
fn scout_crossing_edge(
    mesh: &Mesh,
    missing: &[ShellId],
) -> Option<((PointId, PointId), [f64; 3])> {
    for &s in missing {
        if !mesh.shells.contains(s) {
            continue;
        }
        let [a, b, c] = mesh.shell(s).verts;
        let (pa, pb, pc) = (mesh.pos(a), mesh.pos(b), mesh.pos(c));
        for t in mesh.tet_ids() {
            let corners = mesh.tet(t).corners;
            for i in 0..4 {
                for j in (i + 1)..4 {
                    let (u, v) = (corners[i], corners[j]);
                    if [a, b, c].contains(&u) || [a, b, c].contains(&v) {
                        continue;
                    }
                    let (pu, pv) = (mesh.pos(u), mesh.pos(v));
                    let su = predicates::orient3d(&pa, &pb, &pc, &pu);
                    let sv = predicates::orient3d(&pa, &pb, &pc, &pv);
                    if su == 0.0 || sv == 0.0 || su.signum() == sv.signum() {
                        continue;
                    }
                    // The edge straddles the plane; does it pierce the
                    // triangle?
                    let s1 = predicates::orient3d(&pu, &pv, &pa, &pb);
                    let s2 = predicates::orient3d(&pu, &pv, &pb, &pc);
                    let s3 = predicates::orient3d(&pu, &pv, &pc, &pa);
                    let pos = [s1, s2, s3].iter().filter(|x| **x > 0.0).count();
                    let neg = [s1, s2, s3].iter().filter(|x| **x < 0.0).count();
                    if pos > 0 && neg > 0 {
                        continue;
                    }
                    let t_param = su / (su - sv);
                    let point = [
                        pu[0] + t_param * (pv[0] - pu[0]),
                        pu[1] + t_param * (pv[1] - pu[1]),
                        pu[2] + t_param * (pv[2] - pu[2]),
                    ];
                    return Some(((u, v), point));
                }
            }
        }
    }
    None
}

/// The missing subface (or subface edge) geometrically containing `p`.
fn surface_containing(
    mesh: &Mesh,
    missing: &[ShellId],
    p: PointId,
    eps: f64,
) -> Option<(ShellId, Option<(PointId, PointId)>)> {
    let pp = mesh.pos(p);
    for &s in missing {
        if !mesh.shells.contains(s) {
            continue;
        }
        let [a, b, c] = mesh.shell(s).verts;
        let (pa, pb, pc) = (mesh.pos(a), mesh.pos(b), mesh.pos(c));
        let vol6 = predicates::orient3d(&pa, &pb, &pc, &pp);
        if !predicates::is_coplanar(&pa, &pb, &pc, &pp, vol6, eps) {
            continue;
        }
        for ((x, y), (px, py)) in [((a, b), (pa, pb)), ((b, c), (pb, pc)), ((c, a), (pc, pa))] {
            if geometry::short_distance(&pp, &px, &py) < eps * mesh.longest.max(1.0) {
                return Some((s, Some((x, y))));
            }
        }
        // Inside test via areas.
        let area = geometry::tri_area(&pa, &pb, &pc);
        let a1 = geometry::tri_area(&pp, &pb, &pc);
        let a2 = geometry::tri_area(&pa, &pp, &pc);
        let a3 = geometry::tri_area(&pa, &pb, &pp);
        if (a1 + a2 + a3) <= area * (1.0 + 1e-9) {
            return Some((s, None));
        }
    }
    None
}

fn subface_edge_segment(mesh: &Mesh, s: ShellId, x: PointId, y: PointId) -> Option<ShellId> {
    let mut h = SubHandle::new(s, 0);
    if !mesh.sub_find_edge(&mut h, x, y) {
        return None;
    }
    let seg = mesh.sspivot(h);
    if mesh.is_vacuous(seg) {
        None
    } else {
        Some(seg.shell)
    }
}

/// Splits an unprotected surface edge (x, y) of subface `s` (and its ring
/// partner) at `p`.
fn split_surface_edge(mesh: &mut Mesh, s: ShellId, x: PointId, y: PointId, p: PointId) {
    let mut sides = Vec::new();
    let mut h = SubHandle::new(s, 0);
    if !mesh.sub_find_edge(&mut h, x, y) {
        return;
    }
    sides.push(h);
    let next = mesh.spivot(h);
    if !mesh.is_vacuous(next) {
        sides.push(next);
    }
    let mut halves_x = Vec::new();
    let mut halves_y = Vec::new();
    for mut side in sides {
        if !mesh.sub_find_edge(&mut side, x, y) {
            continue;
        }
        let w = mesh.sapex(side);
        let marker = mesh.shell(side.shell).marker;
        let child_x = mesh.make_subface([x, p, w], marker);
        let child_y = mesh.make_subface([p, y, w], marker);
        for (u, v, child) in [(y, w, child_y), (w, x, child_x)] {
            let mut oh = SubHandle::new(side.shell, 0);
            if mesh.sub_find_edge(&mut oh, u, v) {
                let seg = mesh.shell(side.shell).segs[oh.edge()];
                let mut ch = SubHandle::new(child, 0);
                if mesh.sub_find_edge(&mut ch, u, v) {
                    if !mesh.is_vacuous(mesh.spivot(oh)) {
                        replace_in_ring(mesh, oh, ch);
                    }
                    if !seg.is_none() {
                        mesh.ssbond(ch, seg);
                    }
                }
            }
        }
        let mut ha = SubHandle::new(child_x, 0);
        let mut hb = SubHandle::new(child_y, 0);
        if mesh.sub_find_edge(&mut ha, p, w) && mesh.sub_find_edge(&mut hb, w, p) {
            mesh.sbond(ha, hb);
        }
        mesh.kill_shell(side.shell);
        halves_x.push(child_x);
        halves_y.push(child_y);
    }
    for (members, (u, v)) in [(halves_x, (x, p)), (halves_y, (p, y))] {
        if members.len() == 2 {
            let mut h0 = SubHandle::new(members[0], 0);
            let mut h1 = SubHandle::new(members[1], 0);
            if mesh.sub_find_edge(&mut h0, u, v) && mesh.sub_find_edge(&mut h1, u, v) {
                mesh.sbond(h0, h1);
            }
        }
        for &m in &members {
            bond_subface_both_sides(mesh, m);
        }
    }
}

/// Carves holes and the outside: infection starts at unprotected hull faces
/// and at hole points, spreads through faces without subfaces, and the
/// infected tetrahedra are removed.
pub(crate) fn carve_holes(mesh: &mut Mesh, holes: &[[f64; 3]]) -> Result<usize> {
    let mut infected: Vec<crate::mesh::element::TetId> = Vec::new();
    // Outside: hull faces not covered by a subface.
    for t in mesh.tet_ids() {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            if mesh.is_outer(mesh.sym(h))
                && mesh.is_vacuous(mesh.tspivot(h))
                && !infected.contains(&t)
            {
                infected.push(t);
            }
        }
    }
    // Hole seeds.
    for hole in holes {
        match locate(mesh, hole) {
            Ok(LocateResult::InTet(h))
            | Ok(LocateResult::OnFace(h))
            | Ok(LocateResult::OnEdge(h)) => {
                if !infected.contains(&h.tet) {
                    infected.push(h.tet);
                }
            }
            Ok(_) | Err(_) => {
                log::warn!("hole point lies outside the mesh and is ignored");
            }
        }
    }
    // Spread.
    let mut cursor = 0;
    while cursor < infected.len() {
        let t = infected[cursor];
        cursor += 1;
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            if !mesh.is_vacuous(mesh.tspivot(h)) {
                continue;
            }
            let nb = mesh.sym(h);
            if mesh.is_outer(nb) || infected.contains(&nb.tet) {
                continue;
            }
            infected.push(nb.tet);
        }
    }
    // Remove.
    for &t in &infected {
        mesh.tet_mut(t).infected = true;
    }
    for &t in &infected {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let s = mesh.tspivot(h);
            if !mesh.is_vacuous(s) {
                mesh.stdissolve(s);
            }
            let nb = mesh.sym(h);
            if !mesh.is_outer(nb) && !mesh.tet(nb.tet).infected {
                mesh.dissolve(nb);
            }
        }
    }
    let removed = infected.len();
    for t in infected {
        mesh.kill_tet(t);
    }
    // Subfaces having lost both sides are gone with the cavity.
    for s in mesh.shell_ids(ShellKind::Subface) {
        let dead0 = mesh.is_outer(mesh.stpivot(SubHandle::new(s, 0)))
            || !mesh.tets.contains(mesh.stpivot(SubHandle::new(s, 0)).tet);
        let dead1 = mesh.is_outer(mesh.stpivot(SubHandle::new(s, 1)))
            || !mesh.tets.contains(mesh.stpivot(SubHandle::new(s, 1)).tet);
        if dead0 && dead1 {
            drop_subface(mesh, s);
        }
    }
    // Refresh stale location seeds.
    let live = mesh.tet_ids();
    if let Some(&t) = live.first() {
        mesh.recent = TriFace::new(t, 0, 0);
        let points: Vec<PointId> = mesh.points.iter().map(|(k, _)| k).collect();
        for p in points {
            let seed = mesh.point(p).tet;
            if !mesh.tets.contains(seed) {
                mesh.point_mut(p).tet = Key::NONE;
            }
        }
        for &t in &live {
            for c in mesh.tet(t).corners {
                mesh.point_mut(c).tet = t;
            }
        }
    }
    Ok(removed)
}

fn drop_subface(mesh: &mut Mesh, s: ShellId) {
    for ver in [0u8, 2, 4] {
        let h = SubHandle::new(s, ver);
        let link = mesh.spivot(h);
        if !mesh.is_vacuous(link) {
            replace_out_of_ring(mesh, h);
        }
    }
    mesh.kill_shell(s);
}

/// Unlinks `h` from its face ring, keeping the rest of the cycle intact.
fn replace_out_of_ring(mesh: &mut Mesh, h: SubHandle) {
    let next = mesh.spivot(h);
    if mesh.is_vacuous(next) {
        return;
    }
    if next.shell == h.shell {
        return;
    }
    let mut cur = next;
    let mut guard = 0;
    while mesh.spivot(cur).shell != h.shell {
        cur = mesh.spivot(cur);
        guard += 1;
        if guard > 1024 {
            return;
        }
    }
    if next.shell == cur.shell {
        // Two-element ring collapses to an unbonded edge.
        mesh.sdissolve(cur);
    } else {
        mesh.sbond1(cur, next);
    }
}

/// Propagates region attributes and volume bounds from region marker points
/// through subface-bounded components.
pub(crate) fn assign_regions(
    mesh: &mut Mesh,
    regions: &[crate::exchange::Region],
    region_attrib: bool,
    var_volume: bool,
) -> Result<()> {
    for (i, region) in regions.iter().enumerate() {
        let seed = match locate(mesh, &region.point) {
            Ok(LocateResult::InTet(h))
            | Ok(LocateResult::OnFace(h))
            | Ok(LocateResult::OnEdge(h)) => h.tet,
            _ => {
                log::warn!("region point {i} lies outside the mesh and is ignored");
                continue;
            }
        };
        let mut component = vec![seed];
        let mut cursor = 0;
        while cursor < component.len() {
            let t = component[cursor];
            cursor += 1;
            for face in 0..4u8 {
                let h = TriFace::new(t, face, 0);
                if !mesh.is_vacuous(mesh.tspivot(h)) {
                    continue;
                }
                let nb = mesh.sym(h);
                if mesh.is_outer(nb) || component.contains(&nb.tet) {
                    continue;
                }
                component.push(nb.tet);
            }
        }
        for t in component {
            if region_attrib {
                mesh.tet_mut(t).attrs = vec![region.attribute];
            }
            if var_volume && region.volume > 0.0 {
                let bound = mesh.tet_mut(t).volume_bound;
                mesh.tet_mut(t).volume_bound =
                    Some(bound.map_or(region.volume, |b| b.min(region.volume)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::build_delaunay;

    fn cube_mesh() -> (Mesh, Vec<PointId>) {
        let mut mesh = Mesh::new();
        let coords = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        let ids: Vec<PointId> = coords
            .iter()
            .map(|&c| mesh.make_point(c, VertexKind::Input))
            .collect();
        mesh.longest = 3.0f64.sqrt();
        build_delaunay(&mut mesh, &ids).unwrap();
        (mesh, ids)
    }

    #[test]
    fn find_direction_sees_existing_edges() {
        let (mesh, ids) = cube_mesh();
        // Cube edges always exist in the tetrahedralization.
        match find_direction(&mesh, ids[0], ids[1]) {
            SegmentDirection::Along(h) => {
                assert_eq!(mesh.org(h), ids[0]);
                assert_eq!(mesh.dest(h), ids[1]);
            }
            other => panic!("expected the edge, got {other:?}"),
        }
    }

    #[test]
    fn acute_vertices_are_marked() {
        let mut mesh = Mesh::new();
        let v: Vec<PointId> = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 0.1, 0.0],
        ]
        .iter()
        .map(|&c| mesh.make_point(c, VertexKind::Input))
        .collect();
        // Two segments meeting at v0 under a few degrees.
        mesh.make_subsegment(v[0], v[1], 0);
        mesh.make_subsegment(v[0], v[2], 0);
        let radii = mark_acute_vertices(&mut mesh);
        assert_eq!(mesh.point(v[0]).kind, VertexKind::Acute);
        assert!(radii.contains_key(&v[0]));
        assert_eq!(mesh.point(v[1]).kind, VertexKind::NonAcute);
    }

    #[test]
    fn sharp_segments_are_marked() {
        let mut mesh = Mesh::new();
        let v: Vec<PointId> = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.5, 1.0, 0.0],
            [0.5, 1.0, 0.2],
        ]
        .iter()
        .map(|&c| mesh.make_point(c, VertexKind::Input))
        .collect();
        // Two facets meeting at (v0, v1) under a thin wedge.
        mesh.make_subface([v[0], v[1], v[2]], 1);
        mesh.make_subface([v[1], v[0], v[3]], 2);
        let seg = mesh.make_subsegment(v[0], v[1], 0);
        mark_sharp_segments(&mut mesh);
        assert_eq!(mesh.shell(seg).seg_kind, SegmentKind::Sharp);
    }

    #[test]
    fn split_point_respects_protecting_spheres() {
        let (mesh, ids) = cube_mesh();
        let mut radii = ProtectRadii::new();
        radii.insert(ids[0], 0.25);
        let p = split_point_for(&mesh, ids[0], ids[1], None, &radii);
        let d = geometry::distance(&mesh.pos(ids[0]), &p);
        assert!((d - 0.25).abs() < 1e-12);
    }

    #[test]
    fn split_point_defaults_to_the_midpoint() {
        let (mesh, ids) = cube_mesh();
        let radii = ProtectRadii::new();
        let p = split_point_for(&mesh, ids[0], ids[1], None, &radii);
        assert_eq!(p, [0.5, 0.0, 0.0]);
    }

    #[test]
    fn carve_respects_protected_boundary() {
        // Fully covered hull: nothing is carved.
        let (mut mesh, _) = cube_mesh();
        mesh.check_subfaces = true;
        let mut hull_faces = Vec::new();
        for t in mesh.tet_ids() {
            for face in 0..4u8 {
                let h = TriFace::new(t, face, 0);
                if mesh.is_outer(mesh.sym(h)) {
                    hull_faces.push((h, mesh.face_verts(h)));
                }
            }
        }
        for (h, verts) in hull_faces {
            let s = mesh.make_subface(verts, 1);
            mesh.tsbond(h, SubHandle::new(s, 0));
        }
        let before = mesh.num_tets();
        let removed = carve_holes(&mut mesh, &[]).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(mesh.num_tets(), before);
    }
}
