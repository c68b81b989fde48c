//! Delaunay-refinement quality meshing: encroachment queues for subsegments
//! and subfaces, a priority queue of bad tetrahedra keyed by radius-edge
//! ratio, circumcenter insertion with rollback when a new point would
//! encroach protected boundary, and a final sliver pass.
//!
//! Termination is heuristic for arbitrary input; the engine bounds the
//! number of added points and reports non-convergence instead of looping.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::constrain::ProtectRadii;
use crate::exchange::Behavior;
use crate::flip::{categorize_face, flip, flip23, flip32, FlipClass, FlipQueue};
use crate::geometry;
use crate::insert::{insert_site, split_tet_edge, undo_site, InsertResult};
use crate::mesh::element::{PointId, SegmentKind, ShellId, ShellKind, TetId, VertexKind};
use crate::mesh::handle::{SubHandle, TriFace};
use crate::mesh::Mesh;

/// Priority category of an encroached subface, ordered from most to least
/// urgent: touching an acute vertex and a sharp segment, an acute vertex, a
/// sharp segment, a free segment vertex on a sharp segment, a non-acute
/// vertex on a sharp segment, or none of these.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum EncSubCategory {
    AcuteVertexSharpSegment,
    AcuteVertex,
    SharpSegment,
    FreeVertexOnSharp,
    NonAcuteOnSharp,
    Plain,
}

/// A queued bad tetrahedron: handle plus the vertices present at enqueue
/// time; stale entries are dropped at pop time.
struct BadTet {
    key: f64,
    tet: TetId,
    verts: [PointId; 4],
}

impl PartialEq for BadTet {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for BadTet {}
impl PartialOrd for BadTet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for BadTet {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.total_cmp(&other.key)
    }
}

/// Outcome of the refinement pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct QualityOutcome {
    pub steiner: usize,
    pub non_convergent: bool,
    pub irreparable_slivers: usize,
}

/// The encroaching vertex of a subsegment, if any: tested against the
/// corners of the tetrahedra around the segment's edge.
fn segment_encroacher(mesh: &Mesh, seg: ShellId) -> Option<PointId> {
    let [a, b, _] = mesh.shell(seg).verts;
    let h = mesh.sstpivot(seg)?;
    let (pa, pb) = (mesh.pos(a), mesh.pos(b));
    let (ring, _) = mesh.edge_ring(h);
    for r in ring {
        for v in mesh.tet(r.tet).corners {
            if v == a || v == b || v.is_none() {
                continue;
            }
            if geometry::encroaches_segment(&pa, &pb, &mesh.pos(v)) {
                return Some(v);
            }
        }
    }
    None
}

/// The encroaching vertex of a subface: the corners opposite its two
/// adjoining tetrahedra, tested against the equatorial sphere.
fn subface_encroacher(mesh: &Mesh, s: ShellId) -> Option<PointId> {
    let [a, b, c] = mesh.shell(s).verts;
    let (pa, pb, pc) = (mesh.pos(a), mesh.pos(b), mesh.pos(c));
    for side in 0..2u8 {
        let t = mesh.stpivot(SubHandle::new(s, side));
        if mesh.is_outer(t) || !mesh.tets.contains(t.tet) {
            continue;
        }
        let v = mesh.oppo(t);
        if v.is_none() || v == a || v == b || v == c {
            continue;
        }
        if geometry::encroaches_face(&pa, &pb, &pc, &mesh.pos(v)) {
            return Some(v);
        }
    }
    None
}

/// True if the vertex lies on a sharp subsegment.
fn on_sharp_segment(mesh: &Mesh, v: PointId) -> bool {
    mesh.shell_ids(ShellKind::Subsegment).into_iter().any(|s| {
        let sh = mesh.shell(s);
        sh.seg_kind == SegmentKind::Sharp && (sh.verts[0] == v || sh.verts[1] == v)
    })
}

/// Buckets an encroached subface by its protection context.
fn categorize_enc_sub(mesh: &Mesh, s: ShellId) -> EncSubCategory {
    let verts = mesh.shell(s).verts;
    let has_acute = verts
        .iter()
        .any(|&v| !v.is_none() && mesh.point(v).kind == VertexKind::Acute);
    let mut has_sharp_edge = false;
    for ver in [0u8, 2, 4] {
        let seg = mesh.sspivot(SubHandle::new(s, ver));
        if !mesh.is_vacuous(seg) && mesh.shell(seg.shell).seg_kind == SegmentKind::Sharp {
            has_sharp_edge = true;
        }
    }
    if has_acute && has_sharp_edge {
        return EncSubCategory::AcuteVertexSharpSegment;
    }
    if has_acute {
        return EncSubCategory::AcuteVertex;
    }
    if has_sharp_edge {
        return EncSubCategory::SharpSegment;
    }
    for &v in &verts {
        if v.is_none() {
            continue;
        }
        if on_sharp_segment(mesh, v) {
            return match mesh.point(v).kind {
                VertexKind::FreeSegment => EncSubCategory::FreeVertexOnSharp,
                _ => EncSubCategory::NonAcuteOnSharp,
            };
        }
    }
    EncSubCategory::Plain
}

/// The reference split point of an encroached subface: the equatorial-sphere
/// center, pulled onto an acute vertex's protecting sphere when one guards
/// the subface.
fn sub_split_point(
    mesh: &Mesh,
    s: ShellId,
    category: EncSubCategory,
    radii: &ProtectRadii,
) -> Option<[f64; 3]> {
    let [a, b, c] = mesh.shell(s).verts;
    let (pa, pb, pc) = (mesh.pos(a), mesh.pos(b), mesh.pos(c));
    let (center, _) = geometry::tri_circumsphere(&pa, &pb, &pc)?;
    match category {
        EncSubCategory::AcuteVertexSharpSegment | EncSubCategory::AcuteVertex => {
            let acute = [a, b, c]
                .into_iter()
                .find(|&v| mesh.point(v).kind == VertexKind::Acute)?;
            let pv = mesh.pos(acute);
            let r = radii.get(&acute).copied()?;
            let d = geometry::distance(&pv, &center);
            if d <= r || d == 0.0 {
                return Some(center);
            }
            let t = r / d;
            Some([
                pv[0] + t * (center[0] - pv[0]),
                pv[1] + t * (center[1] - pv[1]),
                pv[2] + t * (center[2] - pv[2]),
            ])
        }
        _ => Some(center),
    }
}

/// Splits an encroached subsegment at its protected reference point.
fn split_encroached_segment(
    mesh: &mut Mesh,
    seg: ShellId,
    radii: &ProtectRadii,
) -> Option<PointId> {
    let [a, b, _] = mesh.shell(seg).verts;
    let refpt = segment_encroacher(mesh, seg);
    let coords = crate::constrain::split_point_for(mesh, a, b, refpt, radii);
    let h = mesh.sstpivot(seg)?;
    let p = mesh.make_point(coords, VertexKind::FreeSegment);
    let mut queue = FlipQueue::new();
    // Splitting the tetrahedron edge splits the subsegment and its ringed
    // subfaces along with it.
    split_tet_edge(mesh, p, h, &mut queue);
    flip(mesh, &mut queue, None);
    Some(p)
}

/// Inserts a point with rollback: if the insertion succeeds but the new
/// point encroaches any subsegment, it is undone and the encroached segments
/// are reported for splitting first.
fn insert_guarded(
    mesh: &mut Mesh,
    coords: [f64; 3],
    kind: VertexKind,
    eps: f64,
) -> Result<Option<PointId>, Vec<ShellId>> {
    let p = mesh.make_point(coords, kind);
    match insert_site(mesh, p, eps, false, true) {
        Ok((InsertResult::Duplicate(_), _)) | Ok((InsertResult::Outside, _)) => {
            mesh.kill_point(p);
            Ok(None)
        }
        Err(_) => {
            mesh.kill_point(p);
            Ok(None)
        }
        Ok((_, undo)) => {
            // Did the new point encroach a protected segment?
            let mut encroached = Vec::new();
            let pp = mesh.pos(p);
            for seg in mesh.shell_ids(ShellKind::Subsegment) {
                let [a, b, _] = mesh.shell(seg).verts;
                if a == p || b == p {
                    continue;
                }
                if geometry::encroaches_segment(&mesh.pos(a), &mesh.pos(b), &pp) {
                    encroached.push(seg);
                }
            }
            if encroached.is_empty() {
                Ok(Some(p))
            } else {
                if let Some(undo) = undo {
                    undo_site(mesh, undo);
                } else {
                    mesh.kill_point(p);
                }
                Err(encroached)
            }
        }
    }
}

/// Radius-edge ratio squared of a tetrahedron, infinity when degenerate.
fn ratio2(mesh: &Mesh, t: TetId) -> f64 {
    let [a, b, c, d] = mesh.tet(t).corners;
    let r = geometry::radius_edge_ratio(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c), &mesh.pos(d));
    r * r
}

/// True if the tetrahedron violates its volume constraint.
fn volume_violates(mesh: &Mesh, t: TetId, behavior: &Behavior) -> bool {
    let [a, b, c, d] = mesh.tet(t).corners;
    let vol = geometry::tet_volume(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c), &mesh.pos(d)).abs();
    if behavior.fixed_volume && behavior.max_volume > 0.0 && vol > behavior.max_volume {
        return true;
    }
    if behavior.var_volume {
        if let Some(bound) = mesh.tet(t).volume_bound {
            if vol > bound {
                return true;
            }
        }
    }
    false
}

/// Runs refinement to a fixed point or to the iteration bound.
pub(crate) fn enforce_quality(
    mesh: &mut Mesh,
    behavior: &Behavior,
    radii: &ProtectRadii,
) -> QualityOutcome {
    let mut outcome = QualityOutcome::default();
    let bound2 = behavior.min_ratio * behavior.min_ratio;
    let max_steiner = behavior
        .max_steiner
        .unwrap_or_else(|| (10 * mesh.num_points()).max(1000));
    let eps = behavior.epsilon;
    // Elements that could not be split stay listed here so a stuck element
    // cannot be re-selected forever.
    let mut skipped: Vec<ShellId> = Vec::new();
    let mut skipped_tets: Vec<(TetId, [PointId; 4])> = Vec::new();

    'outer: loop {
        if outcome.steiner >= max_steiner {
            outcome.non_convergent = true;
            log::warn!(
                "quality refinement reached its point bound ({max_steiner}) before converging"
            );
            break;
        }

        // 1. Encroached subsegments, in queue order.
        let segs = mesh.shell_ids(ShellKind::Subsegment);
        for seg in segs {
            if !mesh.shells.contains(seg) || skipped.contains(&seg) {
                continue;
            }
            if segment_encroacher(mesh, seg).is_some() {
                if split_encroached_segment(mesh, seg, radii).is_some() {
                    outcome.steiner += 1;
                } else {
                    skipped.push(seg);
                }
                continue 'outer;
            }
        }

        // 2. Encroached subfaces, most urgent category first.
        let mut enc_subs: Vec<(EncSubCategory, ShellId)> = Vec::new();
        for s in mesh.shell_ids(ShellKind::Subface) {
            if !skipped.contains(&s) && subface_encroacher(mesh, s).is_some() {
                enc_subs.push((categorize_enc_sub(mesh, s), s));
            }
        }
        enc_subs.sort();
        if let Some(&(category, s)) = enc_subs.first() {
            let before = outcome.steiner;
            if let Some(coords) = sub_split_point(mesh, s, category, radii) {
                match insert_guarded(mesh, coords, VertexKind::FreeSubface, eps) {
                    Ok(Some(_)) => outcome.steiner += 1,
                    Ok(None) => {
                        // Unable to place the reference point; split the
                        // subface's longest edge instead.
                        if split_longest_edge(mesh, s, radii) {
                            outcome.steiner += 1;
                        }
                    }
                    Err(encroached) => {
                        for seg in encroached {
                            if mesh.shells.contains(seg) {
                                if split_encroached_segment(mesh, seg, radii).is_some() {
                                    outcome.steiner += 1;
                                }
                                break;
                            }
                        }
                    }
                }
            }
            if outcome.steiner == before {
                skipped.push(s);
            }
            continue 'outer;
        }

        // 3. Bad tetrahedra by radius-edge priority.
        let mut heap = BinaryHeap::new();
        for t in mesh.tet_ids() {
            let key = ratio2(mesh, t);
            if (key > bound2 || volume_violates(mesh, t, behavior))
                && !skipped_tets.contains(&(t, mesh.tet(t).corners))
            {
                heap.push(BadTet {
                    key,
                    tet: t,
                    verts: mesh.tet(t).corners,
                });
            }
        }
        while let Some(bad) = heap.pop() {
            // Re-validate against the current mesh.
            if !mesh.tets.contains(bad.tet) || mesh.tet(bad.tet).corners != bad.verts {
                continue;
            }
            if ratio2(mesh, bad.tet) <= bound2 && !volume_violates(mesh, bad.tet, behavior) {
                continue;
            }
            let [a, b, c, d] = bad.verts;
            let Some((center, _)) = geometry::circumsphere(
                &mesh.pos(a),
                &mesh.pos(b),
                &mesh.pos(c),
                &mesh.pos(d),
            ) else {
                skipped_tets.push((bad.tet, bad.verts));
                continue;
            };
            match insert_guarded(mesh, center, VertexKind::FreeVolume, eps) {
                Ok(Some(_)) => {
                    outcome.steiner += 1;
                    continue 'outer;
                }
                Ok(None) => {
                    skipped_tets.push((bad.tet, bad.verts));
                    continue;
                }
                Err(encroached) => {
                    // The circumcenter would encroach: split the boundary
                    // first and retry the tetrahedron later.
                    let mut progressed = false;
                    for seg in encroached {
                        if mesh.shells.contains(seg) && !skipped.contains(&seg) {
                            if split_encroached_segment(mesh, seg, radii).is_some() {
                                outcome.steiner += 1;
                                progressed = true;
                                break;
                            }
                            skipped.push(seg);
                        }
                    }
                    if !progressed {
                        skipped_tets.push((bad.tet, bad.verts));
                        continue;
                    }
                    continue 'outer;
                }
            }
        }
        // The queue drained without a single insertion; if violations
        // remain, the run did not converge.
        let stuck = mesh
            .tet_ids()
            .into_iter()
            .any(|t| ratio2(mesh, t) > bound2 || volume_violates(mesh, t, behavior));
        if stuck {
            outcome.non_convergent = true;
            log::warn!("quality refinement stalled with violations remaining");
        }
        break;
    }
    outcome
}

/// Fallback split: bisect the subface's longest unprotected edge.
fn split_longest_edge(mesh: &mut Mesh, s: ShellId, radii: &ProtectRadii) -> bool {
    if !mesh.shells.contains(s) {
        return false;
    }
    let [a, b, c] = mesh.shell(s).verts;
    let mut edges = [(a, b), (b, c), (c, a)];
    edges.sort_by(|&(x1, y1), &(x2, y2)| {
        let l1 = geometry::distance2(&mesh.pos(x1), &mesh.pos(y1));
        let l2 = geometry::distance2(&mesh.pos(x2), &mesh.pos(y2));
        l2.total_cmp(&l1)
    });
    for (x, y) in edges {
        let coords = crate::constrain::split_point_for(mesh, x, y, None, radii);
        let Some(h) = mesh.find_tet_edge(x, y) else {
            continue;
        };
        let p = mesh.make_point(coords, VertexKind::FreeSubface);
        let mut queue = FlipQueue::new();
        split_tet_edge(mesh, p, h, &mut queue);
        flip(mesh, &mut queue, None);
        return true;
    }
    false
}

/// Detects tetrahedra whose smallest dihedral angle falls below the bound
/// and tries to remove them with local flips; the irreparable ones are
/// counted and reported.
pub(crate) fn remove_slivers(mesh: &mut Mesh, max_dihedral_deg: f64) -> usize {
    let threshold = max_dihedral_deg.to_radians();
    let mut irreparable = 0usize;
    let slivers: Vec<TetId> = mesh
        .tet_ids()
        .into_iter()
        .filter(|&t| is_sliver(mesh, t, threshold))
        .collect();
    for t in slivers {
        if !mesh.tets.contains(t) || !is_sliver(mesh, t, threshold) {
            continue;
        }
        if !repair_sliver(mesh, t) {
            irreparable += 1;
            let [a, b, c, d] = mesh.tet(t).corners;
            log::warn!("irreparable sliver tetrahedron ({a}, {b}, {c}, {d})");
        }
    }
    irreparable
}

fn is_sliver(mesh: &Mesh, t: TetId, threshold: f64) -> bool {
    let [a, b, c, d] = mesh.tet(t).corners;
    let angles =
        geometry::tet_dihedrals(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c), &mesh.pos(d));
    angles.iter().any(|&angle| angle < threshold)
}

/// Tries the flip repertoire on the sliver's faces and edges.
fn repair_sliver(mesh: &mut Mesh, t: TetId) -> bool {
    let mut queue = FlipQueue::new();
    for face in 0..4u8 {
        if !mesh.tets.contains(t) {
            return true;
        }
        let h = TriFace::new(t, face, 0);
        match categorize_face(mesh, h) {
            FlipClass::ThreeTwo(edge) => {
                flip32(mesh, edge, &mut queue, None);
                flip(mesh, &mut queue, None);
                return true;
            }
            FlipClass::TwoThree => {
                flip23(mesh, h, &mut queue, None);
                flip(mesh, &mut queue, None);
                return true;
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::build_delaunay;
    use crate::mesh::element::PointId;

    fn cube_mesh() -> Mesh {
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
        mesh
    }

    #[test]
    fn refinement_reaches_the_ratio_bound() {
        let mut mesh = cube_mesh();
        let behavior = Behavior {
            quality: true,
            ..Default::default()
        };
        let radii = ProtectRadii::new();
        let outcome = enforce_quality(&mut mesh, &behavior, &radii);
        assert!(!outcome.non_convergent);
        let bound2 = behavior.min_ratio * behavior.min_ratio;
        for t in mesh.tet_ids() {
            assert!(
                ratio2(&mesh, t) <= bound2 + 1e-9,
                "tetrahedron above the ratio bound after refinement"
            );
        }
        mesh.check_mesh().unwrap();
    }

    #[test]
    fn volume_constraint_drives_refinement() {
        let mut mesh = cube_mesh();
        let before = mesh.num_tets();
        let behavior = Behavior {
            quality: true,
            fixed_volume: true,
            max_volume: 0.05,
            ..Default::default()
        };
        let radii = ProtectRadii::new();
        let outcome = enforce_quality(&mut mesh, &behavior, &radii);
        assert!(outcome.steiner > 0);
        assert!(mesh.num_tets() > before);
        for t in mesh.tet_ids() {
            assert!(!volume_violates(&mesh, t, &behavior) || outcome.non_convergent);
        }
    }

    #[test]
    fn injected_sliver_is_reported_when_unrepairable() {
        // A single nearly flat tetrahedron injected directly into storage:
        // no neighbors exist, so no flip can repair it, and it must be
        // reported rather than silently ignored.
        let mut mesh = Mesh::new();
        let v: Vec<PointId> = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.5, 0.5, 1.0e-7],
        ]
        .iter()
        .map(|&c| mesh.make_point(c, VertexKind::Input))
        .collect();
        let t = mesh.make_tet(v[0], v[1], v[2], v[3]);
        for face in 0..4u8 {
            mesh.dissolve(TriFace::new(t, face, 0));
        }
        mesh.longest = 2.0;

        let irreparable = remove_slivers(&mut mesh, 5.0);
        assert_eq!(irreparable, 1);
        // The tetrahedron is still there, reported but intact.
        assert_eq!(mesh.num_tets(), 1);
    }

    #[test]
    fn sliver_detector_ignores_well_shaped_tets() {
        let mut mesh = cube_mesh();
        let irreparable = remove_slivers(&mut mesh, 5.0);
        assert_eq!(irreparable, 0);
    }

    #[test]
    fn encroachment_category_ordering() {
        assert!(EncSubCategory::AcuteVertexSharpSegment < EncSubCategory::AcuteVertex);
        assert!(EncSubCategory::AcuteVertex < EncSubCategory::SharpSegment);
        assert!(EncSubCategory::NonAcuteOnSharp < EncSubCategory::Plain);
    }
}
