//! Point location: walk from a cached or randomly sampled seed toward the
//! query point, crossing one face per step, until the containing tetrahedron
//! is found or the walk leaves the hull.
//!
//! The sample size follows the jump-and-walk scheme: inspect roughly
//! (n / 11)^(1/4) random live tetrahedra and start from the closest.

use anyhow::{bail, Result};
use rand::Rng;

use crate::geometry::distance2;
use crate::mesh::handle::{TriFace, FACE_OPPO};
use crate::mesh::Mesh;
use crate::predicates;

/// Where a query point landed.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LocateResult {
    /// Strictly inside this tetrahedron.
    InTet(TriFace),
    /// On the face of the handle.
    OnFace(TriFace),
    /// On the directed edge of the handle.
    OnEdge(TriFace),
    /// Coincident with the handle's origin.
    OnVertex(TriFace),
    /// Outside the hull; the handle is the hull face the walk exited
    /// through.
    Outside(TriFace),
}

/// Walks from `start` toward `p` using orientation tests only.
///
/// Fails when the step bound is exhausted, which indicates either a corrupt
/// mesh or a pathological degeneracy; callers fall back to scanning.
pub(crate) fn precise_locate(mesh: &Mesh, p: &[f64; 3], start: TriFace) -> Result<LocateResult> {
    let mut cur = start.tet;
    let max_steps = 2 * mesh.num_tets() + 16;

    for _ in 0..max_steps {
        // Orientation of p against each face plane; negative means the same
        // side as the opposite corner (inside-facing).
        let mut oris = [0.0f64; 4];
        let mut best_face = None;
        let mut best_ori = 0.0f64;
        for face in 0..4u8 {
            let h = TriFace::new(cur, face, 0);
            let [a, b, c] = mesh.face_verts(h);
            let ori = predicates::orient3d(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c), p);
            oris[face as usize] = ori;
            if ori > best_ori {
                best_ori = ori;
                best_face = Some(face);
            }
        }

        if let Some(face) = best_face {
            let h = TriFace::new(cur, face, 0);
            let nb = mesh.sym(h);
            if mesh.is_outer(nb) {
                return Ok(LocateResult::Outside(h));
            }
            cur = nb.tet;
            continue;
        }

        // Inside or on the boundary of this tetrahedron; classify by zeros.
        let zero_faces: Vec<u8> = (0..4u8).filter(|&f| oris[f as usize] == 0.0).collect();
        return Ok(match zero_faces.len() {
            0 => LocateResult::InTet(TriFace::new(cur, 0, 0)),
            1 => LocateResult::OnFace(TriFace::new(cur, zero_faces[0], 0)),
            2 => {
                // On the edge common to the two zero faces.
                let f1 = zero_faces[0];
                let f2 = zero_faces[1];
                let v1 = mesh.face_verts(TriFace::new(cur, f1, 0));
                let v2 = mesh.face_verts(TriFace::new(cur, f2, 0));
                let shared: Vec<_> = v1.iter().filter(|v| v2.contains(v)).copied().collect();
                let mut h = TriFace::new(cur, f1, 0);
                if shared.len() == 2 && mesh.find_edge(&mut h, shared[0], shared[1]) {
                    LocateResult::OnEdge(h)
                } else {
                    LocateResult::OnFace(TriFace::new(cur, f1, 0))
                }
            }
            _ => {
                // On the vertex opposite the single non-zero face.
                let nonzero = (0..4u8).find(|&f| oris[f as usize] != 0.0).unwrap_or(0);
                let v = mesh.tet(cur).corners[FACE_OPPO[nonzero as usize]];
                let mut h = TriFace::new(cur, zero_faces[0], 0);
                if !mesh.find_org(&mut h, v) {
                    h = TriFace::new(cur, zero_faces[0], 0);
                }
                LocateResult::OnVertex(h)
            }
        });
    }
    bail!("point location walk did not terminate");
}

/// Full location: pick a good seed (recent tetrahedron or the closest of a
/// random sample), walk, and fall back to an exhaustive scan if the walk gets
/// stuck.
pub(crate) fn locate(mesh: &mut Mesh, p: &[f64; 3]) -> Result<LocateResult> {
    let mut seed = TriFace::NONE;
    if mesh.tets.contains(mesh.recent.tet) && mesh.recent.tet != mesh.outer {
        seed = mesh.recent;
    }

    // Random sampling, sized to the fourth root of the pool.
    let pool = mesh.tets.slot_count();
    if pool > 0 {
        let mut samples = 1usize;
        while 11 * samples * samples * samples * samples < mesh.num_tets() {
            samples += 1;
        }
        let mut best_dist = match seed.is_none() {
            true => f64::INFINITY,
            false => distance2(&mesh.pos(mesh.tet(seed.tet).corners[0]), p),
        };
        for _ in 0..samples {
            let idx = mesh.rng.gen_range(0..pool);
            let Some((t, tet)) = mesh.tets.get_slot(idx) else {
                continue;
            };
            if t == mesh.outer {
                continue;
            }
            let d = distance2(&mesh.pos(tet.corners[0]), p);
            if d < best_dist {
                best_dist = d;
                seed = TriFace::new(t, 0, 0);
            }
        }
    }
    if seed.is_none() {
        match mesh.tet_ids().first() {
            Some(&t) => seed = TriFace::new(t, 0, 0),
            None => bail!("cannot locate in an empty mesh"),
        }
    }

    match precise_locate(mesh, p, seed) {
        Ok(res) => {
            mesh.recent = locate_handle(&res);
            Ok(res)
        }
        Err(_) => {
            // Walk got stuck; scan every live tetrahedron.
            for t in mesh.tet_ids() {
                if let Ok(res) = precise_locate_single(mesh, p, t) {
                    mesh.recent = locate_handle(&res);
                    return Ok(res);
                }
            }
            bail!("point lies in no tetrahedron and not outside the hull")
        }
    }
}

fn locate_handle(res: &LocateResult) -> TriFace {
    match res {
        LocateResult::InTet(h)
        | LocateResult::OnFace(h)
        | LocateResult::OnEdge(h)
        | LocateResult::OnVertex(h)
        | LocateResult::Outside(h) => *h,
    }
}

/// Containment test against a single tetrahedron, used by the scan fallback.
fn precise_locate_single(mesh: &Mesh, p: &[f64; 3], t: crate::mesh::element::TetId) -> Result<LocateResult> {
    for face in 0..4u8 {
        let h = TriFace::new(t, face, 0);
        let [a, b, c] = mesh.face_verts(h);
        if predicates::orient3d(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c), p) > 0.0 {
            bail!("outside");
        }
    }
    precise_locate(mesh, p, TriFace::new(t, 0, 0))
}

/// Snaps a located result to nearby vertices, edges and faces within a
/// relative tolerance, so that arithmetic noise in computed split points does
/// not misclassify them.
pub(crate) fn adjust_locate(
    mesh: &Mesh,
    p: &[f64; 3],
    res: LocateResult,
    eps: f64,
) -> LocateResult {
    let h = match res {
        LocateResult::Outside(_) | LocateResult::OnVertex(_) => return res,
        LocateResult::InTet(h) | LocateResult::OnFace(h) | LocateResult::OnEdge(h) => h,
    };
    let t = h.tet;
    let tol = eps * mesh.longest;

    // Vertex proximity first, then edges, then faces.
    for corner in mesh.tet(t).corners {
        if crate::geometry::distance(&mesh.pos(corner), p) <= tol {
            let mut hv = TriFace::new(t, 0, 0);
            for face in 0..4u8 {
                hv.face = face;
                if mesh.find_org(&mut hv, corner) {
                    return LocateResult::OnVertex(hv);
                }
            }
        }
    }
    let corners = mesh.tet(t).corners;
    for i in 0..4 {
        for j in (i + 1)..4 {
            let (a, b) = (corners[i], corners[j]);
            if crate::geometry::short_distance(p, &mesh.pos(a), &mesh.pos(b)) <= tol {
                let mut he = TriFace::new(t, 0, 0);
                for face in 0..4u8 {
                    he.face = face;
                    if mesh.find_edge(&mut he, a, b) {
                        return LocateResult::OnEdge(he);
                    }
                }
            }
        }
    }
    if let LocateResult::InTet(_) = res {
        for face in 0..4u8 {
            let hf = TriFace::new(t, face, 0);
            let [a, b, c] = mesh.face_verts(hf);
            let (pa, pb, pc) = (mesh.pos(a), mesh.pos(b), mesh.pos(c));
            let vol6 = predicates::orient3d(&pa, &pb, &pc, p);
            if crate::predicates::is_coplanar(&pa, &pb, &pc, p, vol6, eps) {
                return LocateResult::OnFace(hf);
            }
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insert::build_delaunay;
    use crate::mesh::element::{PointId, VertexKind};
    use crate::mesh::Mesh;

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
    fn interior_point_lands_in_a_tetrahedron() {
        let mut mesh = cube_mesh();
        match locate(&mut mesh, &[0.31, 0.41, 0.27]).unwrap() {
            LocateResult::InTet(h) | LocateResult::OnFace(h) | LocateResult::OnEdge(h) => {
                assert!(mesh.tets.contains(h.tet));
            }
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn existing_vertex_is_found() {
        let mut mesh = cube_mesh();
        let res = locate(&mut mesh, &[1.0, 1.0, 0.0]).unwrap();
        match res {
            LocateResult::OnVertex(h) => {
                assert_eq!(mesh.pos(mesh.org(h)), [1.0, 1.0, 0.0]);
            }
            other => panic!("expected a vertex hit, got {other:?}"),
        }
    }

    #[test]
    fn outside_point_reports_the_hull_face() {
        let mut mesh = cube_mesh();
        match locate(&mut mesh, &[0.5, 0.5, 9.0]).unwrap() {
            LocateResult::Outside(h) => {
                assert!(!mesh.sym_exists(h));
            }
            other => panic!("expected outside, got {other:?}"),
        }
    }

    #[test]
    fn adjust_snaps_near_vertices() {
        let mut mesh = cube_mesh();
        let p = [1.0 - 1e-13, 1.0, 0.0];
        let res = locate(&mut mesh, &p).unwrap();
        let adjusted = adjust_locate(&mesh, &p, res, 1e-9);
        assert!(matches!(adjusted, LocateResult::OnVertex(_)));
    }
}
