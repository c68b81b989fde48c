//! The pipeline behind [`tetrahedralize`]: node transfer, incremental
//! Delaunay construction (or mesh reconstruction in refine mode), surface
//! meshing and constrained recovery, hole carving, quality refinement,
//! high-order nodes and output assembly.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use crate::constrain;
use crate::exchange::{Behavior, MeshData, Statistics};
use crate::geometry;
use crate::insert;
use crate::intersect;
use crate::mesh::arena::Key;
use crate::mesh::element::{PointId, ShellKind, TetId, VertexKind};
use crate::mesh::handle::TriFace;
use crate::mesh::Mesh;
use crate::quality;
use crate::surface;

/// Tetrahedralizes the input: a Delaunay tetrahedralization of the point
/// set, a constrained tetrahedralization of a PLC (`behavior.plc`), or a
/// quality mesh (`behavior.quality`), per the behavior switches.
pub fn tetrahedralize(behavior: &Behavior, input: &MeshData) -> Result<MeshData> {
    tetrahedralize_with_stats(behavior, input).map(|(out, _)| out)
}

/// Like [`tetrahedralize`], also returning run statistics.
pub fn tetrahedralize_with_stats(
    behavior: &Behavior,
    input: &MeshData,
) -> Result<(MeshData, Statistics)> {
    let mut stats = Statistics {
        input_points: input.num_points(),
        ..Default::default()
    };
    let mut mesh = Mesh::new();
    let ids = transfer_nodes(&mut mesh, input)?;

    if behavior.refine && input.num_tetrahedra() > 0 {
        reconstruct_mesh(&mut mesh, input, &ids)?;
        stats.inserted_points = ids.len();
    } else {
        stats.inserted_points = insert::build_delaunay(&mut mesh, &ids)?;
        stats.duplicate_points = ids.len() - stats.inserted_points;
    }

    let mut radii = constrain::ProtectRadii::new();
    if behavior.plc {
        surface::mesh_surface(&mut mesh, input, &ids)?;
        if behavior.detect_inter {
            intersect::detect_intersecting_facets(&mesh)?;
        }
        if !behavior.no_merge {
            let merged = surface::merge_facets(&mut mesh, behavior.epsilon);
            if merged > 0 {
                log::debug!("merged {merged} coplanar facet pairs");
            }
        }
        surface::mark_facet_vertices(&mut mesh);
        radii = constrain::mark_acute_vertices(&mut mesh);
        constrain::mark_sharp_segments(&mut mesh);
        if behavior.no_bisect {
            log::debug!("segment bisection disabled; missing segments stay unrecovered");
        } else {
            stats.steiner_points +=
                constrain::delaunize_segments(&mut mesh, &radii, behavior.epsilon)?;
        }
        stats.steiner_points += constrain::constrained_facets(&mut mesh, behavior.epsilon)?;
        constrain::carve_holes(&mut mesh, &input.holes)?;
        constrain::assign_regions(
            &mut mesh,
            &input.regions,
            behavior.region_attrib,
            behavior.var_volume,
        )?;
    }

    if behavior.quality
        || behavior.fixed_volume
        || (behavior.var_volume && !input.regions.is_empty())
    {
        let outcome = quality::enforce_quality(&mut mesh, behavior, &radii);
        stats.steiner_points += outcome.steiner;
        stats.non_convergent = outcome.non_convergent;
    }
    if behavior.remove_sliver && behavior.max_dihedral > 0.0 {
        stats.irreparable_slivers = quality::remove_slivers(&mut mesh, behavior.max_dihedral);
    }

    if behavior.order == 2 {
        make_high_order_nodes(&mut mesh);
    }

    mesh.check_mesh().context("topology self-check failed")?;
    if mesh.shells.len() > 1 {
        mesh.check_shells()
            .context("boundary self-check failed")?;
    }

    stats.out_tetrahedra = mesh.num_tets();
    stats.hull_faces = mesh.hull_size();
    stats.flip23 = mesh.flip23s;
    stats.flip32 = mesh.flip32s;
    stats.flip22 = mesh.flip22s;
    stats.flip44 = mesh.flip44s;
    if !behavior.quiet {
        log::info!(
            "meshed {} points into {} tetrahedra ({} hull faces, {} Steiner points)",
            mesh.num_points(),
            stats.out_tetrahedra,
            stats.hull_faces,
            stats.steiner_points
        );
    }

    let out = build_output(&mesh, behavior, input);
    Ok((out, stats))
}

/// Creates mesh points from the input arrays and sets the bounding box.
fn transfer_nodes(mesh: &mut Mesh, input: &MeshData) -> Result<Vec<PointId>> {
    let n = input.num_points();
    if n == 0 {
        bail!("input contains no points");
    }
    if input.points.len() % 3 != 0 {
        bail!("point coordinate array length is not a multiple of three");
    }
    let mut ids = Vec::with_capacity(n);
    let (mut lo, mut hi) = ([f64::INFINITY; 3], [f64::NEG_INFINITY; 3]);
    for i in 0..n {
        let coords = input.point(i);
        for k in 0..3 {
            lo[k] = lo[k].min(coords[k]);
            hi[k] = hi[k].max(coords[k]);
        }
        let p = mesh.make_point(coords, VertexKind::Input);
        if input.num_point_attrs > 0 {
            let start = i * input.num_point_attrs;
            mesh.point_mut(p).attrs =
                input.point_attrs[start..start + input.num_point_attrs].to_vec();
        }
        if let Some(&marker) = input.point_markers.get(i) {
            mesh.point_mut(p).marker = marker;
        }
        ids.push(p);
    }
    mesh.xmin = lo[0];
    mesh.ymin = lo[1];
    mesh.zmin = lo[2];
    mesh.xmax = hi[0];
    mesh.ymax = hi[1];
    mesh.zmax = hi[2];
    mesh.longest = geometry::distance(&lo, &hi);
    if mesh.longest == 0.0 {
        bail!("all input points are coincident");
    }
    Ok(ids)
}

/// Rebuilds a mesh from an input tetrahedron list (refine mode), bonding
/// neighbors by face matching and re-creating boundary elements.
fn reconstruct_mesh(mesh: &mut Mesh, input: &MeshData, ids: &[PointId]) -> Result<()> {
    let cpt = input.corners_per_tet.max(4);
    let base = input.first_number;
    let resolve = |idx: usize| -> Result<PointId> {
        idx.checked_sub(base)
            .and_then(|i| ids.get(i).copied())
            .with_context(|| format!("tetrahedron corner index {idx} out of range"))
    };
    let mut tets = Vec::new();
    for (ti, chunk) in input.tetrahedra.chunks(cpt).enumerate() {
        if chunk.len() < 4 {
            bail!("tetrahedron {ti} has fewer than four corners");
        }
        let a = resolve(chunk[0])?;
        let b = resolve(chunk[1])?;
        let c = resolve(chunk[2])?;
        let d = resolve(chunk[3])?;
        let t = mesh.make_tet(a, b, c, d);
        if input.num_tet_attrs > 0 {
            let start = ti * input.num_tet_attrs;
            mesh.tet_mut(t).attrs = input.tet_attrs[start..start + input.num_tet_attrs].to_vec();
        }
        if let Some(&v) = input.tet_volumes.get(ti) {
            if v > 0.0 {
                mesh.tet_mut(t).volume_bound = Some(v);
            }
        }
        tets.push(t);
    }
    // Bond faces by sorted-triple matching.
    let mut open: HashMap<[PointId; 3], TriFace> = HashMap::new();
    for &t in &tets {
        for face in 0..4u8 {
            let h = TriFace::new(t, face, 0);
            let mut key = mesh.face_verts(h);
            key.sort();
            if let Some(other) = open.remove(&key) {
                mesh.bond(h, other);
            } else {
                open.insert(key, h);
            }
        }
    }
    let hull: Vec<TriFace> = open.into_values().collect();
    for h in hull {
        mesh.dissolve(h);
    }
    // Boundary triangles and edges from the input arrays.
    for (fi, chunk) in input.tri_faces.chunks(3).enumerate() {
        if chunk.len() < 3 {
            break;
        }
        let verts = [resolve(chunk[0])?, resolve(chunk[1])?, resolve(chunk[2])?];
        let marker = input.tri_face_markers.get(fi).copied().unwrap_or(0);
        let s = mesh.make_subface(verts, marker);
        insert::bond_subface_both_sides(mesh, s);
    }
    for (ei, chunk) in input.edges.chunks(2).enumerate() {
        if chunk.len() < 2 {
            break;
        }
        let marker = input.edge_markers.get(ei).copied().unwrap_or(0);
        mesh.make_subsegment(resolve(chunk[0])?, resolve(chunk[1])?, marker);
    }
    if mesh.shells.len() > 1 {
        mesh.check_subfaces = true;
        surface::unify_segments(mesh);
    }
    if let Some(&t) = tets.first() {
        mesh.recent = TriFace::new(t, 0, 0);
    }
    Ok(())
}

/// Creates one mid-edge node per edge for second-order output, shared
/// between tetrahedra via an edge map.
fn make_high_order_nodes(mesh: &mut Mesh) {
    let mut mid: HashMap<(PointId, PointId), PointId> = HashMap::new();
    let tets = mesh.tet_ids();
    for t in tets {
        let [a, b, c, d] = mesh.tet(t).corners;
        let edges = [(a, b), (b, c), (c, a), (a, d), (b, d), (c, d)];
        let mut nodes = [Key::NONE; 6];
        for (k, (x, y)) in edges.into_iter().enumerate() {
            let key = (x.min(y), x.max(y));
            let p = match mid.get(&key) {
                Some(&p) => p,
                None => {
                    let coords = geometry::midpoint(&mesh.pos(x), &mesh.pos(y));
                    let p = mesh.make_point(coords, VertexKind::FreeVolume);
                    mid.insert(key, p);
                    p
                }
            };
            nodes[k] = p;
        }
        mesh.tet_mut(t).high_order = Some(nodes);
    }
}

/// Assembles the output exchange structure.
fn build_output(mesh: &Mesh, behavior: &Behavior, input: &MeshData) -> MeshData {
    let base = input.first_number;
    let mut out = MeshData {
        first_number: base,
        num_point_attrs: input.num_point_attrs,
        ..Default::default()
    };

    // Points, in arena order.
    let mut point_index: HashMap<PointId, usize> = HashMap::new();
    for (p, point) in mesh.points.iter() {
        if point.kind == VertexKind::Dead {
            continue;
        }
        point_index.insert(p, base + out.points.len() / 3);
        out.points.extend(point.coords);
        out.point_markers.push(point.marker);
        if input.num_point_attrs > 0 {
            let mut attrs = point.attrs.clone();
            attrs.resize(input.num_point_attrs, 0.0);
            out.point_attrs.extend(attrs);
        }
    }

    // Tetrahedra, in arena order.
    let high_order = behavior.order == 2;
    out.corners_per_tet = if high_order { 10 } else { 4 };
    let tet_ids = mesh.tet_ids();
    let mut tet_index: HashMap<TetId, usize> = HashMap::new();
    for (i, &t) in tet_ids.iter().enumerate() {
        tet_index.insert(t, base + i);
    }
    out.num_tet_attrs = if behavior.region_attrib { 1 } else { 0 };
    for &t in &tet_ids {
        let tet = mesh.tet(t);
        for c in tet.corners {
            out.tetrahedra.push(point_index[&c]);
        }
        if high_order {
            if let Some(nodes) = tet.high_order {
                for p in nodes {
                    out.tetrahedra.push(point_index[&p]);
                }
            }
        }
        if behavior.region_attrib {
            out.tet_attrs.push(tet.attrs.first().copied().unwrap_or(0.0));
        }
        if behavior.neighbors_out {
            for face in 0..4u8 {
                let nb = mesh.sym(TriFace::new(t, face, 0));
                out.neighbors.push(if mesh.is_outer(nb) {
                    -1
                } else {
                    tet_index[&nb.tet] as i64
                });
            }
        }
    }

    // Boundary triangles: subfaces when the PLC was recovered, hull faces
    // otherwise.
    let subfaces = mesh.shell_ids(ShellKind::Subface);
    if !subfaces.is_empty() {
        for s in subfaces {
            let sh = mesh.shell(s);
            for v in sh.verts {
                out.tri_faces.push(point_index[&v]);
            }
            out.tri_face_markers.push(sh.marker);
        }
    } else if behavior.faces_out {
        for &t in &tet_ids {
            for face in 0..4u8 {
                let h = TriFace::new(t, face, 0);
                if mesh.is_outer(mesh.sym(h)) {
                    for v in mesh.face_verts(h) {
                        out.tri_faces.push(point_index[&v]);
                    }
                    out.tri_face_markers.push(1);
                }
            }
        }
    }

    // Boundary edges from subsegments.
    for s in mesh.shell_ids(ShellKind::Subsegment) {
        let sh = mesh.shell(s);
        out.edges.push(point_index[&sh.verts[0]]);
        out.edges.push(point_index[&sh.verts[1]]);
        out.edge_markers.push(sh.marker);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_input() -> MeshData {
        let mut data = MeshData::new();
        data.points = vec![
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0,
        ];
        data
    }

    fn cube_plc() -> MeshData {
        let mut data = cube_input();
        // The six square facets of the unit cube.
        for quad in [
            [0, 3, 2, 1], // bottom
            [4, 5, 6, 7], // top
            [0, 1, 5, 4],
            [1, 2, 6, 5],
            [2, 3, 7, 6],
            [3, 0, 4, 7],
        ] {
            data.push_polygon_facet(quad.to_vec(), 0);
        }
        data
    }

    fn total_volume(out: &MeshData) -> f64 {
        let mut volume = 0.0;
        for chunk in out.tetrahedra.chunks(out.corners_per_tet) {
            let p: Vec<[f64; 3]> = chunk[..4]
                .iter()
                .map(|&i| out.point(i - out.first_number))
                .collect();
            volume += crate::geometry::tet_volume(&p[0], &p[1], &p[2], &p[3]).abs();
        }
        volume
    }

    #[test]
    fn unit_cube_point_set() {
        let data = cube_input();
        let (out, stats) = tetrahedralize_with_stats(&Behavior::default(), &data).unwrap();
        assert!(out.num_tetrahedra() == 5 || out.num_tetrahedra() == 6);
        assert_eq!(stats.inserted_points, 8);
        assert_eq!(stats.duplicate_points, 0);
        assert!((total_volume(&out) - 1.0).abs() < 1e-12);
        assert_eq!(stats.hull_faces, 12);
    }

    #[test]
    fn unit_cube_plc_conforms() {
        let behavior = Behavior {
            plc: true,
            ..Default::default()
        };
        let data = cube_plc();
        let out = tetrahedralize(&behavior, &data).unwrap();
        assert!((total_volume(&out) - 1.0).abs() < 1e-12);
        // Two boundary triangles per facet.
        assert_eq!(out.tri_faces.len() / 3, 12);
        // Twelve protected cube edges; facet diagonals carry no segment.
        assert_eq!(out.edges.len() / 2, 12);
        // Every input edge of every facet polygon is present among the
        // output boundary edges.
        for quad in [
            [0usize, 3, 2, 1],
            [4, 5, 6, 7],
            [0, 1, 5, 4],
            [1, 2, 6, 5],
            [2, 3, 7, 6],
            [3, 0, 4, 7],
        ] {
            for k in 0..4 {
                let (u, v) = (quad[k], quad[(k + 1) % 4]);
                let found = out.edges.chunks(2).any(|e| {
                    (e[0] == u && e[1] == v) || (e[0] == v && e[1] == u)
                });
                assert!(found, "input edge ({u}, {v}) missing from the output");
            }
        }
    }

    #[test]
    fn quality_refinement_respects_the_bound() {
        let behavior = Behavior {
            plc: true,
            quality: true,
            ..Default::default()
        };
        let data = cube_plc();
        let (out, stats) = tetrahedralize_with_stats(&behavior, &data).unwrap();
        assert!((total_volume(&out) - 1.0).abs() < 1e-9);
        if !stats.non_convergent {
            for chunk in out.tetrahedra.chunks(out.corners_per_tet) {
                let p: Vec<[f64; 3]> = chunk[..4]
                    .iter()
                    .map(|&i| out.point(i))
                    .collect();
                let ratio = crate::geometry::radius_edge_ratio(&p[0], &p[1], &p[2], &p[3]);
                assert!(
                    ratio <= behavior.min_ratio + 1e-9,
                    "output ratio {ratio} above the bound"
                );
            }
        }
    }

    #[test]
    fn second_order_output_carries_midedge_nodes() {
        let behavior = Behavior {
            order: 2,
            ..Default::default()
        };
        let data = cube_input();
        let out = tetrahedralize(&behavior, &data).unwrap();
        assert_eq!(out.corners_per_tet, 10);
        assert_eq!(out.tetrahedra.len() % 10, 0);
        // Mid-edge nodes were added to the point list.
        assert!(out.num_points() > 8);
    }

    #[test]
    fn neighbor_output_is_symmetric() {
        let behavior = Behavior {
            neighbors_out: true,
            ..Default::default()
        };
        let data = cube_input();
        let out = tetrahedralize(&behavior, &data).unwrap();
        let n = out.num_tetrahedra();
        assert_eq!(out.neighbors.len(), 4 * n);
        for (ti, nbs) in out.neighbors.chunks(4).enumerate() {
            for &nb in nbs {
                if nb < 0 {
                    continue;
                }
                let back = &out.neighbors[(nb as usize) * 4..(nb as usize) * 4 + 4];
                assert!(back.contains(&(ti as i64)));
            }
        }
    }

    #[test]
    fn refine_mode_rebuilds_and_refines() {
        let data = cube_input();
        let first = tetrahedralize(&Behavior::default(), &data).unwrap();

        let mut again = cube_input();
        again.tetrahedra = first.tetrahedra.clone();
        again.corners_per_tet = first.corners_per_tet;
        let behavior = Behavior {
            refine: true,
            quality: true,
            fixed_volume: true,
            max_volume: 0.1,
            ..Default::default()
        };
        let (out, stats) = tetrahedralize_with_stats(&behavior, &again).unwrap();
        assert!(out.num_tetrahedra() > first.num_tetrahedra());
        assert!(stats.steiner_points > 0);
        assert!((total_volume(&out) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn one_based_indexing_round_trips() {
        let mut data = cube_input();
        data.first_number = 1;
        let out = tetrahedralize(&Behavior::default(), &data).unwrap();
        assert_eq!(out.first_number, 1);
        assert!(out.tetrahedra.iter().all(|&i| i >= 1));
        assert!((total_volume(&out) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn transfer_nodes_sets_bounds() {
        let mut data = MeshData::new();
        data.points = vec![0.0, 0.0, 0.0, 1.0, 2.0, 2.0];
        let mut mesh = Mesh::new();
        let ids = transfer_nodes(&mut mesh, &data).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(mesh.xmax, 1.0);
        assert_eq!(mesh.ymax, 2.0);
        assert_eq!(mesh.longest, 3.0);
    }

    #[test]
    fn transfer_rejects_empty_input() {
        let data = MeshData::new();
        let mut mesh = Mesh::new();
        assert!(transfer_nodes(&mut mesh, &data).is_err());
    }
}
