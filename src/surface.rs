//! Facet surface meshing: a Delaunay triangulation of every input facet in
//! its own lifted plane, polygon-edge recovery, hole carving, segment
//! unification and coplanar-facet merging.
//!
//! The triangulations are built from boundary elements directly; tetrahedron
//! bonds are established later by constrained recovery. In-plane predicates
//! lift every query through a synthetic point above the facet, so the 3D
//! kernel answers all 2D questions.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};

use crate::exchange::MeshData;
use crate::geometry;
use crate::insert::{replace_in_ring, split_subface};
use crate::mesh::element::{PointId, ShellId, ShellKind};
use crate::mesh::handle::SubHandle;
use crate::mesh::Mesh;
use crate::predicates;

/// Synthetic id for the lift point in symbolic perturbations; larger than any
/// real point id so ties resolve the same way for a whole facet.
const LIFT_ID: u32 = u32::MAX;

/// Where a 2D walk landed.
enum LocateSub {
    OnFace(SubHandle),
    OnEdge(SubHandle),
    OnVertex(SubHandle),
    Outside,
}

/// Triangulates one facet and records its boundary into the mesh.
pub(crate) struct FacetMesher<'m> {
    mesh: &'m mut Mesh,
    /// Lift point above the facet plane.
    above: [f64; 3],
    marker: i32,
    /// Working set: the subfaces of this facet.
    subs: Vec<ShellId>,
    recent: SubHandle,
}

impl<'m> FacetMesher<'m> {
    pub fn new(mesh: &'m mut Mesh, marker: i32, verts: &[PointId]) -> Result<Self> {
        let above = lift_point(mesh, verts)
            .context("facet is degenerate: vertices span no plane")?;
        Ok(Self {
            mesh,
            above,
            marker,
            subs: Vec::new(),
            recent: SubHandle::NONE,
        })
    }

    /// Counterclockwise test in the facet plane, as seen from the lift point.
    fn ccw(&self, a: PointId, b: PointId, c: PointId) -> f64 {
        -predicates::orient3d(
            &self.mesh.pos(a),
            &self.mesh.pos(b),
            &self.mesh.pos(c),
            &self.above,
        )
    }

    fn ccw_sign(&self, a: PointId, b: PointId, c: PointId) -> i8 {
        -predicates::orient3d_sos(
            [
                self.mesh.pos(a),
                self.mesh.pos(b),
                self.mesh.pos(c),
                self.above,
            ],
            [a.id(), b.id(), c.id(), LIFT_ID],
        )
    }

    /// Positive if `p` lies inside the circumcircle of the counterclockwise
    /// triangle (a, b, c), via the lifted sphere through the lift point.
    fn in_circle_sign(&self, a: PointId, b: PointId, c: PointId, p: PointId) -> i8 {
        predicates::insphere_sos(
            [
                self.mesh.pos(b),
                self.mesh.pos(a),
                self.mesh.pos(c),
                self.above,
                self.mesh.pos(p),
            ],
            [b.id(), a.id(), c.id(), LIFT_ID, p.id()],
        )
    }

    /// Makes a counterclockwise subface over the triple.
    fn make_tri(&mut self, a: PointId, b: PointId, c: PointId) -> ShellId {
        let (a, b) = if self.ccw_sign(a, b, c) > 0 {
            (a, b)
        } else {
            (b, a)
        };
        let s = self.mesh.make_subface([a, b, c], self.marker);
        self.subs.push(s);
        s
    }

    /// Triangulates the facet's vertex set into a 2D Delaunay triangulation.
    pub fn triangulate(&mut self, verts: &[PointId]) -> Result<()> {
        if verts.len() < 3 {
            return Ok(());
        }
        let mut pending: Vec<PointId> = verts.to_vec();
        pending.reverse();

        // First triangle: two distinct points plus the one spanning the
        // largest area.
        let v0 = pending.pop().unwrap();
        let v1 = loop {
            let Some(q) = pending.pop() else {
                bail!("facet vertices are all coincident");
            };
            if self.mesh.pos(q) != self.mesh.pos(v0) {
                break q;
            }
        };
        let mut best = None;
        let mut best_area = 0.0f64;
        for (i, &q) in pending.iter().enumerate() {
            let area =
                geometry::tri_area(&self.mesh.pos(v0), &self.mesh.pos(v1), &self.mesh.pos(q));
            if area > best_area {
                best_area = area;
                best = Some(i);
            }
        }
        let Some(i2) = best else {
            bail!("facet vertices are collinear");
        };
        let v2 = pending.remove(i2);
        let first = self.make_tri(v0, v1, v2);
        self.recent = SubHandle::new(first, 0);

        while let Some(p) = pending.pop() {
            self.insert_vertex(p)?;
        }
        Ok(())
    }

    /// Walks toward `p` across edges; falls back to scanning the facet.
    fn locate_sub(&self, p: PointId) -> LocateSub {
        let mut cur = if !self.recent.is_none() && self.mesh.shells.contains(self.recent.shell) {
            self.recent.shell
        } else {
            match self.subs.iter().find(|s| self.mesh.shells.contains(**s)) {
                Some(&s) => s,
                None => return LocateSub::Outside,
            }
        };
        let bound = 2 * self.subs.len() + 16;
        'walk: for _ in 0..bound {
            let [a, b, c] = self.mesh.shell(cur).verts;
            // Coincident vertex?
            for (v, ver) in [(a, 0u8), (b, 2), (c, 4)] {
                if self.mesh.pos(v) == self.mesh.pos(p) {
                    return LocateSub::OnVertex(SubHandle::new(cur, ver));
                }
            }
            let mut zero_edge = None;
            for (x, y, ver) in [(a, b, 0u8), (b, c, 2), (c, a, 4)] {
                let side = self.ccw(x, y, p);
                if side < 0.0 {
                    let next = self.mesh.spivot(SubHandle::new(cur, ver));
                    if self.mesh.is_vacuous(next) {
                        return LocateSub::Outside;
                    }
                    cur = next.shell;
                    continue 'walk;
                }
                if side == 0.0 {
                    zero_edge = Some((x, y, ver));
                }
            }
            return match zero_edge {
                Some((x, y, _)) => {
                    let mut h = SubHandle::new(cur, 0);
                    if !self.mesh.sub_find_edge(&mut h, x, y) {
                        return LocateSub::Outside;
                    }
                    // On the supporting line; between the endpoints it is on
                    // the edge, outside them it coincides with the hull.
                    LocateSub::OnEdge(h)
                }
                None => LocateSub::OnFace(SubHandle::new(cur, 0)),
            };
        }
        LocateSub::Outside
    }

    fn insert_vertex(&mut self, p: PointId) -> Result<()> {
        let mut queue: Vec<SubHandle> = Vec::new();
        match self.locate_sub(p) {
            LocateSub::OnVertex(_) => return Ok(()),
            LocateSub::OnFace(h) => {
                let children = split_subface(self.mesh, h, p);
                self.retire(h.shell);
                for child in children {
                    self.subs.push(child);
                    for ver in [0u8, 2, 4] {
                        queue.push(SubHandle::new(child, ver));
                    }
                }
                self.recent = SubHandle::new(children[0], 0);
            }
            LocateSub::OnEdge(h) => {
                let created = self.split_sub_edge(h, p);
                for child in created {
                    for ver in [0u8, 2, 4] {
                        queue.push(SubHandle::new(child, ver));
                    }
                }
            }
            LocateSub::Outside => {
                let created = self.insert_outside(p)?;
                for child in created {
                    for ver in [0u8, 2, 4] {
                        queue.push(SubHandle::new(child, ver));
                    }
                }
            }
        }
        self.flip_sub(&mut queue);
        Ok(())
    }

    fn retire(&mut self, s: ShellId) {
        self.subs.retain(|&q| q != s);
    }

    /// Splits the edge of `h` at `p`: each adjoining subface becomes two.
    fn split_sub_edge(&mut self, h: SubHandle, p: PointId) -> Vec<ShellId> {
        let a = self.mesh.sorg(h);
        let b = self.mesh.sdest(h);
        let neighbor = self.mesh.spivot(h);
        let mut created = Vec::new();

        let mut halves_a = Vec::new();
        let mut halves_b = Vec::new();
        let sides: Vec<SubHandle> = if self.mesh.is_vacuous(neighbor) {
            vec![h]
        } else {
            vec![h, neighbor]
        };
        for mut s in sides {
            if !self.mesh.sub_find_edge(&mut s, a, b) {
                continue;
            }
            let w = self.mesh.sapex(s);
            let marker = self.mesh.shell(s.shell).marker;
            let child_a = self.mesh.make_subface([a, p, w], marker);
            let child_b = self.mesh.make_subface([p, b, w], marker);
            for (old_x, old_y, child) in [(b, w, child_b), (w, a, child_a)] {
                let mut oh = s;
                if self.mesh.sub_find_edge(&mut oh, old_x, old_y) {
                    let seg = self.mesh.shell(s.shell).segs[oh.edge()];
                    let mut ch = SubHandle::new(child, 0);
                    let ok = self.mesh.sub_find_edge(&mut ch, old_x, old_y);
                    debug_assert!(ok);
                    if !self.mesh.is_vacuous(self.mesh.spivot(oh)) {
                        replace_in_ring(self.mesh, oh, ch);
                    }
                    if !seg.is_none() {
                        self.mesh.ssbond(ch, seg);
                    }
                }
            }
            let mut ha = SubHandle::new(child_a, 0);
            let mut hb = SubHandle::new(child_b, 0);
            let ok = self.mesh.sub_find_edge(&mut ha, p, w)
                && self.mesh.sub_find_edge(&mut hb, w, p);
            debug_assert!(ok);
            self.mesh.sbond(ha, hb);
            self.retire(s.shell);
            self.mesh.kill_shell(s.shell);
            self.subs.extend([child_a, child_b]);
            created.extend([child_a, child_b]);
            halves_a.push(child_a);
            halves_b.push(child_b);
        }
        // Pair the half edges across the old edge.
        for (members, (x, y)) in [(halves_a, (a, p)), (halves_b, (p, b))] {
            if members.len() == 2 {
                let mut h0 = SubHandle::new(members[0], 0);
                let mut h1 = SubHandle::new(members[1], 0);
                let ok = self.mesh.sub_find_edge(&mut h0, x, y)
                    && self.mesh.sub_find_edge(&mut h1, x, y);
                debug_assert!(ok);
                self.mesh.sbond(h0, h1);
            }
        }
        if let Some(&s) = created.first() {
            self.recent = SubHandle::new(s, 0);
        }
        created
    }

    /// Fans `p` (outside the 2D hull) onto every visible hull edge.
    fn insert_outside(&mut self, p: PointId) -> Result<Vec<ShellId>> {
        // Visible hull edges: unbonded edges with p strictly on their outer
        // side.
        let mut visible: Vec<(PointId, PointId, SubHandle)> = Vec::new();
        for &s in &self.subs {
            if !self.mesh.shells.contains(s) {
                continue;
            }
            for ver in [0u8, 2, 4] {
                let h = SubHandle::new(s, ver);
                if !self.mesh.is_vacuous(self.mesh.spivot(h)) {
                    continue;
                }
                let (u, v) = (self.mesh.sorg(h), self.mesh.sdest(h));
                // Strict visibility: collinear hull edges are left alone so
                // no degenerate triangle enters the fan.
                if self.ccw(u, v, p) < 0.0 {
                    visible.push((u, v, h));
                }
            }
        }
        if visible.is_empty() {
            bail!("point outside the facet hull sees no hull edge");
        }
        let mut created = Vec::new();
        let mut open: HashMap<(PointId, PointId), SubHandle> = HashMap::new();
        for (u, v, hull_edge) in visible {
            let tri = self.make_tri(v, u, p);
            created.push(tri);
            let mut base = SubHandle::new(tri, 0);
            let ok = self.mesh.sub_find_edge(&mut base, v, u);
            debug_assert!(ok);
            self.mesh.sbond(base, hull_edge);
            // Side edges pair with neighboring fan triangles.
            for (x, y) in [(u, p), (p, v)] {
                let mut side = SubHandle::new(tri, 0);
                let ok = self.mesh.sub_find_edge(&mut side, x, y);
                debug_assert!(ok);
                let key = (x.min(y), x.max(y));
                if let Some(other) = open.remove(&key) {
                    self.mesh.sbond(side, other);
                } else {
                    open.insert(key, side);
                }
            }
        }
        if let Some(&s) = created.first() {
            self.recent = SubHandle::new(s, 0);
        }
        Ok(created)
    }

    /// Propagates 2-2 diagonal flips until every queued edge is locally
    /// Delaunay in the facet plane.
    fn flip_sub(&mut self, queue: &mut Vec<SubHandle>) {
        let mut guard = 0usize;
        while let Some(h) = queue.pop() {
            guard += 1;
            if guard > 100_000 {
                panic!("internal error: facet flip propagation does not terminate");
            }
            if !self.mesh.shells.contains(h.shell) {
                continue;
            }
            let next = self.mesh.spivot(h);
            if self.mesh.is_vacuous(next) || !self.mesh.shells.contains(next.shell) {
                continue;
            }
            if !self.mesh.is_vacuous(self.mesh.sspivot(h)) {
                continue; // constrained edge
            }
            let (u, v) = (self.mesh.sorg(h), self.mesh.sdest(h));
            let w1 = self.mesh.sapex(h);
            let mut other = next;
            if !self.mesh.sub_find_edge(&mut other, v, u) {
                continue;
            }
            let w2 = self.mesh.sapex(other);
            if self.in_circle_sign(u, v, w1, w2) <= 0 {
                continue;
            }
            // The swap needs the quad (u, w2, v, w1) convex at u and v.
            if self.ccw_sign(w1, u, w2) <= 0 || self.ccw_sign(w2, v, w1) <= 0 {
                continue;
            }
            let created = self.do_flip_sub(h, other, u, v, w1, w2);
            for child in created {
                for ver in [0u8, 2, 4] {
                    queue.push(SubHandle::new(child, ver));
                }
            }
        }
    }

    /// Swaps the diagonal (u, v) for (w1, w2).
    fn do_flip_sub(
        &mut self,
        h: SubHandle,
        other: SubHandle,
        u: PointId,
        v: PointId,
        w1: PointId,
        w2: PointId,
    ) -> [ShellId; 2] {
        let t1 = h.shell;
        let t2 = other.shell;
        // Capture the four outer edge contexts.
        let mut contexts = Vec::with_capacity(4);
        for (shell, x, y) in [(t1, v, w1), (t1, w1, u), (t2, u, w2), (t2, w2, v)] {
            let mut oh = SubHandle::new(shell, 0);
            let ok = self.mesh.sub_find_edge(&mut oh, x, y);
            debug_assert!(ok);
            let ring = self.mesh.spivot(oh);
            let seg = self.mesh.shell(shell).segs[oh.edge()];
            contexts.push((x, y, oh, ring, seg));
        }
        let marker = self.mesh.shell(t1).marker;
        let n1 = self.mesh.make_subface([u, w2, w1], marker);
        let n2 = self.mesh.make_subface([v, w1, w2], marker);
        for (x, y, oh, ring, seg) in contexts {
            let owner = if (x == v && y == w1) || (x == w1 && y == u) {
                // edges of the old t1: (v, w1) goes to n2, (w1, u) to n1
                if x == v {
                    n2
                } else {
                    n1
                }
            } else if x == u {
                n1 // (u, w2)
            } else {
                n2 // (w2, v)
            };
            let mut ch = SubHandle::new(owner, 0);
            let ok = self.mesh.sub_find_edge(&mut ch, x, y);
            debug_assert!(ok);
            if !self.mesh.is_vacuous(ring) {
                replace_in_ring(self.mesh, oh, ch);
            }
            if !seg.is_none() {
                self.mesh.ssbond(ch, seg);
            }
        }
        // New diagonal.
        let mut d1 = SubHandle::new(n1, 0);
        let mut d2 = SubHandle::new(n2, 0);
        let ok = self.mesh.sub_find_edge(&mut d1, w2, w1)
            && self.mesh.sub_find_edge(&mut d2, w1, w2);
        debug_assert!(ok);
        self.mesh.sbond(d1, d2);
        self.retire(t1);
        self.retire(t2);
        self.mesh.kill_shell(t1);
        self.mesh.kill_shell(t2);
        self.subs.extend([n1, n2]);
        self.recent = SubHandle::new(n1, 0);
        [n1, n2]
    }

    /// Ensures the polygon edge (u, v) exists in the triangulation and is
    /// protected by a subsegment, flipping crossing edges out of the way.
    pub fn insert_segment(&mut self, u: PointId, v: PointId) -> Result<()> {
        let mut guard = 0usize;
        loop {
            if let Some(h) = self.find_sub_edge(u, v) {
                self.protect_edge(h);
                return Ok(());
            }
            guard += 1;
            if guard > 10_000 {
                bail!("could not recover facet edge; facet may be self-intersecting");
            }
            // Find an edge crossing the segment (u, v) and swap it away.
            let Some(cross) = self.find_crossing_edge(u, v) else {
                bail!("missing facet edge has no crossing edge to flip");
            };
            let next = self.mesh.spivot(cross);
            if self.mesh.is_vacuous(next) {
                bail!("facet edge crosses the facet hull");
            }
            if !self.mesh.is_vacuous(self.mesh.sspivot(cross)) {
                bail!("two facet edges cross each other");
            }
            let (x, y) = (self.mesh.sorg(cross), self.mesh.sdest(cross));
            let w1 = self.mesh.sapex(cross);
            let mut other = next;
            if !self.mesh.sub_find_edge(&mut other, y, x) {
                bail!("broken edge ring during segment recovery");
            }
            let w2 = self.mesh.sapex(other);
            // Swap only convex quads; otherwise try a different crossing
            // edge next round (the fixup reorders naturally as flips occur).
            if self.ccw_sign(w1, x, w2) > 0 && self.ccw_sign(w2, y, w1) > 0 {
                let created = self.do_flip_sub(cross, other, x, y, w1, w2);
                // Delaunay-hood is restored only after the goal edge is
                // protected, so intermediate flips cannot be undone.
                if let Some(h) = self.find_sub_edge(u, v) {
                    self.protect_edge(h);
                    let mut queue = Vec::new();
                    for child in created {
                        for ver in [0u8, 2, 4] {
                            queue.push(SubHandle::new(child, ver));
                        }
                    }
                    self.flip_sub(&mut queue);
                    return Ok(());
                }
            } else {
                // Nonconvex: flip another crossing edge first; find it by
                // walking from the far side.
                let Some(alt) = self.find_crossing_edge(v, u) else {
                    bail!("segment recovery is stuck on a nonconvex crossing");
                };
                if alt.shell == cross.shell {
                    bail!("segment recovery cannot proceed; degenerate facet input");
                }
                continue;
            }
        }
    }

    /// A subface handle on edge (u, v), if the triangulation has one.
    fn find_sub_edge(&self, u: PointId, v: PointId) -> Option<SubHandle> {
        for &s in &self.subs {
            if !self.mesh.shells.contains(s) {
                continue;
            }
            let mut h = SubHandle::new(s, 0);
            if self.mesh.sub_find_edge(&mut h, u, v) {
                return Some(h);
            }
        }
        None
    }

    /// Creates (or reuses) the subsegment protecting the edge of `h` and
    /// bonds it on both sides.
    fn protect_edge(&mut self, h: SubHandle) {
        let (u, v) = (self.mesh.sorg(h), self.mesh.sdest(h));
        let existing = self.mesh.sspivot(h);
        let seg = if self.mesh.is_vacuous(existing) {
            self.mesh.make_subsegment(u, v, self.marker)
        } else {
            existing.shell
        };
        self.mesh.ssbond(h, seg);
        let mut other = self.mesh.spivot(h);
        if !self.mesh.is_vacuous(other) && self.mesh.sub_find_edge(&mut other, u, v) {
            self.mesh.ssbond(other, seg);
        }
    }

    /// The first triangulation edge properly crossing segment (u, v),
    /// walking triangles around `u` toward `v`.
    fn find_crossing_edge(&self, u: PointId, v: PointId) -> Option<SubHandle> {
        for &s in &self.subs {
            if !self.mesh.shells.contains(s) {
                continue;
            }
            let verts = self.mesh.shell(s).verts;
            if !verts.contains(&u) {
                continue;
            }
            // The edge opposite u in this triangle.
            let (x, y) = match verts.iter().position(|&q| q == u).unwrap() {
                0 => (verts[1], verts[2]),
                1 => (verts[2], verts[0]),
                _ => (verts[0], verts[1]),
            };
            if x == v || y == v {
                continue;
            }
            // (x, y) crosses (u, v) iff x and y straddle the segment line
            // and v lies beyond the edge (u is on the inside by the cycle
            // order).
            let sx = self.ccw_sign(u, v, x);
            let sy = self.ccw_sign(u, v, y);
            if sx < 0 && sy > 0 && self.ccw_sign(x, y, v) < 0 {
                let mut h = SubHandle::new(s, 0);
                if self.mesh.sub_find_edge(&mut h, x, y) {
                    return Some(h);
                }
            }
        }
        None
    }

    /// Removes the triangles outside the facet region: infection starts from
    /// unprotected hull edges and hole points and stops at subsegments.
    pub fn carve(&mut self, holes: &[[f64; 3]]) -> Result<()> {
        let mut infected: Vec<ShellId> = Vec::new();
        for &s in &self.subs {
            if !self.mesh.shells.contains(s) {
                continue;
            }
            for ver in [0u8, 2, 4] {
                let h = SubHandle::new(s, ver);
                if self.mesh.is_vacuous(self.mesh.spivot(h))
                    && self.mesh.is_vacuous(self.mesh.sspivot(h))
                    && !infected.contains(&s)
                {
                    infected.push(s);
                }
            }
        }
        for hole in holes {
            if let Some(s) = self.locate_point_sub(hole) {
                if !infected.contains(&s) {
                    infected.push(s);
                }
            }
        }
        // Spread across unprotected edges.
        let mut cursor = 0;
        while cursor < infected.len() {
            let s = infected[cursor];
            cursor += 1;
            for ver in [0u8, 2, 4] {
                let h = SubHandle::new(s, ver);
                if !self.mesh.is_vacuous(self.mesh.sspivot(h)) {
                    continue;
                }
                let next = self.mesh.spivot(h);
                if self.mesh.is_vacuous(next) || infected.contains(&next.shell) {
                    continue;
                }
                infected.push(next.shell);
            }
        }
        for s in &infected {
            self.retire(*s);
        }
        // Unhook the survivors, then delete.
        let survivors = self.subs.clone();
        for &s in &survivors {
            for ver in [0u8, 2, 4] {
                let h = SubHandle::new(s, ver);
                let link = self.mesh.spivot(h);
                if !self.mesh.is_vacuous(link) && infected.contains(&link.shell) {
                    self.mesh.sdissolve(h);
                }
            }
        }
        for s in infected {
            if self.mesh.shells.contains(s) {
                self.mesh.kill_shell(s);
            }
        }
        Ok(())
    }

    /// The subface containing the raw coordinate point, by scanning.
    fn locate_point_sub(&self, p: &[f64; 3]) -> Option<ShellId> {
        for &s in &self.subs {
            if !self.mesh.shells.contains(s) {
                continue;
            }
            let [a, b, c] = self.mesh.shell(s).verts;
            let mut inside = true;
            for (x, y) in [(a, b), (b, c), (c, a)] {
                let side = -predicates::orient3d(
                    &self.mesh.pos(x),
                    &self.mesh.pos(y),
                    p,
                    &self.above,
                );
                if side < 0.0 {
                    inside = false;
                    break;
                }
            }
            if inside {
                return Some(s);
            }
        }
        None
    }

    pub fn into_subs(self) -> Vec<ShellId> {
        self.subs
    }
}

/// A lift point above the plane spanned by the vertex set, via Newell's
/// normal. `None` when the vertices span no plane.
fn lift_point(mesh: &Mesh, verts: &[PointId]) -> Option<[f64; 3]> {
    if verts.len() < 3 {
        return None;
    }
    let mut normal = [0.0f64; 3];
    let mut centroid = [0.0f64; 3];
    for i in 0..verts.len() {
        let p = mesh.pos(verts[i]);
        let q = mesh.pos(verts[(i + 1) % verts.len()]);
        normal[0] += (p[1] - q[1]) * (p[2] + q[2]);
        normal[1] += (p[2] - q[2]) * (p[0] + q[0]);
        normal[2] += (p[0] - q[0]) * (p[1] + q[1]);
        for k in 0..3 {
            centroid[k] += p[k] / verts.len() as f64;
        }
    }
    let len = geometry::norm(&normal);
    if len == 0.0 {
        // Fall back to any non-collinear triple.
        let a = mesh.pos(verts[0]);
        for i in 1..verts.len() - 1 {
            let (n, l) = geometry::face_normal(&a, &mesh.pos(verts[i]), &mesh.pos(verts[i + 1]));
            if l > 0.0 {
                let scale = mesh.longest.max(1.0);
                return Some([
                    centroid[0] + n[0] / l * scale,
                    centroid[1] + n[1] / l * scale,
                    centroid[2] + n[2] / l * scale,
                ]);
            }
        }
        return None;
    }
    let scale = mesh.longest.max(1.0);
    Some([
        centroid[0] + normal[0] / len * scale,
        centroid[1] + normal[1] / len * scale,
        centroid[2] + normal[2] / len * scale,
    ])
}

/// Triangulates every facet of the input, recovers polygon edges, carves
/// facet holes. Returns the number of facets meshed.
pub(crate) fn mesh_surface(mesh: &mut Mesh, data: &MeshData, ids: &[PointId]) -> Result<usize> {
    let mut meshed = 0usize;
    let base = data.first_number;
    let resolve = |vi: usize| -> Option<PointId> {
        vi.checked_sub(base).and_then(|i| ids.get(i).copied())
    };
    for (fi, facet) in data.facets.iter().enumerate() {
        let marker = data
            .facet_markers
            .get(fi)
            .copied()
            .unwrap_or(fi as i32 + 1);
        // Gather the facet's vertices across its polygons.
        let mut verts: Vec<PointId> = Vec::new();
        for poly in &facet.polygons {
            for &vi in &poly.vertices {
                let p = resolve(vi)
                    .with_context(|| format!("facet {fi} references vertex {vi} out of range"))?;
                if !verts.contains(&p) {
                    verts.push(p);
                }
            }
        }
        // Pure segment facets (fewer than three vertices) still protect
        // their edges.
        if verts.len() < 3 {
            if verts.len() == 2 {
                segment_only(mesh, verts[0], verts[1], marker);
            }
            continue;
        }

        let mut fm = FacetMesher::new(mesh, marker, &verts)?;
        fm.triangulate(&verts)?;
        for poly in &facet.polygons {
            let n = poly.vertices.len();
            if n < 2 {
                continue;
            }
            for k in 0..n {
                if n == 2 && k == 1 {
                    break; // a 2-vertex polygon has one edge, not two
                }
                let u = resolve(poly.vertices[k]).unwrap();
                let v = resolve(poly.vertices[(k + 1) % n]).unwrap();
                if u != v {
                    fm.insert_segment(u, v)
                        .with_context(|| format!("recovering an edge of facet {fi}"))?;
                }
            }
        }
        fm.carve(&facet.holes)?;
        meshed += 1;
    }
    unify_segments(mesh);
    Ok(meshed)
}

/// Records a bare input segment that belongs to no triangulated facet.
fn segment_only(mesh: &mut Mesh, u: PointId, v: PointId, marker: i32) {
    mesh.make_subsegment(u, v, marker);
}

/// Merges duplicate subsegments produced by facets sharing an edge and links
/// each segment's subfaces into one face ring, ordered by rotation angle
/// around the segment (right-hand rule from the segment's stored direction).
pub(crate) fn unify_segments(mesh: &mut Mesh) {
    let mut by_edge: HashMap<(PointId, PointId), Vec<ShellId>> = HashMap::new();
    for s in mesh.shell_ids(ShellKind::Subsegment) {
        let v = mesh.shell(s).verts;
        let key = (v[0].min(v[1]), v[0].max(v[1]));
        by_edge.entry(key).or_default().push(s);
    }
    for ((a, b), group) in by_edge {
        let keep = group[0];
        for &dup in &group[1..] {
            mesh.kill_shell(dup);
        }
        // All subfaces on this edge, across facets.
        let mut members: Vec<ShellId> = Vec::new();
        for s in mesh.shell_ids(ShellKind::Subface) {
            let v = mesh.shell(s).verts;
            if v.contains(&a) && v.contains(&b) && !members.contains(&s) {
                members.push(s);
            }
        }
        if members.is_empty() {
            continue;
        }
        // Order by rotation angle around the segment axis.
        let pa = mesh.pos(a);
        let pb = mesh.pos(b);
        let axis = geometry::sub(&pb, &pa);
        let first_apex = {
            let v = mesh.shell(members[0]).verts;
            let w = v.iter().copied().find(|&q| q != a && q != b).unwrap();
            mesh.pos(w)
        };
        let ref0 = geometry::sub(&first_apex, &pa);
        let ref0 = orthogonalize(&ref0, &axis);
        let ref1 = geometry::cross(&axis, &ref0);
        members.sort_by(|&s1, &s2| {
            let angle = |s: ShellId| {
                let v = mesh.shell(s).verts;
                let w = v.iter().copied().find(|&q| q != a && q != b).unwrap();
                let d = orthogonalize(&geometry::sub(&mesh.pos(w), &pa), &axis);
                geometry::dot(&d, &ref1).atan2(geometry::dot(&d, &ref0))
            };
            angle(s1).partial_cmp(&angle(s2)).unwrap_or(std::cmp::Ordering::Equal)
        });
        // Link the cycle and bond every member to the kept segment.
        for i in 0..members.len() {
            let j = (i + 1) % members.len();
            let mut hi = SubHandle::new(members[i], 0);
            let mut hj = SubHandle::new(members[j], 0);
            if mesh.sub_find_edge(&mut hi, a, b) && mesh.sub_find_edge(&mut hj, a, b) {
                if members.len() == 1 {
                    mesh.sbond(hi, hi);
                } else {
                    mesh.sbond1(hi, hj);
                }
                mesh.ssbond(hi, keep);
            }
        }
    }
}

fn orthogonalize(v: &[f64; 3], axis: &[f64; 3]) -> [f64; 3] {
    let len2 = geometry::dot(axis, axis);
    if len2 == 0.0 {
        return *v;
    }
    let t = geometry::dot(v, axis) / len2;
    [v[0] - t * axis[0], v[1] - t * axis[1], v[2] - t * axis[2]]
}

/// Merges coplanar facets sharing a segment: when exactly two subfaces with
/// the same marker meet at a segment and are coplanar within `eps`, the
/// segment is dropped and the faces joined.
pub(crate) fn merge_facets(mesh: &mut Mesh, eps: f64) -> usize {
    let mut merged = 0usize;
    for seg in mesh.shell_ids(ShellKind::Subsegment) {
        if !mesh.shells.contains(seg) {
            continue;
        }
        let [a, b, _] = mesh.shell(seg).verts;
        let mut members: Vec<ShellId> = Vec::new();
        for s in mesh.shell_ids(ShellKind::Subface) {
            let v = mesh.shell(s).verts;
            if v.contains(&a) && v.contains(&b) {
                members.push(s);
            }
        }
        if members.len() != 2 {
            continue;
        }
        let (s1, s2) = (members[0], members[1]);
        if mesh.shell(s1).marker != mesh.shell(s2).marker {
            continue;
        }
        let w1 = mesh.shell(s1).verts.iter().copied().find(|&q| q != a && q != b).unwrap();
        let w2 = mesh.shell(s2).verts.iter().copied().find(|&q| q != a && q != b).unwrap();
        let (pa, pb) = (mesh.pos(a), mesh.pos(b));
        let (p1, p2) = (mesh.pos(w1), mesh.pos(w2));
        let vol6 = predicates::orient3d(&pa, &pb, &p1, &p2);
        if !predicates::is_coplanar(&pa, &pb, &p1, &p2, vol6, eps) {
            continue;
        }
        // Drop the segment; neighbors stay ring-linked.
        for &s in &members {
            let mut h = SubHandle::new(s, 0);
            if mesh.sub_find_edge(&mut h, a, b) {
                mesh.ssdissolve(h);
            }
        }
        // Keep collinear chains intact: only the segment record dies.
        mesh.kill_shell(seg);
        merged += 1;
    }
    merged
}

/// Marks the vertex kinds of facet and segment vertices.
pub(crate) fn mark_facet_vertices(mesh: &mut Mesh) {
    use crate::mesh::element::VertexKind;
    let mut on_seg: Vec<PointId> = Vec::new();
    for s in mesh.shell_ids(ShellKind::Subsegment) {
        let v = mesh.shell(s).verts;
        on_seg.extend([v[0], v[1]]);
    }
    for s in mesh.shell_ids(ShellKind::Subface) {
        for p in mesh.shell(s).verts {
            if p.is_none() {
                continue;
            }
            if mesh.point(p).kind == VertexKind::Input && !on_seg.contains(&p) {
                mesh.point_mut(p).kind = VertexKind::Facet;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::element::VertexKind;

    fn facet_mesh(coords: &[[f64; 3]]) -> (Mesh, Vec<PointId>) {
        let mut mesh = Mesh::new();
        let ids: Vec<PointId> = coords
            .iter()
            .map(|&c| mesh.make_point(c, VertexKind::Input))
            .collect();
        mesh.longest = 10.0;
        (mesh, ids)
    }

    /// The non-convex L-shaped polygon of eight vertices, in the z = 0
    /// plane, area 3.
    const L_POLY: [[f64; 3]; 8] = [
        [0.0, 0.0, 0.0],
        [2.0, 0.0, 0.0],
        [2.0, 1.0, 0.0],
        [1.0, 1.0, 0.0],
        [1.0, 2.0, 0.0],
        [0.0, 2.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.5, 0.5, 0.0],
    ];

    #[test]
    fn l_shaped_facet_triangulates_without_steiner_points() {
        // An L-shaped hexagon plus two more boundary vertices: n - 2
        // triangles, exact area, no extra points.
        let (mut mesh, ids) = facet_mesh(&L_POLY);
        let n_points_before = mesh.num_points();

        let mut fm = FacetMesher::new(&mut mesh, 1, &ids).unwrap();
        fm.triangulate(&ids).unwrap();
        for k in 0..ids.len() {
            fm.insert_segment(ids[k], ids[(k + 1) % ids.len()]).unwrap();
        }
        fm.carve(&[]).unwrap();
        let subs = fm.into_subs();

        assert_eq!(subs.len(), L_POLY.len() - 2, "expected n - 2 triangles");
        assert_eq!(mesh.num_points(), n_points_before, "no Steiner points");

        let area: f64 = subs
            .iter()
            .map(|&s| {
                let [a, b, c] = mesh.shell(s).verts;
                geometry::tri_area(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c))
            })
            .sum();
        // The polygon's exact area: the 2x2 square minus the 1x1 corner,
        // minus the notch cut at (0.5, 0.5).
        let expected = {
            let mut twice = 0.0;
            for k in 0..L_POLY.len() {
                let p = L_POLY[k];
                let q = L_POLY[(k + 1) % L_POLY.len()];
                twice += p[0] * q[1] - q[0] * p[1];
            }
            twice.abs() * 0.5
        };
        assert!((area - expected).abs() < 1e-12, "area {area} vs {expected}");
    }

    #[test]
    fn square_facet_with_a_hole_is_carved() {
        let square = [
            [0.0, 0.0, 0.0],
            [3.0, 0.0, 0.0],
            [3.0, 3.0, 0.0],
            [0.0, 3.0, 0.0],
            [1.0, 1.0, 0.0],
            [2.0, 1.0, 0.0],
            [2.0, 2.0, 0.0],
            [1.0, 2.0, 0.0],
        ];
        let (mut mesh, ids) = facet_mesh(&square);
        let mut fm = FacetMesher::new(&mut mesh, 1, &ids).unwrap();
        fm.triangulate(&ids).unwrap();
        // Outer square and inner square boundaries.
        for k in 0..4 {
            fm.insert_segment(ids[k], ids[(k + 1) % 4]).unwrap();
            fm.insert_segment(ids[4 + k], ids[4 + (k + 1) % 4]).unwrap();
        }
        fm.carve(&[[1.5, 1.5, 0.0]]).unwrap();
        let subs = fm.into_subs();

        let area: f64 = subs
            .iter()
            .map(|&s| {
                let [a, b, c] = mesh.shell(s).verts;
                geometry::tri_area(&mesh.pos(a), &mesh.pos(b), &mesh.pos(c))
            })
            .sum();
        // 3x3 square minus the 1x1 hole.
        assert!((area - 8.0).abs() < 1e-12, "area {area}");
    }

    #[test]
    fn unify_segments_merges_duplicates() {
        let (mut mesh, ids) = facet_mesh(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.5, 1.0, 0.0],
            [0.5, 0.5, 1.0],
        ]);
        // Two subfaces sharing edge (0, 1), each protecting it separately.
        let s1 = mesh.make_subface([ids[0], ids[1], ids[2]], 1);
        let s2 = mesh.make_subface([ids[0], ids[1], ids[3]], 2);
        for s in [s1, s2] {
            let seg = mesh.make_subsegment(ids[0], ids[1], 0);
            let mut h = SubHandle::new(s, 0);
            assert!(mesh.sub_find_edge(&mut h, ids[0], ids[1]));
            mesh.ssbond(h, seg);
        }
        assert_eq!(mesh.shell_ids(ShellKind::Subsegment).len(), 2);
        unify_segments(&mut mesh);
        assert_eq!(mesh.shell_ids(ShellKind::Subsegment).len(), 1);
        // The ring around the kept segment visits both subfaces.
        let mut h = SubHandle::new(s1, 0);
        assert!(mesh.sub_find_edge(&mut h, ids[0], ids[1]));
        let next = mesh.spivot(h);
        assert_eq!(next.shell, s2);
    }

    #[test]
    fn coplanar_facets_merge() {
        let (mut mesh, ids) = facet_mesh(&[
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.5, 1.0, 0.0],
            [0.5, -1.0, 0.0],
        ]);
        let s1 = mesh.make_subface([ids[0], ids[1], ids[2]], 5);
        let s2 = mesh.make_subface([ids[1], ids[0], ids[3]], 5);
        let seg = mesh.make_subsegment(ids[0], ids[1], 0);
        for s in [s1, s2] {
            let mut h = SubHandle::new(s, 0);
            assert!(mesh.sub_find_edge(&mut h, ids[0], ids[1]));
            mesh.ssbond(h, seg);
        }
        let merged = merge_facets(&mut mesh, 1e-8);
        assert_eq!(merged, 1);
        assert!(mesh.shell_ids(ShellKind::Subsegment).is_empty());
    }
}
