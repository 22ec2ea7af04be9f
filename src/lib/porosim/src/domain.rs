//! Local view of the partitioned mesh: interior cells, the ghost tail
//! populated from neighbouring ranks, the fixed send/recv schedule, and the
//! global row numbering used by the linear system.
//!
//! The mesh (plus wells, treated as pseudo-cells after all real cells) is
//! partitioned once. Interior cells occupy `[0, num_interior)` in every
//! local array; ghosts occupy `[num_interior, num_local)`, grouped so each
//! peer's data lands in one contiguous sub-range.

use crate::comm::Communicator;
use crate::mesh::{Mesh, MeshConn};
use std::collections::HashMap;

/// Per-rank partition description handed to `Domain::from_plan`. Produced by
/// the external partitioner in production; `partition_slabs` builds one for
/// structured grids in tests.
#[derive(Clone, Debug, Default)]
pub struct RankPlan {
    /// Global ids of owned cells, in local order.
    pub interior: Vec<usize>,
    /// For each peer: local interior indices that are ghosts of that peer.
    pub send: Vec<(usize, Vec<usize>)>,
    /// For each peer (same order as `send`): global ids received from it,
    /// appended to the ghost tail in this order.
    pub recv: Vec<(usize, Vec<usize>)>,
    /// Global ids of wells assigned to this rank.
    pub wells: Vec<usize>,
}

pub struct Domain {
    pub comm: Box<dyn Communicator>,
    /// Number of interior (owned) cells.
    pub num_interior: usize,
    /// Number of ghost cells.
    pub num_ghost: usize,
    /// Interior + ghost.
    pub num_local: usize,
    /// Global ids of wells on this rank.
    pub wells: Vec<usize>,
    /// Per peer: (peer rank, local interior indices packed into its buffer).
    pub send_element: Vec<(usize, Vec<usize>)>,
    /// Per peer: (peer rank, ghost range begin, ghost range end), contiguous.
    pub recv_element: Vec<(usize, usize, usize)>,
    /// Local index -> global cell id.
    pub l2g: Vec<usize>,
    /// Global row index of every local element; interior cells first, then
    /// this rank's active wells, then ghosts. Rebuilt every Newton iteration
    /// because the set of active wells may change.
    global_index: Vec<u64>,
}

impl Domain {
    /// Single-rank domain covering the whole mesh.
    pub fn serial(comm: Box<dyn Communicator>, num_cells: usize, num_wells: usize) -> Self {
        Domain {
            comm,
            num_interior: num_cells,
            num_ghost: 0,
            num_local: num_cells,
            wells: (0..num_wells).collect(),
            send_element: Vec::new(),
            recv_element: Vec::new(),
            l2g: (0..num_cells).collect(),
            global_index: Vec::new(),
        }
    }

    pub fn from_plan(comm: Box<dyn Communicator>, plan: &RankPlan) -> Self {
        let num_interior = plan.interior.len();
        let mut l2g = plan.interior.clone();
        let mut recv_element = Vec::with_capacity(plan.recv.len());
        let mut cursor = num_interior;
        for (peer, ghosts) in &plan.recv {
            recv_element.push((*peer, cursor, cursor + ghosts.len()));
            l2g.extend_from_slice(ghosts);
            cursor += ghosts.len();
        }
        debug_assert_eq!(
            plan.send.iter().map(|s| s.0).collect::<Vec<_>>(),
            plan.recv.iter().map(|r| r.0).collect::<Vec<_>>(),
            "ghost adjacency must be symmetric"
        );
        Domain {
            comm,
            num_interior,
            num_ghost: cursor - num_interior,
            num_local: cursor,
            wells: plan.wells.clone(),
            send_element: plan.send.clone(),
            recv_element,
            l2g,
            global_index: Vec::new(),
        }
    }

    /// Refresh ghost entries of a per-cell field with `m` values per cell.
    /// All sends are posted before any receive is drained.
    pub fn exchange_f64(&self, field: &mut [f64], m: usize) {
        for (peer, idxs) in &self.send_element {
            let mut buf = Vec::with_capacity(idxs.len() * m);
            for &i in idxs {
                buf.extend_from_slice(&field[i * m..(i + 1) * m]);
            }
            self.comm.send_f64(*peer, &buf);
        }
        for &(peer, begin, end) in &self.recv_element {
            let got = self.comm.recv_f64(peer);
            debug_assert_eq!(got.len(), (end - begin) * m);
            field[begin * m..end * m].copy_from_slice(&got);
        }
    }

    /// Same for integer tags (AIMc implicitness markers).
    pub fn exchange_i32(&self, field: &mut [i32]) {
        for (peer, idxs) in &self.send_element {
            let buf: Vec<i32> = idxs.iter().map(|&i| field[i]).collect();
            self.comm.send_i32(*peer, &buf);
        }
        for &(peer, begin, end) in &self.recv_element {
            let got = self.comm.recv_i32(peer);
            field[begin..end].copy_from_slice(&got);
        }
    }

    /// Stable global numbering of interior cells, this rank's active wells,
    /// and ghosts, via an inclusive scan of `num_interior + num_act_well`
    /// followed by a halo exchange of the resulting indices. The ghost at
    /// local index `g` lands in slot `g + num_act_well`.
    pub fn cal_global_index(&mut self, num_act_well: usize) -> &[u64] {
        let n_loc = self.num_interior + num_act_well;
        let end = self.comm.scan_sum(n_loc as u64);
        let begin = end - n_loc as u64;

        self.global_index.clear();
        self.global_index.resize(self.num_local + num_act_well, 0);
        for n in 0..n_loc {
            self.global_index[n] = begin + n as u64;
        }

        for (peer, idxs) in &self.send_element {
            let buf: Vec<u64> = idxs.iter().map(|&i| self.global_index[i]).collect();
            self.comm.send_u64(*peer, &buf);
        }
        for &(peer, gbegin, gend) in &self.recv_element {
            let got = self.comm.recv_u64(peer);
            self.global_index[gbegin + num_act_well..gend + num_act_well].copy_from_slice(&got);
        }
        &self.global_index
    }

    pub fn global_index(&self) -> &[u64] {
        &self.global_index
    }
}

/// Slab partition of a structured mesh along the x-axis. `well_cells` holds
/// the global cell id of each well's first perforation; a well goes to the
/// rank owning that cell.
pub fn partition_slabs(mesh: &Mesh, nranks: usize, well_cells: &[usize]) -> Vec<RankPlan> {
    assert!(nranks >= 1 && nranks <= mesh.nx);
    let bounds: Vec<usize> = (0..=nranks).map(|r| r * mesh.nx / nranks).collect();
    let owner_of_i = |i: usize| bounds.iter().rposition(|&lo| lo <= i).unwrap().min(nranks - 1);

    let mut plans: Vec<RankPlan> = vec![RankPlan::default(); nranks];
    for (r, plan) in plans.iter_mut().enumerate() {
        let (lo, hi) = (bounds[r], bounds[r + 1]);
        let mut local_of = HashMap::new();
        for k in 0..mesh.nz {
            for j in 0..mesh.ny {
                for i in lo..hi {
                    let g = mesh.idx(i, j, k);
                    local_of.insert(g, plan.interior.len());
                    plan.interior.push(g);
                }
            }
        }
        // boundary columns exchanged with the slab neighbours
        let column = |i: usize| -> Vec<usize> {
            let mut v = Vec::with_capacity(mesh.ny * mesh.nz);
            for k in 0..mesh.nz {
                for j in 0..mesh.ny {
                    v.push(mesh.idx(i, j, k));
                }
            }
            v
        };
        if r > 0 {
            let send: Vec<usize> = column(lo).iter().map(|g| local_of[g]).collect();
            plan.send.push((r - 1, send));
            plan.recv.push((r - 1, column(lo - 1)));
        }
        if r + 1 < nranks {
            let send: Vec<usize> = column(hi - 1).iter().map(|g| local_of[g]).collect();
            plan.send.push((r + 1, send));
            plan.recv.push((r + 1, column(hi)));
        }
        for (w, &cell) in well_cells.iter().enumerate() {
            let i = cell % mesh.nx;
            if owner_of_i(i) == r {
                plan.wells.push(w);
            }
        }
    }
    plans
}

/// Restrict the global mesh to one rank's local view: interior cells, then
/// ghosts, and every connection touching at least one interior cell with the
/// interior endpoint first.
pub fn extract_local(mesh: &Mesh, plan: &RankPlan) -> Mesh {
    let mut g2l: HashMap<usize, usize> = HashMap::new();
    for (l, &g) in plan.interior.iter().enumerate() {
        g2l.insert(g, l);
    }
    let mut cursor = plan.interior.len();
    for (_, ghosts) in &plan.recv {
        for &g in ghosts {
            g2l.insert(g, cursor);
            cursor += 1;
        }
    }
    let num_interior = plan.interior.len();
    let cells: Vec<_> = {
        let mut order: Vec<usize> = plan.interior.clone();
        for (_, ghosts) in &plan.recv {
            order.extend_from_slice(ghosts);
        }
        order.iter().map(|&g| mesh.cells[g]).collect()
    };
    let mut conns = Vec::new();
    for c in &mesh.conns {
        let (Some(&lb), Some(&le)) = (g2l.get(&c.b), g2l.get(&c.e)) else {
            continue;
        };
        if lb >= num_interior && le >= num_interior {
            continue;
        }
        let flipped = lb >= num_interior;
        conns.push(MeshConn {
            b: if flipped { le } else { lb },
            e: if flipped { lb } else { le },
            ..*c
        });
    }
    Mesh {
        nx: mesh.nx,
        ny: mesh.ny,
        nz: mesh.nz,
        cells,
        conns,
    }
}
