//! AIMc cell classifier: marks cells implicit or explicit each step from
//! CFL, volume error, and proximity to wells, then reconciles the marking
//! across ranks so both sides of every connection emit the same Jacobian
//! pattern.

use crate::bulk::Bulk;
use crate::conn::BulkConn;
use crate::consts::{AIM_CFL_LIM, AIM_EV_LIM, AIM_NEIGHBOR_LAYERS};
use crate::domain::Domain;
use crate::nr::NrSuite;
use tracing::debug;

/// Per-cell implicitness indicator. Negative means explicit (IMPEC-style
/// pressure unknown only); `k >= 0` means implicit, where k is the
/// remaining propagation depth of the neighbour walk.
pub struct BulkTypeAim {
    indicator: Vec<i32>,
}

impl BulkTypeAim {
    pub fn new(nb: usize) -> Self {
        BulkTypeAim {
            indicator: vec![-1; nb],
        }
    }

    pub fn init(&mut self) {
        self.indicator.fill(-1);
    }

    pub fn set_type(&mut self, n: usize, v: i32) {
        self.indicator[n] = self.indicator[n].max(v);
    }

    pub fn overwrite(&mut self, n: usize, v: i32) {
        self.indicator[n] = v;
    }

    pub fn get(&self, n: usize) -> i32 {
        self.indicator[n]
    }

    pub fn is_implicit(&self, n: usize) -> bool {
        self.indicator[n] >= 0
    }

    pub fn num_implicit(&self) -> usize {
        self.indicator.iter().filter(|&&v| v >= 0).count()
    }

    pub fn as_slice_mut(&mut self) -> &mut Vec<i32> {
        &mut self.indicator
    }
}

/// Mark `p` implicit with depth `k` and walk its neighbours with k − 1.
fn set_k_neighbor(neighbor: &[Vec<usize>], p: usize, tar: &mut BulkTypeAim, k: i32) {
    tar.set_type(p, k);
    if k > 0 {
        for &v in &neighbor[p] {
            set_k_neighbor(neighbor, v, tar, k - 1);
        }
    }
}

/// Classify every cell for this step. Implicitness of the same grid cell
/// must agree across processes, hence the exchange-propagate-exchange
/// sequence at the end.
pub fn set_fim_bulk(
    aim: &mut BulkTypeAim,
    bulk: &Bulk,
    conn: &BulkConn,
    nr: &NrSuite,
    domain: &Domain,
) {
    let np = bulk.np;
    aim.init();

    for n in 0..bulk.nbi {
        let mut flag = false;
        for j in 0..np {
            if nr.cfl[n * np + j] > AIM_CFL_LIM {
                flag = true;
                break;
            }
        }
        if !flag
            && ((bulk.st.vf[n] - bulk.st.rock_vp[n]) / bulk.st.rock_vp[n]).abs() > AIM_EV_LIM
        {
            flag = true;
        }
        if flag {
            set_k_neighbor(&conn.neighbor, n, aim, AIM_NEIGHBOR_LAYERS);
        }
    }

    // well perforations and their neighbours are always implicit
    for &p in &bulk.well_bulk_id {
        set_k_neighbor(&conn.neighbor, p, aim, AIM_NEIGHBOR_LAYERS);
    }

    if domain.comm.size() > 1 {
        // first exchange: receive the peers' markings for our ghosts and
        // propagate them inward
        let mut tags: Vec<i32> = aim.as_slice_mut().clone();
        domain.exchange_i32(&mut tags);
        for g in domain.num_interior..domain.num_local {
            set_k_neighbor(&conn.neighbor, g, aim, tags[g]);
        }
        // second exchange: adopt the peers' final ghost values so both
        // sides of every connection agree
        let mut tags: Vec<i32> = aim.as_slice_mut().clone();
        domain.exchange_i32(&mut tags);
        for g in domain.num_interior..domain.num_local {
            aim.overwrite(g, tags[g]);
        }
    }

    debug!(
        implicit = aim.num_implicit(),
        total = bulk.nb,
        "AIMc classification"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::config::RockConfig;
    use crate::mesh::Mesh;
    use crate::rock::Rock;

    fn setup(nx: usize) -> (Bulk, BulkConn, NrSuite, Domain) {
        let mesh =
            Mesh::structured(nx, 1, 1, (100.0, 100.0, 20.0), 8000.0, 0.2, (100.0, 100.0, 10.0));
        let mut bulk = Bulk::new(&mesh, nx, 2, 2, false, Rock::new(&RockConfig::default()));
        bulk.cal_rock();
        for n in 0..nx {
            bulk.st.p[n] = 3000.0;
            bulk.st.vf[n] = bulk.st.rock_vp[n];
        }
        let conn = BulkConn::new(&mesh, nx, 2, 2);
        let nr = NrSuite::new(nx, nx, 2, 2, 0, 3);
        let dom = Domain::serial(Box::new(SerialComm), nx, 0);
        (bulk, conn, nr, dom)
    }

    #[test]
    fn quiet_field_without_wells_stays_explicit() {
        let (bulk, conn, nr, dom) = setup(8);
        let mut aim = BulkTypeAim::new(8);
        set_fim_bulk(&mut aim, &bulk, &conn, &nr, &dom);
        assert_eq!(aim.num_implicit(), 0);
    }

    #[test]
    fn high_cfl_cell_and_neighbors_go_implicit() {
        let (bulk, conn, mut nr, dom) = setup(8);
        nr.cfl[4 * 2] = 1.5; // cell 4, phase 0
        let mut aim = BulkTypeAim::new(8);
        set_fim_bulk(&mut aim, &bulk, &conn, &nr, &dom);
        // two layers each side of cell 4
        for n in 2..=6 {
            assert!(aim.is_implicit(n), "cell {n} should be implicit");
        }
        assert!(!aim.is_implicit(0));
        assert!(!aim.is_implicit(7));
    }

    #[test]
    fn well_cells_seed_implicit_halo() {
        let (mut bulk, conn, nr, dom) = setup(8);
        bulk.well_bulk_id = vec![0];
        let mut aim = BulkTypeAim::new(8);
        set_fim_bulk(&mut aim, &bulk, &conn, &nr, &dom);
        assert!(aim.is_implicit(0));
        assert!(aim.is_implicit(1));
        assert!(aim.is_implicit(2));
        assert!(!aim.is_implicit(3));
    }

    #[test]
    fn volume_error_flags_implicit() {
        let (mut bulk, conn, nr, dom) = setup(4);
        bulk.st.vf[1] = bulk.st.rock_vp[1] * 1.01;
        let mut aim = BulkTypeAim::new(4);
        set_fim_bulk(&mut aim, &bulk, &conn, &nr, &dom);
        assert!(aim.is_implicit(1));
    }
}
