//! Static mesh description: cell geometry and the connection list with
//! precomputed geometric transmissibilities. Grid construction proper is an
//! external concern; the structured builder here covers the needs of the
//! solve core and its tests.

use serde::{Deserialize, Serialize};

/// Direction tag of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnDir {
    X,
    Y,
    Z,
    MatFrac,
    Unstructured,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct MeshCell {
    /// Cell size in x-direction [ft]
    pub dx: f64,
    /// Cell size in y-direction [ft]
    pub dy: f64,
    /// Cell size in z-direction [ft]
    pub dz: f64,
    /// Cell-centre depth, increasing downward [ft]
    pub depth: f64,
    /// Net-to-gross [dimensionless, 0-1]
    pub ntg: f64,
    /// Porosity at reference pressure [dimensionless, 0-1]
    pub poro_init: f64,
    /// Permeability in x-direction [mD] (milliDarcy)
    pub kx: f64,
    /// Permeability in y-direction [mD]
    pub ky: f64,
    /// Permeability in z-direction [mD] (vertical permeability typically lower)
    pub kz: f64,
}

impl MeshCell {
    /// Net bulk volume [ft³]
    pub fn bulk_volume(&self) -> f64 {
        self.dx * self.dy * self.dz * self.ntg
    }
}

/// One connection between two cells with its static transmissibility.
/// Runtime (per-phase, per-step) fields live in `conn::BulkConn`.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct MeshConn {
    pub b: usize,
    pub e: usize,
    pub dir: ConnDir,
    /// Geometric transmissibility [mD·ft]: flux = DARCY_CONST·trans·λ·ΔΦ
    pub trans: f64,
    /// Contact area over centre distance [ft], for heat conduction
    pub area_over_dist: f64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Mesh {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub cells: Vec<MeshCell>,
    pub conns: Vec<MeshConn>,
}

impl Mesh {
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.nx * self.ny) + (j * self.nx) + i
    }

    /// Uniform structured grid. `top_depth` is the depth of the top face of
    /// layer k = 0; depth increases with k.
    pub fn structured(
        nx: usize,
        ny: usize,
        nz: usize,
        (dx, dy, dz): (f64, f64, f64),
        top_depth: f64,
        poro: f64,
        (kx, ky, kz): (f64, f64, f64),
    ) -> Self {
        let mut cells = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for _j in 0..ny {
                for _i in 0..nx {
                    cells.push(MeshCell {
                        dx,
                        dy,
                        dz,
                        depth: top_depth + (k as f64 + 0.5) * dz,
                        ntg: 1.0,
                        poro_init: poro,
                        kx,
                        ky,
                        kz,
                    });
                }
            }
        }
        Self::from_cells(nx, ny, nz, cells)
    }

    /// Structured grid from an explicit cell array (row-major i fastest),
    /// e.g. for heterogeneous permeability fields.
    pub fn from_cells(nx: usize, ny: usize, nz: usize, cells: Vec<MeshCell>) -> Self {
        assert_eq!(cells.len(), nx * ny * nz);
        let mut mesh = Mesh {
            nx,
            ny,
            nz,
            cells,
            conns: Vec::new(),
        };
        // connections in positive direction only, so each pair appears once
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let b = mesh.idx(i, j, k);
                    if i + 1 < nx {
                        mesh.push_conn(b, mesh.idx(i + 1, j, k), ConnDir::X);
                    }
                    if j + 1 < ny {
                        mesh.push_conn(b, mesh.idx(i, j + 1, k), ConnDir::Y);
                    }
                    if k + 1 < nz {
                        mesh.push_conn(b, mesh.idx(i, j, k + 1), ConnDir::Z);
                    }
                }
            }
        }
        mesh
    }

    fn push_conn(&mut self, b: usize, e: usize, dir: ConnDir) {
        let (cb, ce) = (&self.cells[b], &self.cells[e]);
        let (kb, ke, db, de, area) = match dir {
            ConnDir::X => (cb.kx, ce.kx, cb.dx, ce.dx, cb.dy * cb.dz * cb.ntg),
            ConnDir::Y => (cb.ky, ce.ky, cb.dy, ce.dy, cb.dx * cb.dz * cb.ntg),
            ConnDir::Z => (cb.kz, ce.kz, cb.dz, ce.dz, cb.dx * cb.dy),
            _ => unreachable!("structured builder emits axis connections only"),
        };
        // half-cell transmissibilities in series
        let tb = kb * area / (0.5 * db);
        let te = ke * area / (0.5 * de);
        let trans = if tb + te > 0.0 {
            tb * te / (tb + te)
        } else {
            0.0
        };
        self.conns.push(MeshConn {
            b,
            e,
            dir,
            trans,
            area_over_dist: area / (0.5 * (db + de)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn structured_counts_and_depths() {
        let m = Mesh::structured(3, 2, 2, (100.0, 100.0, 20.0), 8000.0, 0.2, (100.0, 100.0, 10.0));
        assert_eq!(m.cells.len(), 12);
        // 2*2*2 x-conns + 3*1*2 y-conns + 3*2*1 z-conns
        assert_eq!(m.conns.len(), 8 + 6 + 6);
        assert_relative_eq!(m.cells[m.idx(0, 0, 0)].depth, 8010.0);
        assert_relative_eq!(m.cells[m.idx(0, 0, 1)].depth, 8030.0);
    }

    #[test]
    fn trans_is_harmonic_in_series() {
        let mut cells = vec![
            MeshCell {
                dx: 100.0,
                dy: 100.0,
                dz: 20.0,
                depth: 8010.0,
                ntg: 1.0,
                poro_init: 0.2,
                kx: 100.0,
                ky: 100.0,
                kz: 10.0,
            };
            2
        ];
        cells[1].kx = 300.0;
        let m = Mesh::from_cells(2, 1, 1, cells);
        let t = m.conns[0].trans;
        // harmonic mean of 100 and 300 is 150; T = k_h * A / L
        assert_relative_eq!(t, 150.0 * (100.0 * 20.0) / 100.0, max_relative = 1e-12);
    }

    #[test]
    fn zero_perm_gives_zero_trans() {
        let mut cells = vec![
            MeshCell {
                dx: 100.0,
                dy: 100.0,
                dz: 20.0,
                depth: 8010.0,
                ntg: 1.0,
                poro_init: 0.2,
                kx: 100.0,
                ky: 100.0,
                kz: 10.0,
            };
            2
        ];
        cells[0].kx = 0.0;
        let m = Mesh::from_cells(2, 1, 1, cells);
        assert_eq!(m.conns[0].trans, 0.0);
    }
}
