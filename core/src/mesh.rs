// Single-process particle-mesh library.
//
// Provides the field types and mesh transforms the operator set needs, each
// with its adjoint:
//   - RealField / ComplexField on a periodic [n0, n1, n2] grid of box size L
//   - r2c (normalized by 1/N) and c2r (unnormalized, real part)
//   - per-mode kernels (inverse Laplacian, spectral derivative)
//   - CIC paint and readout, with mesh and position gradients
//   - weighted inner product of complex fields (cdot)
//
// Complex fields hold the full grid rather than the Hermitian half. Every map
// here is real-linear in its field argument, and adjoints are taken with
// respect to the real inner product <a, b> = sum Re(conj(a) b).

use rayon::prelude::*;

use crate::complex::Complex64;
use crate::error::{EngineError, Result};
use crate::fft::{fft_3d, Direction};

// ── Geometry ─────────────────────────────────────────────────────────

/// Periodic mesh of `nmesh` cells covering a box of side `box_size`.
#[derive(Clone, Debug, PartialEq)]
pub struct ParticleMesh {
    nmesh: [usize; 3],
    box_size: [f64; 3],
}

impl ParticleMesh {
    pub fn new(nmesh: [usize; 3], box_size: [f64; 3]) -> Result<Self> {
        if nmesh.iter().any(|&n| n == 0) {
            return Err(EngineError::Mesh(format!("mesh shape {nmesh:?} has an empty axis")));
        }
        if box_size.iter().any(|&l| !(l > 0.0) || !l.is_finite()) {
            return Err(EngineError::Mesh(format!("box size {box_size:?} must be positive")));
        }
        Ok(ParticleMesh { nmesh, box_size })
    }

    /// Cubic mesh with `n` cells per side.
    pub fn cubic(n: usize, box_size: f64) -> Result<Self> {
        Self::new([n; 3], [box_size; 3])
    }

    /// Same box, `factor` times more cells per side.
    pub fn refined(&self, factor: usize) -> Result<Self> {
        if factor == 0 {
            return Err(EngineError::Mesh("refinement factor must be >= 1".into()));
        }
        Self::new(self.nmesh.map(|n| n * factor), self.box_size)
    }

    pub fn nmesh(&self) -> [usize; 3] {
        self.nmesh
    }

    pub fn box_size(&self) -> [f64; 3] {
        self.box_size
    }

    pub fn ncells(&self) -> usize {
        self.nmesh.iter().product()
    }

    pub fn volume(&self) -> f64 {
        self.box_size.iter().product()
    }

    pub fn create_real(&self) -> RealField {
        RealField {
            nmesh: self.nmesh,
            box_size: self.box_size,
            data: vec![0.0; self.ncells()],
        }
    }

    pub fn create_complex(&self) -> ComplexField {
        ComplexField {
            nmesh: self.nmesh,
            box_size: self.box_size,
            data: vec![Complex64::ZERO; self.ncells()],
        }
    }

    /// Wrap an existing buffer as a real field on this mesh.
    pub fn real_from_vec(&self, data: Vec<f64>) -> Result<RealField> {
        if data.len() != self.ncells() {
            return Err(EngineError::shape("real_from_vec", self.ncells(), data.len()));
        }
        Ok(RealField { nmesh: self.nmesh, box_size: self.box_size, data })
    }

    /// Wrap an existing buffer as a complex field on this mesh.
    pub fn complex_from_vec(&self, data: Vec<Complex64>) -> Result<ComplexField> {
        if data.len() != self.ncells() {
            return Err(EngineError::shape("complex_from_vec", self.ncells(), data.len()));
        }
        Ok(ComplexField { nmesh: self.nmesh, box_size: self.box_size, data })
    }

    /// One particle per cell at `(i + shift) * L / n`, in row-major cell order.
    pub fn grid(&self, shift: f64) -> ParticleArray {
        let [n0, n1, n2] = self.nmesh;
        let h = [0, 1, 2].map(|a| self.box_size[a] / self.nmesh[a] as f64);
        let mut data = Vec::with_capacity(self.ncells());
        for i in 0..n0 {
            for j in 0..n1 {
                for k in 0..n2 {
                    data.push([
                        (i as f64 + shift) * h[0],
                        (j as f64 + shift) * h[1],
                        (k as f64 + shift) * h[2],
                    ]);
                }
            }
        }
        ParticleArray { data }
    }

    #[inline]
    fn flat(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.nmesh[1] + j) * self.nmesh[2] + k
    }

    fn check_real(&self, field: &RealField, op: &str) -> Result<()> {
        if field.nmesh != self.nmesh || field.box_size != self.box_size {
            return Err(EngineError::shape(
                op,
                format!("mesh {:?} box {:?}", self.nmesh, self.box_size),
                format!("mesh {:?} box {:?}", field.nmesh, field.box_size),
            ));
        }
        Ok(())
    }

    fn check_complex(&self, field: &ComplexField, op: &str) -> Result<()> {
        if field.nmesh != self.nmesh || field.box_size != self.box_size {
            return Err(EngineError::shape(
                op,
                format!("mesh {:?} box {:?}", self.nmesh, self.box_size),
                format!("mesh {:?} box {:?}", field.nmesh, field.box_size),
            ));
        }
        Ok(())
    }

    fn check_layout(&self, layout: &Layout, op: &str) -> Result<()> {
        if layout.nmesh != self.nmesh {
            return Err(EngineError::shape(op, format!("{:?}", self.nmesh), format!("{:?}", layout.nmesh)));
        }
        Ok(())
    }

    // ── Domain decomposition ─────────────────────────────────────

    /// Assign every particle to its CIC cell on this mesh.
    ///
    /// Positions are wrapped periodically. The layout depends on the
    /// positions it was built from and must be rebuilt whenever they move.
    pub fn decompose(&self, positions: &ParticleArray) -> Layout {
        let inv_h = [0, 1, 2].map(|a| self.nmesh[a] as f64 / self.box_size[a]);
        let mut cell = Vec::with_capacity(positions.len());
        let mut frac = Vec::with_capacity(positions.len());
        for x in &positions.data {
            let mut c = [0usize; 3];
            let mut t = [0f64; 3];
            for a in 0..3 {
                let n = self.nmesh[a] as f64;
                let u = (x[a] * inv_h[a]).rem_euclid(n);
                let fl = u.floor();
                let mut i = fl as usize;
                if i >= self.nmesh[a] {
                    i -= self.nmesh[a];
                }
                c[a] = i;
                t[a] = u - fl;
            }
            cell.push(c);
            frac.push(t);
        }
        Layout { nmesh: self.nmesh, inv_h, cell, frac }
    }

    // ── Paint / readout ──────────────────────────────────────────

    /// CIC deposit. Unit masses when `masses` is None.
    pub fn paint(&self, layout: &Layout, masses: Option<&[f64]>) -> Result<RealField> {
        self.check_layout(layout, "paint")?;
        if let Some(m) = masses {
            if m.len() != layout.len() {
                return Err(EngineError::shape("paint", layout.len(), m.len()));
            }
        }
        let mut out = self.create_real();
        for p in 0..layout.len() {
            let mass = masses.map_or(1.0, |m| m[p]);
            for (idx, w, _) in self.corners(layout, p) {
                out.data[idx] += mass * w;
            }
        }
        Ok(out)
    }

    /// CIC interpolation of `field` at the particles of `layout`.
    pub fn readout(&self, field: &RealField, layout: &Layout) -> Result<Vec<f64>> {
        self.check_real(field, "readout")?;
        self.check_layout(layout, "readout")?;
        Ok((0..layout.len())
            .map(|p| self.corners(layout, p).map(|(idx, w, _)| field.data[idx] * w).sum::<f64>())
            .collect())
    }

    /// Gradient of `<mesh_grad, paint(x, masses)>` with respect to positions.
    pub fn paint_gradient(
        &self,
        layout: &Layout,
        mesh_grad: &RealField,
        masses: Option<&[f64]>,
    ) -> Result<ParticleArray> {
        self.check_real(mesh_grad, "paint_gradient")?;
        self.check_layout(layout, "paint_gradient")?;
        if let Some(m) = masses {
            if m.len() != layout.len() {
                return Err(EngineError::shape("paint_gradient", layout.len(), m.len()));
            }
        }
        Ok(self.position_gradient(layout, mesh_grad, |p| masses.map_or(1.0, |m| m[p])))
    }

    /// Adjoint of readout with respect to the mesh: paint with the seed as mass.
    pub fn readout_mesh_gradient(&self, layout: &Layout, grad: &[f64]) -> Result<RealField> {
        self.paint(layout, Some(grad))
    }

    /// Gradient of `<grad, readout(field, x)>` with respect to positions.
    pub fn readout_gradient(&self, field: &RealField, layout: &Layout, grad: &[f64]) -> Result<ParticleArray> {
        self.check_real(field, "readout_gradient")?;
        self.check_layout(layout, "readout_gradient")?;
        if grad.len() != layout.len() {
            return Err(EngineError::shape("readout_gradient", layout.len(), grad.len()));
        }
        Ok(self.position_gradient(layout, field, |p| grad[p]))
    }

    /// sum over corners of field * dW/dx, times a per-particle coefficient.
    /// Paint and readout share this: both are bilinear in (field, W(x)).
    fn position_gradient(&self, layout: &Layout, field: &RealField, coeff: impl Fn(usize) -> f64) -> ParticleArray {
        let mut data = vec![[0.0; 3]; layout.len()];
        for (p, g) in data.iter_mut().enumerate() {
            let c = coeff(p);
            if c == 0.0 {
                continue;
            }
            for (idx, _, dw) in self.corners(layout, p) {
                let v = field.data[idx];
                for a in 0..3 {
                    g[a] += v * dw[a];
                }
            }
            for a in 0..3 {
                g[a] *= c * layout.inv_h[a];
            }
        }
        ParticleArray { data }
    }

    /// The 8 CIC corners of particle `p`: (flat index, weight, dweight/du).
    fn corners<'a>(&'a self, layout: &'a Layout, p: usize) -> impl Iterator<Item = (usize, f64, [f64; 3])> + 'a {
        let [i, j, k] = layout.cell[p];
        let t = layout.frac[p];
        let [n0, n1, n2] = self.nmesh;
        (0..8).map(move |corner| {
            let d = [(corner >> 2) & 1, (corner >> 1) & 1, corner & 1];
            let mut w1 = [0.0; 3];
            let mut dw1 = [0.0; 3];
            for a in 0..3 {
                if d[a] == 1 {
                    w1[a] = t[a];
                    dw1[a] = 1.0;
                } else {
                    w1[a] = 1.0 - t[a];
                    dw1[a] = -1.0;
                }
            }
            let idx = self.flat((i + d[0]) % n0, (j + d[1]) % n1, (k + d[2]) % n2);
            let w = w1[0] * w1[1] * w1[2];
            let dw = [dw1[0] * w1[1] * w1[2], w1[0] * dw1[1] * w1[2], w1[0] * w1[1] * dw1[2]];
            (idx, w, dw)
        })
    }

    // ── Fourier transforms ───────────────────────────────────────

    /// Forward transform normalized by 1/N.
    pub fn r2c(&self, field: &RealField) -> Result<ComplexField> {
        self.check_real(field, "r2c")?;
        let mut data: Vec<Complex64> = field.data.iter().map(|&x| Complex64::real(x)).collect();
        fft_3d(&mut data, self.nmesh, Direction::Forward);
        let inv_n = 1.0 / self.ncells() as f64;
        data.par_iter_mut().for_each(|c| *c = c.scale(inv_n));
        Ok(ComplexField { nmesh: self.nmesh, box_size: self.box_size, data })
    }

    /// Unnormalized inverse transform, real part.
    pub fn c2r(&self, field: &ComplexField) -> Result<RealField> {
        self.check_complex(field, "c2r")?;
        let mut data = field.data.clone();
        fft_3d(&mut data, self.nmesh, Direction::Inverse);
        Ok(RealField {
            nmesh: self.nmesh,
            box_size: self.box_size,
            data: data.into_iter().map(|c| c.re).collect(),
        })
    }

    /// Adjoint of `r2c`: Re(F^H g) / N.
    pub fn r2c_gradient(&self, grad: &ComplexField) -> Result<RealField> {
        let mut out = self.c2r(grad)?;
        out.scale_in_place(1.0 / self.ncells() as f64);
        Ok(out)
    }

    /// Adjoint of `c2r`: F g (unnormalized).
    pub fn c2r_gradient(&self, grad: &RealField) -> Result<ComplexField> {
        let mut out = self.r2c(grad)?;
        let n = self.ncells() as f64;
        out.data.par_iter_mut().for_each(|c| *c = c.scale(n));
        Ok(out)
    }
}

// ── Particle layout ──────────────────────────────────────────────────

/// Per-particle CIC cell assignment on one mesh.
#[derive(Clone, Debug)]
pub struct Layout {
    nmesh: [usize; 3],
    inv_h: [f64; 3],
    cell: Vec<[usize; 3]>,
    frac: Vec<[f64; 3]>,
}

impl Layout {
    pub fn len(&self) -> usize {
        self.cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.is_empty()
    }
}

// ── Wavevectors and kernels ──────────────────────────────────────────

/// Physical wavevector of one Fourier mode.
#[derive(Clone, Copy, Debug)]
pub struct Wavevector {
    pub k: [f64; 3],
    /// True on axes where the mode sits on the Nyquist plane.
    pub nyquist: [bool; 3],
}

impl Wavevector {
    fn at(nmesh: [usize; 3], box_size: [f64; 3], flat: usize) -> Self {
        let idx = [flat / (nmesh[1] * nmesh[2]), (flat / nmesh[2]) % nmesh[1], flat % nmesh[2]];
        let mut k = [0.0; 3];
        let mut nyquist = [false; 3];
        for a in 0..3 {
            let n = nmesh[a];
            let i = idx[a];
            let freq = if i < (n + 1) / 2 { i as f64 } else { i as f64 - n as f64 };
            k[a] = 2.0 * std::f64::consts::PI / box_size[a] * freq;
            nyquist[a] = n % 2 == 0 && i == n / 2;
        }
        Wavevector { k, nyquist }
    }

    pub fn k2(&self) -> f64 {
        self.k.iter().map(|k| k * k).sum()
    }

    pub fn kmag(&self) -> f64 {
        self.k2().sqrt()
    }
}

/// Inverse negative Laplacian, 1/k², zero on the k = 0 mode.
pub fn laplace_kernel(w: &Wavevector) -> Complex64 {
    let k2 = w.k2();
    if k2 == 0.0 {
        Complex64::ZERO
    } else {
        Complex64::real(1.0 / k2)
    }
}

/// Spectral derivative i·k_axis, zero on the Nyquist plane of that axis so
/// the kernel maps Hermitian fields to Hermitian fields.
pub fn diff_kernel(axis: usize) -> impl Fn(&Wavevector) -> Complex64 + Sync + Send + Copy {
    move |w: &Wavevector| {
        if w.nyquist[axis] {
            Complex64::ZERO
        } else {
            Complex64::new(0.0, w.k[axis])
        }
    }
}

// ── Fields ───────────────────────────────────────────────────────────

/// Real-space scalar field.
#[derive(Clone, Debug, PartialEq)]
pub struct RealField {
    nmesh: [usize; 3],
    box_size: [f64; 3],
    data: Vec<f64>,
}

impl RealField {
    pub fn nmesh(&self) -> [usize; 3] {
        self.nmesh
    }

    pub fn box_size(&self) -> [f64; 3] {
        self.box_size
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zeros_like(&self) -> Self {
        RealField { nmesh: self.nmesh, box_size: self.box_size, data: vec![0.0; self.data.len()] }
    }

    pub fn check_same(&self, other: &RealField, op: &str) -> Result<()> {
        if self.nmesh != other.nmesh || self.box_size != other.box_size {
            return Err(EngineError::shape(
                op,
                format!("mesh {:?} box {:?}", self.nmesh, self.box_size),
                format!("mesh {:?} box {:?}", other.nmesh, other.box_size),
            ));
        }
        Ok(())
    }

    pub fn scale_in_place(&mut self, s: f64) {
        self.data.iter_mut().for_each(|x| *x *= s);
    }

    pub fn scaled(&self, s: f64) -> Self {
        let mut out = self.clone();
        out.scale_in_place(s);
        out
    }

    /// self + s * other
    pub fn axpy(&self, s: f64, other: &RealField) -> Result<Self> {
        self.check_same(other, "axpy")?;
        let mut out = self.clone();
        out.data.iter_mut().zip(&other.data).for_each(|(a, b)| *a += s * b);
        Ok(out)
    }

    pub fn zip_map(&self, other: &RealField, op: &str, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        self.check_same(other, op)?;
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
        Ok(RealField { nmesh: self.nmesh, box_size: self.box_size, data })
    }

    pub fn dot(&self, other: &RealField) -> Result<f64> {
        self.check_same(other, "dot")?;
        Ok(self.data.iter().zip(&other.data).map(|(a, b)| a * b).sum())
    }

    /// Local sum of squares, accumulated in f64.
    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum()
    }
}

/// Fourier-space field on the full complex grid.
#[derive(Clone, Debug, PartialEq)]
pub struct ComplexField {
    nmesh: [usize; 3],
    box_size: [f64; 3],
    data: Vec<Complex64>,
}

impl ComplexField {
    pub fn nmesh(&self) -> [usize; 3] {
        self.nmesh
    }

    pub fn box_size(&self) -> [f64; 3] {
        self.box_size
    }

    pub fn values(&self) -> &[Complex64] {
        &self.data
    }

    pub fn values_mut(&mut self) -> &mut [Complex64] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn zeros_like(&self) -> Self {
        ComplexField {
            nmesh: self.nmesh,
            box_size: self.box_size,
            data: vec![Complex64::ZERO; self.data.len()],
        }
    }

    pub fn check_same(&self, other: &ComplexField, op: &str) -> Result<()> {
        if self.nmesh != other.nmesh || self.box_size != other.box_size {
            return Err(EngineError::shape(
                op,
                format!("mesh {:?} box {:?}", self.nmesh, self.box_size),
                format!("mesh {:?} box {:?}", other.nmesh, other.box_size),
            ));
        }
        Ok(())
    }

    pub fn wavevector(&self, flat: usize) -> Wavevector {
        Wavevector::at(self.nmesh, self.box_size, flat)
    }

    pub fn scale_in_place(&mut self, s: f64) {
        self.data.iter_mut().for_each(|c| *c = c.scale(s));
    }

    pub fn scaled(&self, s: f64) -> Self {
        let mut out = self.clone();
        out.scale_in_place(s);
        out
    }

    /// self + s * other
    pub fn axpy(&self, s: f64, other: &ComplexField) -> Result<Self> {
        self.check_same(other, "axpy")?;
        let mut out = self.clone();
        out.data.iter_mut().zip(&other.data).for_each(|(a, b)| *a += b.scale(s));
        Ok(out)
    }

    /// Multiply every mode by `kernel(k)`.
    pub fn apply<K>(&self, kernel: K) -> Self
    where
        K: Fn(&Wavevector) -> Complex64 + Sync,
    {
        let (nmesh, box_size) = (self.nmesh, self.box_size);
        let data = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, v)| *v * kernel(&Wavevector::at(nmesh, box_size, i)))
            .collect();
        ComplexField { nmesh, box_size, data }
    }

    /// Adjoint of `apply(kernel)`: multiply by the conjugate kernel.
    pub fn apply_conjugate<K>(&self, kernel: K) -> Self
    where
        K: Fn(&Wavevector) -> Complex64 + Sync,
    {
        self.apply(|w: &Wavevector| kernel(w).conj())
    }

    /// Real inner product sum_k Re(conj(self_k) other_k), unweighted.
    pub fn dot(&self, other: &ComplexField) -> Result<f64> {
        self.check_same(other, "dot")?;
        Ok(self.data.iter().zip(&other.data).map(|(a, b)| a.real_dot(*b)).sum())
    }

    /// Weighted inner product sum_k Re(conj(self_k) other_k) * metric(k).
    pub fn cdot<M>(&self, other: &ComplexField, metric: M) -> Result<f64>
    where
        M: Fn(&Wavevector) -> f64,
    {
        self.check_same(other, "cdot")?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .enumerate()
            .map(|(i, (a, b))| a.real_dot(*b) * metric(&self.wavevector(i)))
            .sum())
    }

    /// Gradient of `self.cdot(other, metric)` with respect to `self`, times `seed`.
    /// The caller doubles it for a self inner product.
    pub fn cdot_gradient<M>(&self, other: &ComplexField, metric: M, seed: f64) -> Result<ComplexField>
    where
        M: Fn(&Wavevector) -> f64,
    {
        self.check_same(other, "cdot_gradient")?;
        let data = other
            .data
            .iter()
            .enumerate()
            .map(|(i, b)| b.scale(metric(&other.wavevector(i)) * seed))
            .collect();
        Ok(ComplexField { nmesh: self.nmesh, box_size: self.box_size, data })
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|c| c.abs_sq()).sum()
    }
}

// ── Particle arrays ──────────────────────────────────────────────────

/// Per-particle 3-vectors: displacements, momenta, forces, or positions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleArray {
    data: Vec<[f64; 3]>,
}

impl ParticleArray {
    pub fn new(data: Vec<[f64; 3]>) -> Self {
        ParticleArray { data }
    }

    pub fn zeros(n: usize) -> Self {
        ParticleArray { data: vec![[0.0; 3]; n] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rows(&self) -> &[[f64; 3]] {
        &self.data
    }

    pub fn rows_mut(&mut self) -> &mut [[f64; 3]] {
        &mut self.data
    }

    pub fn check_same(&self, other: &ParticleArray, op: &str) -> Result<()> {
        if self.len() != other.len() {
            return Err(EngineError::shape(op, format!("{} particles", self.len()), format!("{} particles", other.len())));
        }
        Ok(())
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.len())
    }

    pub fn scale_in_place(&mut self, s: f64) {
        for row in &mut self.data {
            for v in row.iter_mut() {
                *v *= s;
            }
        }
    }

    pub fn scaled(&self, s: f64) -> Self {
        let mut out = self.clone();
        out.scale_in_place(s);
        out
    }

    /// self + s * other
    pub fn axpy(&self, s: f64, other: &ParticleArray) -> Result<Self> {
        self.check_same(other, "axpy")?;
        let mut out = self.clone();
        for (a, b) in out.data.iter_mut().zip(&other.data) {
            for d in 0..3 {
                a[d] += s * b[d];
            }
        }
        Ok(out)
    }

    pub fn column(&self, axis: usize) -> Vec<f64> {
        self.data.iter().map(|r| r[axis]).collect()
    }

    pub fn set_column(&mut self, axis: usize, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(EngineError::shape("set_column", self.len(), values.len()));
        }
        for (r, v) in self.data.iter_mut().zip(values) {
            r[axis] = *v;
        }
        Ok(())
    }

    pub fn dot(&self, other: &ParticleArray) -> Result<f64> {
        self.check_same(other, "dot")?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a[0] * b[0] + a[1] * b[1] + a[2] * b[2])
            .sum())
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|r| r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sum()
    }
}
