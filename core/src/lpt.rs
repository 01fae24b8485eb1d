/// Lagrangian perturbation theory transforms on one mesh.
///
/// Forward:
///   lpt1(δ, q)[:, d]  = readout(c2r(∇⁻² ∂_d δ), q)
///   φ_ij              = c2r(∇⁻² ∂_i ∂_j δ)
///   lpt2source(δ)     = r2c(3/7 · Σ_d [φ_{aa} φ_{bb} − φ_{ab}²]),  (a, b) = (D1[d], D2[d])
///
/// Backward: each map is linear (lpt1) or quadratic (lpt2source) in δ; the
/// adjoints below are the exact transposes, with conjugate kernels.

use crate::complex::Complex64;
use crate::error::Result;
use crate::mesh::{diff_kernel, laplace_kernel, ComplexField, Layout, ParticleArray, ParticleMesh, RealField, Wavevector};

const D1: [usize; 3] = [1, 2, 0];
const D2: [usize; 3] = [2, 0, 1];

/// ∇⁻² ∂_d
fn displacement_kernel(d: usize) -> impl Fn(&Wavevector) -> Complex64 + Sync {
    let diff = diff_kernel(d);
    move |w: &Wavevector| laplace_kernel(w) * diff(w)
}

/// ∇⁻² ∂_i ∂_j
fn hessian_kernel(i: usize, j: usize) -> impl Fn(&Wavevector) -> Complex64 + Sync {
    let (di, dj) = (diff_kernel(i), diff_kernel(j));
    move |w: &Wavevector| laplace_kernel(w) * di(w) * dj(w)
}

// ── First order ──────────────────────────────────────────────────────

/// Zel'dovich displacement of the particles in `layout`.
pub fn lpt1(pm: &ParticleMesh, dlin_k: &ComplexField, layout: &Layout) -> Result<ParticleArray> {
    let mut dx = ParticleArray::zeros(layout.len());
    for d in 0..3 {
        let field = pm.c2r(&dlin_k.apply(displacement_kernel(d)))?;
        let column = pm.readout(&field, layout)?;
        dx.set_column(d, &column)?;
    }
    Ok(dx)
}

/// Adjoint of `lpt1` with respect to the density field.
pub fn lpt1_gradient(pm: &ParticleMesh, layout: &Layout, grad_dx: &ParticleArray) -> Result<ComplexField> {
    let mut out = pm.create_complex();
    for d in 0..3 {
        let mesh = pm.readout_mesh_gradient(layout, &grad_dx.column(d))?;
        let k = pm.c2r_gradient(&mesh)?.apply_conjugate(displacement_kernel(d));
        out = out.axpy(1.0, &k)?;
    }
    Ok(out)
}

// ── Second order ─────────────────────────────────────────────────────

struct Hessian {
    diag: [RealField; 3],
    offdiag: [RealField; 3],
}

fn hessian(pm: &ParticleMesh, dlin_k: &ComplexField) -> Result<Hessian> {
    let phi = |i: usize, j: usize| pm.c2r(&dlin_k.apply(hessian_kernel(i, j)));
    Ok(Hessian {
        diag: [phi(0, 0)?, phi(1, 1)?, phi(2, 2)?],
        offdiag: [phi(D1[0], D2[0])?, phi(D1[1], D2[1])?, phi(D1[2], D2[2])?],
    })
}

/// Second-order LPT source term, in Fourier space.
pub fn lpt2source(pm: &ParticleMesh, dlin_k: &ComplexField) -> Result<ComplexField> {
    let h = hessian(pm, dlin_k)?;
    let mut source = pm.create_real();
    for d in 0..3 {
        let a = h.diag[D1[d]].values();
        let b = h.diag[D2[d]].values();
        let c = h.offdiag[d].values();
        for (((s, a), b), c) in source.values_mut().iter_mut().zip(a).zip(b).zip(c) {
            *s += a * b - c * c;
        }
    }
    source.scale_in_place(3.0 / 7.0);
    pm.r2c(&source)
}

/// Adjoint of `lpt2source` at `dlin_k`, applied to `grad_source`.
pub fn lpt2source_gradient(pm: &ParticleMesh, dlin_k: &ComplexField, grad_source: &ComplexField) -> Result<ComplexField> {
    let h = hessian(pm, dlin_k)?;
    let mut s_bar = pm.r2c_gradient(grad_source)?;
    s_bar.scale_in_place(3.0 / 7.0);

    // Transpose of δ ↦ c2r(K_ij δ), applied to the real field `r`.
    let transpose = |i: usize, j: usize, r: &RealField| -> Result<ComplexField> {
        Ok(pm.c2r_gradient(r)?.apply_conjugate(hessian_kernel(i, j)))
    };
    let times = |a: &RealField, scale: f64| s_bar.zip_map(a, "lpt2source_gradient", |s, a| s * a * scale);

    let mut out = pm.create_complex();
    for d in 0..3 {
        let (i, j) = (D1[d], D2[d]);
        out = out.axpy(1.0, &transpose(i, i, &times(&h.diag[j], 1.0)?)?)?;
        out = out.axpy(1.0, &transpose(j, j, &times(&h.diag[i], 1.0)?)?)?;
        out = out.axpy(1.0, &transpose(i, j, &times(&h.offdiag[d], -2.0)?)?)?;
    }
    Ok(out)
}
