/// Particle-mesh gravity solve.
///
/// Forward:
///   ρ        = density · paint(x)                 (unit masses on the force mesh)
///   φ_d      = c2r(∇⁻² ∂_d r2c(ρ))
///   f[:, d]  = factor · readout(φ_d, x)
///
/// Backward, for a particle seed ḡ:
///   x̄  = factor · Σ_d readout_gradient(φ_d, x, ḡ[:, d])
///      + paint_gradient(x, density · ρ̄)
///   ρ̄  = factor · Σ_d r2c_gradient(conj(∇⁻² ∂_d) · c2r_gradient(readout_mesh_gradient(x, ḡ[:, d])))
///
/// `density` rescales a fine force mesh so that the painted field has the same
/// mean as on the base mesh.

use crate::complex::Complex64;
use crate::error::Result;
use crate::mesh::{diff_kernel, laplace_kernel, Layout, ParticleArray, ParticleMesh, RealField, Wavevector};

pub(crate) fn force_kernel(d: usize) -> impl Fn(&Wavevector) -> Complex64 + Sync {
    let diff = diff_kernel(d);
    move |w: &Wavevector| laplace_kernel(w) * diff(w)
}

/// Force potential gradients φ_d for the particles in `layout`.
fn potential_gradients(fpm: &ParticleMesh, layout: &Layout, density: f64) -> Result<[RealField; 3]> {
    let mut rho = fpm.paint(layout, None)?;
    rho.scale_in_place(density);
    let rho_k = fpm.r2c(&rho)?;
    let phi = |d: usize| fpm.c2r(&rho_k.apply(force_kernel(d)));
    Ok([phi(0)?, phi(1)?, phi(2)?])
}

/// Gravitational acceleration at positions `x`.
pub fn gravity(fpm: &ParticleMesh, x: &ParticleArray, density: f64, factor: f64) -> Result<ParticleArray> {
    let layout = fpm.decompose(x);
    let phi = potential_gradients(fpm, &layout, density)?;
    let mut f = ParticleArray::zeros(x.len());
    for (d, field) in phi.iter().enumerate() {
        let column: Vec<f64> = fpm.readout(field, &layout)?.into_iter().map(|v| v * factor).collect();
        f.set_column(d, &column)?;
    }
    Ok(f)
}

/// Adjoint of `gravity` with respect to the positions, applied to `grad_f`.
pub fn gravity_gradient(
    fpm: &ParticleMesh,
    x: &ParticleArray,
    density: f64,
    factor: f64,
    grad_f: &ParticleArray,
) -> Result<ParticleArray> {
    grad_f.check_same(x, "gravity_gradient")?;
    let layout = fpm.decompose(x);
    let phi = potential_gradients(fpm, &layout, density)?;

    let mut grad_x = ParticleArray::zeros(x.len());
    let mut rho_k_bar = fpm.create_complex();
    for (d, field) in phi.iter().enumerate() {
        let seed: Vec<f64> = grad_f.column(d).into_iter().map(|g| g * factor).collect();
        grad_x = grad_x.axpy(1.0, &fpm.readout_gradient(field, &layout, &seed)?)?;
        let phi_bar = fpm.readout_mesh_gradient(&layout, &seed)?;
        let k = fpm.c2r_gradient(&phi_bar)?.apply_conjugate(force_kernel(d));
        rho_k_bar = rho_k_bar.axpy(1.0, &k)?;
    }
    let mut rho_bar = fpm.r2c_gradient(&rho_k_bar)?;
    rho_bar.scale_in_place(density);
    grad_x.axpy(1.0, &fpm.paint_gradient(&layout, &rho_bar, None)?)
}
