// End-to-end driver: configuration to tapes, forward model, objective and
// its gradient with respect to the initial linear density field.
//
// Objective tape (after the evolution schedule):
//   Paint(s) -> mesh
//   Transfer(mesh) -> mesh                   if smoothing or kmax is set
//   Diff(mesh; data, sigma) -> mesh
//   Chi2(variable = mesh) -> chi2
//   Prior(dlin_k; powerspectrum) -> prior    optional
// The objective is chi2 + prior; backward seeds both with 1.

use std::sync::Arc;

use log::info;

use crate::comm::Communicator;
use crate::config::{Scheme, SimulationConfig};
use crate::cosmology::Cosmology;
use crate::engine::{environment, BackwardStats, Engine, Execution};
use crate::error::Result;
use crate::ic::linear_field;
use crate::integrator::{kick_drift_kick, lpt};
use crate::mesh::{ComplexField, ParticleArray, ParticleMesh, RealField};
use crate::operators::{evolution_table, Evolution};
use crate::registry::OperatorTable;
use crate::tape::{Params, PowerSpectrum, Tape, TapeBuilder};
use crate::value::Value;

/// Final particle state of a forward run.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Displacements from the unperturbed grid.
    pub s: ParticleArray,
    pub p: ParticleArray,
}

/// A recorded objective tape.
#[derive(Clone, Debug)]
pub struct Objective {
    tape: Tape,
    has_prior: bool,
}

impl Objective {
    pub fn tape(&self) -> &Tape {
        &self.tape
    }
}

/// Value and gradient of an objective at one linear field.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub chi2: f64,
    pub prior: f64,
    pub gradient: ComplexField,
    pub stats: BackwardStats,
}

impl Evaluation {
    pub fn value(&self) -> f64 {
        self.chi2 + self.prior
    }
}

pub struct Simulation {
    config: SimulationConfig,
    cosmology: Cosmology,
    evolution: Evolution,
    table: OperatorTable<Evolution>,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let pm = ParticleMesh::new(config.nmesh, config.box_size)?;
        let evolution = Evolution::new(pm, config.force_resolution, config.shift)?;
        let cosmology = Cosmology::new(config.omega_m, config.omega_lambda)?;
        Ok(Simulation { config, cosmology, evolution, table: evolution_table() })
    }

    pub fn with_communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.evolution = self.evolution.with_communicator(comm);
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn cosmology(&self) -> &Cosmology {
        &self.cosmology
    }

    pub fn evolution(&self) -> &Evolution {
        &self.evolution
    }

    pub fn table(&self) -> &OperatorTable<Evolution> {
        &self.table
    }

    pub fn engine(&self) -> Engine<'_, Evolution> {
        Engine::new(&self.table, &self.evolution)
    }

    /// Gaussian linear field for the configured seed.
    pub fn initial_field(&self, power: &PowerSpectrum) -> Result<ComplexField> {
        linear_field(self.evolution.pm(), power, self.config.seed)
    }

    fn schedule(&self) -> Result<TapeBuilder<'_, Evolution>> {
        let builder = TapeBuilder::new(&self.table);
        let c = &self.config;
        match c.scheme {
            Scheme::Lpt { order } => lpt(builder, &self.cosmology, c.aend, order),
            Scheme::KickDriftKick { nsteps } => kick_drift_kick(builder, &self.cosmology, c.astart, c.aend, nsteps),
        }
    }

    /// Schedule plus Paint and the optional Transfer.
    fn observation(&self) -> Result<TapeBuilder<'_, Evolution>> {
        let mut builder = self.schedule()?;
        builder.invoke("Paint", Params::new())?;
        if self.config.smoothing.is_some() || self.config.kmax.is_some() {
            let mut params = Params::new();
            if let Some(r) = self.config.smoothing {
                params.insert("smoothing", r);
            }
            if let Some(k) = self.config.kmax {
                params.insert("kmax", k);
            }
            builder.invoke("Transfer", params)?;
        }
        Ok(builder)
    }

    /// The evolution schedule alone.
    pub fn evolution_tape(&self) -> Result<Tape> {
        Ok(self.schedule()?.finish())
    }

    /// Evolve `dlin_k` to the final time.
    pub fn run(&self, dlin_k: ComplexField) -> Result<Snapshot> {
        let tape = self.evolution_tape()?;
        let exec = self.engine().forward(&tape, environment([("dlin_k", Value::Complex(dlin_k))]))?;
        Ok(Snapshot {
            s: exec.value("s")?.as_particles("run")?.clone(),
            p: exec.value("p")?.as_particles("run")?.clone(),
        })
    }

    /// Model density mesh (1 + δ, after any transfer) for `dlin_k`.
    pub fn observe(&self, dlin_k: ComplexField) -> Result<RealField> {
        let tape = self.observation()?.finish();
        let exec = self.engine().forward(&tape, environment([("dlin_k", Value::Complex(dlin_k))]))?;
        Ok(exec.value("mesh")?.as_real("observe")?.clone())
    }

    /// Record the objective against observed `data` with noise `sigma`.
    pub fn objective(&self, data: RealField, sigma: f64, prior: Option<PowerSpectrum>) -> Result<Objective> {
        let mut builder = self.observation()?;
        builder.invoke("Diff", Params::new().with("data", data).with("sigma", sigma))?;
        builder.invoke_bound("Chi2", Params::new(), &[("variable", "mesh")])?;
        let has_prior = prior.is_some();
        if let Some(power) = prior {
            builder.invoke("Prior", Params::new().with("powerspectrum", power))?;
        }
        let tape = builder.finish();
        info!("objective tape: {} invocations", tape.len());
        Ok(Objective { tape, has_prior })
    }

    fn forward_objective(&self, objective: &Objective, dlin_k: &ComplexField) -> Result<(Execution, f64, f64)> {
        let env = environment([("dlin_k", Value::Complex(dlin_k.clone()))]);
        let exec = self.engine().forward(&objective.tape, env)?;
        let chi2 = exec.value("chi2")?.as_scalar("objective")?;
        let prior = if objective.has_prior { exec.value("prior")?.as_scalar("objective")? } else { 0.0 };
        Ok((exec, chi2, prior))
    }

    /// Objective value at `dlin_k`.
    pub fn evaluate(&self, objective: &Objective, dlin_k: &ComplexField) -> Result<f64> {
        let (_, chi2, prior) = self.forward_objective(objective, dlin_k)?;
        Ok(chi2 + prior)
    }

    /// Objective value and its gradient with respect to `dlin_k`.
    pub fn gradient(&self, objective: &Objective, dlin_k: &ComplexField) -> Result<Evaluation> {
        let (exec, chi2, prior) = self.forward_objective(objective, dlin_k)?;
        let mut seeds = vec![("chi2", Value::Scalar(1.0))];
        if objective.has_prior {
            seeds.push(("prior", Value::Scalar(1.0)));
        }
        let mut grads = self.engine().backward(&objective.tape, &exec, seeds)?;
        let stats = grads.stats();
        info!(
            "objective chi2 = {chi2:.6e}, prior = {prior:.6e}; backward executed {} elided {}",
            stats.executed, stats.elided
        );
        let gradient = match grads.take("dlin_k") {
            Value::Zero => dlin_k.zeros_like(),
            g => g.as_complex("gradient")?.clone(),
        };
        Ok(Evaluation { chi2, prior, gradient, stats })
    }
}
