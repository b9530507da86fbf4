//! Fixed-step integration of a [`Model`] from its initial conditions.

use crate::model::Model;
use crate::solvers::{Rk4, Tsit5};
use crate::timecourse::TimeCourse;
use crate::traits::{DynamicalSystem, Steppable};
use anyhow::{bail, Context, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    Rk4,
    Tsit5,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSettings {
    pub solver: SolverKind,
    pub dt: f64,
    pub steps: usize,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            solver: SolverKind::Tsit5,
            dt: 0.01,
            steps: 100,
        }
    }
}

enum Stepper {
    Rk4(Rk4),
    Tsit5(Tsit5),
}

impl Stepper {
    fn new(kind: SolverKind, dim: usize) -> Self {
        match kind {
            SolverKind::Rk4 => Stepper::Rk4(Rk4::new(dim)),
            SolverKind::Tsit5 => Stepper::Tsit5(Tsit5::new(dim)),
        }
    }

    fn step(&mut self, model: &mut Model, t: &mut f64, state: &mut [f64], dt: f64) -> Result<()> {
        match self {
            Stepper::Rk4(s) => s.step(model, t, state, dt)?,
            Stepper::Tsit5(s) => s.step(model, t, state, dt)?,
        }
        Ok(())
    }
}

/// Integrates the model from `time = 0` and its initial conditions.
///
/// Returns `steps + 1` rows, one column per variable.
pub fn simulate(model: &mut Model, settings: &IntegrationSettings) -> Result<TimeCourse> {
    let dim = model.dimension();
    if dim == 0 {
        bail!("Model has no variables to integrate.");
    }
    if settings.steps == 0 {
        bail!("Simulation requires at least one integration step.");
    }
    if !(settings.dt.is_finite() && settings.dt > 0.0) {
        bail!("Step size dt must be positive and finite, got {}.", settings.dt);
    }

    model
        .resolve()
        .context("Failed to build the model before integration")?;

    let mut stepper = Stepper::new(settings.solver, dim);
    let mut state = model.initial_conditions();
    let mut t = 0.0;
    let mut time = Vec::with_capacity(settings.steps + 1);
    let mut values = DMatrix::zeros(settings.steps + 1, dim);

    time.push(t);
    values.row_mut(0).copy_from_slice(&state);
    for row in 1..=settings.steps {
        stepper
            .step(model, &mut t, &mut state, settings.dt)
            .with_context(|| format!("Integration failed at t = {t}"))?;
        time.push(t);
        values.row_mut(row).copy_from_slice(&state);
    }
    debug!(
        solver = ?settings.solver,
        steps = settings.steps,
        t_end = t,
        "integration finished"
    );

    let mut result = TimeCourse::new(time);
    for (col, name) in model.variable_names().into_iter().enumerate() {
        result.insert(name, values.column(col).into_owned())?;
    }
    Ok(result)
}
