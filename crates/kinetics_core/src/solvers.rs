use crate::error::ModelError;
use crate::traits::{DynamicalSystem, Steppable};

/// Classic Runge-Kutta 4th Order Solver
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Rk4 {
    fn step(
        &mut self,
        system: &mut impl DynamicalSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), ModelError> {
        let t0 = *t;
        let half = 0.5 * dt;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + half * self.k1[i];
        }
        system.apply(t0 + half, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + half * self.k2[i];
        }
        system.apply(t0 + half, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}

const C2: f64 = 0.161;
const C3: f64 = 0.327;
const C4: f64 = 0.9;
const C5: f64 = 0.9800255409045097;

const A21: f64 = 0.161;
const A31: f64 = -0.008480655492356989;
const A32: f64 = 0.335480655492357;
const A41: f64 = 2.898;
const A42: f64 = -6.359447987781783;
const A43: f64 = 4.361447987781783;
const A51: f64 = 5.325864858437957;
const A52: f64 = -11.748883564062828;
const A53: f64 = 7.495539342889693;
const A54: f64 = -0.09249506636030195;
const A61: f64 = 5.86145544294642;
const A62: f64 = -12.92096931784711;
const A63: f64 = 8.159367898576159;
const A64: f64 = -0.071584973281401;
const A65: f64 = -0.02826857949054663;

// 5th order weights
const B1: f64 = 0.09646076681806523;
const B2: f64 = 0.01;
const B3: f64 = 0.4798896504144996;
const B4: f64 = 1.379008574103742;
const B5: f64 = -3.290069515436099;
const B6: f64 = 2.324710524099774;

/// Tsitouras 5/4 Solver, fixed step.
pub struct Tsit5 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    k5: Vec<f64>,
    k6: Vec<f64>,
    tmp: Vec<f64>,
}

impl Tsit5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            k5: vec![0.0; dim],
            k6: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for Tsit5 {
    fn step(
        &mut self,
        system: &mut impl DynamicalSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), ModelError> {
        let t0 = *t;

        // k1
        system.apply(t0, state, &mut self.k1)?;

        // k2
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (A21 * self.k1[i]);
        }
        system.apply(t0 + C2 * dt, &self.tmp, &mut self.k2)?;

        // k3
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (A31 * self.k1[i] + A32 * self.k2[i]);
        }
        system.apply(t0 + C3 * dt, &self.tmp, &mut self.k3)?;

        // k4
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * (A41 * self.k1[i] + A42 * self.k2[i] + A43 * self.k3[i]);
        }
        system.apply(t0 + C4 * dt, &self.tmp, &mut self.k4)?;

        // k5
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (A51 * self.k1[i] + A52 * self.k2[i] + A53 * self.k3[i] + A54 * self.k4[i]);
        }
        system.apply(t0 + C5 * dt, &self.tmp, &mut self.k5)?;

        // k6
        for i in 0..state.len() {
            self.tmp[i] = state[i]
                + dt * (A61 * self.k1[i]
                    + A62 * self.k2[i]
                    + A63 * self.k3[i]
                    + A64 * self.k4[i]
                    + A65 * self.k5[i]);
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k6)?;

        // Update State
        for i in 0..state.len() {
            state[i] += dt
                * (B1 * self.k1[i]
                    + B2 * self.k2[i]
                    + B3 * self.k3[i]
                    + B4 * self.k4[i]
                    + B5 * self.k5[i]
                    + B6 * self.k6[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}
