use crate::error::ModelError;

/// A system of ordinary differential equations `dx/dt = f(t, x)`.
///
/// `apply` takes `&mut self` so implementors can evaluate into buffers they
/// own, and returns a `Result` because evaluation may rebuild a plan that
/// fails to resolve.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt
    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), ModelError>;
}

/// A trait for solvers that can step a system forward.
pub trait Steppable {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(
        &mut self,
        system: &mut impl DynamicalSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), ModelError>;
}
