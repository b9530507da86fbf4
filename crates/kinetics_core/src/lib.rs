pub mod cache;
pub mod equation_engine;
pub mod error;
pub mod function;
pub mod model;
pub mod registry;
pub mod simulation;
pub mod solvers;
pub mod sort;
pub mod surrogate;
pub mod timecourse;
/// The `kinetics_core` crate resolves declarative kinetic models into an
/// evaluation plan and evaluates their right-hand side.
///
/// Key components:
/// - **Model**: named variables, parameters, derived quantities, reactions, readouts and
///   surrogates with a mutation API that invalidates the cache.
/// - **Cache**: dependency sort, derived parameter folding and the static/dynamic stoichiometry
///   split, compiled to slot indices.
/// - **Function**: callables with arity signatures, either native closures or formulas run by
///   the bytecode VM in `equation_engine`.
/// - **Solvers**: fixed-step integrators (RK4, Tsit5) driven by `simulation`.
pub mod traits;

pub use error::ModelError;
pub use function::Function;
pub use model::Model;
