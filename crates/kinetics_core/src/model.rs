//! Declarative kinetic model.
//!
//! A [`Model`] holds named variables, parameters, derived quantities,
//! reactions, readouts and surrogates in one namespace. Mutations edit the
//! declarative dictionaries and mark the [`CacheState`] dirty;
//! reads rebuild the [`ModelCache`] on demand and evaluate through it.
//!
//! ```
//! use kinetics_core::function::Function;
//! use kinetics_core::model::Model;
//!
//! let mut model = Model::new();
//! model
//!     .add_parameter("k", 2.0)?
//!     .add_variable("A", 1.0)?
//!     .add_variable("B", 0.0)?
//!     .add_reaction(
//!         "v1",
//!         Function::expression(&["k", "a"], "k * a")?,
//!         &["k", "A"],
//!         [("A", -1.0), ("B", 1.0)],
//!     )?;
//!
//! assert_eq!(model.derivative(0.0, &[1.0, 0.0])?, &[-2.0, 2.0]);
//! # Ok::<(), kinetics_core::error::ModelError>(())
//! ```

use crate::cache::{CacheState, ModelCache, StoichiometryMatrix};
use crate::error::ModelError;
use crate::function::Function;
use crate::registry::{Category, Registry};
use crate::surrogate::{Surrogate, SurrogateStoichiometry};
use crate::timecourse::TimeCourse;
use crate::traits::DynamicalSystem;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A named value computed from other named values.
#[derive(Debug, Clone)]
pub struct Derived {
    pub function: Function,
    pub args: Vec<String>,
}

impl Derived {
    pub fn new(function: Function, args: &[&str]) -> Self {
        Self {
            function,
            args: to_names(args),
        }
    }
}

/// Readouts share the shape of derived quantities but are only computed on
/// demand and never feed the right-hand side.
pub type Readout = Derived;

/// Stoichiometric coefficient of one compound in one reaction.
#[derive(Debug, Clone)]
pub enum Coefficient {
    Constant(f64),
    /// Folded to a constant at cache build when all arguments are
    /// parameters, otherwise evaluated at every call.
    Formula(Derived),
}

impl From<f64> for Coefficient {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

impl From<Derived> for Coefficient {
    fn from(derived: Derived) -> Self {
        Self::Formula(derived)
    }
}

/// The coefficient equals the named quantity.
impl From<&str> for Coefficient {
    fn from(name: &str) -> Self {
        Self::Formula(Derived::new(Function::identity(), &[name]))
    }
}

#[derive(Debug, Clone)]
pub struct Reaction {
    pub function: Function,
    pub args: Vec<String>,
    pub stoichiometry: IndexMap<String, Coefficient>,
}

/// A surrogate together with the inputs and stoichiometry the model binds
/// to it.
#[derive(Clone)]
pub struct SurrogateEntry {
    pub surrogate: Arc<dyn Surrogate>,
    pub args: Vec<String>,
    pub stoichiometries: SurrogateStoichiometry,
}

impl fmt::Debug for SurrogateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurrogateEntry")
            .field("args", &self.args)
            .field("stoichiometries", &self.stoichiometries)
            .finish_non_exhaustive()
    }
}

fn to_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn to_stoichiometry<I, S, C>(entries: I) -> IndexMap<String, Coefficient>
where
    I: IntoIterator<Item = (S, C)>,
    S: Into<String>,
    C: Into<Coefficient>,
{
    entries
        .into_iter()
        .map(|(cpd, c)| (cpd.into(), c.into()))
        .collect()
}

#[derive(Default)]
pub struct Model {
    pub(crate) ids: Registry,
    pub(crate) variables: IndexMap<String, f64>,
    pub(crate) parameters: IndexMap<String, f64>,
    pub(crate) derived: IndexMap<String, Derived>,
    pub(crate) readouts: IndexMap<String, Readout>,
    pub(crate) reactions: IndexMap<String, Reaction>,
    pub(crate) surrogates: IndexMap<String, SurrogateEntry>,
    cache: CacheState,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Cache ---

    /// Marks the cache stale. Called by every mutation.
    pub fn invalidate(&mut self) {
        if self.cache.invalidate() {
            trace!("model cache invalidated");
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.cache.is_resolved()
    }

    /// Builds the cache if it is stale. A failed build leaves it stale.
    pub fn resolve(&mut self) -> Result<&mut ModelCache, ModelError> {
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => Box::new(ModelCache::build(self)?),
        };
        Ok(self.cache.install(cache))
    }

    // --- Ids ---

    /// Every registered name and its category, in insertion order.
    pub fn ids(&self) -> &IndexMap<String, Category> {
        self.ids.ids()
    }

    // --- Parameters ---

    pub fn parameters(&self) -> &IndexMap<String, f64> {
        &self.parameters
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }

    pub fn add_parameter(&mut self, name: &str, value: f64) -> Result<&mut Self, ModelError> {
        self.ids.insert(name, Category::Parameter)?;
        self.invalidate();
        self.parameters.insert(name.to_string(), value);
        Ok(self)
    }

    /// Adds all parameters or none.
    pub fn add_parameters(&mut self, parameters: &[(&str, f64)]) -> Result<&mut Self, ModelError> {
        self.check_all_free(parameters.iter().map(|(name, _)| *name), Category::Parameter)?;
        for &(name, value) in parameters {
            self.add_parameter(name, value)?;
        }
        Ok(self)
    }

    pub fn remove_parameter(&mut self, name: &str) -> Result<&mut Self, ModelError> {
        self.ids.remove(name, Category::Parameter)?;
        self.invalidate();
        self.parameters.shift_remove(name);
        Ok(self)
    }

    pub fn remove_parameters(&mut self, names: &[&str]) -> Result<&mut Self, ModelError> {
        for name in names {
            self.ids.check_registered(name, Category::Parameter)?;
        }
        for name in names {
            self.remove_parameter(name)?;
        }
        Ok(self)
    }

    pub fn update_parameter(&mut self, name: &str, value: f64) -> Result<&mut Self, ModelError> {
        let slot = self
            .parameters
            .get_mut(name)
            .ok_or_else(|| not_found(name, Category::Parameter))?;
        *slot = value;
        self.invalidate();
        Ok(self)
    }

    pub fn update_parameters(
        &mut self,
        parameters: &[(&str, f64)],
    ) -> Result<&mut Self, ModelError> {
        for (name, _) in parameters {
            self.ids.check_registered(name, Category::Parameter)?;
        }
        for &(name, value) in parameters {
            self.update_parameter(name, value)?;
        }
        Ok(self)
    }

    pub fn scale_parameter(&mut self, name: &str, factor: f64) -> Result<&mut Self, ModelError> {
        let value = *self
            .parameters
            .get(name)
            .ok_or_else(|| not_found(name, Category::Parameter))?;
        self.update_parameter(name, value * factor)
    }

    pub fn scale_parameters(&mut self, factors: &[(&str, f64)]) -> Result<&mut Self, ModelError> {
        for (name, _) in factors {
            self.ids.check_registered(name, Category::Parameter)?;
        }
        for &(name, factor) in factors {
            self.scale_parameter(name, factor)?;
        }
        Ok(self)
    }

    /// Turns a parameter into a variable, optionally inserting it into the
    /// stoichiometry of existing reactions or surrogate outputs.
    pub fn make_parameter_dynamic(
        &mut self,
        name: &str,
        initial_value: Option<f64>,
        stoichiometries: &[(&str, f64)],
    ) -> Result<&mut Self, ModelError> {
        let current = *self
            .parameters
            .get(name)
            .ok_or_else(|| not_found(name, Category::Parameter))?;
        for (flux, _) in stoichiometries {
            let known = self.reactions.contains_key(*flux)
                || self
                    .surrogates
                    .values()
                    .any(|s| s.stoichiometries.contains_key(*flux));
            if !known {
                return Err(not_found(flux, Category::Reaction));
            }
        }

        self.remove_parameter(name)?;
        self.add_variable(name, initial_value.unwrap_or(current))?;
        for &(flux, coefficient) in stoichiometries {
            if let Some(rxn) = self.reactions.get_mut(flux) {
                rxn.stoichiometry
                    .insert(name.to_string(), Coefficient::Constant(coefficient));
            } else {
                for entry in self.surrogates.values_mut() {
                    if let Some(by_compound) = entry.stoichiometries.get_mut(flux) {
                        by_compound.insert(name.to_string(), coefficient);
                    }
                }
            }
        }
        Ok(self)
    }

    // --- Variables ---

    pub fn variables(&self) -> &IndexMap<String, f64> {
        &self.variables
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    pub fn initial_conditions(&self) -> Vec<f64> {
        self.variables.values().copied().collect()
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        initial_condition: f64,
    ) -> Result<&mut Self, ModelError> {
        self.ids.insert(name, Category::Variable)?;
        self.invalidate();
        self.variables.insert(name.to_string(), initial_condition);
        Ok(self)
    }

    pub fn add_variables(&mut self, variables: &[(&str, f64)]) -> Result<&mut Self, ModelError> {
        self.check_all_free(variables.iter().map(|(name, _)| *name), Category::Variable)?;
        for &(name, value) in variables {
            self.add_variable(name, value)?;
        }
        Ok(self)
    }

    pub fn remove_variable(&mut self, name: &str) -> Result<&mut Self, ModelError> {
        self.ids.remove(name, Category::Variable)?;
        self.invalidate();
        self.variables.shift_remove(name);
        Ok(self)
    }

    pub fn remove_variables(&mut self, names: &[&str]) -> Result<&mut Self, ModelError> {
        for name in names {
            self.ids.check_registered(name, Category::Variable)?;
        }
        for name in names {
            self.remove_variable(name)?;
        }
        Ok(self)
    }

    pub fn update_variable(
        &mut self,
        name: &str,
        initial_condition: f64,
    ) -> Result<&mut Self, ModelError> {
        let slot = self
            .variables
            .get_mut(name)
            .ok_or_else(|| not_found(name, Category::Variable))?;
        *slot = initial_condition;
        self.invalidate();
        Ok(self)
    }

    /// Turns a variable into a parameter and drops it from every reaction
    /// and surrogate stoichiometry.
    pub fn make_variable_static(
        &mut self,
        name: &str,
        value: Option<f64>,
    ) -> Result<&mut Self, ModelError> {
        let current = *self
            .variables
            .get(name)
            .ok_or_else(|| not_found(name, Category::Variable))?;
        self.remove_variable(name)?;
        self.add_parameter(name, value.unwrap_or(current))?;
        for rxn in self.reactions.values_mut() {
            rxn.stoichiometry.shift_remove(name);
        }
        for entry in self.surrogates.values_mut() {
            for by_compound in entry.stoichiometries.values_mut() {
                by_compound.shift_remove(name);
            }
        }
        Ok(self)
    }

    // --- Derived ---

    pub fn derived(&self) -> &IndexMap<String, Derived> {
        &self.derived
    }

    pub fn add_derived(
        &mut self,
        name: &str,
        function: Function,
        args: &[&str],
    ) -> Result<&mut Self, ModelError> {
        self.ids.insert(name, Category::Derived)?;
        self.invalidate();
        self.derived.insert(name.to_string(), Derived::new(function, args));
        Ok(self)
    }

    /// Replaces the function and/or arguments; `None` keeps the current one.
    pub fn update_derived(
        &mut self,
        name: &str,
        function: Option<Function>,
        args: Option<&[&str]>,
    ) -> Result<&mut Self, ModelError> {
        let derived = self
            .derived
            .get_mut(name)
            .ok_or_else(|| not_found(name, Category::Derived))?;
        if let Some(function) = function {
            derived.function = function;
        }
        if let Some(args) = args {
            derived.args = to_names(args);
        }
        self.invalidate();
        Ok(self)
    }

    pub fn remove_derived(&mut self, name: &str) -> Result<&mut Self, ModelError> {
        self.ids.remove(name, Category::Derived)?;
        self.invalidate();
        self.derived.shift_remove(name);
        Ok(self)
    }

    /// Derived quantities that depend on parameters only.
    pub fn derived_parameters(&mut self) -> Result<IndexMap<String, Derived>, ModelError> {
        let names = self.resolve()?.derived_parameter_names().to_vec();
        Ok(self.select_derived(names))
    }

    /// Derived quantities that depend on state or time.
    pub fn derived_variables(&mut self) -> Result<IndexMap<String, Derived>, ModelError> {
        let names = self.resolve()?.derived_variable_names().to_vec();
        Ok(self.select_derived(names))
    }

    pub fn derived_parameter_names(&mut self) -> Result<Vec<String>, ModelError> {
        Ok(self.resolve()?.derived_parameter_names().to_vec())
    }

    pub fn derived_variable_names(&mut self) -> Result<Vec<String>, ModelError> {
        Ok(self.resolve()?.derived_variable_names().to_vec())
    }

    fn select_derived(&self, names: Vec<String>) -> IndexMap<String, Derived> {
        names
            .into_iter()
            .filter_map(|name| {
                let derived = self.derived.get(&name)?.clone();
                Some((name, derived))
            })
            .collect()
    }

    /// Parameters together with the folded values of derived parameters.
    pub fn all_parameter_values(&mut self) -> Result<IndexMap<String, f64>, ModelError> {
        Ok(self.resolve()?.parameter_values().clone())
    }

    // --- Reactions ---

    pub fn reactions(&self) -> &IndexMap<String, Reaction> {
        &self.reactions
    }

    pub fn reaction_names(&self) -> Vec<String> {
        self.reactions.keys().cloned().collect()
    }

    pub fn add_reaction<I, S, C>(
        &mut self,
        name: &str,
        function: Function,
        args: &[&str],
        stoichiometry: I,
    ) -> Result<&mut Self, ModelError>
    where
        I: IntoIterator<Item = (S, C)>,
        S: Into<String>,
        C: Into<Coefficient>,
    {
        self.ids.insert(name, Category::Reaction)?;
        self.invalidate();
        self.reactions.insert(
            name.to_string(),
            Reaction {
                function,
                args: to_names(args),
                stoichiometry: to_stoichiometry(stoichiometry),
            },
        );
        Ok(self)
    }

    /// Replaces any of function, arguments or stoichiometry.
    pub fn update_reaction(
        &mut self,
        name: &str,
        function: Option<Function>,
        args: Option<&[&str]>,
        stoichiometry: Option<IndexMap<String, Coefficient>>,
    ) -> Result<&mut Self, ModelError> {
        let rxn = self
            .reactions
            .get_mut(name)
            .ok_or_else(|| not_found(name, Category::Reaction))?;
        if let Some(function) = function {
            rxn.function = function;
        }
        if let Some(args) = args {
            rxn.args = to_names(args);
        }
        if let Some(stoichiometry) = stoichiometry {
            rxn.stoichiometry = stoichiometry;
        }
        self.invalidate();
        Ok(self)
    }

    pub fn remove_reaction(&mut self, name: &str) -> Result<&mut Self, ModelError> {
        self.ids.remove(name, Category::Reaction)?;
        self.invalidate();
        self.reactions.shift_remove(name);
        Ok(self)
    }

    // --- Readouts ---

    pub fn readouts(&self) -> &IndexMap<String, Readout> {
        &self.readouts
    }

    pub fn readout_names(&self) -> Vec<String> {
        self.readouts.keys().cloned().collect()
    }

    pub fn add_readout(
        &mut self,
        name: &str,
        function: Function,
        args: &[&str],
    ) -> Result<&mut Self, ModelError> {
        self.ids.insert(name, Category::Readout)?;
        self.invalidate();
        self.readouts.insert(name.to_string(), Derived::new(function, args));
        Ok(self)
    }

    pub fn remove_readout(&mut self, name: &str) -> Result<&mut Self, ModelError> {
        self.ids.remove(name, Category::Readout)?;
        self.invalidate();
        self.readouts.shift_remove(name);
        Ok(self)
    }

    // --- Surrogates ---

    pub fn surrogates(&self) -> &IndexMap<String, SurrogateEntry> {
        &self.surrogates
    }

    /// Registers a surrogate. `args` and `stoichiometries` override the
    /// ones the surrogate declares.
    pub fn add_surrogate(
        &mut self,
        name: &str,
        surrogate: Arc<dyn Surrogate>,
        args: Option<&[&str]>,
        stoichiometries: Option<SurrogateStoichiometry>,
    ) -> Result<&mut Self, ModelError> {
        self.ids.insert(name, Category::Surrogate)?;
        self.invalidate();
        let entry = SurrogateEntry {
            args: args.map_or_else(|| surrogate.args().to_vec(), to_names),
            stoichiometries: stoichiometries.unwrap_or_else(|| surrogate.stoichiometries().clone()),
            surrogate,
        };
        self.surrogates.insert(name.to_string(), entry);
        Ok(self)
    }

    /// Swaps the surrogate and/or rebinds its inputs and stoichiometry.
    pub fn update_surrogate(
        &mut self,
        name: &str,
        surrogate: Option<Arc<dyn Surrogate>>,
        args: Option<&[&str]>,
        stoichiometries: Option<SurrogateStoichiometry>,
    ) -> Result<&mut Self, ModelError> {
        let entry = self
            .surrogates
            .get_mut(name)
            .ok_or_else(|| not_found(name, Category::Surrogate))?;
        if let Some(surrogate) = surrogate {
            entry.surrogate = surrogate;
        }
        if let Some(args) = args {
            entry.args = to_names(args);
        }
        if let Some(stoichiometries) = stoichiometries {
            entry.stoichiometries = stoichiometries;
        }
        self.invalidate();
        Ok(self)
    }

    pub fn remove_surrogate(&mut self, name: &str) -> Result<&mut Self, ModelError> {
        self.ids.remove(name, Category::Surrogate)?;
        self.invalidate();
        self.surrogates.shift_remove(name);
        Ok(self)
    }

    // --- Evaluation ---

    /// State vector in variable order, overlaying named concentrations on
    /// the initial conditions.
    fn state_vector(
        &self,
        concs: Option<&IndexMap<String, f64>>,
    ) -> Result<Vec<f64>, ModelError> {
        let Some(concs) = concs else {
            return Ok(self.initial_conditions());
        };
        if let Some(unknown) = concs.keys().find(|name| !self.variables.contains_key(*name)) {
            return Err(not_found(unknown, Category::Variable));
        }
        Ok(self
            .variables
            .iter()
            .map(|(name, &initial)| concs.get(name).copied().unwrap_or(initial))
            .collect())
    }

    /// Full argument environment: parameters, derived parameters,
    /// concentrations, time, derived variables and optionally readouts.
    pub fn args(
        &mut self,
        concs: Option<&IndexMap<String, f64>>,
        time: f64,
        include_readouts: bool,
    ) -> Result<IndexMap<String, f64>, ModelError> {
        let state = self.state_vector(concs)?;
        self.resolve()?.environment(time, &state, include_readouts)
    }

    /// Column-wise [`Model::args`] over a concentration table.
    pub fn args_time_course(
        &mut self,
        concs: &TimeCourse,
        include_readouts: bool,
    ) -> Result<TimeCourse, ModelError> {
        self.resolve()?.environment_time_course(concs, include_readouts)
    }

    /// Variables, derived variables and optionally readouts.
    pub fn full_concs(
        &mut self,
        concs: Option<&IndexMap<String, f64>>,
        time: f64,
        include_readouts: bool,
    ) -> Result<IndexMap<String, f64>, ModelError> {
        let mut args = self.args(concs, time, include_readouts)?;
        let mut names = self.variable_names();
        names.extend(self.derived_variable_names()?);
        if include_readouts {
            names.extend(self.readout_names());
        }
        Ok(names
            .into_iter()
            .filter_map(|name| {
                let value = args.shift_remove(&name)?;
                Some((name, value))
            })
            .collect())
    }

    pub fn fluxes(
        &mut self,
        concs: Option<&IndexMap<String, f64>>,
        time: f64,
    ) -> Result<IndexMap<String, f64>, ModelError> {
        let state = self.state_vector(concs)?;
        self.resolve()?.fluxes(time, &state)
    }

    pub fn fluxes_time_course(&mut self, concs: &TimeCourse) -> Result<TimeCourse, ModelError> {
        self.resolve()?.fluxes_time_course(concs)
    }

    /// Stoichiometry with state-dependent coefficients evaluated at the
    /// given point.
    pub fn stoichiometries(
        &mut self,
        concs: Option<&IndexMap<String, f64>>,
        time: f64,
    ) -> Result<StoichiometryMatrix, ModelError> {
        let state = self.state_vector(concs)?;
        self.resolve()?.stoichiometries(time, &state)
    }

    /// The vector field evaluated at `(time, concs)`, `concs` ordered like
    /// [`Model::variable_names`]. The slice borrows the cache's buffer.
    pub fn derivative(&mut self, time: f64, concs: &[f64]) -> Result<&[f64], ModelError> {
        self.resolve()?.derivative(time, concs)
    }

    /// Named right-hand side.
    pub fn right_hand_side(
        &mut self,
        concs: Option<&IndexMap<String, f64>>,
        time: f64,
    ) -> Result<IndexMap<String, f64>, ModelError> {
        let state = self.state_vector(concs)?;
        let cache = self.resolve()?;
        let dxdt = cache.derivative(time, &state)?.to_vec();
        Ok(cache.var_names().iter().cloned().zip(dxdt).collect())
    }

    /// Checks a batch before any of it is inserted. A name repeated within
    /// the batch conflicts with its own first occurrence.
    fn check_all_free<'a>(
        &self,
        names: impl Iterator<Item = &'a str>,
        category: Category,
    ) -> Result<(), ModelError> {
        let mut seen = HashSet::new();
        for name in names {
            self.ids.check_free(name)?;
            if !seen.insert(name) {
                return Err(ModelError::NameConflict {
                    name: name.to_string(),
                    existing: Some(category),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("variables", &self.variables)
            .field("parameters", &self.parameters)
            .field("derived", &self.derived)
            .field("readouts", &self.readouts)
            .field("reactions", &self.reactions)
            .field("surrogates", &self.surrogates)
            .field("resolved", &self.cache.is_resolved())
            .finish()
    }
}

fn not_found(name: &str, category: Category) -> ModelError {
    ModelError::NameNotFound {
        name: name.to_string(),
        category,
    }
}

impl DynamicalSystem for Model {
    fn dimension(&self) -> usize {
        self.variables.len()
    }

    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), ModelError> {
        let dxdt = self.derivative(t, x)?;
        if out.len() != dxdt.len() {
            return Err(ModelError::DimensionMismatch {
                expected: dxdt.len(),
                actual: out.len(),
            });
        }
        out.copy_from_slice(dxdt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surrogate::LinearSurrogate;
    use nalgebra::{DMatrix, DVector};

    fn mass_action() -> Function {
        Function::new(2, |x| x[0] * x[1])
    }

    /// `A -> B` at rate `k * A`.
    fn conversion(k: f64) -> Model {
        let mut model = Model::new();
        model
            .add_parameter("k", k)
            .and_then(|m| m.add_variable("A", 1.0))
            .and_then(|m| m.add_variable("B", 0.0))
            .and_then(|m| {
                m.add_reaction("v1", mass_action(), &["k", "A"], [("A", -1.0), ("B", 1.0)])
            })
            .expect("valid model");
        model
    }

    fn concs(values: &[(&str, f64)]) -> IndexMap<String, f64> {
        values.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    fn stoich(entries: &[(&str, &[(&str, f64)])]) -> SurrogateStoichiometry {
        entries
            .iter()
            .map(|(flux, by_cpd)| (flux.to_string(), concs(by_cpd)))
            .collect()
    }

    fn halving_surrogate(
        outputs: &[&str],
        stoichiometries: SurrogateStoichiometry,
    ) -> Arc<dyn Surrogate> {
        let n = outputs.len();
        let mut bias = DVector::<f64>::zeros(n);
        if n > 1 {
            bias[1] = 10.0;
        }
        let surrogate = LinearSurrogate::new(
            vec!["A".to_string()],
            to_names(outputs),
            DMatrix::from_element(n, 1, 0.5),
            bias,
            stoichiometries,
        )
        .expect("shapes agree");
        Arc::new(surrogate)
    }

    /// Declares an output it never predicts.
    struct Silent {
        stoichiometries: SurrogateStoichiometry,
    }

    impl Surrogate for Silent {
        fn args(&self) -> &[String] {
            &[]
        }

        fn stoichiometries(&self) -> &SurrogateStoichiometry {
            &self.stoichiometries
        }

        fn predict(&self, _inputs: &[f64]) -> IndexMap<String, f64> {
            IndexMap::new()
        }
    }

    #[test]
    fn conversion_right_hand_side() {
        let mut model = conversion(2.0);
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("evaluates"), &[-2.0, 2.0]);

        let fluxes = model.fluxes(None, 0.0).expect("fluxes");
        assert_eq!(fluxes["v1"], 2.0);

        let rhs = model.right_hand_side(None, 0.0).expect("rhs");
        assert_eq!(rhs.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(rhs["A"], -2.0);
        assert_eq!(rhs["B"], 2.0);
    }

    #[test]
    fn names_are_unique_across_categories() {
        let mut model = conversion(2.0);
        let err = model.add_variable("k", 1.0).expect_err("k is a parameter");
        assert!(matches!(
            err,
            ModelError::NameConflict {
                existing: Some(Category::Parameter),
                ..
            }
        ));
        let err = model.add_parameter("time", 0.0).expect_err("reserved");
        assert!(matches!(err, ModelError::NameConflict { existing: None, .. }));
        let err = model
            .add_readout("v1", Function::identity(), &["A"])
            .expect_err("v1 is a reaction");
        assert!(err.to_string().contains("reaction called 'v1'"));

        assert_eq!(model.variable_names(), vec!["A", "B"]);
        assert_eq!(model.ids().len(), 4);
    }

    #[test]
    fn batch_adds_are_all_or_nothing() {
        let mut model = conversion(2.0);
        model
            .add_parameters(&[("a", 1.0), ("k", 3.0)])
            .expect_err("k exists");
        assert!(!model.parameters().contains_key("a"));

        model
            .add_variables(&[("C", 1.0), ("C", 2.0)])
            .expect_err("repeated within batch");
        assert!(!model.variables().contains_key("C"));

        model
            .add_parameters(&[("a", 1.0), ("b", 2.0)])
            .expect("fresh names");
        assert_eq!(model.parameter_names(), vec!["k", "a", "b"]);
    }

    #[test]
    fn removal_checks_category() {
        let mut model = conversion(2.0);
        let err = model.remove_variable("k").expect_err("k is a parameter");
        assert!(matches!(
            err,
            ModelError::NameNotFound {
                category: Category::Variable,
                ..
            }
        ));
        model
            .remove_parameters(&["k", "missing"])
            .expect_err("one name is unknown");
        assert!(model.parameters().contains_key("k"));
    }

    #[test]
    fn derived_quantities_split_into_parameters_and_variables() {
        let mut model = Model::new();
        model
            .add_parameter("k1", 2.0)
            .and_then(|m| m.add_variable("A", 1.0))
            .and_then(|m| m.add_derived("d2", Function::variadic(|x| x.iter().sum()), &["A", "d1"]))
            .and_then(|m| m.add_derived("d1", Function::new(1, |x| 3.0 * x[0]), &["k1"]))
            .and_then(|m| m.add_derived("d3", mass_action(), &["time", "k1"]))
            .expect("valid model");

        assert_eq!(model.derived_parameter_names().expect("sorts"), vec!["d1"]);
        assert_eq!(model.derived_variable_names().expect("sorts"), vec!["d3", "d2"]);
        assert_eq!(
            model.derived_parameters().expect("sorts").keys().collect::<Vec<_>>(),
            vec!["d1"]
        );
        assert_eq!(model.all_parameter_values().expect("sorts")["d1"], 6.0);

        let args = model.args(None, 1.5, false).expect("args");
        assert_eq!(
            args.keys().collect::<Vec<_>>(),
            vec!["k1", "d1", "A", "time", "d3", "d2"]
        );
        assert_eq!(args["d2"], 7.0);
        assert_eq!(args["d3"], 3.0);

        model.update_parameter("k1", 3.0).expect("k1 exists");
        assert!(!model.is_resolved());
        let args = model.args(None, 0.0, false).expect("args");
        assert_eq!(args["d1"], 9.0);
        assert_eq!(args["d2"], 10.0);
    }

    #[test]
    fn cycles_fail_at_rebuild_and_leave_cache_dirty() {
        let mut model = conversion(2.0);
        model
            .add_derived("d1", Function::new(1, |x| x[0]), &["d2"])
            .and_then(|m| m.add_derived("d2", Function::new(1, |x| x[0]), &["d1"]))
            .expect("cycles are only detected at rebuild");
        let err = model.derivative(0.0, &[1.0, 0.0]).expect_err("cycle");
        assert!(matches!(err, ModelError::Sort(_)));
        assert!(!model.is_resolved());

        model.remove_derived("d2").expect("exists");
        model.update_derived("d1", None, Some(&["k"])).expect("exists");
        assert_eq!(model.args(None, 0.0, false).expect("acyclic")["d1"], 2.0);
    }

    #[test]
    fn arity_is_checked_at_rebuild() {
        let mut model = Model::new();
        model
            .add_parameter("k", 2.0)
            .and_then(|m| m.add_variable("A", 1.0))
            .and_then(|m| m.add_reaction("v1", mass_action(), &["k"], [("A", -1.0)]))
            .expect("arity is not checked on add");

        let err = model.fluxes(None, 0.0).expect_err("one argument for two");
        match err {
            ModelError::ArityMismatch(mismatch) => {
                assert_eq!(mismatch.name, "v1");
                assert_eq!(mismatch.model_args, vec!["k"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        model
            .update_reaction("v1", None, Some(&["k", "A"]), None)
            .expect("v1 exists");
        assert_eq!(model.fluxes(None, 0.0).expect("fluxes")["v1"], 2.0);
    }

    #[test]
    fn derived_arity_is_checked_at_rebuild() {
        let mut model = conversion(2.0);
        model
            .add_derived("d", mass_action(), &["k"])
            .expect("registration does not check arity");
        let err = model.resolve().err().expect("two parameters for one name");
        assert!(matches!(err, ModelError::ArityMismatch(m) if m.name == "d"));
        assert!(!model.is_resolved());
    }

    #[test]
    fn stoichiometry_splits_into_static_and_dynamic() {
        let mut model = Model::new();
        model
            .add_parameter("k", 1.5)
            .and_then(|m| m.add_variables(&[("A", 1.0), ("B", 0.0), ("C", 0.0), ("D", 0.0)]))
            .expect("valid names");
        let doubled = Function::new(1, |x| 2.0 * x[0]);
        model
            .add_reaction(
                "v1",
                mass_action(),
                &["k", "A"],
                [
                    ("A", Coefficient::from(-1.0)),
                    ("B", Derived::new(doubled.clone(), &["k"]).into()),
                    ("C", Derived::new(doubled, &["A"]).into()),
                    ("D", Coefficient::from("k")),
                ],
            )
            .expect("valid reaction");

        let cache = model.resolve().expect("resolves");
        let fixed = cache.static_stoichiometries();
        assert_eq!(fixed["A"]["v1"], -1.0);
        assert_eq!(fixed["B"]["v1"], 3.0);
        assert_eq!(fixed["D"]["v1"], 1.5);
        assert!(!fixed["C"].contains_key("v1"));
        assert!(cache.dynamic_stoichiometries()["C"].contains_key("v1"));

        let x = model.initial_conditions();
        assert_eq!(
            model.derivative(0.0, &x).expect("evaluates"),
            &[-1.5, 4.5, 3.0, 2.25]
        );
        let matrix = model
            .stoichiometries(Some(&concs(&[("A", 2.0), ("B", 0.0), ("C", 0.0), ("D", 0.0)])), 0.0)
            .expect("evaluates");
        assert_eq!(matrix.get("C", "v1"), Some(4.0));
        assert_eq!(matrix.get("B", "v1"), Some(3.0));
    }

    #[test]
    fn stoichiometry_must_name_variables() {
        let mut model = conversion(2.0);
        model
            .update_reaction("v1", None, None, Some(to_stoichiometry([("k", -1.0)])))
            .expect("v1 exists");
        let err = model.derivative(0.0, &[1.0, 0.0]).expect_err("k is a parameter");
        assert!(matches!(err, ModelError::UndefinedReference { .. }));
    }

    #[test]
    fn repeated_evaluation_is_bit_identical() {
        let mut model = conversion(0.3);
        model
            .add_derived(
                "d",
                Function::expression(&["a", "t"], "exp(-a) * t").expect("parses"),
                &["A", "time"],
            )
            .expect("free name");
        let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        let first = bits(model.derivative(0.7, &[0.4, 0.1]).expect("evaluates"));
        model.fluxes(None, 3.0).expect("fluxes in between");
        let second = bits(model.derivative(0.7, &[0.4, 0.1]).expect("evaluates"));
        assert_eq!(first, second);
        assert_eq!(
            model.args(None, 0.7, false).expect("args"),
            model.args(None, 0.7, false).expect("args")
        );
    }

    #[test]
    fn every_mutation_invalidates_the_cache() {
        let mut model = conversion(2.0);
        model.resolve().expect("resolves");
        model
            .add_readout("total", Function::variadic(|x| x.iter().sum()), &["A", "B"])
            .expect("free");
        assert!(!model.is_resolved());

        model.resolve().expect("resolves");
        model.scale_parameter("k", 0.5).expect("k exists");
        assert!(!model.is_resolved());
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("evaluates"), &[-1.0, 1.0]);

        model.remove_readout("total").expect("exists");
        assert!(!model.is_resolved());

        model.resolve().expect("resolves");
        model.invalidate();
        assert!(!model.is_resolved());
    }

    #[test]
    fn map_concentrations_are_checked() {
        let mut model = conversion(2.0);
        assert_eq!(
            model.fluxes(Some(&concs(&[("A", 3.0), ("B", 0.0)])), 0.0).expect("fluxes")["v1"],
            6.0
        );

        let err = model
            .fluxes(Some(&concs(&[("A", 3.0), ("B", 0.0), ("Z", 1.0)])), 0.0)
            .expect_err("Z is unknown");
        assert!(matches!(
            err,
            ModelError::NameNotFound {
                category: Category::Variable,
                ..
            }
        ));
        let partial = model
            .fluxes(Some(&concs(&[("A", 3.0)])), 0.0)
            .expect("B falls back to its initial condition");
        assert_eq!(partial["v1"], 6.0);
        let args = model
            .args(Some(&concs(&[("B", 0.25)])), 0.0, false)
            .expect("A falls back to its initial condition");
        assert_eq!(args["A"], 1.0);
        assert_eq!(args["B"], 0.25);

        let err = model.derivative(0.0, &[1.0]).expect_err("short state");
        assert!(matches!(err, ModelError::DimensionMismatch { expected: 2, actual: 1 }));
    }

    #[test]
    fn readouts_are_computed_on_request_only() {
        let mut model = conversion(2.0);
        model
            .add_readout("total", Function::variadic(|x| x.iter().sum()), &["A", "B"])
            .expect("free");
        assert!(!model.args(None, 0.0, false).expect("args").contains_key("total"));
        assert_eq!(model.args(None, 0.0, true).expect("args")["total"], 1.0);

        let full = model.full_concs(None, 0.0, true).expect("full concs");
        assert_eq!(full.keys().collect::<Vec<_>>(), vec!["A", "B", "total"]);

        model
            .add_reaction("v2", Function::new(1, |x| x[0]), &["total"], [("A", 1.0)])
            .expect("free");
        let err = model.fluxes(None, 0.0).expect_err("readouts are not inputs");
        assert!(matches!(err, ModelError::UndefinedReference { name, .. } if name == "total"));
    }

    #[test]
    fn surrogates_contribute_fluxes() {
        let mut model = Model::new();
        model
            .add_variables(&[("A", 2.0), ("B", 4.0)])
            .expect("free names");
        model
            .add_surrogate(
                "s",
                halving_surrogate(&["vs", "aux"], stoich(&[("vs", &[("A", -1.0), ("B", 1.0)])])),
                None,
                None,
            )
            .expect("free");

        let fluxes = model.fluxes(None, 0.0).expect("fluxes");
        assert_eq!(fluxes.keys().collect::<Vec<_>>(), vec!["vs", "aux"]);
        assert_eq!(fluxes["vs"], 1.0);
        assert_eq!(fluxes["aux"], 11.0);
        assert_eq!(model.derivative(0.0, &[2.0, 4.0]).expect("evaluates"), &[-1.0, 1.0]);

        model
            .update_surrogate("s", None, Some(&["B"]), None)
            .expect("s exists");
        assert_eq!(model.fluxes(None, 0.0).expect("fluxes")["vs"], 2.0);

        model.remove_surrogate("s").expect("exists");
        assert!(model.fluxes(None, 0.0).expect("fluxes").is_empty());
    }

    #[test]
    fn surrogate_output_overwrites_reaction_flux() {
        let mut model = conversion(2.0);
        model
            .add_surrogate(
                "s",
                halving_surrogate(&["v1"], stoich(&[("v1", &[("A", -1.0), ("B", 1.0)])])),
                None,
                None,
            )
            .expect("surrogate names are separate from flux names");
        assert_eq!(model.fluxes(None, 0.0).expect("fluxes")["v1"], 0.5);
        let cache = model.resolve().expect("resolves");
        assert_eq!(cache.flux_names().collect::<Vec<_>>(), vec!["v1"]);
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("evaluates"), &[-0.5, 0.5]);
    }

    #[test]
    fn surrogate_inputs_are_checked_at_rebuild() {
        let mut model = conversion(2.0);
        model
            .add_surrogate(
                "s",
                halving_surrogate(&["vs"], stoich(&[("vs", &[("B", 1.0)])])),
                Some(&["A", "B"]),
                None,
            )
            .expect("input count is not checked on add");
        let err = model.derivative(0.0, &[1.0, 0.0]).expect_err("two inputs for one");
        match err {
            ModelError::ArityMismatch(mismatch) => {
                assert_eq!(mismatch.name, "s");
                assert_eq!(mismatch.function_args, vec!["A"]);
                assert_eq!(mismatch.model_args, vec!["A", "B"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!model.is_resolved());

        model
            .update_surrogate("s", None, Some(&["B"]), None)
            .expect("s exists");
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("evaluates"), &[-2.0, 2.0]);
    }

    #[test]
    fn surrogate_must_predict_declared_outputs() {
        let mut model = conversion(2.0);
        let silent = Silent {
            stoichiometries: stoich(&[("vx", &[("A", 1.0)])]),
        };
        model.add_surrogate("s", Arc::new(silent), None, None).expect("free");
        let err = model.derivative(0.0, &[1.0, 0.0]).expect_err("vx not predicted");
        assert!(matches!(
            err,
            ModelError::MissingFlux { surrogate, name } if surrogate == "s" && name == "vx"
        ));
    }

    #[test]
    fn time_courses_evaluate_column_wise() {
        let mut model = conversion(2.0);
        model
            .add_derived(
                "d",
                Function::expression(&["t", "a"], "t + a").expect("parses"),
                &["time", "A"],
            )
            .expect("free");
        let course = TimeCourse::new(vec![0.0, 1.0])
            .with_column("A", &[1.0, 2.0])
            .and_then(|c| c.with_column("B", &[0.0, 0.5]))
            .expect("columns match");

        let args = model.args_time_course(&course, false).expect("args");
        assert_eq!(args.column("d").expect("d").as_slice(), &[1.0, 3.0]);
        assert_eq!(args.column("k").expect("k").as_slice(), &[2.0, 2.0]);
        assert_eq!(args.column("time").expect("time").as_slice(), &[0.0, 1.0]);

        let fluxes = model.fluxes_time_course(&course).expect("fluxes");
        assert_eq!(fluxes.column("v1").expect("v1").as_slice(), &[2.0, 4.0]);

        let partial = TimeCourse::new(vec![0.0, 2.0])
            .with_column("A", &[1.0, 3.0])
            .expect("column matches");
        let args = model.args_time_course(&partial, false).expect("B from initial conditions");
        assert_eq!(args.column("B").expect("B").as_slice(), &[0.0, 0.0]);
        assert_eq!(args.column("d").expect("d").as_slice(), &[1.0, 5.0]);
        let fluxes = model.fluxes_time_course(&partial).expect("B from initial conditions");
        assert_eq!(fluxes.column("v1").expect("v1").as_slice(), &[2.0, 6.0]);

        let unknown = TimeCourse::new(vec![0.0])
            .with_column("Z", &[1.0])
            .expect("column matches");
        let err = model.args_time_course(&unknown, false).expect_err("Z is unknown");
        assert!(matches!(err, ModelError::NameNotFound { .. }));
    }

    #[test]
    fn variables_and_parameters_swap_roles() {
        let mut model = conversion(2.0);
        model
            .make_parameter_dynamic("k", None, &[("missing", 1.0)])
            .expect_err("no such flux");
        assert!(model.parameters().contains_key("k"));

        model
            .make_parameter_dynamic("k", None, &[("v1", -1.0)])
            .expect("k is a parameter");
        assert_eq!(model.variable_names(), vec!["A", "B", "k"]);
        assert_eq!(model.derivative(0.0, &[1.0, 0.0, 2.0]).expect("evaluates"), &[-2.0, 2.0, -2.0]);

        model.make_variable_static("B", Some(5.0)).expect("B is a variable");
        assert_eq!(model.parameters()["B"], 5.0);
        assert!(!model.reactions()["v1"].stoichiometry.contains_key("B"));
        assert_eq!(model.derivative(0.0, &[1.0, 2.0]).expect("evaluates"), &[-2.0, -2.0]);
    }

    #[test]
    fn removed_reaction_stops_contributing_after_resolve() {
        let mut model = conversion(2.0);
        model
            .add_reaction("v2", Function::new(0, |_| 1.0), &[], [("B", 1.0)])
            .expect("free");
        model.resolve().expect("resolves");
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("evaluates"), &[-2.0, 3.0]);
        let before = model.stoichiometries(None, 0.0).expect("evaluates");
        assert_eq!(before.get("B", "v2"), Some(1.0));

        model.remove_reaction("v2").expect("exists");
        assert!(!model.is_resolved());
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("evaluates"), &[-2.0, 2.0]);
        let after = model.stoichiometries(None, 0.0).expect("evaluates");
        assert_eq!(after.fluxes, vec!["v1"]);
        assert_eq!(after.get("B", "v2"), None);
        assert!(!model.fluxes(None, 0.0).expect("fluxes").contains_key("v2"));
    }

    #[test]
    fn removed_inputs_surface_as_undefined_references() {
        let mut model = conversion(2.0);
        model.remove_parameter("k").expect("exists");
        let err = model.fluxes(None, 0.0).expect_err("k removed");
        assert!(matches!(
            err,
            ModelError::UndefinedReference { owner, name } if owner == "v1" && name == "k"
        ));
        model.remove_reaction("v1").expect("exists");
        assert_eq!(model.derivative(0.0, &[1.0, 0.0]).expect("no reactions"), &[0.0, 0.0]);
    }

    #[test]
    fn model_is_a_dynamical_system() {
        let mut model = conversion(2.0);
        assert_eq!(model.dimension(), 2);
        let mut out = [0.0; 2];
        model.apply(0.0, &[1.0, 0.0], &mut out).expect("evaluates");
        assert_eq!(out, [-2.0, 2.0]);

        let mut wrong = [0.0; 3];
        let err = model.apply(0.0, &[1.0, 0.0], &mut wrong).expect_err("wrong buffer");
        assert!(matches!(err, ModelError::DimensionMismatch { expected: 2, actual: 3 }));
    }
}
