//! Resolved evaluation plan of a [`Model`] and the hot evaluation path.
//!
//! A [`ModelCache`] is built from the declarative entities in one pass:
//! arity checks, dependency sort, derived parameter folding, stoichiometry
//! partitioning. Every name is then compiled to a slot in a flat value
//! environment so that evaluating the right-hand side performs no map
//! lookups and no allocation beyond what surrogates do internally.

use crate::error::{ArityMismatch, ModelError};
use crate::function::{check_arity, Function};
use crate::model::{Coefficient, Derived, Model};
use crate::registry::{Category, TIME};
use crate::sort::sort_dependencies;
use crate::surrogate::Surrogate;
use crate::timecourse::TimeCourse;
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Either dirty (no plan) or resolved (holding a plan that matches the
/// model).
#[derive(Default)]
pub struct CacheState {
    resolved: Option<Box<ModelCache>>,
}

impl CacheState {
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Drops the plan. Returns whether one was present.
    pub fn invalidate(&mut self) -> bool {
        self.resolved.take().is_some()
    }

    /// Moves the plan out, leaving the state dirty.
    pub(crate) fn take(&mut self) -> Option<Box<ModelCache>> {
        self.resolved.take()
    }

    pub(crate) fn install(&mut self, cache: Box<ModelCache>) -> &mut ModelCache {
        self.resolved.insert(cache)
    }
}

/// One function application writing into an environment or flux slot.
struct Step {
    function: Function,
    args: Vec<usize>,
    slot: usize,
}

struct SurrogateStep {
    name: String,
    surrogate: Arc<dyn Surrogate>,
    args: Vec<usize>,
    /// Declared outputs; each must be present in every prediction.
    outputs: Vec<String>,
}

struct StaticTerm {
    variable: usize,
    flux: usize,
    coefficient: f64,
}

struct DynamicTerm {
    variable: usize,
    flux: usize,
    function: Function,
    args: Vec<usize>,
}

/// Buffers overwritten on every evaluation.
#[derive(Default)]
struct Scratch {
    env: Vec<f64>,
    fluxes: Vec<f64>,
    args: Vec<f64>,
    stack: Vec<f64>,
    dxdt: Vec<f64>,
}

/// Stoichiometric coefficients at one point: compounds × fluxes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoichiometryMatrix {
    pub compounds: Vec<String>,
    pub fluxes: Vec<String>,
    pub values: DMatrix<f64>,
}

impl StoichiometryMatrix {
    pub fn get(&self, compound: &str, flux: &str) -> Option<f64> {
        let row = self.compounds.iter().position(|c| c == compound)?;
        let col = self.fluxes.iter().position(|f| f == flux)?;
        Some(self.values[(row, col)])
    }
}

pub struct ModelCache {
    var_names: Vec<String>,
    /// Fallback for variables a caller leaves out.
    initial_conditions: Vec<f64>,
    parameter_values: IndexMap<String, f64>,
    derived_parameter_names: Vec<String>,
    derived_variable_names: Vec<String>,
    stoich_by_compounds: IndexMap<String, IndexMap<String, f64>>,
    dyn_stoich_by_compounds: IndexMap<String, IndexMap<String, Derived>>,

    /// Environment layout: expanded parameters, variables, time, derived
    /// variables, readouts.
    slots: IndexMap<String, usize>,
    readout_start: usize,
    var_slots: Vec<usize>,
    time_slot: usize,
    derived_steps: Vec<Step>,
    readout_steps: Vec<Step>,
    reaction_steps: Vec<Step>,
    surrogate_steps: Vec<SurrogateStep>,
    flux_slots: IndexMap<String, usize>,
    static_terms: Vec<StaticTerm>,
    dynamic_terms: Vec<DynamicTerm>,

    scratch: Scratch,
}

fn resolve_slots(
    slots: &IndexMap<String, usize>,
    owner: &str,
    names: &[String],
) -> Result<Vec<usize>, ModelError> {
    names
        .iter()
        .map(|name| {
            slots
                .get(name)
                .copied()
                .ok_or_else(|| ModelError::UndefinedReference {
                    owner: owner.to_string(),
                    name: name.clone(),
                })
        })
        .collect()
}

fn invoke(
    function: &Function,
    arg_slots: &[usize],
    env: &[f64],
    args: &mut Vec<f64>,
    stack: &mut Vec<f64>,
) -> f64 {
    args.clear();
    args.extend(arg_slots.iter().map(|&slot| env[slot]));
    function.call_with(args, stack)
}

/// Evaluates `derived` from `values`, if every argument is present there.
fn fold_constant(derived: &Derived, values: &IndexMap<String, f64>) -> Option<f64> {
    let args = derived
        .args
        .iter()
        .map(|arg| values.get(arg).copied())
        .collect::<Option<Vec<f64>>>()?;
    Some(derived.function.call(&args))
}

fn undefined(owner: &str, name: &str) -> ModelError {
    ModelError::UndefinedReference {
        owner: owner.to_string(),
        name: name.to_string(),
    }
}

impl ModelCache {
    pub(crate) fn build(model: &Model) -> Result<Self, ModelError> {
        let mut parameter_values = model.parameters.clone();
        let mut available: HashSet<String> = model
            .parameters
            .keys()
            .chain(model.variables.keys())
            .cloned()
            .collect();
        available.insert(TIME.to_string());

        for (name, function, args) in model
            .derived
            .iter()
            .chain(model.readouts.iter())
            .map(|(name, d)| (name, &d.function, &d.args))
            .chain(model.reactions.iter().map(|(name, r)| (name, &r.function, &r.args)))
        {
            check_arity(name, function, args)?;
        }
        for (rxn_name, rxn) in &model.reactions {
            for (cpd, coefficient) in &rxn.stoichiometry {
                if let Coefficient::Formula(d) = coefficient {
                    check_arity(&format!("{rxn_name}[{cpd}]"), &d.function, &d.args)?;
                }
            }
        }
        for (name, entry) in &model.surrogates {
            let inputs = entry.surrogate.args();
            if inputs.len() != entry.args.len() {
                return Err(ArityMismatch {
                    name: name.clone(),
                    function_args: inputs.to_vec(),
                    model_args: entry.args.clone(),
                }
                .into());
            }
        }

        let elements: Vec<(String, HashSet<String>)> = model
            .derived
            .iter()
            .map(|(name, d)| (name.clone(), d.args.iter().cloned().collect()))
            .collect();
        let order = sort_dependencies(&mut available, &elements)?;

        let mut derived_parameter_names = Vec::new();
        let mut derived_variable_names = Vec::new();
        for name in order {
            let derived = &model.derived[&name];
            match fold_constant(derived, &parameter_values) {
                Some(value) => {
                    parameter_values.insert(name.clone(), value);
                    derived_parameter_names.push(name);
                }
                None => derived_variable_names.push(name),
            }
        }

        let mut stoich_by_compounds: IndexMap<String, IndexMap<String, f64>> = IndexMap::new();
        let mut dyn_stoich_by_compounds: IndexMap<String, IndexMap<String, Derived>> =
            IndexMap::new();
        for (rxn_name, rxn) in &model.reactions {
            for (cpd, coefficient) in &rxn.stoichiometry {
                if !model.variables.contains_key(cpd) {
                    return Err(undefined(rxn_name, cpd));
                }
                let by_flux = stoich_by_compounds.entry(cpd.clone()).or_default();
                match coefficient {
                    Coefficient::Constant(value) => {
                        by_flux.insert(rxn_name.clone(), *value);
                    }
                    Coefficient::Formula(d) => match fold_constant(d, &parameter_values) {
                        Some(value) => {
                            by_flux.insert(rxn_name.clone(), value);
                        }
                        None => {
                            dyn_stoich_by_compounds
                                .entry(cpd.clone())
                                .or_default()
                                .insert(rxn_name.clone(), d.clone());
                        }
                    },
                }
            }
        }
        for (surrogate_name, entry) in &model.surrogates {
            for (flux, by_compound) in &entry.stoichiometries {
                for (cpd, &value) in by_compound {
                    if !model.variables.contains_key(cpd) {
                        return Err(undefined(surrogate_name, cpd));
                    }
                    stoich_by_compounds
                        .entry(cpd.clone())
                        .or_default()
                        .insert(flux.clone(), value);
                }
            }
        }

        let var_names: Vec<String> = model.variables.keys().cloned().collect();

        // Slot layout
        let time_name = TIME.to_string();
        let mut slots: IndexMap<String, usize> = IndexMap::new();
        for name in parameter_values
            .keys()
            .chain(var_names.iter())
            .chain(std::iter::once(&time_name))
            .chain(derived_variable_names.iter())
        {
            let slot = slots.len();
            slots.insert(name.clone(), slot);
        }
        let var_slots = var_names.iter().map(|name| slots[name]).collect();
        let time_slot = slots[TIME];

        let derived_steps = derived_variable_names
            .iter()
            .map(|name| {
                let derived = &model.derived[name];
                Ok(Step {
                    function: derived.function.clone(),
                    args: resolve_slots(&slots, name, &derived.args)?,
                    slot: slots[name],
                })
            })
            .collect::<Result<Vec<_>, ModelError>>()?;

        let mut flux_slots: IndexMap<String, usize> = IndexMap::new();
        let mut reaction_steps = Vec::with_capacity(model.reactions.len());
        for (name, rxn) in &model.reactions {
            let slot = flux_slots.len();
            flux_slots.insert(name.clone(), slot);
            reaction_steps.push(Step {
                function: rxn.function.clone(),
                args: resolve_slots(&slots, name, &rxn.args)?,
                slot,
            });
        }

        let mut surrogate_steps = Vec::with_capacity(model.surrogates.len());
        for (name, entry) in &model.surrogates {
            let mut outputs = Vec::with_capacity(entry.stoichiometries.len());
            for flux in entry.stoichiometries.keys() {
                if flux_slots.contains_key(flux) {
                    warn!(
                        surrogate = %name,
                        flux = %flux,
                        "surrogate output shares a flux name; the later write wins"
                    );
                } else {
                    let slot = flux_slots.len();
                    flux_slots.insert(flux.clone(), slot);
                }
                outputs.push(flux.clone());
            }
            surrogate_steps.push(SurrogateStep {
                name: name.clone(),
                surrogate: Arc::clone(&entry.surrogate),
                args: resolve_slots(&slots, name, &entry.args)?,
                outputs,
            });
        }

        let mut static_terms = Vec::new();
        for (cpd, by_flux) in &stoich_by_compounds {
            let variable = model
                .variables
                .get_index_of(cpd)
                .ok_or_else(|| undefined(cpd, cpd))?;
            for (flux, &coefficient) in by_flux {
                let flux_slot = flux_slots.get(flux).copied().ok_or_else(|| undefined(cpd, flux))?;
                static_terms.push(StaticTerm {
                    variable,
                    flux: flux_slot,
                    coefficient,
                });
            }
        }
        let mut dynamic_terms = Vec::new();
        for (cpd, by_flux) in &dyn_stoich_by_compounds {
            let variable = model
                .variables
                .get_index_of(cpd)
                .ok_or_else(|| undefined(cpd, cpd))?;
            for (flux, derived) in by_flux {
                dynamic_terms.push(DynamicTerm {
                    variable,
                    flux: flux_slots.get(flux).copied().ok_or_else(|| undefined(cpd, flux))?,
                    function: derived.function.clone(),
                    args: resolve_slots(&slots, flux, &derived.args)?,
                });
            }
        }

        // Readouts see everything above but are never visible to each other.
        let readout_start = slots.len();
        let mut readout_steps = Vec::with_capacity(model.readouts.len());
        for (name, readout) in &model.readouts {
            readout_steps.push(Step {
                function: readout.function.clone(),
                args: resolve_slots(&slots, name, &readout.args)?,
                slot: readout_start + readout_steps.len(),
            });
        }
        for name in model.readouts.keys() {
            let slot = slots.len();
            slots.insert(name.clone(), slot);
        }

        let mut env = vec![0.0; slots.len()];
        for (slot, value) in parameter_values.values().enumerate() {
            env[slot] = *value;
        }
        let scratch = Scratch {
            env,
            fluxes: vec![0.0; flux_slots.len()],
            args: Vec::new(),
            stack: Vec::new(),
            dxdt: vec![0.0; var_names.len()],
        };

        debug!(
            derived_parameters = derived_parameter_names.len(),
            derived_variables = derived_variable_names.len(),
            fluxes = flux_slots.len(),
            static_terms = static_terms.len(),
            dynamic_terms = dynamic_terms.len(),
            "built model cache"
        );

        Ok(Self {
            var_names,
            initial_conditions: model.variables.values().copied().collect(),
            parameter_values,
            derived_parameter_names,
            derived_variable_names,
            stoich_by_compounds,
            dyn_stoich_by_compounds,
            slots,
            readout_start,
            var_slots,
            time_slot,
            derived_steps,
            readout_steps,
            reaction_steps,
            surrogate_steps,
            flux_slots,
            static_terms,
            dynamic_terms,
            scratch,
        })
    }

    /// Variable names in the order the state vector uses.
    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }

    /// Parameters plus folded derived parameters.
    pub fn parameter_values(&self) -> &IndexMap<String, f64> {
        &self.parameter_values
    }

    pub fn derived_parameter_names(&self) -> &[String] {
        &self.derived_parameter_names
    }

    pub fn derived_variable_names(&self) -> &[String] {
        &self.derived_variable_names
    }

    /// Static coefficients: compound → flux → value.
    pub fn static_stoichiometries(&self) -> &IndexMap<String, IndexMap<String, f64>> {
        &self.stoich_by_compounds
    }

    /// State-dependent coefficients: compound → flux → formula.
    pub fn dynamic_stoichiometries(&self) -> &IndexMap<String, IndexMap<String, Derived>> {
        &self.dyn_stoich_by_compounds
    }

    pub fn flux_names(&self) -> impl Iterator<Item = &str> {
        self.flux_slots.keys().map(String::as_str)
    }

    fn load_state(&mut self, time: f64, concs: &[f64]) -> Result<(), ModelError> {
        if concs.len() != self.var_slots.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.var_slots.len(),
                actual: concs.len(),
            });
        }
        let env = &mut self.scratch.env;
        for (&slot, &value) in self.var_slots.iter().zip(concs) {
            env[slot] = value;
        }
        env[self.time_slot] = time;
        Ok(())
    }

    fn run_steps(steps: &[Step], scratch: &mut Scratch) {
        for step in steps {
            let value = invoke(
                &step.function,
                &step.args,
                &scratch.env,
                &mut scratch.args,
                &mut scratch.stack,
            );
            scratch.env[step.slot] = value;
        }
    }

    /// Fills the environment for one point in state space.
    fn fill_environment(
        &mut self,
        time: f64,
        concs: &[f64],
        include_readouts: bool,
    ) -> Result<(), ModelError> {
        self.load_state(time, concs)?;
        Self::run_steps(&self.derived_steps, &mut self.scratch);
        if include_readouts {
            Self::run_steps(&self.readout_steps, &mut self.scratch);
        }
        Ok(())
    }

    /// Evaluates every reaction then every surrogate into the flux buffer.
    /// Surrogate outputs without a flux slot go to `extra` when given.
    fn compute_fluxes(
        &mut self,
        mut extra: Option<&mut IndexMap<String, f64>>,
    ) -> Result<(), ModelError> {
        let scratch = &mut self.scratch;
        for step in &self.reaction_steps {
            scratch.fluxes[step.slot] = invoke(
                &step.function,
                &step.args,
                &scratch.env,
                &mut scratch.args,
                &mut scratch.stack,
            );
        }
        for step in &self.surrogate_steps {
            scratch.args.clear();
            scratch
                .args
                .extend(step.args.iter().map(|&slot| scratch.env[slot]));
            let predicted = step.surrogate.predict(&scratch.args);
            if let Some(missing) = step.outputs.iter().find(|o| !predicted.contains_key(*o)) {
                return Err(ModelError::MissingFlux {
                    surrogate: step.name.clone(),
                    name: missing.clone(),
                });
            }
            for (name, value) in predicted {
                match self.flux_slots.get(&name) {
                    Some(&slot) => scratch.fluxes[slot] = value,
                    None => {
                        if let Some(extra) = extra.as_deref_mut() {
                            extra.insert(name, value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn accumulate(&mut self) {
        let scratch = &mut self.scratch;
        scratch.dxdt.fill(0.0);
        for term in &self.static_terms {
            scratch.dxdt[term.variable] += term.coefficient * scratch.fluxes[term.flux];
        }
        for term in &self.dynamic_terms {
            let coefficient = invoke(
                &term.function,
                &term.args,
                &scratch.env,
                &mut scratch.args,
                &mut scratch.stack,
            );
            scratch.dxdt[term.variable] += coefficient * scratch.fluxes[term.flux];
        }
    }

    /// Right-hand side at `(time, concs)`, `concs` in variable order.
    /// The returned slice is the cache's own buffer.
    pub fn derivative(&mut self, time: f64, concs: &[f64]) -> Result<&[f64], ModelError> {
        self.fill_environment(time, concs, false)?;
        self.compute_fluxes(None)?;
        self.accumulate();
        Ok(&self.scratch.dxdt)
    }

    /// Named argument environment at one point.
    pub fn environment(
        &mut self,
        time: f64,
        concs: &[f64],
        include_readouts: bool,
    ) -> Result<IndexMap<String, f64>, ModelError> {
        self.fill_environment(time, concs, include_readouts)?;
        let limit = if include_readouts {
            self.slots.len()
        } else {
            self.readout_start
        };
        let env = &self.scratch.env;
        Ok(self
            .slots
            .iter()
            .take(limit)
            .map(|(name, &slot)| (name.clone(), env[slot]))
            .collect())
    }

    /// Reaction fluxes followed by every surrogate output.
    pub fn fluxes(
        &mut self,
        time: f64,
        concs: &[f64],
    ) -> Result<IndexMap<String, f64>, ModelError> {
        self.fill_environment(time, concs, false)?;
        let mut extra = IndexMap::new();
        self.compute_fluxes(Some(&mut extra))?;
        let fluxes = &self.scratch.fluxes;
        let mut out: IndexMap<String, f64> = self
            .flux_slots
            .iter()
            .map(|(name, &slot)| (name.clone(), fluxes[slot]))
            .collect();
        out.extend(extra);
        Ok(out)
    }

    /// Stoichiometry with dynamic coefficients evaluated at `(time, concs)`.
    pub fn stoichiometries(
        &mut self,
        time: f64,
        concs: &[f64],
    ) -> Result<StoichiometryMatrix, ModelError> {
        self.fill_environment(time, concs, false)?;

        let compounds: Vec<String> = self.stoich_by_compounds.keys().cloned().collect();
        let mut fluxes: IndexMap<String, usize> = IndexMap::new();
        for by_flux in self
            .stoich_by_compounds
            .values()
            .map(|m| m.keys().collect::<Vec<_>>())
            .chain(self.dyn_stoich_by_compounds.values().map(|m| m.keys().collect()))
        {
            for flux in by_flux {
                let next = fluxes.len();
                fluxes.entry(flux.clone()).or_insert(next);
            }
        }

        let mut values = DMatrix::zeros(compounds.len(), fluxes.len());
        for (row, by_flux) in self.stoich_by_compounds.values().enumerate() {
            for (flux, &value) in by_flux {
                values[(row, fluxes[flux])] = value;
            }
        }
        let scratch = &mut self.scratch;
        for (cpd, by_flux) in &self.dyn_stoich_by_compounds {
            let Some(row) = self.stoich_by_compounds.get_index_of(cpd) else {
                continue;
            };
            for (flux, derived) in by_flux {
                let args = resolve_slots(&self.slots, flux, &derived.args)?;
                values[(row, fluxes[flux])] = invoke(
                    &derived.function,
                    &args,
                    &scratch.env,
                    &mut scratch.args,
                    &mut scratch.stack,
                );
            }
        }

        Ok(StoichiometryMatrix {
            compounds,
            fluxes: fluxes.into_keys().collect(),
            values,
        })
    }

    /// Column-wise environment over a table of concentrations.
    ///
    /// Each entry is computed once as a full column, in the same order the
    /// scalar environment uses.
    pub fn environment_time_course(
        &mut self,
        concs: &TimeCourse,
        include_readouts: bool,
    ) -> Result<TimeCourse, ModelError> {
        let is_variable = |n: &str| self.var_names.iter().any(|v| v.as_str() == n);
        if let Some(unknown) = concs.names().find(|n| !is_variable(n)) {
            return Err(ModelError::NameNotFound {
                name: unknown.to_string(),
                category: Category::Variable,
            });
        }
        let n = concs.len();
        let mut columns: Vec<DVector<f64>> = Vec::with_capacity(self.slots.len());
        for (slot, value) in self.scratch.env.iter().enumerate() {
            if slot < self.parameter_values.len() {
                columns.push(DVector::from_element(n, *value));
            } else {
                columns.push(DVector::zeros(n));
            }
        }
        for (i, (name, &slot)) in self.var_names.iter().zip(&self.var_slots).enumerate() {
            columns[slot] = match concs.column(name) {
                Some(column) => column.clone(),
                None => DVector::from_element(n, self.initial_conditions[i]),
            };
        }
        columns[self.time_slot] = DVector::from_column_slice(concs.time());

        let scratch = &mut self.scratch;
        let mut steps: Vec<&Step> = self.derived_steps.iter().collect();
        if include_readouts {
            steps.extend(self.readout_steps.iter());
        }
        for step in steps {
            let column = DVector::from_fn(n, |row, _| {
                scratch.args.clear();
                scratch
                    .args
                    .extend(step.args.iter().map(|&slot| columns[slot][row]));
                step.function.call_with(&scratch.args, &mut scratch.stack)
            });
            columns[step.slot] = column;
        }

        let limit = if include_readouts {
            self.slots.len()
        } else {
            self.readout_start
        };
        let mut out = TimeCourse::new(concs.time().to_vec());
        for (name, &slot) in self.slots.iter().take(limit) {
            out.insert(name.clone(), columns[slot].clone())?;
        }
        Ok(out)
    }

    /// Fluxes at every row of a concentration table. Variables without a
    /// column keep their initial condition.
    pub fn fluxes_time_course(&mut self, concs: &TimeCourse) -> Result<TimeCourse, ModelError> {
        let columns: Vec<Option<&DVector<f64>>> =
            self.var_names.iter().map(|name| concs.column(name)).collect();
        let mut state = self.initial_conditions.clone();
        let mut rows: Vec<IndexMap<String, f64>> = Vec::with_capacity(concs.len());
        for (row, &time) in concs.time().iter().enumerate() {
            for (value, column) in state.iter_mut().zip(&columns) {
                if let Some(column) = column {
                    *value = column[row];
                }
            }
            rows.push(self.fluxes(time, &state)?);
        }

        let mut out = TimeCourse::new(concs.time().to_vec());
        let names: Vec<String> = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_else(|| self.flux_slots.keys().cloned().collect());
        for name in names {
            let column = DVector::from_iterator(
                rows.len(),
                rows.iter().map(|r| r.get(&name).copied().unwrap_or(f64::NAN)),
            );
            out.insert(name, column)?;
        }
        Ok(out)
    }
}
