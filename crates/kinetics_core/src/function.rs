//! User functions attached to derived quantities, reactions and readouts.
//!
//! A [`Function`] is either a native closure over a slice of positional
//! values or a text formula compiled by the equation engine. Both carry a
//! [`Signature`] so the model can check, once per cache build, that the
//! number of bound argument names fits what the function declares.

use crate::equation_engine::{compile_formula, Bytecode, VM};
use crate::error::{ArityMismatch, ModelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Declared parameter list of a function.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
    /// Positional parameters, including the ones with defaults.
    pub positional: Vec<String>,
    /// How many of the positional parameters have default values.
    pub defaults: usize,
    pub keyword_only: Vec<String>,
    /// Accepts any number of positional values.
    pub variadic: bool,
}

impl Signature {
    /// Exactly `arity` positional parameters, named `x0..`.
    pub fn fixed(arity: usize) -> Self {
        Self::named((0..arity).map(|i| format!("x{i}")))
    }

    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn variadic() -> Self {
        Self {
            variadic: true,
            ..Self::default()
        }
    }

    pub fn with_defaults(mut self, defaults: usize) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_keyword_only<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keyword_only = names.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a call with exactly `arity` positional values is compatible.
    pub fn accepts(&self, arity: usize) -> bool {
        if self.variadic {
            return true;
        }
        let positional = self.positional.len();
        if positional == arity {
            return true;
        }
        if self.defaults == 0 {
            return false;
        }
        positional + self.defaults == arity || positional + self.keyword_only.len() == arity
    }
}

type NativeFn = dyn Fn(&[f64]) -> f64 + Send + Sync;

#[derive(Clone)]
enum Body {
    Native(Arc<NativeFn>),
    Formula {
        source: Arc<str>,
        bytecode: Arc<Bytecode>,
    },
}

/// A callable over positional `f64` values. Cloning is cheap.
#[derive(Clone)]
pub struct Function {
    signature: Signature,
    body: Body,
}

impl Function {
    /// Native closure taking exactly `arity` values.
    pub fn new<F>(arity: usize, f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::with_signature(Signature::fixed(arity), f)
    }

    pub fn with_signature<F>(signature: Signature, f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self {
            signature,
            body: Body::Native(Arc::new(f)),
        }
    }

    /// Native closure accepting any number of values.
    pub fn variadic<F>(f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Self::with_signature(Signature::variadic(), f)
    }

    /// Compiles `source` as a formula over the named parameters.
    ///
    /// ```
    /// use kinetics_core::function::Function;
    ///
    /// let mass_action = Function::expression(&["k", "s"], "k * s").unwrap();
    /// assert_eq!(mass_action.call(&[2.0, 3.0]), 6.0);
    /// ```
    pub fn expression(params: &[&str], source: &str) -> Result<Self, ModelError> {
        let names: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        let bytecode = compile_formula(&names, source).map_err(ModelError::Expression)?;
        Ok(Self {
            signature: Signature::named(names),
            body: Body::Formula {
                source: Arc::from(source),
                bytecode: Arc::new(bytecode),
            },
        })
    }

    /// Returns its single argument unchanged.
    pub fn identity() -> Self {
        Self::with_signature(Signature::named(["x"]), |x| x[0])
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Formula text, for formula-backed functions.
    pub fn source(&self) -> Option<&str> {
        match &self.body {
            Body::Native(_) => None,
            Body::Formula { source, .. } => Some(source),
        }
    }

    /// Convenience call that allocates its own VM stack.
    pub fn call(&self, args: &[f64]) -> f64 {
        let mut stack = Vec::new();
        self.call_with(args, &mut stack)
    }

    /// Evaluates the function, reusing `stack` for formula bodies.
    pub fn call_with(&self, args: &[f64], stack: &mut Vec<f64>) -> f64 {
        match &self.body {
            Body::Native(f) => f(args),
            Body::Formula { bytecode, .. } => VM::execute(bytecode, args, stack),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Function");
        s.field("signature", &self.signature);
        if let Some(source) = self.source() {
            s.field("source", &source);
        }
        s.finish_non_exhaustive()
    }
}

/// Checks that `function` can be called with one value per name in `args`.
pub fn check_arity(name: &str, function: &Function, args: &[String]) -> Result<(), ArityMismatch> {
    if function.signature().accepts(args.len()) {
        return Ok(());
    }
    Err(ArityMismatch {
        name: name.to_string(),
        function_args: function.signature().positional.clone(),
        model_args: args.to_vec(),
    })
}
