use crate::registry::Category;
use crate::sort::SortError;
use thiserror::Error;

/// Every failure the model can report.
///
/// Mutations fail before touching any dictionary, so an `Err` from an
/// add/remove/update call leaves the model exactly as it was. Cache builds
/// fail atomically: no partial plan is ever installed.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{}", conflict_message(name, *existing))]
    NameConflict {
        name: String,
        /// `None` when the name is reserved rather than taken.
        existing: Option<Category>,
    },
    #[error("'{name}' not found in {category}s")]
    NameNotFound { name: String, category: Category },
    #[error(transparent)]
    ArityMismatch(#[from] ArityMismatch),
    #[error(transparent)]
    Sort(#[from] SortError),
    #[error("'{owner}' references undefined name '{name}'")]
    UndefinedReference { owner: String, name: String },
    #[error("surrogate '{surrogate}' did not predict declared output '{name}'")]
    MissingFlux { surrogate: String, name: String },
    #[error("expected {expected} values, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid expression: {0}")]
    Expression(String),
}

fn conflict_message(name: &str, existing: Option<Category>) -> String {
    match existing {
        Some(category) => format!("model already contains {category} called '{name}'"),
        None => format!("'{name}' is reserved for the independent time variable"),
    }
}

/// A function cannot be called with the arguments the model binds to it.
#[derive(Debug, Clone, Error)]
#[error("{}", self.render())]
pub struct ArityMismatch {
    pub name: String,
    pub function_args: Vec<String>,
    pub model_args: Vec<String>,
}

impl ArityMismatch {
    fn render(&self) -> String {
        let mut message = format!("Function arity mismatch for {}.\n", self.name);
        let rows = self.function_args.len().max(self.model_args.len());
        let mut lines = vec![
            format!("{:<8.8} | {:<10.10}", "Fn args", "Model args"),
            format!("{:<8.8} | {:<10.10}", "-------", "----------"),
        ];
        for i in 0..rows {
            let lhs = self.function_args.get(i).map_or("---", String::as_str);
            let rhs = self.model_args.get(i).map_or("---", String::as_str);
            lines.push(format!("{lhs:<8.8} | {rhs:<10.10}"));
        }
        message.push_str(&lines.join("\n"));
        message
    }
}
