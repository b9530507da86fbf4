//! Single namespace shared by every named entity of a model.

use crate::error::ModelError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the independent variable. Always available to functions, never
/// assignable by users.
pub const TIME: &str = "time";

/// Kind of entity a registered name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Variable,
    Parameter,
    Derived,
    Reaction,
    Readout,
    Surrogate,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Variable => "variable",
            Category::Parameter => "parameter",
            Category::Derived => "derived",
            Category::Reaction => "reaction",
            Category::Readout => "readout",
            Category::Surrogate => "surrogate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    ids: IndexMap<String, Category>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails without side effects if `name` is reserved or already taken.
    pub fn check_free(&self, name: &str) -> Result<(), ModelError> {
        if name == TIME {
            return Err(ModelError::NameConflict {
                name: name.to_string(),
                existing: None,
            });
        }
        if let Some(&existing) = self.ids.get(name) {
            return Err(ModelError::NameConflict {
                name: name.to_string(),
                existing: Some(existing),
            });
        }
        Ok(())
    }

    pub fn insert(&mut self, name: &str, category: Category) -> Result<(), ModelError> {
        self.check_free(name)?;
        self.ids.insert(name.to_string(), category);
        Ok(())
    }

    /// Fails unless `name` is registered as `category`.
    pub fn check_registered(&self, name: &str, category: Category) -> Result<(), ModelError> {
        match self.ids.get(name) {
            Some(&found) if found == category => Ok(()),
            _ => Err(ModelError::NameNotFound {
                name: name.to_string(),
                category,
            }),
        }
    }

    pub fn remove(&mut self, name: &str, category: Category) -> Result<(), ModelError> {
        self.check_registered(name, category)?;
        self.ids.shift_remove(name);
        Ok(())
    }

    pub fn ids(&self) -> &IndexMap<String, Category> {
        &self.ids
    }
}
