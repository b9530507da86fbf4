use crate::error::ModelError;
use indexmap::IndexMap;
use nalgebra::DVector;

/// Named columns sampled at shared time points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeCourse {
    time: Vec<f64>,
    columns: IndexMap<String, DVector<f64>>,
}

impl TimeCourse {
    pub fn new(time: Vec<f64>) -> Self {
        Self {
            time,
            columns: IndexMap::new(),
        }
    }

    /// Adds or replaces a column. Its length must match the time index.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        values: DVector<f64>,
    ) -> Result<&mut Self, ModelError> {
        if values.len() != self.time.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.time.len(),
                actual: values.len(),
            });
        }
        self.columns.insert(name.into(), values);
        Ok(self)
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        values: &[f64],
    ) -> Result<Self, ModelError> {
        self.insert(name, DVector::from_column_slice(values))?;
        Ok(self)
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&DVector<f64>> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> &IndexMap<String, DVector<f64>> {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Values of every column at one time point, in column order.
    pub fn row(&self, index: usize) -> Option<IndexMap<String, f64>> {
        if index >= self.time.len() {
            return None;
        }
        Some(
            self.columns
                .iter()
                .map(|(name, values)| (name.clone(), values[index]))
                .collect(),
        )
    }
}
