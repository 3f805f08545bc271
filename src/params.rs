//! Named design parameters and their flat vector layout θ.
//!
//! Entries keep insertion order.  A global entry contributes one slot to θ,
//! an element field contributes one slot per mesh element (global element
//! numbering).  Physics coefficients and load magnitudes point at entries
//! through [`ParamRef`] and are resolved to [`Slot`]s once per problem.

use crate::types::FemError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamScope {
    Global,
    PerElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub scope: ParamScope,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    entries: Vec<ParamEntry>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or overwrite) a global scalar.
    pub fn with_global(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(ParamEntry { name: name.into(), scope: ParamScope::Global, values: vec![value] });
        self
    }

    /// Add (or overwrite) a per-element field.
    pub fn with_field(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(ParamEntry { name: name.into(), scope: ParamScope::PerElement, values });
        self
    }

    fn insert(&mut self, entry: ParamEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ParamEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Length of θ.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start of entry `name` in θ.
    pub fn offset(&self, name: &str) -> Result<usize, FemError> {
        let mut offset = 0;
        for e in &self.entries {
            if e.name == name {
                return Ok(offset);
            }
            offset += e.values.len();
        }
        Err(FemError::UnknownParameter(name.to_string()))
    }

    pub fn flatten(&self) -> Vec<f64> {
        self.entries.iter().flat_map(|e| e.values.iter().copied()).collect()
    }

    /// Same layout, new values.
    pub fn unflatten(&self, theta: &[f64]) -> Result<ParamSet, FemError> {
        if theta.len() != self.len() {
            return Err(FemError::mismatch("parameter vector", self.len(), theta.len()));
        }
        let mut offset = 0;
        let entries = self
            .entries
            .iter()
            .map(|e| {
                let n = e.values.len();
                let values = theta[offset..offset + n].to_vec();
                offset += n;
                ParamEntry { name: e.name.clone(), scope: e.scope, values }
            })
            .collect();
        Ok(ParamSet { entries })
    }

    /// Human-readable label for every θ slot: `E`, `rho[3]`, ...
    pub fn labels(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        for e in &self.entries {
            match e.scope {
                ParamScope::Global => out.push(e.name.clone()),
                ParamScope::PerElement => {
                    out.extend((0..e.values.len()).map(|i| format!("{}[{i}]", e.name)))
                }
            }
        }
        out
    }

    /// Global entries hold one value; fields hold one per element.
    pub fn validate(&self, num_elements: usize) -> Result<(), FemError> {
        for e in &self.entries {
            let expected = match e.scope {
                ParamScope::Global => 1,
                ParamScope::PerElement => num_elements,
            };
            if e.values.len() != expected {
                return Err(FemError::mismatch(format!("parameter `{}`", e.name), expected, e.values.len()));
            }
        }
        Ok(())
    }

    fn slot(&self, name: &str) -> Result<Slot, FemError> {
        let offset = self.offset(name)?;
        let entry = self.get(name).ok_or_else(|| FemError::UnknownParameter(name.to_string()))?;
        Ok(match entry.scope {
            ParamScope::Global => Slot::Global(offset),
            ParamScope::PerElement => Slot::Field(offset),
        })
    }
}

/// Coefficient source: a literal constant or a named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRef {
    Constant(f64),
    Named(String),
}

impl ParamRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub fn resolve(&self, params: &ParamSet) -> Result<Slot, FemError> {
        match self {
            Self::Constant(v) => Ok(Slot::Constant(*v)),
            Self::Named(name) => params.slot(name),
        }
    }
}

impl From<f64> for ParamRef {
    fn from(v: f64) -> Self {
        Self::Constant(v)
    }
}

impl From<&str> for ParamRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

/// A [`ParamRef`] bound to positions in θ.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Constant(f64),
    Global(usize),
    /// Offset of the field; element `e` reads `θ[offset + e]`.
    Field(usize),
}

impl Slot {
    /// Index into θ for element `element`, `None` for constants.
    pub fn index(self, element: usize) -> Option<usize> {
        match self {
            Self::Constant(_) => None,
            Self::Global(i) => Some(i),
            Self::Field(offset) => Some(offset + element),
        }
    }

    pub fn value(self, theta: &[f64], element: usize) -> f64 {
        match self {
            Self::Constant(v) => v,
            other => other.index(element).map_or(0.0, |i| theta[i]),
        }
    }
}

/// Parameters bound to a problem: θ plus resolved slots for the physics
/// coefficients and each Neumann load magnitude.
#[derive(Debug, Clone)]
pub struct BoundParams {
    pub theta: Vec<f64>,
    pub physics: Vec<Slot>,
    pub loads: Vec<Slot>,
}

impl BoundParams {
    pub fn len(&self) -> usize {
        self.theta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.is_empty()
    }

    /// Same bindings, different θ.
    pub fn with_theta(&self, theta: &[f64]) -> Result<BoundParams, FemError> {
        if theta.len() != self.theta.len() {
            return Err(FemError::mismatch("parameter vector", self.theta.len(), theta.len()));
        }
        Ok(BoundParams { theta: theta.to_vec(), physics: self.physics.clone(), loads: self.loads.clone() })
    }

    /// Physics coefficient values and θ indices for one element.
    pub fn element_locals(&self, element: usize) -> (Vec<f64>, Vec<Option<usize>>) {
        let values = self.physics.iter().map(|s| s.value(&self.theta, element)).collect();
        let indices = self.physics.iter().map(|s| s.index(element)).collect();
        (values, indices)
    }

    pub fn load_value(&self, load: usize) -> f64 {
        self.loads[load].value(&self.theta, 0)
    }

    pub fn load_index(&self, load: usize) -> Option<usize> {
        self.loads[load].index(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSet {
        ParamSet::new()
            .with_global("E", 200.0)
            .with_field("rho", vec![0.5, 0.6, 0.7])
            .with_global("load", -1.0)
    }

    #[test]
    fn flatten_follows_insertion_order() {
        let p = sample();
        assert_eq!(p.flatten(), vec![200.0, 0.5, 0.6, 0.7, -1.0]);
        assert_eq!(p.offset("rho").unwrap(), 1);
        assert_eq!(p.offset("load").unwrap(), 4);
        assert_eq!(p.labels(), vec!["E", "rho[0]", "rho[1]", "rho[2]", "load"]);
    }

    #[test]
    fn unflatten_keeps_layout() {
        let p = sample();
        let q = p.unflatten(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(q.get("rho").unwrap().values, vec![2.0, 3.0, 4.0]);
        assert!(matches!(p.unflatten(&[1.0]), Err(FemError::DimensionMismatch { expected: 5, found: 1, .. })));
    }

    #[test]
    fn overwrite_keeps_position() {
        let p = sample().with_global("E", 1.0);
        assert_eq!(p.flatten()[0], 1.0);
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn slots_index_theta() {
        let p = sample();
        let theta = p.flatten();
        let field = ParamRef::named("rho").resolve(&p).unwrap();
        assert_eq!(field.index(2), Some(3));
        assert_eq!(field.value(&theta, 2), 0.7);
        let c = ParamRef::from(3.5).resolve(&p).unwrap();
        assert_eq!(c.index(0), None);
        assert_eq!(c.value(&theta, 9), 3.5);
        assert!(matches!(ParamRef::named("nu").resolve(&p), Err(FemError::UnknownParameter(n)) if n == "nu"));
    }

    #[test]
    fn validate_checks_field_length() {
        assert!(sample().validate(3).is_ok());
        assert!(matches!(sample().validate(4), Err(FemError::DimensionMismatch { expected: 4, found: 3, .. })));
    }

    #[test]
    fn round_trips_through_json() {
        let p = sample();
        let text = serde_json::to_string(&p).unwrap();
        let back: ParamSet = serde_json::from_str(&text).unwrap();
        assert_eq!(back, p);
    }
}
