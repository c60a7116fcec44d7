//! Bounded parameter spaces.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use arbor_types::{config_error, invalid_params, ArborResult, ParameterVector};

/// How a parameter range is traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    #[default]
    Linear,
    /// Uniform in log space; both bounds must be positive.
    Log,
}

/// A single bounded dimension of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name (e.g. "branch_prob").
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    #[serde(default)]
    pub scale: Scale,
}

impl ParameterDef {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Clip into `[lower, upper]`; NaN maps to `lower`.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            self.lower
        } else {
            value.clamp(self.lower, self.upper)
        }
    }

    /// Position of `value` inside the range, in `[0, 1]`.
    pub fn to_unit(&self, value: f64) -> f64 {
        let v = self.clamp(value);
        let u = match self.scale {
            Scale::Linear => (v - self.lower) / (self.upper - self.lower),
            Scale::Log => (v.ln() - self.lower.ln()) / (self.upper.ln() - self.lower.ln()),
        };
        if u.is_nan() {
            0.0
        } else {
            u.clamp(0.0, 1.0)
        }
    }

    /// Inverse of [`ParameterDef::to_unit`]; `u` is clipped to `[0, 1]` first.
    pub fn from_unit(&self, u: f64) -> f64 {
        let u = if u.is_nan() { 0.0 } else { u.clamp(0.0, 1.0) };
        let value = match self.scale {
            Scale::Linear => self.lower + u * (self.upper - self.lower),
            Scale::Log => (self.lower.ln() + u * (self.upper.ln() - self.lower.ln())).exp(),
        };
        self.clamp(value)
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.from_unit(rng.gen_range(0.0..=1.0))
    }

    fn validate(&self) -> ArborResult<()> {
        if !(self.lower.is_finite() && self.upper.is_finite()) {
            return Err(config_error!("parameter `{}` has non-finite bounds", self.name));
        }
        if self.lower >= self.upper {
            return Err(config_error!(
                "parameter `{}` needs lower < upper, got [{}, {}]",
                self.name,
                self.lower,
                self.upper
            ));
        }
        if self.scale == Scale::Log && self.lower <= 0.0 {
            return Err(config_error!(
                "log-scaled parameter `{}` needs a positive lower bound, got {}",
                self.name,
                self.lower
            ));
        }
        Ok(())
    }
}

/// An ordered list of bounded parameters.
///
/// Serializes as a JSON array of [`ParameterDef`]s. Vectors produced by the
/// space share its name list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ParameterDef>", into = "Vec<ParameterDef>")]
pub struct ParameterSpace {
    parameters: Vec<ParameterDef>,
    names: Arc<[String]>,
}

impl From<Vec<ParameterDef>> for ParameterSpace {
    fn from(parameters: Vec<ParameterDef>) -> Self {
        let names = parameters.iter().map(|p| p.name.clone()).collect();
        Self { parameters, names }
    }
}

impl From<ParameterSpace> for Vec<ParameterDef> {
    fn from(space: ParameterSpace) -> Self {
        space.parameters
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::from(Vec::<ParameterDef>::new())
    }

    pub fn add(mut self, def: ParameterDef) -> Self {
        self.parameters.push(def);
        self.parameters.into()
    }

    pub fn add_linear(self, name: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.add(ParameterDef {
            name: name.into(),
            lower,
            upper,
            scale: Scale::Linear,
        })
    }

    pub fn add_log(self, name: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.add(ParameterDef {
            name: name.into(),
            lower,
            upper,
            scale: Scale::Log,
        })
    }

    /// Load a space from a JSON array of definitions and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> ArborResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let space: Self = serde_json::from_str(&text)?;
        space.validate()?;
        Ok(space)
    }

    /// Reject empty spaces, duplicate names and malformed bounds.
    pub fn validate(&self) -> ArborResult<()> {
        if self.parameters.is_empty() {
            return Err(config_error!("parameter space is empty"));
        }
        for (idx, def) in self.parameters.iter().enumerate() {
            def.validate()?;
            if self.parameters[..idx].iter().any(|p| p.name == def.name) {
                return Err(config_error!("duplicate parameter `{}`", def.name));
            }
        }
        Ok(())
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Independent draw per parameter, uniform in linear or log space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterVector {
        ParameterVector::from_fn(Arc::clone(&self.names), |idx, _| {
            self.parameters[idx].sample(rng)
        })
    }

    /// Clip every component into bounds, matching by name. Missing or NaN
    /// components map to the lower bound.
    pub fn clamp(&self, vector: &ParameterVector) -> ParameterVector {
        ParameterVector::from_fn(Arc::clone(&self.names), |idx, name| {
            self.parameters[idx].clamp(vector.get(name).unwrap_or(f64::NAN))
        })
    }

    /// Fail unless `vector` has exactly this space's names, in order.
    pub fn check_names(&self, vector: &ParameterVector) -> ArborResult<()> {
        if vector.names() != &self.names[..] {
            return Err(invalid_params!(
                "expected parameters [{}], got [{}]",
                self.names.join(", "),
                vector.names().join(", ")
            ));
        }
        Ok(())
    }

    /// [`ParameterSpace::check_names`], plus every value inside its bounds.
    pub fn check(&self, vector: &ParameterVector) -> ArborResult<()> {
        self.check_names(vector)?;
        for (def, value) in self.parameters.iter().zip(vector.values()) {
            if !def.contains(*value) {
                return Err(invalid_params!(
                    "{} = {} is outside [{}, {}]",
                    def.name,
                    value,
                    def.lower,
                    def.upper
                ));
            }
        }
        Ok(())
    }

    /// Map a vector into the unit cube, matching by name.
    pub fn to_unit(&self, vector: &ParameterVector) -> Vec<f64> {
        self.parameters
            .iter()
            .map(|def| def.to_unit(vector.get(&def.name).unwrap_or(f64::NAN)))
            .collect()
    }

    /// Decode unit-cube coordinates; out-of-cube input is clipped and
    /// missing trailing coordinates default to the midpoint.
    pub fn from_unit(&self, unit: &[f64]) -> ParameterVector {
        ParameterVector::from_fn(Arc::clone(&self.names), |idx, _| {
            self.parameters[idx].from_unit(unit.get(idx).copied().unwrap_or(0.5))
        })
    }

    /// Midpoint of the unit cube, decoded.
    pub fn center(&self) -> ParameterVector {
        self.from_unit(&vec![0.5; self.len()])
    }

    /// Build a vector from values in declared order.
    pub fn vector(&self, values: Vec<f64>) -> ArborResult<ParameterVector> {
        ParameterVector::new(Arc::clone(&self.names), values)
    }
}
