//! Ordered, named parameter vectors.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

use crate::errors::{ArborError, ArborResult};

/// A concrete assignment of values to an ordered set of named parameters.
///
/// Names are shared (`Arc`) with the parameter space that produced the
/// vector, so cloning a vector only copies its values. Serializes as a flat
/// JSON object whose keys follow the declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterVector {
    names: Arc<[String]>,
    values: Vec<f64>,
}

impl ParameterVector {
    pub fn new(names: Arc<[String]>, values: Vec<f64>) -> ArborResult<Self> {
        if names.len() != values.len() {
            return Err(ArborError::InvalidParameterVector {
                message: format!(
                    "expected {} values, got {}",
                    names.len(),
                    values.len()
                ),
            });
        }
        Ok(Self { names, values })
    }

    /// Build a vector by evaluating `value` for each name in order.
    pub fn from_fn<F>(names: Arc<[String]>, mut value: F) -> Self
    where
        F: FnMut(usize, &str) -> f64,
    {
        let values = names
            .iter()
            .enumerate()
            .map(|(idx, name)| value(idx, name))
            .collect();
        Self { names, values }
    }

    /// Build from `(name, value)` pairs, keeping their order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<f64>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Self {
            names: names.into(),
            values,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn shared_names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Same names, new values.
    pub fn with_values(&self, values: Vec<f64>) -> ArborResult<Self> {
        Self::new(Arc::clone(&self.names), values)
    }
}

impl fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (name, value)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:.6}")?;
        }
        f.write_str("}")
    }
}

impl Serialize for ParameterVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = ParameterVector;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a flat map of parameter names to numbers")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs: Vec<(String, f64)> = Vec::new();
                while let Some((name, value)) = access.next_entry::<String, f64>()? {
                    if pairs.iter().any(|(n, _)| *n == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate parameter `{name}`"
                        )));
                    }
                    pairs.push((name, value));
                }
                Ok(ParameterVector::from_pairs(pairs))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
