// rust/trainer-core/src/metrics.rs

//! Logged metric values as seen by callbacks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A value logged by the training loop under a metric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Scalar(f64),
    Integer(i64),
    /// A reduced tensor. Only single-element tensors convert to a scalar.
    Tensor(Vec<f64>),
}

impl MetricValue {
    /// Converts to a scalar, or `None` if this is a multi-element tensor.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Integer(v) => Some(*v as f64),
            MetricValue::Tensor(values) if values.len() == 1 => Some(values[0]),
            MetricValue::Tensor(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Scalar(value)
    }
}

impl From<f32> for MetricValue {
    fn from(value: f32) -> Self {
        MetricValue::Scalar(value as f64)
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

/// Metrics available to callbacks after an evaluation, keyed by name.
///
/// Ordered so that error messages listing the available keys are stable.
pub type Metrics = BTreeMap<String, MetricValue>;

/// Builds a [`Metrics`] map from `(key, value)` pairs.
pub fn metrics_from<K, V, I>(pairs: I) -> Metrics
where
    K: Into<String>,
    V: Into<MetricValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
