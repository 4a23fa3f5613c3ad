//! In-memory labelled dataset model
//!
//! A [`Dataset`] is a set of variables sharing one time axis. Data variables
//! carry time as their first axis; coordinate variables (grid coordinates such
//! as `lat`/`lon`) do not depend on time. Missing values are `NaN`.

use crate::calendar::{CfTimeUnits, TimeRange};
use crate::errors::{FetchError, Result};
use chrono::NaiveDateTime;
use ndarray::{concatenate, ArrayD, Axis, IxDyn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Attribute value attached to a variable or a dataset
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Float(f64),
    Floats(Vec<f64>),
    Int(i64),
    Ints(Vec<i64>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, the first element for arrays
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Floats(v) => v.first().copied(),
            Self::Ints(v) => v.first().map(|&i| i as f64),
            Self::Str(_) => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// CF mask-and-scale encoding of a stored variable
#[derive(Debug, Clone, PartialEq)]
pub struct CfPacking {
    scale: f64,
    offset: f64,
    fills: Vec<f64>,
}

impl CfPacking {
    /// Attributes consumed by decoding; they are not carried to the decoded variable.
    pub const ATTRS: [&'static str; 4] = ["scale_factor", "add_offset", "_FillValue", "missing_value"];

    pub fn from_attrs(attrs: &Attributes) -> Self {
        let fills = ["_FillValue", "missing_value"]
            .iter()
            .filter_map(|name| attrs.get(*name))
            .flat_map(|value| match value {
                AttrValue::Floats(v) => v.clone(),
                AttrValue::Ints(v) => v.iter().map(|&i| i as f64).collect(),
                other => other.as_f64().into_iter().collect(),
            })
            .collect();
        Self {
            scale: attrs.get("scale_factor").and_then(AttrValue::as_f64).unwrap_or(1.0),
            offset: attrs.get("add_offset").and_then(AttrValue::as_f64).unwrap_or(0.0),
            fills,
        }
    }

    /// Also treat `fill` as missing (e.g. a store-level fill value).
    pub fn with_fill(mut self, fill: f64) -> Self {
        self.fills.push(fill);
        self
    }

    pub fn decode(&self, raw: Vec<f64>) -> Vec<f32> {
        raw.into_iter()
            .map(|v| {
                if v.is_nan() || self.fills.iter().any(|f| *f == v) {
                    f32::NAN
                } else {
                    (v * self.scale + self.offset) as f32
                }
            })
            .collect()
    }

    /// Decode values stored as f32 without widening the buffer.
    pub fn decode_in_place(&self, values: &mut [f32]) {
        let identity = self.scale == 1.0 && self.offset == 0.0;
        for v in values.iter_mut() {
            let wide = f64::from(*v);
            if v.is_nan() || self.fills.iter().any(|f| *f == wide) {
                *v = f32::NAN;
            } else if !identity {
                *v = (wide * self.scale + self.offset) as f32;
            }
        }
    }

    /// Attributes left once the packing ones are removed.
    pub fn strip(attrs: Attributes) -> Attributes {
        attrs
            .into_iter()
            .filter(|(k, _)| !Self::ATTRS.contains(&k.as_str()))
            .collect()
    }
}

/// A named n-dimensional array with dimension names and attributes
#[derive(Debug, Clone)]
pub struct Variable {
    pub dims: Vec<String>,
    pub data: ArrayD<f32>,
    pub attrs: Attributes,
}

impl Variable {
    pub fn new(dims: Vec<String>, data: ArrayD<f32>) -> Result<Self> {
        if dims.len() != data.ndim() {
            return Err(FetchError::Generic(format!(
                "{} dimension names for a {}-dimensional array",
                dims.len(),
                data.ndim()
            )));
        }
        Ok(Self {
            dims,
            data,
            attrs: Attributes::new(),
        })
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    /// Shape without the leading time axis
    fn inner_shape(&self) -> Vec<usize> {
        self.data.shape()[1..].to_vec()
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            dims: self.dims.clone(),
            data: self.data.select(Axis(0), rows),
            attrs: self.attrs.clone(),
        }
    }

    /// Rows placed at new positions along time; rows with no source are NaN.
    fn reindex_rows(&self, mapping: &[Option<usize>]) -> Self {
        let mut shape = vec![mapping.len()];
        shape.extend(self.inner_shape());
        let mut data = ArrayD::from_elem(IxDyn(&shape), f32::NAN);
        for (target, source) in mapping.iter().enumerate() {
            if let Some(source) = source {
                data.index_axis_mut(Axis(0), target)
                    .assign(&self.data.index_axis(Axis(0), *source));
            }
        }
        Self {
            dims: self.dims.clone(),
            data,
            attrs: self.attrs.clone(),
        }
    }
}

/// Variables sharing a single time axis
#[derive(Debug, Clone)]
pub struct Dataset {
    pub time_dim: String,
    pub times: Vec<NaiveDateTime>,
    pub time_units: Option<CfTimeUnits>,
    pub coords: BTreeMap<String, Variable>,
    pub data_vars: BTreeMap<String, Variable>,
    pub attrs: Attributes,
}

impl Dataset {
    pub fn new(time_dim: impl Into<String>, times: Vec<NaiveDateTime>) -> Self {
        Self {
            time_dim: time_dim.into(),
            times,
            time_units: None,
            coords: BTreeMap::new(),
            data_vars: BTreeMap::new(),
            attrs: Attributes::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.data_vars.keys().cloned().collect()
    }

    pub fn data_var(&self, name: &str) -> Option<&Variable> {
        self.data_vars.get(name)
    }

    /// Add a data variable; time must be its first dimension.
    pub fn insert_data_var(&mut self, name: &str, var: Variable) -> Result<()> {
        if var.dims.first() != Some(&self.time_dim) {
            return Err(FetchError::UnsupportedLayout {
                var: name.to_string(),
                message: format!("'{}' must be the first dimension", self.time_dim),
            });
        }
        if var.data.shape()[0] != self.times.len() {
            return Err(FetchError::UnsupportedLayout {
                var: name.to_string(),
                message: format!(
                    "{} time steps, dataset has {}",
                    var.data.shape()[0],
                    self.times.len()
                ),
            });
        }
        self.data_vars.insert(name.to_string(), var);
        Ok(())
    }

    pub fn insert_coord(&mut self, name: &str, var: Variable) -> Result<()> {
        if var.dims.contains(&self.time_dim) {
            return Err(FetchError::UnsupportedLayout {
                var: name.to_string(),
                message: "coordinates may not depend on time".to_string(),
            });
        }
        self.coords.insert(name.to_string(), var);
        Ok(())
    }

    /// Keep the given time indices, in the given order.
    pub fn isel_time(&self, rows: &[usize]) -> Self {
        Self {
            time_dim: self.time_dim.clone(),
            times: rows.iter().map(|&i| self.times[i]).collect(),
            time_units: self.time_units.clone(),
            coords: self.coords.clone(),
            data_vars: self
                .data_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.select_rows(rows)))
                .collect(),
            attrs: self.attrs.clone(),
        }
    }

    /// Timestamps falling on any day of `range`.
    pub fn select_time(&self, range: &TimeRange) -> Self {
        let rows: Vec<usize> = self
            .times
            .iter()
            .enumerate()
            .filter(|(_, t)| range.contains(t))
            .map(|(i, _)| i)
            .collect();
        self.isel_time(&rows)
    }

    /// Keep only the named data variables (coordinates are kept).
    pub fn subset(&self, names: &[&str]) -> Self {
        let mut out = self.clone();
        out.data_vars.retain(|k, _| names.contains(&k.as_str()));
        out
    }

    pub fn sort_by_time(&self) -> Self {
        if self.times.windows(2).all(|w| w[0] <= w[1]) {
            return self.clone();
        }
        let mut rows: Vec<usize> = (0..self.times.len()).collect();
        rows.sort_by_key(|&i| self.times[i]);
        self.isel_time(&rows)
    }

    /// Rename data variables; names not present are ignored.
    pub fn rename(&mut self, mapping: &BTreeMap<String, String>) -> Result<()> {
        for (from, to) in mapping {
            if from == to {
                continue;
            }
            if let Some(var) = self.data_vars.remove(from) {
                if self.data_vars.contains_key(to) {
                    return Err(FetchError::MergeConflict(format!(
                        "cannot rename '{from}' to '{to}': name already used"
                    )));
                }
                self.data_vars.insert(to.clone(), var);
            }
        }
        Ok(())
    }

    /// Place every data variable on a new time index, NaN where absent.
    pub fn reindex_time(&self, times: &[NaiveDateTime]) -> Self {
        let positions: HashMap<NaiveDateTime, usize> = self
            .times
            .iter()
            .enumerate()
            .map(|(i, t)| (*t, i))
            .collect();
        let mapping: Vec<Option<usize>> = times.iter().map(|t| positions.get(t).copied()).collect();

        Self {
            time_dim: self.time_dim.clone(),
            times: times.to_vec(),
            time_units: self.time_units.clone(),
            coords: self.coords.clone(),
            data_vars: self
                .data_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.reindex_rows(&mapping)))
                .collect(),
            attrs: self.attrs.clone(),
        }
    }

    /// Outer join on time. Coordinates and attributes of `self` win.
    pub fn merge(&self, other: &Dataset) -> Result<Self> {
        if self.time_dim != other.time_dim {
            return Err(FetchError::MergeConflict(format!(
                "time dimensions differ: '{}' and '{}'",
                self.time_dim, other.time_dim
            )));
        }
        if let Some(name) = other.data_vars.keys().find(|k| self.data_vars.contains_key(*k)) {
            return Err(FetchError::MergeConflict(format!(
                "variable '{name}' present in both datasets"
            )));
        }

        let times: Vec<NaiveDateTime> = self
            .times
            .iter()
            .chain(other.times.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut merged = if times == self.times {
            self.clone()
        } else {
            self.reindex_time(&times)
        };
        let other = if times == other.times {
            other.clone()
        } else {
            other.reindex_time(&times)
        };

        merged.data_vars.extend(other.data_vars);
        for (name, coord) in other.coords {
            merged.coords.entry(name).or_insert(coord);
        }
        for (name, value) in other.attrs {
            merged.attrs.entry(name).or_insert(value);
        }
        if merged.time_units.is_none() {
            merged.time_units = other.time_units;
        }
        Ok(merged)
    }

    /// Concatenate along time in the given order.
    ///
    /// A variable missing from a part is NaN over that part's timestamps.
    /// Coordinates come from the first part that has them.
    pub fn concat(parts: &[Dataset]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| FetchError::MergeConflict("nothing to concatenate".to_string()))?;

        let mut out = Dataset::new(first.time_dim.clone(), Vec::new());
        out.time_units = first.time_units.clone();
        out.attrs = first.attrs.clone();

        for part in parts {
            if part.time_dim != first.time_dim {
                return Err(FetchError::MergeConflict(format!(
                    "time dimensions differ: '{}' and '{}'",
                    first.time_dim, part.time_dim
                )));
            }
            out.times.extend_from_slice(&part.times);
            for (name, coord) in &part.coords {
                out.coords.entry(name.clone()).or_insert_with(|| coord.clone());
            }
        }

        let mut templates: BTreeMap<&str, &Variable> = BTreeMap::new();
        for part in parts {
            for (name, var) in &part.data_vars {
                templates.entry(name.as_str()).or_insert(var);
            }
        }

        for (name, template) in templates {
            let inner = template.inner_shape();
            let mut pieces: Vec<ArrayD<f32>> = Vec::with_capacity(parts.len());
            for part in parts {
                match part.data_vars.get(name) {
                    Some(var) if var.dims == template.dims && var.inner_shape() == inner => {
                        pieces.push(var.data.clone());
                    }
                    Some(var) => {
                        return Err(FetchError::MergeConflict(format!(
                            "'{name}' has dims {:?} {:?}, expected {:?} {:?}",
                            var.dims,
                            var.data.shape(),
                            template.dims,
                            template.data.shape()
                        )));
                    }
                    None => {
                        let mut shape = vec![part.len()];
                        shape.extend(&inner);
                        pieces.push(ArrayD::from_elem(IxDyn(&shape), f32::NAN));
                    }
                }
            }
            let views: Vec<_> = pieces.iter().map(|p| p.view()).collect();
            let data = concatenate(Axis(0), &views)?;
            out.data_vars.insert(
                name.to_string(),
                Variable {
                    dims: template.dims.clone(),
                    data,
                    attrs: template.attrs.clone(),
                },
            );
        }

        Ok(out.sort_by_time())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use ndarray::Array;

    fn hours(start_day: u32, n: usize) -> Vec<NaiveDateTime> {
        let t0 = NaiveDate::from_ymd_opt(1988, 1, start_day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (0..n).map(|i| t0 + Duration::hours(i as i64)).collect()
    }

    fn series(name: &str, times: Vec<NaiveDateTime>, values: Vec<f32>) -> Dataset {
        let mut ds = Dataset::new("time", times);
        let n = values.len();
        let data = Array::from_shape_vec(IxDyn(&[n, 1]), values).unwrap();
        ds.insert_data_var(name, Variable::new(vec!["time".into(), "x".into()], data).unwrap())
            .unwrap();
        ds
    }

    #[test]
    fn merge_is_an_outer_join_on_time() {
        let a = series("T2", hours(1, 3), vec![1.0, 2.0, 3.0]);
        let b = series("Q2", hours(1, 4)[1..].to_vec(), vec![20.0, 30.0, 40.0]);

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.times, hours(1, 4));
        let t2 = &merged.data_vars["T2"].data;
        let q2 = &merged.data_vars["Q2"].data;
        assert_eq!(t2[[2, 0]], 3.0);
        assert!(t2[[3, 0]].is_nan());
        assert!(q2[[0, 0]].is_nan());
        assert_eq!(q2[[1, 0]], 20.0);
    }

    #[test]
    fn merge_rejects_duplicate_variables() {
        let a = series("T2", hours(1, 2), vec![1.0, 2.0]);
        let b = series("T2", hours(1, 2), vec![1.0, 2.0]);
        assert!(matches!(a.merge(&b), Err(FetchError::MergeConflict(_))));
    }

    #[test]
    fn concat_fills_missing_variables_with_nan() {
        let jan = series("T2", hours(1, 2), vec![1.0, 2.0]).merge(&series("Q2", hours(1, 2), vec![5.0, 6.0])).unwrap();
        let feb = series("T2", hours(10, 3), vec![7.0, 8.0, 9.0]);

        let out = Dataset::concat(&[jan, feb]).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out.data_vars["T2"].data.shape(), &[5, 1]);
        let q2 = &out.data_vars["Q2"].data;
        assert_eq!(q2[[1, 0]], 6.0);
        assert!(q2.slice(ndarray::s![2.., ..]).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn concat_restores_time_order() {
        let late = series("T2", hours(10, 2), vec![3.0, 4.0]);
        let early = series("T2", hours(1, 2), vec![1.0, 2.0]);
        let out = Dataset::concat(&[late, early]).unwrap();
        assert!(out.times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(out.data_vars["T2"].data[[0, 0]], 1.0);
    }

    #[test]
    fn select_time_keeps_whole_days() {
        let ds = series("T2", hours(1, 72), (0..72).map(|v| v as f32).collect());
        let day = NaiveDate::from_ymd_opt(1988, 1, 2).unwrap();
        let out = ds.select_time(&TimeRange::new(day, day));
        assert_eq!(out.len(), 24);
        assert_eq!(out.data_vars["T2"].data[[0, 0]], 24.0);
        assert_eq!(out.data_vars["T2"].data[[23, 0]], 47.0);
    }

    #[test]
    fn rename_moves_variables() {
        let mut ds = series("T2", hours(1, 2), vec![1.0, 2.0]);
        let mapping = BTreeMap::from([("T2".to_string(), "t".to_string()), ("missing".to_string(), "m".to_string())]);
        ds.rename(&mapping).unwrap();
        assert_eq!(ds.variable_names(), vec!["t".to_string()]);
    }

    #[test]
    fn packing_masks_fill_before_scaling() {
        let attrs = Attributes::from([
            ("scale_factor".to_string(), AttrValue::Float(0.5)),
            ("add_offset".to_string(), AttrValue::Float(10.0)),
            ("_FillValue".to_string(), AttrValue::Int(-1)),
            ("units".to_string(), AttrValue::from("K")),
        ]);
        let packing = CfPacking::from_attrs(&attrs).with_fill(9999.0);
        let out = packing.decode(vec![2.0, -1.0, 9999.0, f64::NAN]);
        assert_eq!(out[0], 11.0);
        assert!(out[1..].iter().all(|v| v.is_nan()));
        assert_eq!(CfPacking::strip(attrs).len(), 1);

        let mut stored = vec![2.0f32, -1.0, 9999.0];
        packing.decode_in_place(&mut stored);
        assert_eq!(stored[0], 11.0);
        assert!(stored[1..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn data_vars_must_lead_with_time() {
        let mut ds = Dataset::new("time", hours(1, 2));
        let data = ArrayD::zeros(IxDyn(&[1, 2]));
        let var = Variable::new(vec!["x".into(), "time".into()], data).unwrap();
        assert!(ds.insert_data_var("bad", var).is_err());
    }
}
