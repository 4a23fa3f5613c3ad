//! NetCDF reading and writing for [`Dataset`]s
//!
//! Reading decodes CF packing (`scale_factor`, `add_offset`, `_FillValue`,
//! `missing_value`) into `f32` with `NaN` for missing values and decodes the
//! time coordinate. Writing always goes through a temporary sibling file that
//! is renamed into place once complete.

use crate::calendar::{CfTimeUnits, TimeRange};
use crate::data_source::DatasetSource;
use crate::dataset::{AttrValue, Attributes, CfPacking, Dataset, Variable};
use crate::errors::{FetchError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use ndarray::{ArrayD, IxDyn};
use netcdf::AttributeValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Names tried, in order, when looking for the time coordinate
const TIME_NAMES: &[&str] = &["time", "valid_time", "Time"];

fn is_numeric(var: &netcdf::Variable) -> bool {
    let data_type = format!("{:?}", var.vartype()).to_lowercase();
    !["char", "string", "vlen", "compound", "opaque"]
        .iter()
        .any(|t| data_type.contains(t))
}

fn dim_names(var: &netcdf::Variable) -> Vec<String> {
    var.dimensions().iter().map(|d| d.name().to_string()).collect()
}

fn convert_attr(value: AttributeValue) -> Option<AttrValue> {
    match value {
        AttributeValue::Str(s) => Some(AttrValue::Str(s)),
        AttributeValue::Strs(s) => Some(AttrValue::Str(s.join("\n"))),
        AttributeValue::Double(v) => Some(AttrValue::Float(v)),
        AttributeValue::Doubles(v) => Some(AttrValue::Floats(v)),
        AttributeValue::Float(v) => Some(AttrValue::Float(f64::from(v))),
        AttributeValue::Floats(v) => Some(AttrValue::Floats(v.into_iter().map(f64::from).collect())),
        AttributeValue::Schar(v) => Some(AttrValue::Int(i64::from(v))),
        AttributeValue::Uchar(v) => Some(AttrValue::Int(i64::from(v))),
        AttributeValue::Short(v) => Some(AttrValue::Int(i64::from(v))),
        AttributeValue::Shorts(v) => Some(AttrValue::Ints(v.into_iter().map(i64::from).collect())),
        AttributeValue::Ushort(v) => Some(AttrValue::Int(i64::from(v))),
        AttributeValue::Int(v) => Some(AttrValue::Int(i64::from(v))),
        AttributeValue::Ints(v) => Some(AttrValue::Ints(v.into_iter().map(i64::from).collect())),
        AttributeValue::Uint(v) => Some(AttrValue::Int(i64::from(v))),
        AttributeValue::Longlong(v) => Some(AttrValue::Int(v)),
        AttributeValue::Longlongs(v) => Some(AttrValue::Ints(v)),
        _ => None,
    }
}

fn to_nc_attr(value: &AttrValue) -> AttributeValue {
    match value {
        AttrValue::Str(s) => AttributeValue::Str(s.clone()),
        AttrValue::Float(v) => AttributeValue::Double(*v),
        AttrValue::Floats(v) => AttributeValue::Doubles(v.clone()),
        AttrValue::Int(v) => match i32::try_from(*v) {
            Ok(i) => AttributeValue::Int(i),
            Err(_) => AttributeValue::Double(*v as f64),
        },
        AttrValue::Ints(v) => {
            if v.iter().all(|i| i32::try_from(*i).is_ok()) {
                AttributeValue::Ints(v.iter().map(|&i| i as i32).collect())
            } else {
                AttributeValue::Doubles(v.iter().map(|&i| i as f64).collect())
            }
        }
    }
}

fn read_attrs<'a>(attrs: impl Iterator<Item = netcdf::Attribute<'a>>) -> Result<Attributes> {
    let mut out = Attributes::new();
    for attr in attrs {
        match convert_attr(attr.value()?) {
            Some(value) => {
                out.insert(attr.name().to_string(), value);
            }
            None => debug!(attribute = attr.name(), "skipping attribute of unsupported type"),
        }
    }
    Ok(out)
}

/// Read a numeric variable, applying CF mask and scale.
fn read_decoded(var: &netcdf::Variable) -> Result<Variable> {
    let attrs = read_attrs(var.attributes())?;
    let raw: Vec<f64> = var.get_values::<f64, _>(..)?;
    let decoded = CfPacking::from_attrs(&attrs).decode(raw);

    let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
    let data = ArrayD::from_shape_vec(IxDyn(&shape), decoded)?;
    let mut variable = Variable::new(dim_names(var), data)?;
    variable.attrs = CfPacking::strip(attrs);
    Ok(variable)
}

fn find_time_variable<'f>(file: &'f netcdf::File) -> Option<netcdf::Variable<'f>> {
    let is_time_coord = |var: &netcdf::Variable| {
        let dims = dim_names(var);
        dims.len() == 1
            && dims[0] == var.name()
            && var
                .attribute("units")
                .and_then(|a| a.value().ok())
                .map_or(false, |v| matches!(v, AttributeValue::Str(ref u) if u.contains(" since ")))
    };

    TIME_NAMES
        .iter()
        .filter_map(|name| file.variable(name))
        .find(|var| is_time_coord(var))
        .or_else(|| file.variables().find(|var| is_time_coord(var)))
}

fn read_times(var: &netcdf::Variable) -> Result<(Vec<NaiveDateTime>, CfTimeUnits)> {
    let units = var
        .attribute("units")
        .and_then(|a| a.value().ok())
        .and_then(|v| match v {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        })
        .ok_or_else(|| FetchError::TimeError(format!("'{}' has no units", var.name())))?;
    let calendar = var.attribute("calendar").and_then(|a| a.value().ok()).and_then(|v| match v {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    });
    let units = CfTimeUnits::parse(&units, calendar.as_deref())?;
    let raw: Vec<f64> = var.get_values::<f64, _>(..)?;
    Ok((units.decode(&raw)?, units))
}

/// Header information read without loading any data variable
#[derive(Debug, Clone)]
pub struct DatasetHeader {
    pub time_dim: String,
    pub data_vars: Vec<String>,
    pub times: Vec<NaiveDateTime>,
}

impl DatasetHeader {
    pub fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        Some((*self.times.iter().min()?, *self.times.iter().max()?))
    }
}

fn open_existing(path: &Path) -> Result<netcdf::File> {
    if !path.exists() {
        return Err(FetchError::missing_file(path));
    }
    Ok(netcdf::open(path)?)
}

/// Time coordinate and data variable names of a file.
pub fn read_header(path: &Path) -> Result<DatasetHeader> {
    let file = open_existing(path)?;
    let time_var = find_time_variable(&file).ok_or_else(|| FetchError::DimensionNotFound {
        var: path.display().to_string(),
        dim: "time".to_string(),
    })?;
    let time_dim = time_var.name().to_string();
    let (times, _) = read_times(&time_var)?;

    let mut data_vars: Vec<String> = file
        .variables()
        .filter(|v| v.name() != time_dim && is_numeric(v))
        .filter(|v| dim_names(v).first() == Some(&time_dim))
        .map(|v| v.name().to_string())
        .collect();
    data_vars.sort();

    Ok(DatasetHeader {
        time_dim,
        data_vars,
        times,
    })
}

/// Read a whole file.
pub fn read_dataset(path: &Path) -> Result<Dataset> {
    read_variables(path, None)
}

/// Read the time coordinate, all coordinates and the selected data variables.
pub fn read_variables(path: &Path, only: Option<&[&str]>) -> Result<Dataset> {
    let file = open_existing(path)?;
    let time_var = find_time_variable(&file).ok_or_else(|| FetchError::DimensionNotFound {
        var: path.display().to_string(),
        dim: "time".to_string(),
    })?;
    let time_dim = time_var.name().to_string();
    let (times, units) = read_times(&time_var)?;

    let mut ds = Dataset::new(time_dim.clone(), times);
    ds.time_units = Some(units);
    ds.attrs = read_attrs(file.attributes())?;

    for var in file.variables() {
        let name = var.name().to_string();
        if name == time_dim {
            continue;
        }
        if !is_numeric(&var) {
            debug!(variable = %name, "skipping non-numeric variable");
            continue;
        }

        let dims = dim_names(&var);
        match dims.iter().position(|d| *d == time_dim) {
            None => {
                let coord = read_decoded(&var)?;
                ds.insert_coord(&name, coord)?;
            }
            Some(0) => {
                if only.map_or(true, |names| names.contains(&name.as_str())) {
                    let data_var = read_decoded(&var)?;
                    ds.insert_data_var(&name, data_var)?;
                }
            }
            Some(_) => {
                warn!(
                    variable = %name,
                    file = %path.display(),
                    "skipping variable whose time dimension is not the first axis"
                );
            }
        }
    }

    Ok(ds)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn collect_dimensions(ds: &Dataset) -> Result<BTreeMap<String, usize>> {
    let mut dims = BTreeMap::new();
    dims.insert(ds.time_dim.clone(), ds.len());
    for (name, var) in ds.coords.iter().chain(ds.data_vars.iter()) {
        for (dim, &len) in var.dims.iter().zip(var.data.shape()) {
            match dims.get(dim) {
                Some(&existing) if existing != len => {
                    return Err(FetchError::MergeConflict(format!(
                        "dimension '{dim}' of '{name}' has length {len}, expected {existing}"
                    )));
                }
                Some(_) => {}
                None => {
                    dims.insert(dim.clone(), len);
                }
            }
        }
    }
    Ok(dims)
}

fn put_variable(file: &mut netcdf::FileMut, name: &str, var: &Variable) -> Result<()> {
    let dims: Vec<&str> = var.dims.iter().map(String::as_str).collect();
    let mut nc_var = file.add_variable::<f32>(name, &dims)?;
    nc_var.put_attribute("_FillValue", f32::NAN)?;
    for (attr, value) in var.attrs.iter().filter(|(k, _)| !CfPacking::ATTRS.contains(&k.as_str())) {
        nc_var.put_attribute(attr, to_nc_attr(value))?;
    }
    // borrows unless the array is not C-contiguous
    let data = var.data.as_standard_layout();
    let values = data
        .as_slice()
        .ok_or_else(|| FetchError::Generic(format!("'{name}' is not contiguous")))?;
    nc_var.put_values(values, ..)?;
    Ok(())
}

/// Write a dataset to `path`, replacing any existing file atomically.
pub fn write_dataset(ds: &Dataset, path: &Path) -> Result<()> {
    if ds.is_empty() {
        return Err(FetchError::EmptySelection {
            var: ds.variable_names().join(", "),
            start: "-".to_string(),
            end: "-".to_string(),
        });
    }

    let tmp = temp_path(path);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }

    {
        let mut file = netcdf::create(&tmp)?;
        for (name, len) in collect_dimensions(ds)? {
            file.add_dimension(&name, len)?;
        }

        let units = ds.time_units.clone().unwrap_or_default();
        let mut time = file.add_variable::<f64>(&ds.time_dim, &[ds.time_dim.as_str()])?;
        time.put_attribute("units", units.units_string())?;
        time.put_attribute("calendar", units.calendar.clone())?;
        time.put_attribute("standard_name", "time")?;
        time.put_values(units.encode(&ds.times).as_slice(), ..)?;

        for (name, coord) in &ds.coords {
            put_variable(&mut file, name, coord)?;
        }
        for (name, var) in &ds.data_vars {
            put_variable(&mut file, name, var)?;
        }

        for (name, value) in ds.attrs.iter().filter(|(k, _)| k.as_str() != "history") {
            file.add_attribute(name, to_nc_attr(value))?;
        }
        file.add_attribute("history", "Created by reanalysis-fetch")?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

/// A local NetCDF file used as a dataset handle
#[derive(Debug, Clone)]
pub struct NetcdfSource {
    path: PathBuf,
    header: DatasetHeader,
}

impl NetcdfSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = read_header(&path)?;
        Ok(Self { path, header })
    }
}

#[async_trait]
impl DatasetSource for NetcdfSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn variables(&self) -> Vec<String> {
        self.header.data_vars.clone()
    }

    fn time_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        self.header.time_range()
    }

    async fn select(&self, variable: &str, range: TimeRange) -> Result<Dataset> {
        if !self.has_variable(variable) {
            return Err(FetchError::VariableNotFound {
                var: variable.to_string(),
                available: self.variables(),
            });
        }
        let path = self.path.clone();
        let variable = variable.to_string();
        let ds = tokio::task::spawn_blocking(move || {
            let names = [variable.as_str()];
            read_variables(&path, Some(&names[..]))
        })
        .await
        .map_err(|e| FetchError::TaskPanicked(e.to_string()))??;
        Ok(ds.sort_by_time().select_time(&range))
    }
}

/// A NetCDF file whose data is read on first use
#[derive(Debug)]
pub struct LazyDataset {
    path: PathBuf,
    header: DatasetHeader,
    loaded: Option<Dataset>,
}

impl LazyDataset {
    /// Read the header only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = read_header(&path)?;
        Ok(Self {
            path,
            header,
            loaded: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &DatasetHeader {
        &self.header
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Load the data if not already loaded
    pub fn load(&mut self) -> Result<&Dataset> {
        if self.loaded.is_none() {
            self.loaded = Some(read_dataset(&self.path)?);
        }
        self.loaded
            .as_ref()
            .ok_or_else(|| FetchError::Generic(format!("{} failed to load", self.path.display())))
    }

    pub fn into_dataset(mut self) -> Result<Dataset> {
        match self.loaded.take() {
            Some(ds) => Ok(ds),
            None => read_dataset(&self.path),
        }
    }
}
