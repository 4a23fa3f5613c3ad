//! Inspection of local NetCDF files and resolved remote datasets

use crate::catalog::ResolvedDataset;
use crate::errors::{FetchError, Result};
use crate::netcdf_io::read_header;
use netcdf::{AttributeValue, File};
use std::path::Path;

/// Name, type and shape of one NetCDF variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableMetadata {
    pub name: String,
    pub data_type: String,
    pub dimensions: Vec<(String, usize)>,
    pub units: Option<String>,
    pub long_name: Option<String>,
}

impl VariableMetadata {
    pub fn total_elements(&self) -> usize {
        self.dimensions.iter().map(|(_, len)| len).product()
    }
}

fn string_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
    match var.attribute(name)?.value().ok()? {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

/// Structured metadata for every variable, sorted by name.
pub fn variable_metadata(file: &File) -> Vec<VariableMetadata> {
    let mut variables: Vec<VariableMetadata> = file
        .variables()
        .map(|var| VariableMetadata {
            name: var.name(),
            data_type: format!("{:?}", var.vartype()).to_lowercase(),
            dimensions: var
                .dimensions()
                .iter()
                .map(|d| (d.name(), d.len()))
                .collect(),
            units: string_attr(&var, "units"),
            long_name: string_attr(&var, "long_name"),
        })
        .collect();
    variables.sort_by(|a, b| a.name.cmp(&b.name));
    variables
}

/// Prints global attributes, dimensions and variables of a NetCDF file.
pub fn print_metadata(file: &File) -> Result<()> {
    println!("\n===== Global Attributes =====");
    for attr in file.attributes() {
        println!("- {}: {:?}", attr.name(), attr.value()?);
    }

    println!("\n===== Dimensions =====");
    let mut dimensions: Vec<_> = file.dimensions().collect();
    dimensions.sort_by_key(|d| d.name());
    for dim in dimensions {
        if dim.is_unlimited() {
            println!("- {} = {} (unlimited)", dim.name(), dim.len());
        } else {
            println!("- {} = {}", dim.name(), dim.len());
        }
    }

    println!("\n===== Variables =====");
    for meta in variable_metadata(file) {
        let dims: Vec<String> = meta
            .dimensions
            .iter()
            .map(|(name, len)| format!("{name}[{len}]"))
            .collect();
        println!("- {} {} ({})", meta.name, meta.data_type, dims.join(", "));
        let details: Vec<String> = [("units", &meta.units), ("long_name", &meta.long_name)]
            .iter()
            .filter_map(|(key, value)| value.as_ref().map(|v| format!("{key}: {v}")))
            .collect();
        if !details.is_empty() {
            println!("    {}", details.join(", "));
        }
    }
    Ok(())
}

/// Prints a local file's structure and its decoded time span.
pub fn inspect_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(FetchError::missing_file(path));
    }
    let file = netcdf::open(path)?;
    println!("File: {}", path.display());
    print_metadata(&file)?;

    match read_header(path) {
        Ok(header) => match header.time_range() {
            Some((start, end)) => println!(
                "\nTime ({}): {} steps, {start} to {end}",
                header.time_dim,
                header.times.len()
            ),
            None => println!("\nTime ({}): empty", header.time_dim),
        },
        Err(e) => println!("\nTime: not decodable ({e})"),
    }
    Ok(())
}

/// Prints the backend, variables and time span of a resolved collection.
pub fn print_resolved(resolved: &ResolvedDataset) {
    println!("Collection: {}", resolved.collection);
    println!("Backend: {}", resolved.backend);
    println!("Source: {}", resolved.handle.describe());
    match resolved.time_range {
        Some((start, end)) => println!("Time: {start} to {end}"),
        None => println!("Time: empty"),
    }
    println!("\n===== Variables ({}) =====", resolved.variables.len());
    for name in &resolved.variables {
        println!("- {name}");
    }
}
