//! Shared fixtures for the integration tests
#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn year_start(year: i32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .expect("valid date")
        .and_hms_opt(0, 0, 0)
        .expect("valid time")
}

pub fn hourly_times(year: i32) -> Vec<NaiveDateTime> {
    let start = year_start(year);
    let end = year_start(year + 1);
    let hours = (end - start).num_hours();
    (0..hours).map(|h| start + Duration::hours(h)).collect()
}

/// Hourly file for a whole year on a 2 x 2 grid.
///
/// Every value of `variables[i]` at hour `h` is `h + 10000 * i`.
pub fn write_hourly_source(path: &Path, year: i32, variables: &[&str]) {
    let steps = hourly_times(year).len();
    let mut file = netcdf::create(path).expect("Failed to create NetCDF file");
    file.add_dimension("time", steps).expect("Failed to add time");
    file.add_dimension("y", 2).expect("Failed to add y");
    file.add_dimension("x", 2).expect("Failed to add x");

    let mut time = file
        .add_variable::<f64>("time", &["time"])
        .expect("Failed to add time variable");
    time.put_attribute("units", format!("hours since {year}-01-01 00:00:00"))
        .expect("Failed to add units");
    time.put_attribute("calendar", "proleptic_gregorian")
        .expect("Failed to add calendar");
    let offsets: Vec<f64> = (0..steps).map(|h| h as f64).collect();
    time.put_values(offsets.as_slice(), ..)
        .expect("Failed to write time");

    let mut lat = file
        .add_variable::<f32>("lat", &["y", "x"])
        .expect("Failed to add lat");
    lat.put_values(&[40.0f32, 40.0, 41.0, 41.0][..], ..)
        .expect("Failed to write lat");

    for (i, name) in variables.iter().enumerate() {
        let mut var = file
            .add_variable::<f32>(name, &["time", "y", "x"])
            .expect("Failed to add variable");
        var.put_attribute("units", "K").expect("Failed to add units");
        let values: Vec<f32> = (0..steps)
            .flat_map(|h| std::iter::repeat((h + 10000 * i) as f32).take(4))
            .collect();
        var.put_values(values.as_slice(), ..)
            .expect("Failed to write data");
    }
}

/// Six-hourly timestamps of the Zarr fixture: 1988-01-30 to 1988-02-02 18:00
pub fn zarr_times() -> Vec<NaiveDateTime> {
    let start = year_start(1988) + Duration::days(29);
    (0..16).map(|i| start + Duration::hours(6 * i)).collect()
}

fn encode(dtype: &str, values: &[f64]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| match dtype {
            "<f4" => (v as f32).to_le_bytes().to_vec(),
            "<f8" => v.to_le_bytes().to_vec(),
            "<i8" => (v as i64).to_le_bytes().to_vec(),
            "<i2" => (v as i16).to_le_bytes().to_vec(),
            other => panic!("fixture has no encoder for {other}"),
        })
        .collect()
}

/// Uncompressed Zarr v2 array chunked along its first axis only.
fn write_zarr_array(
    root: &Path,
    consolidated: &mut Map<String, Value>,
    name: &str,
    dtype: &str,
    shape: &[usize],
    rows_per_chunk: usize,
    fill_value: Value,
    attrs: Value,
    values: &[f64],
) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).expect("Failed to create array dir");
    let mut chunks = shape.to_vec();
    chunks[0] = rows_per_chunk;
    let zarray = json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": dtype,
        "compressor": null,
        "fill_value": fill_value,
        "filters": null,
        "order": "C"
    });
    std::fs::write(dir.join(".zarray"), zarray.to_string()).expect("Failed to write .zarray");
    std::fs::write(dir.join(".zattrs"), attrs.to_string()).expect("Failed to write .zattrs");
    consolidated.insert(format!("{name}/.zarray"), zarray);
    consolidated.insert(format!("{name}/.zattrs"), attrs);

    let row_len: usize = shape[1..].iter().product();
    let inner_key = ".0".repeat(shape.len() - 1);
    for (i, rows) in values.chunks(rows_per_chunk * row_len).enumerate() {
        std::fs::write(dir.join(format!("{i}{inner_key}")), encode(dtype, rows))
            .expect("Failed to write chunk");
    }
}

/// Consolidated Zarr v2 store laid out like the CONUS404 archive.
///
/// - `time`: 16 six-hourly steps, see [`zarr_times`]
/// - `T2` (f32, time x y x x): `100 t + 10 y + x`, with the fill value -9999 at (1, 0, 0)
/// - `Q2` (i16 packed with scale 0.5): raw value `t` everywhere
/// - `lat` (y x x): `40 + y`; `x` (x): `1000 x`
pub fn write_zarr_store(root: &Path) {
    std::fs::create_dir_all(root).expect("Failed to create store");
    let mut consolidated = Map::new();
    let group = json!({"zarr_format": 2});
    let attrs = json!({"title": "CONUS404 fixture"});
    std::fs::write(root.join(".zgroup"), group.to_string()).expect("Failed to write .zgroup");
    std::fs::write(root.join(".zattrs"), attrs.to_string()).expect("Failed to write .zattrs");
    consolidated.insert(".zgroup".to_string(), group);
    consolidated.insert(".zattrs".to_string(), attrs);

    let steps = zarr_times().len();
    let offsets: Vec<f64> = (0..steps).map(|i| (29 * 24 + 6 * i) as f64).collect();
    write_zarr_array(
        root,
        &mut consolidated,
        "time",
        "<i8",
        &[steps],
        steps,
        json!(0),
        json!({
            "_ARRAY_DIMENSIONS": ["time"],
            "units": "hours since 1988-01-01 00:00:00",
            "calendar": "proleptic_gregorian"
        }),
        &offsets,
    );

    let mut t2 = Vec::new();
    for t in 0..steps {
        for y in 0..2 {
            for x in 0..3 {
                t2.push((100 * t + 10 * y + x) as f64);
            }
        }
    }
    t2[6] = -9999.0;
    write_zarr_array(
        root,
        &mut consolidated,
        "T2",
        "<f4",
        &[steps, 2, 3],
        4,
        json!(-9999.0),
        json!({"_ARRAY_DIMENSIONS": ["time", "y", "x"], "coordinates": "lat", "units": "K"}),
        &t2,
    );

    let q2: Vec<f64> = (0..steps).flat_map(|t| std::iter::repeat(t as f64).take(6)).collect();
    write_zarr_array(
        root,
        &mut consolidated,
        "Q2",
        "<i2",
        &[steps, 2, 3],
        8,
        json!(-32768),
        json!({"_ARRAY_DIMENSIONS": ["time", "y", "x"], "scale_factor": 0.5, "units": "kg kg-1"}),
        &q2,
    );

    write_zarr_array(
        root,
        &mut consolidated,
        "lat",
        "<f4",
        &[2, 3],
        2,
        json!("NaN"),
        json!({"_ARRAY_DIMENSIONS": ["y", "x"], "units": "degrees_north"}),
        &[40.0, 40.0, 40.0, 41.0, 41.0, 41.0],
    );
    write_zarr_array(
        root,
        &mut consolidated,
        "x",
        "<f8",
        &[3],
        3,
        json!("NaN"),
        json!({"_ARRAY_DIMENSIONS": ["x"]}),
        &[0.0, 1000.0, 2000.0],
    );

    let document = json!({"zarr_consolidated_format": 1, "metadata": consolidated});
    std::fs::write(root.join(".zmetadata"), document.to_string()).expect("Failed to write .zmetadata");
}

/// A canned HTTP response
#[derive(Clone)]
pub struct Route {
    pub method: &'static str,
    pub path: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl Route {
    pub fn new(method: &'static str, path: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            path: path.into(),
            status,
            body: body.into(),
        }
    }

    pub fn json(method: &'static str, path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(method, path, 200, body.to_string())
    }
}

/// Request line and headers of every request the stub received
pub type RequestLog = Arc<Mutex<Vec<String>>>;

/// Logged requests whose request line contains `needle`
pub fn requests_matching(log: &RequestLog, needle: &str) -> Vec<String> {
    log.lock()
        .expect("log lock")
        .iter()
        .filter(|r| r.lines().next().is_some_and(|line| line.contains(needle)))
        .cloned()
        .collect()
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        401 => "Unauthorized",
        404 => "Not Found",
        _ => "Error",
    }
}

/// Serve routes on a local port until the test ends.
///
/// `routes` receives the server's base URL. Routes match on method and path
/// (query ignored); the first match answers. Unmatched requests get a 404.
pub async fn serve(routes: impl FnOnce(&str) -> Vec<Route>) -> (String, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub server");
    let base = format!("http://{}", listener.local_addr().expect("local addr"));
    let routes = routes(&base);
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                seen.lock().expect("log lock").push(head.clone());

                let mut parts = head.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let target = parts.next().unwrap_or_default();
                let path = target.split('?').next().unwrap_or_default().to_string();

                let (status, body) = routes
                    .iter()
                    .find(|r| r.method == method && r.path == path)
                    .map(|r| (r.status, r.body.clone()))
                    .unwrap_or((404, b"{}".to_vec()));

                let header = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    reason(status),
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (base, log)
}
