use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to export data: {0}")]
    ExportFailed(String),
    #[error("Unsupported format \"{0}\". Supported formats: json, csv")]
    UnsupportedFormat(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatasetFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for DatasetFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(DatasetFormat::Json),
            "csv" => Ok(DatasetFormat::Csv),
            _ => Err(ExportError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetFormat::Json => write!(f, "json"),
            DatasetFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Flattens one record into dotted key paths. Nested objects recurse; arrays,
/// scalars and null are leaves.
pub fn flatten_record(value: &Value) -> IndexMap<String, Value> {
    let mut flat = IndexMap::new();
    if let Value::Object(map) = value {
        flatten_into(map, "", &mut flat);
    }
    flat
}

fn flatten_into(map: &serde_json::Map<String, Value>, prefix: &str, flat: &mut IndexMap<String, Value>) {
    for (key, value) in map {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Object(nested) => flatten_into(nested, &full_key, flat),
            other => {
                flat.insert(full_key, other.clone());
            }
        }
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub struct Exporter;

impl Exporter {
    pub fn new() -> Self {
        Self
    }

    pub fn export_to_json<T: Serialize, P: AsRef<Path>>(
        &self,
        data: &[T],
        path: P,
    ) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| ExportError::ExportFailed(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn export_to_csv<T: Serialize, P: AsRef<Path>>(
        &self,
        data: &[T],
        path: P,
    ) -> Result<(), ExportError> {
        let rows = data
            .iter()
            .map(|record| {
                serde_json::to_value(record)
                    .map(|value| flatten_record(&value))
                    .map_err(|e| ExportError::ExportFailed(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let file = BufWriter::new(File::create(path)?);
        if rows.is_empty() {
            return Ok(());
        }

        let mut headers: Vec<&str> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !headers.contains(&key.as_str()) {
                    headers.push(key);
                }
            }
        }

        let mut wtr = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        wtr.write_record(&headers)?;
        for row in &rows {
            wtr.write_record(headers.iter().map(|h| cell(row.get(*h))))?;
        }

        wtr.flush()?;
        Ok(())
    }

    /// Creates missing parent directories, then writes `data` in `format`.
    pub fn export<T: Serialize, P: AsRef<Path>>(
        &self,
        data: &[T],
        path: P,
        format: DatasetFormat,
    ) -> Result<(), ExportError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        match format {
            DatasetFormat::Json => self.export_to_json(data, path)?,
            DatasetFormat::Csv => self.export_to_csv(data, path)?,
        }

        info!("Wrote {} dataset with {} records to {}", format, data.len(), path.display());
        Ok(())
    }
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `format` and writes the dataset. An unsupported format fails before
/// anything touches the filesystem.
pub fn write_dataset<T: Serialize, P: AsRef<Path>>(
    data: &[T],
    path: P,
    format: &str,
) -> Result<(), ExportError> {
    let format: DatasetFormat = format.parse()?;
    Exporter::new().export(data, path, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<Value> {
        vec![
            json!({
                "loadedUrl": "https://a.test/",
                "label": "START",
                "extractionResult": {"title": "Hello, \"world\"", "metas": [{"name": "x"}]},
                "responseStatus": 200,
                "errorInfo": null,
            }),
            json!({
                "loadedUrl": "https://b.test/",
                "label": "START",
                "extractionResult": null,
                "responseStatus": null,
                "errorInfo": {"message": "net::ERR_FAILED", "trace": "line1\nline2"},
            }),
        ]
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("json".parse::<DatasetFormat>().unwrap(), DatasetFormat::Json);
        assert_eq!("CSV".parse::<DatasetFormat>().unwrap(), DatasetFormat::Csv);
        assert!(matches!(
            "xml".parse::<DatasetFormat>(),
            Err(ExportError::UnsupportedFormat(f)) if f == "xml"
        ));
        assert_eq!(DatasetFormat::default(), DatasetFormat::Json);
    }

    #[test]
    fn test_flatten_record() {
        let flat = flatten_record(&json!({
            "a": 1,
            "b": {"c": "x", "d": {"e": null}},
            "f": [1, 2],
        }));

        let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b.c", "b.d.e", "f"]);
        assert_eq!(flat["f"], json!([1, 2]));
        assert!(flat["b.d.e"].is_null());
    }

    #[test]
    fn test_export_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.json");

        write_dataset(&sample(), &path, "json").unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, Value::Array(sample()));
    }

    #[test]
    fn test_export_empty() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("empty.json");
        let csv_path = dir.path().join("empty.csv");
        let empty: Vec<Value> = Vec::new();

        write_dataset(&empty, &json_path, "json").unwrap();
        write_dataset(&empty, &csv_path, "csv").unwrap();

        assert_eq!(std::fs::read_to_string(json_path).unwrap(), "[]");
        assert_eq!(std::fs::read_to_string(csv_path).unwrap(), "");
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        write_dataset(&sample(), &path, "csv").unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = rdr.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(
            headers,
            vec![
                "loadedUrl",
                "label",
                "extractionResult.title",
                "extractionResult.metas",
                "responseStatus",
                "errorInfo",
                "extractionResult",
                "errorInfo.message",
                "errorInfo.trace",
            ]
        );

        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "https://a.test/");
        assert_eq!(&rows[0][2], "Hello, \"world\"");
        assert_eq!(&rows[0][3], "[{\"name\":\"x\"}]");
        assert_eq!(&rows[0][4], "200");
        assert_eq!(&rows[0][5], "");
        assert_eq!(&rows[1][4], "");
        assert_eq!(&rows[1][8], "line1\nline2");
    }

    #[test]
    fn test_csv_quoting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quoted.csv");

        write_dataset(&[json!({"a": "plain", "b": "x,y", "c": "say \"hi\""})], &path, "csv").unwrap();

        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "a,b,c\nplain,\"x,y\",\"say \"\"hi\"\"\"\n"
        );
    }

    #[test]
    fn test_unsupported_format_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.xml");

        let err = write_dataset(&sample(), &path, "xml").unwrap_err();

        assert!(matches!(err, ExportError::UnsupportedFormat(_)));
        assert!(!path.exists());
        assert!(!dir.path().join("out").exists());
    }
}
