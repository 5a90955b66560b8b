//! CSV staging file
//!
//! The staging file is the only handoff between export and import: a
//! comma-delimited file with a header row whose first column is the
//! export index. Writes go to a temporary sibling and are renamed into
//! place, so readers never observe a partial file.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use ferry_rdbc::Value;

use crate::error::StagingError;

/// Render a value the way it is stored in the staging file
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Bytes(bytes) => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("\\x");
            for b in bytes {
                out.push_str(&format!("{:02x}", b));
            }
            out
        }
        Value::Json(json) => json.to_string(),
        other => other.to_string(),
    }
}

/// Write a header and records to `path`, replacing it atomically.
///
/// Returns the number of data records written.
pub fn write_staging<I>(path: &Path, header: &[String], records: I) -> Result<u64, StagingError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let tmp = tempfile::Builder::new()
        .prefix(".ferry-staging-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    let mut count = 0u64;
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(tmp.as_file()));

        writer.write_record(header)?;
        for record in records {
            writer.write_record(&record)?;
            count += 1;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| StagingError::Io(e.error))?;
    Ok(count)
}

/// A staging file read into memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedFile {
    /// Header row (empty if the file has none)
    pub header: Vec<String>,
    /// Data records with their 1-based line numbers
    pub records: Vec<StagedRecord>,
}

/// One data record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    /// Line the record starts on
    pub line: u64,
    /// Raw field text
    pub fields: Vec<String>,
}

/// Read the whole staging file.
///
/// Records are read without enforcing a uniform width; callers check
/// field counts against the header.
pub fn read_staging(path: &Path) -> Result<StagedFile, StagingError> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut staged = StagedFile::default();
    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let fields: Vec<String> = record.iter().map(str::to_string).collect();
        if i == 0 {
            staged.header = fields;
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or(i as u64 + 1);
        staged.records.push(StagedRecord { line, fields });
    }
    Ok(staged)
}

/// Type inferred for a staged column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Every value parses as a 64-bit integer
    Integer,
    /// Every value parses as a finite float
    Float,
    /// Every value is `true` or `false`
    Boolean,
    /// Anything else
    Text,
}

impl ColumnKind {
    /// Narrowest kind that fits every non-empty value.
    ///
    /// A column with no non-empty values is `Text`.
    pub fn infer<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = false;
        let (mut int, mut float, mut boolean) = (true, true, true);

        for v in values.into_iter().filter(|v| !v.is_empty()) {
            seen = true;
            let v = v.trim();
            int = int && v.parse::<i64>().is_ok();
            float = float && v.parse::<f64>().is_ok_and(f64::is_finite);
            boolean = boolean && parse_bool(v).is_some();
            if !(int || float || boolean) {
                return Self::Text;
            }
        }

        match (seen, int, float, boolean) {
            (false, ..) => Self::Text,
            (true, true, ..) => Self::Integer,
            (true, false, true, _) => Self::Float,
            (true, false, false, true) => Self::Boolean,
            _ => Self::Text,
        }
    }

    /// Convert a raw field; the empty field is NULL
    pub fn to_value(self, field: &str) -> Value {
        if field.is_empty() {
            return Value::Null;
        }
        let trimmed = field.trim();
        match self {
            Self::Integer => trimmed
                .parse()
                .map(Value::Int64)
                .unwrap_or_else(|_| Value::String(field.to_string())),
            Self::Float => trimmed
                .parse()
                .map(Value::Float64)
                .unwrap_or_else(|_| Value::String(field.to_string())),
            Self::Boolean => parse_bool(trimmed)
                .map(Value::Bool)
                .unwrap_or_else(|| Value::String(field.to_string())),
            Self::Text => Value::String(field.to_string()),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    if v.eq_ignore_ascii_case("true") {
        Some(true)
    } else if v.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[test]
    fn test_render_values() {
        assert_eq!(render_value(&Value::Null), "");
        assert_eq!(render_value(&Value::Bool(true)), "true");
        assert_eq!(render_value(&Value::Int32(-4)), "-4");
        assert_eq!(render_value(&Value::Bytes(vec![0xde, 0xad, 0x01])), "\\xdead01");
        assert_eq!(
            render_value(&Value::Json(serde_json::json!({"a": [1, 2]}))),
            r#"{"a":[1,2]}"#
        );
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        assert_eq!(render_value(&Value::DateTime(ts)), "2024-05-01 10:30:00");
    }

    #[test]
    fn test_infer_kinds() {
        assert_eq!(ColumnKind::infer(["1", "", "-20"]), ColumnKind::Integer);
        assert_eq!(ColumnKind::infer(["1", "2.5"]), ColumnKind::Float);
        assert_eq!(ColumnKind::infer(["True", "false", ""]), ColumnKind::Boolean);
        assert_eq!(ColumnKind::infer(["1", "abc"]), ColumnKind::Text);
        assert_eq!(ColumnKind::infer(["", ""]), ColumnKind::Text);
        assert_eq!(ColumnKind::infer(Vec::<&str>::new()), ColumnKind::Text);
    }

    #[test]
    fn test_infer_non_finite_words_as_text() {
        assert_eq!(ColumnKind::infer(["inf", "NaN", "infinity"]), ColumnKind::Text);
        assert_eq!(ColumnKind::infer(["1.5", "-inf"]), ColumnKind::Text);
        assert_eq!(ColumnKind::Text.to_value("NaN"), Value::String("NaN".into()));
    }

    #[test]
    fn test_to_value() {
        assert_eq!(ColumnKind::Integer.to_value(""), Value::Null);
        assert_eq!(ColumnKind::Integer.to_value("42"), Value::Int64(42));
        assert_eq!(ColumnKind::Float.to_value("4"), Value::Float64(4.0));
        assert_eq!(ColumnKind::Boolean.to_value("TRUE"), Value::Bool(true));
        assert_eq!(
            ColumnKind::Text.to_value(" padded "),
            Value::String(" padded ".into())
        );
    }

    #[test]
    fn test_write_then_read_keeps_quoting() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stage.csv");
        let header = vec!["key".to_string(), "note".to_string()];
        let records = vec![
            vec!["a".to_string(), "has, comma".to_string()],
            vec!["b".to_string(), "line\nbreak".to_string()],
        ];

        let written = write_staging(&path, &header, records.clone()).unwrap();
        assert_eq!(written, 2);

        let staged = read_staging(&path).unwrap();
        assert_eq!(staged.header, header);
        assert_eq!(staged.records.len(), 2);
        assert_eq!(staged.records[0].fields, records[0]);
        assert_eq!(staged.records[1].fields, records[1]);
        assert_eq!(staged.records[0].line, 2);
    }

    #[test]
    fn test_header_only_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");
        let header = vec!["key".to_string(), "value".to_string()];

        assert_eq!(write_staging(&path, &header, Vec::new()).unwrap(), 0);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "key,value\n");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stage.csv");
        write_staging(&path, &["a".to_string()], vec![vec!["1".to_string()]]).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["stage.csv".to_string()]);
    }

    #[test]
    fn test_unwritable_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("stage.csv");
        assert!(write_staging(&path, &["a".to_string()], Vec::new()).is_err());
        assert!(!path.exists());
    }
}
