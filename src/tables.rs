//! Plaintext tables loaded from CSV files, used to populate a fresh
//! database through the proxy.
//!
//! Headers have the form `name:type`, e.g. `id:uint32,name:string`.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::onions::FieldType;

/// The column types accepted in CSV headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellType {
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    I64,
    ShortString,
}

impl FromStr for CellType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "bool" => Self::Bool,
            "uint8" => Self::U8,
            "uint16" => Self::U16,
            "uint32" => Self::U32,
            "int8" => Self::I8,
            "int16" => Self::I16,
            "int32" => Self::I32,
            "int64" => Self::I64,
            "string" => Self::ShortString,
            _ => return Err(Error::text(format!("unknown data type: {s}"))),
        })
    }
}

impl CellType {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::ShortString => FieldType::Str,
            _ => FieldType::Int,
        }
    }

    /// Parses one cell, checking the range of the declared type.
    pub fn parse(&self, cell: &str) -> Result<Value> {
        let cell = cell.trim();
        if cell.eq_ignore_ascii_case("null") && *self != Self::ShortString {
            return Ok(Value::Null);
        }
        let bad = || Error::text(format!("`{cell}` is not a valid {self:?}"));
        Ok(match self {
            Self::Bool => Value::Int(bool::from_str(cell).map_err(|_| bad())? as i64),
            Self::U8 => Value::Int(u8::from_str(cell).map_err(|_| bad())? as i64),
            Self::U16 => Value::Int(u16::from_str(cell).map_err(|_| bad())? as i64),
            Self::U32 => Value::Int(u32::from_str(cell).map_err(|_| bad())? as i64),
            Self::I8 => Value::Int(i8::from_str(cell).map_err(|_| bad())? as i64),
            Self::I16 => Value::Int(i16::from_str(cell).map_err(|_| bad())? as i64),
            Self::I32 => Value::Int(i32::from_str(cell).map_err(|_| bad())? as i64),
            Self::I64 => Value::Int(i64::from_str(cell).map_err(|_| bad())?),
            Self::ShortString => Value::Text(cell.to_string()),
        })
    }
}

/// A vector of tuples `(column_identifier, data_type)`.
#[derive(Clone, Debug, PartialEq)]
pub struct TableHeaders(pub Vec<(String, CellType)>);

impl TableHeaders {
    fn parse<'a>(columns: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut result = Vec::new();
        for column in columns {
            let Some((label, cell_type)) = column.split_once(':') else {
                return Err(Error::text(format!("header `{column}` is not of the form name:type")));
            };
            result.push((label.trim().to_string(), cell_type.trim().parse()?));
        }
        Ok(Self(result))
    }

    pub fn index_of(&self, column: &str) -> Result<usize> {
        self.0
            .iter()
            .position(|(label, _)| label == column)
            .ok_or_else(|| Error::identifier_not_found(column))
    }
}

/// A plaintext SQL table.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub headers: TableHeaders,
    pub content: Vec<Vec<Value>>,
}

impl Table {
    pub fn create_statement(&self, name: &str) -> String {
        let columns: Vec<String> = self
            .headers
            .0
            .iter()
            .map(|(label, t)| format!("{label} {}", t.field_type().plain_column_type()))
            .collect();
        format!("CREATE TABLE {name} ({})", columns.join(", "))
    }

    /// One multi-row INSERT, or `None` for an empty table.
    pub fn insert_statement(&self, name: &str) -> Option<String> {
        if self.content.is_empty() {
            return None;
        }
        let labels: Vec<&str> = self.headers.0.iter().map(|(l, _)| l.as_str()).collect();
        let rows: Vec<String> = self
            .content
            .iter()
            .map(|row| {
                let cells: Vec<String> = row.iter().map(Value::to_sql).collect();
                format!("({})", cells.join(", "))
            })
            .collect();
        Some(format!(
            "INSERT INTO {name} ({}) VALUES {}",
            labels.join(", "),
            rows.join(", ")
        ))
    }
}

fn load_table(path: &Path) -> Result<Table> {
    let mut rdr = csv::Reader::from_path(path)?;
    let headers = TableHeaders::parse(rdr.headers()?.iter())?;
    let mut content = Vec::new();
    for entry in rdr.records() {
        let entry = entry?;
        if entry.len() != headers.0.len() {
            return Err(Error::text(format!(
                "{}: row has {} cells, expected {}",
                path.display(),
                entry.len(),
                headers.0.len()
            )));
        }
        let row = entry
            .iter()
            .zip(&headers.0)
            .map(|(cell, (_, cell_type))| cell_type.parse(cell))
            .collect::<Result<Vec<_>>>()?;
        content.push(row);
    }
    Ok(Table { headers, content })
}

/// Loads a directory with structure:
/// - `db_dir`:
///   - `table_1.csv`
///   - `table_2.csv`
///   - ...
///
/// Tables are returned sorted by name.
pub fn load_tables(path: &Path) -> Result<Vec<(String, Table)>> {
    let mut result = Vec::new();
    for table_file in fs::read_dir(path)? {
        let table_path = table_file?.path();
        if table_path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let table_name = table_path
            .file_stem()
            .and_then(|f| f.to_str())
            .map(String::from)
            .ok_or_else(|| Error::text(format!("file name error {}", table_path.display())))?;
        result.push((table_name, load_table(&table_path)?));
    }
    result.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(dir: &Path, name: &str, text: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn loads_typed_tables() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "emp.csv", "id:uint32,name:string,active:bool\n1,Alice,true\n2,Bob,false\n");
        write(dir.path(), "dept.csv", "code:int8\n-3\n");
        write(dir.path(), "notes.txt", "ignored");
        let tables = load_tables(dir.path()).unwrap();
        let names: Vec<_> = tables.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["dept", "emp"]);
        let emp = &tables[1].1;
        assert_eq!(emp.headers.index_of("name").unwrap(), 1);
        assert_eq!(
            emp.content[0],
            vec![Value::Int(1), Value::Text("Alice".into()), Value::Int(1)]
        );
        assert_eq!(emp.create_statement("emp"), "CREATE TABLE emp (id BIGINT, name TEXT, active BIGINT)");
        assert_eq!(
            emp.insert_statement("emp").unwrap(),
            "INSERT INTO emp (id, name, active) VALUES (1, 'Alice', 1), (2, 'Bob', 0)"
        );
        assert_eq!(tables[0].1.content[0], vec![Value::Int(-3)]);
    }

    #[test]
    fn rejects_bad_headers_and_cells() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "t.csv", "id:uint8\n300\n");
        assert!(load_tables(dir.path()).is_err());
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "t.csv", "id:float\n1.5\n");
        assert!(load_tables(dir.path()).is_err());
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "t.csv", "id\n1\n");
        assert!(load_tables(dir.path()).is_err());
    }

    #[test]
    fn empty_tables_have_no_insert() {
        let table = Table {
            headers: TableHeaders(vec![("a".into(), CellType::I32)]),
            content: vec![],
        };
        assert_eq!(table.insert_statement("t"), None);
        assert!(table.headers.index_of("b").is_err());
    }
}
