use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ingest_core::{IngestError, Result};

/// 列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
}

/// 列定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
}

/// 表结构描述符：有序列清单加类型
///
/// 写路径只依据该描述符构造语句和绑定参数，
/// 绝不在运行时从首条记录的形状推断列。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

/// SQL 参数值
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

/// 一条记录：与表结构的列顺序对齐的值序列
pub type Record = Vec<SqlValue>;

impl TableSchema {
    pub fn new(name: &str, columns: &[(&str, ColumnType)]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(col, ty)| ColumnSpec {
                    name: col.to_string(),
                    ty: *ty,
                })
                .collect(),
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// 将 JSON 对象（上传控制器产出的行形状）转换为有序类型化记录
    ///
    /// 缺失字段与显式 null 都转换为 NULL，类型不符返回配置错误。
    pub fn record_from_json(&self, object: &serde_json::Value) -> Result<Record> {
        let map = object.as_object().ok_or_else(|| {
            IngestError::Configuration(format!("表 {} 的记录必须是JSON对象", self.name))
        })?;

        let mut record = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = match map.get(&column.name) {
                None | Some(serde_json::Value::Null) => SqlValue::Null,
                Some(raw) => convert_json_value(&self.name, column, raw)?,
            };
            record.push(value);
        }
        Ok(record)
    }
}

fn convert_json_value(
    table: &str,
    column: &ColumnSpec,
    raw: &serde_json::Value,
) -> Result<SqlValue> {
    let mismatch = || {
        IngestError::Configuration(format!(
            "表 {table} 列 {} 期望 {:?} 类型，实际值 {raw}",
            column.name, column.ty
        ))
    };

    let value = match column.ty {
        ColumnType::Text => SqlValue::Text(raw.as_str().ok_or_else(mismatch)?.to_string()),
        ColumnType::Integer => SqlValue::Integer(raw.as_i64().ok_or_else(mismatch)?),
        ColumnType::Real => SqlValue::Real(raw.as_f64().ok_or_else(mismatch)?),
        ColumnType::Boolean => SqlValue::Boolean(raw.as_bool().ok_or_else(mismatch)?),
        ColumnType::Timestamp => {
            let text = raw.as_str().ok_or_else(mismatch)?;
            let parsed = DateTime::parse_from_rfc3339(text).map_err(|_| mismatch())?;
            SqlValue::Timestamp(parsed.with_timezone(&Utc))
        }
    };
    Ok(value)
}
