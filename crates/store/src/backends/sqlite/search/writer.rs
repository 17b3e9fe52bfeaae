//! SQLite search index writer.
//!
//! Maps each [`ExtractedValue`] to one `search_index` row. Only the columns of
//! the value's type are set; the rest stay NULL.

use rusqlite::{Connection, params};
use rust_decimal::prelude::ToPrimitive;

use crate::search::{ExtractedValue, IndexValue, ReferenceKind, ReferenceTarget};

/// A `search_index` row without its owner.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IndexRow {
    pub(crate) param_name: String,
    pub(crate) param_url: String,
    pub(crate) param_type: &'static str,
    pub(crate) value_string: Option<String>,
    pub(crate) value_string_raw: Option<String>,
    pub(crate) value_token_system: Option<String>,
    pub(crate) value_token_code: Option<String>,
    pub(crate) value_token_display: Option<String>,
    pub(crate) value_date_start: Option<String>,
    pub(crate) value_date_end: Option<String>,
    pub(crate) value_number: Option<f64>,
    pub(crate) value_quantity_value: Option<f64>,
    pub(crate) value_quantity_unit: Option<String>,
    pub(crate) value_quantity_system: Option<String>,
    pub(crate) value_quantity_code: Option<String>,
    pub(crate) value_quantity_canonical: Option<f64>,
    pub(crate) value_quantity_canonical_unit: Option<String>,
    pub(crate) value_reference: Option<String>,
    pub(crate) value_reference_type: Option<String>,
    pub(crate) value_reference_id: Option<String>,
    pub(crate) value_uri: Option<String>,
    pub(crate) composite_group: Option<u32>,
    pub(crate) component_index: Option<u8>,
}

impl IndexRow {
    /// Lays out an extracted value in index columns.
    pub fn from_extracted(extracted: &ExtractedValue) -> Self {
        let mut row = IndexRow {
            param_name: extracted.param_name.clone(),
            param_url: extracted.param_url.clone(),
            param_type: extracted.param_type.as_str(),
            composite_group: extracted.composite_group,
            component_index: extracted.component_index,
            ..Default::default()
        };

        match &extracted.value {
            IndexValue::String { normalized, raw } => {
                row.value_string = Some(normalized.clone());
                row.value_string_raw = Some(raw.clone());
            }
            IndexValue::Token { system, code, display } => {
                row.value_token_system = system.clone();
                row.value_token_code = code.clone();
                row.value_token_display = display.clone();
            }
            IndexValue::Date(temporal) => {
                let range = temporal.to_range();
                row.value_date_start = Some(range.start_key());
                row.value_date_end = Some(range.end_key());
            }
            IndexValue::Number(n) => row.value_number = n.to_f64(),
            IndexValue::Quantity {
                value,
                unit,
                system,
                code,
                canonical,
            } => {
                row.value_quantity_value = value.to_f64();
                row.value_quantity_unit = unit.clone();
                row.value_quantity_system = system.clone();
                row.value_quantity_code = code.clone();
                if let Some(canonical) = canonical {
                    row.value_quantity_canonical = canonical.value.to_f64();
                    row.value_quantity_canonical_unit = Some(canonical.unit.to_string());
                }
            }
            IndexValue::Reference(target) => {
                let (text, ty, id) = reference_columns(target);
                row.value_reference = Some(text);
                row.value_reference_type = ty;
                row.value_reference_id = id;
            }
            IndexValue::Uri(uri) => row.value_uri = Some(uri.clone()),
        }
        row
    }
}

/// `(value_reference, type, id)` for a reference. Only targets in this store
/// carry type and id.
pub(crate) fn reference_columns(target: &ReferenceTarget) -> (String, Option<String>, Option<String>) {
    let local = matches!(target.kind, ReferenceKind::Relative | ReferenceKind::UrnUuid);
    match target.canonical() {
        Some(canonical) if local => (canonical, target.target_type.clone(), target.target_id.clone()),
        // An untyped urn:uuid still matches by id.
        None if target.kind == ReferenceKind::UrnUuid => (target.raw.clone(), None, target.target_id.clone()),
        _ => (target.raw.clone(), None, None),
    }
}

/// SQLite writer for the search index.
pub struct SqliteSearchIndexWriter;

impl SqliteSearchIndexWriter {
    /// Removes every index row of a resource.
    pub fn delete(conn: &Connection, resource_type: &str, resource_id: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "DELETE FROM search_index WHERE resource_type = ?1 AND resource_id = ?2",
            params![resource_type, resource_id],
        )
    }

    /// Inserts one row per value.
    pub fn insert(
        conn: &Connection,
        resource_type: &str,
        resource_id: &str,
        values: &[ExtractedValue],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO search_index (
                resource_type, resource_id, param_name, param_url, param_type,
                value_string, value_string_raw,
                value_token_system, value_token_code, value_token_display,
                value_date_start, value_date_end,
                value_number,
                value_quantity_value, value_quantity_unit, value_quantity_system, value_quantity_code,
                value_quantity_canonical, value_quantity_canonical_unit,
                value_reference, value_reference_type, value_reference_id,
                value_uri, composite_group, component_index
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        )?;

        for value in values {
            let row = IndexRow::from_extracted(value);
            stmt.execute(params![
                resource_type,
                resource_id,
                row.param_name,
                row.param_url,
                row.param_type,
                row.value_string,
                row.value_string_raw,
                row.value_token_system,
                row.value_token_code,
                row.value_token_display,
                row.value_date_start,
                row.value_date_end,
                row.value_number,
                row.value_quantity_value,
                row.value_quantity_unit,
                row.value_quantity_system,
                row.value_quantity_code,
                row.value_quantity_canonical,
                row.value_quantity_canonical_unit,
                row.value_reference,
                row.value_reference_type,
                row.value_reference_id,
                row.value_uri,
                row.composite_group,
                row.component_index,
            ])?;
        }
        Ok(values.len())
    }
}
