//! Measurement workbook renderer.
//!
//! The template is a CSV grid plus the manifest's `workbook` section. Two
//! substitution forms:
//!
//! - **named cells**: `named_ranges` (preferred) or `cell_addresses`
//!   (legacy) map a field to one cell. A field appearing in both maps is a
//!   template conflict and fails at load.
//! - **header-driven measurements**: the manifest names a header row and a
//!   label per measurement field; the renderer locates each label in that
//!   row case-insensitively and materialises the measurement rows below it.
//!   Robust to column reordering by construction, and the preferred form.
//!
//! Output is the filled grid, serialized back to CSV. Nothing volatile is
//! emitted unless the template maps `generated_at` to a cell.

use std::collections::BTreeMap;
use std::path::Path;

use crate::contract::FieldContract;
use crate::errors::{PolicyReject, RejectCode};
use crate::packet::NormalizedPacket;
use crate::render::manifest::WorkbookManifest;

/// A loaded, conflict-checked workbook template.
#[derive(Debug, Clone)]
pub struct WorkbookTemplate {
    grid: Vec<Vec<String>>,
    manifest: WorkbookManifest,
}

impl WorkbookTemplate {
    /// Validates the manifest against the contract and the grid.
    ///
    /// # Errors
    ///
    /// `RENDER_FAILED` when a field is mapped by both `named_ranges` and
    /// `cell_addresses`; `TEMPLATE_UNKNOWN_PLACEHOLDER` when a mapped field
    /// is not declared by the contract.
    pub fn load(
        grid: Vec<Vec<String>>,
        manifest: WorkbookManifest,
        contract: &FieldContract,
    ) -> Result<Self, PolicyReject> {
        let conflicts: Vec<&String> = manifest
            .named_ranges
            .keys()
            .filter(|k| manifest.cell_addresses.contains_key(*k))
            .collect();
        if let Some(field) = conflicts.first() {
            return Err(PolicyReject::new(RejectCode::RenderFailed)
                .with("field", field.as_str())
                .with("error", "field mapped by both named_ranges and cell_addresses"));
        }

        for field in manifest
            .named_ranges
            .keys()
            .chain(manifest.cell_addresses.keys())
        {
            if field != "generated_at" && contract.field(field).is_none() {
                return Err(PolicyReject::new(RejectCode::TemplateUnknownPlaceholder)
                    .with("placeholder", field.as_str()));
            }
        }

        Ok(Self { grid, manifest })
    }

    /// Fills the grid from the packet and returns it as CSV text.
    ///
    /// # Errors
    ///
    /// `RENDER_FAILED` for unparseable cell addresses or a header label the
    /// grid does not contain.
    pub fn render(
        &self,
        packet: &NormalizedPacket,
        generated_at: &str,
    ) -> Result<String, PolicyReject> {
        let mut grid = self.grid.clone();

        for (field, address) in self
            .manifest
            .named_ranges
            .iter()
            .chain(self.manifest.cell_addresses.iter())
        {
            let value = if field == "generated_at" {
                Some(generated_at.to_string())
            } else {
                packet.get(field).map(str::to_string)
            };
            let Some(value) = value else {
                continue;
            };
            let (row, col) = parse_cell_address(address)?;
            set_cell(&mut grid, row, col, value);
        }

        if let Some(measurements) = &self.manifest.measurements {
            let header_index = measurements.header_row.checked_sub(1).ok_or_else(|| {
                PolicyReject::new(RejectCode::RenderFailed)
                    .with("error", "header_row is 1-based")
            })?;
            let header = grid.get(header_index).cloned().ok_or_else(|| {
                PolicyReject::new(RejectCode::RenderFailed)
                    .with("error", "header row outside the grid")
                    .with("header_row", measurements.header_row as u64)
            })?;

            let mut columns: BTreeMap<&str, usize> = BTreeMap::new();
            for (field, label) in &measurements.columns {
                let position = header
                    .iter()
                    .position(|cell| cell.trim().eq_ignore_ascii_case(label.trim()))
                    .ok_or_else(|| {
                        PolicyReject::new(RejectCode::RenderFailed)
                            .with("error", "header label not found in header row")
                            .with("label", label.as_str())
                    })?;
                columns.insert(field.as_str(), position);
            }

            for (offset, row) in packet.measurements.iter().enumerate() {
                let target = header_index + 1 + offset;
                for (field, col) in &columns {
                    let value = match *field {
                        "item" => row.item.clone(),
                        "spec" => row.spec.clone(),
                        "measured" => row.measured.clone(),
                        "unit" => row.unit.clone().unwrap_or_default(),
                        "result" => row.result.clone().unwrap_or_default(),
                        other => {
                            return Err(PolicyReject::new(RejectCode::RenderFailed)
                                .with("error", "unknown measurement column field")
                                .with("field", other));
                        }
                    };
                    set_cell(&mut grid, target, *col, value);
                }
            }
        }

        Ok(to_csv(&grid))
    }
}

/// Loads a workbook template from a template directory: `workbook.csv` plus
/// the manifest's `workbook` section.
///
/// # Errors
///
/// `TEMPLATE_NOT_FOUND` for a missing grid file; load-time validation as in
/// [`WorkbookTemplate::load`].
pub fn load_workbook_template(
    template_dir: &Path,
    contract: &FieldContract,
) -> Result<WorkbookTemplate, PolicyReject> {
    let grid_path = template_dir.join("workbook.csv");
    let text = std::fs::read_to_string(&grid_path).map_err(|_| {
        PolicyReject::new(RejectCode::TemplateNotFound)
            .with("path", grid_path.display().to_string())
    })?;
    let manifest = super::manifest::load_manifest(template_dir)?
        .workbook
        .unwrap_or_default();
    WorkbookTemplate::load(parse_csv(&text), manifest, contract)
}

/// Parses `B2`-style addresses into 0-based (row, column).
fn parse_cell_address(address: &str) -> Result<(usize, usize), PolicyReject> {
    let trimmed = address.trim();
    let letters: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let digits = &trimmed[letters.len()..];
    if letters.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PolicyReject::new(RejectCode::RenderFailed)
            .with("error", "unparseable cell address")
            .with("address", trimmed));
    }
    let mut col = 0usize;
    for c in letters.to_ascii_uppercase().bytes() {
        col = col * 26 + usize::from(c - b'A') + 1;
    }
    let row: usize = digits.parse().map_err(|_| {
        PolicyReject::new(RejectCode::RenderFailed)
            .with("error", "unparseable cell row")
            .with("address", trimmed)
    })?;
    if row == 0 {
        return Err(PolicyReject::new(RejectCode::RenderFailed)
            .with("error", "cell rows are 1-based")
            .with("address", trimmed));
    }
    Ok((row - 1, col - 1))
}

fn set_cell(grid: &mut Vec<Vec<String>>, row: usize, col: usize, value: String) {
    while grid.len() <= row {
        grid.push(Vec::new());
    }
    let cells = &mut grid[row];
    while cells.len() <= col {
        cells.push(String::new());
    }
    cells[col] = value;
}

/// Minimal CSV codec for the grid: RFC 4180 quoting, comma separator.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                other => cell.push(other),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut cell)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut cell));
                rows.push(std::mem::take(&mut row));
            }
            other => cell.push(other),
        }
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        rows.push(row);
    }
    rows
}

fn to_csv(grid: &[Vec<String>]) -> String {
    let mut out = String::new();
    for row in grid {
        let line: Vec<String> = row.iter().map(|cell| escape_csv(cell)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

fn escape_csv(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::test_support::test_contract;
    use crate::packet::MeasurementRow;
    use crate::render::manifest::MeasurementsManifest;

    fn packet() -> NormalizedPacket {
        let mut packet = NormalizedPacket::default();
        for (key, value) in [("wo_no", "WO-001"), ("line", "L1"), ("result", "PASS")] {
            packet
                .fields
                .insert(key.to_string(), Some(value.to_string()));
        }
        packet.measurements.push(MeasurementRow {
            item: "width".to_string(),
            spec: "10±0.1".to_string(),
            measured: "10.02".to_string(),
            unit: Some("mm".to_string()),
            result: Some("PASS".to_string()),
        });
        packet.measurements.push(MeasurementRow {
            item: "height".to_string(),
            spec: "5±0.1".to_string(),
            measured: "4.98".to_string(),
            unit: Some("mm".to_string()),
            result: Some("PASS".to_string()),
        });
        packet
    }

    fn manifest() -> WorkbookManifest {
        let mut named = BTreeMap::new();
        named.insert("wo_no".to_string(), "B1".to_string());
        named.insert("result".to_string(), "B2".to_string());
        let mut columns = BTreeMap::new();
        for (field, label) in [
            ("item", "Item"),
            ("spec", "Spec"),
            ("measured", "Measured"),
            ("unit", "Unit"),
            ("result", "Result"),
        ] {
            columns.insert(field.to_string(), label.to_string());
        }
        WorkbookManifest {
            named_ranges: named,
            cell_addresses: BTreeMap::new(),
            measurements: Some(MeasurementsManifest {
                header_row: 4,
                columns,
            }),
        }
    }

    fn grid() -> Vec<Vec<String>> {
        parse_csv("WO No,\nResult,\n\nItem,Spec,Measured,Unit,Result\n")
    }

    #[test]
    fn test_cell_address_parsing() {
        assert_eq!(parse_cell_address("A1").unwrap(), (0, 0));
        assert_eq!(parse_cell_address("B2").unwrap(), (1, 1));
        assert_eq!(parse_cell_address("AA10").unwrap(), (9, 26));
        assert!(parse_cell_address("7").is_err());
        assert!(parse_cell_address("B0").is_err());
        assert!(parse_cell_address("B2C").is_err());
    }

    #[test]
    fn test_named_cells_and_measurement_rows() {
        let contract = test_contract();
        let template = WorkbookTemplate::load(grid(), manifest(), &contract).expect("load");
        let csv = template.render(&packet(), "TS").expect("render");
        let rows = parse_csv(&csv);
        assert_eq!(rows[0][1], "WO-001");
        assert_eq!(rows[1][1], "PASS");
        assert_eq!(rows[4], vec!["width", "10±0.1", "10.02", "mm", "PASS"]);
        assert_eq!(rows[5], vec!["height", "5±0.1", "4.98", "mm", "PASS"]);
    }

    #[test]
    fn test_header_driven_mode_survives_column_reordering() {
        let contract = test_contract();
        let reordered = parse_csv("WO No,\nResult,\n\nResult,Unit,Measured,Spec,Item\n");
        let template = WorkbookTemplate::load(reordered, manifest(), &contract).expect("load");
        let csv = template.render(&packet(), "TS").expect("render");
        let rows = parse_csv(&csv);
        assert_eq!(rows[4], vec!["PASS", "mm", "10.02", "10±0.1", "width"]);
    }

    #[test]
    fn test_mapping_conflict_fails_at_load() {
        let contract = test_contract();
        let mut m = manifest();
        m.cell_addresses
            .insert("wo_no".to_string(), "C1".to_string());
        let err = WorkbookTemplate::load(grid(), m, &contract).expect_err("conflict");
        assert_eq!(err.code, RejectCode::RenderFailed);
        assert_eq!(err.context["field"], "wo_no");
    }

    #[test]
    fn test_undeclared_field_fails_at_load() {
        let contract = test_contract();
        let mut m = manifest();
        m.named_ranges
            .insert("serial_number".to_string(), "D1".to_string());
        let err = WorkbookTemplate::load(grid(), m, &contract).expect_err("unknown field");
        assert_eq!(err.code, RejectCode::TemplateUnknownPlaceholder);
    }

    #[test]
    fn test_missing_header_label_fails_at_render() {
        let contract = test_contract();
        let no_header = parse_csv("WO No,\nResult,\n\nWrong,Labels,Here,Now,Ok\n");
        let template = WorkbookTemplate::load(no_header, manifest(), &contract).expect("load");
        let err = template.render(&packet(), "TS").expect_err("label missing");
        assert_eq!(err.code, RejectCode::RenderFailed);
    }

    #[test]
    fn test_csv_round_trip_with_quoting() {
        let grid = vec![vec![
            "plain".to_string(),
            "with,comma".to_string(),
            "with\"quote".to_string(),
            "with\nnewline".to_string(),
        ]];
        let csv = to_csv(&grid);
        assert_eq!(parse_csv(&csv), grid);
    }

    #[test]
    fn test_null_fields_leave_template_cells_untouched() {
        let contract = test_contract();
        let mut m = manifest();
        m.named_ranges.insert("inspector".to_string(), "B3".to_string());
        let base = parse_csv("WO No,\nResult,\nInspector,placeholder\nItem,Spec,Measured,Unit,Result\n");
        let template = WorkbookTemplate::load(base, m, &contract).expect("load");
        let csv = template.render(&packet(), "TS").expect("render");
        let rows = parse_csv(&csv);
        assert_eq!(rows[2][1], "placeholder", "null value must not overwrite");
    }
}
