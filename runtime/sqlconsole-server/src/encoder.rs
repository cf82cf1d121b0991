use sqlconsole_db::{Cursor, DynamicValue, Slot, StoreError};

/// A fully materialised result set. Every row is as wide as `columns`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<DynamicValue>>,
}

/// Drains `cursor` into a [`Table`], resolving each column's scan type once
/// and decoding every row through freshly typed slots.
pub fn encode<C: Cursor>(mut cursor: C) -> Result<Table, StoreError> {
    let columns = cursor.column_names()?;
    let scan_types = cursor.column_types()?;
    let mut rows = Vec::new();
    while cursor.advance()? {
        let mut slots: Vec<Slot> = scan_types.iter().copied().map(Slot::typed).collect();
        cursor.scan_into(&mut slots)?;
        rows.push(slots.into_iter().map(Slot::into_value).collect());
    }
    cursor.finish()?;
    Ok(Table { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCursor, Fault};
    use sqlconsole_db::ScanType;

    fn people() -> FakeCursor {
        FakeCursor::new(
            &[("id", ScanType::Int), ("name", ScanType::Text)],
            vec![
                vec![DynamicValue::Int(1), DynamicValue::Text("ada".into())],
                vec![DynamicValue::Int(2), DynamicValue::Null],
            ],
        )
    }

    #[test]
    fn rows_keep_column_width_and_nulls() {
        let table = encode(people()).expect("encode");
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(
            table.rows,
            vec![
                vec![DynamicValue::Int(1), DynamicValue::Text("ada".into())],
                vec![DynamicValue::Int(2), DynamicValue::Null],
            ]
        );
        assert!(table.rows.iter().all(|row| row.len() == table.columns.len()));
    }

    #[test]
    fn empty_result_keeps_columns() {
        let cursor = FakeCursor::new(&[("id", ScanType::Int)], Vec::new());
        let table = encode(cursor).expect("encode");
        assert_eq!(table.columns, vec!["id"]);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn each_failure_point_surfaces_store_text() {
        let cases = [
            (Fault::Columns, "unsupported column type point"),
            (Fault::Scan, "cannot store text value in int column"),
            (Fault::Finish, "connection reset mid-result"),
        ];
        for (fault, text) in cases {
            let err = encode(people().with_fault(fault)).expect_err("fault");
            assert_eq!(err.to_string(), text);
        }
    }

    #[test]
    fn mistyped_value_is_a_scan_failure() {
        let cursor = FakeCursor::new(
            &[("n", ScanType::Int)],
            vec![vec![DynamicValue::Text("seven".into())]],
        );
        let err = encode(cursor).expect_err("mismatch");
        assert!(matches!(err, StoreError::Scan(_)));
    }
}
