//! Column value validation.
//!
//! A column is checked by exactly one of, in order of precedence: its custom rule, its pattern, or its semantic type.
//! Every setter and every create-time value goes through [validate] before any statement is built, so a rejected
//! value never reaches the database.
use crate::descriptor::{ColumnType, RuleContext, TableDescriptor};
use crate::errors::{Error, Result};
use crate::value::Value;

/// Validate `value` for column `column` of `table`, returning the value to store.
///
/// Numeric columns normalize numeric text to a number; string columns store numbers as text.  Everything else is
/// returned unchanged.
pub fn validate(
    table: &TableDescriptor,
    column: usize,
    value: Value,
    current: &[Value],
) -> Result<Value> {
    let col = table.column_at(column);

    if let Some(rule) = col.get_rule() {
        let ctx = RuleContext {
            table,
            values: current,
        };
        if !rule.check(&ctx, &value, col.get_name()) {
            return Err(Error::ConstraintViolation {
                table: table.display_name().to_string(),
                column: col.get_name().to_string(),
            });
        }
        return Ok(value);
    }

    if let Some(pattern) = col.get_pattern() {
        let text = value.to_string();
        if !pattern.is_match(&text) {
            return Err(Error::PatternMismatch {
                table: table.display_name().to_string(),
                column: col.get_name().to_string(),
                pattern: pattern.as_str().to_string(),
                value: text,
            });
        }
        return Ok(value);
    }

    let column_type = col.get_column_type();
    let mismatch = || Error::TypeMismatch {
        table: table.display_name().to_string(),
        column: col.get_name().to_string(),
        expected: column_type.describe(),
        value: format!("{:?}", value),
    };

    match column_type {
        ColumnType::NullableString => Ok(value),
        ColumnType::String => match &value {
            Value::Null => Err(mismatch()),
            Value::Integer(_) | Value::Real(_) => Ok(Value::Text(value.to_string())),
            _ => Ok(value),
        },
        ColumnType::Number | ColumnType::NullableNumber => {
            if value.is_null() {
                return if column_type.is_nullable() {
                    Ok(Value::Null)
                } else {
                    Err(mismatch())
                };
            }
            value.as_number().ok_or_else(mismatch)
        }
    }
}

/// Validate every value of a row, as a create would.
///
/// `supplied` flags which columns the caller actually provided; unsupplied columns are left to the database and aren't
/// checked.
pub fn validate_row(table: &TableDescriptor, values: &mut [Value], supplied: &[bool]) -> Result<()> {
    for i in 0..values.len() {
        if !supplied[i] {
            continue;
        }
        let v = std::mem::take(&mut values[i]);
        // Rules see the row as it stands, minus the column under test.
        let checked = validate(table, i, v, values)?;
        values[i] = checked;
    }
    Ok(())
}
