//! Owned result rows.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::backend::query::{DataRow, FieldDescription};
use crate::protocol::types::{FormatCode, Oid};
use crate::value::FromWireValue;

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Format code
    pub format: FormatCode,
}

impl From<&FieldDescription<'_>> for Column {
    fn from(field: &FieldDescription<'_>) -> Self {
        Self {
            name: field.name.to_string(),
            table_oid: field.table_oid,
            column_id: field.column_id,
            type_oid: field.type_oid,
            type_size: field.type_size,
            type_modifier: field.type_modifier,
            format: field.format,
        }
    }
}

/// A row buffered by a cursor.
///
/// Column metadata is shared by all rows of one result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub(crate) fn from_data_row(columns: &Arc<[Column]>, row: DataRow<'_>) -> Self {
        Self {
            columns: Arc::clone(columns),
            values: row.iter().map(|v| v.map(<[u8]>::to_vec)).collect(),
        }
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column descriptions.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Raw text value of a column; `None` for NULL.
    pub fn raw(&self, idx: usize) -> Result<Option<&[u8]>> {
        self.values
            .get(idx)
            .map(Option::as_deref)
            .ok_or_else(|| Error::OutOfRange(format!("column index {} out of range", idx)))
    }

    /// Decode the value of column `idx`.
    pub fn get<'a, T: FromWireValue<'a>>(&'a self, idx: usize) -> Result<T> {
        let column = self
            .columns
            .get(idx)
            .ok_or_else(|| Error::OutOfRange(format!("column index {} out of range", idx)))?;
        match self.raw(idx)? {
            None => T::from_null(),
            Some(bytes) => T::from_text(column.type_oid, bytes),
        }
    }

    /// Decode the value of the column called `name`.
    pub fn get_by_name<'a, T: FromWireValue<'a>>(&'a self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::Decode(format!("no column named {:?}", name)))?;
        self.get(idx)
    }

    /// Decode the whole row, e.g. into a tuple.
    pub fn decode<'a, T: FromRow<'a>>(&'a self) -> Result<T> {
        T::from_row(self)
    }
}

/// Trait for decoding a row into a Rust type.
pub trait FromRow<'a>: Sized {
    /// Decode a row.
    fn from_row(row: &'a Row) -> Result<Self>;
}

impl FromRow<'_> for () {
    fn from_row(_row: &Row) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_from_row_tuple {
    ($count:literal: $($idx:tt => $T:ident),+) => {
        impl<'a, $($T: FromWireValue<'a>),+> FromRow<'a> for ($($T,)+) {
            fn from_row(row: &'a Row) -> Result<Self> {
                if row.len() < $count {
                    return Err(Error::Decode("not enough columns for tuple".into()));
                }
                Ok(($(row.get::<$T>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1: 0 => T1);
impl_from_row_tuple!(2: 0 => T1, 1 => T2);
impl_from_row_tuple!(3: 0 => T1, 1 => T2, 2 => T3);
impl_from_row_tuple!(4: 0 => T1, 1 => T2, 2 => T3, 3 => T4);
impl_from_row_tuple!(5: 0 => T1, 1 => T2, 2 => T3, 3 => T4, 4 => T5);
impl_from_row_tuple!(6: 0 => T1, 1 => T2, 2 => T3, 3 => T4, 4 => T5, 5 => T6);
impl_from_row_tuple!(7: 0 => T1, 1 => T2, 2 => T3, 3 => T4, 4 => T5, 5 => T6, 6 => T7);
impl_from_row_tuple!(8: 0 => T1, 1 => T2, 2 => T3, 3 => T4, 4 => T5, 5 => T6, 6 => T7, 7 => T8);
