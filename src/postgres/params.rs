use std::error::Error;

use chrono::{TimeZone, Utc};
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes;

use crate::types::RowValues;

/// Borrowed parameter list in the shape `tokio_postgres` expects.
pub struct Params<'a> {
    references: Vec<&'a (dyn ToSql + Sync)>,
}

impl<'a> Params<'a> {
    #[must_use]
    pub fn convert(params: &'a [RowValues]) -> Params<'a> {
        let mut references = Vec::with_capacity(params.len());
        for p in params {
            references.push(p as &(dyn ToSql + Sync));
        }
        Params { references }
    }

    #[must_use]
    pub fn as_refs(&self) -> &[&(dyn ToSql + Sync)] {
        &self.references
    }
}

// Values are captured loosely typed; narrow them to the column type the
// server inferred for each marker.
impl ToSql for RowValues {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => i.to_string().to_sql(ty, out),
                _ => (*i).to_sql_checked(ty, out),
            },
            RowValues::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => f.to_string().to_sql(ty, out),
                _ => (*f).to_sql_checked(ty, out),
            },
            RowValues::Text(s) => s.to_sql_checked(ty, out),
            RowValues::Bool(b) => match *ty {
                Type::TEXT | Type::VARCHAR => b.to_string().to_sql(ty, out),
                _ => (*b).to_sql_checked(ty, out),
            },
            RowValues::Timestamp(dt) => match *ty {
                Type::TIMESTAMPTZ => Utc.from_utc_datetime(dt).to_sql(ty, out),
                Type::DATE => dt.date().to_sql(ty, out),
                _ => dt.to_sql_checked(ty, out),
            },
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::JSON(jsval) => jsval.to_sql_checked(ty, out),
            RowValues::Blob(bytes) => bytes.to_sql_checked(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ints_narrow_to_column_width() {
        let mut out = bytes::BytesMut::new();
        RowValues::Int(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(&out[..], &7i32.to_be_bytes());

        let mut out = bytes::BytesMut::new();
        assert!(
            RowValues::Int(i64::from(i32::MAX) + 1)
                .to_sql(&Type::INT2, &mut out)
                .is_err()
        );
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let mut out = bytes::BytesMut::new();
        assert!(
            RowValues::Text("x".into())
                .to_sql_checked(&Type::INT8, &mut out)
                .is_err()
        );
        assert!(RowValues::Int(1).to_sql(&Type::BOOL, &mut out).is_err());
    }

    #[test]
    fn null_is_null() {
        let mut out = bytes::BytesMut::new();
        assert!(matches!(
            RowValues::Null.to_sql(&Type::INT8, &mut out).unwrap(),
            IsNull::Yes
        ));
        assert!(out.is_empty());
    }
}
