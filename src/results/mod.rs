mod extract;
mod result_set;
mod row;

pub use extract::{FromRow, FromRowValue};
pub use result_set::ResultSet;
pub use row::{CustomDbRow, RowShape};
