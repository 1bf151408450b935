pub mod connection;
pub mod cursor;
pub mod types;

pub use connection::{PoolConnection, PreparedStatement};
pub use cursor::{CURSOR_BATCH, Portal, RowCursor};
pub use types::BlockPool;
