// PostgreSQL backend
//
// - config: settings, bb8 connection manager and pool construction
// - params: encoding of captured values as statement parameters
// - query: row decoding
// - connection: the operations a query block drives on a pooled client

pub mod config;
pub mod connection;
pub mod params;
pub mod query;

pub use config::{PgClient, PgManager, PgSettings};
pub use params::Params;
pub use query::{build_result_set, postgres_extract_value};
