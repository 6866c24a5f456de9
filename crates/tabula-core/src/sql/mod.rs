pub mod exec;
pub mod parser;
pub mod validate;

pub use exec::{execute, ExecLimits, QueryOutput};
pub use parser::{parse_select, split_statements, SelectStatement};
pub use validate::{validate_sql, ResourceLimits, ValidatedQuery};
