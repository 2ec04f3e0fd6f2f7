mod bucket;
mod config;
mod context;
mod eval;
mod flag;
mod persistence;
mod segment;
mod store;
mod test_common;
mod util;

pub use bucket::*;
pub use config::*;
pub use context::*;
pub use eval::*;
pub use flag::*;
pub use persistence::*;
pub use segment::*;
pub use store::*;
