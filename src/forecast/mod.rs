pub mod adapter;
pub mod nordpool;
pub mod profile;
pub mod refresh;
pub mod sources;

pub use adapter::*;
pub use nordpool::*;
pub use profile::*;
pub use refresh::*;
pub use sources::*;
