pub mod bounds;
pub mod branch_bound;
pub mod flows;
pub mod problem;
pub mod types;

pub use branch_bound::*;
pub use problem::*;
pub use types::*;
