pub mod forecast;
pub mod pump;
pub mod schedule;
pub mod tank;

pub use forecast::*;
pub use pump::*;
pub use schedule::*;
pub use tank::*;
