//! Receding-horizon scheduling of wastewater tunnel pumps.
//!
//! Every control step the controller measures the tunnel level, takes the
//! latest price and inflow forecasts, searches the pump-combination
//! trajectory that minimises energy cost over the horizon while keeping the
//! level within bounds, and commits only the first step.

pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod hardware;
pub mod optimizer;
pub mod plant;
pub mod telemetry;
