pub mod arbitration;
pub mod engine;
pub mod generator;
pub mod planner;
pub mod renderer;

pub use engine::QueryEngine;
pub use planner::{Intent, QueryPlan, QueryPlanner};
