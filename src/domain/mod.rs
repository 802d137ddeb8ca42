pub mod call_pattern;
pub mod clock;
pub mod collaborators;
pub mod communication;
pub mod continuous;
pub mod engine;
pub mod fusion;
pub mod grouper;
pub mod optimizer;
pub mod planner;
pub mod resource;
pub mod trace;
pub mod unit;
