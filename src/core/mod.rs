pub mod comparator;
pub mod domain;
pub mod generator;
pub mod orchestrator;
pub mod reporter;
pub mod sandbox;
pub mod spec;
pub mod traits;
pub mod workspace;
