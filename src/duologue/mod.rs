// src/duologue/mod.rs

pub mod client_wrapper;
pub mod clients;
pub mod dynamic;
pub mod engine;
pub mod plan;
pub mod planner;
pub mod pricing;
pub mod state;
pub mod turn;

// Explicitly export the engines so they can be reached as duologue::ProtocolEngine
// instead of duologue::engine::ProtocolEngine.
pub use dynamic::DynamicEngine;
pub use engine::ProtocolEngine;
