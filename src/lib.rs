pub mod analytics;
pub mod anchors;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod lock;
pub mod model;
pub mod recalc;
pub mod registry;
pub mod render;
pub mod stats;
pub mod tasks;
