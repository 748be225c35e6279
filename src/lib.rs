pub mod audio;
pub mod capture;
pub mod config;
pub mod devices;
pub mod gate;
pub mod kernel;
pub mod outputs;
pub mod services;

pub use config::EngineConfig;
pub use kernel::{Collaborators, TurnOrchestrator};
