pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod files;
pub mod instance;
pub mod server;
pub mod stream;
pub mod supervisor;

pub use client::ControlPlaneClient;
pub use config::Config;
pub use error::{Result, RunnerError};
pub use files::{FileHandler, Filestore, LocalFilestore};
pub use instance::{InstanceStatus, ModelInstance};
pub use supervisor::Supervisor;
