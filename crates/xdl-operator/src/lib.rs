//! XDLJob custom resource and its defaulting rules

pub mod config;
pub mod crd;
pub mod defaults;
pub mod error;
pub mod telemetry;

pub use config::JobDefaults;
pub use crd::{ReplicaType, XDLJob, XDLJobSpec};
pub use defaults::{set_defaults, Defaulter};
pub use error::{Error, Result};
