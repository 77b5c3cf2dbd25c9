//! Core shared types for waypoint
//!
//! This crate contains the node model, service configuration, error taxonomy
//! and the in-memory service/method index shared by every registry backend.

pub mod conf;
pub mod error;
pub mod index;
pub mod keys;
pub mod methods;
pub mod node;

pub use conf::ServiceConf;
pub use error::{Error, Result};
pub use index::{RebuildPolicy, ServiceIndex};
pub use methods::{MethodSet, ServiceDescriptor};
pub use node::{Kernel, LeaseId, Meta, Network, ServiceNode};
