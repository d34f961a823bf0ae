//! Hub-and-spoke network resolution
//!
//! This library provides:
//! - Topology model built from a declared landing zone network
//! - Inspection hub construction (firewall endpoints and NAT gateways per AZ)
//! - Spoke attachment resolution with bypass-route rejection
//! - Two-phase transit gateway route association and propagation
//! - Pre-apply validation and diagnostics
//! - OU to service control policy attachment store

pub mod error;
pub mod firewall;
pub mod governance;
pub mod hub;
pub mod ids;
pub mod model;
pub mod pipeline;
pub mod propagation;
pub mod spoke;
pub mod validation;

pub use error::{ResolveError, Result};
pub use firewall::FirewallPolicy;
pub use governance::PolicyAttachmentStore;
pub use hub::{InspectionHub, InspectionHubBuilder};
pub use model::{Topology, VpcDeclaration};
pub use pipeline::{resolve, Resolution, ValidatedTopology};
pub use propagation::{PropagationEngine, RoutedTopology};
pub use spoke::{ResolvedSpoke, SpokeResolution, SpokeResolver};
pub use validation::Validator;
