//! Landing zone network API types
//!
//! This library defines the declarative documents exchanged with the
//! resolver's collaborators:
//! - NetworkingInputs: the declared hub-and-spoke topology
//! - NetworkOutputs: identifiers handed to the materialization layer
//! - Diagnostic: findings produced by pre-apply validation

pub mod error;
pub mod v1alpha1;

pub use error::{ApiError, Result};
pub use v1alpha1::{
    Diagnostic, FirewallSpec, NetworkOutputs, NetworkingInputs, RouteTargetSpec, Severity,
    SpokeFailure, SpokeOutputs, SpokeSpec, StaticRouteSpec, SubnetSpec,
};
