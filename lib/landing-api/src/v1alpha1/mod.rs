/// API version v1alpha1 for landing zone network documents

pub mod network;
pub mod outputs;

pub use network::{
    FirewallSpec, NetworkingInputs, RouteTargetSpec, SpokeSpec, StaticRouteSpec, SubnetSpec,
};
pub use outputs::{Diagnostic, NetworkOutputs, Severity, SpokeFailure, SpokeOutputs};

/// API version written into rendered outputs and plans
pub const API_VERSION: &str = "landing.network/v1alpha1";
