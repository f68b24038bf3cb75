//! Custom Resource Definitions for Cluster API
//!
//! The Cluster CRD is owned by this controller. The machine kinds are read
//! and deleted during teardown but are managed by other controllers.

mod cluster;
mod machine;
mod types;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use machine::{
    Machine, MachineDeployment, MachineDeploymentSpec, MachinePool, MachinePoolSpec,
    MachineSet, MachineSetSpec, MachineSpec, MachineStatus,
};
pub use types::{
    ApiEndpoint, ClusterPhase, Condition, ConditionSeverity, ConditionStatus, ExternalReference,
    FailureDomainSpec, FailureDomains,
};
