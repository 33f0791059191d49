#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod network_policy;

pub use self::network_policy::{policy_id, to_policy, ConvertError};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::Deployment,
        coordination::v1::Lease,
        core::v1::ObjectReference,
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    runtime::watcher,
    Client, Error, Resource,
};
