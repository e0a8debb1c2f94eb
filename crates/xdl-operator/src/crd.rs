//! XDLJob CRD types
//!
//! An `XDLJob` is a distributed-training job made of role groups (Worker, PS,
//! Scheduler, ExtendRole). Each role group carries its own pod template,
//! replica count and restart policy.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Policies
// =============================================================================

/// Which pods are deleted once the job finishes
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanPodPolicy {
    /// Delete every pod of the job
    All,
    /// Delete only pods that are still running
    Running,
    /// Keep all pods
    None,
}

impl std::fmt::Display for CleanPodPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Running => write!(f, "Running"),
            Self::None => write!(f, "None"),
        }
    }
}

/// Pod restart policy for a role group
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    OnFailure,
    Never,
    /// Restart only when the exit code marks the failure as retryable
    ExitCode,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::OnFailure => write!(f, "OnFailure"),
            Self::Never => write!(f, "Never"),
            Self::ExitCode => write!(f, "ExitCode"),
        }
    }
}

/// Job-level run policy.
///
/// `min_finish_worker_num` and `min_finish_worker_percentage` are two ways of
/// expressing the same completion quorum; only one of them should be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    /// Absolute number of workers that must finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_finish_worker_num: Option<i32>,

    /// Percentage (0-100) of workers that must finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_finish_worker_percentage: Option<i32>,

    /// Number of retries before the job is marked failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

// =============================================================================
// Role groups
// =============================================================================

/// Key of a role group in `xdlReplicaSpecs`.
///
/// Users may write any casing; the canonical spellings are the associated
/// constants and the rest of the system looks role groups up by them.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ReplicaType(String);

impl ReplicaType {
    pub const WORKER: &'static str = "Worker";
    pub const PS: &'static str = "PS";
    pub const SCHEDULER: &'static str = "Scheduler";
    pub const EXTEND_ROLE: &'static str = "ExtendRole";

    /// Canonical role identifiers, in normalization order
    pub const CANONICAL: [&'static str; 4] =
        [Self::WORKER, Self::PS, Self::SCHEDULER, Self::EXTEND_ROLE];

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Same role ignoring case, but spelled differently
    pub fn is_case_variant_of(&self, canonical: &str) -> bool {
        self.0.eq_ignore_ascii_case(canonical) && self.0 != canonical
    }
}

impl From<&str> for ReplicaType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single role group within an XDLJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired number of pods for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template for every replica of this role
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// Unset or empty means the default restart policy
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    #[schemars(with = "Option<RestartPolicy>")]
    pub restart_policy: Option<RestartPolicy>,
}

/// Deserialize an optional string enum, reading `""` the same as a missing value
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => {
            T::deserialize(IntoDeserializer::<D::Error>::into_deserializer(raw)).map(Some)
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Distributed XDL training job
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "xdl.kubedl.io",
    version = "v1alpha1",
    kind = "XDLJob",
    plural = "xdljobs",
    shortname = "xdl",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct XDLJobSpec {
    #[serde(flatten)]
    pub run_policy: RunPolicy,

    /// Role groups keyed by role name
    #[serde(default)]
    pub xdl_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,
}
