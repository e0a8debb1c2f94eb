//! Defaulting for XDLJob
//!
//! Fills every field a user may leave out so the controller can treat the
//! job as fully populated. All rules are idempotent and never overwrite a
//! value that is already set.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ContainerPort, PodSpec};
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::JobDefaults;
use crate::crd::{ReplicaSpec, ReplicaType, RunPolicy, XDLJob};

/// A resource that knows how to fill in its own defaults
pub trait Defaulter {
    fn set_defaults(&mut self, defaults: &JobDefaults);
}

impl Defaulter for XDLJob {
    fn set_defaults(&mut self, defaults: &JobDefaults) {
        set_defaults(self, defaults);
    }
}

/// Role keys that could not be normalized to their canonical spelling
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaTypeConflict {
    pub canonical: &'static str,
    /// Every key in the mapping that matches `canonical` ignoring case
    pub keys: Vec<ReplicaType>,
}

/// Set every unspecified field of `job` to its default.
pub fn set_defaults(job: &mut XDLJob, defaults: &JobDefaults) {
    let name = job.name_any();

    set_default_run_policy(&mut job.spec.run_policy, defaults);

    for conflict in normalize_replica_types(&mut job.spec.xdl_replica_specs) {
        warn!(
            job = %name,
            role = conflict.canonical,
            keys = ?conflict.keys,
            "role keys collide ignoring case, leaving them as written"
        );
    }

    for (role, spec) in job.spec.xdl_replica_specs.iter_mut() {
        set_default_replicas(spec, defaults);
        match spec.template.spec.as_mut() {
            Some(pod_spec) => set_default_port(pod_spec, defaults),
            None => debug!(job = %name, role = %role, "role has no pod spec, skipping port"),
        }
    }
}

pub fn set_default_run_policy(policy: &mut RunPolicy, defaults: &JobDefaults) {
    if policy.clean_pod_policy.is_none() {
        policy.clean_pod_policy = Some(defaults.clean_pod_policy);
    }
    // Num and percentage are alternatives; only fill one when the user gave neither.
    if policy.min_finish_worker_num.is_none() && policy.min_finish_worker_percentage.is_none() {
        policy.min_finish_worker_percentage = Some(defaults.min_finish_worker_percentage);
    }
    if policy.backoff_limit.is_none() {
        policy.backoff_limit = Some(defaults.backoff_limit);
    }
}

/// Rename role keys to their canonical spelling, e.g. `ps` to `PS` and
/// `WORKER` to `Worker`.
///
/// A key is only renamed when it is the single case variant of its role and
/// the canonical key is absent. Anything else is returned as a conflict and
/// the mapping is left untouched for that role.
pub fn normalize_replica_types(
    specs: &mut BTreeMap<ReplicaType, ReplicaSpec>,
) -> Vec<ReplicaTypeConflict> {
    let mut conflicts = Vec::new();

    for canonical in ReplicaType::CANONICAL {
        let variants: Vec<ReplicaType> = specs
            .keys()
            .filter(|key| key.is_case_variant_of(canonical))
            .cloned()
            .collect();
        if variants.is_empty() {
            continue;
        }

        let canonical_present = specs.contains_key(&ReplicaType::from(canonical));
        if variants.len() == 1 && !canonical_present {
            let only = &variants[0];
            if let Some(spec) = specs.remove(only) {
                debug!(from = %only, to = canonical, "normalized role key");
                specs.insert(ReplicaType::from(canonical), spec);
            }
        } else {
            let mut keys = variants;
            if canonical_present {
                keys.insert(0, ReplicaType::from(canonical));
            }
            conflicts.push(ReplicaTypeConflict { canonical, keys });
        }
    }

    conflicts
}

pub fn set_default_replicas(spec: &mut ReplicaSpec, defaults: &JobDefaults) {
    if spec.replicas.is_none() {
        spec.replicas = Some(defaults.replicas);
    }
    if spec.restart_policy.is_none() {
        spec.restart_policy = Some(defaults.restart_policy);
    }
}

/// Make sure the main container exposes the job port exactly once.
///
/// The main container is the one named `defaults.container_name`; when no
/// container has that name the first container is used. A pod spec without
/// containers is left alone.
pub fn set_default_port(spec: &mut PodSpec, defaults: &JobDefaults) {
    let index = spec
        .containers
        .iter()
        .position(|c| c.name == defaults.container_name)
        .unwrap_or(0);

    let Some(container) = spec.containers.get_mut(index) else {
        debug!("pod spec has no containers, skipping port");
        return;
    };

    let ports = container.ports.get_or_insert_with(Vec::new);
    let has_port = ports
        .iter()
        .any(|p| p.name.as_deref() == Some(defaults.port_name.as_str()));
    if !has_port {
        ports.push(ContainerPort {
            name: Some(defaults.port_name.clone()),
            container_port: defaults.port,
            ..Default::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};

    use super::*;
    use crate::crd::{CleanPodPolicy, RestartPolicy, XDLJobSpec};

    fn container(name: &str, ports: Option<Vec<ContainerPort>>) -> Container {
        Container {
            name: name.to_string(),
            ports,
            ..Default::default()
        }
    }

    fn port(name: &str, number: i32) -> ContainerPort {
        ContainerPort {
            name: Some(name.to_string()),
            container_port: number,
            ..Default::default()
        }
    }

    fn replica_with_containers(containers: Vec<Container>) -> ReplicaSpec {
        ReplicaSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn job_with_roles(roles: Vec<(&str, ReplicaSpec)>) -> XDLJob {
        let spec = XDLJobSpec {
            xdl_replica_specs: roles
                .into_iter()
                .map(|(k, v)| (ReplicaType::from(k), v))
                .collect(),
            ..Default::default()
        };
        XDLJob::new("train", spec)
    }

    fn ports_of(spec: &ReplicaSpec, index: usize) -> Vec<ContainerPort> {
        spec.template.spec.as_ref().unwrap().containers[index]
            .ports
            .clone()
            .unwrap_or_default()
    }

    // =========================================================================
    // Run policy
    // =========================================================================

    #[test]
    fn empty_run_policy_gets_all_defaults() {
        let mut policy = RunPolicy::default();
        set_default_run_policy(&mut policy, &JobDefaults::default());

        assert_eq!(policy.clean_pod_policy, Some(CleanPodPolicy::Running));
        assert_eq!(policy.min_finish_worker_percentage, Some(100));
        assert_eq!(policy.min_finish_worker_num, None);
        assert_eq!(policy.backoff_limit, Some(3));
    }

    #[test]
    fn user_run_policy_is_kept() {
        let mut policy = RunPolicy {
            clean_pod_policy: Some(CleanPodPolicy::None),
            min_finish_worker_percentage: Some(50),
            backoff_limit: Some(0),
            ..Default::default()
        };
        let before = policy.clone();
        set_default_run_policy(&mut policy, &JobDefaults::default());
        assert_eq!(policy, before);
    }

    #[test]
    fn min_finish_worker_num_excludes_percentage() {
        let mut policy = RunPolicy {
            min_finish_worker_num: Some(4),
            ..Default::default()
        };
        set_default_run_policy(&mut policy, &JobDefaults::default());

        assert_eq!(policy.min_finish_worker_num, Some(4));
        assert_eq!(policy.min_finish_worker_percentage, None);
    }

    #[test]
    fn substitute_defaults_are_used() {
        let defaults = JobDefaults {
            clean_pod_policy: CleanPodPolicy::All,
            min_finish_worker_percentage: 80,
            backoff_limit: 7,
            ..Default::default()
        };
        let mut policy = RunPolicy::default();
        set_default_run_policy(&mut policy, &defaults);

        assert_eq!(policy.clean_pod_policy, Some(CleanPodPolicy::All));
        assert_eq!(policy.min_finish_worker_percentage, Some(80));
        assert_eq!(policy.backoff_limit, Some(7));
    }

    // =========================================================================
    // Role keys
    // =========================================================================

    #[test]
    fn lowercase_worker_is_renamed() {
        let original = replica_with_containers(vec![container("xdl", None)]);
        let mut specs = BTreeMap::from([(ReplicaType::from("worker"), original.clone())]);

        let conflicts = normalize_replica_types(&mut specs);

        assert!(conflicts.is_empty());
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[&ReplicaType::from("Worker")], original);
        assert!(!specs.contains_key(&ReplicaType::from("worker")));
    }

    #[test]
    fn every_canonical_role_is_normalized() {
        let mut specs = BTreeMap::from([
            (ReplicaType::from("WORKER"), ReplicaSpec::default()),
            (ReplicaType::from("ps"), ReplicaSpec::default()),
            (ReplicaType::from("scheduler"), ReplicaSpec::default()),
            (ReplicaType::from("extendrole"), ReplicaSpec::default()),
        ]);

        assert!(normalize_replica_types(&mut specs).is_empty());

        let keys: Vec<&str> = specs.keys().map(ReplicaType::as_str).collect();
        assert_eq!(keys, vec!["ExtendRole", "PS", "Scheduler", "Worker"]);
    }

    #[test]
    fn unknown_role_is_left_alone() {
        let mut specs = BTreeMap::from([(ReplicaType::from("evaluator"), ReplicaSpec::default())]);
        assert!(normalize_replica_types(&mut specs).is_empty());
        assert!(specs.contains_key(&ReplicaType::from("evaluator")));
    }

    #[test]
    fn canonical_key_blocks_rename() {
        let canonical = ReplicaSpec {
            replicas: Some(2),
            ..Default::default()
        };
        let variant = ReplicaSpec {
            replicas: Some(5),
            ..Default::default()
        };
        let mut specs = BTreeMap::from([
            (ReplicaType::from("PS"), canonical.clone()),
            (ReplicaType::from("ps"), variant.clone()),
        ]);

        let conflicts = normalize_replica_types(&mut specs);

        assert_eq!(
            conflicts,
            vec![ReplicaTypeConflict {
                canonical: ReplicaType::PS,
                keys: vec![ReplicaType::from("PS"), ReplicaType::from("ps")],
            }]
        );
        assert_eq!(specs[&ReplicaType::from("PS")], canonical);
        assert_eq!(specs[&ReplicaType::from("ps")], variant);
    }

    #[test]
    fn several_variants_are_reported_not_merged() {
        let mut specs = BTreeMap::from([
            (ReplicaType::from("WORKER"), ReplicaSpec::default()),
            (ReplicaType::from("worker"), ReplicaSpec::default()),
        ]);

        let conflicts = normalize_replica_types(&mut specs);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].canonical, ReplicaType::WORKER);
        assert_eq!(conflicts[0].keys.len(), 2);
        assert_eq!(specs.len(), 2);
        assert!(!specs.contains_key(&ReplicaType::from("Worker")));
    }

    // =========================================================================
    // Replicas
    // =========================================================================

    #[test]
    fn unset_replicas_default_to_one() {
        let mut spec = ReplicaSpec::default();
        set_default_replicas(&mut spec, &JobDefaults::default());
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.restart_policy, Some(RestartPolicy::Never));
    }

    #[test]
    fn user_replicas_are_kept() {
        let mut spec = ReplicaSpec {
            replicas: Some(0),
            restart_policy: Some(RestartPolicy::ExitCode),
            ..Default::default()
        };
        set_default_replicas(&mut spec, &JobDefaults::default());
        assert_eq!(spec.replicas, Some(0));
        assert_eq!(spec.restart_policy, Some(RestartPolicy::ExitCode));
    }

    // =========================================================================
    // Ports
    // =========================================================================

    #[test]
    fn port_added_to_main_container() {
        let mut spec = replica_with_containers(vec![
            container("sidecar", None),
            container("xdl", Some(vec![])),
        ]);
        let pod_spec = spec.template.spec.as_mut().unwrap();
        set_default_port(pod_spec, &JobDefaults::default());

        assert_eq!(ports_of(&spec, 0), vec![]);
        assert_eq!(ports_of(&spec, 1), vec![port("xdl-port", 2222)]);
    }

    #[test]
    fn first_container_used_without_main_container() {
        let mut spec = replica_with_containers(vec![
            container("trainer", Some(vec![port("metrics", 9090)])),
            container("sidecar", None),
        ]);
        set_default_port(spec.template.spec.as_mut().unwrap(), &JobDefaults::default());

        assert_eq!(
            ports_of(&spec, 0),
            vec![port("metrics", 9090), port("xdl-port", 2222)]
        );
        assert_eq!(ports_of(&spec, 1), vec![]);
    }

    #[test]
    fn existing_port_is_not_duplicated_or_changed() {
        let mut spec = replica_with_containers(vec![container(
            "xdl",
            Some(vec![port("xdl-port", 3333)]),
        )]);
        let defaults = JobDefaults::default();
        set_default_port(spec.template.spec.as_mut().unwrap(), &defaults);
        set_default_port(spec.template.spec.as_mut().unwrap(), &defaults);

        assert_eq!(ports_of(&spec, 0), vec![port("xdl-port", 3333)]);
    }

    #[test]
    fn empty_pod_spec_is_left_alone() {
        let mut pod_spec = PodSpec::default();
        set_default_port(&mut pod_spec, &JobDefaults::default());
        assert!(pod_spec.containers.is_empty());
    }

    // =========================================================================
    // Whole job
    // =========================================================================

    #[test]
    fn lowercase_ps_scenario() {
        let mut job = job_with_roles(vec![(
            "ps",
            replica_with_containers(vec![container("xdl", None)]),
        )]);

        job.set_defaults(&JobDefaults::default());

        let policy = &job.spec.run_policy;
        assert_eq!(policy.clean_pod_policy, Some(CleanPodPolicy::Running));
        assert_eq!(policy.min_finish_worker_percentage, Some(100));
        assert_eq!(policy.backoff_limit, Some(3));

        let ps = &job.spec.xdl_replica_specs[&ReplicaType::from("PS")];
        assert_eq!(ps.replicas, Some(1));
        assert_eq!(ps.restart_policy, Some(RestartPolicy::Never));
        assert_eq!(ports_of(ps, 0), vec![port("xdl-port", 2222)]);
        assert!(!job.spec.xdl_replica_specs.contains_key(&ReplicaType::from("ps")));
    }

    #[test]
    fn defaulting_twice_equals_once() {
        let mut job = job_with_roles(vec![
            ("worker", replica_with_containers(vec![container("xdl", None)])),
            ("Scheduler", ReplicaSpec::default()),
        ]);
        let defaults = JobDefaults::default();

        set_defaults(&mut job, &defaults);
        let once = job.clone();
        set_defaults(&mut job, &defaults);

        assert_eq!(job, once);
    }

    #[test]
    fn role_without_pod_spec_still_gets_replicas() {
        let mut job = job_with_roles(vec![("Worker", ReplicaSpec::default())]);
        set_defaults(&mut job, &JobDefaults::default());

        let worker = &job.spec.xdl_replica_specs[&ReplicaType::from("Worker")];
        assert_eq!(worker.replicas, Some(1));
        assert!(worker.template.spec.is_none());
    }
}
