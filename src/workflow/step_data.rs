//! Step Execution Data
//!
//! Per-kind payloads attached to step instances, and the summary record
//! written once when a step reaches a terminal status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::StateExecutionInstance;
use super::status::ExecutionStatus;

/// Kinds of deployment steps a `Step` state can run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Command,
    AmiDeploy,
    EcsDeploy,
    K8sDeploy,
    PcfDeploy,
    HelmDeploy,
    HttpVerification,
    JenkinsVerification,
    BambooVerification,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::AmiDeploy => "AMI_DEPLOY",
            Self::EcsDeploy => "ECS_DEPLOY",
            Self::K8sDeploy => "K8S_DEPLOY",
            Self::PcfDeploy => "PCF_DEPLOY",
            Self::HelmDeploy => "HELM_DEPLOY",
            Self::HttpVerification => "HTTP_VERIFICATION",
            Self::JenkinsVerification => "JENKINS_VERIFICATION",
            Self::BambooVerification => "BAMBOO_VERIFICATION",
        }
    }

    pub fn is_verification(self) -> bool {
        matches!(
            self,
            Self::HttpVerification | Self::JenkinsVerification | Self::BambooVerification
        )
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific data recorded on a state execution instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepExecutionData {
    Command {
        command_name: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        output: Option<String>,
    },
    AmiDeploy {
        asg_name: String,
        desired_capacity: u32,
        #[serde(default)]
        new_instances: Vec<String>,
        #[serde(default)]
        old_instances: Vec<String>,
    },
    EcsDeploy {
        cluster: String,
        service_name: String,
        desired_count: u32,
    },
    K8sDeploy {
        namespace: String,
        release_name: String,
        #[serde(default)]
        pods: Vec<String>,
    },
    PcfDeploy {
        organization: String,
        space: String,
        app_name: String,
        instance_count: u32,
    },
    HelmDeploy {
        chart: String,
        release_name: String,
        namespace: String,
        #[serde(default)]
        revision: Option<u32>,
    },
    HttpVerification {
        url: String,
        method: String,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        assertion: Option<String>,
    },
    JenkinsVerification {
        job_name: String,
        #[serde(default)]
        build_number: Option<u64>,
        #[serde(default)]
        build_status: Option<String>,
    },
    BambooVerification {
        plan_name: String,
        #[serde(default)]
        build_number: Option<u64>,
        #[serde(default)]
        build_status: Option<String>,
    },
    Barrier {
        key: String,
        participant: String,
        #[serde(default)]
        arrivals: BTreeMap<String, ExecutionStatus>,
    },
    ResourceConstraint {
        resource: String,
        holder: String,
        units: u32,
        queued: bool,
    },
    Wait {
        duration_secs: u64,
    },
    Approval {
        approval_id: String,
        #[serde(default)]
        approved: Option<bool>,
        #[serde(default)]
        approver: Option<String>,
        #[serde(default)]
        comments: Option<String>,
    },
}

impl StepExecutionData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Command { .. } => "COMMAND",
            Self::AmiDeploy { .. } => "AMI_DEPLOY",
            Self::EcsDeploy { .. } => "ECS_DEPLOY",
            Self::K8sDeploy { .. } => "K8S_DEPLOY",
            Self::PcfDeploy { .. } => "PCF_DEPLOY",
            Self::HelmDeploy { .. } => "HELM_DEPLOY",
            Self::HttpVerification { .. } => "HTTP_VERIFICATION",
            Self::JenkinsVerification { .. } => "JENKINS_VERIFICATION",
            Self::BambooVerification { .. } => "BAMBOO_VERIFICATION",
            Self::Barrier { .. } => "BARRIER",
            Self::ResourceConstraint { .. } => "RESOURCE_CONSTRAINT",
            Self::Wait { .. } => "WAIT",
            Self::Approval { .. } => "APPROVAL",
        }
    }

    /// One-line human readable description used in summaries.
    pub fn describe(&self) -> String {
        match self {
            Self::Command { command_name, exit_code, .. } => match exit_code {
                Some(code) => format!("command '{}' exited with {}", command_name, code),
                None => format!("command '{}'", command_name),
            },
            Self::AmiDeploy { asg_name, desired_capacity, .. } => {
                format!("resize {} to {}", asg_name, desired_capacity)
            }
            Self::EcsDeploy { cluster, service_name, desired_count } => {
                format!("{}/{} x{}", cluster, service_name, desired_count)
            }
            Self::K8sDeploy { namespace, release_name, pods } => {
                format!("{}/{} ({} pods)", namespace, release_name, pods.len())
            }
            Self::PcfDeploy { organization, space, app_name, instance_count } => {
                format!("{}/{}/{} x{}", organization, space, app_name, instance_count)
            }
            Self::HelmDeploy { chart, release_name, revision, .. } => match revision {
                Some(rev) => format!("{} as {} (revision {})", chart, release_name, rev),
                None => format!("{} as {}", chart, release_name),
            },
            Self::HttpVerification { url, method, status_code, .. } => match status_code {
                Some(code) => format!("{} {} -> {}", method, url, code),
                None => format!("{} {}", method, url),
            },
            Self::JenkinsVerification { job_name, build_status, .. } => {
                format!("jenkins job {} {}", job_name, build_status.as_deref().unwrap_or("pending"))
            }
            Self::BambooVerification { plan_name, build_status, .. } => {
                format!("bamboo plan {} {}", plan_name, build_status.as_deref().unwrap_or("pending"))
            }
            Self::Barrier { key, arrivals, .. } => {
                format!("barrier {} ({} arrived)", key, arrivals.len())
            }
            Self::ResourceConstraint { resource, units, queued, .. } => {
                let how = if *queued { "queued" } else { "granted" };
                format!("{} unit(s) of {} {}", units, resource, how)
            }
            Self::Wait { duration_secs } => format!("wait {}s", duration_secs),
            Self::Approval { approval_id, approved, approver, .. } => {
                let decision = match approved {
                    Some(true) => "approved",
                    Some(false) => "rejected",
                    None => "pending",
                };
                match approver {
                    Some(approver) => format!("{} {} by {}", approval_id, decision, approver),
                    None => format!("{} {}", approval_id, decision),
                }
            }
        }
    }
}

/// Summary of a finished state, shared across step kinds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepExecutionSummary {
    pub instance_id: String,
    pub execution_id: String,
    pub state_name: String,
    pub kind: String,
    pub status: ExecutionStatus,
    pub description: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepExecutionSummary {
    /// Builds the summary for an instance that carries step data.
    pub fn from_instance(instance: &StateExecutionInstance) -> Option<Self> {
        let data = instance.step_data.as_ref()?;
        Some(Self {
            instance_id: instance.id.clone(),
            execution_id: instance.execution_id.clone(),
            state_name: instance.state_name.clone(),
            kind: data.kind_name().to_string(),
            status: instance.status,
            description: data.describe(),
            error_message: instance.error_message.clone(),
            started_at: instance.started_at,
            ended_at: instance.ended_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_data_is_tagged_by_kind() {
        let data = StepExecutionData::HelmDeploy {
            chart: "stable/nginx".to_string(),
            release_name: "web".to_string(),
            namespace: "prod".to_string(),
            revision: Some(4),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "HELM_DEPLOY");
        assert_eq!(data.kind_name(), "HELM_DEPLOY");
        assert_eq!(data.describe(), "stable/nginx as web (revision 4)");
    }

    #[test]
    fn test_verification_kinds() {
        assert!(StepKind::JenkinsVerification.is_verification());
        assert!(!StepKind::K8sDeploy.is_verification());
    }

    #[test]
    fn test_resource_constraint_description() {
        let data = StepExecutionData::ResourceConstraint {
            resource: "cluster-x".to_string(),
            holder: "phase-a".to_string(),
            units: 1,
            queued: true,
        };
        assert_eq!(data.describe(), "1 unit(s) of cluster-x queued");
    }

    #[test]
    fn test_approval_description() {
        let data = StepExecutionData::Approval {
            approval_id: "approval:1".to_string(),
            approved: Some(false),
            approver: Some("release-manager".to_string()),
            comments: Some("change freeze".to_string()),
        };
        assert_eq!(data.kind_name(), "APPROVAL");
        assert_eq!(data.describe(), "approval:1 rejected by release-manager");
    }
}
