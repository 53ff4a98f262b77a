//! Custom resources read and written on the target cluster.
//!
//! Only the fields the harness inspects are typed; everything else is kept
//! in `extra` so objects survive a read-modify-write unchanged.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// PDS backup (ad hoc or scheduled) created by the agent for a CP backup.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "backups.pds.io",
    version = "v1",
    kind = "Backup",
    root = "PdsBackup",
    plural = "backups",
    namespaced,
    status = "PdsBackupStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PdsBackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PdsBackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_job_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One run of a [`PdsBackup`]. Its UID is the CP backup job ID.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "backups.pds.io",
    version = "v1",
    kind = "BackupJob",
    root = "PdsBackupJob",
    plural = "backupjobs",
    namespaced,
    status = "PdsBackupJobStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PdsBackupJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PdsBackupJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_snap_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "backups.pds.io",
    version = "v1",
    kind = "Restore",
    root = "PdsRestore",
    plural = "restores",
    namespaced,
    status = "PdsRestoreStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PdsRestoreSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_snap_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PdsRestoreStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "volumesnapshot.external-storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_data_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "externaldns.k8s.io",
    version = "v1alpha1",
    kind = "DNSEndpoint",
    plural = "dnsendpoints",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DNSEndpointSpec {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub dns_name: String,
    #[serde(default)]
    pub record_type: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default, rename = "recordTTL", skip_serializing_if = "Option::is_none")]
    pub record_ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "ClusterIssuer",
    plural = "clusterissuers",
    status = "ClusterIssuerStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIssuerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClusterIssuerStatus {
    #[serde(default)]
    pub conditions: Vec<IssuerCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct IssuerCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ClusterIssuer {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
    }
}

impl PdsBackupJob {
    pub fn succeeded(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p.eq_ignore_ascii_case("succeeded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;
    use serde_json::json;

    #[test]
    fn resource_coordinates() {
        assert_eq!(PdsBackupJob::api_version(&()), "backups.pds.io/v1");
        assert_eq!(PdsBackupJob::kind(&()), "BackupJob");
        assert_eq!(PdsBackupJob::plural(&()), "backupjobs");
        assert_eq!(VolumeSnapshot::group(&()), "volumesnapshot.external-storage.k8s.io");
        assert_eq!(DNSEndpoint::version(&()), "v1alpha1");
        assert_eq!(ClusterIssuer::plural(&()), "clusterissuers");
    }

    #[test]
    fn backup_job_keeps_unknown_fields() {
        let job: PdsBackupJob = serde_json::from_value(json!({
            "apiVersion": "backups.pds.io/v1",
            "kind": "BackupJob",
            "metadata": { "name": "cas-abc-adhoc", "uid": "7d1b" },
            "spec": { "backupName": "cas-abc-adhoc", "deploymentName": "cas-abc" },
            "status": { "phase": "Succeeded", "cloudSnapId": "px-1/bucket/cas-abc" },
        }))
        .unwrap();
        assert!(job.succeeded());
        assert_eq!(job.spec.extra["deploymentName"], "cas-abc");
        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back["spec"]["deploymentName"], "cas-abc");
    }

    #[test]
    fn dns_endpoint_record_ttl() {
        let ep: Endpoint = serde_json::from_value(json!({
            "dnsName": "pg-1.pds.example.com",
            "recordType": "CNAME",
            "recordTTL": 60,
            "targets": ["lb.example.com"],
        }))
        .unwrap();
        assert_eq!(ep.record_ttl, Some(60));
        assert_eq!(ep.record_type, "CNAME");
    }

    #[test]
    fn issuer_readiness() {
        let issuer: ClusterIssuer = serde_json::from_value(json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "ClusterIssuer",
            "metadata": { "name": "selfsigned" },
            "spec": { "selfSigned": {} },
            "status": { "conditions": [{ "type": "Ready", "status": "True" }] },
        }))
        .unwrap();
        assert!(issuer.is_ready());
        assert!(issuer.spec.self_signed.is_some());
    }
}
