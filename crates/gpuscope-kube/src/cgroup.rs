//! Pod UID extraction from cgroup paths

use gpuscope_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

// Matches both cgroupfs and systemd-style kubepods paths:
//   /kubepods/burstable/pod6c5475af-152e-4b40-8b43-410c55986514/...
//   /kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod6c5475af_...
static POD_UID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"pod([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
        .expect("pod UID pattern is valid")
});

/// Extract the pod UID from cgroup file content, if any line belongs to a
/// kubepods hierarchy.
pub fn extract_pod_uid(content: &str) -> Option<String> {
    for line in content.lines() {
        if !line.contains("kubepods") {
            continue;
        }
        if let Some(captures) = POD_UID_RE.captures(line) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// Find the Kubernetes pod UID owning a PID by reading
/// `/proc/<pid>/cgroup`.
pub fn pod_uid_from_pid(pid: u64) -> Result<String> {
    let content = std::fs::read_to_string(format!("/proc/{}/cgroup", pid))?;
    extract_pod_uid(&content)
        .ok_or_else(|| Error::not_found(format!("pod UID not found in cgroup for PID {}", pid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_cgroupfs_layout() {
        let content = "\
11:memory:/kubepods/burstable/pod6c5475af-152e-4b40-8b43-410c55986514/0a1b2c
10:cpu,cpuacct:/kubepods/burstable/pod6c5475af-152e-4b40-8b43-410c55986514/0a1b2c
";
        assert_eq!(
            extract_pod_uid(content).as_deref(),
            Some("6c5475af-152e-4b40-8b43-410c55986514")
        );
    }

    #[test]
    fn test_extract_from_systemd_layout() {
        let content = "0::/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod1b1f2a9e-3c4d-5e6f-7a8b-9c0d1e2f3a4b.slice/cri-containerd-abc.scope";
        assert_eq!(
            extract_pod_uid(content).as_deref(),
            Some("1b1f2a9e-3c4d-5e6f-7a8b-9c0d1e2f3a4b")
        );
    }

    #[test]
    fn test_non_kubernetes_cgroups_yield_nothing() {
        let content = "0::/user.slice/user-1000.slice/session-2.scope";
        assert_eq!(extract_pod_uid(content), None);

        // A UID-looking token outside a kubepods line does not match.
        let content = "0::/other/pod6c5475af-152e-4b40-8b43-410c55986514";
        assert_eq!(extract_pod_uid(content), None);
    }
}
