use std::path::Path;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;

const TEMPLATE: &str = r#"{
  "cniVersion": "0.3.1",
  "name": "k8s-pod-network",
  "type": "bridge",
  "bridge": "kopeio",
  "isDefaultGateway": true,
  "ipMasq": true,
  "ipam": {
    "type": "host-local",
    "name": "kopeio",
    "subnet": "{{PodCIDR}}"
  }
}
"#;

pub fn render(pod_cidr: Ipv4Network) -> String {
    TEMPLATE.replace("{{PodCIDR}}", &pod_cidr.to_string())
}

/// Rewrites `path` with the CNI config for `pod_cidr`, but only if the
/// rendered contents differ from what's already on disk. Returns
/// whether a write happened.
pub fn write_if_changed(path: &str, pod_cidr: Ipv4Network) -> Result<bool> {
    let desired = render(pod_cidr);
    if std::fs::read_to_string(path).ok().as_deref() == Some(desired.as_str()) {
        return Ok(false);
    }
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {} directory", parent.display()))?;
    }
    std::fs::write(path, &desired).with_context(|| format!("writing CNI config to {path}"))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn rewrites_only_when_contents_differ() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_in(&dir, "10-kopeio.conf");
        let cidr: Ipv4Network = "10.244.0.0/24".parse().unwrap();

        assert!(write_if_changed(&path, cidr).unwrap());
        assert!(!write_if_changed(&path, cidr).unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("10.244.0.0/24"));
        assert!(contents.contains("\"bridge\": \"kopeio\""));
    }

    #[test]
    fn changing_pod_cidr_triggers_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_in(&dir, "10-kopeio.conf");
        write_if_changed(&path, "10.244.0.0/24".parse().unwrap()).unwrap();
        assert!(write_if_changed(&path, "10.244.1.0/24".parse().unwrap()).unwrap());
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cni").join("net.d").join("10-kopeio.conf");
        let path = path.to_string_lossy().into_owned();
        assert!(write_if_changed(&path, "10.244.0.0/24".parse().unwrap()).unwrap());
    }
}
