use anyhow::{bail, Context, Result};
use netmesh_types::{Config, NodeRecord};

/// A known-buggy BIOS reports this system UUID on every boot; trusting
/// it would make every affected node claim to be "self".
const BUGGY_SYSTEM_UUID: &str = "03000200-0400-0500-0006-000700080009";

type Predicate = Box<dyn Fn(&NodeRecord) -> bool + Send + Sync>;

/// Resolves the self-identification predicate per the priority chain:
/// `NODE_NAME` env var, config `node_name`, machine-id file,
/// system-uuid file, boot-id file, OS hostname.
pub fn resolve_self_predicate(config: &Config) -> Result<Predicate> {
    if let Ok(name) = std::env::var("NODE_NAME") {
        if !name.is_empty() {
            return Ok(by_name(name));
        }
    }

    if let Some(name) = config.node_name.clone().filter(|s| !s.is_empty()) {
        return Ok(by_name(name));
    }

    if let Some(path) = &config.machine_id_path {
        let machine_id = read_trimmed(path).context("reading machine-id file")?;
        return Ok(Box::new(move |n: &NodeRecord| {
            n.machine_id.as_deref() == Some(machine_id.as_str())
        }));
    }

    if let Some(path) = &config.system_uuid_path {
        let system_uuid = read_trimmed(path).context("reading system-uuid file")?;
        if system_uuid == BUGGY_SYSTEM_UUID {
            bail!("system-uuid file {path} contains the known buggy-BIOS sentinel value");
        }
        return Ok(Box::new(move |n: &NodeRecord| {
            n.system_uuid.as_deref() == Some(system_uuid.as_str())
        }));
    }

    if let Some(path) = &config.boot_id_path {
        let boot_id = read_trimmed(path).context("reading boot-id file")?;
        return Ok(Box::new(move |n: &NodeRecord| {
            n.boot_id.as_deref() == Some(boot_id.as_str())
        }));
    }

    let hostname = hostname::get()
        .context("reading OS hostname")?
        .to_string_lossy()
        .into_owned();
    tracing::info!(%hostname, "using hostname as node name");
    Ok(by_name(hostname))
}

fn by_name(name: String) -> Predicate {
    Box::new(move |n: &NodeRecord| n.name == name)
}

fn read_trimmed(path: &str) -> Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> Config {
        Config::default()
    }

    #[test]
    fn node_name_config_wins_over_files() {
        let mut config = base_config();
        config.node_name = Some("node-a".into());
        let pred = resolve_self_predicate(&config).unwrap();
        let mut node = NodeRecord::new("node-a");
        assert!(pred(&node));
        node.name = "node-b".into();
        assert!(!pred(&node));
    }

    #[test]
    fn system_uuid_sentinel_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system-uuid");
        std::fs::write(&path, BUGGY_SYSTEM_UUID).unwrap();
        let mut config = base_config();
        config.system_uuid_path = Some(path.to_string_lossy().into_owned());
        assert!(resolve_self_predicate(&config).is_err());
    }

    #[test]
    fn machine_id_file_matches_by_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "abc123").unwrap();
        let mut config = base_config();
        config.machine_id_path = Some(path.to_string_lossy().into_owned());
        let pred = resolve_self_predicate(&config).unwrap();

        let mut node = NodeRecord::new("node-a");
        node.machine_id = Some("abc123".into());
        assert!(pred(&node));
        node.machine_id = Some("other".into());
        assert!(!pred(&node));
    }
}
