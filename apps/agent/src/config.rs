use anyhow::{bail, Context, Result};
use clap::Parser;
use netmesh_types::{Config, IpsecAuthentication, IpsecEncapsulation, IpsecEncryption, Provider};

/// CLI flags, one per recognized config key. Unset flags leave the
/// YAML file's value (or the built-in default) untouched; set flags
/// win over both.
#[derive(Debug, Parser)]
#[command(author, version, about = "Per-node overlay routing reconciliation agent")]
pub struct Args {
    /// Path to the YAML config file. A missing file is not an error.
    #[arg(long, default_value = "/etc/kubernetes/networking-agent.yaml")]
    pub config: String,

    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub target_link_name: Option<String>,
    #[arg(long)]
    pub pod_cidr: Option<String>,
    #[arg(long)]
    pub resync_period: Option<String>,
    #[arg(long)]
    pub node_name: Option<String>,
    #[arg(long)]
    pub machine_id_path: Option<String>,
    #[arg(long)]
    pub system_uuid_path: Option<String>,
    #[arg(long)]
    pub boot_id_path: Option<String>,
    #[arg(long)]
    pub ipsec_authentication: Option<String>,
    #[arg(long)]
    pub ipsec_encryption: Option<String>,
    #[arg(long)]
    pub ipsec_encapsulation: Option<String>,
    #[arg(long)]
    pub log_level: Option<i32>,
    #[arg(long)]
    pub cni_config_path: Option<String>,
}

/// Loads the YAML config file (if present) and layers the CLI flags on
/// top: flag values win over file values, file values win over the
/// built-in defaults.
pub fn load(args: &Args) -> Result<Config> {
    let mut config = read_file(&args.config)?;

    if let Some(raw) = &args.provider {
        config.provider = parse_provider(raw)?;
    }
    if let Some(v) = &args.target_link_name {
        config.target_link_name = Some(v.clone());
    }
    if let Some(v) = &args.pod_cidr {
        config.pod_cidr = Some(v.clone());
    }
    if let Some(v) = &args.resync_period {
        config.resync_period = Some(v.clone());
    }
    if let Some(v) = &args.node_name {
        config.node_name = Some(v.clone());
    }
    if let Some(v) = &args.machine_id_path {
        config.machine_id_path = Some(v.clone());
    }
    if let Some(v) = &args.system_uuid_path {
        config.system_uuid_path = Some(v.clone());
    }
    if let Some(v) = &args.boot_id_path {
        config.boot_id_path = Some(v.clone());
    }
    if let Some(raw) = &args.ipsec_authentication {
        config.ipsec.authentication = parse_authentication(raw)?;
    }
    if let Some(raw) = &args.ipsec_encryption {
        config.ipsec.encryption = parse_encryption(raw)?;
    }
    if let Some(raw) = &args.ipsec_encapsulation {
        config.ipsec.encapsulation = parse_encapsulation(raw)?;
    }
    if let Some(v) = args.log_level {
        config.log_level = v;
    }
    if let Some(v) = &args.cni_config_path {
        config.cni_config_path = Some(v.clone());
    }

    Ok(config)
}

fn read_file(path: &str) -> Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str(&contents).with_context(|| format!("parsing config file {path}")),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(err) => Err(err).with_context(|| format!("reading config file {path}")),
    }
}

fn parse_provider(raw: &str) -> Result<Provider> {
    match raw.to_ascii_lowercase().as_str() {
        "layer2" => Ok(Provider::Layer2),
        "gre" => Ok(Provider::Gre),
        "vxlan" => Ok(Provider::Vxlan),
        "ipsec" => Ok(Provider::Ipsec),
        other => bail!("unknown provider {other:?}"),
    }
}

fn parse_authentication(raw: &str) -> Result<IpsecAuthentication> {
    match raw.to_ascii_lowercase().as_str() {
        "sha1" => Ok(IpsecAuthentication::Sha1),
        "none" => Ok(IpsecAuthentication::None),
        other => bail!("unknown ipsec authentication strategy {other:?}"),
    }
}

fn parse_encryption(raw: &str) -> Result<IpsecEncryption> {
    match raw.to_ascii_lowercase().as_str() {
        "aes" => Ok(IpsecEncryption::Aes),
        "none" => Ok(IpsecEncryption::None),
        other => bail!("unknown ipsec encryption strategy {other:?}"),
    }
}

fn parse_encapsulation(raw: &str) -> Result<IpsecEncapsulation> {
    match raw.to_ascii_lowercase().as_str() {
        "udp" => Ok(IpsecEncapsulation::Udp),
        "esp" => Ok(IpsecEncapsulation::Esp),
        other => bail!("unknown ipsec encapsulation strategy {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(argv)
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let args = parse(&["agent", "--config", "/nonexistent/path.yaml"]);
        let config = load(&args).unwrap();
        assert_eq!(config.provider, Provider::Vxlan);
        assert!(config.target_link_name.is_none());
    }

    #[test]
    fn flags_override_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider: gre\ntargetLinkName: eth0").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = parse(&["agent", "--config", &path, "--provider", "ipsec"]);
        let config = load(&args).unwrap();
        assert_eq!(config.provider, Provider::Ipsec);
        assert_eq!(config.target_link_name.as_deref(), Some("eth0"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let args = parse(&["agent", "--config", "/nonexistent", "--provider", "bogus"]);
        assert!(load(&args).is_err());
    }

    #[test]
    fn parses_acronym_cased_self_id_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "nodeName: node-a\nmachineIDPath: /etc/machine-id\nsystemUUIDPath: /etc/system-uuid\nbootIDPath: /proc/sys/kernel/random/boot_id"
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = parse(&["agent", "--config", &path]);
        let config = load(&args).unwrap();
        assert_eq!(config.node_name.as_deref(), Some("node-a"));
        assert_eq!(config.machine_id_path.as_deref(), Some("/etc/machine-id"));
        assert_eq!(config.system_uuid_path.as_deref(), Some("/etc/system-uuid"));
        assert_eq!(config.boot_id_path.as_deref(), Some("/proc/sys/kernel/random/boot_id"));
    }
}
