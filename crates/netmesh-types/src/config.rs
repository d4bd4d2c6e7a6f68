use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Layer2,
    Gre,
    Vxlan,
    Ipsec,
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Vxlan
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecAuthentication {
    Sha1,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecEncryption {
    Aes,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpsecEncapsulation {
    Udp,
    Esp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpsecConfig {
    #[serde(default = "default_authentication")]
    pub authentication: IpsecAuthentication,
    #[serde(default = "default_encryption")]
    pub encryption: IpsecEncryption,
    #[serde(default = "default_encapsulation")]
    pub encapsulation: IpsecEncapsulation,
}

fn default_authentication() -> IpsecAuthentication {
    IpsecAuthentication::Sha1
}
fn default_encryption() -> IpsecEncryption {
    IpsecEncryption::Aes
}
fn default_encapsulation() -> IpsecEncapsulation {
    IpsecEncapsulation::Udp
}

impl Default for IpsecConfig {
    fn default() -> Self {
        Self {
            authentication: default_authentication(),
            encryption: default_encryption(),
            encapsulation: default_encapsulation(),
        }
    }
}

/// Merged view of the YAML config file and the CLI flags that mirror it.
/// Flags win over file values; file values win over these defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub provider: Provider,
    pub target_link_name: Option<String>,
    #[serde(rename = "podCIDR")]
    pub pod_cidr: Option<String>,
    pub resync_period: Option<String>,
    pub node_name: Option<String>,
    #[serde(rename = "machineIDPath")]
    pub machine_id_path: Option<String>,
    #[serde(rename = "systemUUIDPath")]
    pub system_uuid_path: Option<String>,
    #[serde(rename = "bootIDPath")]
    pub boot_id_path: Option<String>,
    pub ipsec: IpsecConfig,
    pub log_level: i32,
    pub cni_config_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            target_link_name: None,
            pod_cidr: None,
            resync_period: None,
            node_name: None,
            machine_id_path: None,
            system_uuid_path: None,
            boot_id_path: None,
            ipsec: IpsecConfig::default(),
            log_level: 0,
            cni_config_path: None,
        }
    }
}
