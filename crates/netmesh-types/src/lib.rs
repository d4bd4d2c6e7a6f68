mod config;
mod node;

pub use config::{Config, IpsecAuthentication, IpsecConfig, IpsecEncapsulation, IpsecEncryption, Provider};
pub use node::NodeRecord;
