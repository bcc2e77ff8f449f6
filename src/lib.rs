pub mod cache;
pub mod config;
pub mod filters;
pub mod framing;
pub mod ldap_protocol;
pub mod overlay;
pub mod server;
pub mod tls;

pub use config::Config;
pub use server::LdapProxy;
