//! CLI command modules.

pub mod hostmap;
pub mod http;
pub mod pki;
pub mod status;
