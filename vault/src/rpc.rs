//! JSON-RPC 2.0 over the vault transport: message types, the method
//! dispatcher, and the plugin registry.

pub mod dispatch;
pub mod jsonrpc;
pub mod plugins;
