pub mod channel;

/// Address set for one application, published by the discovery task each
/// time the node-directory answer changes.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSetEvent {
    pub app_name: String,
    pub addresses: Vec<String>,
}
