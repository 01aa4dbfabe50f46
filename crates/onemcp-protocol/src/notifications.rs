//! Notification constructors.

use serde_json::json;

use crate::json_rpc::JsonRpcNotification;
use crate::methods;

/// `notifications/initialized`, sent by a client after the handshake.
pub fn initialized() -> JsonRpcNotification {
    JsonRpcNotification::new(methods::NOTIFICATION_INITIALIZED, None)
}

/// `notifications/tools/list_changed`.
pub fn tools_list_changed() -> JsonRpcNotification {
    JsonRpcNotification::new(methods::NOTIFICATION_TOOLS_LIST_CHANGED, None)
}

/// `notifications/resources/list_changed`.
pub fn resources_list_changed() -> JsonRpcNotification {
    JsonRpcNotification::new(methods::NOTIFICATION_RESOURCES_LIST_CHANGED, None)
}

/// `notifications/resources/updated` for a subscribed uri.
pub fn resource_updated(uri: impl Into<String>) -> JsonRpcNotification {
    JsonRpcNotification::new(
        methods::NOTIFICATION_RESOURCE_UPDATED,
        Some(json!({ "uri": uri.into() })),
    )
}

/// `notifications/prompts/list_changed`.
pub fn prompts_list_changed() -> JsonRpcNotification {
    JsonRpcNotification::new(methods::NOTIFICATION_PROMPTS_LIST_CHANGED, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_updated_carries_uri() {
        let notification = resource_updated("file:///a.txt");
        assert_eq!(notification.method, methods::NOTIFICATION_RESOURCE_UPDATED);
        assert_eq!(
            notification.params.unwrap()["uri"],
            serde_json::json!("file:///a.txt")
        );
    }
}
