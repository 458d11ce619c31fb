use serde::Serialize;
pub(crate) mod health_check_controller;
pub(crate) mod item_controller;
pub(crate) mod notification_controller;
pub(crate) mod room_controller;
pub(crate) mod stats_controller;
pub(crate) mod task_controller;

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(status_code: u16, data: T) -> Self {
        Self {
            status_code,
            data: Some(data),
        }
    }
}
