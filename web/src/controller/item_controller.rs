use crate::contract::{
    ResponseContract, RouteContract, RouteRequest, StreamHandler, SyncHandler, SyncResponse,
};
use crate::dispatch::Responder;
use crate::error::Error;
use crate::schema::RequiredFields;
use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::json;
use sse::{BoxError, Message};

pub const VERSION_HEADER: &str = "x-item-version";

#[derive(Debug, Serialize)]
struct Item {
    id: &'static str,
    name: &'static str,
    version: u64,
}

const ITEMS: &[Item] = &[
    Item {
        id: "1",
        name: "Standing desk",
        version: 3,
    },
    Item {
        id: "2",
        name: "Desk lamp",
        version: 1,
    },
];

fn find(request: &RouteRequest) -> Option<&'static Item> {
    let id = request.param("id")?;
    ITEMS.iter().find(|item| item.id == id)
}

fn fields() -> RequiredFields {
    RequiredFields::new(&["id", "name", "version"])
}

/// GET /items/{id}: the item as JSON, or a `snapshot` event after which the
/// stream stays in the `item:{id}` room.
pub(crate) fn contract() -> RouteContract {
    RouteContract::dual(
        ResponseContract::new(fields()).require_header(HeaderName::from_static(VERSION_HEADER)),
        ReadItem,
        WatchItem,
    )
    .event("snapshot", fields())
}

/// Room carrying updates for one item.
pub fn room(id: &str) -> String {
    format!("item:{id}")
}

struct ReadItem;

#[async_trait]
impl SyncHandler for ReadItem {
    async fn handle(&self, request: RouteRequest) -> Result<SyncResponse, Error> {
        let item = find(&request).ok_or_else(Error::not_found)?;
        Ok(SyncResponse::ok(json!(item)).with_header(
            HeaderName::from_static(VERSION_HEADER),
            HeaderValue::from(item.version),
        ))
    }
}

struct WatchItem;

#[async_trait]
impl StreamHandler for WatchItem {
    async fn handle(&self, request: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
        let Some(item) = find(&request) else {
            // Rejected before any stream header is written
            responder.respond(StatusCode::NOT_FOUND, json!({ "error": "item not found" }))?;
            return Ok(());
        };

        let stream = responder.start().await?;
        stream.join(room(item.id));
        stream.send(Message::new(json!(item)).with_event("snapshot"));
        stream.closed().await;
        Ok(())
    }
}
