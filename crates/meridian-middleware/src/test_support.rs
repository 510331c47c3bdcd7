//! Helpers shared by the stage tests.

use http::{Method, StatusCode, Uri};
use meridian_core::{named_fn, Chain, Context, Handler, Recording, Request};

pub fn request(method: Method, uri: &str) -> Request {
    Request::new(method, uri.parse::<Uri>().expect("test uri"))
}

pub fn get(uri: &str) -> Request {
    request(Method::GET, uri)
}

/// A terminal handler answering `status` with `body`.
pub fn respond(status: StatusCode, body: &'static str) -> impl Handler {
    named_fn("respond", move |ctx| {
        Box::pin(async move {
            let _ = ctx.text(status, body).await;
        })
    })
}

pub fn ok() -> impl Handler {
    respond(StatusCode::OK, "ok")
}

/// Runs `middleware` followed by `handler` and finishes the response.
pub async fn run(middleware: impl Handler, handler: impl Handler, req: Request) -> (Context, Recording) {
    let (mut ctx, recording) = Context::recorded(req);
    ctx.run(Chain::from(middleware).with(handler)).await;
    ctx.finish().await.expect("finish");
    (ctx, recording)
}
