//! Demo chat handler served at `/chat`.
//!
//! | Method | Arguments | Reply |
//! |---|---|---|
//! | `Echo` | `value` | `value` |
//! | `Whoami` | | connection id |
//! | `Join` | `room` | whether the caller was newly added |
//! | `Leave` | `room` | whether the caller was a member |
//! | `Rooms` | | rooms the caller belongs to |
//! | `Say` | `room`, `text` | none; members receive `Message(room, from, text)` |
//! | `Announce` | `text` | none; every connection receives `Announcement(from, text)` |

use async_trait::async_trait;
use serde_json::{Value, json};
use socketry_core::ResolveError;
use socketry_server::{ClientProxy, DisconnectReason, HandlerContext, MethodTable, SocketHandler};
use tracing::{debug, info};

/// Chat rooms over the group registry.
#[derive(Default)]
pub struct ChatHandler;

#[async_trait]
impl SocketHandler for ChatHandler {
    fn register_methods(methods: &mut MethodTable<Self>) {
        let _ = methods
            .method("Echo", |_h, _ctx, (value,): (Value,)| async move { Ok(value) })
            .method_sync("Whoami", |_h, ctx, (): ()| {
                Ok(ctx.connection_id().to_string())
            })
            .method_sync("Join", |_h, ctx, (room,): (String,)| Ok(ctx.join(&room)))
            .method_sync("Leave", |_h, ctx, (room,): (String,)| Ok(ctx.leave(&room)))
            .method_sync("Rooms", |_h, ctx, (): ()| {
                Ok(ctx.groups().groups_of(ctx.connection_id()))
            })
            .notification(
                "Say",
                |_h, ctx: HandlerContext, (room, text): (String, String)| async move {
                    anyhow::ensure!(
                        ctx.groups().contains(&room, ctx.connection_id()),
                        "not a member of '{room}'"
                    );
                    let from = ctx.connection_id().to_string();
                    let report = ctx
                        .groups()
                        .send(&room, "Message", vec![json!(room), json!(from), json!(text)])
                        .await;
                    debug!(room, delivered = report.delivered, "chat message");
                    Ok(())
                },
            )
            .notification(
                "Announce",
                |_h, ctx: HandlerContext, (text,): (String,)| async move {
                    let from = ctx.connection_id().to_string();
                    for (_, client) in ctx.clients().all() {
                        let _ = client
                            .send("Announcement", vec![json!(from), json!(text)])
                            .await;
                    }
                    Ok(())
                },
            );
    }

    async fn on_connected(&self, ctx: &HandlerContext) {
        info!(conn_id = %ctx.connection_id(), online = ctx.clients().len(), "chat member joined");
    }

    async fn on_disconnected(&self, ctx: &HandlerContext, reason: &DisconnectReason) {
        info!(conn_id = %ctx.connection_id(), reason = reason.label(), "chat member left");
    }

    async fn on_resolve_error(&self, ctx: &HandlerContext, _raw: &str, error: &ResolveError) {
        debug!(conn_id = %ctx.connection_id(), code = error.code(), "chat request rejected");
    }
}
