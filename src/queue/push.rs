//! The push-delivery endpoint
//!
//! Pub/sub POSTs one message per request to
//! `/_queues/handle/<queue>/<key>`. The status code is the ack
//! protocol: 2xx acknowledges the message, anything else redelivers
//! it. Malformed or misaddressed deliveries are acknowledged with a
//! 204 after logging, since redelivering them can never succeed; only
//! a failing handler produces a 500 and a retry.

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::{TaskPayload, WorkerCallError};
use crate::app::App;
use crate::context::Context;
use crate::http::Disposition;
use crate::token::constant_time_eq;

/// The JSON wrapper pub/sub wraps around each pushed message
#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
    subscription: String,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(default)]
    #[allow(dead_code)]
    attributes: HashMap<String, String>,
    /// Base64 of the published payload
    data: String,
    message_id: String,
}

/// Acknowledge without processing: the message is consumed and logged,
/// never retried.
fn reject(ctx: &Context, reason: &str) -> Disposition {
    log::error!("rejecting queue push: {reason}");
    ctx.set_response_status(204);
    Disposition::Handled
}

pub(crate) fn handle_push(
    app: &Arc<App>,
    ctx: &Context,
    queue_name: &str,
    key: &str,
) -> Disposition {
    let Some(queue) = app.queues().get(queue_name) else {
        return reject(ctx, &format!("unknown queue {queue_name:?}"));
    };
    let authorized = hex::decode(key)
        .map(|k| constant_time_eq(&k, queue.secret()))
        .unwrap_or(false);
    if !authorized {
        return reject(ctx, &format!("bad delivery key for queue {queue_name:?}"));
    }

    let envelope: PushEnvelope = match serde_json::from_slice(&ctx.request().body) {
        Ok(envelope) => envelope,
        Err(err) => return reject(ctx, &format!("undecodable push envelope: {err}")),
    };
    if envelope.subscription != queue.subscription()
        && !envelope.subscription.ends_with(&format!("/{}", queue.subscription()))
    {
        return reject(
            ctx,
            &format!("subscription {:?} does not feed queue {queue_name:?}", envelope.subscription),
        );
    }
    let data = match BASE64_STANDARD.decode(&envelope.message.data) {
        Ok(data) => data,
        Err(err) => return reject(ctx, &format!("undecodable message data: {err}")),
    };
    let payload: TaskPayload = match serde_json::from_slice(&data) {
        Ok(payload) => payload,
        Err(err) => return reject(ctx, &format!("undecodable task payload: {err}")),
    };

    let Some(worker) = app.workers().get(&payload.worker) else {
        return reject(ctx, &format!("unknown worker {:?}", payload.worker));
    };
    if worker.queue() != queue_name {
        return reject(
            ctx,
            &format!("worker {:?} belongs to queue {:?}", payload.worker, worker.queue()),
        );
    }
    if worker.adapter().arity() != payload.args.len() {
        return reject(
            ctx,
            &format!(
                "worker {:?} takes {} argument(s), payload has {}",
                payload.worker,
                worker.adapter().arity(),
                payload.args.len()
            ),
        );
    }

    let task_ctx = ctx.with_timeout(queue.timeout());
    let result = worker.adapter().call(&task_ctx, &payload.args);
    if !task_ctx.same_node(ctx) {
        task_ctx.cancel();
    }
    match result {
        Ok(()) => {
            ctx.write_str("ok");
            Disposition::Handled
        }
        Err(WorkerCallError::Decode { index, source }) => reject(
            ctx,
            &format!("worker {:?} argument {index} did not decode: {source}", payload.worker),
        ),
        Err(WorkerCallError::Handler(err)) => {
            log::error!(
                "worker {:?} failed on message {}: {err:#}",
                payload.worker,
                envelope.message.message_id
            );
            Disposition::ServerError
        }
    }
}
