//! Topic/subscription provisioning for registered queues
//!
//! `POST /_queues/init/<key>` walks every registered queue and makes
//! the pub/sub side match: a `queue.<name>` topic, a `worker.<name>`
//! push subscription pointed at the delivery endpoint, and an updated
//! endpoint when the base URL or delivery secret has moved. The call
//! is idempotent so deploys can fire it unconditionally.

use std::sync::Arc;

use crate::app::App;
use crate::context::Context;
use crate::http::Disposition;
use crate::pubsub::PushConfig;
use crate::token::constant_time_eq;

pub(crate) fn init_queues(app: &Arc<App>, ctx: &Context, key: &str) -> Disposition {
    let expected = &app.config().queue_init_key;
    if expected.is_empty() || !constant_time_eq(key.as_bytes(), expected.as_bytes()) {
        log::warn!("queue init called with a bad key");
        return Disposition::NotFound;
    }
    let init_ctx = ctx.with_timeout(app.config().queue_init_timeout());
    let result = provision_all(app, &init_ctx);
    if !init_ctx.same_node(ctx) {
        init_ctx.cancel();
    }
    match result {
        Ok(()) => {
            ctx.write_str("ok");
            Disposition::Handled
        }
        Err(err) => {
            log::error!("queue provisioning failed: {err:#}");
            Disposition::ServerError
        }
    }
}

/// Where push deliveries should be addressed
fn base_url(app: &Arc<App>, ctx: &Context) -> String {
    let config = app.config();
    if config.dev_mode {
        return format!("http://{}", ctx.request().host);
    }
    match &config.canonical_host {
        Some(canonical) => format!("https://{canonical}"),
        None => format!("https://{}", ctx.request().host),
    }
}

fn provision_all(app: &Arc<App>, ctx: &Context) -> anyhow::Result<()> {
    let base = base_url(app, ctx);
    let pubsub = app.pubsub();
    for queue in app.queues().values() {
        let topic = queue.topic();
        if !pubsub.topic_exists(ctx, &topic)? {
            log::info!("creating topic {topic}");
            pubsub.create_topic(ctx, &topic)?;
        }
        let endpoint = format!(
            "{base}/_queues/handle/{}/{}",
            queue.name(),
            hex::encode(queue.secret())
        );
        let subscription = queue.subscription();
        if !pubsub.subscription_exists(ctx, &subscription)? {
            log::info!("creating subscription {subscription} -> {topic}");
            pubsub.create_subscription(
                ctx,
                &subscription,
                &topic,
                queue.timeout(),
                PushConfig { endpoint },
            )?;
        } else {
            let current = pubsub.push_config(ctx, &subscription)?;
            if current.endpoint != endpoint {
                log::info!("updating push endpoint for {subscription}");
                pubsub.set_push_config(ctx, &subscription, PushConfig { endpoint })?;
            }
        }
    }
    Ok(())
}
