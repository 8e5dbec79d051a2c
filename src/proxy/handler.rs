//! Pipeline driver
//!
//! Threads one request context through the interceptor chain, the session
//! fabric, and the mode service, then finalizes the response: request
//! interceptors run for every request, the mode handler only for monitored
//! ones (everything else is forwarded as plain passthrough), and response
//! interceptors are skipped entirely for non-monitored requests. Every
//! transaction ends with a traffic log line.

use crate::context::{RequestContext, ResponseContext};
use crate::modes::{forward_upstream, Mode};
use crate::traffic_log::TrafficRecord;

use super::server::ProxyServices;

/// Process one request end to end. Always returns exactly one response.
pub async fn process(
    services: &ProxyServices,
    mut ctx: RequestContext,
) -> (RequestContext, ResponseContext) {
    ctx.monitored = services.traffic.is_monitored_request(
        &ctx.current.host,
        &ctx.current.headers,
        &ctx.current.query,
    );
    ctx.metadata.mode = services.modes.current().as_str().to_string();

    let mut resp = run_pipeline(services, &mut ctx).await;

    if ctx.monitored {
        if let Err(e) = services.chain.run_response(&ctx, &mut resp) {
            tracing::warn!("Response interceptor chain failed: {}", e);
            resp = ResponseContext::error(500, "response processing failed", ctx.metadata.request_id.clone());
        }
    }

    services
        .traffic_log
        .log(TrafficRecord::from_exchange(&ctx, &resp));

    (ctx, resp)
}

async fn run_pipeline(services: &ProxyServices, ctx: &mut RequestContext) -> ResponseContext {
    if let Err(e) = services.chain.run_request(ctx) {
        tracing::warn!("Request interceptor chain failed: {}", e);
        return ResponseContext::error(500, "request processing failed", ctx.metadata.request_id.clone());
    }

    if !ctx.monitored {
        // Non-monitored traffic is forwarded regardless of mode; no records,
        // no stats, no session work
        return forward_upstream(ctx, &services.mode_deps).await;
    }

    let identity = match services.sessions.resolve_identity(ctx) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!("Identity resolution failed: {}", e);
            None
        }
    };

    let mut resp = services
        .modes
        .handle(ctx, identity.as_ref(), &services.mode_deps)
        .await;

    // Create triggers fire in any mode; in replay the freshly created
    // session feeds the token substitutions that identity could not
    let created = match services.sessions.apply_create_rules(ctx, &mut resp) {
        Ok(created) => created,
        Err(e) => {
            tracing::warn!("Session creation failed: {}", e);
            None
        }
    };
    if services.modes.current() == Mode::Replay {
        if identity.is_none() {
            if let Some(session) = &created {
                if let Err(e) = services
                    .sessions
                    .apply_replay_substitutions(ctx, &mut resp, session)
                {
                    tracing::warn!("Replay substitution failed: {}", e);
                }
            }
        }
    } else if let Some(session_id) = ctx.metadata.session_id {
        // Update triggers capture real upstream tokens; synthesized replay
        // responses carry none
        if let Err(e) = services
            .sessions
            .apply_update_rules(ctx, &resp, session_id)
            .await
        {
            tracing::warn!("Session update failed: {}", e);
        }
    }

    if let Some(identity) = &identity {
        services.sessions.project_cross_domain(ctx, &mut resp, identity);
    }

    resp
}
