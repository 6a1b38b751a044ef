use std::sync::Arc;

use actix_web::{web, HttpResponse};
use tracing::{debug, warn};

use crate::push::{Notification, PushService};
use crate::store_format::GroupUserCursor;

/// Shared state of the internal inter-server endpoints.
pub struct InternalState {
    pub push_service: Arc<PushService>,
}

/// `POST /internal/pushGroupMsg`: a peer resolved the recipients and
/// routed the vendors we advertise to us; each destination value is the
/// cursor blob carrying the token snapshot.
pub async fn push_group_msg(
    state: web::Data<InternalState>,
    request: web::Json<proto::group::PushGroupMsgRequest>,
) -> HttpResponse {
    let Ok(gid) = request.gid.parse::<u64>() else {
        return HttpResponse::BadRequest().finish();
    };
    let Ok(mid) = request.mid.parse::<u64>() else {
        return HttpResponse::BadRequest().finish();
    };

    debug!(
        "peer group push received: gid {} mid {} destinations {}",
        gid,
        mid,
        request.destinations.len()
    );

    for (uid, blob) in &request.destinations {
        let Some(cursor) = GroupUserCursor::from_json(blob) else {
            warn!("bad destination blob for uid {}", uid);
            continue;
        };
        let notification = Notification::from_group_cursor(gid, mid, &cursor);
        let Some(push_type) = notification.push_type() else {
            continue;
        };
        if state.push_service.handles(push_type) {
            state.push_service.send(push_type, &notification).await;
        } else {
            warn!(
                "peer routed {} notification we do not handle, uid {}",
                push_type.as_str(),
                uid
            );
        }
    }

    HttpResponse::Ok().finish()
}

/// `POST /internal/pushMsg`: single-notification variant used by the
/// P2P fallback path.
pub async fn push_msg(
    state: web::Data<InternalState>,
    notification: web::Json<Notification>,
) -> HttpResponse {
    let notification = notification.into_inner();
    let Some(push_type) = notification.push_type() else {
        return HttpResponse::BadRequest().finish();
    };
    if state.push_service.handles(push_type) {
        state.push_service.send(push_type, &notification).await;
        HttpResponse::Ok().finish()
    } else {
        HttpResponse::NotFound().finish()
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/internal/pushGroupMsg").route(web::post().to(push_group_msg)))
        .service(web::resource("/internal/pushMsg").route(web::post().to(push_msg)));
}
