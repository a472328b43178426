mod common;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use common::*;
use livetalk_client::api::ServerApi;
use livetalk_client::event::Event;
use livetalk_client::rtc::{
    IceState, Negotiator, PeerState, RtcNegotiator, TransportEvent, TransportEvents, TransportSignal,
};
use livetalk_client::NegotiationError;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test]
async fn rejected_offer_closes_the_peer() {
    let app = Router::new().route(
        "/offer",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"msg": "no avatar"}))) }),
    );
    let config = config(&serve(app).await, "stream");
    let api = ServerApi::new(&config.api_base_url).unwrap();
    let negotiator = RtcNegotiator::new(api, config.webrtc.clone());

    let (tx, mut rx) = mpsc::channel::<Event>(64);
    let result = negotiator.negotiate(false, TransportEvents::new(1, tx)).await;
    assert_eq!(
        result.err(),
        Some(NegotiationError::Rejected {
            status: 500,
            message: "no avatar".into()
        })
    );

    let closed = timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if let Event::Transport(TransportEvent { attempt, signal }) = event {
                assert_eq!(attempt, 1);
                if matches!(
                    signal,
                    TransportSignal::Peer(PeerState::Closed) | TransportSignal::Ice(IceState::Closed)
                ) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert!(matches!(closed, Ok(true)), "peer was not closed");
}
