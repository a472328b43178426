//! End-to-end negotiation against a local answering peer.
//!
//! Needs working host networking for ICE, so it only runs on request:
//! `cargo test --test loopback_tests -- --ignored`

mod common;

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use common::*;
use livetalk_client::api::ServerApi;
use livetalk_client::rtc::RtcNegotiator;
use livetalk_client::{ConnectionStatus, Controller};
use serde_json::{Value, json};
use tokio::time::timeout;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

type Peers = Arc<Mutex<Vec<Arc<RTCPeerConnection>>>>;

async fn answer(State(peers): State<Peers>, Json(body): Json<Value>) -> Json<Value> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());

    let offer = RTCSessionDescription::offer(body["sdp"].as_str().unwrap().to_string()).unwrap();
    pc.set_remote_description(offer).await.unwrap();
    let answer = pc.create_answer(None).await.unwrap();
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await.unwrap();
    let _ = gathered.recv().await;

    let local = pc.local_description().await.unwrap();
    peers.lock().unwrap().push(pc);
    Json(json!({"sdp": local.sdp, "type": "answer", "sessionid": 42}))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn negotiates_with_a_local_peer() {
    let peers = Peers::default();
    let app = Router::new()
        .route("/offer", post(answer))
        .route("/record", post(|| async { Json(json!({"code": 0})) }))
        .with_state(peers.clone());
    let base = serve(app).await;

    let config = config(&base, "batch");
    let api = ServerApi::new(&config.api_base_url).unwrap();
    let negotiator = Arc::new(RtcNegotiator::new(api.clone(), config.webrtc.clone()));
    let (controller, handle) =
        Controller::new(&config, negotiator, Arc::new(DeniedMicrophone), api);
    tokio::spawn(controller.run());

    let session = handle.start(false).await.unwrap();
    assert_eq!(session.get(), 42);

    let snapshot = timeout(
        WAIT * 4,
        handle.wait_for(|s| s.status == ConnectionStatus::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(snapshot.session, Some(session));

    handle.stop().await.unwrap();
    timeout(WAIT, handle.wait_for(|s| s.status == ConnectionStatus::Disconnected))
        .await
        .unwrap()
        .unwrap();

    handle.shutdown().await.unwrap();
    let peers: Vec<_> = peers.lock().unwrap().drain(..).collect();
    for pc in peers {
        let _ = pc.close().await;
    }
}
