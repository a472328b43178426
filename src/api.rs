//! HTTP surface of the avatar server.

use anyhow::Context;
use log::{debug, warn};
use reqwest::{Client, Response, StatusCode, multipart};
use serde::Serialize;
use url::Url;

use crate::error::{ClientError, NegotiationError, is_session_not_found};
use crate::protocol::{
    ErrorBody, HumanRequest, IsSpeakingReply, OfferAnswer, OfferRequest, RecordAction,
    RecordRequest, ServerReply, SessionRequest,
};
use crate::session::SessionId;

#[derive(Debug, Clone)]
pub struct ServerApi {
    client: Client,
    base: Url,
}

impl ServerApi {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)
            .with_context(|| format!("invalid server base URL: {}", base_url))?;
        // Url::join replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base.join(path)
    }

    /// Posts the local offer and returns the parsed answer.
    pub async fn post_offer(&self, offer: &OfferRequest) -> Result<OfferAnswer, NegotiationError> {
        let url = self
            .endpoint("offer")
            .map_err(|e| NegotiationError::Request(e.to_string()))?;
        debug!("POST {}", url);

        let resp = self
            .client
            .post(url)
            .json(offer)
            .send()
            .await
            .map_err(|e| NegotiationError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NegotiationError::Rejected {
                status: status.as_u16(),
                message: error_message(status, resp).await,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| NegotiationError::Request(e.to_string()))?;
        serde_json::from_str::<OfferAnswer>(&body).map_err(|e| NegotiationError::Malformed(e.to_string()))
    }

    pub async fn record(&self, session: SessionId, action: RecordAction) -> Result<(), ClientError> {
        let body = RecordRequest { action, sessionid: session };
        self.post_json::<_, ServerReply>("record", session, &body)
            .await
            .and_then(|reply| check_reply(session, reply.code, reply.msg))
    }

    /// Uploads one complete WAV utterance for the avatar to answer.
    pub async fn upload_audio(&self, session: SessionId, wav: Vec<u8>) -> Result<(), ClientError> {
        let url = self.endpoint("humanaudio").map_err(|e| ClientError::Api(e.to_string()))?;
        let file = multipart::Part::bytes(wav)
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| ClientError::Api(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", file)
            .text("sessionid", session.to_string());

        debug!("POST {} (multipart)", url);
        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        let reply: ServerReply = decode_reply(resp).await?;
        check_reply(session, reply.code, reply.msg)
    }

    pub async fn human(&self, request: &HumanRequest) -> Result<(), ClientError> {
        let session = request.sessionid;
        self.post_json::<_, ServerReply>("human", session, request)
            .await
            .and_then(|reply| check_reply(session, reply.code, reply.msg))
    }

    pub async fn interrupt_talk(&self, session: SessionId) -> Result<(), ClientError> {
        let body = SessionRequest { sessionid: session };
        self.post_json::<_, ServerReply>("interrupt_talk", session, &body)
            .await
            .and_then(|reply| check_reply(session, reply.code, reply.msg))
    }

    pub async fn is_speaking(&self, session: SessionId) -> Result<bool, ClientError> {
        let body = SessionRequest { sessionid: session };
        let reply: IsSpeakingReply = self.post_json("is_speaking", session, &body).await?;
        check_reply(session, reply.code, reply.msg)?;
        Ok(reply.data.unwrap_or(false))
    }

    async fn post_json<B, R>(&self, path: &str, session: SessionId, body: &B) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = self.endpoint(path).map_err(|e| ClientError::Api(e.to_string()))?;
        debug!("POST {} (session {})", url, session);
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?;
        decode_reply(resp).await
    }
}

async fn decode_reply<R: serde::de::DeserializeOwned>(resp: Response) -> Result<R, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let message = error_message(status, resp).await;
        return Err(ClientError::Api(format!("HTTP {}: {}", status.as_u16(), message)));
    }
    resp.json::<R>()
        .await
        .map_err(|e| ClientError::Api(format!("unexpected reply: {}", e)))
}

fn check_reply(session: SessionId, code: i64, msg: Option<String>) -> Result<(), ClientError> {
    if code == 0 {
        return Ok(());
    }
    let message = msg.unwrap_or_else(|| format!("code {}", code));
    warn!("Server replied with code {}: {}", code, message);
    if is_session_not_found(&message) {
        Err(ClientError::SessionInvalidated(session))
    } else {
        Err(ClientError::Api(message))
    }
}

/// The server's `msg`, falling back to the HTTP status text.
async fn error_message(status: StatusCode, resp: Response) -> String {
    let fallback = || {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    };
    match resp.text().await {
        Ok(text) => serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.msg)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(fallback),
        Err(_) => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_base_path() {
        let api = ServerApi::new("http://127.0.0.1:8010").unwrap();
        assert_eq!(api.endpoint("offer").unwrap().as_str(), "http://127.0.0.1:8010/offer");

        let api = ServerApi::new("https://host.example/avatar").unwrap();
        assert_eq!(
            api.endpoint("humanaudio").unwrap().as_str(),
            "https://host.example/avatar/humanaudio"
        );
    }

    #[test]
    fn non_zero_code_maps_to_errors() {
        let session = SessionId::new(42).unwrap();
        assert!(check_reply(session, 0, None).is_ok());
        assert_eq!(
            check_reply(session, -1, Some("Session 42 not found".into())),
            Err(ClientError::SessionInvalidated(session))
        );
        assert_eq!(
            check_reply(session, -1, Some("boom".into())),
            Err(ClientError::Api("boom".into()))
        );
        assert_eq!(check_reply(session, 3, None), Err(ClientError::Api("code 3".into())));
    }
}
