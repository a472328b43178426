use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Body of `POST /offer`.
#[derive(Serialize, Debug, Clone)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

/// Successful answer to an offer. `sessionid` is validated while parsing.
#[derive(Deserialize, Debug, Clone)]
pub struct OfferAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sessionid: SessionId,
}

/// Error body the server attaches to non-2xx replies.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ErrorBody {
    pub msg: Option<String>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    StartRecord,
    EndRecord,
}

#[derive(Serialize, Debug, Clone)]
pub struct RecordRequest {
    #[serde(rename = "type")]
    pub action: RecordAction,
    pub sessionid: SessionId,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HumanKind {
    /// The avatar repeats the text verbatim.
    Echo,
    /// The text is answered by the server's language model.
    Chat,
}

#[derive(Serialize, Debug, Clone)]
pub struct HumanRequest {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: HumanKind,
    pub interrupt: bool,
    pub sessionid: SessionId,
}

#[derive(Serialize, Debug, Clone)]
pub struct SessionRequest {
    pub sessionid: SessionId,
}

/// `{code, msg}` reply shared by the session endpoints and the audio socket.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServerReply {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct IsSpeakingReply {
    pub code: i64,
    #[serde(default)]
    pub data: Option<bool>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_request_uses_server_field_names() {
        let req = RecordRequest {
            action: RecordAction::EndRecord,
            sessionid: SessionId::new(42).unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"type": "end_record", "sessionid": 42})
        );
    }

    #[test]
    fn answer_with_non_positive_session_is_rejected() {
        let ok = r#"{"sdp":"v=0","type":"answer","sessionid":7}"#;
        assert_eq!(serde_json::from_str::<OfferAnswer>(ok).unwrap().sessionid.get(), 7);

        let zero = r#"{"sdp":"v=0","type":"answer","sessionid":0}"#;
        assert!(serde_json::from_str::<OfferAnswer>(zero).is_err());
        let missing = r#"{"sdp":"v=0","type":"answer"}"#;
        assert!(serde_json::from_str::<OfferAnswer>(missing).is_err());
    }

    #[test]
    fn reply_message_is_optional() {
        let reply: ServerReply = serde_json::from_str(r#"{"code":0}"#).unwrap();
        assert_eq!(reply, ServerReply { code: 0, msg: None });
    }
}
