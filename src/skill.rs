//! Chat platform skill protocol: inbound payload and reply envelopes.
//!
//! Only the fields the relay reads are modelled; everything else in the
//! payload is ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::truncate_chars;

pub const SKILL_VERSION: &str = "2.0";

/// Reply when the backend never produced an answer.
pub const FALLBACK_TEXT: &str = "지금은 답변 서버가 혼잡해요. 잠시 뒤에 다시 시도해 주세요.";
/// Reply to an empty message.
pub const CLARIFY_TEXT: &str = "질문을 입력해 주세요 🙂";
/// Immediate acknowledgment in callback mode.
pub const WAIT_TEXT: &str = "답변을 준비하고 있어요. 잠시만 기다려 주세요!";
/// Reply when request handling itself blew up.
pub const TEMPORARY_ERROR_TEXT: &str =
    "일시적인 오류가 발생했어요. 연결은 유지되고 있으니 잠시 후 다시 시도해 주세요.";
/// Reply to GET/HEAD reachability checks of the webhook URL.
pub const REACHABILITY_TEXT: &str = "ok";

/// simpleText bodies longer than this are cut by the platform.
pub const MAX_TEXT_CHARS: usize = 1000;

/// Anonymous requests share one rate-limit identity.
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SkillPayload {
    #[serde(default)]
    pub user_request: UserRequest,
    #[serde(default)]
    pub action: Action,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub utterance: Option<String>,
    pub callback_url: Option<String>,
    pub user: Option<SkillUser>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SkillUser {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Action {
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl SkillPayload {
    /// Parse a raw body.  Anything that is not a usable payload becomes the
    /// empty payload, which resolves to an empty utterance.
    pub fn from_slice(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::default();
        }
        match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::debug!(error = %err, "unparsable skill payload, treating as empty");
                Self::default()
            }
        }
    }

    pub fn usrtext(&self) -> Option<&str> {
        self.action.params.get("usrtext").and_then(Value::as_str)
    }

    pub fn utterance(&self) -> Option<&str> {
        self.user_request.utterance.as_deref()
    }

    /// Rate-limit identity for this request.
    pub fn user_key(&self) -> String {
        self.user_request
            .user
            .as_ref()
            .and_then(|u| u.id.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS_USER)
            .to_string()
    }

    /// Callback address, when the platform offered one.
    pub fn callback_url(&self) -> Option<&str> {
        self.user_request
            .callback_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceSource {
    Usrtext,
    Utterance,
    None,
}

impl UtteranceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            UtteranceSource::Usrtext => "action.params.usrtext",
            UtteranceSource::Utterance => "userRequest.utterance",
            UtteranceSource::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    pub text: String,
    pub source: UtteranceSource,
}

/// Slot filling leaves a literal `@name` marker when it captured nothing.
pub fn is_placeholder(text: &str) -> bool {
    text.starts_with('@')
}

/// Pick the user's text: the slot parameter, then the raw utterance.  A
/// placeholder loses to real text; it is only returned when nothing real
/// exists.
pub fn resolve_utterance(payload: &SkillPayload) -> Utterance {
    let candidates = [
        (payload.usrtext(), UtteranceSource::Usrtext),
        (payload.utterance(), UtteranceSource::Utterance),
    ];
    let trimmed = candidates
        .iter()
        .filter_map(|(text, source)| text.map(|t| (t.trim(), *source)))
        .filter(|(t, _)| !t.is_empty());

    let mut placeholder = None;
    for (text, source) in trimmed {
        if !is_placeholder(text) {
            return Utterance {
                text: text.to_string(),
                source,
            };
        }
        placeholder.get_or_insert((text, source));
    }
    match placeholder {
        Some((text, source)) => Utterance {
            text: text.to_string(),
            source,
        },
        None => Utterance {
            text: String::new(),
            source: UtteranceSource::None,
        },
    }
}

#[derive(Debug, Serialize)]
pub struct SkillResponse {
    version: &'static str,
    template: Template,
}

#[derive(Debug, Serialize)]
struct Template {
    outputs: Vec<Output>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Output {
    simple_text: SimpleText,
}

#[derive(Debug, Serialize)]
struct SimpleText {
    text: String,
}

impl SkillResponse {
    /// simpleText envelope, clipped to what the platform will display.
    pub fn text(text: &str) -> Self {
        let text = if text.chars().count() > MAX_TEXT_CHARS {
            format!("{}…", truncate_chars(text, MAX_TEXT_CHARS - 1))
        } else {
            text.to_string()
        };
        SkillResponse {
            version: SKILL_VERSION,
            template: Template {
                outputs: vec![Output {
                    simple_text: SimpleText { text },
                }],
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAck {
    version: &'static str,
    use_callback: bool,
    data: AckData,
}

#[derive(Debug, Serialize)]
struct AckData {
    text: String,
}

impl CallbackAck {
    pub fn new(text: &str) -> Self {
        CallbackAck {
            version: SKILL_VERSION,
            use_callback: true,
            data: AckData {
                text: text.to_string(),
            },
        }
    }
}

/// What the webhook answers right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillReply {
    /// Final answer in a simpleText envelope.
    Text(String),
    /// Callback mode acknowledgment; the answer follows by callback.
    Deferred(String),
}

impl SkillReply {
    pub fn to_json(&self) -> Value {
        let encoded = match self {
            SkillReply::Text(t) => serde_json::to_value(SkillResponse::text(t)),
            SkillReply::Deferred(t) => serde_json::to_value(CallbackAck::new(t)),
        };
        encoded.unwrap_or(Value::Null)
    }
}
