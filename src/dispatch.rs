//! Per-request control flow: guard, utterance, then sync or callback.

use tracing::Instrument;

use crate::callback::CallbackWorker;
use crate::diag::{now_rfc3339, Counter, Diagnostics, LastRequest};
use crate::error::RelayError;
use crate::guard::{AbuseGuard, Verdict};
use crate::responder::SyncResponder;
use crate::skill::{
    resolve_utterance, SkillPayload, SkillReply, Utterance, UtteranceSource, CLARIFY_TEXT,
    WAIT_TEXT,
};

/// How the answer reaches the user, decided once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchDecision {
    Synchronous,
    /// Acknowledge now, POST the answer to this URL later.
    Asynchronous(String),
}

impl DispatchDecision {
    pub fn for_payload(payload: &SkillPayload, callbacks_enabled: bool) -> Self {
        match payload.callback_url() {
            Some(url) if callbacks_enabled => DispatchDecision::Asynchronous(url.to_string()),
            _ => DispatchDecision::Synchronous,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    guard: AbuseGuard,
    responder: SyncResponder,
    worker: CallbackWorker,
    diag: Diagnostics,
}

impl Dispatcher {
    pub fn new(
        guard: AbuseGuard,
        responder: SyncResponder,
        worker: CallbackWorker,
        diag: Diagnostics,
    ) -> Self {
        Self {
            guard,
            responder,
            worker,
            diag,
        }
    }

    pub fn guard(&self) -> &AbuseGuard {
        &self.guard
    }

    /// Produce the immediate webhook reply.  Rate limiting is keyed on the
    /// user alone, so it runs before the message is even looked at.
    pub async fn dispatch(&self, payload: &SkillPayload) -> SkillReply {
        let request_id = uuid::Uuid::new_v4().to_string();
        let user_key = payload.user_key();
        let span = tracing::info_span!("dispatch", %request_id, %user_key);
        self.dispatch_inner(payload, request_id, user_key)
            .instrument(span)
            .await
    }

    async fn dispatch_inner(
        &self,
        payload: &SkillPayload,
        request_id: String,
        user_key: String,
    ) -> SkillReply {
        self.diag.bump(Counter::Requests);
        let mut record = LastRequest {
            request_id: request_id.clone(),
            utterance: String::new(),
            source: UtteranceSource::None.as_str(),
            raw_usrtext: payload.usrtext().map(str::to_string),
            raw_utterance: payload.utterance().map(str::to_string),
            user_key: user_key.clone(),
            mode: "denied",
            attempts: 0,
            answered: false,
            at: now_rfc3339(),
        };

        if let Verdict::Denied(denial) = self.guard.check(&user_key).await {
            tracing::info!(reason = %denial.reason.kind(), "request denied by guard");
            self.diag.bump(Counter::Denied);
            self.diag.record_request(record);
            return SkillReply::Text(denial.message);
        }

        let Utterance { text, source } = resolve_utterance(payload);
        record.utterance = text.clone();
        record.source = source.as_str();
        tracing::info!(
            source = source.as_str(),
            chars = text.chars().count(),
            "webhook utterance"
        );

        if text.is_empty() {
            tracing::info!(reason = %RelayError::EmptyInput.kind(), "no utterance, asking for one");
            record.mode = "empty";
            self.diag.record_request(record);
            return SkillReply::Text(CLARIFY_TEXT.to_string());
        }

        match DispatchDecision::for_payload(payload, self.worker.policy().enabled) {
            DispatchDecision::Asynchronous(url) => {
                record.mode = "callback";
                self.diag.record_request(record);
                self.diag.bump(Counter::CallbacksSpawned);
                self.worker.spawn(url, text, request_id);
                SkillReply::Deferred(WAIT_TEXT.to_string())
            }
            DispatchDecision::Synchronous => {
                let outcome = self.responder.respond(&text).await;
                if !outcome.answered {
                    self.diag.bump(Counter::Fallbacks);
                }
                record.mode = "sync";
                record.attempts = outcome.attempts;
                record.answered = outcome.answered;
                self.diag.record_request(record);
                SkillReply::Text(outcome.reply)
            }
        }
    }
}
