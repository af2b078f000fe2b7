//! Thin wrappers over the V8 inspector: the client V8 calls back into and
//! the channels that carry protocol traffic out.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use v8::inspector::{
    Channel, ChannelImpl, StringBuffer, StringView, V8Inspector, V8InspectorClient, V8InspectorClientImpl,
    V8InspectorClientTrustLevel, V8InspectorSession,
};

use super::DebugAgent;
use crate::isolate::IsolateInner;

/// Every context of an isolate lives in one inspector group.
pub(crate) const CONTEXT_GROUP_ID: i32 = 1;

struct Client {
    isolate: Weak<IsolateInner>,
}

impl V8InspectorClientImpl for Client {
    fn run_message_loop_on_pause(&self, _context_group_id: i32) {
        if let Some(isolate) = self.isolate.upgrade() {
            super::run_message_loop_on_pause(&isolate);
        }
    }

    fn quit_message_loop_on_pause(&self) {
        if let Some(isolate) = self.isolate.upgrade() {
            super::quit_message_loop_on_pause(&isolate);
        }
    }

    fn run_if_waiting_for_debugger(&self, _context_group_id: i32) {
        if let Some(isolate) = self.isolate.upgrade() {
            super::run_if_waiting_for_debugger(&isolate);
        }
    }
}

/// Where a session's outbound messages go.
pub(crate) enum Sink {
    /// Everything, to the host's debug agent.
    Agent(Arc<dyn DebugAgent>),
    /// Responses only, kept for the caller to pick up.
    Capture(Arc<Mutex<Vec<String>>>),
}

struct Outbound(Sink);

impl Outbound {
    fn deliver(&self, message: v8::UniquePtr<StringBuffer>, is_response: bool) {
        let Some(message) = message.into_option() else {
            return;
        };
        let text = message.string().to_string();
        match &self.0 {
            Sink::Agent(agent) => agent.send_message(&text),
            Sink::Capture(responses) if is_response => responses.lock().push(text),
            Sink::Capture(_) => {}
        }
    }
}

impl ChannelImpl for Outbound {
    fn send_response(&self, _call_id: i32, message: v8::UniquePtr<StringBuffer>) {
        self.deliver(message, true);
    }

    fn send_notification(&self, message: v8::UniquePtr<StringBuffer>) {
        self.deliver(message, false);
    }

    fn flush_protocol_notifications(&self) {}
}

pub(crate) struct Inspector {
    inspector: V8Inspector,
}

impl Inspector {
    pub(crate) fn new(v8_isolate: &mut v8::Isolate, isolate: &Arc<IsolateInner>) -> Self {
        let client = V8InspectorClient::new(Box::new(Client {
            isolate: Arc::downgrade(isolate),
        }));
        tracing::debug!("Creating inspector for isolate {}", isolate.name);
        Self {
            inspector: V8Inspector::create(v8_isolate, client),
        }
    }

    pub(crate) fn context_created(&self, context: v8::Local<'_, v8::Context>, name: &str) {
        let name = utf16(name);
        let aux = utf16(r#"{"isDefault":true}"#);
        self.inspector
            .context_created(context, CONTEXT_GROUP_ID, StringView::from(&name[..]), StringView::from(&aux[..]));
    }

    pub(crate) fn context_destroyed(&self, context: v8::Local<'_, v8::Context>) {
        self.inspector.context_destroyed(context);
    }

    pub(crate) fn connect(&self, sink: Sink) -> Session {
        let channel = Channel::new(Box::new(Outbound(sink)));
        Session {
            session: self.inspector.connect(
                CONTEXT_GROUP_ID,
                channel,
                StringView::empty(),
                V8InspectorClientTrustLevel::FullyTrusted,
            ),
        }
    }
}

pub(crate) struct Session {
    session: V8InspectorSession,
}

impl Session {
    pub(crate) fn dispatch(&self, message: &str) {
        let message = utf16(message);
        self.session.dispatch_protocol_message(StringView::from(&message[..]));
    }

    pub(crate) fn schedule_pause_on_next_statement(&self, reason: &str) {
        let reason = utf16(reason);
        self.session
            .schedule_pause_on_next_statement(StringView::from(&reason[..]), StringView::empty());
    }
}

// 8-bit views are Latin-1; protocol text is UTF-8, so go through UTF-16.
fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}
