//! Routing of decoded envelopes.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use cmserver_protocol::{Envelope, Hello, Signal};

use crate::correlator::RequestCorrelator;
use crate::error::ClientError;
use crate::hooks::{ClientHooks, ProgressUpdate};

/// What the event loop must do after a dispatch.
#[derive(Debug, PartialEq)]
pub(crate) enum Routed {
    Handled,
    /// First greeting of the connection; start the handshake.
    Hello(Hello),
}

/// Sends replies and errors to the correlator and notifications to hooks.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    correlator: Arc<RequestCorrelator>,
    hooks: ClientHooks,
    hello_seen: bool,
}

impl Dispatcher {
    pub(crate) fn new(correlator: Arc<RequestCorrelator>, hooks: ClientHooks) -> Self {
        Self {
            correlator,
            hooks,
            hello_seen: false,
        }
    }

    pub(crate) fn dispatch(&mut self, envelope: Envelope) -> Routed {
        trace!(kind = %envelope.kind(), cookie = ?envelope.cookie(), "dispatching");

        match envelope {
            Envelope::Hello(hello) => {
                if self.hello_seen {
                    warn!("ignoring repeated hello");
                    return Routed::Handled;
                }
                self.hello_seen = true;
                return Routed::Hello(hello);
            }
            Envelope::HandshakeReply(reply) | Envelope::Reply(reply) => {
                let cookie = reply.cookie.clone();
                debug!(cookie = %cookie, in_reply_to = %reply.in_reply_to, "reply received");
                self.correlator.complete(&cookie, reply);
            }
            Envelope::Error(error) => {
                debug!(
                    cookie = %error.cookie,
                    in_reply_to = %error.in_reply_to,
                    message = %error.error_message,
                    "error received"
                );
                let cookie = error.cookie.clone();
                self.correlator.fail(
                    &cookie,
                    ClientError::Server {
                        cookie: error.cookie,
                        in_reply_to: error.in_reply_to,
                        message: error.error_message,
                    },
                );
            }
            Envelope::Progress(progress) => {
                if let Some(cookie) = &progress.cookie
                    && !self.correlator.is_pending(cookie)
                {
                    debug!(cookie = %cookie, "dropping progress for a request that is not pending");
                    return Routed::Handled;
                }
                self.hooks.progress(&ProgressUpdate::from(progress));
            }
            Envelope::Message(message) => {
                self.hooks.message(&message.message, message.title.as_deref());
            }
            Envelope::Signal(Signal::Dirty) => {
                debug!("backend reports configuration is dirty");
                self.hooks.dirty();
            }
            Envelope::Signal(Signal::FileChange { path, properties }) => {
                info!(path = %path, properties = ?properties, "watched file changed");
            }
            Envelope::Signal(Signal::Other { name }) => {
                debug!(name = %name, "ignoring unknown signal");
            }
            Envelope::Unrecognized { kind, .. } => {
                warn!(kind = %kind, "ignoring unrecognized message type");
            }
        }
        Routed::Handled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::DrainReason;

    fn decode(text: &str) -> Envelope {
        Envelope::decode(text).unwrap()
    }

    fn dispatcher(hooks: ClientHooks) -> (Dispatcher, Arc<RequestCorrelator>) {
        let correlator = Arc::new(RequestCorrelator::new());
        (Dispatcher::new(correlator.clone(), hooks), correlator)
    }

    #[test]
    fn only_first_hello_starts_a_handshake() {
        let (mut d, _) = dispatcher(ClientHooks::new());
        let hello = r#"{"type":"hello","supportedProtocolVersions":[{"major":1,"minor":1}]}"#;

        assert!(matches!(d.dispatch(decode(hello)), Routed::Hello(_)));
        assert_eq!(d.dispatch(decode(hello)), Routed::Handled);
    }

    #[tokio::test]
    async fn reply_and_error_reach_their_own_request() {
        let (mut d, correlator) = dispatcher(ClientHooks::new());
        let (ok_cookie, ok_rx) = correlator.register().unwrap();
        let (err_cookie, err_rx) = correlator.register().unwrap();

        d.dispatch(decode(&format!(
            r#"{{"type":"error","cookie":"{err_cookie}","inReplyTo":"configure","errorMessage":"bad"}}"#
        )));
        d.dispatch(decode(&format!(
            r#"{{"type":"reply","cookie":"{ok_cookie}","inReplyTo":"compute"}}"#
        )));

        assert_eq!(ok_rx.await.unwrap().unwrap().in_reply_to, "compute");
        let err = err_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Server { ref message, .. } if message == "bad"));
    }

    #[test]
    fn unknown_cookie_does_not_panic() {
        let (mut d, correlator) = dispatcher(ClientHooks::new());
        let routed = d.dispatch(decode(r#"{"type":"reply","cookie":"99","inReplyTo":"cache"}"#));
        assert_eq!(routed, Routed::Handled);
        assert!(correlator.is_empty());
    }

    #[test]
    fn progress_goes_to_hook_unless_request_is_gone() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = ClientHooks::new().on_progress(move |p| sink.lock().unwrap().push(p.clone()));
        let (mut d, correlator) = dispatcher(hooks);
        let (cookie, _rx) = correlator.register().unwrap();

        d.dispatch(decode(&format!(
            r#"{{"type":"progress","cookie":"{cookie}","inReplyTo":"configure",
                "progressMessage":"Configuring","progressMinimum":0,"progressMaximum":2,"progressCurrent":1}}"#
        )));
        d.dispatch(decode(
            r#"{"type":"progress","cookie":"gone","progressCurrent":2}"#,
        ));
        d.dispatch(decode(r#"{"type":"progress","progressCurrent":3}"#));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].current, 1);
        assert_eq!(seen[0].maximum, 2);
        assert_eq!(seen[0].message, "Configuring");
        assert_eq!(seen[1].current, 3);
    }

    #[test]
    fn message_and_dirty_hooks_fire() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let dirty = Arc::new(AtomicUsize::new(0));
        let (m, c) = (messages.clone(), dirty.clone());
        let hooks = ClientHooks::new()
            .on_message(move |text, title| {
                m.lock()
                    .unwrap()
                    .push((text.to_string(), title.map(str::to_string)))
            })
            .on_dirty(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        let (mut d, _) = dispatcher(hooks);

        d.dispatch(decode(
            r#"{"type":"message","message":"Generating done","title":"Configure"}"#,
        ));
        d.dispatch(decode(r#"{"type":"signal","name":"dirty"}"#));
        d.dispatch(decode(
            r#"{"type":"signal","name":"fileChange","path":"/x","properties":["change"]}"#,
        ));
        d.dispatch(decode(r#"{"type":"futureThing"}"#));

        assert_eq!(
            messages.lock().unwrap().as_slice(),
            &[("Generating done".to_string(), Some("Configure".to_string()))]
        );
        assert_eq!(dirty.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replies_after_drain_are_dropped() {
        let (mut d, correlator) = dispatcher(ClientHooks::new());
        let (cookie, rx) = correlator.register().unwrap();
        correlator.drain_all(DrainReason::Shutdown);

        d.dispatch(decode(&format!(
            r#"{{"type":"reply","cookie":"{cookie}","inReplyTo":"compute"}}"#
        )));
        assert!(rx.await.unwrap().unwrap_err().is_connection_closed());
    }
}
