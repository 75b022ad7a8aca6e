//! Request dispatch: one frame in, one reply out.

use crate::protocol::{Request, Response};
use crate::publisher::EventPublisher;
use crate::storage::RegistryStore;
use crate::types::Event;
use hsu_common::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// What the connection handler should do after sending the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send the reply and keep serving.
    Reply(Response),
    /// Send the reply, then begin an orderly server stop.
    ReplyThenShutdown(Response),
}

impl Outcome {
    pub fn response(&self) -> &Response {
        match self {
            Outcome::Reply(response) | Outcome::ReplyThenShutdown(response) => response,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Outcome::ReplyThenShutdown(_))
    }
}

/// Decodes requests, applies them to the registry and announces mutations.
///
/// # Rust Learning Note
///
/// `dispatch()` returns an [`Outcome`], never a `Result`. Every failure
/// (bad JSON, unknown command, missing field, absent name) is folded into an
/// error reply here, so the worker loop has no error path to forget.
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    store: Arc<RegistryStore>,
    publisher: EventPublisher,
}

impl RequestDispatcher {
    pub fn new(store: Arc<RegistryStore>, publisher: EventPublisher) -> Self {
        Self { store, publisher }
    }

    /// Handles one raw frame (without its trailing newline).
    pub fn dispatch(&self, frame: &[u8]) -> Outcome {
        let request = match Request::decode(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Rejected request");
                return Outcome::Reply(Response::from_error(&e));
            }
        };

        let command = request.command();
        let shutdown = matches!(request, Request::Shutdown);

        let response = match self.handle(request) {
            Ok(response) => response,
            Err(e) => {
                debug!(command = %command, error = %e, "Request failed");
                Response::from_error(&e)
            }
        };

        if shutdown {
            Outcome::ReplyThenShutdown(response)
        } else {
            Outcome::Reply(response)
        }
    }

    /// Applies an already-decoded request.
    pub fn handle(&self, request: Request) -> Result<Response> {
        debug!(command = %request.command(), "Handling request");

        match request {
            Request::Register { name, address } => {
                self.store.register(name.as_str(), address.as_str());
                self.publisher.publish(Event::registered(name, address));
                Ok(Response::ok())
            }

            Request::Unregister { name } => {
                if !self.store.unregister(&name) {
                    return Err(Error::not_found(name));
                }
                self.publisher.publish(Event::unregistered(name));
                Ok(Response::ok())
            }

            Request::Lookup { name } => {
                let address = self.store.lookup(&name)?;
                Ok(Response::with_address(address))
            }

            Request::List => Ok(Response::with_items(self.store.list())),

            Request::Ping => Ok(Response::ok()),

            Request::Shutdown => Ok(Response::ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{INVALID_REQUEST, NOT_FOUND, UNKNOWN_COMMAND};
    use std::collections::BTreeMap;
    use tokio::sync::broadcast;

    fn dispatcher() -> (RequestDispatcher, Arc<RegistryStore>, broadcast::Receiver<Event>) {
        let store = Arc::new(RegistryStore::new());
        let publisher = EventPublisher::new(64);
        let rx = publisher.subscribe().unwrap();
        (RequestDispatcher::new(Arc::clone(&store), publisher), store, rx)
    }

    fn reply(dispatcher: &RequestDispatcher, frame: &str) -> Response {
        dispatcher.dispatch(frame.as_bytes()).response().clone()
    }

    #[test]
    fn test_round_trip() {
        let (dispatcher, _, _) = dispatcher();

        let r = reply(&dispatcher, r#"{"cmd":"REGISTER","name":"svc-a","address":"tcp://10.0.0.1:9000"}"#);
        assert_eq!(r, Response::ok());

        let r = reply(&dispatcher, r#"{"cmd":"LOOKUP","name":"svc-a"}"#);
        assert_eq!(r, Response::with_address("tcp://10.0.0.1:9000"));

        let r = reply(&dispatcher, r#"{"cmd":"LIST"}"#);
        let mut expected = BTreeMap::new();
        expected.insert("svc-a".to_string(), "tcp://10.0.0.1:9000".to_string());
        assert_eq!(r, Response::with_items(expected));

        let r = reply(&dispatcher, r#"{"cmd":"UNREGISTER","name":"svc-a"}"#);
        assert_eq!(r, Response::ok());

        let r = reply(&dispatcher, r#"{"cmd":"LOOKUP","name":"svc-a"}"#);
        assert_eq!(r, Response::error(NOT_FOUND));
    }

    #[test]
    fn test_unknown_names_are_not_found() {
        let (dispatcher, _, mut rx) = dispatcher();

        assert_eq!(reply(&dispatcher, r#"{"cmd":"LOOKUP","name":"ghost"}"#), Response::error(NOT_FOUND));
        assert_eq!(reply(&dispatcher, r#"{"cmd":"UNREGISTER","name":"ghost"}"#), Response::error(NOT_FOUND));

        // Failed removal publishes nothing
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mutations_publish_events() {
        let (dispatcher, _, mut rx) = dispatcher();

        reply(&dispatcher, r#"{"cmd":"REGISTER","name":"svc-a","address":"tcp://10.0.0.1:9000"}"#);
        reply(&dispatcher, r#"{"cmd":"LOOKUP","name":"svc-a"}"#);
        reply(&dispatcher, r#"{"cmd":"UNREGISTER","name":"svc-a"}"#);

        assert_eq!(rx.try_recv().unwrap(), Event::registered("svc-a", "tcp://10.0.0.1:9000"));
        assert_eq!(rx.try_recv().unwrap(), Event::unregistered("svc-a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ping_has_no_side_effects() {
        let (dispatcher, store, mut rx) = dispatcher();
        store.register("svc-a", "tcp://10.0.0.1:9000");
        let before = store.list();

        for _ in 0..3 {
            assert_eq!(reply(&dispatcher, r#"{"cmd":"PING"}"#), Response::ok());
        }

        assert_eq!(store.list(), before);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bad_input_yields_error_replies() {
        let (dispatcher, store, _) = dispatcher();

        assert_eq!(reply(&dispatcher, "garbage"), Response::error(UNKNOWN_COMMAND));
        assert_eq!(reply(&dispatcher, r#"{"cmd":"DESTROY"}"#), Response::error(UNKNOWN_COMMAND));
        assert_eq!(
            reply(&dispatcher, r#"{"cmd":"REGISTER","name":"svc-a"}"#),
            Response::error(INVALID_REQUEST)
        );

        // Dispatcher is still usable afterwards
        assert_eq!(reply(&dispatcher, r#"{"cmd":"PING"}"#), Response::ok());
        assert!(store.is_empty());
    }

    #[test]
    fn test_shutdown_replies_ok_and_signals() {
        let (dispatcher, _, _) = dispatcher();

        let outcome = dispatcher.dispatch(br#"{"cmd":"SHUTDOWN"}"#);
        assert!(outcome.is_shutdown());
        assert_eq!(outcome.response(), &Response::ok());

        assert!(!dispatcher.dispatch(br#"{"cmd":"PING"}"#).is_shutdown());
    }

    #[test]
    fn test_register_without_publisher() {
        let store = Arc::new(RegistryStore::new());
        let dispatcher = RequestDispatcher::new(Arc::clone(&store), EventPublisher::disabled());

        let r = dispatcher
            .handle(Request::Register {
                name: "svc-a".to_string(),
                address: "tcp://10.0.0.1:9000".to_string(),
            })
            .unwrap();
        assert!(r.is_ok());
        assert_eq!(store.lookup("svc-a").unwrap(), "tcp://10.0.0.1:9000");
    }
}
