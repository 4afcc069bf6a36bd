//! The handler chain executor and the per-family request types handlers
//! observe.
//!
//! A handler is `(request, response) -> (response', stop?)`. The chain
//! threads the returned response into the next invocation and stops
//! iteration immediately on `stop? = true`. A `None` response is the
//! sentinel meaning "drop the exchange" — independent of `stop?`, though
//! the two are conventionally paired.

pub mod prefix;
pub mod range;
pub mod registry;
pub mod server_id;

use std::net::SocketAddr;

use dhcproto::v4;
use dhcproto::v6;

/// Everything a v4 handler needs about the inbound exchange. Handlers
/// never mutate this; they mutate the threaded response.
pub struct Request4 {
    pub message: v4::Message,
    pub peer: SocketAddr,
    /// Network the request arrived on, used by handlers that need to pick
    /// an in-subnet address (not all do).
    pub interface: Option<ipnet::Ipv4Net>,
}

/// Everything a v6 handler needs. `outer` is the as-received message
/// (possibly a relay-forward chain); `inner_type` identifies the
/// already-decapsulated message type the response skeleton was built from.
/// Handlers observe the original outer request alongside the inner-typed
/// response.
pub struct Request6 {
    pub outer: v6::Message,
    pub inner_type: v6::MessageType,
    pub peer: SocketAddr,
    pub interface: Option<ipnet::Ipv6Net>,
}

pub type HandlerV4 =
    Box<dyn Fn(&Request4, Option<v4::Message>) -> (Option<v4::Message>, bool) + Send + Sync>;
pub type HandlerV6 =
    Box<dyn Fn(&Request6, Option<v6::Message>) -> (Option<v6::Message>, bool) + Send + Sync>;

/// Ordered, immutable-after-construction sequence of v4 handlers.
pub struct HandlerChain4 {
    handlers: Vec<HandlerV4>,
}

impl HandlerChain4 {
    pub fn new(handlers: Vec<HandlerV4>) -> Self {
        Self { handlers }
    }

    /// Run every handler against `skeleton` in declared order, stopping
    /// immediately when a handler reports `stop = true`. Returns `None`
    /// (drop) if the final threaded response is `None`.
    pub fn invoke(&self, req: &Request4, skeleton: v4::Message) -> Option<v4::Message> {
        let mut resp = Some(skeleton);
        for handler in &self.handlers {
            let (next, stop) = handler(req, resp);
            resp = next;
            if stop {
                break;
            }
        }
        resp
    }
}

/// Ordered, immutable-after-construction sequence of v6 handlers.
pub struct HandlerChain6 {
    handlers: Vec<HandlerV6>,
}

impl HandlerChain6 {
    pub fn new(handlers: Vec<HandlerV6>) -> Self {
        Self { handlers }
    }

    pub fn invoke(&self, req: &Request6, skeleton: v6::Message) -> Option<v6::Message> {
        let mut resp = Some(skeleton);
        for handler in &self.handlers {
            let (next, stop) = handler(req, resp);
            resp = next;
            if stop {
                break;
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn v4_req() -> Request4 {
        Request4 {
            message: v4::Message::new(
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                &[0, 1, 2, 3, 4, 5],
            ),
            peer: SocketAddr::from(([127, 0, 0, 1], 68)),
            interface: None,
        }
    }

    fn skeleton() -> v4::Message {
        v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[0, 1, 2, 3, 4, 5],
        )
    }

    #[test]
    fn invokes_handlers_in_order_until_exhaustion() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mk = |tag: &'static str, order: Arc<std::sync::Mutex<Vec<&'static str>>>| -> HandlerV4 {
            Box::new(move |_req, resp| {
                order.lock().unwrap().push(tag);
                (resp, false)
            })
        };
        let chain = HandlerChain4::new(vec![
            mk("a", order.clone()),
            mk("b", order.clone()),
            mk("c", order.clone()),
        ]);
        let resp = chain.invoke(&v4_req(), skeleton());
        assert!(resp.is_some());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn stop_flag_short_circuits_remaining_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counting = {
            let calls = calls.clone();
            Box::new(move |_req: &Request4, resp| {
                calls.fetch_add(1, Ordering::SeqCst);
                (resp, false)
            }) as HandlerV4
        };
        let stopping: HandlerV4 = Box::new(|_req, resp| (resp, true));
        let never_called = {
            let calls = calls.clone();
            Box::new(move |_req: &Request4, resp| {
                calls.fetch_add(100, Ordering::SeqCst);
                (resp, false)
            }) as HandlerV4
        };
        let chain = HandlerChain4::new(vec![counting, stopping, never_called]);
        chain.invoke(&v4_req(), skeleton());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_response_signals_drop() {
        let drop_handler: HandlerV4 = Box::new(|_req, _resp| (None, true));
        let chain = HandlerChain4::new(vec![drop_handler]);
        assert!(chain.invoke(&v4_req(), skeleton()).is_none());
    }

    #[test]
    fn null_response_without_stop_still_reaches_later_handlers() {
        // A dropped response doesn't short-circuit the chain by itself.
        let calls = Arc::new(AtomicUsize::new(0));
        let drop_no_stop: HandlerV4 = Box::new(|_req, _resp| (None, false));
        let resurrect = {
            let calls = calls.clone();
            Box::new(move |_req: &Request4, resp: Option<v4::Message>| {
                calls.fetch_add(1, Ordering::SeqCst);
                assert!(resp.is_none());
                (resp, false)
            }) as HandlerV4
        };
        let chain = HandlerChain4::new(vec![drop_no_stop, resurrect]);
        let resp = chain.invoke(&v4_req(), skeleton());
        assert!(resp.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
