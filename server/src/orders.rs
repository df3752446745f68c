//! Server -> client RPC: ordering a client to run one of its own functions
//!
//! Each order gets the next index and waits in the pending table until a
//! `finished` reply with that index arrives. Replies are matched by index only,
//! so clients may answer out of order. Invalid replies resend the same order
//! until it has collected `MAX_ORDER_ERRORS` errors, then the client is evicted.

use crate::client::Client;
use crate::error::OrderError;
use crate::peer::{AiEvent, Peer};
use crate::sanitize::{sanitize_order_args, validate_finished_returned, ObjectLookup};
use crate::schema::SchemaRegistry;
use log::{debug, error, info};
use shared::{Packet, Value, MAX_ORDER_ERRORS};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Responder = oneshot::Sender<Result<Value, OrderError>>;

/// An order awaiting its `finished` reply
///
/// The same `Order` lives through every resend: an invalid reply bumps
/// `errors` and puts it back in the table under its original index, so the
/// caller's future is resolved exactly once no matter how many attempts the
/// client needs.
#[derive(Debug)]
pub struct Order {
    pub index: u32,
    pub name: String,
    pub args: Vec<Value>,
    /// Invalid replies received so far
    pub errors: u32,
    responder: Responder,
}

impl Order {
    fn resolve(self, result: Result<Value, OrderError>) {
        if self.responder.send(result).is_err() {
            debug!("Nobody is waiting on order {} #{}", self.name, self.index);
        }
    }
}

/// Future of an order's sanitized return value
///
/// Resolves to `Ok` with the reply coerced to the declared return type, or to
/// [`OrderError::Disconnected`] once the client is evicted, closes its
/// connection, or the order could not be sent at all. Dropping it is fine:
/// the reply is still validated, just never delivered.
#[derive(Debug)]
pub struct PendingOrder {
    index: Option<u32>,
    receiver: oneshot::Receiver<Result<Value, OrderError>>,
}

impl PendingOrder {
    /// Index the order was sent with; `None` if it was never sent
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub(crate) fn failed(err: OrderError) -> Self {
        let (responder, receiver) = oneshot::channel();
        let _ = responder.send(Err(err));
        Self {
            index: None,
            receiver,
        }
    }
}

impl Future for PendingOrder {
    type Output = Result<Value, OrderError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OrderError::Disconnected(
                "order dropped before it finished".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Pending-order table of one client
///
/// Indices start at 0 and are never reused within a session. The client's
/// clock runs whenever at least one order is outstanding and is paused as
/// soon as the table empties.
#[derive(Debug, Default)]
pub struct OrderDispatcher {
    orders: HashMap<u32, Order>,
    next_index: u32,
}

impl OrderDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.orders.len()
    }

    pub fn is_idle(&self) -> bool {
        self.orders.is_empty()
    }

    /// Errors collected so far by a pending order
    pub fn errors(&self, index: u32) -> Option<u32> {
        self.orders.get(&index).map(|order| order.errors)
    }

    /// Sanitizes `args`, then sends the order and starts the client's clock.
    ///
    /// Args that do not fit the schema are a server bug: the client is
    /// disconnected and the returned future fails right away.
    pub fn execute_order<C: Client>(
        &mut self,
        peer: &mut Peer<C>,
        schemas: &SchemaRegistry,
        lookup: &dyn ObjectLookup,
        name: &str,
        args: &[Value],
    ) -> PendingOrder {
        let args = match sanitize_order_args(schemas, lookup, name, args) {
            Ok(args) => args,
            Err(err) => {
                error!("Game logic built an invalid '{}' order: {}", name, err);
                peer.disconnect(&format!(
                    "Server error: could not send order '{}' - {}",
                    name, err
                ));
                return PendingOrder::failed(err.into());
            }
        };

        let index = self.next_index;
        self.next_index += 1;

        let (responder, receiver) = oneshot::channel();
        self.send_order(
            peer,
            Order {
                index,
                name: name.to_string(),
                args,
                errors: 0,
                responder,
            },
        );

        PendingOrder {
            index: Some(index),
            receiver,
        }
    }

    fn send_order<C: Client>(&mut self, peer: &mut Peer<C>, order: Order) {
        debug!("Ordering {} #{} (errors: {})", order.name, order.index, order.errors);
        let packet = Packet::Order {
            index: order.index,
            name: order.name.clone(),
            args: order.args.clone(),
        };
        let event = AiEvent::Ordered {
            player: peer.player(),
            index: order.index,
            name: order.name.clone(),
            args: order.args.clone(),
        };

        self.orders.insert(order.index, order);
        peer.send(packet);
        peer.emit(event);
        peer.start_ticking();
    }

    /// Handles a `finished` reply
    ///
    /// A reply that fits the order's declared return type resolves the
    /// caller's future. Anything else is answered with an `invalid` packet
    /// and the order goes out again with the same index. The client is
    /// disconnected once one order collects [`MAX_ORDER_ERRORS`] bad replies.
    ///
    /// Replying to an index that is not pending, or before playing, is a
    /// protocol violation and disconnects immediately.
    pub fn finished_order<C: Client>(
        &mut self,
        peer: &mut Peer<C>,
        schemas: &SchemaRegistry,
        lookup: &dyn ObjectLookup,
        index: u32,
        returned: Value,
    ) {
        let Some(player) = peer.player() else {
            peer.disconnect("Cannot finish an order before playing");
            return;
        };

        let Some(mut order) = self.orders.remove(&index) else {
            peer.disconnect(&format!("Finished order #{} which was never sent", index));
            return;
        };

        if self.orders.is_empty() {
            peer.pause_ticking();
        }

        match validate_finished_returned(schemas, lookup, &order.name, &returned) {
            Ok(value) => {
                debug!("Order {} #{} finished with {}", order.name, order.index, value);
                peer.emit(AiEvent::Finished {
                    player,
                    index: order.index,
                    name: order.name.clone(),
                    returned: value.clone(),
                    invalid: None,
                });
                order.resolve(Ok(value));
            }
            Err(err) => {
                let message = format!(
                    "Order '{}' #{} returned {} - {}",
                    order.name,
                    order.index,
                    returned.preview(),
                    err
                );
                info!("{}: {}", player, message);
                peer.send(Packet::Invalid {
                    message: message.clone(),
                });
                peer.emit(AiEvent::Finished {
                    player,
                    index: order.index,
                    name: order.name.clone(),
                    returned,
                    invalid: Some(message),
                });

                order.errors += 1;
                if order.errors >= MAX_ORDER_ERRORS {
                    let reason = format!(
                        "Reached the maximum number of errors ({}) on order '{}' #{}",
                        MAX_ORDER_ERRORS, order.name, order.index
                    );
                    peer.disconnect(&reason);
                    order.resolve(Err(OrderError::Disconnected(reason)));
                } else {
                    self.send_order(peer, order);
                }
            }
        }
    }

    /// Fails every pending order; pauses the clock if any were pending
    pub fn reject_all<C: Client>(&mut self, peer: &mut Peer<C>, reason: &str) {
        if self.orders.is_empty() {
            return;
        }

        info!("Rejecting {} pending orders: {}", self.orders.len(), reason);
        for (_, order) in self.orders.drain() {
            order.resolve(Err(OrderError::Disconnected(reason.to_string())));
        }
        peer.pause_ticking();
    }
}
