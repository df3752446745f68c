//! Per-client AI manager tying the order and run pipelines to one client and game

use crate::client::Client;
use crate::error::{DefectError, OrderError};
use crate::game::{Game, GameNamespace, SharedGame};
use crate::orders::{OrderDispatcher, PendingOrder};
use crate::peer::{EventSender, Peer};
use crate::runs::RunRequestHandler;
use log::{debug, warn};
use shared::{GameObjectId, Packet, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// First construction phase: everything but the game handle
pub struct AiManagerBuilder<G: Game, C: Client> {
    client: C,
    namespace: Arc<GameNamespace<G>>,
    events: Option<EventSender>,
}

impl<G: Game, C: Client> AiManagerBuilder<G, C> {
    /// Feeds `Ordered`/`Finished`/`Ran` events to `events`
    pub fn events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Supplies the game and produces a ready manager
    pub fn game(self, game: SharedGame<G>) -> AiManager<G, C> {
        AiManager {
            peer: Peer::new(self.client, self.events),
            namespace: self.namespace,
            game,
            orders: OrderDispatcher::new(),
        }
    }
}

/// Mediates every call crossing the trust boundary for one client.
///
/// Only the session that owns the manager mutates it, so the pending-order
/// table has a single writer.
pub struct AiManager<G: Game, C: Client> {
    peer: Peer<C>,
    namespace: Arc<GameNamespace<G>>,
    game: SharedGame<G>,
    orders: OrderDispatcher,
}

impl<G: Game, C: Client> AiManager<G, C> {
    pub fn builder(client: C, namespace: Arc<GameNamespace<G>>) -> AiManagerBuilder<G, C> {
        AiManagerBuilder {
            client,
            namespace,
            events: None,
        }
    }

    pub fn client(&self) -> &C {
        self.peer.client()
    }

    pub fn game(&self) -> &SharedGame<G> {
        &self.game
    }

    pub fn pending_orders(&self) -> usize {
        self.orders.pending()
    }

    /// Errors collected so far by a pending order
    pub fn order_errors(&self, index: u32) -> Option<u32> {
        self.orders.errors(index)
    }

    pub fn is_disconnected(&self) -> bool {
        self.peer.is_disconnected()
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.peer.disconnect_reason()
    }

    /// Orders the client to run its function `name`.
    ///
    /// The returned future resolves once a valid `finished` reply arrives.
    pub async fn execute_order(&mut self, name: &str, args: &[Value]) -> PendingOrder {
        if let Some(reason) = self.peer.disconnect_reason() {
            return PendingOrder::failed(OrderError::Disconnected(reason.to_string()));
        }

        let pending = {
            let game = self.game.read().await;
            self.orders
                .execute_order(&mut self.peer, &self.namespace.schemas, &*game, name, args)
        };
        self.settle();
        pending
    }

    /// Handles an inbound `finished` reply
    pub async fn finished_order(&mut self, index: u32, returned: Value) {
        if self.ignore_inbound("finished") {
            return;
        }

        {
            let game = self.game.read().await;
            self.orders.finished_order(
                &mut self.peer,
                &self.namespace.schemas,
                &*game,
                index,
                returned,
            );
        }
        self.settle();
    }

    /// Handles an inbound `run` request
    pub async fn requested_run(
        &mut self,
        caller: &GameObjectId,
        function: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Option<Value>, DefectError> {
        if self.ignore_inbound("run") {
            return Ok(None);
        }

        let result = RunRequestHandler::requested_run(
            &mut self.peer,
            &self.namespace,
            &self.game,
            caller,
            function,
            args,
        )
        .await;
        self.settle();
        result
    }

    /// Routes one inbound packet
    pub async fn handle_packet(&mut self, packet: Packet) -> Result<(), DefectError> {
        match packet {
            Packet::Finished {
                order_index,
                returned,
            } => {
                self.finished_order(order_index, returned).await;
            }
            Packet::Run {
                caller,
                function_name,
                args,
            } => {
                self.requested_run(&caller, &function_name, &args).await?;
            }
            Packet::Play { .. } => {
                self.disconnect("Already playing");
            }
            other => {
                self.disconnect(&format!(
                    "Clients may not send '{}' packets",
                    other.event_name()
                ));
            }
        }
        Ok(())
    }

    /// Kicks the client and fails its pending orders
    pub fn disconnect(&mut self, reason: &str) {
        self.peer.disconnect(reason);
        self.settle();
    }

    /// The transport closed under us
    pub fn client_closed(&mut self, reason: &str) {
        self.peer.mark_closed(reason);
        self.settle();
    }

    fn ignore_inbound(&self, kind: &str) -> bool {
        if self.peer.is_disconnected() {
            debug!("Ignoring '{}' from disconnected client", kind);
            return true;
        }
        false
    }

    /// Once disconnected, nobody is left to answer pending orders
    fn settle(&mut self) {
        if let Some(reason) = self.peer.disconnect_reason().map(str::to_string) {
            if !self.orders.is_idle() {
                warn!("Client gone with {} orders pending", self.orders.pending());
            }
            self.orders.reject_all(&mut self.peer, &reason);
        }
    }
}
