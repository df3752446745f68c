//! Client -> server RPC: running a function on a shared game object
//!
//! Every request passes two gates before anything executes. Structural
//! sanitizing maps the keyed args onto the declared argument list and rejects
//! malformed input by disconnecting. Semantic invalidation (the session-wide
//! gate, then the function's own hook) may reject well-formed input with a
//! reason the client gets to see, or amend the args once.

use crate::client::Client;
use crate::error::DefectError;
use crate::game::{Call, Game, GameFunction, GameNamespace, Invalidation, SharedGame};
use crate::peer::{AiEvent, Peer};
use crate::sanitize::{
    validate_ran_returned, validate_run_args, RunArgs, RunArgsError, SanitizeError,
};
use log::{debug, info};
use shared::{clip, GameObjectId, Packet, PlayerId, Value, MAX_ECHO_LEN};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What validation decided about one run request
enum Verdict<G: Game> {
    Execute {
        type_name: String,
        implementation: Arc<dyn GameFunction<G>>,
        args: RunArgs,
    },
    Invalid(String),
    /// Client was disconnected; nothing else to do
    Dropped,
}

/// Stateless handler for `run` requests
///
/// A run arrives while the client is thinking, so its clock is stopped for
/// as long as the server works on the request and restarted afterwards.
/// Validation and execution happen under one write lock on the shared game:
/// no other session can change the game between the moment a request is
/// judged valid and the moment it runs.
pub struct RunRequestHandler;

impl RunRequestHandler {
    /// Handles a `run` packet with the client's clock paused throughout.
    ///
    /// The clock is restarted only if the client is still connected once the
    /// request is done. A run that got the client evicted leaves it stopped.
    pub async fn requested_run<G: Game, C: Client>(
        peer: &mut Peer<C>,
        namespace: &GameNamespace<G>,
        game: &SharedGame<G>,
        caller: &GameObjectId,
        function: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<Option<Value>, DefectError> {
        peer.pause_ticking();
        let result = Self::try_to_run(peer, namespace, game, caller, function, args).await;
        if !peer.is_disconnected() {
            peer.start_ticking();
        }
        result
    }

    /// Validates and, if allowed, executes one run request.
    ///
    /// `Ok(None)` covers every client mistake: either the client was
    /// disconnected or it was sent an `Invalid` packet. `Err` is reserved for
    /// bugs in the game code.
    ///
    /// The game's write lock is taken once, before validation, and held until
    /// the return value has been checked.
    pub async fn try_to_run<G: Game, C: Client>(
        peer: &mut Peer<C>,
        namespace: &GameNamespace<G>,
        game: &SharedGame<G>,
        caller: &GameObjectId,
        function: &str,
        raw_args: &BTreeMap<String, Value>,
    ) -> Result<Option<Value>, DefectError> {
        let Some(player) = peer.player() else {
            peer.disconnect("Cannot run functions before playing");
            return Ok(None);
        };

        let mut game = game.write().await;
        let verdict = Self::validate(peer, namespace, &*game, &player, caller, function, raw_args)?;

        let (type_name, implementation, args) = match verdict {
            Verdict::Execute {
                type_name,
                implementation,
                args,
            } => (type_name, implementation, args),
            Verdict::Invalid(reason) => {
                info!("{} sent an invalid run of {}: {}", player, function, reason);
                peer.send(Packet::Invalid {
                    message: reason.clone(),
                });
                peer.emit(AiEvent::Ran {
                    player,
                    caller: caller.clone(),
                    function: function.to_string(),
                    args: raw_args.clone(),
                    returned: Value::Null,
                    invalid: Some(reason),
                });
                return Ok(None);
            }
            Verdict::Dropped => return Ok(None),
        };

        let call = Call {
            player: &player,
            object: caller,
            args: &args,
        };
        let returned = implementation.run(&mut *game, &call).await;
        let returned = validate_ran_returned(&namespace.schemas, &*game, &type_name, function, &returned)
            .map_err(|source| DefectError::BadReturn {
                type_name: type_name.clone(),
                function: function.to_string(),
                source,
            })?;
        drop(game);

        debug!("{} ran {} #{}.{} -> {}", player, type_name, caller, function, returned);
        peer.send(Packet::Ran {
            returned: returned.clone(),
        });
        peer.emit(AiEvent::Ran {
            player,
            caller: caller.clone(),
            function: function.to_string(),
            args: raw_args.clone(),
            returned: returned.clone(),
            invalid: None,
        });

        Ok(Some(returned))
    }

    /// Decides what to do with one request, in order:
    ///
    /// 1. The caller must exist, have a declared type, and declare `function`.
    ///    Anything else is a protocol violation and disconnects.
    /// 2. The function must be registered; a declared but unregistered
    ///    function is a [`DefectError::MissingFunction`].
    /// 3. The args are sanitized. Out-of-range values are `Invalid`, any other
    ///    mismatch disconnects.
    /// 4. The game's global gate, then the function's own hook, may reject the
    ///    call or amend its args once.
    fn validate<G: Game, C: Client>(
        peer: &mut Peer<C>,
        namespace: &GameNamespace<G>,
        game: &G,
        player: &PlayerId,
        caller: &GameObjectId,
        function: &str,
        raw_args: &BTreeMap<String, Value>,
    ) -> Result<Verdict<G>, DefectError> {
        let Some(type_name) = game.object_type(caller).map(str::to_string) else {
            peer.disconnect(&format!(
                "No game object with id '{}' exists",
                clip(caller.as_str(), MAX_ECHO_LEN)
            ));
            return Ok(Verdict::Dropped);
        };

        let Some(object_schema) = namespace.schemas.game_object(&type_name) else {
            peer.disconnect(&format!("Game object #{} has undeclared type '{}'", caller, type_name));
            return Ok(Verdict::Dropped);
        };

        if object_schema.function(function).is_none() {
            peer.disconnect(&format!(
                "{} #{} has no function named '{}'",
                type_name,
                caller,
                clip(function, MAX_ECHO_LEN)
            ));
            return Ok(Verdict::Dropped);
        }

        let implementation = namespace.functions.get(&type_name, function).ok_or_else(|| {
            DefectError::MissingFunction {
                type_name: type_name.clone(),
                function: function.to_string(),
            }
        })?;

        let args = match validate_run_args(&namespace.schemas, game, &type_name, caller, function, raw_args) {
            Ok(args) => args,
            Err(RunArgsError::BadArg(SanitizeError::OutOfRange(reason))) => {
                return Ok(Verdict::Invalid(reason));
            }
            Err(err) => {
                peer.disconnect(&err.to_string());
                return Ok(Verdict::Dropped);
            }
        };

        if let Some(reason) = game.invalidate_run(player, caller, function) {
            return Ok(Verdict::Invalid(reason));
        }

        let call = Call {
            player,
            object: caller,
            args: &args,
        };
        let args = match implementation.invalidate(game, &call) {
            Invalidation::Valid => args,
            Invalidation::Reject(reason) => return Ok(Verdict::Invalid(reason)),
            Invalidation::Amend(partial) => {
                let merged = args.merged(&partial);
                validate_run_args(&namespace.schemas, game, &type_name, caller, function, &merged)
                    .map_err(|err| DefectError::AmendedArgs {
                        type_name: type_name.clone(),
                        function: function.to_string(),
                        source: match err {
                            RunArgsError::BadArg(source) => source,
                            other => SanitizeError::Malformed(other.to_string()),
                        },
                    })?
            }
        };

        Ok(Verdict::Execute {
            type_name,
            implementation,
            args,
        })
    }
}
