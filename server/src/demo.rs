//! Two-player skirmish on a row of ten tiles.
//!
//! Each player owns a few units. On its turn a player may move each unit one
//! tile or attack an enemy on an adjacent tile; a player with no units left
//! loses. The rules stay deliberately small: the game exists to give the AI
//! protocol something real to drive.

use crate::game::{Call, FunctionTable, Game, GameFunction, GameNamespace, Invalidation};
use crate::sanitize::ObjectLookup;
use crate::schema::{ArgDescriptor, FunctionSchema, SchemaRegistry, TypeDescriptor};
use async_trait::async_trait;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{GameObjectId, PlayerId, Value};
use std::collections::HashMap;

pub const GAME_NAME: &str = "Skirmish";
pub const WIDTH: usize = 10;
pub const UNITS_PER_PLAYER: usize = 2;
pub const UNIT_HP: i64 = 3;
pub const MAX_DAMAGE: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub id: GameObjectId,
    pub owner: PlayerId,
    pub x: usize,
    pub hp: i64,
    pub acted: bool,
}

#[derive(Debug, Clone)]
pub struct Skirmish {
    types: HashMap<GameObjectId, &'static str>,
    players: Vec<PlayerId>,
    tiles: Vec<GameObjectId>,
    units: HashMap<GameObjectId, Unit>,
    current: usize,
    pub turn: u32,
    /// Messages players sent through `Player.log`
    pub log: Vec<(PlayerId, String)>,
    next_id: u64,
}

impl Skirmish {
    /// Two players and an empty row of tiles
    pub fn new() -> Self {
        let mut game = Self {
            types: HashMap::new(),
            players: Vec::new(),
            tiles: Vec::new(),
            units: HashMap::new(),
            current: 0,
            turn: 0,
            log: Vec::new(),
            next_id: 0,
        };

        for _ in 0..2 {
            let id = game.allocate("Player");
            game.players.push(PlayerId(id));
        }
        for _ in 0..WIDTH {
            let id = game.allocate("Tile");
            game.tiles.push(id);
        }
        game
    }

    /// Places `UNITS_PER_PLAYER` units per player on their own half
    pub fn with_random_units(seed: u64) -> Self {
        let mut game = Self::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let half = WIDTH / 2;

        for owner in 0..game.players.len() {
            for offset in rand::seq::index::sample(&mut rng, half, UNITS_PER_PLAYER) {
                game.spawn_unit(owner, owner * half + offset);
            }
        }
        game
    }

    fn allocate(&mut self, type_name: &'static str) -> GameObjectId {
        let id = GameObjectId::new(self.next_id.to_string());
        self.next_id += 1;
        self.types.insert(id.clone(), type_name);
        id
    }

    pub fn spawn_unit(&mut self, owner: usize, x: usize) -> GameObjectId {
        let id = self.allocate("Unit");
        let unit = Unit {
            id: id.clone(),
            owner: self.players[owner].clone(),
            x,
            hp: UNIT_HP,
            acted: false,
        };
        debug!("Spawned unit #{} for {} at x={}", id, unit.owner, x);
        self.units.insert(id.clone(), unit);
        id
    }

    pub fn player(&self, index: usize) -> Option<&PlayerId> {
        self.players.get(index)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_player(&self) -> &PlayerId {
        &self.players[self.current]
    }

    pub fn tile(&self, x: usize) -> Option<&GameObjectId> {
        self.tiles.get(x)
    }

    pub fn tile_x(&self, tile: &GameObjectId) -> Option<usize> {
        self.tiles.iter().position(|id| id == tile)
    }

    pub fn unit(&self, id: &GameObjectId) -> Option<&Unit> {
        self.units.get(id)
    }

    pub fn unit_at(&self, x: usize) -> Option<&Unit> {
        self.units.values().find(|unit| unit.x == x)
    }

    pub fn units_of(&self, player: &PlayerId) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self.units.values().filter(|u| &u.owner == player).collect();
        units.sort_by_key(|u| u.x);
        units
    }

    pub fn end_turn(&mut self) {
        for unit in self.units.values_mut() {
            unit.acted = false;
        }
        self.current = (self.current + 1) % self.players.len();
        self.turn += 1;
        info!("Turn {}: {} to act", self.turn, self.current_player());
    }

    /// The only player with units left, once the other has none
    pub fn winner(&self) -> Option<&PlayerId> {
        let alive: Vec<&PlayerId> = self
            .players
            .iter()
            .filter(|p| self.units.values().any(|u| &u.owner == *p))
            .collect();
        match alive.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    fn check_unit(&self, call: &Call<'_>) -> Result<&Unit, String> {
        let unit = self
            .units
            .get(call.object)
            .ok_or_else(|| format!("Unit #{} is gone", call.object))?;
        if &unit.owner != call.player {
            return Err(format!("Unit #{} is not yours", unit.id));
        }
        if unit.acted {
            return Err(format!("Unit #{} already acted this turn", unit.id));
        }
        Ok(unit)
    }

    fn target_x(&self, call: &Call<'_>) -> Option<usize> {
        call.args
            .get("tile")
            .and_then(Value::as_game_object)
            .and_then(|tile| self.tile_x(tile))
    }
}

impl Default for Skirmish {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectLookup for Skirmish {
    fn object_type(&self, id: &GameObjectId) -> Option<&str> {
        self.types.get(id).copied()
    }
}

impl Game for Skirmish {
    fn invalidate_run(&self, player: &PlayerId, _object: &GameObjectId, function: &str) -> Option<String> {
        if function != "log" && player != self.current_player() {
            return Some("It is not your turn".to_string());
        }
        None
    }
}

struct Move;

#[async_trait]
impl GameFunction<Skirmish> for Move {
    fn invalidate(&self, game: &Skirmish, call: &Call<'_>) -> Invalidation {
        let unit = match game.check_unit(call) {
            Ok(unit) => unit,
            Err(reason) => return Invalidation::Reject(reason),
        };
        let Some(x) = game.target_x(call) else {
            return Invalidation::Reject("not a tile on the board".to_string());
        };
        if x.abs_diff(unit.x) != 1 {
            return Invalidation::Reject("not adjacent".to_string());
        }
        if game.unit_at(x).is_some() {
            return Invalidation::Reject("tile is occupied".to_string());
        }
        Invalidation::Valid
    }

    async fn run(&self, game: &mut Skirmish, call: &Call<'_>) -> Value {
        let Some(x) = game.target_x(call) else {
            return Value::Bool(false);
        };
        match game.units.get_mut(call.object) {
            Some(unit) => {
                unit.x = x;
                unit.acted = true;
                Value::Bool(true)
            }
            None => Value::Bool(false),
        }
    }
}

struct Attack;

#[async_trait]
impl GameFunction<Skirmish> for Attack {
    fn invalidate(&self, game: &Skirmish, call: &Call<'_>) -> Invalidation {
        let unit = match game.check_unit(call) {
            Ok(unit) => unit,
            Err(reason) => return Invalidation::Reject(reason),
        };
        let Some(x) = game.target_x(call) else {
            return Invalidation::Reject("not a tile on the board".to_string());
        };
        if x.abs_diff(unit.x) != 1 {
            return Invalidation::Reject("not adjacent".to_string());
        }
        match game.unit_at(x) {
            None => Invalidation::Reject("nothing to attack there".to_string()),
            Some(target) if target.owner == unit.owner => {
                Invalidation::Reject("cannot attack your own unit".to_string())
            }
            Some(target) => {
                // Overkill is clamped to what the target has left
                let damage = call.args.get("damage").and_then(Value::as_i64).unwrap_or(1);
                if damage > target.hp {
                    let mut amend = std::collections::BTreeMap::new();
                    amend.insert("damage".to_string(), Value::Int(target.hp));
                    return Invalidation::Amend(amend);
                }
                Invalidation::Valid
            }
        }
    }

    async fn run(&self, game: &mut Skirmish, call: &Call<'_>) -> Value {
        let damage = call.args.get("damage").and_then(Value::as_i64).unwrap_or(1);
        let Some(x) = game.target_x(call) else {
            return Value::Int(0);
        };
        let Some(target) = game.unit_at(x).map(|u| u.id.clone()) else {
            return Value::Int(0);
        };

        if let Some(unit) = game.units.get_mut(call.object) {
            unit.acted = true;
        }

        let remaining = match game.units.get_mut(&target) {
            Some(unit) => {
                unit.hp -= damage;
                unit.hp
            }
            None => 0,
        };
        if remaining <= 0 {
            info!("Unit #{} destroyed by #{}", target, call.object);
            game.units.remove(&target);
            game.types.remove(&target);
        }
        Value::Int(remaining.max(0))
    }
}

struct Log;

#[async_trait]
impl GameFunction<Skirmish> for Log {
    fn invalidate(&self, _game: &Skirmish, call: &Call<'_>) -> Invalidation {
        if call.object != call.player.object_id() {
            return Invalidation::Reject("players may only log as themselves".to_string());
        }
        Invalidation::Valid
    }

    async fn run(&self, game: &mut Skirmish, call: &Call<'_>) -> Value {
        let message = call
            .args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        game.log.push((call.player.clone(), message));
        Value::Null
    }
}

pub fn schemas() -> SchemaRegistry {
    SchemaRegistry::new()
        .with_order("runTurn", FunctionSchema::new(TypeDescriptor::Boolean))
        .with_type("Tile")
        .with_function(
            "Unit",
            "move",
            FunctionSchema::new(TypeDescriptor::Boolean)
                .arg(ArgDescriptor::new("tile", TypeDescriptor::game_object("Tile"))),
        )
        .with_function(
            "Unit",
            "attack",
            FunctionSchema::new(TypeDescriptor::Int)
                .arg(ArgDescriptor::new("tile", TypeDescriptor::game_object("Tile")))
                .arg(
                    ArgDescriptor::new("damage", TypeDescriptor::Int)
                        .with_default(1)
                        .with_range(1.0, MAX_DAMAGE as f64),
                ),
        )
        .with_function(
            "Player",
            "log",
            FunctionSchema::new(TypeDescriptor::Void)
                .arg(ArgDescriptor::new("message", TypeDescriptor::String)),
        )
}

pub fn namespace() -> GameNamespace<Skirmish> {
    let functions = FunctionTable::new()
        .register("Unit", "move", Move)
        .register("Unit", "attack", Attack)
        .register("Player", "log", Log);
    GameNamespace::new(GAME_NAME, schemas(), functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::RunArgs;

    fn call_args(tile: &GameObjectId) -> RunArgs {
        vec![
            ("tile".to_string(), Value::GameObject(tile.clone())),
            ("damage".to_string(), Value::Int(1)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_board_layout() {
        let game = Skirmish::new();
        assert_eq!(game.object_type(&GameObjectId::new("0")), Some("Player"));
        assert_eq!(game.object_type(&GameObjectId::new("2")), Some("Tile"));
        assert_eq!(game.tile_x(game.tile(4).unwrap()), Some(4));
        assert_eq!(game.current_player(), &PlayerId::new("0"));
    }

    #[test]
    fn test_random_units_stay_on_own_half() {
        let game = Skirmish::with_random_units(7);
        let p0 = game.units_of(game.player(0).unwrap());
        let p1 = game.units_of(game.player(1).unwrap());

        assert_eq!(p0.len(), UNITS_PER_PLAYER);
        assert_eq!(p1.len(), UNITS_PER_PLAYER);
        assert!(p0.iter().all(|u| u.x < WIDTH / 2));
        assert!(p1.iter().all(|u| u.x >= WIDTH / 2));
    }

    #[test]
    fn test_same_seed_same_board() {
        let a = Skirmish::with_random_units(42);
        let b = Skirmish::with_random_units(42);
        let xs = |g: &Skirmish| {
            let mut xs: Vec<usize> = g.units.values().map(|u| u.x).collect();
            xs.sort();
            xs
        };
        assert_eq!(xs(&a), xs(&b));
    }

    #[test]
    fn test_turn_gate() {
        let mut game = Skirmish::new();
        let unit = game.spawn_unit(1, 6);
        let p1 = game.player(1).unwrap().clone();

        assert_eq!(
            game.invalidate_run(&p1, &unit, "move"),
            Some("It is not your turn".to_string())
        );
        assert_eq!(game.invalidate_run(&p1, p1.object_id(), "log"), None);

        game.end_turn();
        assert_eq!(game.invalidate_run(&p1, &unit, "move"), None);
    }

    #[test]
    fn test_attack_hooks() {
        let mut game = Skirmish::new();
        let mine = game.spawn_unit(0, 4);
        let _enemy = game.spawn_unit(1, 5);
        let _friend = game.spawn_unit(0, 3);
        let p0 = game.player(0).unwrap().clone();

        let check = |x: usize| {
            let args = call_args(game.tile(x).unwrap());
            let call = Call {
                player: &p0,
                object: &mine,
                args: &args,
            };
            Attack.invalidate(&game, &call)
        };

        assert_eq!(check(5), Invalidation::Valid);
        assert_eq!(check(3), Invalidation::Reject("cannot attack your own unit".to_string()));
        assert_eq!(check(7), Invalidation::Reject("not adjacent".to_string()));
    }

    #[tokio::test]
    async fn test_attack_destroys_unit() {
        let mut game = Skirmish::new();
        let mine = game.spawn_unit(0, 4);
        let enemy = game.spawn_unit(1, 5);
        let p0 = game.player(0).unwrap().clone();
        let tile = game.tile(5).unwrap().clone();
        let args: RunArgs = vec![
            ("tile".to_string(), Value::GameObject(tile)),
            ("damage".to_string(), Value::Int(UNIT_HP)),
        ]
        .into_iter()
        .collect();
        let call = Call {
            player: &p0,
            object: &mine,
            args: &args,
        };

        assert_eq!(Attack.run(&mut game, &call).await, Value::Int(0));
        assert!(game.unit(&enemy).is_none());
        assert_eq!(game.object_type(&enemy), None);
        assert!(game.unit(&mine).unwrap().acted);
        assert_eq!(game.winner(), Some(&p0));
    }

    #[test]
    fn test_namespace_is_complete() {
        assert!(namespace().missing_functions().is_empty());
    }
}
