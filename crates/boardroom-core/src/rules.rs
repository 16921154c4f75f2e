//! Minimal standard-board rules: dice, movement, jail, purchase, rent,
//! mortgage, building, trades, and forfeiture.
//!
//! Everything here runs against a `GameSession` the caller has already
//! locked and validated (status, turn ownership, player status). Functions
//! return the events the mutation produced, in emission order.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::net::messages::{JailEventKind, ServerMessage};
use crate::player::{Player, PlayerStatus};
use crate::session::{GameSession, GameStatus, PendingPurchase, PropertyState, TradeOffer};

pub const BOARD_SIZE: u8 = 40;
pub const GO_SALARY: i64 = 200;
pub const JAIL_SQUARE: u8 = 10;
pub const GO_TO_JAIL_SQUARE: u8 = 30;
pub const JAIL_SENTENCE: u8 = 3;
pub const JAIL_FINE: i64 = 50;
pub const MAX_HOUSES: u8 = 5;
pub const MAX_DOUBLES: u8 = 3;

/// Player-initiated game actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    RollDice,
    BuyProperty,
    Mortgage {
        position: u8,
    },
    Unmortgage {
        position: u8,
    },
    BuildHouse {
        position: u8,
    },
    EndTurn,
    ProposeTrade {
        to: String,
        #[serde(default)]
        offer_cash: i64,
        #[serde(default)]
        offer_properties: Vec<u8>,
        #[serde(default)]
        request_cash: i64,
        #[serde(default)]
        request_properties: Vec<u8>,
    },
    AcceptTrade {
        trade_id: u64,
    },
    Special {
        name: String,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RollDice => "roll_dice",
            Self::BuyProperty => "buy_property",
            Self::Mortgage { .. } => "mortgage",
            Self::Unmortgage { .. } => "unmortgage",
            Self::BuildHouse { .. } => "build_house",
            Self::EndTurn => "end_turn",
            Self::ProposeTrade { .. } => "propose_trade",
            Self::AcceptTrade { .. } => "accept_trade",
            Self::Special { .. } => "special",
        }
    }
}

/// Source of dice rolls. Injected so tests can script outcomes.
pub trait DiceRoller: Send + Sync {
    fn roll(&self) -> (u8, u8);
}

/// Two fair six-sided dice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDice;

impl DiceRoller for RandomDice {
    fn roll(&self) -> (u8, u8) {
        let mut rng = rand::rng();
        (rng.random_range(1..=6), rng.random_range(1..=6))
    }
}

pub fn is_purchasable(position: u8) -> bool {
    position < BOARD_SIZE
        && !matches!(
            position,
            0 | 2 | 4 | 7 | 10 | 17 | 20 | 22 | 30 | 33 | 36 | 38
        )
}

pub fn property_price(position: u8) -> i64 {
    60 + 10 * i64::from(position)
}

pub fn rent(position: u8, houses: u8) -> i64 {
    property_price(position) / 10 * (1 + 3 * i64::from(houses))
}

pub fn mortgage_value(position: u8) -> i64 {
    property_price(position) / 2
}

pub fn unmortgage_cost(position: u8) -> i64 {
    mortgage_value(position) * 11 / 10
}

pub fn house_cost(position: u8) -> i64 {
    50 * (1 + i64::from(position / 10))
}

fn tax(position: u8) -> Option<i64> {
    match position {
        4 => Some(200),
        38 => Some(100),
        _ => None,
    }
}

/// Whether `kind` may only be performed by the player whose turn it is.
/// Trades and mortgages are turn-independent, as is buying a property the
/// player landed on before the turn moved on.
pub fn requires_turn(session: &GameSession, player_id: &str, kind: &ActionKind) -> bool {
    match kind {
        ActionKind::ProposeTrade { .. }
        | ActionKind::AcceptTrade { .. }
        | ActionKind::Mortgage { .. }
        | ActionKind::Unmortgage { .. } => false,
        ActionKind::BuyProperty => !session
            .board
            .pending_purchase
            .as_ref()
            .is_some_and(|p| p.player_id == player_id),
        _ => true,
    }
}

/// Apply `kind` for `player_id`. The caller has checked status, turn
/// ownership and that the player is ACTIVE.
pub fn apply_action(
    session: &mut GameSession,
    player_id: &str,
    kind: &ActionKind,
    dice: &dyn DiceRoller,
) -> Result<Vec<ServerMessage>, GameError> {
    match kind {
        ActionKind::RollDice => roll_dice(session, player_id, dice),
        ActionKind::BuyProperty => buy_property(session, player_id),
        ActionKind::Mortgage { position } => mortgage(session, player_id, *position),
        ActionKind::Unmortgage { position } => unmortgage(session, player_id, *position),
        ActionKind::BuildHouse { position } => build_house(session, player_id, *position),
        ActionKind::EndTurn => {
            let mut events = Vec::new();
            end_turn(session, &mut events);
            Ok(events)
        },
        ActionKind::ProposeTrade {
            to,
            offer_cash,
            offer_properties,
            request_cash,
            request_properties,
        } => propose_trade(
            session,
            TradeOffer {
                id: 0,
                from: player_id.to_string(),
                to: to.clone(),
                offer_cash: *offer_cash,
                offer_properties: offer_properties.clone(),
                request_cash: *request_cash,
                request_properties: request_properties.clone(),
            },
        ),
        ActionKind::AcceptTrade { trade_id } => accept_trade(session, player_id, *trade_id),
        ActionKind::Special { name } => special(session, player_id, name),
    }
}

fn player_mut<'a>(
    session: &'a mut GameSession,
    player_id: &str,
) -> Result<&'a mut Player, GameError> {
    session
        .player_mut(player_id)
        .ok_or_else(|| GameError::player_not_found(player_id))
}

fn move_by(player: &mut Player, steps: u8) {
    let target = u16::from(player.position) + u16::from(steps);
    if target >= u16::from(BOARD_SIZE) {
        player.balance += GO_SALARY;
    }
    player.position = (target % u16::from(BOARD_SIZE)) as u8;
}

fn send_to_jail(player: &mut Player) {
    player.position = JAIL_SQUARE;
    player.in_jail = true;
    player.jail_turns = JAIL_SENTENCE;
    player.doubles_streak = 0;
}

fn release_from_jail(player: &mut Player) {
    player.in_jail = false;
    player.jail_turns = 0;
}

fn end_turn(session: &mut GameSession, events: &mut Vec<ServerMessage>) {
    let (previous, current) = session.advance_turn();
    if let Some(current) = current {
        events.push(ServerMessage::TurnChanged {
            game_id: session.id.clone(),
            previous,
            current,
        });
    }
}

fn property_event(session: &GameSession, position: u8) -> ServerMessage {
    let prop = session.board.properties.get(&position);
    ServerMessage::PropertyUpdated {
        game_id: session.id.clone(),
        position,
        owner: prop.map(|p| p.owner.clone()),
        mortgaged: prop.is_some_and(|p| p.mortgaged),
        houses: prop.map_or(0, |p| p.houses),
    }
}

enum Landing {
    Stayed,
    Jailed,
    Bankrupt,
}

fn roll_dice(
    session: &mut GameSession,
    player_id: &str,
    dice: &dyn DiceRoller,
) -> Result<Vec<ServerMessage>, GameError> {
    let (d1, d2) = dice.roll();
    let doubles = d1 == d2;
    let total = d1 + d2;
    let game_id = session.id.clone();
    let mut jail_events = Vec::new();

    let player = player_mut(session, player_id)?;
    let mut moved = true;
    let mut keeps_turn = false;

    if player.in_jail {
        if doubles {
            release_from_jail(player);
            jail_events.push(JailEventKind::Released);
        } else {
            player.jail_turns = player.jail_turns.saturating_sub(1);
            if player.jail_turns == 0 {
                release_from_jail(player);
                jail_events.push(JailEventKind::Released);
            } else {
                moved = false;
                jail_events.push(JailEventKind::StillJailed);
            }
        }
        if moved {
            move_by(player, total);
        }
    } else if doubles && player.doubles_streak + 1 >= MAX_DOUBLES {
        send_to_jail(player);
        moved = false;
        jail_events.push(JailEventKind::SentToJail);
    } else {
        if doubles {
            player.doubles_streak += 1;
            keeps_turn = true;
        } else {
            player.doubles_streak = 0;
        }
        move_by(player, total);
    }

    let position = player.position;
    let jail_turns = player.jail_turns;
    let mut events = vec![ServerMessage::DiceRolled {
        game_id: game_id.clone(),
        player_id: player_id.to_string(),
        dice: [d1, d2],
        total,
        doubles,
        position,
    }];
    events.extend(jail_events.into_iter().map(|event| ServerMessage::JailEvent {
        game_id: game_id.clone(),
        player_id: player_id.to_string(),
        event,
        jail_turns,
    }));

    if moved {
        match resolve_landing(session, player_id, &mut events)? {
            Landing::Stayed => {},
            Landing::Jailed => keeps_turn = false,
            // Forfeiture already moved the turn on.
            Landing::Bankrupt => return Ok(events),
        }
    }

    if keeps_turn {
        events.push(ServerMessage::GameTurn {
            game_id,
            player_id: player_id.to_string(),
        });
    } else {
        end_turn(session, &mut events);
    }
    Ok(events)
}

fn resolve_landing(
    session: &mut GameSession,
    player_id: &str,
    events: &mut Vec<ServerMessage>,
) -> Result<Landing, GameError> {
    let position = player_mut(session, player_id)?.position;

    if position == GO_TO_JAIL_SQUARE {
        let player = player_mut(session, player_id)?;
        send_to_jail(player);
        events.push(ServerMessage::JailEvent {
            game_id: session.id.clone(),
            player_id: player_id.to_string(),
            event: JailEventKind::SentToJail,
            jail_turns: JAIL_SENTENCE,
        });
        return Ok(Landing::Jailed);
    }

    if let Some(amount) = tax(position) {
        return charge(session, player_id, amount, None, events);
    }

    if !is_purchasable(position) {
        return Ok(Landing::Stayed);
    }

    match session.board.properties.get(&position) {
        None => {
            session.board.pending_purchase = Some(PendingPurchase {
                player_id: player_id.to_string(),
                position,
            });
            Ok(Landing::Stayed)
        },
        Some(prop) if prop.owner != player_id && !prop.mortgaged => {
            let owner = prop.owner.clone();
            let amount = rent(position, prop.houses);
            charge(session, player_id, amount, Some(&owner), events)
        },
        Some(_) => Ok(Landing::Stayed),
    }
}

/// Move `amount` from the player to `payee` (or the bank). A player who
/// cannot cover it hands over what they have and goes bankrupt.
fn charge(
    session: &mut GameSession,
    player_id: &str,
    amount: i64,
    payee: Option<&str>,
    events: &mut Vec<ServerMessage>,
) -> Result<Landing, GameError> {
    let player = player_mut(session, player_id)?;
    let paid = amount.min(player.balance.max(0));
    player.balance -= paid;
    let bankrupt = paid < amount;
    if bankrupt {
        player.bankrupt = true;
    }
    if let Some(owner) = payee.and_then(|id| session.player_mut(id)) {
        owner.balance += paid;
    }
    if bankrupt {
        events.extend(forfeit_player(session, player_id));
        return Ok(Landing::Bankrupt);
    }
    Ok(Landing::Stayed)
}

/// Knock a player out: FORFEITED, properties back to the bank, host and
/// turn moved on if they were theirs, and the game completed if one player
/// remains.
pub fn forfeit_player(session: &mut GameSession, player_id: &str) -> Vec<ServerMessage> {
    let mut events = Vec::new();
    let Some(player) = session.player_mut(player_id) else {
        return events;
    };
    if player.is_forfeited() {
        return events;
    }
    player.status = PlayerStatus::Forfeited;

    let was_current = session.current_turn.as_deref() == Some(player_id);
    for position in session.board.release_player(player_id) {
        events.push(property_event(session, position));
    }
    events.extend(reelect_host(session, player_id));
    session.refresh_turn_order();

    if let Some(over) = complete_if_decided(session) {
        events.push(over);
        return events;
    }

    if was_current
        && session.status == GameStatus::Active
        && let Some(current) = session.current_turn.clone()
    {
        events.push(ServerMessage::TurnChanged {
            game_id: session.id.clone(),
            previous: Some(player_id.to_string()),
            current,
        });
    }
    events
}

/// Hand the host role to the first present seat if `departing` holds it.
/// The role stays put when nobody present is left to take it.
fn reelect_host(session: &mut GameSession, departing: &str) -> Option<ServerMessage> {
    if session.host_id != departing {
        return None;
    }
    let next = session
        .seats
        .iter()
        .filter(|id| id.as_str() != departing)
        .find(|id| session.player(id.as_str()).is_some_and(|p| p.status.is_present()))?
        .clone();
    session.host_id = next.clone();
    Some(ServerMessage::HostChanged {
        game_id: session.id.clone(),
        previous_host: departing.to_string(),
        new_host: next,
    })
}

/// Transition an in-progress game to COMPLETED once at most one
/// non-forfeited player remains.
pub fn complete_if_decided(session: &mut GameSession) -> Option<ServerMessage> {
    if !session.status.is_in_progress() {
        return None;
    }
    let remaining = session.remaining_players();
    if remaining.len() > 1 {
        return None;
    }
    session.status = GameStatus::Completed;
    session.current_turn = None;
    session.board.pending_purchase = None;
    Some(ServerMessage::GameOver {
        game_id: session.id.clone(),
        winner: remaining.into_iter().next(),
    })
}

fn buy_property(
    session: &mut GameSession,
    player_id: &str,
) -> Result<Vec<ServerMessage>, GameError> {
    let position = match &session.board.pending_purchase {
        Some(p) if p.player_id == player_id => p.position,
        _ => return Err(GameError::conflict("no pending purchase")),
    };
    if session.board.properties.contains_key(&position) {
        session.board.pending_purchase = None;
        return Err(GameError::conflict("property already owned"));
    }
    let price = property_price(position);
    let player = player_mut(session, player_id)?;
    if player.balance < price {
        return Err(GameError::conflict("insufficient funds"));
    }
    player.balance -= price;
    session.board.pending_purchase = None;
    session.board.properties.insert(
        position,
        PropertyState {
            owner: player_id.to_string(),
            mortgaged: false,
            houses: 0,
        },
    );
    Ok(vec![property_event(session, position)])
}

fn owned_property<'a>(
    session: &'a mut GameSession,
    player_id: &str,
    position: u8,
) -> Result<&'a mut PropertyState, GameError> {
    if !is_purchasable(position) {
        return Err(GameError::Validation(format!("square {position} is not a property")));
    }
    match session.board.properties.get_mut(&position) {
        Some(p) if p.owner == player_id => Ok(p),
        _ => Err(GameError::conflict("you do not own that property")),
    }
}

fn mortgage(
    session: &mut GameSession,
    player_id: &str,
    position: u8,
) -> Result<Vec<ServerMessage>, GameError> {
    let prop = owned_property(session, player_id, position)?;
    if prop.mortgaged {
        return Err(GameError::conflict("property already mortgaged"));
    }
    if prop.houses > 0 {
        return Err(GameError::conflict("sell houses before mortgaging"));
    }
    prop.mortgaged = true;
    player_mut(session, player_id)?.balance += mortgage_value(position);
    Ok(vec![property_event(session, position)])
}

fn unmortgage(
    session: &mut GameSession,
    player_id: &str,
    position: u8,
) -> Result<Vec<ServerMessage>, GameError> {
    let cost = unmortgage_cost(position);
    let balance = player_mut(session, player_id)?.balance;
    let prop = owned_property(session, player_id, position)?;
    if !prop.mortgaged {
        return Err(GameError::conflict("property is not mortgaged"));
    }
    if balance < cost {
        return Err(GameError::conflict("insufficient funds"));
    }
    prop.mortgaged = false;
    player_mut(session, player_id)?.balance -= cost;
    Ok(vec![property_event(session, position)])
}

fn build_house(
    session: &mut GameSession,
    player_id: &str,
    position: u8,
) -> Result<Vec<ServerMessage>, GameError> {
    let cost = house_cost(position);
    let balance = player_mut(session, player_id)?.balance;
    let prop = owned_property(session, player_id, position)?;
    if prop.mortgaged {
        return Err(GameError::conflict("cannot build on a mortgaged property"));
    }
    if prop.houses >= MAX_HOUSES {
        return Err(GameError::conflict("property is fully built"));
    }
    if balance < cost {
        return Err(GameError::conflict("insufficient funds"));
    }
    prop.houses += 1;
    player_mut(session, player_id)?.balance -= cost;
    Ok(vec![property_event(session, position)])
}

fn owns_all(session: &GameSession, player_id: &str, positions: &[u8]) -> bool {
    positions.iter().all(|pos| {
        session
            .board
            .properties
            .get(pos)
            .is_some_and(|p| p.owner == player_id && p.houses == 0)
    })
}

fn validate_trade(session: &GameSession, trade: &TradeOffer) -> Result<(), GameError> {
    if trade.offer_cash < 0 || trade.request_cash < 0 {
        return Err(GameError::Validation("trade cash must not be negative".into()));
    }
    let from = session
        .player(&trade.from)
        .ok_or_else(|| GameError::player_not_found(&trade.from))?;
    let to = session
        .player(&trade.to)
        .ok_or_else(|| GameError::player_not_found(&trade.to))?;
    if to.is_forfeited() || from.is_forfeited() {
        return Err(GameError::conflict("trade partner is out of the game"));
    }
    if from.balance < trade.offer_cash || to.balance < trade.request_cash {
        return Err(GameError::conflict("insufficient funds for trade"));
    }
    if !owns_all(session, &trade.from, &trade.offer_properties)
        || !owns_all(session, &trade.to, &trade.request_properties)
    {
        return Err(GameError::conflict("trade references unowned or built properties"));
    }
    Ok(())
}

fn propose_trade(
    session: &mut GameSession,
    mut trade: TradeOffer,
) -> Result<Vec<ServerMessage>, GameError> {
    if trade.from == trade.to {
        return Err(GameError::Validation("cannot trade with yourself".into()));
    }
    validate_trade(session, &trade)?;
    session.board.next_trade_id += 1;
    trade.id = session.board.next_trade_id;
    session.board.trades.push(trade.clone());
    Ok(vec![ServerMessage::TradeProposed {
        game_id: session.id.clone(),
        trade,
    }])
}

fn accept_trade(
    session: &mut GameSession,
    player_id: &str,
    trade_id: u64,
) -> Result<Vec<ServerMessage>, GameError> {
    let idx = session
        .board
        .trades
        .iter()
        .position(|t| t.id == trade_id && t.to == player_id)
        .ok_or_else(|| GameError::NotFound(format!("trade {trade_id}")))?;
    let trade = session.board.trades[idx].clone();
    // Balances or ownership may have changed since the proposal.
    validate_trade(session, &trade)?;
    session.board.trades.remove(idx);

    player_mut(session, &trade.from)?.balance += trade.request_cash - trade.offer_cash;
    player_mut(session, &trade.to)?.balance += trade.offer_cash - trade.request_cash;

    let mut events = Vec::new();
    let moves = trade
        .offer_properties
        .iter()
        .map(|pos| (*pos, &trade.to))
        .chain(trade.request_properties.iter().map(|pos| (*pos, &trade.from)));
    for (position, new_owner) in moves {
        if let Some(prop) = session.board.properties.get_mut(&position) {
            prop.owner = new_owner.clone();
        }
        events.push(property_event(session, position));
    }
    Ok(events)
}

fn special(
    session: &mut GameSession,
    player_id: &str,
    name: &str,
) -> Result<Vec<ServerMessage>, GameError> {
    match name {
        "pay_jail_fine" => {
            let player = player_mut(session, player_id)?;
            if !player.in_jail {
                return Err(GameError::conflict("player is not in jail"));
            }
            if player.balance < JAIL_FINE {
                return Err(GameError::conflict("insufficient funds"));
            }
            player.balance -= JAIL_FINE;
            release_from_jail(player);
            Ok(vec![ServerMessage::JailEvent {
                game_id: session.id.clone(),
                player_id: player_id.to_string(),
                event: JailEventKind::Released,
                jail_turns: 0,
            }])
        },
        other => Err(GameError::Validation(format!("unknown special action `{other}`"))),
    }
}
