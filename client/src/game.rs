//! Tic-tac-toe sessions played over TICTACTOE_* messages
//!
//! Both peers run the same rules on their own copy of the board. A move is
//! only applied when it is the next turn, uses the symbol owed for that turn
//! and comes from the player holding that symbol, so a stale, replayed or
//! forged move can never change a session.

use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cell index triples that win the game
pub const WINNING_LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    X,
    O,
}

impl Symbol {
    /// Symbol that plays on the given 1-based turn
    pub fn for_turn(turn: u32) -> Self {
        if turn % 2 == 1 {
            Symbol::X
        } else {
            Symbol::O
        }
    }

    pub fn opponent(&self) -> Self {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::X => f.write_str("X"),
            Symbol::O => f.write_str("O"),
        }
    }
}

impl FromStr for Symbol {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "X" | "x" => Ok(Symbol::X),
            "O" | "o" => Ok(Symbol::O),
            other => Err(GameError::InvalidSymbol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Invited,
    Active,
    Complete,
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameStatus::Invited => f.write_str("INVITED"),
            GameStatus::Active => f.write_str("ACTIVE"),
            GameStatus::Complete => f.write_str("COMPLETE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameOutcome {
    Win { symbol: Symbol, line: [usize; 3] },
    Draw,
}

impl GameOutcome {
    pub fn result_tag(&self) -> &'static str {
        match self {
            GameOutcome::Win { .. } => "WIN",
            GameOutcome::Draw => "DRAW",
        }
    }

    pub fn line_field(&self) -> String {
        match self {
            GameOutcome::Win { line, .. } => format!("{},{},{}", line[0], line[1], line[2]),
            GameOutcome::Draw => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("unknown game {0}")]
    UnknownGame(String),
    #[error("game is {0}, not ACTIVE")]
    NotActive(GameStatus),
    #[error("position {0} is off the board")]
    OutOfBounds(usize),
    #[error("position {0} is already taken")]
    Occupied(usize),
    #[error("expected turn {expected}, got {got}")]
    OutOfTurn { expected: u32, got: u32 },
    #[error("turn {turn} belongs to {expected}, not {got}")]
    WrongSymbol { turn: u32, expected: Symbol, got: Symbol },
    #[error("{0} does not hold that symbol in this game")]
    NotYourSymbol(String),
    #[error("{0} is not a player in this game")]
    NotParticipant(String),
    #[error("invalid symbol {0:?}")]
    InvalidSymbol(String),
    #[error("move for turn {0} was already applied")]
    AlreadyApplied(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub turn: u32,
    pub position: usize,
    pub symbol: Symbol,
    pub player: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSession {
    pub game_id: String,
    pub player_x: String,
    pub player_o: String,
    board: [Option<Symbol>; 9],
    turn: u32,
    moves: Vec<Move>,
    status: GameStatus,
    outcome: Option<GameOutcome>,
}

impl GameSession {
    pub fn new(game_id: &str, player_x: &str, player_o: &str) -> Self {
        Self {
            game_id: game_id.to_string(),
            player_x: player_x.to_string(),
            player_o: player_o.to_string(),
            board: [None; 9],
            turn: 0,
            moves: Vec::new(),
            status: GameStatus::Invited,
            outcome: None,
        }
    }

    pub fn activate(&mut self) {
        if self.status == GameStatus::Invited {
            self.status = GameStatus::Active;
        }
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn outcome(&self) -> Option<GameOutcome> {
        self.outcome
    }

    /// Number of moves applied so far
    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn board(&self) -> &[Option<Symbol>; 9] {
        &self.board
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn player_for(&self, symbol: Symbol) -> &str {
        match symbol {
            Symbol::X => &self.player_x,
            Symbol::O => &self.player_o,
        }
    }

    pub fn symbol_of(&self, player: &str) -> Option<Symbol> {
        if player == self.player_x {
            Some(Symbol::X)
        } else if player == self.player_o {
            Some(Symbol::O)
        } else {
            None
        }
    }

    pub fn opponent_of(&self, player: &str) -> Option<&str> {
        self.symbol_of(player)
            .map(|symbol| self.player_for(symbol.opponent()))
    }

    /// Validates and applies a move; the session is untouched on error
    ///
    /// A retransmitted copy of a move already on the board yields
    /// [`GameError::AlreadyApplied`], even once the game is complete.
    pub fn apply_move(
        &mut self,
        player: &str,
        symbol: Symbol,
        position: usize,
        turn: u32,
    ) -> Result<Option<GameOutcome>, GameError> {
        let repeated = turn
            .checked_sub(1)
            .and_then(|i| self.moves.get(i as usize))
            .map_or(false, |m| m.player == player && m.symbol == symbol && m.position == position);
        if repeated {
            return Err(GameError::AlreadyApplied(turn));
        }
        if self.status != GameStatus::Active {
            return Err(GameError::NotActive(self.status));
        }
        if position >= self.board.len() {
            return Err(GameError::OutOfBounds(position));
        }
        let expected_turn = self.turn + 1;
        if turn != expected_turn {
            return Err(GameError::OutOfTurn {
                expected: expected_turn,
                got: turn,
            });
        }
        let owed = Symbol::for_turn(turn);
        if symbol != owed {
            return Err(GameError::WrongSymbol {
                turn,
                expected: owed,
                got: symbol,
            });
        }
        if self.player_for(symbol) != player {
            return Err(GameError::NotYourSymbol(player.to_string()));
        }
        if self.board[position].is_some() {
            return Err(GameError::Occupied(position));
        }

        self.board[position] = Some(symbol);
        self.turn = turn;
        self.moves.push(Move {
            turn,
            position,
            symbol,
            player: player.to_string(),
        });

        let outcome = self.evaluate(symbol);
        if let Some(outcome) = outcome {
            self.status = GameStatus::Complete;
            self.outcome = Some(outcome);
            info!("Game {} finished: {:?}", self.game_id, outcome);
        }
        Ok(outcome)
    }

    /// Takes back the latest move if it is `turn`; false otherwise
    pub fn undo(&mut self, turn: u32) -> bool {
        if turn == 0 || self.turn != turn {
            return false;
        }
        let Some(last) = self.moves.pop() else {
            return false;
        };
        self.board[last.position] = None;
        self.turn = turn - 1;
        self.status = GameStatus::Active;
        self.outcome = None;
        debug!("Game {}: turn {} taken back", self.game_id, turn);
        true
    }

    fn evaluate(&self, last: Symbol) -> Option<GameOutcome> {
        for line in WINNING_LINES {
            if line.iter().all(|&cell| self.board[cell] == Some(last)) {
                return Some(GameOutcome::Win { symbol: last, line });
            }
        }
        if self.board.iter().all(Option::is_some) {
            return Some(GameOutcome::Draw);
        }
        None
    }

    /// Three-row text rendering, empty cells shown by index
    pub fn render(&self) -> String {
        let cell = |i: usize| match self.board[i] {
            Some(symbol) => symbol.to_string(),
            None => i.to_string(),
        };
        (0..3)
            .map(|row| format!(" {} | {} | {} ", cell(row * 3), cell(row * 3 + 1), cell(row * 3 + 2)))
            .collect::<Vec<_>>()
            .join("\n---+---+---\n")
    }
}

/// All sessions this node takes part in
#[derive(Debug, Default)]
pub struct GameTable {
    sessions: HashMap<String, GameSession>,
}

impl GameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the inviter's session in INVITED
    pub fn create(&mut self, game_id: &str, player_x: &str, player_o: &str) -> &GameSession {
        self.sessions
            .entry(game_id.to_string())
            .or_insert_with(|| GameSession::new(game_id, player_x, player_o))
    }

    /// Records an inbound invite as an ACTIVE session; false when already known
    pub fn accept_invite(&mut self, game_id: &str, player_x: &str, player_o: &str) -> bool {
        if self.sessions.contains_key(game_id) {
            debug!("Repeated invite for game {}", game_id);
            return false;
        }
        let mut session = GameSession::new(game_id, player_x, player_o);
        session.activate();
        info!("Game {} started: X={} O={}", game_id, player_x, player_o);
        self.sessions.insert(game_id.to_string(), session);
        true
    }

    pub fn activate(&mut self, game_id: &str) -> Result<(), GameError> {
        self.get_mut(game_id)?.activate();
        Ok(())
    }

    /// Applies a move received from the opponent
    ///
    /// Our own sessions start INVITED; a valid move from the invitee is the
    /// first sign that the invite arrived, so it activates the session.
    pub fn apply_move(
        &mut self,
        game_id: &str,
        player: &str,
        symbol: Symbol,
        position: usize,
        turn: u32,
    ) -> Result<Option<GameOutcome>, GameError> {
        let session = self.get_mut(game_id)?;
        if session.status() != GameStatus::Invited {
            return session.apply_move(player, symbol, position, turn);
        }

        let mut accepted = session.clone();
        accepted.activate();
        let outcome = accepted.apply_move(player, symbol, position, turn)?;
        info!("Game {} accepted by {}", game_id, player);
        *session = accepted;
        Ok(outcome)
    }

    /// Applies the local player's next move, deriving symbol and turn
    pub fn play(
        &mut self,
        game_id: &str,
        player: &str,
        position: usize,
    ) -> Result<(Move, Option<GameOutcome>), GameError> {
        let session = self.get_mut(game_id)?;
        let symbol = session
            .symbol_of(player)
            .ok_or_else(|| GameError::NotParticipant(player.to_string()))?;
        let turn = session.turn() + 1;
        let outcome = session.apply_move(player, symbol, position, turn)?;
        let applied = Move {
            turn,
            position,
            symbol,
            player: player.to_string(),
        };
        Ok((applied, outcome))
    }

    pub fn get(&self, game_id: &str) -> Option<&GameSession> {
        self.sessions.get(game_id)
    }

    /// Takes back an unsent local move
    pub fn undo(&mut self, game_id: &str, turn: u32) -> bool {
        self.sessions
            .get_mut(game_id)
            .map_or(false, |session| session.undo(turn))
    }

    /// Drops a session that never left INVITED
    pub fn withdraw(&mut self, game_id: &str) -> bool {
        let invited = self
            .sessions
            .get(game_id)
            .map_or(false, |session| session.status() == GameStatus::Invited);
        if invited {
            self.sessions.remove(game_id);
        }
        invited
    }

    fn get_mut(&mut self, game_id: &str) -> Result<&mut GameSession, GameError> {
        self.sessions
            .get_mut(game_id)
            .ok_or_else(|| GameError::UnknownGame(game_id.to_string()))
    }
}
