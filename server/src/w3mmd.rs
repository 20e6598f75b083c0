//! W3MMD map meta data collector
//!
//! Maps report results by tunnelling a small token language through sync-int
//! actions. Declarations (players, variables, events) and updates arrive
//! interleaved, so both are buffered and released with separate delays, and
//! updates are only released once every pending declaration has been.

use log::{info, warn};
use shared::w3gs::action::SYNC_INT;
use std::collections::{BTreeMap, HashMap, VecDeque};

const SIGNATURE: &[u8] = b"MMD.Dat\0";
const PARSER_VERSION: u32 = 1;

/// Game facts the collector needs while processing its queues
#[derive(Debug, Clone, Copy)]
pub struct StatsContext {
    pub ticks: u64,
    pub paused: bool,
    pub num_slots: u8,
    pub num_controllers: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct MmdDelays {
    pub initial_ms: u64,
    pub definition_ms: u64,
    pub action_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Real,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Set,
    Add,
    Subtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerFlag {
    Leaver,
    Practicing,
    Drawer,
    Winner,
    Loser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    Loser,
    Drawer,
    Winner,
}

impl GameResult {
    fn verb(self) -> &'static str {
        match self {
            GameResult::Loser => "lost",
            GameResult::Drawer => "drew",
            GameResult::Winner => "won",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int(i64),
    Real(f64),
    Text(String),
}

impl std::fmt::Display for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarValue::Int(v) => write!(f, "{}", v),
            VarValue::Real(v) => write!(f, "{}", v),
            VarValue::Text(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Definition {
    Player { sid: u8, name: String },
    Var { name: String, value_type: ValueType },
    Event { name: String, params: Vec<String>, format: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Update {
    Flag { sid: u8, flag: PlayerFlag },
    Var { sid: u8, name: String, op: Operator, operand: String },
    Event { name: String, args: Vec<String> },
}

#[derive(Debug, Clone)]
struct Queued<T> {
    received_at: u64,
    value_id: u32,
    item: T,
}

#[derive(Debug)]
pub struct W3mmd {
    game_name: String,
    delays: MmdDelays,
    game_over: bool,
    error: bool,
    version: u32,
    last_value_id: u32,
    names: BTreeMap<u8, String>,
    results: BTreeMap<u8, GameResult>,
    leavers: BTreeMap<u8, bool>,
    practicing: BTreeMap<u8, bool>,
    var_types: HashMap<String, ValueType>,
    vars: BTreeMap<(u8, String), VarValue>,
    events: HashMap<String, (Vec<String>, String)>,
    definitions: VecDeque<Queued<Definition>>,
    updates: VecDeque<Queued<Update>>,
    /// Human-readable record of results and events, in processing order
    pub log: Vec<String>,
}

/// Splits a key on spaces; `\ ` and `\\` escape, empty tokens are invalid
pub fn tokenize_key(key: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut escaping = false;
    for c in key.chars() {
        if escaping {
            match c {
                ' ' | '\\' => token.push(c),
                _ => return None,
            }
            escaping = false;
        } else if c == ' ' {
            if token.is_empty() {
                return None;
            }
            tokens.push(std::mem::take(&mut token));
        } else if c == '\\' {
            escaping = true;
        } else {
            token.push(c);
        }
    }
    if token.is_empty() {
        return None;
    }
    tokens.push(token);
    Some(tokens)
}

fn cstring_at(data: &[u8], start: usize) -> Option<&[u8]> {
    let rest = data.get(start..)?;
    let end = rest.iter().position(|b| *b == 0)?;
    Some(&rest[..end])
}

impl W3mmd {
    pub fn new(game_name: impl Into<String>, delays: MmdDelays) -> Self {
        Self {
            game_name: game_name.into(),
            delays,
            game_over: false,
            error: false,
            version: 0,
            last_value_id: 0,
            names: BTreeMap::new(),
            results: BTreeMap::new(),
            leavers: BTreeMap::new(),
            practicing: BTreeMap::new(),
            var_types: HashMap::new(),
            vars: BTreeMap::new(),
            events: HashMap::new(),
            definitions: VecDeque::new(),
            updates: VecDeque::new(),
            log: Vec::new(),
        }
    }

    fn prefix(&self) -> String {
        format!("[W3MMD: {}]", self.game_name)
    }

    pub fn is_game_over(&self) -> bool {
        self.game_over
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn pending(&self) -> usize {
        self.definitions.len() + self.updates.len()
    }

    /// Scans one action for meta data packets; false once the collector has failed
    pub fn recv_action(&mut self, data: &[u8], ticks: u64) -> bool {
        if self.error {
            return false;
        }
        let mut i = 0;
        while data.len() >= i + 9 {
            if data[i] != SYNC_INT || &data[i + 1..i + 9] != SIGNATURE {
                i += 1;
                continue;
            }
            let Some(mission_key) = cstring_at(data, i + 9) else {
                i += 1;
                continue;
            };
            let key_start = i + 10 + mission_key.len();
            let Some(key) = cstring_at(data, key_start) else {
                i += 1;
                continue;
            };
            let end = key_start + key.len() + 5;
            if data.len() < end {
                i += 1;
                continue;
            }
            let mission_key = String::from_utf8_lossy(mission_key).into_owned();
            let key = String::from_utf8_lossy(key).into_owned();
            self.handle_packet(&mission_key, &key, ticks);
            i = end;
        }
        !self.error
    }

    fn handle_packet(&mut self, mission_key: &str, key: &str, ticks: u64) {
        if let Some(id) = mission_key.strip_prefix("val:").filter(|s| !s.is_empty()) {
            let handled = match (id.parse::<u32>(), tokenize_key(key)) {
                (Ok(value_id), Some(tokens)) => self.handle_tokens(value_id, &tokens, ticks),
                _ => false,
            };
            if !handled {
                warn!("{} error parsing [{}]", self.prefix(), key);
            }
        } else if mission_key.starts_with("chk:") && mission_key.len() > 4 {
            // integrity checks are accepted but not verified
        } else {
            warn!("{} unknown mission key [{}] found, ignoring", self.prefix(), mission_key);
        }
    }

    fn handle_tokens(&mut self, value_id: u32, tokens: &[String], ticks: u64) -> bool {
        let Some(kind) = tokens.first() else {
            return false;
        };
        let queued_def = |item| Queued {
            received_at: ticks,
            value_id,
            item,
        };
        match (kind.as_str(), tokens.len()) {
            ("init", 4) if tokens[1] == "version" => {
                let (Ok(required), Ok(current)) = (tokens[2].parse::<u32>(), tokens[3].parse::<u32>()) else {
                    return false;
                };
                if required > PARSER_VERSION {
                    warn!(
                        "{} error - map requires MMD parser version {} or higher (using version {})",
                        self.prefix(),
                        required,
                        PARSER_VERSION
                    );
                    self.error = true;
                } else {
                    info!("{} map is using W3MMD library version [{}]", self.prefix(), current);
                    self.version = required;
                }
            }
            ("init", 4) if tokens[1] == "pid" => {
                let Ok(sid) = tokens[2].parse::<u8>() else {
                    return false;
                };
                self.definitions.push_back(queued_def(Definition::Player {
                    sid,
                    name: tokens[3].clone(),
                }));
            }
            ("init", n) if n >= 2 => {}
            ("DefVarP", 5) => {
                let value_type = match tokens[2].as_str() {
                    "int" => ValueType::Int,
                    "real" => ValueType::Real,
                    "string" => ValueType::Text,
                    other => {
                        warn!("{} invalid DefVarP type [{}] found, ignoring", self.prefix(), other);
                        return false;
                    }
                };
                self.definitions.push_back(queued_def(Definition::Var {
                    name: tokens[1].clone(),
                    value_type,
                }));
            }
            ("VarP", 5) => {
                let Ok(sid) = tokens[1].parse::<u8>() else {
                    warn!("{} VarP [{}] has invalid SID [{}], ignoring", self.prefix(), tokens[2], tokens[1]);
                    return false;
                };
                let op = match tokens[3].as_str() {
                    "=" => Operator::Set,
                    "+=" => Operator::Add,
                    "-=" => Operator::Subtract,
                    other => {
                        warn!("{} unknown VarP operation [{}] found, ignoring", self.prefix(), other);
                        return false;
                    }
                };
                self.updates.push_back(Queued {
                    received_at: ticks,
                    value_id,
                    item: Update::Var {
                        sid,
                        name: tokens[2].clone(),
                        op,
                        operand: tokens[4].clone(),
                    },
                });
            }
            ("FlagP", 3) => {
                let Ok(sid) = tokens[1].parse::<u8>() else {
                    warn!("{} FlagP [{}] has invalid SID [{}], ignoring", self.prefix(), tokens[2], tokens[1]);
                    return false;
                };
                let flag = match tokens[2].as_str() {
                    "leaver" => PlayerFlag::Leaver,
                    "practicing" => PlayerFlag::Practicing,
                    "drawer" => PlayerFlag::Drawer,
                    "winner" => PlayerFlag::Winner,
                    "loser" => PlayerFlag::Loser,
                    other => {
                        warn!("{} unknown flag [{}] found, ignoring", self.prefix(), other);
                        return false;
                    }
                };
                self.updates.push_back(Queued {
                    received_at: ticks,
                    value_id,
                    item: Update::Flag { sid, flag },
                });
            }
            ("DefEvent", n) if n >= 4 => {
                let Ok(arity) = tokens[2].parse::<usize>() else {
                    warn!("{} DefEvent invalid arity [{}] found, ignoring", self.prefix(), tokens[2]);
                    return false;
                };
                if n != arity + 4 {
                    warn!("{} DefEvent [{}] tokens missing, ignoring", self.prefix(), tokens[1]);
                    return false;
                }
                self.definitions.push_back(queued_def(Definition::Event {
                    name: tokens[1].clone(),
                    params: tokens[3..n - 1].to_vec(),
                    format: tokens[n - 1].clone(),
                }));
            }
            ("Event", n) if n >= 2 => {
                self.updates.push_back(Queued {
                    received_at: ticks,
                    value_id,
                    item: Update::Event {
                        name: tokens[1].clone(),
                        args: tokens[2..].to_vec(),
                    },
                });
            }
            ("Blank", _) => {}
            ("Custom", _) => {
                self.log.push(format!("custom: {}", tokens.join(" ")));
            }
            (other, _) => {
                info!("{} unknown action type [{}] found, ignoring", self.prefix(), other);
            }
        }
        true
    }

    fn process_definition(&mut self, definition: Definition, ctx: &StatsContext) -> bool {
        match definition {
            Definition::Player { sid, name } => {
                if sid >= ctx.num_slots {
                    warn!("{} cannot initialize player slot {}", self.prefix(), sid);
                    return false;
                }
                let known = self.names.contains_key(&sid);
                if !known && self.names.len() >= ctx.num_controllers as usize {
                    warn!("{} too many players initialized", self.prefix());
                    return false;
                }
                if known {
                    info!("{} SID [{}] renamed to [{}]", self.prefix(), sid, name);
                }
                self.names.insert(sid, name);
                true
            }
            Definition::Var { name, value_type } => {
                if self.var_types.contains_key(&name) {
                    warn!("{} duplicate DefVarP [{}] found, ignoring", self.prefix(), name);
                    return false;
                }
                self.var_types.insert(name, value_type);
                true
            }
            Definition::Event { name, params, format } => {
                if self.events.contains_key(&name) {
                    warn!("{} duplicate DefEvent [{}] found, ignoring", self.prefix(), name);
                    return false;
                }
                self.events.insert(name, (params, format));
                true
            }
        }
    }

    fn process_update(&mut self, update: Update) -> bool {
        match update {
            Update::Flag { sid, flag } => {
                if !self.names.contains_key(&sid) {
                    warn!("{} FlagP has undefined SID [{}], ignoring", self.prefix(), sid);
                    return false;
                }
                let result = match flag {
                    PlayerFlag::Leaver => {
                        self.leavers.insert(sid, true);
                        return true;
                    }
                    PlayerFlag::Practicing => {
                        self.practicing.insert(sid, true);
                        return true;
                    }
                    PlayerFlag::Drawer => GameResult::Drawer,
                    PlayerFlag::Winner => GameResult::Winner,
                    PlayerFlag::Loser => GameResult::Loser,
                };
                match self.results.get(&sid) {
                    Some(previous) if *previous == result => return true,
                    Some(previous) => {
                        warn!(
                            "{} previous flag [{:?}] would be overridden with [{:?}] for SID [{}] - ignoring",
                            self.prefix(),
                            previous,
                            result,
                            sid
                        );
                        return false;
                    }
                    None => {}
                }
                self.results.insert(sid, result);
                if result == GameResult::Winner {
                    self.game_over = true;
                }
                let line = format!("{} {} the game.", self.stored_name(sid), result.verb());
                info!("{} {}", self.prefix(), line);
                self.log.push(line);
                true
            }
            Update::Var { sid, name, op, operand } => self.update_var(sid, name, op, &operand),
            Update::Event { name, args } => self.fire_event(&name, &args),
        }
    }

    fn update_var(&mut self, sid: u8, name: String, op: Operator, operand: &str) -> bool {
        let Some(value_type) = self.var_types.get(&name).copied() else {
            warn!("{} VarP [{}] found without a corresponding DefVarP, ignoring", self.prefix(), name);
            return false;
        };
        let parsed = match value_type {
            ValueType::Int => operand.parse::<u32>().ok().map(|v| VarValue::Int(v as i64)),
            ValueType::Real => operand.parse::<f64>().ok().map(VarValue::Real),
            ValueType::Text if op == Operator::Set => Some(VarValue::Text(operand.to_string())),
            ValueType::Text => {
                warn!("{} VarP [{}] of type string cannot accept +=, -= operators, ignoring", self.prefix(), name);
                return false;
            }
        };
        let Some(value) = parsed else {
            warn!("{} invalid VarP [{}] value [{}] found, ignoring", self.prefix(), name, operand);
            return false;
        };
        let entry = self.vars.entry((sid, name)).or_insert_with(|| match value_type {
            ValueType::Int => VarValue::Int(0),
            ValueType::Real => VarValue::Real(0.0),
            ValueType::Text => VarValue::Text(String::new()),
        });
        match (op, entry, value) {
            (Operator::Set, entry, value) => *entry = value,
            (Operator::Add, VarValue::Int(current), VarValue::Int(v)) => *current += v,
            (Operator::Subtract, VarValue::Int(current), VarValue::Int(v)) => *current -= v,
            (Operator::Add, VarValue::Real(current), VarValue::Real(v)) => *current += v,
            (Operator::Subtract, VarValue::Real(current), VarValue::Real(v)) => *current -= v,
            _ => return false,
        }
        true
    }

    fn fire_event(&mut self, name: &str, args: &[String]) -> bool {
        let Some((params, format)) = self.events.get(name) else {
            warn!("{} Event [{}] found without a corresponding DefEvent, ignoring", self.prefix(), name);
            return false;
        };
        if args.len() != params.len() {
            warn!(
                "{} Event [{}] found with {} arguments but expected {} arguments, ignoring",
                self.prefix(),
                name,
                args.len(),
                params.len()
            );
            return false;
        }
        let mut text = format.clone();
        for (i, (param, arg)) in params.iter().zip(args).enumerate() {
            let replacement = if param.starts_with("pid:") {
                let Ok(sid) = arg.parse::<u8>() else {
                    warn!("{} Event [{}] passed invalid PID {}", self.prefix(), name, arg);
                    return false;
                };
                self.names.get(&sid).cloned().unwrap_or_else(|| format!("SID:{}", arg))
            } else {
                arg.clone()
            };
            text = text.replace(&format!("{{{}}}", i), &replacement);
        }
        let line = format!("Event [{}]: {}", name, text);
        info!("{} {}", self.prefix(), line);
        self.log.push(line);
        true
    }

    /// Releases whatever is due; returns false once the game result is known
    pub fn update_queue(&mut self, ctx: &StatsContext) -> bool {
        if ctx.paused || ctx.ticks < self.delays.initial_ms {
            return true;
        }
        while let Some(front) = self.definitions.front() {
            if ctx.ticks < front.received_at + self.delays.definition_ms {
                break;
            }
            if let Some(queued) = self.definitions.pop_front() {
                self.last_value_id = self.last_value_id.max(queued.value_id);
                self.process_definition(queued.item, ctx);
            }
        }
        if !self.definitions.is_empty() {
            return true;
        }
        while let Some(front) = self.updates.front() {
            if ctx.ticks < front.received_at + self.delays.action_ms {
                break;
            }
            if let Some(queued) = self.updates.pop_front() {
                self.last_value_id = self.last_value_id.max(queued.value_id);
                self.process_update(queued.item);
            }
        }
        !self.game_over
    }

    /// Processes everything still queued, regardless of delays
    pub fn flush_queue(&mut self, ctx: &StatsContext) -> bool {
        while let Some(queued) = self.definitions.pop_front() {
            self.process_definition(queued.item, ctx);
        }
        while let Some(queued) = self.updates.pop_front() {
            self.process_update(queued.item);
        }
        !self.game_over
    }

    pub fn stored_name(&self, sid: u8) -> String {
        self.names.get(&sid).cloned().unwrap_or_else(|| format!("SID {}", sid))
    }

    pub fn winners(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, r)| **r == GameResult::Winner)
            .map(|(sid, _)| self.stored_name(*sid))
            .collect()
    }

    pub fn result(&self, sid: u8) -> Option<GameResult> {
        self.results.get(&sid).copied()
    }

    pub fn var(&self, sid: u8, name: &str) -> Option<&VarValue> {
        self.vars.get(&(sid, name.to_string()))
    }

    /// Per-slot values for the end-of-game records
    pub fn player_stats(&self, sid: u8) -> BTreeMap<String, String> {
        let mut stats: BTreeMap<String, String> = self
            .vars
            .iter()
            .filter(|((s, _), _)| *s == sid)
            .map(|((_, name), value)| (name.clone(), value.to_string()))
            .collect();
        if let Some(result) = self.results.get(&sid) {
            stats.insert("result".to_string(), result.verb().to_string());
        }
        if self.leavers.contains_key(&sid) {
            stats.insert("leaver".to_string(), "1".to_string());
        }
        if self.practicing.contains_key(&sid) {
            stats.insert("practicing".to_string(), "1".to_string());
        }
        stats
    }
}

/// Builds a sync-int action carrying one W3MMD packet
pub fn encode_packet(mission_key: &str, key: &str, value: u32) -> Vec<u8> {
    let mut data = vec![SYNC_INT];
    data.extend_from_slice(SIGNATURE);
    data.extend_from_slice(mission_key.as_bytes());
    data.push(0);
    data.extend_from_slice(key.as_bytes());
    data.push(0);
    data.extend_from_slice(&value.to_le_bytes());
    data
}
