//! The authoritative match server.
//!
//! All match state lives on a single tick loop running at [`TICK_RATE`]
//! ticks per second. Each tick: accept newly upgraded connections, advance
//! and check timers, run disqualification checks, drain the console command
//! queue, then drain every connection's inbound queue. Nothing outside the
//! loop touches match state; the HTTP layer and console only hand in
//! connections and commands over channels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::console::{command_queue, Command, CommandQueue};
use crate::store::{load_motd, SettingsStore};
use crate::util::time::{tick_delta, unix_millis, TICK_DURATION_MICROS, TICK_RATE};
use crate::ws::codec::Frame;
use crate::ws::connection::{ConnectionWrapper, MessageWrapper};

use super::messages::{
    ChatMessageType, ClientInfo, ControlType, MatchClientState, MatchMessage, MatchPlayerState,
    MatchState,
};
use super::registry::{ServerHandle, ServerShared};
use super::settings::{
    AllowedTiers, MatchSettings, StageRotationMode, TierRotationMode, STAGE_COUNT,
};
use super::timer::Timer;
use super::{GAME_VERSION, IS_TESTING};

/// Grace period after every player readies up before the race loads.
const LOBBY_MATCH_START_TIME: f32 = 3.0;

/// How long clients get to load the stage before the race starts without
/// them.
const STAGE_LOADING_TIMEOUT: f32 = 20.0;

/// Static identity and paths of one server instance.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub id: Uuid,
    pub name: String,
    pub max_players: usize,
    pub motd_path: Option<PathBuf>,
}

/// A connected, validated client.
struct Client {
    guid: Uuid,
    name: String,
    connection_id: Uuid,
    loading_stage: bool,
    wants_to_return_to_lobby: bool,
}

/// One active player seat. Keyed by (client guid, control type).
struct Player {
    client_guid: Uuid,
    ctrl_type: ControlType,
    character_id: usize,
    ready_to_race: bool,
    currently_racing: bool,
    /// Time since the last checkpoint; drives disqualification.
    racing_timeout: Timer,
    timeout_message_sent: bool,
}

pub struct MatchServer {
    options: ServerOptions,
    settings: MatchSettings,
    settings_store: Option<SettingsStore>,
    motd: Option<String>,

    running: bool,
    debug_mode: bool,
    in_race: bool,

    clients: Vec<Client>,
    players: Vec<Player>,
    connections: HashMap<Uuid, ConnectionWrapper>,

    /// Runs while every player is ready; expiry loads the race.
    lobby_timer: Timer,
    /// Runs while enough players are in the lobby; expiry loads the race.
    auto_start_timer: Timer,
    /// Runs while clients load the stage; expiry starts the race anyway.
    stage_load_timer: Timer,
    /// Runs after every racer finishes; expiry returns to the lobby.
    back_to_lobby_timer: Timer,

    rng: ChaCha8Rng,
    conn_rx: mpsc::UnboundedReceiver<ConnectionWrapper>,
    commands: CommandQueue,
    shared: Arc<ServerShared>,
}

impl MatchServer {
    /// Build a server instance plus the handle the HTTP layer and console
    /// use to reach it.
    pub fn create(
        options: ServerOptions,
        settings: MatchSettings,
        settings_store: Option<SettingsStore>,
    ) -> (MatchServer, ServerHandle) {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (command_sender, commands) = command_queue();
        let shared = Arc::new(ServerShared::default());

        let motd = match &options.motd_path {
            Some(path) => match load_motd(path) {
                Ok(motd) => {
                    if motd.is_some() {
                        info!(path = %path.display(), "Loaded message of the day");
                    }
                    motd
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not load message of the day");
                    None
                }
            },
            None => None,
        };

        let handle = ServerHandle {
            id: options.id,
            name: options.name.clone(),
            max_players: options.max_players,
            conn_tx,
            commands: command_sender,
            shared: Arc::clone(&shared),
        };
        let server = MatchServer {
            options,
            settings,
            settings_store,
            motd,
            running: true,
            debug_mode: false,
            in_race: false,
            clients: Vec::new(),
            players: Vec::new(),
            connections: HashMap::new(),
            lobby_timer: Timer::new(),
            auto_start_timer: Timer::new(),
            stage_load_timer: Timer::new(),
            back_to_lobby_timer: Timer::new(),
            rng: ChaCha8Rng::seed_from_u64(rand::random()),
            conn_rx,
            commands,
            shared,
        };
        (server, handle)
    }

    /// Drive the tick loop until a stop command arrives.
    pub async fn run(mut self) {
        info!(
            server_id = %self.options.id,
            name = %self.options.name,
            "Match server running at {} ticks per second", TICK_RATE
        );
        let mut ticker = tokio::time::interval(Duration::from_micros(TICK_DURATION_MICROS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let dt = tick_delta();

        while self.running {
            ticker.tick().await;
            self.tick(dt);
        }

        self.shutdown();
        // Give the send tasks a moment to flush the goodbye frames.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// One simulation step. `dt` is the tick delta in seconds.
    pub fn tick(&mut self, dt: f32) {
        self.accept_connections();
        self.advance_timers(dt);
        self.check_disqualifications();
        self.drain_commands();
        self.drain_network();
        self.publish_shared();
    }

    fn shutdown(&mut self) {
        self.save_settings();
        for (_, conn) in self.connections.drain() {
            conn.disconnect("Server is shutting down");
        }
        info!(server_id = %self.options.id, "Match server stopped");
    }

    fn accept_connections(&mut self) {
        while let Ok(conn) = self.conn_rx.try_recv() {
            debug!(connection_id = %conn.id(), "Socket connected, awaiting validation");
            self.connections.insert(conn.id(), conn);
        }
    }

    fn advance_timers(&mut self, dt: f32) {
        self.lobby_timer.advance(dt);
        self.auto_start_timer.advance(dt);
        self.stage_load_timer.advance(dt);
        self.back_to_lobby_timer.advance(dt);
        for player in &mut self.players {
            player.racing_timeout.advance(dt);
        }

        if self.lobby_timer.expired(LOBBY_MATCH_START_TIME) {
            debug!("Lobby grace period over, loading race");
            self.load_race();
        }
        if self.auto_start_timer.expired(self.settings.auto_start_time as f32) {
            debug!("Match auto start timer expired, loading race");
            self.load_race();
        }
        if self.stage_load_timer.expired(STAGE_LOADING_TIMEOUT) {
            self.finish_stage_loading_by_timeout();
        }
        if self.back_to_lobby_timer.expired(self.settings.auto_return_time as f32) {
            self.back_to_lobby_timer.reset();
            self.return_to_lobby();
        }
    }

    /// Kick clients that never finished loading, then race with the rest.
    fn finish_stage_loading_by_timeout(&mut self) {
        let stragglers: Vec<(Uuid, String)> = self
            .clients
            .iter()
            .filter(|c| c.loading_stage)
            .map(|c| (c.connection_id, c.name.clone()))
            .collect();
        for (connection_id, name) in stragglers {
            info!(client = %name, "Client took too long to load and was dropped");
            self.kick(connection_id, "Took too long to load the race");
        }
        self.start_race();
    }

    fn check_disqualifications(&mut self) {
        if self.settings.disqualification_time <= 0 {
            return;
        }
        let threshold = self.settings.disqualification_time as f32;

        let mut warned: Vec<(Uuid, ControlType)> = Vec::new();
        let mut disqualified: Vec<(Uuid, ControlType)> = Vec::new();
        for player in &mut self.players {
            if !player.currently_racing {
                continue;
            }
            if player.racing_timeout.elapsed_secs() >= threshold {
                disqualified.push((player.client_guid, player.ctrl_type));
            } else if !player.timeout_message_sent
                && player.racing_timeout.elapsed_secs() >= threshold / 2.0
            {
                player.timeout_message_sent = true;
                warned.push((player.client_guid, player.ctrl_type));
            }
        }

        for (client_guid, ctrl_type) in warned {
            self.send_to_all(&MatchMessage::RaceTimeout {
                client_guid,
                ctrl_type,
                seconds_left: threshold / 2.0,
            });
        }
        for (client_guid, ctrl_type) in disqualified {
            info!("A player was too slow to race and has been disqualified.");
            self.finish_race(client_guid, ctrl_type);
            self.send_to_all(&MatchMessage::DoneRacing {
                client_guid,
                ctrl_type,
                race_time: 0.0,
                disqualified: true,
            });
        }
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.commands.read_next() {
            self.run_command(command);
        }
    }

    fn run_command(&mut self, command: Command) {
        match COMMANDS.iter().find(|spec| spec.name == command.name) {
            Some(spec) => (spec.run)(self, command.content.trim()),
            None => info!("Command '{}' not found.", command.name),
        }
    }

    fn drain_network(&mut self) {
        let mut inbox = Vec::new();
        for conn in self.connections.values_mut() {
            while let Some(message) = conn.try_dequeue() {
                inbox.push(message);
            }
        }
        for message in inbox {
            self.dispatch(message);
        }
    }

    fn dispatch(&mut self, message: MessageWrapper) {
        let source = message.source;
        match message.frame {
            Frame::Connect { payload } => self.handle_connect(source, &payload),
            Frame::Disconnect { reason } => self.handle_disconnect(source, &reason),
            Frame::PlayerMovement { data } => self.relay_movement(source, data),
            Frame::Match { payload, .. } => match MatchMessage::from_payload(&payload) {
                Ok(inner) => self.dispatch_match_message(source, inner),
                Err(e) => {
                    warn!(connection_id = %source, error = %e, "Dropping malformed match message");
                }
            },
            Frame::Discover | Frame::Validate { .. } => {
                debug!(connection_id = %source, "Ignoring server-bound frame of server-only type");
            }
        }
    }

    fn publish_shared(&self) {
        self.shared
            .client_count
            .store(self.clients.len(), Ordering::Relaxed);
        self.shared.in_race.store(self.in_race, Ordering::Relaxed);
    }

    // Handshake

    fn handle_connect(&mut self, source: Uuid, payload: &str) {
        let info: ClientInfo = match serde_json::from_str(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(connection_id = %source, error = %e, "Error reading client info, rejecting client");
                self.send_to_connection(
                    source,
                    &Frame::Validate {
                        ok: false,
                        reason: "Invalid client info! You are likely using a different game \
                                 version than the server."
                            .into(),
                    },
                );
                return;
            }
        };

        if info.version != GAME_VERSION || info.is_testing != IS_TESTING {
            info!(connection_id = %source, client_version = info.version, "Refused to validate client");
            self.send_to_connection(
                source,
                &Frame::Validate {
                    ok: false,
                    reason: "Invalid game version.".into(),
                },
            );
            return;
        }

        if self.clients.len() >= self.options.max_players {
            info!(connection_id = %source, "Refused client, server is full");
            self.send_to_connection(
                source,
                &Frame::Validate {
                    ok: false,
                    reason: "Server is full.".into(),
                },
            );
            return;
        }

        match serde_json::to_string(&self.build_match_state()) {
            Ok(state) => {
                self.send_to_connection(source, &Frame::Connect { payload: state });
                debug!(connection_id = %source, "Sent match state to validated client");
            }
            Err(e) => warn!(connection_id = %source, error = %e, "Failed to serialize match state"),
        }
    }

    /// Snapshot of the current match, built fresh for every new client.
    fn build_match_state(&self) -> MatchState {
        let cur_auto_start_time = if self.auto_start_timer.is_running() {
            (self.settings.auto_start_time as f32 - self.auto_start_timer.elapsed_secs()).max(0.0)
        } else {
            0.0
        };
        MatchState {
            clients: self
                .clients
                .iter()
                .map(|c| MatchClientState {
                    guid: c.guid,
                    name: c.name.clone(),
                })
                .collect(),
            players: self
                .players
                .iter()
                .map(|p| MatchPlayerState {
                    client_guid: p.client_guid,
                    ctrl_type: p.ctrl_type,
                    ready_to_race: p.ready_to_race,
                    character_id: p.character_id,
                })
                .collect(),
            settings: self.settings.clone(),
            in_race: self.in_race,
            cur_auto_start_time,
        }
    }

    // Connection lifecycle

    fn handle_disconnect(&mut self, source: Uuid, reason: &str) {
        self.connections.remove(&source);

        let Some(index) = self.clients.iter().position(|c| c.connection_id == source) else {
            debug!(connection_id = %source, "Unvalidated connection closed");
            return;
        };
        let client = self.clients.remove(index);
        info!(client = %client.name, reason = %reason, "Client disconnected");

        self.players.retain(|p| p.client_guid != client.guid);

        if self.players.is_empty() && self.in_race {
            debug!("No players left in race");
            self.return_to_lobby();
        }
        if (self.players.len() as i32) < self.settings.auto_start_min_players
            && self.auto_start_timer.is_running()
        {
            debug!("Too few players, match auto start timer stopped");
            self.stop_auto_start_timer();
        }
        self.update_lobby_timer();

        self.send_to_all(&MatchMessage::ClientLeft {
            client_guid: client.guid,
        });
        self.broadcast_chat(&format!("{} has left the match ({})", client.name, reason));
    }

    /// Server-initiated removal: tell the client why, then treat the
    /// connection as gone immediately.
    fn kick(&mut self, connection_id: Uuid, reason: &str) {
        if let Some(conn) = self.connections.get(&connection_id) {
            conn.disconnect(reason);
        }
        self.handle_disconnect(connection_id, reason);
    }

    fn relay_movement(&self, source: Uuid, data: Vec<u8>) {
        let encoded = Frame::PlayerMovement { data }.encode();
        for client in &self.clients {
            if client.connection_id == source {
                continue;
            }
            if let Some(conn) = self.connections.get(&client.connection_id) {
                conn.send_raw(encoded.clone());
            }
        }
    }

    // Match messages

    fn dispatch_match_message(&mut self, source: Uuid, message: MatchMessage) {
        match message {
            MatchMessage::ClientJoined {
                client_guid,
                client_name,
            } => self.handle_client_joined(source, client_guid, client_name),
            MatchMessage::PlayerJoined {
                client_guid,
                ctrl_type,
                initial_character,
            } => self.handle_player_joined(source, client_guid, ctrl_type, initial_character),
            MatchMessage::PlayerLeft {
                client_guid,
                ctrl_type,
            } => self.handle_player_left(source, client_guid, ctrl_type),
            MatchMessage::CharacterChanged {
                client_guid,
                ctrl_type,
                new_character,
            } => self.handle_character_changed(source, client_guid, ctrl_type, new_character),
            MatchMessage::ChangedReady {
                client_guid,
                ctrl_type,
                ready,
            } => self.handle_changed_ready(source, client_guid, ctrl_type, ready),
            MatchMessage::SettingsChanged { .. } => {
                debug!(connection_id = %source, "A client tried to change match settings");
            }
            MatchMessage::StartRace => self.handle_stage_loaded(source),
            MatchMessage::Chat { from, kind, text } => self.handle_chat(from, kind, text),
            MatchMessage::LoadLobby => self.handle_return_vote(source),
            MatchMessage::CheckpointPassed {
                client_guid,
                ctrl_type,
                lap_time,
            } => self.handle_checkpoint_passed(source, client_guid, ctrl_type, lap_time),
            MatchMessage::DoneRacing {
                client_guid,
                ctrl_type,
                race_time,
                disqualified,
            } => self.handle_done_racing(source, client_guid, ctrl_type, race_time, disqualified),
            MatchMessage::ClientLeft { .. }
            | MatchMessage::RaceTimeout { .. }
            | MatchMessage::AutoStartTimer { .. }
            | MatchMessage::LoadRace => {
                debug!(connection_id = %source, "Dropping server-only match message from client");
            }
        }
    }

    /// True when `claimed` is the guid of the client behind `source`. Every
    /// client-claiming message is checked so one client cannot act as
    /// another.
    fn verified_client_guid(&self, source: Uuid, claimed: Uuid, message: &str) -> bool {
        match self.source_client(source) {
            Some(client) if client.guid == claimed => true,
            _ => {
                warn!(
                    connection_id = %source,
                    message = message,
                    "Dropping match message with mismatched client identity"
                );
                false
            }
        }
    }

    fn source_client(&self, source: Uuid) -> Option<&Client> {
        self.clients.iter().find(|c| c.connection_id == source)
    }

    fn find_player(&self, client_guid: Uuid, ctrl_type: ControlType) -> Option<&Player> {
        self.players
            .iter()
            .find(|p| p.client_guid == client_guid && p.ctrl_type == ctrl_type)
    }

    fn find_player_mut(
        &mut self,
        client_guid: Uuid,
        ctrl_type: ControlType,
    ) -> Option<&mut Player> {
        self.players
            .iter_mut()
            .find(|p| p.client_guid == client_guid && p.ctrl_type == ctrl_type)
    }

    fn handle_client_joined(&mut self, source: Uuid, client_guid: Uuid, client_name: String) {
        if !self.connections.contains_key(&source) {
            return;
        }
        if self.source_client(source).is_some() {
            warn!(connection_id = %source, "Connection already has a client, join ignored");
            return;
        }
        self.clients.push(Client {
            guid: client_guid,
            name: client_name.clone(),
            connection_id: source,
            loading_stage: false,
            wants_to_return_to_lobby: false,
        });
        info!(client = %client_name, "Client joined the match");

        self.broadcast_chat(&format!("{} has joined the match", client_name));
        match self.motd.clone() {
            Some(motd) => {
                self.whisper(source, "Server's message of the day:");
                self.whisper(source, &motd);
            }
            None => self.whisper(source, "Welcome to the server!"),
        }
        self.whisper(source, self.settings.allowed_tiers.describe());

        self.send_to_all(&MatchMessage::ClientJoined {
            client_guid,
            client_name,
        });
    }

    fn handle_player_joined(
        &mut self,
        source: Uuid,
        client_guid: Uuid,
        ctrl_type: ControlType,
        initial_character: usize,
    ) {
        if !self.verified_client_guid(source, client_guid, "playerJoined") {
            return;
        }
        if !self.settings.allowed_tiers.permits(initial_character) {
            let text = format!(
                "You cannot join with this character. {}",
                self.settings.allowed_tiers.describe()
            );
            self.whisper(source, &text);
            return;
        }
        if self.find_player(client_guid, ctrl_type).is_some() {
            warn!(connection_id = %source, "Player seat already taken, join ignored");
            return;
        }

        self.players.push(Player {
            client_guid,
            ctrl_type,
            character_id: initial_character,
            ready_to_race: false,
            currently_racing: false,
            racing_timeout: Timer::new(),
            timeout_message_sent: false,
        });
        debug!(ctrl_type = ?ctrl_type, "Player joined the match");

        self.send_to_all(&MatchMessage::PlayerJoined {
            client_guid,
            ctrl_type,
            initial_character,
        });

        if self.settings.auto_start_time > 0
            && self.players.len() as i32 >= self.settings.auto_start_min_players
            && !self.auto_start_timer.is_running()
        {
            debug!(
                "Match will auto start in {} second(s)",
                self.settings.auto_start_time
            );
            self.start_auto_start_timer();
        }
        self.update_lobby_timer();
    }

    fn handle_player_left(&mut self, source: Uuid, client_guid: Uuid, ctrl_type: ControlType) {
        if !self.verified_client_guid(source, client_guid, "playerLeft") {
            return;
        }
        let Some(index) = self
            .players
            .iter()
            .position(|p| p.client_guid == client_guid && p.ctrl_type == ctrl_type)
        else {
            return;
        };
        self.players.remove(index);
        debug!(ctrl_type = ?ctrl_type, "Player left the match");

        self.send_to_all(&MatchMessage::PlayerLeft {
            client_guid,
            ctrl_type,
        });

        if (self.players.len() as i32) < self.settings.auto_start_min_players
            && self.auto_start_timer.is_running()
        {
            debug!("Too few players, match auto start timer stopped");
            self.stop_auto_start_timer();
        }
        self.update_lobby_timer();
    }

    fn handle_character_changed(
        &mut self,
        source: Uuid,
        client_guid: Uuid,
        ctrl_type: ControlType,
        new_character: usize,
    ) {
        if !self.verified_client_guid(source, client_guid, "characterChanged") {
            return;
        }
        let allowed = self.settings.allowed_tiers;
        if !allowed.permits(new_character) {
            let text = format!("You can't use this character. {}", allowed.describe());
            self.whisper(source, &text);
            return;
        }
        let Some(player) = self.find_player_mut(client_guid, ctrl_type) else {
            return;
        };
        player.character_id = new_character;

        self.send_to_all(&MatchMessage::CharacterChanged {
            client_guid,
            ctrl_type,
            new_character,
        });
    }

    fn handle_changed_ready(
        &mut self,
        source: Uuid,
        client_guid: Uuid,
        ctrl_type: ControlType,
        ready: bool,
    ) {
        if !self.verified_client_guid(source, client_guid, "changedReady") {
            return;
        }
        let Some(player) = self.find_player_mut(client_guid, ctrl_type) else {
            return;
        };
        player.ready_to_race = ready;
        self.update_lobby_timer();

        self.send_to_all(&MatchMessage::ChangedReady {
            client_guid,
            ctrl_type,
            ready,
        });
    }

    /// The lobby grace timer runs exactly while there is at least one player
    /// and every player is ready. Re-evaluated on every join, leave and
    /// ready toggle.
    fn update_lobby_timer(&mut self) {
        if self.in_race {
            return;
        }
        let all_ready = !self.players.is_empty() && self.players.iter().all(|p| p.ready_to_race);
        if all_ready {
            if !self.lobby_timer.is_running() {
                debug!("All players ready, lobby timer started");
                self.lobby_timer.start();
            }
        } else if self.lobby_timer.is_running() {
            debug!("Not all players are ready, lobby timer stopped");
            self.lobby_timer.reset();
        }
    }

    /// A client reports its stage finished loading. The last report starts
    /// the race.
    fn handle_stage_loaded(&mut self, source: Uuid) {
        let loading_before = self.clients.iter().filter(|c| c.loading_stage).count();
        if loading_before == 0 {
            return;
        }
        if let Some(client) = self
            .clients
            .iter_mut()
            .find(|c| c.connection_id == source)
        {
            client.loading_stage = false;
        }
        let remaining = self.clients.iter().filter(|c| c.loading_stage).count();
        if remaining > 0 {
            debug!("Waiting for {} client(s) to load", remaining);
        } else {
            self.start_race();
        }
    }

    fn handle_chat(&mut self, from: String, kind: ChatMessageType, text: String) {
        info!(from = %from, kind = ?kind, "Chat: {}", text);
        self.send_to_all(&MatchMessage::Chat { from, kind, text });
    }

    /// Mid-race vote to return to the lobby. Passes once the voting clients
    /// reach `vote_ratio` of all clients, rounding the required count up.
    fn handle_return_vote(&mut self, source: Uuid) {
        let Some(client) = self
            .clients
            .iter_mut()
            .find(|c| c.connection_id == source)
        else {
            return;
        };
        if client.wants_to_return_to_lobby {
            return;
        }
        client.wants_to_return_to_lobby = true;
        let name = client.name.clone();

        let votes = self
            .clients
            .iter()
            .filter(|c| c.wants_to_return_to_lobby)
            .count();
        let required = (self.clients.len() as f32 * self.settings.vote_ratio).ceil() as usize;

        if votes >= required {
            self.broadcast_chat("Returning to lobby by user vote.");
            self.return_to_lobby();
        } else {
            self.broadcast_chat(&format!(
                "{} wants to return to the lobby. {} more vote(s) needed.",
                name,
                required - votes
            ));
        }
    }

    fn handle_checkpoint_passed(
        &mut self,
        source: Uuid,
        client_guid: Uuid,
        ctrl_type: ControlType,
        lap_time: f32,
    ) {
        if !self.verified_client_guid(source, client_guid, "checkpointPassed") {
            return;
        }
        let mut clear_warning = false;
        if let Some(player) = self.find_player_mut(client_guid, ctrl_type) {
            if player.currently_racing {
                player.racing_timeout.restart();
                if player.timeout_message_sent {
                    player.timeout_message_sent = false;
                    clear_warning = true;
                }
            }
        }
        if clear_warning {
            self.send_to_all(&MatchMessage::RaceTimeout {
                client_guid,
                ctrl_type,
                seconds_left: 0.0,
            });
        }
        self.send_to_all(&MatchMessage::CheckpointPassed {
            client_guid,
            ctrl_type,
            lap_time,
        });
    }

    fn handle_done_racing(
        &mut self,
        source: Uuid,
        client_guid: Uuid,
        ctrl_type: ControlType,
        race_time: f64,
        disqualified: bool,
    ) {
        if !self.verified_client_guid(source, client_guid, "doneRacing") {
            return;
        }
        if self.find_player(client_guid, ctrl_type).is_some() {
            self.finish_race(client_guid, ctrl_type);
        }
        self.send_to_all(&MatchMessage::DoneRacing {
            client_guid,
            ctrl_type,
            race_time,
            disqualified,
        });
    }

    // Race lifecycle

    /// Leave the lobby: tell every client to load the stage and start the
    /// loading timeout.
    fn load_race(&mut self) {
        self.lobby_timer.reset();
        self.stop_auto_start_timer();

        self.send_to_all(&MatchMessage::LoadRace);
        self.in_race = true;
        for player in &mut self.players {
            player.ready_to_race = false;
        }
        for client in &mut self.clients {
            client.loading_stage = true;
        }
        self.stage_load_timer.restart();
    }

    /// Every loaded client races from here. Disqualification timers start
    /// now.
    fn start_race(&mut self) {
        info!("Starting race!");
        self.stage_load_timer.reset();
        for client in &mut self.clients {
            client.loading_stage = false;
        }
        for player in &mut self.players {
            player.currently_racing = true;
            player.timeout_message_sent = false;
            player.racing_timeout.restart();
        }
        self.send_to_all(&MatchMessage::StartRace);
    }

    /// Take one player out of the race. When the last racer finishes, the
    /// auto-return countdown starts.
    fn finish_race(&mut self, client_guid: Uuid, ctrl_type: ControlType) {
        if let Some(player) = self.find_player_mut(client_guid, ctrl_type) {
            player.currently_racing = false;
            player.racing_timeout.reset();
        }
        self.send_to_all(&MatchMessage::RaceTimeout {
            client_guid,
            ctrl_type,
            seconds_left: 0.0,
        });

        let still_racing = self.players.iter().filter(|p| p.currently_racing).count();
        if still_racing > 0 {
            debug!("{} player(s) still racing", still_racing);
            return;
        }
        info!("All players are done racing.");
        if self.settings.auto_return_time > 0 {
            self.broadcast_chat(&format!(
                "Returning to lobby in {} seconds",
                self.settings.auto_return_time
            ));
            self.back_to_lobby_timer.restart();
        }
    }

    /// Back to the lobby: clear race state, rotate stage and tiers per the
    /// configured modes, and rearm auto start.
    fn return_to_lobby(&mut self) {
        if !self.in_race {
            debug!("Already in lobby");
            return;
        }
        info!("Returned to lobby");
        self.in_race = false;
        self.send_to_all(&MatchMessage::LoadLobby);

        self.back_to_lobby_timer.reset();
        self.stage_load_timer.reset();
        for player in &mut self.players {
            player.currently_racing = false;
            player.timeout_message_sent = false;
            player.racing_timeout.reset();
        }
        for client in &mut self.clients {
            client.wants_to_return_to_lobby = false;
            client.loading_stage = false;
        }

        let mut settings_changed = false;
        match self.settings.stage_rotation_mode {
            StageRotationMode::None => {}
            StageRotationMode::Sequenced => {
                self.settings.stage_id = (self.settings.stage_id + 1) % STAGE_COUNT;
                debug!(stage_id = self.settings.stage_id, "Stage rotated to next in sequence");
                settings_changed = true;
            }
            StageRotationMode::Random => {
                let mut next = self.settings.stage_id;
                while next == self.settings.stage_id {
                    next = self.rng.gen_range(0..STAGE_COUNT);
                }
                self.settings.stage_id = next;
                debug!(stage_id = next, "Stage rotated randomly");
                settings_changed = true;
            }
        }

        let next_tiers = self
            .settings
            .tier_rotation_mode
            .next_tiers(self.settings.allowed_tiers, &mut self.rng);
        if next_tiers != self.settings.allowed_tiers {
            self.settings.allowed_tiers = next_tiers;
            settings_changed = true;
            self.correct_player_tiers();
            self.broadcast_chat(next_tiers.describe());
        }

        if settings_changed {
            self.settings_changed();
        }

        if self.settings.auto_start_time > 0
            && self.players.len() as i32 >= self.settings.auto_start_min_players
        {
            debug!("Enough players in lobby, auto start timer restarted");
            self.start_auto_start_timer();
        }
    }

    fn start_auto_start_timer(&mut self) {
        self.auto_start_timer.restart();
        self.send_to_all(&MatchMessage::AutoStartTimer { enabled: true });
    }

    fn stop_auto_start_timer(&mut self) {
        self.auto_start_timer.reset();
        self.send_to_all(&MatchMessage::AutoStartTimer { enabled: false });
    }

    /// Move players on now-disallowed characters onto the first allowed one.
    fn correct_player_tiers(&mut self) {
        let allowed = self.settings.allowed_tiers;
        let Some(fallback) = allowed.first_allowed_character() else {
            return;
        };

        let mut reassigned: Vec<(Uuid, ControlType)> = Vec::new();
        for player in &mut self.players {
            if !allowed.permits(player.character_id) {
                player.character_id = fallback;
                reassigned.push((player.client_guid, player.ctrl_type));
            }
        }
        for (client_guid, ctrl_type) in reassigned {
            self.send_to_all(&MatchMessage::CharacterChanged {
                client_guid,
                ctrl_type,
                new_character: fallback,
            });
            if let Some(connection_id) = self
                .clients
                .iter()
                .find(|c| c.guid == client_guid)
                .map(|c| c.connection_id)
            {
                self.whisper(
                    connection_id,
                    "Your character is not allowed and has been automatically changed.",
                );
            }
        }
    }

    /// Persist and announce the current settings.
    fn settings_changed(&mut self) {
        self.save_settings();
        self.send_to_all(&MatchMessage::SettingsChanged {
            new_settings: self.settings.clone(),
        });
    }

    fn save_settings(&self) {
        if let Some(store) = &self.settings_store {
            if let Err(e) = store.save(&self.settings) {
                warn!(error = %e, "Failed to save match settings");
            }
        }
    }

    // Outbound helpers

    fn send_to_connection(&self, connection_id: Uuid, frame: &Frame) {
        if let Some(conn) = self.connections.get(&connection_id) {
            conn.send_frame(frame);
        }
    }

    /// Send one match message to every joined client.
    fn send_to_all(&self, message: &MatchMessage) {
        if self.debug_mode {
            info!(message = ?message, clients = self.clients.len(), "Broadcasting match message");
        }
        let encoded = Frame::Match {
            timestamp: unix_millis() as i64,
            payload: message.to_payload(),
        }
        .encode();
        for client in &self.clients {
            if let Some(conn) = self.connections.get(&client.connection_id) {
                conn.send_raw(encoded.clone());
            }
        }
    }

    /// System chat line to a single connection.
    fn whisper(&self, connection_id: Uuid, text: &str) {
        let frame = Frame::Match {
            timestamp: unix_millis() as i64,
            payload: MatchMessage::Chat {
                from: "Server".into(),
                kind: ChatMessageType::System,
                text: text.into(),
            }
            .to_payload(),
        };
        self.send_to_connection(connection_id, &frame);
    }

    /// System chat line to everyone, mirrored to the server log.
    fn broadcast_chat(&self, text: &str) {
        info!("{}", text);
        self.send_to_all(&MatchMessage::Chat {
            from: "Server".into(),
            kind: ChatMessageType::System,
            text: text.to_string(),
        });
    }
}

// Console commands

struct CommandSpec {
    name: &'static str,
    help: &'static str,
    run: fn(&mut MatchServer, &str),
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        help: "help [command]: Show all commands, or describe one command.",
        run: cmd_help,
    },
    CommandSpec {
        name: "toggleDebug",
        help: "toggleDebug: Toggle verbose logging of every sent message.",
        run: cmd_toggle_debug,
    },
    CommandSpec {
        name: "stop",
        help: "stop: Disconnect all clients and shut the server down.",
        run: cmd_stop,
    },
    CommandSpec {
        name: "say",
        help: "say [text]: Send a chat message to all clients.",
        run: cmd_say,
    },
    CommandSpec {
        name: "clients",
        help: "clients: List connected clients.",
        run: cmd_clients,
    },
    CommandSpec {
        name: "players",
        help: "players: Show the number of players in the match.",
        run: cmd_players,
    },
    CommandSpec {
        name: "kick",
        help: "kick [name or part of name]: Kick the matching client.",
        run: cmd_kick,
    },
    CommandSpec {
        name: "returnToLobby",
        help: "returnToLobby: Force the match back into the lobby.",
        run: cmd_return_to_lobby,
    },
    CommandSpec {
        name: "forceStart",
        help: "forceStart: Start the race now, regardless of readiness.",
        run: cmd_force_start,
    },
    CommandSpec {
        name: "showSettings",
        help: "showSettings: Print the current match settings.",
        run: cmd_show_settings,
    },
    CommandSpec {
        name: "reloadMOTD",
        help: "reloadMOTD [path]: Reload the message of the day, optionally from another file.",
        run: cmd_reload_motd,
    },
    CommandSpec {
        name: "setStage",
        help: "setStage [stage id]: Set the stage raced next.",
        run: cmd_set_stage,
    },
    CommandSpec {
        name: "setLaps",
        help: "setLaps [count]: Set the number of laps per race.",
        run: cmd_set_laps,
    },
    CommandSpec {
        name: "setAutoStartTime",
        help: "setAutoStartTime [seconds]: Set the auto start delay. 0 disables.",
        run: cmd_set_auto_start_time,
    },
    CommandSpec {
        name: "setAutoStartMinPlayers",
        help: "setAutoStartMinPlayers [count]: Set how many players arm the auto start timer.",
        run: cmd_set_auto_start_min_players,
    },
    CommandSpec {
        name: "setAutoReturnTime",
        help: "setAutoReturnTime [seconds]: Set the post-race lobby return delay. 0 disables.",
        run: cmd_set_auto_return_time,
    },
    CommandSpec {
        name: "setStageRotationMode",
        help: "setStageRotationMode [mode]: Set how the stage changes between races.",
        run: cmd_set_stage_rotation_mode,
    },
    CommandSpec {
        name: "setAllowedTiers",
        help: "setAllowedTiers [tiers]: Restrict which character tiers may be used.",
        run: cmd_set_allowed_tiers,
    },
    CommandSpec {
        name: "setTierRotationMode",
        help: "setTierRotationMode [mode]: Set how allowed tiers change between races.",
        run: cmd_set_tier_rotation_mode,
    },
    CommandSpec {
        name: "setVoteRatio",
        help: "setVoteRatio [0.0-1.0]: Set the fraction of clients needed to vote a race back to lobby.",
        run: cmd_set_vote_ratio,
    },
    CommandSpec {
        name: "setDisqualificationTime",
        help: "setDisqualificationTime [seconds]: Set the checkpoint timeout. 0 disables.",
        run: cmd_set_disqualification_time,
    },
];

fn cmd_help(_server: &mut MatchServer, args: &str) {
    if args.is_empty() {
        info!("Available commands:");
        for spec in COMMANDS {
            info!("  {}", spec.name);
        }
        info!("Use 'help [command]' for a description.");
    } else {
        match COMMANDS.iter().find(|spec| spec.name == args) {
            Some(spec) => info!("{}", spec.help),
            None => info!("Command '{}' not found.", args),
        }
    }
}

fn cmd_toggle_debug(server: &mut MatchServer, _args: &str) {
    server.debug_mode = !server.debug_mode;
    if server.debug_mode {
        info!("Debug mode enabled");
    } else {
        info!("Debug mode disabled");
    }
}

fn cmd_stop(server: &mut MatchServer, _args: &str) {
    info!("Server is stopping...");
    server.running = false;
}

fn cmd_say(server: &mut MatchServer, args: &str) {
    if args.is_empty() {
        info!("Usage: say [text]");
        return;
    }
    server.broadcast_chat(args);
}

fn cmd_clients(server: &mut MatchServer, _args: &str) {
    info!("{} client(s) connected:", server.clients.len());
    for client in &server.clients {
        info!("  {}", client.name);
    }
}

fn cmd_players(server: &mut MatchServer, _args: &str) {
    info!("{} player(s) in the match", server.players.len());
}

fn cmd_kick(server: &mut MatchServer, args: &str) {
    if args.is_empty() {
        info!("Usage: kick [name or part of name]");
        return;
    }
    let matching: Vec<(Uuid, String)> = server
        .clients
        .iter()
        .filter(|c| c.name.contains(args))
        .map(|c| (c.connection_id, c.name.clone()))
        .collect();
    match matching.as_slice() {
        [] => info!("No clients match your search."),
        [(connection_id, name)] => {
            info!(client = %name, "Kicking client");
            server.kick(*connection_id, "Kicked by server");
        }
        many => {
            info!("More than one client matches your search:");
            for (_, name) in many {
                info!("  {}", name);
            }
        }
    }
}

fn cmd_return_to_lobby(server: &mut MatchServer, _args: &str) {
    if server.in_race {
        server.broadcast_chat("Returning to lobby by admin command.");
        server.return_to_lobby();
    } else {
        info!("Already in lobby.");
    }
}

fn cmd_force_start(server: &mut MatchServer, _args: &str) {
    if server.in_race {
        info!("The race can only be force started from the lobby.");
    } else {
        info!("The race has been forcefully started.");
        server.load_race();
    }
}

fn cmd_show_settings(server: &mut MatchServer, _args: &str) {
    if let Ok(text) = serde_json::to_string_pretty(&server.settings) {
        info!("{}", text);
    }
}

fn cmd_reload_motd(server: &mut MatchServer, args: &str) {
    let path = if args.is_empty() {
        server.options.motd_path.clone()
    } else {
        Some(PathBuf::from(args))
    };
    let Some(path) = path else {
        info!("No message of the day file configured.");
        return;
    };
    match load_motd(&path) {
        Ok(Some(motd)) => {
            info!(path = %path.display(), "Loaded message of the day");
            server.motd = Some(motd);
        }
        Ok(None) => {
            info!(path = %path.display(), "No message of the day found, cleared");
            server.motd = None;
        }
        Err(e) => info!("Could not load message of the day: {}", e),
    }
}

fn cmd_set_stage(server: &mut MatchServer, args: &str) {
    match args.parse::<i32>() {
        Ok(id) if (0..STAGE_COUNT).contains(&id) => {
            server.settings.stage_id = id;
            server.settings_changed();
            info!("Stage changed to {}", id);
        }
        _ => info!("Usage: setStage [0-{}]", STAGE_COUNT - 1),
    }
}

fn cmd_set_laps(server: &mut MatchServer, args: &str) {
    match args.parse::<i32>() {
        Ok(laps) if laps > 0 => {
            server.settings.laps = laps;
            server.settings_changed();
            info!("Lap count changed to {}", laps);
        }
        _ => info!("Usage: setLaps [positive lap count]"),
    }
}

fn cmd_set_auto_start_time(server: &mut MatchServer, args: &str) {
    match args.parse::<i32>() {
        Ok(seconds) if seconds >= 0 => {
            server.settings.auto_start_time = seconds;
            server.settings_changed();
            info!("Match auto start time changed to {}", seconds);
        }
        _ => info!("Usage: setAutoStartTime [seconds, 0 disables]"),
    }
}

fn cmd_set_auto_start_min_players(server: &mut MatchServer, args: &str) {
    match args.parse::<i32>() {
        Ok(count) if count > 0 => {
            server.settings.auto_start_min_players = count;
            server.settings_changed();
            info!("Match auto start minimum players changed to {}", count);
        }
        _ => info!("Usage: setAutoStartMinPlayers [positive player count]"),
    }
}

fn cmd_set_auto_return_time(server: &mut MatchServer, args: &str) {
    match args.parse::<i32>() {
        Ok(seconds) if seconds >= 0 => {
            server.settings.auto_return_time = seconds;
            server.settings_changed();
            info!("Match auto return time changed to {}", seconds);
        }
        _ => info!("Usage: setAutoReturnTime [seconds, 0 disables]"),
    }
}

fn cmd_set_stage_rotation_mode(server: &mut MatchServer, args: &str) {
    match args.parse::<StageRotationMode>() {
        Ok(mode) => {
            server.settings.stage_rotation_mode = mode;
            server.settings_changed();
            info!("Stage rotation mode set to {}", mode);
        }
        Err(()) => info!(
            "Usage: setStageRotationMode [{}]",
            StageRotationMode::VARIANTS.join("/")
        ),
    }
}

fn cmd_set_allowed_tiers(server: &mut MatchServer, args: &str) {
    match args.parse::<AllowedTiers>() {
        Ok(tiers) => {
            server.settings.allowed_tiers = tiers;
            server.settings_changed();
            server.correct_player_tiers();
            server.broadcast_chat(tiers.describe());
            info!("Allowed tiers set to {}", tiers);
        }
        Err(()) => info!(
            "Usage: setAllowedTiers [{}]",
            AllowedTiers::VARIANTS.join("/")
        ),
    }
}

fn cmd_set_tier_rotation_mode(server: &mut MatchServer, args: &str) {
    match args.parse::<TierRotationMode>() {
        Ok(mode) => {
            server.settings.tier_rotation_mode = mode;
            server.settings_changed();
            info!("Tier rotation mode set to {}", mode);
        }
        Err(()) => info!(
            "Usage: setTierRotationMode [{}]",
            TierRotationMode::VARIANTS.join("/")
        ),
    }
}

fn cmd_set_vote_ratio(server: &mut MatchServer, args: &str) {
    match args.parse::<f32>() {
        Ok(ratio) if (0.0..=1.0).contains(&ratio) => {
            server.settings.vote_ratio = ratio;
            server.settings_changed();
            info!("Vote ratio changed to {}", ratio);
        }
        _ => info!("Usage: setVoteRatio [0.0-1.0]"),
    }
}

fn cmd_set_disqualification_time(server: &mut MatchServer, args: &str) {
    match args.parse::<i32>() {
        Ok(seconds) if seconds >= 0 => {
            server.settings.disqualification_time = seconds;
            server.settings_changed();
            info!("Disqualification time changed to {}", seconds);
        }
        _ => info!("Usage: setDisqualificationTime [seconds, 0 disables]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::{ConnectionIo, Outbound};

    const TICK: f32 = 0.05;

    fn test_settings() -> MatchSettings {
        MatchSettings::default()
    }

    fn test_server(settings: MatchSettings) -> (MatchServer, ServerHandle) {
        MatchServer::create(
            ServerOptions {
                id: Uuid::new_v4(),
                name: "test server".into(),
                max_players: 8,
                motd_path: None,
            },
            settings,
            None,
        )
    }

    fn send(io: &ConnectionIo, message: MatchMessage) {
        io.inbound_tx
            .send(MessageWrapper {
                source: io.id,
                frame: Frame::Match {
                    timestamp: 0,
                    payload: message.to_payload(),
                },
            })
            .unwrap();
    }

    fn drain_frames(io: &mut ConnectionIo) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(entry) = io.outbound_rx.try_recv() {
            if let Outbound::Frame(bytes) = entry {
                frames.push(Frame::decode(&bytes).unwrap());
            }
        }
        frames
    }

    fn drain_messages(io: &mut ConnectionIo) -> Vec<MatchMessage> {
        drain_frames(io)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Match { payload, .. } => Some(MatchMessage::from_payload(&payload).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn advance(server: &mut MatchServer, seconds: f32) {
        let ticks = (seconds / TICK).round() as i32;
        for _ in 0..ticks {
            server.tick(TICK);
        }
    }

    /// Handshake plus clientJoined, processed in one tick.
    fn join_client(
        server: &mut MatchServer,
        handle: &ServerHandle,
        name: &str,
    ) -> (Uuid, ConnectionIo) {
        let (wrapper, io) = ConnectionWrapper::channels();
        handle.connect_client(wrapper);

        let info = serde_json::to_string(&ClientInfo {
            version: GAME_VERSION,
            is_testing: IS_TESTING,
        })
        .unwrap();
        io.inbound_tx
            .send(MessageWrapper {
                source: io.id,
                frame: Frame::Connect { payload: info },
            })
            .unwrap();
        let guid = Uuid::new_v4();
        send(
            &io,
            MatchMessage::ClientJoined {
                client_guid: guid,
                client_name: name.into(),
            },
        );
        server.tick(TICK);
        (guid, io)
    }

    fn add_player(server: &mut MatchServer, io: &ConnectionIo, guid: Uuid, ctrl: ControlType) {
        send(
            io,
            MatchMessage::PlayerJoined {
                client_guid: guid,
                ctrl_type: ctrl,
                initial_character: 0,
            },
        );
        server.tick(TICK);
    }

    fn set_ready(
        server: &mut MatchServer,
        io: &ConnectionIo,
        guid: Uuid,
        ctrl: ControlType,
        ready: bool,
    ) {
        send(
            io,
            MatchMessage::ChangedReady {
                client_guid: guid,
                ctrl_type: ctrl,
                ready,
            },
        );
        server.tick(TICK);
    }

    /// From "everyone ready" through loading to the race running.
    fn enter_race(server: &mut MatchServer, ios: &[&ConnectionIo]) {
        advance(server, LOBBY_MATCH_START_TIME + TICK);
        assert!(server.in_race, "race should have loaded");
        for io in ios {
            send(io, MatchMessage::StartRace);
        }
        server.tick(TICK);
        assert!(
            server.players.iter().all(|p| p.currently_racing),
            "all players should be racing"
        );
    }

    #[test]
    fn lobby_timer_runs_only_while_all_players_ready() {
        let (mut server, handle) = test_server(test_settings());
        let (guid_a, io_a) = join_client(&mut server, &handle, "alice");
        let (guid_b, io_b) = join_client(&mut server, &handle, "bob");
        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        add_player(&mut server, &io_b, guid_b, ControlType::Keyboard);

        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, true);
        assert!(!server.lobby_timer.is_running());

        set_ready(&mut server, &io_b, guid_b, ControlType::Keyboard, true);
        assert!(server.lobby_timer.is_running());

        advance(&mut server, 1.0);
        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, false);
        assert!(!server.lobby_timer.is_running());
        assert_eq!(server.lobby_timer.elapsed_secs(), 0.0);
        assert!(!server.in_race);

        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, true);
        advance(&mut server, LOBBY_MATCH_START_TIME + TICK);
        assert!(server.in_race);
    }

    #[test]
    fn auto_start_timer_requires_min_players() {
        let mut settings = test_settings();
        settings.auto_start_time = 10;
        settings.auto_start_min_players = 2;
        let (mut server, handle) = test_server(settings);

        let (guid_a, io_a) = join_client(&mut server, &handle, "alice");
        let (guid_b, io_b) = join_client(&mut server, &handle, "bob");

        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        assert!(!server.auto_start_timer.is_running());

        add_player(&mut server, &io_b, guid_b, ControlType::Keyboard);
        assert!(server.auto_start_timer.is_running());

        send(
            &io_b,
            MatchMessage::PlayerLeft {
                client_guid: guid_b,
                ctrl_type: ControlType::Keyboard,
            },
        );
        server.tick(TICK);
        assert!(!server.auto_start_timer.is_running());
    }

    #[test]
    fn auto_start_loads_race_without_further_input() {
        let mut settings = test_settings();
        settings.auto_start_time = 10;
        settings.auto_start_min_players = 2;
        let (mut server, handle) = test_server(settings);

        let (guid_a, mut io_a) = join_client(&mut server, &handle, "alice");
        let (guid_b, mut io_b) = join_client(&mut server, &handle, "bob");
        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        add_player(&mut server, &io_b, guid_b, ControlType::Keyboard);

        advance(&mut server, 10.5);
        assert!(server.in_race);
        for io in [&mut io_a, &mut io_b] {
            let messages = drain_messages(io);
            assert!(
                messages.iter().any(|m| matches!(m, MatchMessage::LoadRace)),
                "client should have been told to load the race"
            );
        }

        send(&io_a, MatchMessage::StartRace);
        send(&io_b, MatchMessage::StartRace);
        server.tick(TICK);
        assert!(server.players.iter().all(|p| p.currently_racing));
        for io in [&mut io_a, &mut io_b] {
            let messages = drain_messages(io);
            assert!(messages.iter().any(|m| matches!(m, MatchMessage::StartRace)));
        }
    }

    #[test]
    fn wrong_game_version_is_rejected_without_client_record() {
        let (mut server, handle) = test_server(test_settings());
        let (wrapper, mut io) = ConnectionWrapper::channels();
        handle.connect_client(wrapper);

        let info = serde_json::to_string(&ClientInfo {
            version: GAME_VERSION + 1.0,
            is_testing: IS_TESTING,
        })
        .unwrap();
        io.inbound_tx
            .send(MessageWrapper {
                source: io.id,
                frame: Frame::Connect { payload: info },
            })
            .unwrap();
        server.tick(TICK);

        let frames = drain_frames(&mut io);
        assert!(frames.iter().any(|frame| matches!(
            frame,
            Frame::Validate { ok: false, reason } if reason == "Invalid game version."
        )));
        assert!(server.clients.is_empty());
    }

    #[test]
    fn identity_mismatch_is_dropped() {
        let (mut server, handle) = test_server(test_settings());
        let (guid_a, _io_a) = join_client(&mut server, &handle, "alice");
        let (_guid_b, io_b) = join_client(&mut server, &handle, "bob");

        // bob claims alice's guid
        send(
            &io_b,
            MatchMessage::PlayerJoined {
                client_guid: guid_a,
                ctrl_type: ControlType::Keyboard,
                initial_character: 0,
            },
        );
        server.tick(TICK);
        assert!(server.players.is_empty());
    }

    #[test]
    fn checkpoint_resets_only_that_players_timer() {
        let (mut server, handle) = test_server(test_settings());
        let (guid_a, io_a) = join_client(&mut server, &handle, "alice");
        let (guid_b, io_b) = join_client(&mut server, &handle, "bob");
        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        add_player(&mut server, &io_b, guid_b, ControlType::Keyboard);
        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, true);
        set_ready(&mut server, &io_b, guid_b, ControlType::Keyboard, true);
        enter_race(&mut server, &[&io_a, &io_b]);

        advance(&mut server, 5.0);
        send(
            &io_a,
            MatchMessage::CheckpointPassed {
                client_guid: guid_a,
                ctrl_type: ControlType::Keyboard,
                lap_time: 5.0,
            },
        );
        server.tick(TICK);

        let elapsed_a = server
            .find_player(guid_a, ControlType::Keyboard)
            .unwrap()
            .racing_timeout
            .elapsed_secs();
        let elapsed_b = server
            .find_player(guid_b, ControlType::Keyboard)
            .unwrap()
            .racing_timeout
            .elapsed_secs();
        assert!(elapsed_a < 1.0, "checkpoint should reset alice's timer");
        assert!(elapsed_b > 4.5, "bob's timer should keep counting");
    }

    #[test]
    fn slow_player_is_warned_then_disqualified_once() {
        let mut settings = test_settings();
        settings.disqualification_time = 20;
        let (mut server, handle) = test_server(settings);
        let (guid, mut io) = join_client(&mut server, &handle, "alice");
        add_player(&mut server, &io, guid, ControlType::Keyboard);
        set_ready(&mut server, &io, guid, ControlType::Keyboard, true);
        enter_race(&mut server, &[&io]);
        drain_messages(&mut io);

        advance(&mut server, 10.5);
        let warnings: Vec<_> = drain_messages(&mut io)
            .into_iter()
            .filter(|m| matches!(m, MatchMessage::RaceTimeout { seconds_left, .. } if *seconds_left > 0.0))
            .collect();
        assert_eq!(warnings.len(), 1, "exactly one halfway warning");

        advance(&mut server, 10.5);
        let mut messages = drain_messages(&mut io);
        advance(&mut server, 2.0);
        messages.extend(drain_messages(&mut io));
        let disqualifications = messages
            .iter()
            .filter(|m| matches!(m, MatchMessage::DoneRacing { disqualified: true, .. }))
            .count();
        assert_eq!(disqualifications, 1, "exactly one disqualification");
        assert!(
            !server
                .find_player(guid, ControlType::Keyboard)
                .unwrap()
                .currently_racing
        );
    }

    #[test]
    fn return_vote_needs_ceiling_of_ratio() {
        let mut settings = test_settings();
        settings.vote_ratio = 0.5;
        settings.auto_start_time = 0;
        let (mut server, handle) = test_server(settings);
        let (guid_a, io_a) = join_client(&mut server, &handle, "alice");
        let (_guid_b, io_b) = join_client(&mut server, &handle, "bob");
        let (_guid_c, io_c) = join_client(&mut server, &handle, "carol");
        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, true);
        enter_race(&mut server, &[&io_a, &io_b, &io_c]);

        // 3 clients at ratio 0.5: two votes needed, not one
        send(&io_b, MatchMessage::LoadLobby);
        server.tick(TICK);
        assert!(server.in_race);

        send(&io_c, MatchMessage::LoadLobby);
        server.tick(TICK);
        assert!(!server.in_race);
    }

    #[test]
    fn tier_rotation_reassigns_disallowed_characters() {
        let mut settings = test_settings();
        settings.allowed_tiers = AllowedTiers::NormalOnly;
        settings.tier_rotation_mode = TierRotationMode::Cycle;
        settings.vote_ratio = 0.1;
        settings.auto_start_time = 0;
        let (mut server, handle) = test_server(settings);
        let (guid, mut io) = join_client(&mut server, &handle, "alice");
        add_player(&mut server, &io, guid, ControlType::Keyboard);
        set_ready(&mut server, &io, guid, ControlType::Keyboard, true);
        enter_race(&mut server, &[&io]);
        drain_messages(&mut io);

        send(&io, MatchMessage::LoadLobby);
        server.tick(TICK);
        assert!(!server.in_race);
        assert_eq!(server.settings.allowed_tiers, AllowedTiers::OddOnly);

        let fallback = AllowedTiers::OddOnly.first_allowed_character().unwrap();
        assert_eq!(
            server
                .find_player(guid, ControlType::Keyboard)
                .unwrap()
                .character_id,
            fallback
        );
        let messages = drain_messages(&mut io);
        assert!(messages.iter().any(|m| matches!(
            m,
            MatchMessage::CharacterChanged { new_character, .. } if *new_character == fallback
        )));
        assert!(messages
            .iter()
            .any(|m| matches!(m, MatchMessage::SettingsChanged { .. })));
    }

    #[test]
    fn stage_load_timeout_kicks_stragglers_and_races_on() {
        let (mut server, handle) = test_server(test_settings());
        let (guid_a, mut io_a) = join_client(&mut server, &handle, "alice");
        let (guid_b, io_b) = join_client(&mut server, &handle, "bob");
        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        add_player(&mut server, &io_b, guid_b, ControlType::Keyboard);
        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, true);
        set_ready(&mut server, &io_b, guid_b, ControlType::Keyboard, true);

        advance(&mut server, LOBBY_MATCH_START_TIME + TICK);
        assert!(server.in_race);

        // only alice finishes loading
        send(&io_a, MatchMessage::StartRace);
        server.tick(TICK);
        assert!(!server.players.iter().any(|p| p.currently_racing));

        advance(&mut server, STAGE_LOADING_TIMEOUT + TICK);
        assert_eq!(server.clients.len(), 1);
        assert!(server.find_player(guid_b, ControlType::Keyboard).is_none());
        assert!(
            server
                .find_player(guid_a, ControlType::Keyboard)
                .unwrap()
                .currently_racing
        );
        assert!(drain_messages(&mut io_a)
            .iter()
            .any(|m| matches!(m, MatchMessage::StartRace)));
    }

    #[test]
    fn disconnect_cascades_to_players_and_lobby() {
        let (mut server, handle) = test_server(test_settings());
        let (guid_a, io_a) = join_client(&mut server, &handle, "alice");
        let (guid_b, mut io_b) = join_client(&mut server, &handle, "bob");
        add_player(&mut server, &io_a, guid_a, ControlType::Keyboard);
        add_player(&mut server, &io_b, guid_b, ControlType::Keyboard);
        set_ready(&mut server, &io_a, guid_a, ControlType::Keyboard, true);
        set_ready(&mut server, &io_b, guid_b, ControlType::Keyboard, true);
        enter_race(&mut server, &[&io_a, &io_b]);
        drain_messages(&mut io_b);

        io_a.inbound_tx
            .send(MessageWrapper {
                source: io_a.id,
                frame: Frame::Disconnect {
                    reason: "Client disconnected".into(),
                },
            })
            .unwrap();
        server.tick(TICK);

        assert_eq!(server.clients.len(), 1);
        assert!(server.find_player(guid_a, ControlType::Keyboard).is_none());
        assert!(server.in_race, "bob is still racing");
        assert!(drain_messages(&mut io_b).iter().any(|m| matches!(
            m,
            MatchMessage::ClientLeft { client_guid } if *client_guid == guid_a
        )));

        io_b.inbound_tx
            .send(MessageWrapper {
                source: io_b.id,
                frame: Frame::Disconnect {
                    reason: "Connection lost".into(),
                },
            })
            .unwrap();
        server.tick(TICK);
        assert!(server.clients.is_empty());
        assert!(!server.in_race, "empty race returns to lobby");
    }

    #[test]
    fn console_commands_drive_the_match() {
        let (mut server, handle) = test_server(test_settings());

        handle.commands.submit_line("setLaps 7");
        server.tick(TICK);
        assert_eq!(server.settings.laps, 7);

        handle.commands.submit_line("setLaps potato");
        server.tick(TICK);
        assert_eq!(server.settings.laps, 7);

        handle.commands.submit_line("forceStart");
        server.tick(TICK);
        assert!(server.in_race);

        handle.commands.submit_line("stop");
        server.tick(TICK);
        assert!(!server.running);
    }
}
