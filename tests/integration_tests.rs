//! Integration tests for the hosting core
//!
//! These tests drive a whole game through the public API only, feeding it
//! encoded W3GS/GPS packets and an explicit millisecond clock exactly the way
//! the network loop does.

use server::collaborators::LogAnnouncer;
use server::config::{DesyncHandler, GameConfig, ServerConfig};
use server::dota_stats::{self, DotaStats};
use server::map::{MapDescriptor, ObserverMode, StatsKind};
use server::network::{AppContext, Server};
use server::persistence::{MemoryPersistence, Persistence, SharedPersistence};
use server::session::{CountdownRefusal, Game, GameEvent, GameSetup, GameState, Outgoing, StatsCollector};
use server::w3mmd;
use shared::gps;
use shared::slot::MAX_SLOTS_LEGACY;
use shared::w3gs::{self, id};
use shared::{GameSlot, LayoutStyle, LeaveCode, RejectReason};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

const ENTRY_KEY: u32 = 0x5EED_0042;

fn melee_map(stats: StatsKind) -> MapDescriptor {
    MapDescriptor {
        path: "Maps\\FrozenThrone\\(4)TwistedMeadows.w3x".to_string(),
        size: 123_456,
        crc32: [0xDE, 0xAD, 0xBE, 0xEF],
        hash: [0x01, 0x02, 0x03, 0x04],
        sha1: Some([7; 20]),
        width: [116, 0],
        height: [116, 0],
        game_flags: 0x0001_8000,
        game_type: 1,
        layout: LayoutStyle::Melee,
        slots: (0..4).map(|i| GameSlot::open(i, i)).collect(),
        num_players: 4,
        num_teams: 4,
        version_max_slots: MAX_SLOTS_LEGACY,
        supported_versions: vec![],
        hcl_default: None,
        observers: ObserverMode::None,
        stats,
        hmc_slot: None,
        local_path: None,
    }
}

fn new_game(config: GameConfig, map: MapDescriptor, persistence: Box<dyn Persistence + Send>) -> Game {
    let mut setup = GameSetup::new("integration", map);
    setup.config = config;
    setup.entry_key = ENTRY_KEY;
    setup.host_counter = 3;
    Game::new(setup, persistence, Box::new(LogAnnouncer), 0).expect("valid game")
}

fn addr(conn: u32) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1000 + conn as u16)
}

fn send(game: &mut Game, conn: u32, packet: &[u8], now: u64) {
    game.receive(conn, addr(conn), packet, now);
}

fn join(game: &mut Game, conn: u32, name: &str, now: u64) -> u8 {
    let packet = w3gs::req_join(game.host_counter(), ENTRY_KEY, name, 6112).unwrap();
    send(game, conn, &packet, now);
    game.user_by_name(name).map(|u| u.uid).expect("join accepted")
}

/// Reports the full map and answers two pings, enough for a regular countdown
fn ready(game: &mut Game, conn: u32, now: u64) {
    let size = game.map().size;
    send(game, conn, &w3gs::map_size(1, size), now);
    send(game, conn, &w3gs::pong_to_host(now as u32), now);
    send(game, conn, &w3gs::pong_to_host(now as u32), now);
}

/// Joins everyone on connections 1.., runs the regular countdown and loads.
/// Returns the UIDs in join order and the time play started.
fn start(game: &mut Game, names: &[&str]) -> (Vec<u8>, u64) {
    let mut uids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let conn = i as u32 + 1;
        uids.push(join(game, conn, name, 0));
        ready(game, conn, 0);
    }
    game.start_countdown(false, 1_000).expect("countdown allowed");
    let mut now = 1_000;
    while game.state() == GameState::Lobby && now < 10_000 {
        game.update(now);
        now += 500;
    }
    assert_eq!(game.state(), GameState::Loading);
    for conn in 1..=names.len() as u32 {
        send(game, conn, &w3gs::game_loaded_self(), now);
    }
    assert_eq!(game.state(), GameState::Playing);
    game.take_outgoing();
    (uids, now)
}

/// Advances frame by frame with every connection answering each frame
fn play(game: &mut Game, conns: &[u32], from: u64, to: u64) -> u64 {
    let mut now = from;
    while now < to && game.state() == GameState::Playing {
        now += 100;
        game.update(now);
        for &conn in conns {
            send(game, conn, &w3gs::outgoing_keepalive(7), now);
        }
    }
    now
}

fn sent_ids(outgoing: &[Outgoing], conn: u32) -> Vec<u8> {
    outgoing
        .iter()
        .filter_map(|o| match o {
            Outgoing::Send { conn: c, data } if *c == conn => data.get(1).copied(),
            _ => None,
        })
        .collect()
}

fn chats_containing(outgoing: &[Outgoing], conn: u32, text: &str) -> usize {
    outgoing
        .iter()
        .filter(|o| match o {
            Outgoing::Send { conn: c, data } => {
                *c == conn
                    && data.get(1) == Some(&id::CHAT_FROM_HOST)
                    && data.windows(text.len()).any(|w| w == text.as_bytes())
            }
            _ => false,
        })
        .count()
}

mod protocol_tests {
    use super::*;

    /// A joiner learns about the lobby before anything else
    #[test]
    fn test_join_handshake_order() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        join(&mut game, 1, "Grubby", 0);
        let ids = sent_ids(&game.take_outgoing(), 1);

        assert_eq!(ids[0], id::SLOTINFOJOIN);
        assert_eq!(ids[1], id::PLAYERINFO);
        let mapcheck = ids.iter().position(|&i| i == id::MAPCHECK).expect("map check sent");
        let slotinfo = ids.iter().position(|&i| i == id::SLOTINFO).expect("slot info sent");
        assert!(mapcheck < slotinfo);
    }

    #[test]
    fn test_wrong_entry_key_rejected() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let packet = w3gs::req_join(game.host_counter(), ENTRY_KEY ^ 1, "Grubby", 6112).unwrap();
        send(&mut game, 1, &packet, 0);

        let outgoing = game.take_outgoing();
        assert!(outgoing.contains(&Outgoing::Send {
            conn: 1,
            data: w3gs::reject_join(RejectReason::WrongPassword),
        }));
        assert!(outgoing.contains(&Outgoing::Close { conn: 1 }));
        assert_eq!(game.num_users(), 0);
    }

    #[test]
    fn test_stale_host_counter_rejected() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let packet = w3gs::req_join(game.host_counter() + 1, ENTRY_KEY, "Grubby", 6112).unwrap();
        send(&mut game, 1, &packet, 0);

        assert!(game.take_outgoing().contains(&Outgoing::Send {
            conn: 1,
            data: w3gs::reject_join(RejectReason::Started),
        }));
    }

    /// Actions from both players arrive in one batch, in arrival order
    #[test]
    fn test_actions_batched_per_frame() {
        let config = GameConfig {
            ping_equalizer_enabled: false,
            ..GameConfig::default()
        };
        let mut game = new_game(config, melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let (uids, now) = start(&mut game, &["Grubby", "Moon"]);

        send(&mut game, 2, &w3gs::outgoing_action(&[0x11, 0x01]).unwrap(), now + 10);
        send(&mut game, 1, &w3gs::outgoing_action(&[0x12, 0x02]).unwrap(), now + 20);
        game.update(now + 100);

        let frame = game
            .take_outgoing()
            .into_iter()
            .find_map(|o| match o {
                Outgoing::Send { conn: 1, data } if data[1] == id::INCOMING_ACTION => Some(data),
                _ => None,
            })
            .expect("frame sent");
        let batch = w3gs::parse_action_batch(&frame).unwrap();
        assert_eq!(batch.send_interval, Some(100));
        let order: Vec<u8> = batch.actions.iter().map(|a| a.uid).collect();
        assert_eq!(order, vec![uids[1], uids[0]]);
    }

    /// An action too large for a relay packet is dropped, never relayed with a bogus length
    #[test]
    fn test_oversized_action_not_relayed() {
        let config = GameConfig {
            ping_equalizer_enabled: false,
            ..GameConfig::default()
        };
        let mut game = new_game(config, melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let (uids, now) = start(&mut game, &["Grubby", "Moon"]);

        let huge = vec![0x10; u16::MAX as usize - 8];
        send(&mut game, 1, &w3gs::outgoing_action(&huge).unwrap(), now + 10);
        send(&mut game, 2, &w3gs::outgoing_action(&[0x11, 0x01]).unwrap(), now + 20);
        game.update(now + 100);

        let outgoing = game.take_outgoing();
        let mut relayed = Vec::new();
        for o in &outgoing {
            if let Outgoing::Send { data, .. } = o {
                if data[1] == id::INCOMING_ACTION || data[1] == id::INCOMING_ACTION2 {
                    assert_eq!(u16::from_le_bytes([data[2], data[3]]) as usize, data.len());
                    relayed.extend(w3gs::parse_action_batch(data).unwrap().actions);
                }
            }
        }
        assert!(relayed.iter().all(|a| a.uid == uids[1]));
        assert!(!relayed.is_empty());
        assert!(!outgoing.contains(&Outgoing::Close { conn: 1 }));
    }

    /// Garbage from one socket closes it without touching the others
    #[test]
    fn test_malformed_packet_closes_connection() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        join(&mut game, 1, "Grubby", 0);
        join(&mut game, 2, "Moon", 0);
        game.take_outgoing();

        send(&mut game, 2, &[w3gs::W3GS_HEADER, id::MAPSIZE, 4, 0], 10);
        let outgoing = game.take_outgoing();
        assert!(outgoing.contains(&Outgoing::Close { conn: 2 }));
        assert!(!outgoing.contains(&Outgoing::Close { conn: 1 }));
        assert!(game.user_by_name("Grubby").is_some());
    }
}

mod lobby_tests {
    use super::*;

    #[test]
    fn test_countdown_moves_lobby_to_loading() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        start(&mut game, &["Grubby", "Moon"]);
        let events = game.take_events();
        assert!(events.contains(&GameEvent::Started));
        assert!(game.virtual_host_uid().is_none());
    }

    #[test]
    fn test_countdown_waits_for_map() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        join(&mut game, 1, "Grubby", 0);
        ready(&mut game, 1, 0);
        join(&mut game, 2, "Moon", 0);

        let refusal = game.start_countdown(false, 5_000).unwrap_err();
        assert_eq!(refusal, CountdownRefusal::Downloading(vec!["Moon".to_string()]));
        assert!(!game.is_countdown_active());
        assert_eq!(chats_containing(&game.take_outgoing(), 1, "Countdown refused"), 1);
    }

    /// A taken color is not stolen without force and nothing is broadcast
    #[test]
    fn test_set_slot_color_refused() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        join(&mut game, 1, "Grubby", 0);
        join(&mut game, 2, "Moon", 0);
        game.take_outgoing();

        let before: Vec<u8> = game.slots().slots().iter().map(|s| s.color).collect();
        assert!(!game.set_slot_color(0, 1, false));
        let after: Vec<u8> = game.slots().slots().iter().map(|s| s.color).collect();
        assert_eq!(before, after);
        assert!(game.take_outgoing().is_empty());
    }

    /// Closing a slot that would leave nobody able to join refuses before kicking
    #[test]
    fn test_refused_close_keeps_occupant_connected() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let grubby = join(&mut game, 1, "Grubby", 0);
        let moon = join(&mut game, 2, "Moon", 0);
        let grubby_sid = game.slots().find_by_uid(grubby).unwrap();
        let moon_sid = game.slots().find_by_uid(moon).unwrap();
        for sid in (0..4).filter(|&s| s != grubby_sid && s != moon_sid) {
            assert!(game.close_slot(sid, false, 0));
        }
        assert!(game.close_slot(grubby_sid, true, 10));
        assert!(game.user(grubby).is_none());
        game.take_outgoing();

        let before = game.slots().slots().to_vec();
        assert!(!game.close_slot(moon_sid, true, 20));
        assert!(game.user(moon).is_some());
        assert_eq!(game.slots().slots(), &before[..]);
        let outgoing = game.take_outgoing();
        assert!(!outgoing.contains(&Outgoing::Close { conn: 2 }));
        assert!(outgoing.is_empty());
    }

    #[test]
    fn test_lobby_leave_frees_slot() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        join(&mut game, 1, "Grubby", 0);
        let moon = join(&mut game, 2, "Moon", 0);
        game.take_outgoing();

        send(&mut game, 2, &w3gs::leave_game(LeaveCode::Lobby), 100);
        assert!(game.user(moon).is_none());
        assert!(game.slots().find_by_uid(moon).is_none());
        let outgoing = game.take_outgoing();
        assert!(sent_ids(&outgoing, 1).contains(&id::PLAYERLEAVE_OTHERS));
        assert_eq!(game.bannable_history().filter(|b| b.name == "Moon").count(), 1);

        // the slot is usable again straight away
        join(&mut game, 3, "Sky", 200);
    }

    #[test]
    fn test_search_reply_only_while_joinable() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let reply = game.game_info_reply(0).expect("lobby answers searches");
        assert_eq!(reply[1], id::GAMEINFO);
        start(&mut game, &["Grubby", "Moon"]);
        assert!(game.game_info_reply(20_000).is_none());
    }
}

mod playing_tests {
    use super::*;

    #[test]
    fn test_desync_notified_once() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let (uids, now) = start(&mut game, &["Grubby", "Moon"]);

        for frame in 0..5u32 {
            send(&mut game, 1, &w3gs::outgoing_keepalive(frame), now);
            send(&mut game, 2, &w3gs::outgoing_keepalive(frame ^ 0xFF), now);
        }
        assert!(game.is_desynced());
        assert!(!game.is_synced(uids[0], uids[1]));
        let outgoing = game.take_outgoing();
        assert_eq!(chats_containing(&outgoing, 1, "Desync detected"), 1);
        assert_eq!(chats_containing(&outgoing, 2, "Desync detected"), 1);
        // the default handler keeps everyone in
        assert_eq!(game.num_users(), 2);
    }

    #[test]
    fn test_desync_drop_handler_removes_outlier() {
        let config = GameConfig {
            desync_handler: DesyncHandler::Drop,
            ..GameConfig::default()
        };
        let mut game = new_game(config, melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let (_, now) = start(&mut game, &["Grubby", "Moon", "Sky"]);
        send(&mut game, 1, &w3gs::outgoing_keepalive(9), now);
        send(&mut game, 2, &w3gs::outgoing_keepalive(9), now);
        send(&mut game, 3, &w3gs::outgoing_keepalive(3), now);

        assert!(game.user_by_name("Sky").is_none());
        assert_eq!(chats_containing(&game.take_outgoing(), 1, "was dropped after desyncing"), 1);
    }

    /// An extended GProxy client that never comes back is dropped after
    /// the long grace period, and the remaining player wins by default
    #[test]
    fn test_gproxy_extended_grace_period() {
        let config = GameConfig {
            connection_timeout_secs: 600,
            ping_equalizer_enabled: false,
            ..GameConfig::default()
        };
        let mut game = new_game(config, melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let (uids, now) = start(&mut game, &["Grubby", "Moon"]);
        send(&mut game, 2, &gps::client_init(2), now);
        send(&mut game, 2, &gps::client_support_extended(180), now);
        assert!(game.user(uids[1]).unwrap().uses_gproxy_extended());

        game.connection_closed(2, now + 1_000);
        assert!(game.user(uids[1]).is_some());
        assert!(game.is_lagging());
        let outgoing = game.take_outgoing();
        assert_eq!(chats_containing(&outgoing, 1, "has disconnected, waiting 180 seconds"), 1);
        assert!(sent_ids(&outgoing, 1).contains(&id::START_LAG));

        game.update(now + 120_000);
        assert!(game.user(uids[1]).is_some());
        game.update(now + 181_000);
        assert!(game.user(uids[1]).is_none());
        assert_eq!(chats_containing(&game.take_outgoing(), 1, "failed to reconnect within 180 seconds"), 1);
        assert_eq!(game.state(), GameState::Over);
    }

    #[test]
    fn test_remake_after_everyone_leaves_loading() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        for (conn, name) in [(1u32, "Grubby"), (2, "Moon")] {
            join(&mut game, conn, name, 0);
            ready(&mut game, conn, 0);
        }
        game.start_countdown(false, 1_000).unwrap();
        let mut now = 1_000;
        while game.state() == GameState::Lobby {
            game.update(now);
            now += 500;
        }
        let counter = game.host_counter();
        send(&mut game, 1, &w3gs::leave_game(LeaveCode::Lost), now);
        send(&mut game, 2, &w3gs::leave_game(LeaveCode::Lost), now);

        assert_eq!(game.state(), GameState::Lobby);
        assert_eq!(game.remake_count(), 1);
        assert!(game.take_events().contains(&GameEvent::Remade));

        // the orchestrator hands out a new identity before anyone rejoins
        game.set_identity(counter + 1, game.game_id() + 1).unwrap();
        game.connection_closed(1, now + 100);
        game.connection_closed(2, now + 100);
        assert!(!game.is_lobby_loading());
        join(&mut game, 3, "Grubby", now + 200);
        assert_eq!(game.host_counter(), counter + 1);
    }

    #[test]
    fn test_game_over_writes_records() {
        let shared: SharedPersistence<MemoryPersistence> = Arc::new(Mutex::new(MemoryPersistence::new()));
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(shared.clone()));
        let (_, now) = start(&mut game, &["Grubby", "Moon"]);
        let now = play(&mut game, &[1, 2], now, now + 2_000);

        send(&mut game, 2, &w3gs::leave_game(LeaveCode::Lost), now);
        game.update(now);
        assert_eq!(game.state(), GameState::Over);
        game.update(now + 61_000);
        assert!(game.is_exiting());
        assert!(game.take_events().contains(&GameEvent::Ended { game_id: game.game_id() }));

        let store = shared.lock().unwrap();
        assert_eq!(store.records.games.len(), 1);
        let grubby = store.records.players.iter().find(|p| p.name == "Grubby").unwrap();
        assert_eq!(grubby.left_reason, "stayed until the end");
    }

    #[test]
    fn test_shutdown_closes_everyone() {
        let mut game = new_game(GameConfig::default(), melee_map(StatsKind::None), Box::new(MemoryPersistence::new()));
        let (_, now) = start(&mut game, &["Grubby", "Moon"]);
        game.shutdown(now + 500);
        let outgoing = game.take_outgoing();
        assert!(outgoing.contains(&Outgoing::Close { conn: 1 }));
        assert!(outgoing.contains(&Outgoing::Close { conn: 2 }));
        assert!(game.is_exiting());
    }
}

mod stats_tests {
    use super::*;

    /// The winner flag travels through the action relay and ends the game
    #[test]
    fn test_w3mmd_winner_ends_game() {
        let config = GameConfig {
            mmd_initial_delay_ms: 0,
            mmd_definition_delay_ms: 200,
            mmd_action_delay_ms: 300,
            ping_equalizer_enabled: false,
            ..GameConfig::default()
        };
        let mut game = new_game(config, melee_map(StatsKind::W3mmd), Box::new(MemoryPersistence::new()));
        let (_, now) = start(&mut game, &["Grubby", "Moon"]);

        for (i, key) in ["init pid 0 Grubby", "init pid 1 Moon", "FlagP 0 winner", "FlagP 1 loser"].iter().enumerate() {
            let packet = w3mmd::encode_packet(&format!("val:{}", i), key, 0);
            send(&mut game, 1, &w3gs::outgoing_action(&packet).unwrap(), now);
        }
        play(&mut game, &[1, 2], now, now + 5_000);

        assert_eq!(game.state(), GameState::Over);
        match game.stats() {
            Some(StatsCollector::W3mmd(mmd)) => assert_eq!(mmd.winners(), vec!["Grubby".to_string()]),
            _ => panic!("W3MMD collector expected"),
        }
    }

    #[test]
    fn test_dota_records_from_actions() {
        let mut dota = DotaStats::new("dota -ap");
        let players = |color: u8| color == 1 || color == 7;
        let mut data = dota_stats::encode_packet("Data", "Hero7", 1);
        data.extend(dota_stats::encode_packet("1", "3", 25));
        assert!(!dota.process_action(&data, players));
        assert!(dota.process_action(&dota_stats::encode_packet("Global", "Winner", 1), players));
        assert_eq!(dota.winner(), 1);

        let sentinel = dota.player(1).unwrap();
        assert_eq!(sentinel.kills, 1);
        assert_eq!(sentinel.creep_kills, 25);
        assert_eq!(dota.player(7).unwrap().deaths, 1);
    }
}

mod network_tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    async fn spawn_server() -> (SocketAddr, u32, Arc<AppContext>, tokio::task::JoinHandle<Result<(), server::error::GameError>>) {
        let config = ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            discovery_port: 0,
            broadcast_address: "127.0.0.1:9".parse().unwrap(),
            ..ServerConfig::default()
        };
        let mut setup = GameSetup::new("network", melee_map(StatsKind::None));
        setup.entry_key = ENTRY_KEY;
        let context = Arc::new(AppContext::new());
        let mut server = Server::new(config, setup, Box::new(MemoryPersistence::new()), Arc::clone(&context))
            .await
            .unwrap();
        let addr = server.local_addr();
        let host_counter = server.game().host_counter();
        let handle = tokio::spawn(async move { server.run().await });
        (addr, host_counter, context, handle)
    }

    /// A bad entry key gets a reject packet and then the socket is closed
    #[tokio::test]
    async fn test_rejected_join_over_tcp() {
        let (addr, host_counter, context, handle) = spawn_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = w3gs::req_join(host_counter, ENTRY_KEY ^ 1, "Grubby", 6112).unwrap();
        assert_ok!(stream.write_all(&request).await);

        let expected = w3gs::reject_join(RejectReason::WrongPassword);
        let mut reply = vec![0u8; expected.len()];
        assert_ok!(timeout(Duration::from_secs(5), stream.read_exact(&mut reply)).await.unwrap());
        assert_eq!(reply, expected);

        let mut rest = [0u8; 16];
        let read = timeout(Duration::from_secs(5), stream.read(&mut rest)).await.unwrap();
        assert_eq!(read.unwrap_or(0), 0);

        context.request_exit();
        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
