//! End-to-end session flows over the in-process loopback transport:
//! join handshake, mid-game bootstrap, command relay, desync repair and
//! teardown. Time is simulated throughout, so deadlines and retransmits
//! behave identically on every run.

mod common;

use common::{
    command_registry, component_registry, handlers, initial_state, thrust, SET_THRUST,
};
use trailstate::{
    CommandHandlers, ComponentRegistry, EngineConfig, Frame, LoopbackSocket, Packet, Session,
    SessionEvent, SessionState, TrailingStateSync, Vec2,
};
use web_time::{Duration, Instant};

struct Peer {
    session: Session,
    tss: TrailingStateSync,
}

impl Peer {
    fn poll(&mut self, now: Instant, handlers: &CommandHandlers, components: &ComponentRegistry) {
        self.session.poll(now, &mut self.tss, handlers, components);
    }

    fn events(&mut self) -> Vec<SessionEvent> {
        self.session.events().collect()
    }
}

fn host_peer(config: &EngineConfig) -> Peer {
    let session = Session::host(
        Box::new(LoopbackSocket::bind_auto()),
        config.clone(),
        command_registry(),
        "host",
        b"flagship".to_vec(),
    );
    let tss = TrailingStateSync::new(
        config.trailing_delays.clone(),
        config.hash_cadence,
        initial_state(),
    )
    .expect("valid config");
    Peer { session, tss }
}

fn joining_peer(config: &EngineConfig, host: &Peer, name: &str, now: Instant) -> Peer {
    let session = Session::join(
        Box::new(LoopbackSocket::bind_auto()),
        config.clone(),
        command_registry(),
        host.session.local_addr(),
        name,
        b"skiff".to_vec(),
        now,
    );
    let tss = TrailingStateSync::new_waiting(
        config.trailing_delays.clone(),
        config.hash_cadence,
        initial_state(),
    )
    .expect("valid config");
    Peer { session, tss }
}

/// Polls every peer `rounds` times, advancing simulated time between
/// rounds; returns the time after the last round.
fn pump(
    peers: &mut [&mut Peer],
    mut now: Instant,
    rounds: usize,
    handlers: &CommandHandlers,
    components: &ComponentRegistry,
) -> Instant {
    for _ in 0..rounds {
        for peer in peers.iter_mut() {
            peer.poll(now, handlers, components);
        }
        now += Duration::from_millis(20);
    }
    now
}

/// A host at `host_frames` and a freshly bootstrapped client.
fn joined_pair(
    config: &EngineConfig,
    host_frames: usize,
) -> (Peer, Peer, CommandHandlers, ComponentRegistry, Instant) {
    common::init_tracing();
    let handlers = handlers();
    let components = component_registry();
    let now = Instant::now();

    let mut host = host_peer(config);
    for _ in 0..host_frames {
        host.tss.step(&handlers);
    }

    let mut client = joining_peer(config, &host, "client", now);
    let now = pump(&mut [&mut host, &mut client], now, 8, &handlers, &components);

    assert_eq!(client.session.state(), SessionState::Client);
    assert!(!client.tss.is_waiting_for_sync());
    (host, client, handlers, components, now)
}

#[test]
fn join_mid_game_bootstraps_to_the_leading_frame() {
    let config = EngineConfig {
        trailing_delays: vec![0, 10],
        ..EngineConfig::default()
    };
    let (mut host, mut client, _handlers, _components, _now) = joined_pair(&config, 100);

    // assigned id and roster on both sides
    assert_eq!(client.session.local_id().as_i32(), 1);
    assert_eq!(client.session.players().len(), 2);
    assert_eq!(host.session.players().len(), 2);

    let client_events = client.events();
    assert!(client_events
        .iter()
        .any(|e| matches!(e, SessionEvent::JoinAccepted { .. })));
    let host_events = host.events();
    assert!(host_events
        .iter()
        .any(|e| matches!(e, SessionEvent::PlayerJoined { player } if player.name == "client")));

    // the snapshot carried the world to the host's frame
    assert_eq!(client.tss.leading_frame(), host.tss.leading_frame());
    assert_eq!(client.tss.leading_frame(), Frame::new(100));
    assert_eq!(client.tss.deepest().hash(), host.tss.deepest().hash());
}

#[test]
fn full_session_refuses_with_reason() {
    let config = EngineConfig {
        max_players: 1, // host only
        ..EngineConfig::default()
    };
    let handlers = handlers();
    let components = component_registry();
    let now = Instant::now();

    let mut host = host_peer(&config);
    let mut client = joining_peer(&config, &host, "late", now);
    pump(&mut [&mut host, &mut client], now, 6, &handlers, &components);

    assert_eq!(client.session.state(), SessionState::Unconnected);
    let events = client.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::JoinFailed { reason } if reason == "full")));
}

#[test]
fn join_times_out_against_a_silent_host() {
    let config = EngineConfig::default();
    let handlers = handlers();
    let components = component_registry();
    let now = Instant::now();

    // a bound but never-polled endpoint: datagrams vanish into its inbox
    let silent = LoopbackSocket::bind_auto();
    let silent_addr = LoopbackSocket::addr_for(silent.port());
    let mut client = Peer {
        session: Session::join(
            Box::new(LoopbackSocket::bind_auto()),
            config.clone(),
            command_registry(),
            silent_addr,
            "nobody",
            Vec::new(),
            now,
        ),
        tss: TrailingStateSync::new_waiting(
            config.trailing_delays.clone(),
            config.hash_cadence,
            initial_state(),
        )
        .expect("valid config"),
    };

    client.poll(now + Duration::from_secs(1), &handlers, &components);
    assert_eq!(client.session.state(), SessionState::Joining);

    client.poll(now + Duration::from_secs(11), &handlers, &components);
    assert_eq!(client.session.state(), SessionState::Unconnected);
    let events = client.events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::JoinFailed { .. }))
            .count(),
        1,
        "the failure is reported exactly once"
    );
}

#[test]
fn client_commands_are_confirmed_and_replicated() {
    let config = EngineConfig {
        trailing_delays: vec![0, 8],
        ..EngineConfig::default()
    };
    let (mut host, mut client, handlers, components, now) = joined_pair(&config, 50);

    // the client asks to thrust five frames ahead of its leading state
    let frame = client.tss.leading_frame() + 5;
    let mut payload = Packet::new();
    payload.write_vec2(Vec2::from_ints(2, 1));
    client
        .session
        .send_command(
            SET_THRUST,
            frame,
            payload.into_bytes(),
            &mut client.tss,
            &handlers,
            now,
        )
        .expect("command accepted");

    // relay: client -> host (confirm) -> everyone
    let now = pump(&mut [&mut host, &mut client], now, 4, &handlers, &components);

    // both replicas execute the command and agree afterwards
    for _ in 0..20 {
        host.tss.step(&handlers);
        client.tss.step(&handlers);
    }
    pump(&mut [&mut host, &mut client], now, 2, &handlers, &components);

    assert_eq!(host.tss.deepest().hash(), client.tss.deepest().hash());
    let host_pos = common::hull_position(host.tss.leading());
    assert_eq!(host_pos, common::hull_position(client.tss.leading()));
    assert_ne!(host_pos, (0, 0), "the thrust moved the hull");
}

#[test]
fn desync_is_detected_and_repaired_by_snapshot() {
    let config = EngineConfig {
        trailing_delays: vec![0, 4],
        hash_cadence: 8,
        ..EngineConfig::default()
    };
    let (mut host, mut client, handlers, components, mut now) = joined_pair(&config, 16);

    // silently diverge the host: this command never reaches the client
    let frame = host.tss.leading_frame() + 2;
    host.tss
        .inject(thrust(0, frame.as_i64(), 9, 9).into_authoritative(), &handlers)
        .expect("on time");

    // step until the next digest broadcast exposes the divergence
    let mut detected = false;
    for _ in 0..64 {
        host.tss.step(&handlers);
        client.tss.step(&handlers);
        now = pump(&mut [&mut host, &mut client], now, 1, &handlers, &components);
        if client.tss.is_recovering() {
            detected = true;
            break;
        }
    }
    assert!(detected, "digest exchange must notice the divergence");
    assert_eq!(client.session.state(), SessionState::Client);

    // let the snapshot round-trip finish without stepping further
    for _ in 0..8 {
        now = pump(&mut [&mut host, &mut client], now, 1, &handlers, &components);
        if !client.tss.is_recovering() {
            break;
        }
    }
    assert!(!client.tss.is_recovering(), "one round-trip repairs the client");
    assert_eq!(client.session.state(), SessionState::Client);

    // realign the replicas and verify they agree again
    while client.tss.leading_frame() < host.tss.leading_frame() {
        client.tss.step(&handlers);
    }
    for _ in 0..12 {
        host.tss.step(&handlers);
        client.tss.step(&handlers);
    }
    assert_eq!(host.tss.deepest().hash(), client.tss.deepest().hash());
}

#[test]
fn client_leave_shrinks_the_roster() {
    let config = EngineConfig::default();
    let (mut host, mut client, handlers, components, now) = joined_pair(&config, 10);
    let client_id = client.session.local_id();

    client.session.leave(now);
    assert_eq!(client.session.state(), SessionState::Unconnected);
    let client_events = client.events();
    assert!(client_events
        .iter()
        .any(|e| matches!(e, SessionEvent::Disconnected { reason } if reason == "leave")));

    pump(&mut [&mut host, &mut client], now, 4, &handlers, &components);
    assert_eq!(host.session.players().len(), 1);
    let host_events = host.events();
    assert!(host_events
        .iter()
        .any(|e| matches!(e, SessionEvent::PlayerLeft { id } if *id == client_id)));
}

#[test]
fn host_close_disconnects_clients() {
    let config = EngineConfig::default();
    let (mut host, mut client, handlers, components, now) = joined_pair(&config, 10);

    host.session.leave(now);
    assert_eq!(host.session.state(), SessionState::HostClosed);

    pump(&mut [&mut host, &mut client], now, 4, &handlers, &components);
    assert_eq!(client.session.state(), SessionState::Unconnected);
    let events = client.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Disconnected { reason } if reason == "host closed")));
}

#[test]
fn two_clients_see_each_other_join() {
    let config = EngineConfig::default();
    let handlers = handlers();
    let components = component_registry();
    let now = Instant::now();

    let mut host = host_peer(&config);
    for _ in 0..20 {
        host.tss.step(&handlers);
    }

    let mut first = joining_peer(&config, &host, "first", now);
    let now = pump(&mut [&mut host, &mut first], now, 8, &handlers, &components);
    assert_eq!(first.session.state(), SessionState::Client);
    let _ = first.events();

    let mut second = joining_peer(&config, &host, "second", now);
    pump(
        &mut [&mut host, &mut first, &mut second],
        now,
        8,
        &handlers,
        &components,
    );
    assert_eq!(second.session.state(), SessionState::Client);

    // the earlier client learned about the newcomer via PlayerJoined
    let events = first.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::PlayerJoined { player } if player.name == "second")));
    assert_eq!(first.session.players().len(), 3);
    assert_eq!(second.session.players().len(), 3);
}
