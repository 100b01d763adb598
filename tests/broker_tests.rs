//! Integration tests for the session broker with channel-backed
//! connections standing in for real WebSockets.

use std::sync::Arc;

use axum::extract::ws::Message;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use agenthq::api::protocol::{BrowserEvent, BrowserMessage, DaemonCommand, DaemonMessage};
use agenthq::config::ConfigStore;
use agenthq::core::{
    Broker, BrokerError, EnvironmentConfig, EnvironmentStatus, EnvironmentType, ProcessStatus,
    Repo, SpawnSpec,
};

const QUEUE: usize = 256;

struct TestConn {
    conn_id: Uuid,
    rx: mpsc::Receiver<Message>,
}

fn new_broker() -> (Arc<Broker>, TempDir) {
    let dir = TempDir::new().expect("temp workspace");
    let config = Arc::new(ConfigStore::load(dir.path()).expect("config store"));
    (Arc::new(Broker::new(config)), dir)
}

fn connect_daemon(broker: &Broker) -> TestConn {
    let (tx, rx) = mpsc::channel(QUEUE);
    let conn_id = broker.daemon_connected(tx);
    TestConn { conn_id, rx }
}

fn connect_browser(broker: &Broker) -> TestConn {
    let (tx, rx) = mpsc::channel(QUEUE);
    let conn_id = broker.browser_connected(tx);
    TestConn { conn_id, rx }
}

fn register(broker: &Broker, daemon: &TestConn, env_id: &str, env_name: &str) {
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::Register {
            env_id: env_id.to_string(),
            env_name: env_name.to_string(),
            capabilities: vec!["git".to_string()],
            workspace: None,
        },
    );
}

/// Drain everything currently queued on a connection.
fn drain(conn: &mut TestConn) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(message) = conn.rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn browser_events(conn: &mut TestConn) -> Vec<BrowserEvent> {
    drain(conn)
        .into_iter()
        .filter_map(|message| match message {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        })
        .collect()
}

fn daemon_commands(conn: &mut TestConn) -> Vec<DaemonCommand> {
    drain(conn)
        .into_iter()
        .filter_map(|message| match message {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        })
        .collect()
}

fn seed_local_repo(broker: &Broker) -> Repo {
    let repo = Repo {
        name: "alpha".to_string(),
        path: "/w/alpha".to_string(),
        default_branch: "main".to_string(),
        env_id: None,
    };
    broker.repos.replace_for_env("local", vec![repo]);
    broker.repos.get("alpha").expect("seeded repo")
}

/// Registered local daemon plus a ready worktree, the common fixture for
/// spawn-path tests.
fn local_fixture(broker: &Broker) -> (TestConn, String) {
    let mut daemon = connect_daemon(broker);
    register(broker, &daemon, "", "Local");
    let repo = seed_local_repo(broker);
    let worktree = broker.worktrees.register_main(&repo);
    let _ = drain(&mut daemon);
    (daemon, worktree.id)
}

fn spawn_spec(cols: u16, rows: u16) -> SpawnSpec {
    SpawnSpec {
        agent: "claude".to_string(),
        task: None,
        cols,
        rows,
        yolo_mode: false,
    }
}

#[test]
fn daemon_replace_closes_the_first_socket() {
    let (broker, _dir) = new_broker();
    broker
        .config
        .add_environment(EnvironmentConfig {
            id: "env-A".to_string(),
            name: "alpha".to_string(),
            env_type: EnvironmentType::Local,
            vm_name: None,
            workspace_path: None,
        })
        .unwrap();

    let mut d1 = connect_daemon(&broker);
    register(&broker, &d1, "", "alpha");
    assert!(broker.daemons.is_connected("env-A"));

    let mut browser = connect_browser(&broker);
    let initial = browser_events(&mut browser);
    assert!(matches!(initial.first(), Some(BrowserEvent::EnvUpdate { environments })
        if environments.iter().any(|env| env.id == "env-A" && env.status == EnvironmentStatus::Connected)));

    let mut d2 = connect_daemon(&broker);
    register(&broker, &d2, "", "alpha");

    // D1's socket was closed with code 1000.
    let d1_messages = drain(&mut d1);
    assert!(d1_messages.iter().any(|message| matches!(
        message,
        Message::Close(Some(frame)) if frame.code == 1000
    )));

    // Exactly one env-update was broadcast after the swap.
    let after_swap = browser_events(&mut browser);
    let env_updates = after_swap
        .iter()
        .filter(|event| matches!(event, BrowserEvent::EnvUpdate { .. }))
        .count();
    assert_eq!(env_updates, 1);

    // D2 is the live connection: commands reach it, not D1.
    assert!(broker.send_command("env-A", &DaemonCommand::ListRepos));
    assert!(daemon_commands(&mut d2)
        .iter()
        .any(|command| matches!(command, DaemonCommand::ListRepos)));
    assert!(drain(&mut d1).is_empty());

    // The stale socket's close must not cascade the replacement.
    broker.daemon_closed(d1.conn_id);
    assert!(broker.daemons.is_connected("env-A"));
}

#[test]
fn attach_replays_the_buffer_before_live_frames() {
    let (broker, _dir) = new_broker();
    let (daemon, worktree_id) = local_fixture(&broker);

    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::PtyData {
            process_id: process.id.clone(),
            data: BASE64_STANDARD.encode(b"hello"),
        },
    );

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser); // initial sync

    broker.browser_message(
        browser.conn_id,
        BrowserMessage::Attach {
            process_id: process.id.clone(),
            skip_buffer: false,
        },
    );

    let events = browser_events(&mut browser);
    assert!(matches!(&events[0], BrowserEvent::PtyData { process_id, data }
        if *process_id == process.id && data == "hello"));
    assert!(matches!(&events[1], BrowserEvent::ProcessUpdate { process: p }
        if p.id == process.id && p.status == ProcessStatus::Running));

    // Live frames arrive after the replay, in daemon order.
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::PtyData {
            process_id: process.id.clone(),
            data: BASE64_STANDARD.encode(b" world"),
        },
    );
    let live = browser_events(&mut browser);
    assert!(matches!(&live[0], BrowserEvent::PtyData { data, .. } if data == " world"));
}

#[test]
fn attach_to_an_empty_buffer_still_replays() {
    let (broker, _dir) = new_broker();
    let (_daemon, worktree_id) = local_fixture(&broker);
    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);

    broker.browser_message(
        browser.conn_id,
        BrowserMessage::Attach {
            process_id: process.id.clone(),
            skip_buffer: false,
        },
    );

    // No output yet: the snapshot frame is still delivered, just empty.
    let events = browser_events(&mut browser);
    assert!(matches!(&events[0], BrowserEvent::PtyData { process_id, data }
        if *process_id == process.id && data.is_empty()));
    assert!(matches!(&events[1], BrowserEvent::ProcessUpdate { process: p } if p.id == process.id));
    assert_eq!(events.len(), 2);
}

#[test]
fn attach_with_skip_buffer_omits_the_replay() {
    let (broker, _dir) = new_broker();
    let (daemon, worktree_id) = local_fixture(&broker);

    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::PtyData {
            process_id: process.id.clone(),
            data: BASE64_STANDARD.encode(b"hello"),
        },
    );

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);

    broker.browser_message(
        browser.conn_id,
        BrowserMessage::Attach {
            process_id: process.id.clone(),
            skip_buffer: true,
        },
    );

    let events = browser_events(&mut browser);
    assert!(matches!(&events[0], BrowserEvent::ProcessUpdate { .. }));
    assert_eq!(events.len(), 1);
}

#[test]
fn spawn_rollback_on_dead_daemon_socket() {
    let (broker, _dir) = new_broker();
    let (daemon, worktree_id) = local_fixture(&broker);

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);

    // Socket dies between record creation and send: dropping the receiver
    // makes the enqueue fail while the registry still lists the daemon.
    drop(daemon.rx);

    let result = broker.spawn_process(&worktree_id, spawn_spec(80, 24));
    assert!(matches!(result, Err(BrokerError::Transport(_))));

    // The record created in this request no longer exists.
    assert!(broker.processes.list().is_empty());

    // No process-update was broadcast.
    let events = browser_events(&mut browser);
    assert!(!events
        .iter()
        .any(|event| matches!(event, BrowserEvent::ProcessUpdate { .. })));
}

#[test]
fn disconnect_cascade_stops_processes_and_keeps_buffers() {
    let (broker, _dir) = new_broker();
    let (daemon, worktree_id) = local_fixture(&broker);

    let p1 = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();
    let p2 = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::ProcessStarted {
            process_id: p1.id.clone(),
        },
    );
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::PtyData {
            process_id: p1.id.clone(),
            data: BASE64_STANDARD.encode(b"final output"),
        },
    );

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);

    broker.daemon_closed(daemon.conn_id);

    for id in [&p1.id, &p2.id] {
        let process = broker.processes.get(id).unwrap();
        assert_eq!(process.status, ProcessStatus::Stopped);
        assert_eq!(process.exit_code, None);
    }

    let events = browser_events(&mut browser);
    let process_updates = events
        .iter()
        .filter(|event| matches!(event, BrowserEvent::ProcessUpdate { .. }))
        .count();
    assert_eq!(process_updates, 2);

    let disconnected = events.iter().any(|event| matches!(
        event,
        BrowserEvent::EnvUpdate { environments }
            if environments.iter().any(|env| env.id == "local" && env.status == EnvironmentStatus::Disconnected)
    ));
    assert!(disconnected);

    // Buffers survive the cascade for detached browsers.
    assert_eq!(broker.processes.buffer_snapshot(&p1.id), b"final output");
}

#[test]
fn pty_frames_arrive_in_order_and_match_the_buffer() {
    let (broker, _dir) = new_broker();
    let (daemon, worktree_id) = local_fixture(&broker);
    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);
    broker.browser_message(
        browser.conn_id,
        BrowserMessage::Attach {
            process_id: process.id.clone(),
            skip_buffer: true,
        },
    );
    let _ = browser_events(&mut browser);

    for chunk in ["a", "b", "c"] {
        broker.daemon_message(
            daemon.conn_id,
            DaemonMessage::PtyData {
                process_id: process.id.clone(),
                data: BASE64_STANDARD.encode(chunk.as_bytes()),
            },
        );
    }

    let received: Vec<String> = browser_events(&mut browser)
        .into_iter()
        .filter_map(|event| match event {
            BrowserEvent::PtyData { data, .. } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec!["a", "b", "c"]);
    assert_eq!(broker.processes.buffer_snapshot(&process.id), b"abc");
}

#[test]
fn terminal_size_floor() {
    let (broker, _dir) = new_broker();
    let (_daemon, worktree_id) = local_fixture(&broker);

    assert!(matches!(
        broker.spawn_process(&worktree_id, spawn_spec(19, 5)),
        Err(BrokerError::Validation(_))
    ));
    assert!(matches!(
        broker.spawn_process(&worktree_id, spawn_spec(20, 4)),
        Err(BrokerError::Validation(_))
    ));
    assert!(broker.spawn_process(&worktree_id, spawn_spec(20, 5)).is_ok());
}

#[test]
fn spawn_rejects_unready_worktrees_and_disconnected_envs() {
    let (broker, _dir) = new_broker();
    let (daemon, _worktree_id) = local_fixture(&broker);

    // Worktree created but not yet reported ready.
    let pending = broker.create_worktree("alpha").unwrap();
    assert!(matches!(
        broker.spawn_process(&pending.id, spawn_spec(80, 24)),
        Err(BrokerError::Precondition(_))
    ));

    // Readiness arrives; the spawn goes through.
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::WorktreeReady {
            worktree_id: pending.id.clone(),
            path: "/w/alpha-wt".to_string(),
            branch: pending.branch.clone(),
        },
    );
    assert!(broker.spawn_process(&pending.id, spawn_spec(80, 24)).is_ok());

    // Disconnected environment fails the precondition.
    broker.daemon_closed(daemon.conn_id);
    assert!(matches!(
        broker.spawn_process(&pending.id, spawn_spec(80, 24)),
        Err(BrokerError::Precondition(_))
    ));
}

#[test]
fn input_is_base64_encoded_for_the_daemon_hop() {
    let (broker, _dir) = new_broker();
    let (mut daemon, worktree_id) = local_fixture(&broker);
    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();
    let _ = drain(&mut daemon);

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);
    broker.browser_message(
        browser.conn_id,
        BrowserMessage::Input {
            process_id: process.id.clone(),
            data: "ls\n".to_string(),
        },
    );

    let commands = daemon_commands(&mut daemon);
    let forwarded = commands.iter().find_map(|command| match command {
        DaemonCommand::PtyInput { data, .. } => Some(data.clone()),
        _ => None,
    });
    assert_eq!(
        forwarded.as_deref(),
        Some(BASE64_STANDARD.encode(b"ls\n").as_str())
    );
}

#[test]
fn removing_a_process_clears_its_subscribers() {
    let (broker, _dir) = new_broker();
    let (_daemon, worktree_id) = local_fixture(&broker);
    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();

    let mut browser = connect_browser(&broker);
    let _ = browser_events(&mut browser);
    broker.browser_message(
        browser.conn_id,
        BrowserMessage::Attach {
            process_id: process.id.clone(),
            skip_buffer: true,
        },
    );
    assert_eq!(broker.browsers.subscriber_count(&process.id), 1);

    broker.remove_process(&process.id).unwrap();
    assert_eq!(broker.browsers.subscriber_count(&process.id), 0);
    assert!(broker.processes.get(&process.id).is_none());

    let events = browser_events(&mut browser);
    assert!(events
        .iter()
        .any(|event| matches!(event, BrowserEvent::ProcessRemoved { process_id } if *process_id == process.id)));
}

#[test]
fn kill_without_remove_keeps_the_record() {
    let (broker, _dir) = new_broker();
    let (mut daemon, worktree_id) = local_fixture(&broker);
    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();
    let _ = drain(&mut daemon);

    broker.kill_process(&process.id).unwrap();
    assert!(broker.processes.get(&process.id).is_some());
    assert!(daemon_commands(&mut daemon)
        .iter()
        .any(|command| matches!(command, DaemonCommand::Kill { process_id } if *process_id == process.id)));

    // The daemon later reports the exit.
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::ProcessExit {
            process_id: process.id.clone(),
            exit_code: Some(137),
        },
    );
    let stopped = broker.processes.get(&process.id).unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert_eq!(stopped.exit_code, Some(137));
}

#[test]
fn deleting_a_worktree_kills_descendants_first() {
    let (broker, _dir) = new_broker();
    let (mut daemon, _main_id) = local_fixture(&broker);

    let worktree = broker.create_worktree("alpha").unwrap();
    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::WorktreeReady {
            worktree_id: worktree.id.clone(),
            path: "/w/alpha-wt".to_string(),
            branch: worktree.branch.clone(),
        },
    );
    let process = broker.spawn_process(&worktree.id, spawn_spec(80, 24)).unwrap();
    let _ = drain(&mut daemon);

    broker.delete_worktree(&worktree.id).unwrap();

    let commands = daemon_commands(&mut daemon);
    assert!(commands
        .iter()
        .any(|command| matches!(command, DaemonCommand::Kill { process_id } if *process_id == process.id)));
    assert!(commands
        .iter()
        .any(|command| matches!(command, DaemonCommand::RemoveWorktree { worktree_id, .. } if *worktree_id == worktree.id)));
    assert!(broker.worktrees.get(&worktree.id).is_none());
    assert_eq!(
        broker.processes.get(&process.id).unwrap().status,
        ProcessStatus::Stopped
    );
}

#[test]
fn main_worktree_cannot_be_deleted() {
    let (broker, _dir) = new_broker();
    let (_daemon, main_id) = local_fixture(&broker);
    assert!(matches!(
        broker.delete_worktree(&main_id),
        Err(BrokerError::Validation(_))
    ));
}

#[test]
fn remote_repos_follow_the_daemon_report() {
    let (broker, _dir) = new_broker();
    broker
        .config
        .add_environment(EnvironmentConfig {
            id: "env-B".to_string(),
            name: "beta".to_string(),
            env_type: EnvironmentType::Exe,
            vm_name: Some("vm-beta".to_string()),
            workspace_path: None,
        })
        .unwrap();

    let daemon = connect_daemon(&broker);
    register(&broker, &daemon, "", "beta");

    broker.daemon_message(
        daemon.conn_id,
        DaemonMessage::ReposList {
            repos: vec![agenthq::api::protocol::RepoInfo {
                name: "remote-repo".to_string(),
                path: "/vm/remote-repo".to_string(),
                default_branch: "master".to_string(),
            }],
        },
    );

    let repo = broker.repos.get("remote-repo").unwrap();
    assert_eq!(repo.env_id.as_deref(), Some("env-B"));
    assert_eq!(repo.default_branch, "master");
}

#[test]
fn browser_initial_sync_orders_envs_worktrees_processes() {
    let (broker, _dir) = new_broker();
    let (_daemon, worktree_id) = local_fixture(&broker);
    let _process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();

    let mut browser = connect_browser(&broker);
    let events = browser_events(&mut browser);

    let env_pos = events
        .iter()
        .position(|event| matches!(event, BrowserEvent::EnvUpdate { .. }))
        .expect("env-update present");
    let worktree_pos = events
        .iter()
        .position(|event| matches!(event, BrowserEvent::WorktreeUpdate { .. }))
        .expect("worktree-update present");
    let process_pos = events
        .iter()
        .position(|event| matches!(event, BrowserEvent::ProcessUpdate { .. }))
        .expect("process-update present");

    assert!(env_pos < worktree_pos);
    assert!(worktree_pos < process_pos);
}

#[test]
fn slow_browser_is_evicted_instead_of_stalling_fanout() {
    let (broker, _dir) = new_broker();
    let (daemon, worktree_id) = local_fixture(&broker);
    let process = broker.spawn_process(&worktree_id, spawn_spec(80, 24)).unwrap();

    // A subscriber whose queue is tiny and never drained; registered at
    // the hub level to keep the initial state sync out of the queue.
    let (tx, _rx) = mpsc::channel(1);
    let conn_id = broker.browsers.register(tx);
    broker.browsers.attach(conn_id, &process.id);
    assert_eq!(broker.browsers.subscriber_count(&process.id), 1);

    for _ in 0..4 {
        broker.daemon_message(
            daemon.conn_id,
            DaemonMessage::PtyData {
                process_id: process.id.clone(),
                data: BASE64_STANDARD.encode(b"x"),
            },
        );
    }

    assert_eq!(broker.browsers.subscriber_count(&process.id), 0);
    // The full stream still landed in the buffer.
    assert!(broker.processes.buffer_snapshot(&process.id).len() >= 4);
}
