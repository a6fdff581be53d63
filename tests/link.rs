mod common;

use common::{eventually, voice, wait_available, MockNode};
use lavalink_cluster::player::StateSource;
use lavalink_cluster::{
    CommandTransport,
    Error,
    LinkState,
    MigrationCommandPolicy,
    NodePool,
    PlayOptions,
    PoolConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

async fn connected(config: PoolConfig) -> (MockNode, NodePool) {
    let mock = MockNode::start("a", 1).await;
    let pool = NodePool::new(config);

    wait_available(&pool.add_node(mock.config()).unwrap()).await;

    (mock, pool)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_waits_for_the_voice_join() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    let mut states = link.subscribe_state();

    link.connect(voice()).await.unwrap();

    assert_eq!(link.state(), LinkState::Connected);
    assert!(link.player().voice_connected());
    assert!(states.has_changed().unwrap());
    assert_eq!(mock.player(1).unwrap()["voice"]["token"], "token");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_times_out_without_acknowledgement() {
    let mut config = common::config();
    config.link_connect_timeout = Duration::from_millis(200);
    let (mock, pool) = connected(config).await;
    let link = pool.create_link(1).unwrap();

    mock.fail_voice(true);

    assert!(matches!(
        link.connect(voice()).await,
        Err(Error::LinkConnection { guild_id: 1, .. })
    ));
    assert_eq!(link.state(), LinkState::NotConnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_state_overrides_local_state() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();

    link.play("track-1").await.unwrap();
    link.set_volume(30).await.unwrap();

    assert_eq!(link.player().track().as_deref(), Some("track-1"));
    assert_eq!(link.player().volume(), 30);
    assert_eq!(link.player().source(), StateSource::Remote);

    mock.push(json!({
        "op": "playerUpdate",
        "guildId": "1",
        "state": {"time": 1, "position": 12000, "connected": true, "ping": 3},
    }));
    eventually(|| link.player().position_ms() >= 12000).await;

    mock.push(json!({
        "op": "event",
        "type": "TrackStartEvent",
        "guildId": "1",
        "track": {"encoded": "track-2", "info": {}},
    }));
    eventually(|| link.player().track().as_deref() == Some("track-2")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_command_rolls_back() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();

    mock.fail_rest(true);

    match link.pause(true).await {
        Err(Error::Rest { status, message, .. }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        },
        other => panic!("unexpected {:?}", other),
    }

    assert!(!link.player().paused());
    assert_eq!(link.player().track().as_deref(), Some("track-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_then_unpause_ends_unpaused() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();

    link.pause(true).await.unwrap();
    link.unpause().await.unwrap();

    let mut late = link.events().subscribe_channel(None);
    time::sleep(Duration::from_millis(50)).await;

    assert!(!link.player().paused());
    assert!(late.try_recv().is_err());

    let pauses = mock
        .player_updates()
        .iter()
        .filter_map(|body| body.get("paused").cloned())
        .collect::<Vec<_>>();
    assert_eq!(pauses, [json!(true), json!(false)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn play_options_are_forwarded() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();

    link.play_with(PlayOptions {
        start: Some(Duration::from_secs(3)),
        end: Some(Duration::from_secs(9)),
        no_replace: true,
        ..PlayOptions::new("track-2")
    }).await.unwrap();

    let last = mock.player_updates().pop().unwrap();
    assert_eq!(last["track"]["encoded"], "track-2");
    assert_eq!(last["position"], 3000);
    assert_eq!(last["endTime"], 9000);
    assert_eq!(link.player().track().as_deref(), Some("track-1"));

    link.seek(Duration::from_millis(1500)).await.unwrap();
    link.set_equalizers([(0, 0.2), (14, 2.0)]).await.unwrap();
    link.reset_equalizers().await.unwrap();
    link.stop().await.unwrap();

    let updates = mock.player_updates();
    let n = updates.len();
    assert_eq!(updates[n - 4]["position"], 1500);
    assert_eq!(updates[n - 3]["filters"]["equalizer"][1]["gain"], 1.0);
    assert_eq!(updates[n - 2]["filters"]["equalizer"], json!([]));
    assert!(updates[n - 1]["track"]["encoded"].is_null());
    assert_eq!(link.player().track(), None);
    assert!(link.player().equalizers().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_is_idempotent() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();

    link.destroy().await.unwrap();
    link.destroy().await.unwrap();

    assert!(mock.player(1).is_none());
    assert_eq!(mock.requests().iter().filter(|request| request.method == "DELETE").count(), 1);
    assert!(pool.link(1).is_none());
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(link.player().track(), None);
    assert!(matches!(link.play("track-2").await, Err(Error::LinkDestroyed(1))));

    let fresh = pool.create_link(1).unwrap();
    assert!(!Arc::ptr_eq(&fresh, &link));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_tears_down_even_if_the_node_fails() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();

    mock.fail_rest(true);

    assert!(matches!(link.destroy().await, Err(Error::Rest { status: 500, .. })));
    assert_eq!(link.state(), LinkState::Disconnected);
    assert!(link.node().is_none());
    assert!(pool.link(1).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn route_planner_status() {
    let (mock, pool) = connected(common::config()).await;
    let link = pool.create_link(1).unwrap();

    assert!(matches!(link.address_status_or_none().await, Err(Error::LinkNotConnected(1))));

    link.connect(voice()).await.unwrap();

    assert_eq!(link.address_status_or_none().await.unwrap(), None);
    assert!(matches!(link.address_status().await, Err(Error::NoRoutePlanner(ref node)) if node == "a"));

    mock.set_route_planner(Some(json!({
        "class": "RotatingNanoIpRoutePlanner",
        "details": {
            "ipBlock": {"type": "Inet6Address", "size": "1208925819614629174706176"},
            "failingAddresses": [{
                "failingAddress": "1.0.0.1",
                "failingTimestamp": 1573520707545u64,
                "failingTime": "Mon Nov 11 20:05:07 EST 2019",
            }],
            "blockIndex": "0",
            "currentAddressIndex": "36792023813",
        },
    })));

    let status = link.address_status().await.unwrap();
    assert_eq!(status.class, "RotatingNanoIpRoutePlanner");
    assert_eq!(status.details.ip_block.kind, "Inet6Address");
    assert_eq!(status.details.failing_addresses[0].failing_address, "1.0.0.1");

    link.unmark_address("1.0.0.1").await.unwrap();
    link.unmark_all_addresses().await.unwrap();

    let posts = mock
        .requests()
        .into_iter()
        .filter(|request| request.method == "POST")
        .collect::<Vec<_>>();
    assert_eq!(posts[0].path, "/v4/routeplanner/free/address");
    assert_eq!(posts[0].body, json!({"address": "1.0.0.1"}));
    assert_eq!(posts[1].path, "/v4/routeplanner/free/all");
}

async fn migrating(policy: MigrationCommandPolicy) -> (MockNode, MockNode, Arc<NodePool>, tokio::task::JoinHandle<()>) {
    let mut config = common::config();
    config.migration_commands = policy;
    let a = MockNode::start("a", 1).await;
    let b = MockNode::start("b", 2).await;
    let pool = Arc::new(NodePool::new(config));

    wait_available(&pool.add_node(a.config()).unwrap()).await;
    wait_available(&pool.add_node(b.config()).unwrap()).await;

    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();

    b.set_ack_delay(Duration::from_millis(300));

    let removal = tokio::spawn({
        let pool = Arc::clone(&pool);

        async move { pool.remove_node("a").await.unwrap() }
    });

    eventually(|| link.is_migrating()).await;

    (a, b, pool, removal)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_fail_while_migrating() {
    let (_a, _b, pool, removal) = migrating(MigrationCommandPolicy::Fail).await;
    let link = pool.link(1).unwrap();

    assert!(matches!(link.set_volume(70).await, Err(Error::LinkMigrating(1))));

    removal.await.unwrap();

    assert!(!link.is_migrating());
    link.set_volume(70).await.unwrap();
    assert_eq!(link.node().unwrap().name(), "b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_queue_while_migrating() {
    let (_a, b, pool, removal) = migrating(MigrationCommandPolicy::Queue).await;
    let link = pool.link(1).unwrap();

    link.set_volume(70).await.unwrap();

    assert_eq!(link.node().unwrap().name(), "b");
    assert_eq!(b.player(1).unwrap()["volume"], 70);
    assert_eq!(b.player(1).unwrap()["track"]["encoded"], "track-1");

    removal.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_move_leaves_the_link_usable() {
    let mut config = common::config();
    config.migration_commands = MigrationCommandPolicy::Fail;
    let a = MockNode::start("a", 1).await;
    let b = MockNode::start("b", 2).await;
    let pool = NodePool::new(config);

    wait_available(&pool.add_node(a.config()).unwrap()).await;
    wait_available(&pool.add_node(b.config()).unwrap()).await;

    let link = pool.create_link(1).unwrap();
    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();

    b.set_ack_delay(Duration::from_millis(500));

    assert!(time::timeout(Duration::from_millis(100), link.migrate_to("b")).await.is_err());

    assert!(!link.is_migrating());
    assert_eq!(link.node().unwrap().name(), "a");
    assert_eq!(link.state(), LinkState::Connected);
    assert!(link.player().voice_connected());
    assert_eq!(link.player().track().as_deref(), Some("track-1"));

    link.set_volume(70).await.unwrap();
    assert_eq!(a.player(1).unwrap()["volume"], 70);

    eventually(|| b.player(1).is_none()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplex_commands_use_the_websocket() {
    let mut config = common::config();
    config.command_transport = CommandTransport::Duplex { fallback_to_rest: false };
    let (mock, pool) = connected(config).await;
    let link = pool.create_link(1).unwrap();

    link.connect(voice()).await.unwrap();
    link.play("track-1").await.unwrap();
    link.pause(true).await.unwrap();

    assert!(link.player().paused());
    assert_eq!(link.player().source(), StateSource::Local);

    eventually(|| mock.player(1).map_or(false, |player| player["paused"] == true)).await;

    let ops = mock
        .requests()
        .into_iter()
        .filter(|request| request.method == "WS")
        .map(|request| request.path)
        .collect::<Vec<_>>();
    assert_eq!(ops, ["voiceUpdate", "play", "pause"]);
    assert!(mock.player_updates().is_empty());
}
