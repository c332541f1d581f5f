//! Multiplexer integration tests
//!
//! These tests drive the public API over the in-memory transport. Each
//! `MemoryPeer` plays the platform side of one link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use ctf_realtime::websocket::{MemoryPeer, MemoryTransport};
use ctf_realtime::{
    AnonymousPolicy, Channel, ChannelMultiplexer, ConnectionState, RealtimeConfig, SharedToken,
};

struct TestEnvironment {
    mux: ChannelMultiplexer,
    peers: UnboundedReceiver<MemoryPeer>,
    transport: Arc<MemoryTransport>,
    token: Arc<SharedToken>,
    closes: Arc<Mutex<Vec<(Channel, Option<u16>)>>>,
}

impl TestEnvironment {
    fn new() -> Self {
        Self::with_policy(AnonymousPolicy::Refuse)
    }

    fn with_policy(policy: AnonymousPolicy) -> Self {
        let (transport, peers) = MemoryTransport::new();
        let token = Arc::new(SharedToken::new(Some("t0k".to_string())));
        let closes = Arc::new(Mutex::new(Vec::new()));
        let close_log = closes.clone();

        let mux = ChannelMultiplexer::builder(RealtimeConfig::default())
            .anonymous_policy(policy)
            .transport(transport.clone())
            .credentials(token.clone())
            .on_close(move |channel, code| {
                close_log.lock().unwrap().push((channel.clone(), code));
            })
            .build()
            .unwrap();

        Self {
            mux,
            peers,
            transport,
            token,
            closes,
        }
    }

    async fn next_peer(&mut self) -> MemoryPeer {
        tokio::time::timeout(Duration::from_secs(120), self.peers.recv())
            .await
            .expect("no connect attempt")
            .expect("transport dropped")
    }

    async fn wait_open(&self, channel: &Channel) {
        let mut state = self.mux.watch_state(channel).unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .unwrap();
    }
}

/// Records (event name, seq) for every envelope on the bus
fn record_all(mux: &ChannelMultiplexer) -> Arc<Mutex<Vec<(String, Option<u64>)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    mux.on_any(move |env| {
        sink.lock().unwrap().push((env.name.clone(), env.seq));
        Ok(())
    });
    log
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Reference counting
// =============================================================================

mod refcount_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_join_opens_one_link() {
        let mut env = TestEnvironment::new();

        for n in 1..=3 {
            assert_eq!(env.mux.join_contest("alpha"), n);
        }

        let peer = env.next_peer().await;
        assert_eq!(peer.path(), "/ws/contests/alpha/");
        assert_eq!(peer.token().as_deref(), Some("t0k"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(env.transport.attempts(), 1);
        assert!(env.peers.try_recv().is_err());

        assert_eq!(env.mux.leave_contest("alpha"), 2);
        assert_eq!(env.mux.leave_contest("alpha"), 1);
        assert!(env.mux.is_live(&Channel::contest("alpha")));
        assert_eq!(env.mux.leave_contest("alpha"), 0);
        assert!(!env.mux.is_live(&Channel::contest("alpha")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_on_last_leave() {
        let mut env = TestEnvironment::new();
        env.mux.join_contest("alpha");
        env.mux.join_contest("beta");
        env.mux.join_contest("beta");

        let mut peers = vec![env.next_peer().await, env.next_peer().await];
        let beta_index = peers
            .iter()
            .position(|p| p.path() == "/ws/contests/beta/")
            .unwrap();
        let mut beta = peers.remove(beta_index);

        beta.send_json(&json!({
            "event": "scoreboard_snapshot",
            "contest": "beta",
            "entries": [{"rank": 1}],
        }));
        eventually(|| env.mux.get_snapshot("beta").is_some()).await;

        env.mux.leave_contest("beta");
        assert!(env.mux.is_live(&Channel::contest("beta")));
        assert!(env.mux.get_snapshot("beta").is_some());

        env.mux.leave_contest("beta");
        assert!(beta.recv().await.is_none());
        assert!(env.mux.get_snapshot("beta").is_none());
        assert!(!env.mux.is_live(&Channel::contest("beta")));
        assert!(env.mux.is_live(&Channel::contest("alpha")));

        // link closed by us: no reconnect, no close hook
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(env.transport.attempts(), 2);
        assert!(env.closes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_join_leave_on_one_slug() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (transport, mut peers) = MemoryTransport::new();
        let mux = ChannelMultiplexer::builder(RealtimeConfig::default())
            .transport(transport.clone())
            .credentials(Arc::new(|| Some("t0k".to_string())))
            .runtime(rt.handle().clone())
            .build()
            .unwrap();

        // Every link handed out must be closed again once its slug is left
        let accepted = Arc::new(AtomicUsize::new(0));
        let open_links = Arc::new(AtomicUsize::new(0));
        let (accepted_count, open_count) = (accepted.clone(), open_links.clone());
        rt.spawn(async move {
            while let Some(mut peer) = peers.recv().await {
                accepted_count.fetch_add(1, Ordering::SeqCst);
                open_count.fetch_add(1, Ordering::SeqCst);
                let open_count = open_count.clone();
                tokio::spawn(async move {
                    while peer.recv().await.is_some() {}
                    open_count.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        let first_joins = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ROUNDS {
                        let refs = mux.join_contest("z");
                        assert!(refs >= 1 && refs <= THREADS);
                        if refs == 1 {
                            first_joins.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(mux.stats().contests.len() <= 1);
                        mux.leave_contest("z");
                    }
                });
            }
        });

        assert_eq!(mux.ref_count("z"), 0);
        assert!(mux.stats().contests.is_empty());
        assert!(!mux.is_live(&Channel::contest("z")));
        assert!(mux.get_snapshot("z").is_none());

        // one connection per 0 -> 1 transition, each attempting at most once
        let first_joins = first_joins.load(Ordering::SeqCst);
        assert!(first_joins >= 1);
        assert!(transport.attempts() <= first_joins);

        rt.block_on(async {
            eventually(|| {
                accepted.load(Ordering::SeqCst) == transport.attempts()
                    && open_links.load(Ordering::SeqCst) == 0
            })
            .await;
        });
    }

    #[tokio::test]
    async fn test_leave_underflow_is_noop() {
        let env = TestEnvironment::new();
        assert_eq!(env.mux.leave_contest("nobody"), 0);
        assert_eq!(env.mux.leave_contest("nobody"), 0);
        assert_eq!(env.mux.join_contest("nobody"), 1);
        assert_eq!(env.mux.ref_count("nobody"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all() {
        let mut env = TestEnvironment::new();
        env.mux.start_notify();
        env.mux.join_contest("alpha");

        let mut first = env.next_peer().await;
        let mut second = env.next_peer().await;

        env.mux.stop_all();
        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_none());

        let stats = env.mux.stats();
        assert!(!stats.notify_live);
        assert!(stats.contests.is_empty());
        assert_eq!(stats.cached_snapshots, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(env.transport.attempts(), 2);
    }
}

// =============================================================================
// Event delivery
// =============================================================================

mod delivery_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_replayed_frames_are_dropped() {
        let mut env = TestEnvironment::new();
        let log = record_all(&env.mux);
        env.mux.join_contest("alpha");
        let peer = env.next_peer().await;

        for seq in [1, 2, 2, 1, 3] {
            peer.send_json(&json!({
                "event": "scoreboard_updated",
                "contest": "alpha",
                "updated_at": "2024-01-01T00:00:00Z",
                "seq": seq,
            }));
        }

        eventually(|| log.lock().unwrap().len() >= 3).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let seqs: Vec<Option<u64>> = log.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_listener_does_not_block_others() {
        let mut env = TestEnvironment::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        env.mux.on("first_blood", |_| Err(anyhow::anyhow!("listener bug")));
        env.mux.on("first_blood", |_| panic!("listener panic"));
        let counter = delivered.clone();
        env.mux.on("first_blood", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = delivered.clone();
        env.mux.on_any(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        env.mux.join_contest("alpha");
        let peer = env.next_peer().await;
        peer.send_json(&json!({
            "event": "first_blood",
            "contest": "alpha",
            "challenge": "pwn-1",
            "user_id": 7,
            "seq": 1,
        }));
        peer.send_json(&json!({
            "event": "first_blood",
            "contest": "alpha",
            "challenge": "web-2",
            "user_id": 8,
            "seq": 2,
        }));

        eventually(|| delivered.load(Ordering::SeqCst) == 4).await;
        // link survived the listener failures
        assert_eq!(
            env.mux.connection_state(&Channel::contest("alpha")),
            Some(ConnectionState::Open)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_replaced_not_merged() {
        let mut env = TestEnvironment::new();
        env.mux.join_contest("alpha");
        let peer = env.next_peer().await;

        peer.send_json(&json!({
            "event": "scoreboard_snapshot",
            "contest": "alpha",
            "entries": [{"team": "A", "score": 100}, {"team": "B", "score": 50}],
            "seq": 1,
        }));
        // no contest field: attributed to the channel's contest
        peer.send_json(&json!({
            "event": "scoreboard_snapshot",
            "entries": [{"team": "C", "score": 10}],
            "seq": 2,
        }));

        eventually(|| {
            env.mux
                .get_snapshot("alpha")
                .map_or(false, |s| s.entries().len() == 1)
        })
        .await;

        let snapshot = env.mux.get_snapshot("alpha").unwrap();
        assert_eq!(snapshot.contest, "alpha");
        assert_eq!(snapshot.entries(), &[json!({"team": "C", "score": 10})]);
        assert_eq!(env.mux.stats().cached_snapshots, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let mut env = TestEnvironment::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = env.mux.on("announcement_published", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        sub.unsubscribe();
        sub.unsubscribe();

        let counter = hits.clone();
        let _kept = env.mux.on("announcement_published", move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
            Ok(())
        });
        sub.unsubscribe();

        env.mux.start_notify();
        let peer = env.next_peer().await;
        peer.send_json(&json!({
            "event": "announcement_published",
            "contest": "alpha",
            "announcement_id": 3,
            "title": "Freeze",
        }));

        eventually(|| hits.load(Ordering::SeqCst) > 0).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }
}

// =============================================================================
// Reconnection
// =============================================================================

mod reconnect_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_tier_follows_close_code() {
        let mut env = TestEnvironment::new();
        env.mux.start_notify();

        let peer = env.next_peer().await;
        env.wait_open(&Channel::Notify).await;
        let closed_at = Instant::now();
        peer.close(Some(4429));

        let peer = env.next_peer().await;
        assert!(closed_at.elapsed() >= Duration::from_secs(15));

        env.wait_open(&Channel::Notify).await;
        let closed_at = Instant::now();
        peer.close(Some(1000));

        let _peer = env.next_peer().await;
        let waited = closed_at.elapsed();
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(15));

        assert_eq!(
            *env.closes.lock().unwrap(),
            vec![(Channel::Notify, Some(4429)), (Channel::Notify, Some(1000))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reads_fresh_token() {
        let mut env = TestEnvironment::new();
        env.mux.start_notify();

        let peer = env.next_peer().await;
        assert_eq!(peer.token().as_deref(), Some("t0k"));

        env.token.set("rotated");
        peer.close(Some(1006));

        let peer = env.next_peer().await;
        assert_eq!(peer.token().as_deref(), Some("rotated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_contest_policy() {
        let mut env = TestEnvironment::with_policy(AnonymousPolicy::Connect);
        env.token.clear();

        env.mux.start_notify();
        env.mux.join_contest("open-ctf");

        let peer = env.next_peer().await;
        assert_eq!(peer.path(), "/ws/contests/open-ctf/");
        assert!(peer.token().is_none());

        // notify never connects without a token
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(env.transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_detection_survives_reconnect() {
        let mut env = TestEnvironment::new();
        let log = record_all(&env.mux);
        env.mux.start_notify();

        let peer = env.next_peer().await;
        peer.send_json(&json!({"event": "hint_unlocked", "seq": 5}));
        peer.close(Some(1001));

        let peer = env.next_peer().await;
        peer.send_json(&json!({"event": "hint_unlocked", "seq": 5}));
        peer.send_json(&json!({"event": "hint_unlocked", "seq": 6}));

        eventually(|| log.lock().unwrap().len() >= 2).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                ("hint_unlocked".to_string(), Some(5)),
                ("hint_unlocked".to_string(), Some(6)),
            ]
        );
    }
}
