//! Whole-session flows over the in-process hub.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use peer_sync_core::{
    PeerChannel, PeerIdentity, SyncConfig,
    commands::{self, ExecuteRequest},
};
use peer_sync_executor::{
    CallState, HostRole, Participant, ProxyError, RemoteExecutionProxy, SessionRole,
    testing::ScriptedBackend,
};
use peer_sync_session::CreationBarrier;
use serde_json::{Value, json};
use tokio_test::{assert_pending, assert_ready, task};
use tokio_util::sync::CancellationToken;

use crate::{LocalPeer, LocalSession};

#[derive(Debug)]
struct Notebook {
    owner: PeerIdentity,
}

type Barrier = CreationBarrier<Notebook, Box<dyn Fn() -> Notebook + Send + Sync>>;

fn barrier_for(peer: &Arc<LocalPeer>, created: &Arc<AtomicUsize>) -> Arc<Barrier> {
    let owner = peer.identity();
    let created = Arc::clone(created);
    let factory: Box<dyn Fn() -> Notebook + Send + Sync> = Box::new(move || {
        created.fetch_add(1, Ordering::SeqCst);
        Notebook { owner }
    });
    CreationBarrier::spawn(owner, peer.clone(), factory)
}

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .unwrap()
}

fn scripted_host(peer: &Arc<LocalPeer>) -> HostRole<ScriptedBackend> {
    let backend = ScriptedBackend::new()
        .with_outputs("x=1", vec![json!({"x": 1})])
        .with_stall("loop", vec![json!(1)])
        .with_status(json!({"cell": "status"}));
    HostRole::share(peer.clone(), Arc::new(backend), &SyncConfig::default()).unwrap()
}

#[tokio::test]
async fn test_three_peers_create_before_initiator_resumes() {
    let session = LocalSession::new();
    let (a, b, c) = (session.join(), session.join(), session.join());
    let created = Arc::new(AtomicUsize::new(0));
    let (ba, bb, bc) = (
        barrier_for(&a, &created),
        barrier_for(&b, &created),
        barrier_for(&c, &created),
    );

    let mut sync = task::spawn(ba.ensure_resource_and_synchronize());
    assert_pending!(sync.poll());
    settle().await;

    let notebook = assert_ready!(sync.poll()).unwrap();
    assert_eq!(notebook.owner, a.identity());
    assert_eq!(created.load(Ordering::SeqCst), 3);
    assert_eq!(bb.active().unwrap().owner, b.identity());
    assert_eq!(bc.active().unwrap().owner, c.identity());
    assert_eq!(ba.pending_count(), 0);
}

#[tokio::test]
async fn test_peer_leaving_mid_sync_releases_initiator() {
    let session = LocalSession::new();
    let (a, b, c) = (session.join(), session.join(), session.join());
    let created = Arc::new(AtomicUsize::new(0));
    let ba = barrier_for(&a, &created);
    let _bb = barrier_for(&b, &created);

    let mut sync = task::spawn(ba.ensure_resource_and_synchronize());
    assert_pending!(sync.poll());
    settle().await;
    // `c` never answers.
    assert_pending!(sync.poll());

    c.leave();
    settle().await;

    assert_ready!(sync.poll()).unwrap();
    assert_eq!(a.peer_count(), 1);
}

#[tokio::test]
async fn test_guest_streams_host_execution() {
    let session = LocalSession::new();
    let (host_peer, guest_peer) = (session.join(), session.join());
    let _host = scripted_host(&host_peer);
    let proxy = RemoteExecutionProxy::new(guest_peer.clone(), SyncConfig::default());
    proxy.attach(SessionRole::Collaborator).await.unwrap();

    let outputs: Vec<_> = within(
        proxy
            .execute_streaming(&ExecuteRequest::new("x=1", "a.py", 0, "id1"))
            .collect(),
    )
    .await;

    assert_eq!(outputs, vec![Ok(json!({"x": 1}))]);
    assert_eq!(proxy.correlator().pending_count(), 0);
}

#[tokio::test]
async fn test_late_guest_catches_up_on_finished_call() {
    let session = LocalSession::new();
    let (host_peer, early, late) = (session.join(), session.join(), session.join());
    let host = scripted_host(&host_peer);
    let request = ExecuteRequest::new("x=1", "a.py", 0, "id1");

    let first = RemoteExecutionProxy::new(early.clone(), SyncConfig::default());
    first.attach(SessionRole::Collaborator).await.unwrap();
    let last = within(first.execute(&request, &CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(last, Some(json!({"x": 1})));
    assert_eq!(host.history_len(), 3);

    let second =
        RemoteExecutionProxy::new(late.clone(), SyncConfig::default()).with_start_time(0);
    second.attach(SessionRole::Observer).await.unwrap();
    within(async {
        while second.correlator().buffered_count() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await;

    let replayed: Vec<_> = within(second.correlator().register(request.tag()).collect()).await;
    assert_eq!(replayed, vec![Ok(json!({"x": 1}))]);
    // The replay reached the early guest too; its finished call stays finished.
    assert_eq!(first.correlator().buffered_count(), 0);
}

#[tokio::test]
async fn test_collaborator_without_host_fails_to_attach() {
    let session = LocalSession::new();
    let guest = session.join();
    let proxy = RemoteExecutionProxy::new(guest.clone(), SyncConfig::default());

    assert_eq!(
        proxy.attach(SessionRole::Collaborator).await,
        Err(ProxyError::SyncFailure)
    );
    assert_eq!(proxy.attach(SessionRole::Observer).await, Ok(()));
}

#[tokio::test]
async fn test_host_leaving_makes_service_unavailable() {
    let session = LocalSession::new();
    let (host_peer, guest_peer) = (session.join(), session.join());
    let _host = scripted_host(&host_peer);
    let proxy = RemoteExecutionProxy::new(guest_peer.clone(), SyncConfig::default());
    proxy.attach(SessionRole::Collaborator).await.unwrap();

    host_peer.leave();

    let name = SyncConfig::default().execution_service;
    assert_eq!(
        proxy
            .execute(
                &ExecuteRequest::new("x=1", "a.py", 0, "id1"),
                &CancellationToken::new()
            )
            .await,
        Err(ProxyError::ServiceUnavailable(name.clone()))
    );
    assert_eq!(
        proxy.restart_kernel().await,
        Err(ProxyError::ServiceUnavailable(name))
    );
}

#[tokio::test]
async fn test_both_roles_answer_the_same_requests() {
    let session = LocalSession::new();
    let (host_peer, guest_peer) = (session.join(), session.join());
    let host: Arc<dyn Participant> = Arc::new(scripted_host(&host_peer));
    let guest: Arc<dyn Participant> = Arc::new(RemoteExecutionProxy::new(
        guest_peer.clone(),
        SyncConfig::default(),
    ));
    let mut hellos = host_peer.on_broadcast("hello");

    for role in [&host, &guest] {
        role.on_attach(SessionRole::Collaborator).await.unwrap();
        let status = role
            .send_request(commands::GET_STATUS_CELL, Vec::new())
            .await
            .unwrap();
        assert_eq!(status, json!({"cell": "status"}));
        role.send_broadcast("hello", Vec::new()).unwrap();
    }

    assert_eq!(hellos.recv().await, Some(Vec::<Value>::new()));
    assert_eq!(hellos.recv().await, Some(Vec::<Value>::new()));
}

#[tokio::test]
async fn test_host_leaving_mid_stream_fails_the_call() {
    let session = LocalSession::new();
    let (host_peer, guest_peer) = (session.join(), session.join());
    let host = scripted_host(&host_peer);
    let proxy = RemoteExecutionProxy::new(guest_peer.clone(), SyncConfig::default());
    proxy.attach(SessionRole::Collaborator).await.unwrap();
    let mut stream = proxy.execute_streaming(&ExecuteRequest::new("loop", "a.py", 0, "id1"));
    assert_eq!(within(stream.next()).await, Some(Ok(json!(1))));

    host.dispose();
    host_peer.leave();

    assert_eq!(
        within(stream.next()).await,
        Some(Err(ProxyError::ServiceUnavailable(
            SyncConfig::default().execution_service
        )))
    );
    assert_eq!(stream.state(), CallState::Failed);
    assert_eq!(proxy.correlator().pending_count(), 0);
}

#[tokio::test]
async fn test_catchup_for_new_guest_does_not_repeat_running_call() {
    let session = LocalSession::new();
    let (host_peer, early, late) = (session.join(), session.join(), session.join());
    let _host = scripted_host(&host_peer);
    let first = RemoteExecutionProxy::new(early.clone(), SyncConfig::default());
    first.attach(SessionRole::Collaborator).await.unwrap();
    let mut running = first.execute_streaming(&ExecuteRequest::new("loop", "a.py", 0, "id1"));
    assert_eq!(within(running.next()).await, Some(Ok(json!(1))));

    let second =
        RemoteExecutionProxy::new(late.clone(), SyncConfig::default()).with_start_time(0);
    second.attach(SessionRole::Observer).await.unwrap();
    within(async {
        while second.correlator().buffered_count() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await;
    settle().await;

    let repeated = tokio::time::timeout(Duration::from_millis(100), running.next()).await;
    assert!(repeated.is_err(), "running call yielded again: {repeated:?}");
    assert_eq!(running.state(), CallState::Streaming);
}
