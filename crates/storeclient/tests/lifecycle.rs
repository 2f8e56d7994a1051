//! Object lifecycle through in-process links

use bytes::Bytes;
use denc::{NotificationEvent, ObjectId};
use objstore::{Manager, ObjectState, Store};
use std::collections::HashSet;
use std::time::Duration;
use storeclient::{ClientError, ObjectStoreClient};
use tokio::time::Instant;

fn id(b: u8) -> ObjectId {
    ObjectId::new([b; denc::OBJECT_ID_SIZE])
}

fn client(store: &Store) -> ObjectStoreClient {
    ObjectStoreClient::local(store.clone(), None).with_release_delay(0)
}

fn managed(store: &Store, manager: &Manager) -> ObjectStoreClient {
    ObjectStoreClient::local(store.clone(), Some(manager.clone())).with_release_delay(0)
}

async fn put(client: &ObjectStoreClient, object_id: ObjectId, data: &[u8], metadata: &'static [u8]) {
    let mut buffer = client.create(object_id, data.len(), metadata).await.unwrap();
    buffer.copy_from_slice(data);
    client.seal(buffer).await.unwrap();
}

#[tokio::test]
async fn scenario_a_create_seal_get() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    let x = id(1);

    let mut buffer = client.create(x, 100, &b"m"[..]).await.unwrap();
    buffer.fill(7);
    client.seal(buffer).await.unwrap();

    let views = client.get(&[x], Some(Duration::ZERO)).await.unwrap();
    assert_eq!(views.len(), 1);
    let view = views[0].as_ref().unwrap();
    assert_eq!(view.data_size(), 100);
    assert_eq!(view.metadata(), &Bytes::from_static(b"m"));
    assert!(view.iter().all(|&b| b == 7));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_unsealed_get_times_out() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    let x = id(2);
    let _buffer = client.create(x, 10, &b""[..]).await.unwrap();

    let start = Instant::now();
    let views = client
        .get(&[x], Some(Duration::from_millis(10)))
        .await
        .unwrap();
    assert!(views[0].is_none());
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn scenario_c_wait_returns_first_sealed() {
    let store = Store::new(1 << 20);
    let manager = Manager::new(store.clone(), "127.0.0.1", 7000);
    let waiter = managed(&store, &manager);
    let (x, y) = (id(3), id(4));

    let producer = client(&store);
    let sealer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        put(&producer, y, b"y", b"").await;
        producer
    });

    let (ready, remaining) = waiter
        .wait(&[x, y], 1, Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(ready, HashSet::from([y]));
    assert_eq!(remaining, HashSet::from([x]));
    sealer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_d_wait_rejects_excess_num_returns() {
    let store = Store::new(1 << 20);
    let manager = Manager::new(store.clone(), "127.0.0.1", 7000);
    let waiter = managed(&store, &manager);

    let start = Instant::now();
    let result = waiter
        .wait(&[id(5), id(6)], 3, Duration::from_secs(10))
        .await;
    assert!(matches!(result, Err(ClientError::ContractViolation(_))));
    assert!(result.unwrap_err().is_fatal());
    assert!(start.elapsed() < Duration::from_millis(1));
}

#[tokio::test]
async fn scenario_e_seal_then_delete_notifications() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    let x = id(7);

    put(&client, x, b"payload", b"md").await;
    let mut events = client.subscribe().await.unwrap();
    client.release(x).await.unwrap();
    client.delete(x).await.unwrap();

    let sealed = events.next_event().await.unwrap();
    assert_eq!(sealed, NotificationEvent::sealed(x, 7, 2));
    let deleted = events.next_event().await.unwrap();
    assert_eq!(deleted.object_id, x);
    assert_eq!((deleted.data_size, deleted.metadata_size), (-1, -1));
}

#[tokio::test]
async fn lifecycle_is_monotonic() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    let x = id(8);
    let mut observed = vec![store.state_of(&x)];

    let buffer = client.create(x, 1, &b""[..]).await.unwrap();
    observed.push(store.state_of(&x));
    client.seal(buffer).await.unwrap();
    observed.push(store.state_of(&x));
    client.release(x).await.unwrap();
    client.delete(x).await.unwrap();
    observed.push(store.state_of(&x));

    assert_eq!(
        observed,
        vec![
            None,
            Some(ObjectState::Creating),
            Some(ObjectState::Sealed),
            None
        ]
    );
    // Sealing again after the record is gone is a caller bug
    assert!(matches!(
        client.seal_id(x).await,
        Err(ClientError::ContractViolation(_))
    ));
}

#[tokio::test]
async fn sealed_bytes_never_change() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    let x = id(9);
    put(&client, x, b"fixed", b"").await;

    let first = client.get(&[x], Some(Duration::ZERO)).await.unwrap();
    let second = client.get(&[x], Some(Duration::ZERO)).await.unwrap();
    assert_eq!(first[0].as_ref().unwrap().data(), second[0].as_ref().unwrap().data());

    // A second create of the same id does not disturb the sealed bytes
    assert!(matches!(
        client.create(x, 3, &b""[..]).await,
        Err(ClientError::ObjectExists(got)) if got == x
    ));
    let third = client.get(&[x], Some(Duration::ZERO)).await.unwrap();
    assert_eq!(&third[0].as_ref().unwrap()[..], b"fixed");
}

#[tokio::test]
async fn held_objects_are_not_evicted() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    let (held, free) = (id(10), id(11));
    put(&client, held, &[0; 40], b"").await;
    put(&client, free, &[0; 60], b"").await;
    client.release(free).await.unwrap();

    let freed = client.evict(u64::MAX).await.unwrap();
    assert_eq!(freed, 60);
    assert!(client.contains(held).await.unwrap());
    assert!(!client.contains(free).await.unwrap());

    // Releasing more than was acquired never reaches the store
    client.release(held).await.unwrap();
    assert!(matches!(
        client.release(held).await,
        Err(ClientError::ContractViolation(_))
    ));
    assert_eq!(client.evict(1).await.unwrap(), 40);
}

#[tokio::test]
async fn evict_frees_no_more_than_unreferenced_bytes() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    for b in 20..25 {
        put(&client, id(b), &[b; 10], b"m").await;
    }
    for b in 20..23 {
        client.release(id(b)).await.unwrap();
    }

    let freed = client.evict(1_000).await.unwrap();
    assert!(freed <= 3 * 11);
    for b in 23..25 {
        assert!(client.contains(id(b)).await.unwrap());
    }
}

#[tokio::test]
async fn get_preserves_order() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    put(&client, id(30), b"a", b"").await;
    put(&client, id(32), b"c", b"").await;

    let ids = [id(32), id(31), id(30)];
    let views = client.get(&ids, Some(Duration::ZERO)).await.unwrap();
    assert_eq!(views.len(), ids.len());
    for (object_id, view) in ids.iter().zip(&views) {
        if let Some(view) = view {
            assert_eq!(view.object_id(), *object_id);
        }
    }
    assert_eq!(&views[0].as_ref().unwrap()[..], b"c");
    assert!(views[1].is_none());
    assert_eq!(&views[2].as_ref().unwrap()[..], b"a");
}

#[tokio::test]
async fn wait_count_contract() {
    let store = Store::new(1 << 20);
    let peer = Store::new(1 << 20);
    let manager = Manager::new(store.clone(), "127.0.0.1", 7000);
    manager.add_peer("127.0.0.1", 7001, peer.clone());
    let client = managed(&store, &manager);
    let remote = client_for_peer(&peer);

    put(&client, id(40), b"1", b"").await;
    put(&client, id(42), b"3", b"").await;
    put(&remote, id(43), b"4", b"").await;

    let ids = [id(40), id(41), id(42), id(43)];
    let all: HashSet<ObjectId> = ids.iter().copied().collect();
    for num_returns in 0..=ids.len() {
        let (ready, remaining) = client.wait(&ids, num_returns, Duration::ZERO).await.unwrap();
        assert_eq!(ready.len(), num_returns.min(3));
        assert!(ready.is_disjoint(&remaining));
        assert_eq!(&ready | &remaining, all);
        assert!(!ready.contains(&id(41)));
    }
}

fn client_for_peer(peer: &Store) -> ObjectStoreClient {
    client(peer)
}

#[tokio::test]
async fn wait_without_manager_is_not_connected() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    assert!(matches!(
        client.wait(&[id(50)], 1, Duration::ZERO).await,
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(
        client.fetch(&[id(50)]).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn fetch_and_transfer_between_stores() {
    let store = Store::new(1 << 20);
    let peer = Store::new(1 << 20);
    let manager = Manager::new(store.clone(), "127.0.0.1", 7000);
    manager.add_peer("127.0.0.1", 7001, peer.clone());
    let client = managed(&store, &manager);
    let remote = client_for_peer(&peer);

    put(&remote, id(60), b"from peer", b"").await;
    client.fetch(&[id(60)]).await.unwrap();
    let views = client
        .get(&[id(60)], Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(&views[0].as_ref().unwrap()[..], b"from peer");

    put(&client, id(61), b"to peer", b"").await;
    client.transfer("127.0.0.1", 7001, id(61)).await.unwrap();
    assert!(peer.contains(&id(61)));

    assert!(matches!(
        client.transfer("127.0.0.1", 9999, id(61)).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn delete_waits_for_last_reference() {
    let store = Store::new(1 << 20);
    let owner = client(&store);
    let reader = client(&store);
    let x = id(70);
    put(&owner, x, b"shared", b"").await;
    owner.release(x).await.unwrap();

    let views = reader.get(&[x], Some(Duration::ZERO)).await.unwrap();
    assert!(views[0].is_some());
    let mut events = owner.subscribe().await.unwrap();
    assert_eq!(events.next_event().await.unwrap().object_id, x);

    owner.delete(x).await.unwrap();
    assert_eq!(store.state_of(&x), Some(ObjectState::Sealed));

    reader.release(x).await.unwrap();
    assert_eq!(store.state_of(&x), None);
    assert!(events.next_event().await.unwrap().is_deletion());
}

#[tokio::test]
async fn disconnect_aborts_unsealed_objects_silently() {
    let store = Store::new(1 << 20);
    let watcher = client(&store);
    let mut events = watcher.subscribe().await.unwrap();

    let writer = client(&store);
    let _buffer = writer.create(id(80), 16, &b""[..]).await.unwrap();
    writer.disconnect().await.unwrap();
    assert_eq!(store.state_of(&id(80)), None);
    assert_eq!(store.stats().used_bytes, 0);

    // The abort produced no event: the next one is for a later seal
    put(&watcher, id(81), b"z", b"").await;
    assert_eq!(events.next_event().await.unwrap().object_id, id(81));
}

#[tokio::test]
async fn create_reports_store_full() {
    let store = Store::new(100);
    let client = client(&store);
    let _pinned = client.create(id(90), 80, &b""[..]).await.unwrap();

    let err = client.create(id(91), 50, &b""[..]).await.unwrap_err();
    assert!(matches!(err, ClientError::StoreFull { .. }));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn subscribe_replays_sealed_objects() {
    let store = Store::new(1 << 20);
    let client = client(&store);
    put(&client, id(100), b"a", b"").await;
    put(&client, id(101), b"bb", b"").await;
    let _unsealed = client.create(id(102), 1, &b""[..]).await.unwrap();

    let mut events = client.subscribe().await.unwrap();
    assert_eq!(events.next_event().await.unwrap().object_id, id(100));
    assert_eq!(events.next_event().await.unwrap().object_id, id(101));

    put(&client, id(103), b"c", b"").await;
    assert_eq!(events.next_event().await.unwrap().object_id, id(103));
}
