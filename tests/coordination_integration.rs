// End-to-end scenarios exercising multiple `Participant`s over the shared
// in-memory `Storage`/`Transport` reference implementations.

use std::sync::Arc;
use std::time::Duration;

use coord_engine::mem::{MemNetwork, MemStorage};
use coord_engine::{EngineConfig, Error, Participant, Path};
use tokio_util::sync::CancellationToken;

async fn cluster(n: usize) -> (Vec<Arc<Participant>>, Arc<MemStorage>) {
    let storage = Arc::new(MemStorage::new());
    let net = MemNetwork::new();
    let mut participants = Vec::new();
    for i in 0..n {
        let p = Participant::bootstrap(
            storage.clone(),
            Arc::new(net.transport(vec![i as u8])),
            EngineConfig::default(),
        )
        .await
        .unwrap();
        participants.push(p);
    }
    (participants, storage)
}

fn nc() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn create_get_delete_a_durable_entry() {
    let (participants, _storage) = cluster(1).await;
    let a = &participants[0];
    let path = Path::root().child("durable");

    a.create(&path, b"v1".to_vec(), false, &nc()).await.unwrap();
    assert_eq!(a.get(&path, &nc()).await.unwrap(), b"v1");

    a.delete(&path, false, &nc()).await.unwrap();
    assert!(matches!(a.get(&path, &nc()).await, Err(Error::EntryNotFound(p)) if p == path));
}

#[tokio::test]
async fn concurrent_create_race_exactly_one_winner() {
    let (participants, _storage) = cluster(2).await;
    let path = Path::root().child("contended");

    let a = participants[0].clone();
    let b = participants[1].clone();
    let path_a = path.clone();
    let path_b = path.clone();

    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.create(&path_a, b"from-a".to_vec(), false, &CancellationToken::new()).await }),
        tokio::spawn(async move { b.create(&path_b, b"from-b".to_vec(), false, &CancellationToken::new()).await }),
    );

    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    let successes = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    let conflicts = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r, Err(Error::DuplicateEntry(_))))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);
}

#[tokio::test]
async fn write_lock_excludes_concurrent_readers_until_released() {
    let (participants, _storage) = cluster(2).await;
    let a = participants[0].clone();
    let b = participants[1].clone();
    let path = Path::root().child("guarded");
    a.create(&path, vec![], false, &nc()).await.unwrap();

    a.acquire_write_lock(&path, &nc()).await.unwrap();

    let b2 = b.clone();
    let path2 = path.clone();
    let reader = tokio::spawn(async move { b2.acquire_read_lock(&path2, &CancellationToken::new()).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!reader.is_finished(), "reader must block while the write lock is held");

    a.release_write_lock(&path, &nc()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("reader should unblock once the write lock is released")
        .unwrap()
        .unwrap();

    b.release_read_lock(&path, &nc()).await.unwrap();
}

#[tokio::test]
async fn ephemeral_entries_are_cleaned_up_when_owner_session_ends() {
    let (participants, _storage) = cluster(2).await;
    let a = participants[0].clone();
    let b = participants[1].clone();
    let path = Path::root().child("member-a");

    a.create(&path, b"alive".to_vec(), true, &nc()).await.unwrap();
    assert_eq!(b.get(&path, &nc()).await.unwrap(), b"alive");

    a.shutdown().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if matches!(b.get(&path, &nc()).await, Err(Error::EntryNotFound(_))) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ephemeral entry was never reclaimed after owner session ended"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn recursive_delete_requires_children_removed_first() {
    let (participants, _storage) = cluster(1).await;
    let a = &participants[0];
    let parent = Path::root().child("group");
    let child = parent.child("member");

    a.create(&parent, vec![], false, &nc()).await.unwrap();
    a.create(&child, vec![], false, &nc()).await.unwrap();

    assert!(
        a.delete(&parent, false, &nc()).await.is_err(),
        "non-empty parent must not delete without the recursive flag"
    );

    a.delete(&child, false, &nc()).await.unwrap();
    a.delete(&parent, false, &nc()).await.unwrap();
    assert!(matches!(a.get(&parent, &nc()).await, Err(Error::EntryNotFound(_))));
}

#[tokio::test]
async fn recursive_delete_removes_an_entire_subtree_in_order() {
    let (participants, _storage) = cluster(2).await;
    let a = participants[0].clone();
    let b = participants[1].clone();
    let parent = Path::root().child("team");
    let members = ["alice", "bob", "carol"].map(|name| parent.child(name));

    a.create(&parent, vec![], false, &nc()).await.unwrap();
    for member in &members {
        a.create(member, vec![], false, &nc()).await.unwrap();
    }
    assert_eq!(
        a.children(&parent, &nc()).await.unwrap(),
        vec!["alice", "bob", "carol"]
    );

    // every participant must observe the same deterministic order, since it
    // comes from the stored entry's own children list, not from whichever
    // participant happens to run the delete.
    assert_eq!(
        b.children(&parent, &nc()).await.unwrap(),
        vec!["alice", "bob", "carol"]
    );

    a.delete(&parent, true, &nc()).await.unwrap();

    assert!(matches!(a.get(&parent, &nc()).await, Err(Error::EntryNotFound(_))));
    for member in &members {
        assert!(matches!(a.get(member, &nc()).await, Err(Error::EntryNotFound(_))));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if matches!(b.get(&parent, &nc()).await, Err(Error::EntryNotFound(_))) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delete invalidation never arrived at b");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn cache_invalidation_is_delivered_to_other_participants() {
    let (participants, _storage) = cluster(2).await;
    let a = participants[0].clone();
    let b = participants[1].clone();
    let path = Path::root().child("shared-value");

    a.create(&path, b"v1".to_vec(), false, &nc()).await.unwrap();
    assert_eq!(b.get(&path, &nc()).await.unwrap(), b"v1"); // populates b's cache

    a.set_value(&path, b"v2".to_vec(), &nc()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if b.get(&path, &nc()).await.unwrap() == b"v2" {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "invalidation never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
