//! Racing consumers against one shared store: the capacity bound must hold
//! under any interleaving.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use turnstile::{
    AdmissionGate, BucketKey, KeyResolver, MemorySink, MemoryStore, Outcome, PolicyRegistry,
    PolicySpec, RequestMeta, Tier, TokenBucketEngine,
};

const T0: u64 = 1_700_000_000_000_000_000;

fn key(identity: &str) -> BucketKey {
    BucketKey::new(identity, "search", Tier::Free)
}

// A CAS attempt only loses to another racer's one successful write, so
// `racers` attempts can never exhaust; the wide timeout keeps scheduling
// noise out of the property under test.
fn contested_engine(store: Arc<MemoryStore>, racers: usize) -> TokenBucketEngine<MemoryStore> {
    TokenBucketEngine::new(store)
        .with_cas_attempts(racers)
        .with_store_timeout(Duration::from_secs(10))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_consumers_admit_exactly_capacity() {
    const RACERS: usize = 64;
    const CAPACITY: u32 = 8;

    let engine = Arc::new(contested_engine(Arc::new(MemoryStore::new()), RACERS));
    let spec = PolicySpec::new(CAPACITY, 1.0 / 60.0).unwrap();

    let tasks: Vec<_> = (0..RACERS)
        .map(|_| {
            let engine = engine.clone();
            let key = key("hot-client");
            tokio::spawn(async move { engine.try_consume(&key, &spec, T0).await })
        })
        .collect();

    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("consume failed"))
        .collect();

    let admitted = outcomes.iter().filter(|o| o.admitted).count();
    assert_eq!(admitted, CAPACITY as usize);
    assert_eq!(outcomes.len() - admitted, RACERS - CAPACITY as usize);
    // Every loser saw the same drained bucket.
    assert!(outcomes.iter().filter(|o| !o.admitted).all(|o| o.state.tokens < 1.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_race_independently() {
    const RACERS_PER_KEY: usize = 16;
    const CAPACITY: u32 = 4;

    let engine = Arc::new(contested_engine(Arc::new(MemoryStore::new()), 2 * RACERS_PER_KEY));
    let spec = PolicySpec::new(CAPACITY, 1.0 / 60.0).unwrap();

    let tasks: Vec<_> = (0..2 * RACERS_PER_KEY)
        .map(|i| {
            let engine = engine.clone();
            let key = key(if i % 2 == 0 { "client-a" } else { "client-b" });
            tokio::spawn(async move {
                let out = engine.try_consume(&key, &spec, T0).await.expect("consume failed");
                (key.identity.clone(), out.admitted)
            })
        })
        .collect();

    let results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    for identity in ["client-a", "client-b"] {
        let admitted = results.iter().filter(|(id, ok)| id == identity && *ok).count();
        assert_eq!(admitted, CAPACITY as usize, "bucket for {identity}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fleet_of_engines_shares_one_capacity() {
    const INSTANCES: usize = 4;
    const CALLS_PER_INSTANCE: usize = 10;
    const CAPACITY: u32 = 6;

    // Four engines standing in for four processes; only the store is shared.
    let store = Arc::new(MemoryStore::new());
    let engines: Vec<_> = (0..INSTANCES)
        .map(|_| Arc::new(contested_engine(store.clone(), INSTANCES * CALLS_PER_INSTANCE)))
        .collect();
    let spec = PolicySpec::new(CAPACITY, 1.0 / 60.0).unwrap();

    let mut tasks = Vec::new();
    for engine in &engines {
        for _ in 0..CALLS_PER_INSTANCE {
            let engine = engine.clone();
            let key = key("client-1");
            tasks.push(tokio::spawn(async move { engine.try_consume(&key, &spec, T0).await }));
        }
    }

    let admitted = join_all(tasks)
        .await
        .into_iter()
        .filter(|joined| {
            joined
                .as_ref()
                .expect("task panicked")
                .as_ref()
                .expect("consume failed")
                .admitted
        })
        .count();

    assert_eq!(admitted, CAPACITY as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gate_checks_admit_exactly_capacity() {
    const RACERS: usize = 32;
    const CAPACITY: u32 = 5;

    let registry = PolicyRegistry::new().with_policy(
        "search",
        Tier::Free,
        PolicySpec::new(CAPACITY, 1.0 / 60.0).unwrap(),
    );
    let sink = MemorySink::new();
    let gate = Arc::new(AdmissionGate::new(
        KeyResolver::default(),
        registry,
        contested_engine(Arc::new(MemoryStore::new()), RACERS),
        sink.clone(),
    ));

    let tasks: Vec<_> = (0..RACERS)
        .map(|_| {
            let gate = gate.clone();
            let meta = RequestMeta::new().with_api_key("client-1");
            tokio::spawn(async move { gate.check_at(&meta, "search", T0).await })
        })
        .collect();

    let decisions: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked").expect("valid identity"))
        .collect();

    let admitted = decisions.iter().filter(|d| d.outcome == Outcome::Admitted).count();
    let refused = decisions.iter().filter(|d| d.outcome == Outcome::Refused).count();
    assert_eq!(admitted, CAPACITY as usize);
    assert_eq!(refused, RACERS - CAPACITY as usize);
    // One event per decision, even with every call in flight at once.
    assert_eq!(sink.len(), RACERS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refill_window_caps_total_admissions() {
    const RACERS: usize = 24;
    const CAPACITY: u32 = 4;
    const SEC: u64 = 1_000_000_000;

    // Two racing waves one second apart at 2 tokens/s: the first wave gets the
    // full bucket, the second only what the elapsed second refilled.
    let engine = Arc::new(contested_engine(Arc::new(MemoryStore::new()), RACERS));
    let spec = PolicySpec::new(CAPACITY, 2.0).unwrap();

    for (wave, expected) in [(T0, CAPACITY as usize), (T0 + SEC, 2)] {
        let tasks: Vec<_> = (0..RACERS)
            .map(|_| {
                let engine = engine.clone();
                let key = key("client-1");
                tokio::spawn(async move { engine.try_consume(&key, &spec, wave).await })
            })
            .collect();

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|joined| {
                joined
                    .as_ref()
                    .expect("task panicked")
                    .as_ref()
                    .expect("consume failed")
                    .admitted
            })
            .count();
        assert_eq!(admitted, expected, "wave at {wave}");
    }
}
