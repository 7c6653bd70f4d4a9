//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use mastermx_core::storage::Result;
use mastermx_core::{
    FixedClock, MasterService, MemoryStore, ObjectMeta, ObjectStore, PutMode, RetentionConfig,
    Schema, SequentialIds, StorageError, StoreLayout, StoredObject, Table, Value, VersionTag,
};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// A master-schema row for `(tow, net)`
pub fn sample_row(tow: i64, net: i64) -> Vec<Value> {
    vec![
        Value::Text("CR2407".into()),
        Value::Text(format!("ST{tow:03}")),
        Value::Integer(tow),
        Value::Integer(net),
        Value::Float(-33.5 + tow as f64 * 0.01),
        Value::Float(151.25),
        Value::Float(120.0),
        Value::Float(84.5),
        Value::Integer(333),
        Value::Boolean(net % 2 == 1),
        Value::Text("2024-07-01T08:00:00Z".into()),
        Value::Text("2024-07-01T08:20:00Z".into()),
        Value::Text(format!("tow {tow} net {net}")),
    ]
}

/// `count` rows with tows `first_tow..` and net 1
pub fn sample_table(first_tow: i64, count: usize) -> Table {
    let rows = (0..count as i64)
        .map(|i| sample_row(first_tow + i, 1))
        .collect();
    Table::new(Schema::master(), rows).unwrap()
}

/// Memory store that can be told to fail writes under a prefix or to go
/// unreachable entirely.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    failing_prefixes: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        self.failing_prefixes.lock().unwrap().push(prefix.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn check_write(&self, key: &str) -> Result<()> {
        self.check_online()?;
        let failing = self.failing_prefixes.lock().unwrap();
        if failing.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            return Err(StorageError::Backend(format!("injected write failure for {key}")));
        }
        Ok(())
    }

    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        self.inner
            .list(prefix)
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.key)
            .collect()
    }

    pub async fn content(&self, key: &str) -> Bytes {
        self.inner.get(key).await.unwrap().data
    }

    pub async fn put_raw(&self, key: &str, data: impl Into<Bytes>) -> VersionTag {
        self.inner
            .put(key, data.into(), PutMode::Overwrite)
            .await
            .unwrap()
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.check_online()?;
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.check_online()?;
        self.inner.head(key).await
    }

    async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> Result<VersionTag> {
        self.check_write(key)?;
        self.inner.put(key, data, mode).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<VersionTag> {
        self.check_write(dst)?;
        self.inner.copy(src, dst).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_write(key)?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.check_online()?;
        self.inner.list(prefix).await
    }
}

pub fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap(),
    ))
}

/// A service over a fresh `FaultyStore` with deterministic time and ids
pub fn service_with(layout: StoreLayout) -> (Arc<FaultyStore>, Arc<FixedClock>, MasterService) {
    let store = Arc::new(FaultyStore::new());
    let clock = fixed_clock();
    let service = MasterService::with_sources(
        store.clone(),
        layout,
        RetentionConfig::default(),
        clock.clone(),
        Arc::new(SequentialIds::new("id")),
    );
    (store, clock, service)
}

pub fn service() -> (Arc<FaultyStore>, Arc<FixedClock>, MasterService) {
    service_with(StoreLayout::default())
}
