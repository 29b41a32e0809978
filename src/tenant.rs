use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, EngineConfig};
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine, WAL and compactor per tenant. The tenant is the database
/// name a pgwire client connects to.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    engine_config: EngineConfig,
}

/// Strip anything that could escape the data directory.
fn file_stem(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, engine_config: EngineConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            engine_config,
        }
    }

    /// Get or lazily create the engine for `tenant`. Must be called from
    /// within a tokio runtime: a new engine spawns its background tasks.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.engine_config.clone(),
                )?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                v.insert(engine.clone());
                engine
            }
        };

        info!("tenant {tenant:?} loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, EngineConfig::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let a = tm.get_or_create("studio_north").unwrap();
        let b = tm.get_or_create("studio_south").unwrap();

        let rid = Ulid::new();
        let hours = OperatingHours::new(480, 1320).unwrap();
        a.create_resource(rid, None, hours, SlotStep::default(), None).await.unwrap();
        b.create_resource(rid, None, hours, SlotStep::default(), None).await.unwrap();

        let date = chrono::NaiveDate::from_ymd_opt(2099, 1, 5).unwrap();
        a.create_reservation(NewReservation {
            id: Ulid::new(),
            resource_id: rid,
            date,
            start: 600,
            duration: 60,
            customer: CustomerInfo::default(),
        })
        .await
        .unwrap();

        assert_eq!(a.list_active(rid, Some(date)).await.unwrap().len(), 1);
        assert!(b.list_active(rid, Some(date)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lazy_creation_and_reuse() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let first = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        let second = tm.get_or_create("my_db").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());
        tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());

        let long = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
