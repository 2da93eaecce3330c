use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::background;
use crate::engine::Engine;
use crate::limits::*;

/// Background behaviour every tenant engine gets.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub reminder_lead_minutes: i64,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            reminder_lead_minutes: 24 * 60,
        }
    }
}

/// One engine + WAL + background tasks per tenant.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily create an engine for the given tenant. Names are
    /// case-insensitive and limited to ASCII letters, digits, `_` and `-`,
    /// so each tenant maps to exactly one WAL file.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        let name = tenant_key(tenant)?;
        if let Some(engine) = self.engines.get(&name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; the entry API
        // makes sure only one engine (and one WAL writer) survives.
        let entry = self.engines.entry(name.clone());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                e.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(background::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));
        tokio::spawn(background::run_reminders(
            engine.clone(),
            self.settings.reminder_lead_minutes,
        ));

        tracing::info!("opened tenant {name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

/// Map a database name to its engine key and WAL file stem.
fn tenant_key(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    if tenant.is_empty()
        || !tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid tenant name {tenant:?}: use letters, digits, '_' or '-'"),
        ));
    }
    Ok(tenant.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("salonbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, TenantSettings::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("salon_a").unwrap();
        let eng_b = tm.get_or_create("salon_b").unwrap();

        // Same business id in both tenants.
        let business = Ulid::new();
        eng_a.create_business(business, "A".into(), None).await.unwrap();
        eng_b.create_business(business, "B".into(), None).await.unwrap();

        let service = Ulid::new();
        eng_a
            .create_service(Service {
                id: service,
                business_id: business,
                name: "Haircut".into(),
                duration_minutes: 60,
                price_cents: 2500,
                category: None,
                active: true,
            })
            .await
            .unwrap();

        assert_eq!(eng_a.business_services(business).len(), 1);
        assert!(eng_b.business_services(business).is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_salon").unwrap();
        assert!(dir.join("my_salon.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_rejects_path_and_punctuation() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        for bad in ["../evil", "../..", "shop.a", "shop a", "", "caf\u{e9}"] {
            let err = tm.get_or_create(bad).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{bad:?}");
        }
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn distinct_names_never_share_a_wal() {
        let dir = test_data_dir("distinct_wal");
        let tm = manager(dir.clone());

        let plain = tm.get_or_create("shopa").unwrap();
        assert!(tm.get_or_create("shop.a").is_err());
        let other = tm.get_or_create("shop_a").unwrap();
        assert!(!Arc::ptr_eq(&plain, &other));
        assert!(dir.join("shopa.wal").exists());
        assert!(dir.join("shop_a.wal").exists());
    }

    #[tokio::test]
    async fn tenant_names_are_case_insensitive() {
        let dir = test_data_dir("case");
        let tm = manager(dir.clone());

        let lower = tm.get_or_create("shopa").unwrap();
        let upper = tm.get_or_create("ShopA").unwrap();
        assert!(Arc::ptr_eq(&lower, &upper));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }
}
