//! Installed index access methods.

use tracing::debug;

use super::queries::ACCESS_METHODS;
use super::{PgError, PgSettings};
use crate::advisor::{AccessMethod, CapabilitySet};
use crate::store::{CapabilityProvider, StoreError};

/// Reads `pg_am` of the server `settings` point to, known as `srvid`.
pub struct PgCapabilities {
    settings: PgSettings,
    srvid: i32,
}

impl PgCapabilities {
    pub fn new(settings: PgSettings, srvid: i32) -> Self {
        Self { settings, srvid }
    }
}

impl CapabilityProvider for PgCapabilities {
    fn supported_access_methods(&self, srvid: i32) -> Result<CapabilitySet, StoreError> {
        if srvid != self.srvid {
            return Err(StoreError::Unavailable(format!(
                "no connection settings for server {}",
                srvid
            )));
        }

        let mut client = self.settings.connect()?;
        let rows = client
            .query(ACCESS_METHODS, &[])
            .map_err(|e| PgError::query(&self.settings.maintenance_db, &e))?;

        let methods: Vec<AccessMethod> = rows
            .iter()
            .map(|row| AccessMethod::from(row.get::<_, String>(0)))
            .collect();
        debug!(srvid, access_methods = ?methods, "installed index access methods");
        Ok(CapabilitySet::new(methods))
    }
}
