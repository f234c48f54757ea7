//! SHA1 registry for the server-side scripts the protocol requires.
//!
//! The four scripts are loaded into the server out of band; their SHA1 ids
//! are published in the `scripts` hash. We fetch and verify them on every
//! (re)connect, and invoke them with `EVALSHA`.

use parking_lot::RwLock;
use smax_driver::Driver;
use tracing::debug;

use crate::error::{Result, SmaxError};
use crate::Smax;

/// Redis hash in which the script name to SHA1 map is kept.
pub const SCRIPTS_TABLE: &str = "scripts";

/// The required server-side scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    HSetWithMeta,
    HGetWithMeta,
    HMSetWithMeta,
    GetStruct,
}

impl Script {
    pub(crate) const ALL: [Script; 4] = [
        Script::HSetWithMeta,
        Script::HGetWithMeta,
        Script::HMSetWithMeta,
        Script::GetStruct,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Script::HSetWithMeta => "HSetWithMeta",
            Script::HGetWithMeta => "HGetWithMeta",
            Script::HMSetWithMeta => "HMSetWithMeta",
            Script::GetStruct => "GetStruct",
        }
    }

    fn index(self) -> usize {
        match self {
            Script::HSetWithMeta => 0,
            Script::HGetWithMeta => 1,
            Script::HMSetWithMeta => 2,
            Script::GetStruct => 3,
        }
    }
}

#[derive(Default)]
pub(crate) struct ScriptRegistry {
    shas: RwLock<[Option<String>; 4]>,
}

impl ScriptRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// SHA1 for a script, if verified since the last (re)connect.
    pub(crate) fn sha(&self, script: Script) -> Result<String> {
        self.shas.read()[script.index()]
            .clone()
            .ok_or_else(|| SmaxError::ScriptMissing(script.name().to_string()))
    }

    pub(crate) fn clear(&self) {
        *self.shas.write() = Default::default();
    }

    /// Fetch the SHA1 of `name` from the `scripts` hash, without verifying
    /// that the script is loaded.
    pub(crate) async fn fetch_sha1(driver: &Driver, name: &str) -> Result<String> {
        let sha: Option<String> = driver
            .request(redis::cmd("HGET").arg(SCRIPTS_TABLE).arg(name))
            .await?;
        sha.filter(|s| !s.is_empty())
            .ok_or_else(|| SmaxError::ScriptMissing(name.to_string()))
    }

    /// Load and verify all required scripts. Fails on the first script that
    /// is unpublished or not actually loaded into the server.
    pub(crate) async fn load(&self, driver: &Driver) -> Result<()> {
        let mut loaded: [Option<String>; 4] = Default::default();

        for script in Script::ALL {
            let sha = Self::fetch_sha1(driver, script.name()).await?;

            let exists: Vec<i64> = driver
                .request(redis::cmd("SCRIPT").arg("EXISTS").arg(&sha))
                .await?;
            if exists.first().copied() != Some(1) {
                return Err(SmaxError::ScriptMissing(script.name().to_string()));
            }

            debug!(script = script.name(), sha = %sha, "script verified");
            loaded[script.index()] = Some(sha);
        }

        *self.shas.write() = loaded;
        Ok(())
    }
}

impl Smax {
    /// Look up the SHA1 published in the `scripts` hash for a script of the
    /// given name, e.g. to invoke user-defined server scripts with
    /// `EVALSHA`. Fails with [`SmaxError::ScriptMissing`] if no SHA1 is
    /// published under that name.
    pub async fn script_sha1(&self, name: &str) -> Result<String> {
        if name.is_empty() {
            return Err(SmaxError::invalid("script name is empty"));
        }
        match ScriptRegistry::fetch_sha1(&self.inner.driver, name).await {
            Err(e) if e.is_no_service() => Err(self.escalate(e)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unloaded_registry_reports_missing() {
        let reg = ScriptRegistry::new();
        assert!(matches!(
            reg.sha(Script::HSetWithMeta),
            Err(SmaxError::ScriptMissing(_))
        ));
    }

    #[test]
    fn test_clear_forgets_shas() {
        let reg = ScriptRegistry::new();
        reg.shas.write()[Script::GetStruct.index()] = Some("abc".into());
        assert!(reg.sha(Script::GetStruct).is_ok());
        reg.clear();
        assert!(reg.sha(Script::GetStruct).is_err());
    }
}
