use crate::blocking::{run_bounded, run_settled};
use crate::error::Result;
use crate::os::AutoStartOs;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Name of the login launch entry
pub const AUTOSTART_ENTRY: &str = "Pitaya";

/// Login-time launch registration for the current executable
#[derive(Clone)]
pub struct AutoStartManager {
    autostart: Arc<dyn AutoStartOs>,
    command: String,
    call_timeout: Duration,
}

impl AutoStartManager {
    pub fn new(autostart: Arc<dyn AutoStartOs>, command: String, call_timeout: Duration) -> Self {
        Self {
            autostart,
            command,
            call_timeout,
        }
    }

    /// Register the running executable
    pub fn for_current_exe(autostart: Arc<dyn AutoStartOs>, call_timeout: Duration) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let command = format!("\"{}\"", exe.display());
        Ok(Self::new(autostart, command, call_timeout))
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub async fn enable(&self) -> Result<()> {
        let autostart = Arc::clone(&self.autostart);
        let command = self.command.clone();
        run_settled("register login launch entry", self.call_timeout, move || {
            autostart.register(AUTOSTART_ENTRY, &command)
        })
        .await?;
        info!("Autostart enabled: {}", self.command);
        Ok(())
    }

    /// Succeeds when no entry exists
    pub async fn disable(&self) -> Result<()> {
        let autostart = Arc::clone(&self.autostart);
        let removed = run_settled("remove login launch entry", self.call_timeout, move || {
            autostart.unregister(AUTOSTART_ENTRY)
        })
        .await?;
        if removed {
            info!("Autostart disabled");
        }
        Ok(())
    }

    /// True when an entry exists; never mutates
    pub async fn check(&self) -> Result<bool> {
        let autostart = Arc::clone(&self.autostart);
        let command = run_bounded("read login launch entry", self.call_timeout, move || {
            autostart.registered_command(AUTOSTART_ENTRY)
        })
        .await?;
        Ok(command.is_some())
    }
}

impl std::fmt::Debug for AutoStartManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoStartManager")
            .field("command", &self.command)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::memory::InMemoryAutoStart;

    fn manager() -> (Arc<InMemoryAutoStart>, AutoStartManager) {
        let store = Arc::new(InMemoryAutoStart::new());
        let manager = AutoStartManager::new(
            store.clone(),
            "\"C:\\Pitaya\\pitaya-daemon.exe\"".to_string(),
            Duration::from_secs(1),
        );
        (store, manager)
    }

    #[tokio::test]
    async fn test_enable_check_disable() {
        let (store, manager) = manager();
        assert!(!manager.check().await.unwrap());

        manager.enable().await.unwrap();
        manager.enable().await.unwrap();
        assert!(manager.check().await.unwrap());
        assert_eq!(
            store.registered_command(AUTOSTART_ENTRY).unwrap().as_deref(),
            Some(manager.command())
        );

        manager.disable().await.unwrap();
        assert!(!manager.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_when_absent_succeeds() {
        let (_, manager) = manager();
        assert!(manager.disable().await.is_ok());
    }

    #[test]
    fn test_for_current_exe_quotes_path() {
        let manager = AutoStartManager::for_current_exe(
            Arc::new(InMemoryAutoStart::new()),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(manager.command().starts_with('"'));
        assert!(manager.command().ends_with('"'));
    }
}
