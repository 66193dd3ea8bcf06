pub mod apply;
pub mod init;
pub mod output;
pub mod state;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use sponge_core::{Composition, EnvironmentParams, compose};
use sponge_engine::{Applier, LocalProvisioner};
use sponge_state::StateStore;
use tokio::sync::watch;
use tracing::warn;

/// Paths shared by every command.
pub struct Context {
    pub state: PathBuf,
    pub config: PathBuf,
}

impl Context {
    pub fn params(&self) -> anyhow::Result<EnvironmentParams> {
        EnvironmentParams::from_file(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))
    }

    pub fn composition(&self) -> anyhow::Result<Composition> {
        let params = self.params()?;
        Ok(compose(&params)?)
    }

    pub fn store(&self) -> anyhow::Result<StateStore> {
        if let Some(dir) = self.state.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        StateStore::open(&self.state)
            .with_context(|| format!("failed to open state at {}", self.state.display()))
    }

    /// The local provisioner keeps its resources next to the state database.
    pub fn resources_path(&self) -> PathBuf {
        self.state.with_extension("resources.json")
    }

    pub fn applier(&self) -> anyhow::Result<Applier<LocalProvisioner>> {
        let store = self.store()?;
        let provider = LocalProvisioner::open(&self.resources_path())?;
        Ok(Applier::new(store, Arc::new(provider)).with_holder(holder()))
    }
}

/// A cancellation channel that flips on Ctrl-C.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight modules");
            let _ = tx.send(true);
        }
    });
    rx
}

fn holder() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "sponge".to_string());
    format!("{user}-{}", std::process::id())
}
