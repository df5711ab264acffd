//! Wiring of the reconciliation loop from settings and a platform

use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use dg_core::{
    EventSink, Enforcer, GuardSettings, HostKey, JsonWhitelist, Platform, Reconciler, ShutdownSignal,
    TrustEngine,
};
use dg_error::Result;

pub struct Monitor {
    reconciler: Reconciler,
    /// No host key: registered storage cannot be verified
    pub degraded: bool,
}

impl Monitor {
    pub fn build(settings: &GuardSettings, platform: &Platform, events: Arc<dyn EventSink>) -> Result<Self> {
        let key = match HostKey::manage(&settings.host_key_file) {
            Ok(key) => {
                info!(path = %key.path().display(), "Host key ready");
                Some(key)
            }
            Err(e) => {
                warn!(
                    path = %settings.host_key_file.display(),
                    error = %e,
                    "Host key unavailable, running in degraded mode: registered storage will fail verification"
                );
                None
            }
        };
        let degraded = key.is_none();

        let whitelist = Arc::new(JsonWhitelist::open(&settings.whitelist_file)?);
        let trust = Arc::new(TrustEngine::new(key, platform.inspector.clone(), events.clone()));

        let strategies = platform.strategies(&settings.strategies);
        if strategies.len() < settings.strategies.len() {
            warn!(
                enabled = ?settings.strategies,
                available = strategies.len(),
                "Some enabled strategies are not available on this platform"
            );
        }
        let enforcer = Enforcer::new(strategies, settings.enforcement_timeout(), events.clone());

        let reconciler = Reconciler::new(
            platform.enumerator.clone(),
            whitelist,
            trust,
            enforcer,
            events,
            settings.loop_timings(),
        );

        Ok(Self { reconciler, degraded })
    }

    /// Run the loop on its own thread until `shutdown` is requested
    pub fn spawn(mut self, shutdown: Arc<ShutdownSignal>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("dg-reconcile".into())
            .spawn(move || self.reconciler.run(&shutdown))
    }
}
