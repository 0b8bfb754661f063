//! User sessions and their scheduled tasks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use exchange_core::api::Credentials;
use exchange_core::config::UserConfig;
use exchange_core::types::Settings;
use exchange_core::{Error, Result};
use risk_manager::{PerformanceHistory, PerformanceSummary, TradeRecord};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, ScanOutcome};
use crate::scheduler::{Scheduler, TaskKind};

/// One trading account: credentials, editable settings and track record.
pub struct UserSession {
    id: String,
    credentials: Credentials,
    settings: RwLock<Settings>,
    settings_path: Option<PathBuf>,
    active: AtomicBool,
    performance: Mutex<PerformanceHistory>,
}

impl UserSession {
    pub fn new(
        id: impl Into<String>,
        credentials: Credentials,
        settings: Settings,
        settings_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            credentials,
            settings: RwLock::new(settings),
            settings_path,
            active: AtomicBool::new(true),
            performance: Mutex::new(PerformanceHistory::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Gate for every order path.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::TradingStopped(self.id.clone()))
        }
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Parse, validate and persist a single key. Nothing changes on error.
    pub async fn update_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut current = self.settings.write().await;
        let mut next = current.clone();
        next.set(key, value)?;
        if let Some(path) = &self.settings_path {
            next.save(path)?;
        }
        *current = next;
        info!(user_id = %self.id, key, value, "Setting updated");
        Ok(())
    }

    pub async fn record_trade(&self, trade: TradeRecord) {
        self.performance.lock().await.record(trade);
    }

    pub async fn performance_ratio(&self) -> f64 {
        self.performance.lock().await.risk_adjusted_ratio()
    }

    pub async fn performance_summary(&self) -> PerformanceSummary {
        self.performance.lock().await.summary()
    }
}

/// Settings from disk, or defaults written back so the user can edit them.
fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) if path.exists() => Settings::load(path),
        Some(path) => {
            let settings = Settings::default();
            settings.save(path)?;
            info!(path = %path.display(), "Created default settings file");
            Ok(settings)
        }
        None => Ok(Settings::default()),
    }
}

/// Registered sessions and the recurring work running for each.
pub struct SessionManager {
    engine: Arc<Engine>,
    scheduler: Arc<Scheduler>,
    sessions: DashMap<String, Arc<UserSession>>,
}

impl SessionManager {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            scheduler: Arc::new(Scheduler::new()),
            sessions: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn session(&self, user_id: &str) -> Option<Arc<UserSession>> {
        self.sessions.get(user_id).map(|s| s.clone())
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Create a session and start its scan, monitor and report loops.
    ///
    /// Re-registering a user restarts it from scratch.
    pub fn register(&self, user: &UserConfig) -> Result<Arc<UserSession>> {
        let settings = load_settings(user.settings_file.as_deref())?;
        let session = Arc::new(UserSession::new(
            user.id.clone(),
            Credentials::new(user.api_key.clone(), user.secret_key.clone()),
            settings,
            user.settings_file.clone(),
        ));
        self.start(session.clone());
        Ok(session)
    }

    /// Start an already-built session.
    pub fn start(&self, session: Arc<UserSession>) {
        let user_id = session.id().to_string();
        if self.sessions.contains_key(&user_id) {
            self.stop(&user_id);
        }
        self.sessions.insert(user_id.clone(), session.clone());

        let config = self.engine.config().clone();

        let (engine, scheduler, scan_session) =
            (self.engine.clone(), self.scheduler.clone(), session.clone());
        self.scheduler
            .spawn_recurring(&user_id, TaskKind::Scan, config.scan_interval(), move || {
                let engine = engine.clone();
                let scheduler = scheduler.clone();
                let session = scan_session.clone();
                async move {
                    // A pending funds recheck owns the next scan.
                    if scheduler.is_scheduled(session.id(), TaskKind::FundsRecheck) {
                        return;
                    }
                    scan(engine, scheduler, session).await;
                }
            });

        let (engine, monitor_session) = (self.engine.clone(), session.clone());
        self.scheduler.spawn_recurring(
            &user_id,
            TaskKind::Monitor,
            config.monitor_interval(),
            move || {
                let engine = engine.clone();
                let session = monitor_session.clone();
                async move {
                    if let Err(e) = engine.run_monitor(&session).await {
                        warn!(user_id = session.id(), error = %e, "Monitor tick failed");
                    }
                }
            },
        );

        let (engine, report_session) = (self.engine.clone(), session);
        self.scheduler.spawn_recurring(
            &user_id,
            TaskKind::Report,
            config.report_interval(),
            move || {
                let engine = engine.clone();
                let session = report_session.clone();
                async move {
                    if let Err(e) = engine.run_report(&session).await {
                        warn!(user_id = session.id(), error = %e, "Daily report failed");
                    }
                }
            },
        );

        info!(user_id, "Trading started");
    }

    /// Stop trading for a user. Open positions stay on the exchange.
    pub fn stop(&self, user_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(user_id) else {
            return false;
        };
        session.deactivate();
        self.scheduler.cancel_user(user_id);
        let dropped = self.engine.forget_user(user_id);
        info!(user_id, dropped_states = dropped, "Trading stopped");
        true
    }

    pub fn stop_all(&self) {
        for user_id in self.user_ids() {
            self.stop(&user_id);
        }
    }

    fn require(&self, user_id: &str) -> Result<Arc<UserSession>> {
        self.session(user_id)
            .ok_or_else(|| Error::validation(format!("unknown user '{user_id}'")))
    }

    /// Turning hedging on switches the account to hedge mode first; when the
    /// exchange refuses, the setting is rejected unchanged.
    pub async fn update_setting(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let session = self.require(user_id)?;
        let mut next = session.settings().await;
        next.set(key, value)?;
        if key == "hedging_enabled" && next.hedging_enabled {
            self.engine.enable_hedge_mode(&session).await.map_err(|e| {
                warn!(user_id, error = %e, "Could not switch to hedge mode");
                Error::InvalidSetting {
                    key: key.to_string(),
                    message: format!("hedge mode unavailable: {}", e.user_message()),
                }
            })?;
        }
        session.update_setting(key, value).await
    }

    pub async fn get_setting(&self, user_id: &str, key: &str) -> Result<String> {
        self.require(user_id)?.settings().await.get(key)
    }

    /// Market-close one symbol, or every position when `symbol` is `None`.
    pub async fn close_positions(&self, user_id: &str, symbol: Option<&str>) -> Result<usize> {
        let session = self.require(user_id)?;
        self.engine.close_positions(&session, symbol).await
    }
}

/// One scan; on insufficient funds, park the recurring scan behind a
/// one-shot recheck after the cooldown.
async fn scan(engine: Arc<Engine>, scheduler: Arc<Scheduler>, session: Arc<UserSession>) {
    match engine.run_scan(&session).await {
        Ok(ScanOutcome::InsufficientFunds) => {
            let cooldown = engine.config().funds_cooldown();
            let recheck_engine = engine.clone();
            let recheck_session = session.clone();
            scheduler.spawn_once(session.id(), TaskKind::FundsRecheck, cooldown, async move {
                if let Err(e) = recheck_engine.run_scan(&recheck_session).await {
                    warn!(user_id = recheck_session.id(), error = %e, "Funds recheck failed");
                }
            });
        }
        Ok(outcome) => {
            debug!(user_id = session.id(), ?outcome, "Scan finished");
        }
        Err(e) => {
            error!(user_id = session.id(), error = %e, "Scan failed");
        }
    }
}
