//! The orchestrator.
//!
//! One task owns the pool and the session manager and advances both on a
//! 50 ms idle tick; reader tasks, backend calls, verification sockets and
//! the identification poller all report back through bounded channels
//! drained here. Nothing else ever mutates the connection, reconnection
//! or session maps.

use passgate_backend::BackendClient;
use passgate_core::{Clock, Config, KpoResult, Result, SystemClock};
use passgate_face::ident::PollerHandle;
use passgate_face::{IdentEvent, VerifyClient, VerifyEvent, spawn_poller};
use passgate_net::{ConnectionInfo, ListenerKind, Pool, PoolEvent, ReconnectionInfo};
use passgate_session::{
    GTimeRecord, GTimeSink, KpoOutcome, SessionManager, SessionRow, SessionSink, SideRequest,
};
use passgate_store::{CardList, MemRegStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_millis(50);
const WORKER_CHANNEL: usize = 256;

/// Results coming back from worker tasks.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    KpoDone {
        session_id: String,
        outcome: KpoOutcome,
        cid: Option<String>,
    },
}

/// Session sink used when no persistence collaborator is wired in: the
/// row goes to the log only.
pub struct LogSessionSink;

impl SessionSink for LogSessionSink {
    fn log_session(&mut self, row: &SessionRow) -> Result<()> {
        info!(
            time = %row.session_time,
            term = %row.term_id,
            addr = %row.term_addr,
            uid = %row.uid,
            kpo = %row.kpo_result,
            cam = %row.cam_result,
            result = %row.final_result,
            msg = %row.final_msg,
            "session row"
        );
        Ok(())
    }
}

/// GTime sink counterpart of [`LogSessionSink`].
pub struct LogGTimeSink;

impl GTimeSink for LogGTimeSink {
    fn register_gtime_event(&mut self, record: &GTimeRecord) -> Result<()> {
        info!(
            term = %record.term_id,
            addr = %record.term_addr,
            uid = %record.uid,
            time = ?record.time,
            price = ?record.price,
            "gtime event"
        );
        Ok(())
    }
}

pub struct Daemon {
    pub(crate) cfg: Arc<Config>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) pool: Pool,
    pool_rx: mpsc::Receiver<PoolEvent>,
    pub(crate) sessions: SessionManager,
    pub(crate) cards: Arc<CardList>,
    pub(crate) memreg: Arc<MemRegStore>,
    pub(crate) backend: Option<Arc<BackendClient>>,
    pub(crate) verify: Option<VerifyClient>,
    verify_rx: mpsc::Receiver<VerifyEvent>,
    pub(crate) ident: Option<PollerHandle>,
    ident_rx: mpsc::Receiver<IdentEvent>,
    pub(crate) worker_tx: mpsc::Sender<WorkerEvent>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    pub(crate) session_sink: Box<dyn SessionSink>,
    pub(crate) gtime_sink: Box<dyn GTimeSink>,
    stop_tx: watch::Sender<bool>,
    bound: Option<SocketAddr>,
}

/// Clonable handle that requests daemon shutdown.
#[derive(Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

impl Daemon {
    /// Wire the daemon together. Fails fast on configuration problems.
    ///
    /// # Errors
    /// `Error::Config` for invalid configuration.
    pub fn new(
        cfg: Arc<Config>,
        session_sink: Box<dyn SessionSink>,
        gtime_sink: Box<dyn GTimeSink>,
    ) -> Result<Self> {
        cfg.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (pool, pool_rx) = Pool::new(cfg.clone(), clock.clone());
        let sessions = SessionManager::new(cfg.clone(), clock.clone());

        let cards = Arc::new(CardList::new());
        let memreg = Arc::new(MemRegStore::new());

        let backend = if cfg.service_active {
            Some(Arc::new(BackendClient::new(cfg.clone())?))
        } else {
            None
        };

        let (verify_tx, verify_rx) = mpsc::channel(WORKER_CHANNEL);
        let verify = cfg
            .cam_service_active
            .then(|| VerifyClient::new(cfg.clone(), verify_tx));

        let (ident_tx, ident_rx) = mpsc::channel(WORKER_CHANNEL);
        let ident = (cfg.crt.active && cfg.crt.check_time > 0.0)
            .then(|| spawn_poller(cfg.clone(), ident_tx));

        let (worker_tx, worker_rx) = mpsc::channel(WORKER_CHANNEL);
        let (stop_tx, _) = watch::channel(false);

        Ok(Daemon {
            cfg,
            clock,
            pool,
            pool_rx,
            sessions,
            cards,
            memreg,
            backend,
            verify,
            ident,
            ident_rx,
            verify_rx,
            worker_tx,
            worker_rx,
            session_sink,
            gtime_sink,
            stop_tx,
            bound: None,
        })
    }

    /// Request shutdown. Safe to call any number of times.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Handle for requesting shutdown from another task.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    /// Bind the listeners and dial the listed terminals. Returns the main
    /// listener's address (useful when the configured port is 0).
    ///
    /// # Errors
    /// Bind errors are fatal bootstrap failures.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.bound {
            return Ok(addr);
        }
        let addr: SocketAddr = format!("{}:{}", self.cfg.server_addr, self.cfg.server_port)
            .parse()
            .map_err(|e| passgate_core::Error::Config(format!("server address: {e}")))?;
        let bound = self.pool.listen(addr, ListenerKind::Main).await?;

        if let Some(port) = self.cfg.jsp_listener_port {
            let jsp_addr: SocketAddr = format!("{}:{port}", self.cfg.server_addr)
                .parse()
                .map_err(|e| passgate_core::Error::Config(format!("jsp address: {e}")))?;
            self.pool.listen(jsp_addr, ListenerKind::Jsp).await?;
        }

        for terminal in self.pool.listed_terminals() {
            self.pool.connect(terminal);
        }
        self.fetch_terminal_list().await;

        self.bound = Some(bound);
        Ok(bound)
    }

    /// Pull the backend's terminal list and dial every admitted entry.
    /// A failure here is not fatal: the statically configured terminals
    /// keep working.
    async fn fetch_terminal_list(&mut self) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        if self.cfg.termlist_path.is_empty() {
            return;
        }
        match backend.terminal_list().await {
            Ok(entries) => {
                let mut admitted = 0usize;
                for entry in &entries {
                    let Some(settings) = terminal_from_entry(entry) else {
                        continue;
                    };
                    if !self.cfg.terminal_admitted(&settings.ip) {
                        continue;
                    }
                    admitted += 1;
                    self.pool.connect(settings);
                }
                info!(total = entries.len(), admitted, "terminal list fetched");
            }
            Err(e) => warn!(error = %e, "terminal list fetch failed"),
        }
    }

    /// Run until a signal or [`stop`](Daemon::stop).
    ///
    /// # Errors
    /// Bootstrap failures (bind errors) propagate; the caller maps them
    /// to exit code 1.
    pub async fn run(&mut self) -> Result<()> {
        let addr = self.bind().await?;

        self.spawn_signal_task();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(version = passgate_core::VERSION, %addr, "passgate running");

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                Some(ev) = self.pool_rx.recv() => {
                    for gateway_event in self.pool.handle_event(ev) {
                        self.dispatch(gateway_event);
                    }
                }
                Some(ev) = self.verify_rx.recv() => self.handle_verify_event(ev),
                Some(ev) = self.ident_rx.recv() => self.handle_ident_event(ev),
                Some(ev) = self.worker_rx.recv() => self.handle_worker_event(ev),
                _ = ticker.tick() => self.tick(),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn spawn_signal_task(&self) {
        let stop_tx = self.stop_tx.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        tokio::select! {
                            _ = ctrl_c => {}
                            _ = term.recv() => {}
                        }
                    }
                    Err(_) => {
                        let _ = ctrl_c.await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("shutdown signal received");
            let _ = stop_tx.send(true);
        });
    }

    fn shutdown(&mut self) {
        info!("shutting down");
        if let Some(verify) = &self.verify {
            verify.close_all();
        }
        if let Some(ident) = &self.ident {
            ident.stop();
        }
        self.pool.close();
    }

    fn tick(&mut self) {
        self.pool.tick();
        let requests = self.sessions.tick(&mut self.pool, self.session_sink.as_mut());
        self.execute_side_requests(requests);
    }

    pub(crate) fn execute_side_requests(&mut self, requests: Vec<SideRequest>) {
        for request in requests {
            match request {
                SideRequest::Kpo {
                    session_id,
                    uid,
                    terminal_id,
                    tag_type,
                    lockers,
                } => self.spawn_kpo(session_id, uid.to_string(), terminal_id, tag_type, lockers),

                SideRequest::CamVerify {
                    session_id,
                    cam_pid,
                    person_id,
                } => {
                    if let Some(verify) = &self.verify {
                        let request_id = verify.start(&session_id, &cam_pid, &person_id);
                        self.sessions.set_cam_request(&session_id, &request_id);
                    } else if self.ident.is_some() && !self.cfg.crt.identification_mode {
                        // verification through the identification poller:
                        // resolve when the person shows up at the camera
                        let request_id = format!("{cam_pid}_{person_id}");
                        if let Some(ident) = &self.ident {
                            let _ = ident.commands.try_send(
                                passgate_face::IdentCommand::AddSessionRequest {
                                    session_id: session_id.clone(),
                                    cam_id: cam_pid,
                                    pid: person_id,
                                },
                            );
                        }
                        self.sessions.set_cam_request(&session_id, &request_id);
                    } else {
                        warn!(session = %session_id, "verification requested while inactive");
                    }
                }

                SideRequest::Report {
                    uid,
                    terminal_id,
                    granted,
                    tag_type,
                    role,
                } => {
                    let Some(backend) = self.backend.clone() else {
                        continue;
                    };
                    tokio::spawn(async move {
                        if let Err(e) = backend
                            .report_event(uid.as_str(), &terminal_id, granted, tag_type, role.as_deref())
                            .await
                        {
                            warn!(terminal = %terminal_id, error = %e, "pass report failed");
                        }
                    });
                }

                SideRequest::BanAfterPass { cam_id, pid } => {
                    if let Some(ident) = &self.ident {
                        let _ = ident.commands.try_send(
                            passgate_face::IdentCommand::BanAfterPass { cam_id, pid },
                        );
                    }
                }
            }
        }
    }

    fn spawn_kpo(
        &self,
        session_id: String,
        uid: String,
        terminal_id: String,
        tag_type: passgate_core::TagType,
        lockers: Vec<passgate_core::LockerInfo>,
    ) {
        let worker_tx = self.worker_tx.clone();
        let cfg = self.cfg.clone();

        let Some(backend) = self.backend.clone() else {
            // backend disabled: behave like an immediately granted check
            let outcome = KpoOutcome {
                result: KpoResult::Yes,
                message: cfg.service_fixed_msg.clone(),
            };
            let _ = worker_tx.try_send(WorkerEvent::KpoDone {
                session_id,
                outcome,
                cid: None,
            });
            return;
        };

        tokio::spawn(async move {
            let decision = backend
                .check_access(&uid, &terminal_id, tag_type, &lockers, None)
                .await;

            let (outcome, lookup_cid) = match decision {
                Ok(decision) => (
                    KpoOutcome {
                        result: decision.result,
                        message: decision.message,
                    },
                    true,
                ),
                Err(e) => {
                    warn!(session = %session_id, error = %e, "backend check failed");
                    let outcome = if cfg.service_autofix_expired {
                        KpoOutcome {
                            result: KpoResult::Yes,
                            message: cfg.service_fixed_msg.clone(),
                        }
                    } else {
                        KpoOutcome {
                            result: KpoResult::No,
                            message: cfg.service_link_err_msg.clone(),
                        }
                    };
                    (outcome, false)
                }
            };

            let cid = if lookup_cid && cfg.cam_service_active {
                backend.client_id(&uid).await.unwrap_or_default()
            } else {
                None
            };

            let _ = worker_tx
                .send(WorkerEvent::KpoDone {
                    session_id,
                    outcome,
                    cid,
                })
                .await;
        });
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::KpoDone {
                session_id,
                outcome,
                cid,
            } => {
                debug!(
                    session = %session_id,
                    result = outcome.result.as_str(),
                    "backend verdict"
                );
                self.sessions.set_kpo_outcome(&session_id, outcome, cid);
            }
        }
    }

    fn handle_verify_event(&mut self, event: VerifyEvent) {
        match event {
            VerifyEvent::Verdict {
                request_id,
                session_id,
                result,
                message,
            } => {
                info!(session = %session_id, result = result.as_str(), "verification verdict");
                self.sessions
                    .set_cam_outcome(&session_id, &request_id, result, message);
            }
            VerifyEvent::Progress {
                request_id,
                session_id,
                percent,
            } => {
                self.sessions
                    .set_cam_progress(&session_id, &request_id, percent);
            }
        }
    }

    fn handle_ident_event(&mut self, event: IdentEvent) {
        let IdentEvent::Identified {
            terminal_id,
            pid,
            fio,
            cam_id,
            score,
            raw,
        } = event;

        if !self.cfg.crt.identification_mode {
            // verification mode: the event answers a pending request
            let request_id = format!("{cam_id}_{pid}");
            if self.sessions.resolve_cam_request(
                &request_id,
                passgate_core::CamResult::Yes,
                fio.clone(),
            ) {
                info!(request = %request_id, "pending verification resolved");
            } else {
                debug!(request = %request_id, "identification without pending request");
            }
            return;
        }

        self.dispatch_identification(&terminal_id, &pid, &fio, &cam_id, score, raw);
    }

    // --- read-only status surface -------------------------------------

    #[must_use]
    pub fn connection_listing(&self) -> Vec<ConnectionInfo> {
        self.pool.connections()
    }

    #[must_use]
    pub fn reconnection_listing(&self) -> Vec<ReconnectionInfo> {
        self.pool.reconnections()
    }

    #[must_use]
    pub fn verify_listing(&self) -> Vec<passgate_face::VerifyRequestInfo> {
        self.verify
            .as_ref()
            .map(VerifyClient::requests)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn card_list(&self) -> &Arc<CardList> {
        &self.cards
    }

    #[must_use]
    pub fn memreg_store(&self) -> &Arc<MemRegStore> {
        &self.memreg
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build settings from one terminal-list entry. Entries carry `ID` and a
/// config string under `IP` (which may itself embed type and modifier
/// fields).
fn terminal_from_entry(
    entry: &serde_json::Map<String, serde_json::Value>,
) -> Option<passgate_core::TerminalSettings> {
    let id = entry.get("ID").and_then(serde_json::Value::as_str).unwrap_or_default();
    let ip = entry.get("IP").and_then(serde_json::Value::as_str)?;
    let spec = if id.is_empty() {
        ip.to_string()
    } else {
        format!("{id}:{ip}")
    };
    passgate_core::TerminalSettings::parse(&spec).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_terminal_from_entry() {
        let settings = terminal_from_entry(&entry(json!({
            "ID": "T1",
            "IP": "192.168.12.232:8902:type=jsp"
        })))
        .unwrap();
        assert_eq!(settings.id, "T1");
        assert_eq!(settings.ip, "192.168.12.232");
        assert_eq!(settings.port, 8902);

        // no ID: the address field stands alone
        let settings = terminal_from_entry(&entry(json!({
            "IP": "10.0.0.5:type=pocket"
        })))
        .unwrap();
        assert_eq!(settings.id, "");
        assert_eq!(settings.ip, "10.0.0.5");

        assert!(terminal_from_entry(&entry(json!({"ID": "T1"}))).is_none());
        assert!(terminal_from_entry(&entry(json!({"IP": "not-an-ip"}))).is_none());
    }

    #[test]
    fn test_stop_handle_is_idempotent() {
        let (tx, rx) = watch::channel(false);
        let handle = StopHandle(tx);
        handle.stop();
        handle.stop();
        assert!(*rx.borrow());
    }
}
