//! The session manager: owns every session, advances them from the idle
//! tick, and turns asynchronous needs into typed [`SideRequest`]s that
//! the orchestrator executes off-thread.

use crate::data::{
    KpoOutcome, PassOutcome, Session, SessionData, SessionInput, Wait, WaitKind,
};
use crate::link::{SessionRow, SessionSink, TerminalLink};
use passgate_core::{
    CamResult, Clock, Config, KpoResult, LockerInfo, SessionStage, TagType, TerminalSettings,
    TerminalType, Uid, constants,
};
use passgate_protocol::{pocket, sphinx};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Work the orchestrator must run on a worker task for a session.
#[derive(Debug, Clone)]
pub enum SideRequest {
    /// Backend access check (and CID lookup)
    Kpo {
        session_id: String,
        uid: Uid,
        terminal_id: String,
        tag_type: TagType,
        lockers: Vec<LockerInfo>,
    },
    /// Face verification over WebSocket
    CamVerify {
        session_id: String,
        cam_pid: String,
        person_id: String,
    },
    /// Backend pass report
    Report {
        uid: Uid,
        terminal_id: String,
        granted: bool,
        tag_type: TagType,
        role: Option<String>,
    },
    /// Identification-poller ban after a successful pass
    BanAfterPass { cam_id: String, pid: String },
}

/// Owns the session map. Only the orchestrator mutates it.
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    id_gen: u64,
    cfg: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    #[must_use]
    pub fn new(cfg: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        SessionManager {
            sessions: HashMap::new(),
            id_gen: 0,
            cfg,
            clock,
        }
    }

    /// The active session attached to a terminal, if any. At most one
    /// session per terminal is active at a time.
    #[must_use]
    pub fn active_session_for(&self, terminal_key: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.terminal_key == terminal_key && s.is_active())
    }

    #[must_use]
    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Read-only listing for the status surface.
    #[must_use]
    pub fn sessions(&self) -> Vec<&Session> {
        let mut all: Vec<&Session> = self.sessions.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Create a session for a credential read on `terminal_key`.
    ///
    /// Refuses while the terminal already owns an active session. Direct
    /// refusals (unreadable tag, bound lockers, temporary card) short-cut
    /// to `LAST_ANSWER`; everything else locks the terminal and starts
    /// the backend check.
    ///
    /// # Errors
    /// Returns `Error::AccessDenied` when a session is already active on
    /// the terminal.
    pub fn start_session(
        &mut self,
        link: &mut dyn TerminalLink,
        terminal_key: &str,
        input: SessionInput,
    ) -> passgate_core::Result<(String, Vec<SideRequest>)> {
        if let Some(existing) = self.active_session_for(terminal_key) {
            debug!(
                terminal = terminal_key,
                session = %existing.id,
                "read ignored: terminal busy"
            );
            return Err(passgate_core::Error::AccessDenied {
                reason: format!("terminal busy with session {}", existing.id),
            });
        }

        self.id_gen += 1;
        let id = format!("s{:08}", self.id_gen);
        let tag_type = input.tag_type();

        let mut data = SessionData::default();
        let mut prefilled = None;
        let uid = match input {
            SessionInput::Rfid(rfid) => {
                let uid = rfid.uid.clone();
                data.rfid = Some(rfid);
                uid
            }
            SessionInput::Barcode(barcode) => {
                let uid = Uid::new(&barcode.data)?;
                data.barcode = Some(barcode);
                uid
            }
            SessionInput::FaceId {
                input,
                prefilled_kpo,
            } => {
                let uid = Uid::new(&input.pid)?;
                data.faceid = Some(input);
                prefilled = prefilled_kpo;
                uid
            }
            SessionInput::SphinxDelegation {
                uid,
                ticket,
                access_type,
            } => {
                data.sphinx_ticket = Some((ticket, access_type));
                uid
            }
        };

        let mut session = Session {
            id: id.clone(),
            terminal_key: terminal_key.to_string(),
            uid: uid.clone(),
            cid: None,
            tag_type,
            stage: SessionStage::Init,
            req_time: self.clock.wall(),
            started: self.clock.now(),
            data,
            wait: None,
            processed: false,
            completed: false,
            report_sent: false,
            logged: false,
        };

        let settings = link.terminal_settings(terminal_key);
        let mut requests = Vec::new();

        if let Some(refusal) = tag_read_refusal(&session, settings.as_ref()) {
            info!(session = %id, terminal = terminal_key, %refusal, "read refused");
            session.data.granted = Some(false);
            session.data.message = refusal;
            session.stage = SessionStage::LastAnswer;
        } else {
            if let Err(e) = link.lock_terminal(
                terminal_key,
                &id,
                self.cfg.fix_phrase(constants::MSG_WAITING),
            ) {
                warn!(session = %id, error = %e, "terminal lock failed");
            }

            match prefilled {
                Some(kpo) => {
                    // identification auto-pass: the verdict is already here
                    session.data.kpo = kpo;
                    session.data.no_report = true;
                }
                None => requests.push(SideRequest::Kpo {
                    session_id: id.clone(),
                    uid,
                    terminal_id: terminal_id(terminal_key, settings.as_ref()),
                    tag_type,
                    lockers: session
                        .data
                        .rfid
                        .as_ref()
                        .map(|r| r.lockers.clone())
                        .unwrap_or_default(),
                }),
            }

            session.wait = Some(Wait {
                kind: WaitKind::Kpo,
                expires_at: self.clock.now() + self.service_expire(),
                gate: None,
            });
            session.stage = SessionStage::KpoResult;
        }

        info!(
            session = %id,
            terminal = terminal_key,
            uid = %session.uid,
            stage = %session.stage,
            "session started"
        );
        self.sessions.insert(id.clone(), session);
        Ok((id, requests))
    }

    /// Attach GAT TIME-kind data to a freshly created session.
    pub fn set_gat_solar(&mut self, session_id: &str, solar: passgate_core::GatSolar) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.data.gat_solar = Some(solar);
        }
    }

    /// Record the backend verdict for a session.
    pub fn set_kpo_outcome(&mut self, session_id: &str, outcome: KpoOutcome, cid: Option<String>) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if session.data.kpo.result == KpoResult::Undef {
            session.data.kpo = outcome;
        }
        if session.cid.is_none() {
            session.cid = cid;
        }
    }

    /// Remember the verification request a session is waiting on.
    pub fn set_cam_request(&mut self, session_id: &str, request_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.data.cam_request = Some(request_id.to_string());
        }
    }

    /// Record a face-verification verdict. Events whose request id does
    /// not match the session's outstanding request are ignored.
    pub fn set_cam_outcome(
        &mut self,
        session_id: &str,
        request_id: &str,
        result: CamResult,
        message: String,
    ) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if session.data.cam_request.as_deref() != Some(request_id) {
            warn!(
                session = session_id,
                request = request_id,
                "verification event for stale request ignored"
            );
            return;
        }
        if session.data.cam.result == CamResult::Undef {
            session.data.cam.result = result;
            session.data.cam.message = message;
        }
    }

    /// Resolve a verification wait by its request id alone (used by the
    /// identification poller's pending-request path, where events are
    /// keyed `cam_id_pid` rather than by session). Returns `true` when a
    /// waiting session was found.
    pub fn resolve_cam_request(
        &mut self,
        request_id: &str,
        result: CamResult,
        message: String,
    ) -> bool {
        let Some(session) = self
            .sessions
            .values_mut()
            .find(|s| s.is_active() && s.data.cam_request.as_deref() == Some(request_id))
        else {
            return false;
        };
        if session.data.cam.result == CamResult::Undef {
            session.data.cam.result = result;
            session.data.cam.message = message;
        }
        true
    }

    /// Update the displayed verification progress.
    pub fn set_cam_progress(&mut self, session_id: &str, request_id: &str, percent: u8) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if session.data.cam_request.as_deref() != Some(request_id) {
            return;
        }
        let best = session.data.cam.max_correlation.unwrap_or(0);
        if percent > best {
            session.data.cam.max_correlation = Some(percent);
        }
    }

    /// Record a physical pass event for the terminal's active session.
    pub fn pass_event(&mut self, terminal_key: &str, passed: bool) {
        let Some(session) = self
            .sessions
            .values_mut()
            .find(|s| s.terminal_key == terminal_key && s.is_active())
        else {
            debug!(terminal = terminal_key, "pass event without session");
            return;
        };

        let outcome = PassOutcome {
            passed,
            timed_out: false,
        };
        let gate = session
            .wait
            .as_ref()
            .filter(|w| w.kind == WaitKind::Pass)
            .and_then(|w| w.gate)
            .unwrap_or(match session.stage {
                SessionStage::SecondPassed | SessionStage::OpenSecond => "second",
                _ => "first",
            });
        match gate {
            "second" => session.data.passed_second = Some(outcome),
            _ => session.data.passed_first = Some(outcome),
        }
    }

    /// Advance every session by at most one stage, resolving waits first.
    /// Returns the side requests the orchestrator must execute.
    pub fn tick(
        &mut self,
        link: &mut dyn TerminalLink,
        sink: &mut dyn SessionSink,
    ) -> Vec<SideRequest> {
        let mut requests = Vec::new();
        let ids: Vec<String> = self.sessions.keys().cloned().collect();

        for id in ids {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if session.completed {
                continue;
            }

            if !check_wait(session, &self.cfg, self.clock.as_ref()) {
                continue;
            }

            advance(
                session,
                &self.cfg,
                self.clock.as_ref(),
                link,
                sink,
                &mut requests,
            );
        }

        self.sweep(link);
        requests
    }

    /// Drop completed and expired sessions. Expired active sessions are
    /// terminated defensively first so they are still logged.
    fn sweep(&mut self, link: &mut dyn TerminalLink) {
        let lifetime = Duration::from_secs_f64(self.cfg.session_expire_time);
        let now = self.clock.now();

        let stale: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.completed || now.duration_since(s.started) > lifetime)
            .map(|s| s.id.clone())
            .collect();

        for id in stale {
            if let Some(mut session) = self.sessions.remove(&id) {
                if !session.completed {
                    warn!(session = %id, "expired before completion");
                    let _ = link.unlock_terminal(&session.terminal_key, &session.id);
                    session.completed = true;
                }
            }
        }
    }

    fn service_expire(&self) -> Duration {
        Duration::from_secs_f64(self.cfg.service_request_expire_time)
    }
}

/// Terminal id used in backend paths: the listed id, or the connection
/// key for unlisted terminals.
fn terminal_id(terminal_key: &str, settings: Option<&TerminalSettings>) -> String {
    match settings {
        Some(s) if !s.id.is_empty() => s.id.clone(),
        _ => terminal_key.to_string(),
    }
}

/// Direct refusal reasons checked before the backend is consulted.
fn tag_read_refusal(session: &Session, settings: Option<&TerminalSettings>) -> Option<String> {
    let rfid = session.data.rfid.as_ref()?;
    let settings = settings?;

    if !rfid.auth {
        return Some(constants::MSG_TAG_NOT_READ.to_string());
    }

    if settings.deny_lockers {
        let labels = passgate_core::lockers::display_labels(&rfid.lockers);
        if !labels.is_empty() {
            let shown: Vec<String> = labels.into_iter().take(9).collect();
            return Some(format!("{} {}", constants::MSG_RETURN_LOCKERS, shown.join(" ")));
        }
    }

    if settings.deny_ct && rfid.temp_card {
        return Some(constants::MSG_TEMP_CARD.to_string());
    }

    None
}

/// Resolve the session's wait. Returns `true` when the session may act on
/// its current stage.
fn check_wait(session: &mut Session, cfg: &Config, clock: &dyn Clock) -> bool {
    let Some(wait) = &session.wait else {
        return true;
    };
    let expired = clock.now() >= wait.expires_at;

    match wait.kind {
        WaitKind::Kpo => {
            if session.data.kpo.result != KpoResult::Undef {
                session.wait = None;
                return true;
            }
            if expired {
                session.data.kpo = if cfg.service_autofix_expired {
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
                session.wait = None;
                return true;
            }
            false
        }

        WaitKind::Cam => {
            if session.data.cam.result != CamResult::Undef {
                session.wait = None;
                return true;
            }
            if expired {
                session.data.cam.result = CamResult::No;
                session.data.cam.answer = Some("idle_timeout".to_string());
                session.wait = None;
                return true;
            }
            false
        }

        WaitKind::Pass => {
            let gate = wait.gate.unwrap_or("first");
            let outcome = match gate {
                "second" => &session.data.passed_second,
                _ => &session.data.passed_first,
            };
            if outcome.is_some() {
                session.wait = None;
                return true;
            }
            if expired {
                let timed_out = Some(PassOutcome {
                    passed: false,
                    timed_out: true,
                });
                match gate {
                    "second" => session.data.passed_second = timed_out,
                    _ => session.data.passed_first = timed_out,
                }
                session.wait = None;
                return true;
            }
            false
        }
    }
}

/// Run one stage transition for a session whose wait has resolved.
fn advance(
    session: &mut Session,
    cfg: &Config,
    clock: &dyn Clock,
    link: &mut dyn TerminalLink,
    sink: &mut dyn SessionSink,
    out: &mut Vec<SideRequest>,
) {
    let settings = link.terminal_settings(&session.terminal_key);

    match session.stage {
        SessionStage::Init => {
            // start_session always leaves Init before the first tick
            error!(session = %session.id, "session stuck in INIT");
            terminate(session, link, sink);
        }

        SessionStage::KpoResult => {
            if session.data.kpo.result != KpoResult::Yes {
                set_stage(session, SessionStage::KpoDirect, link, sink);
                return;
            }

            let has_gate = settings.as_ref().is_some_and(|s| s.gate);
            let needs_cam = cfg.cam_service_active
                && session.cid.is_some()
                && settings.as_ref().is_some_and(|s| s.cam_pid.is_some());

            if has_gate {
                set_stage(session, SessionStage::OpenFirst, link, sink);
            } else if needs_cam && session.data.cam.result == CamResult::Undef {
                start_cam_verify(session, cfg, clock, settings.as_ref(), out);
                set_stage(session, SessionStage::CamResult, link, sink);
            } else {
                set_stage(session, SessionStage::KpoDirect, link, sink);
            }
        }

        SessionStage::KpoDirect => {
            let granted = session.data.kpo.result == KpoResult::Yes;
            session.data.granted = Some(granted);
            session.data.message = final_message(&session.data.kpo.message, granted, cfg);
            set_stage(session, SessionStage::LastAnswer, link, sink);
        }

        SessionStage::CamResult => {
            let allow =
                session.data.cam.result == CamResult::Yes || cfg.cam_always_pass;
            if allow {
                session.data.granted = Some(true);
                if session.data.message.is_empty() {
                    session.data.message = final_message(&session.data.kpo.message, true, cfg);
                }
                let next = if session.data.passed_first.is_some() {
                    SessionStage::OpenSecond
                } else if settings.as_ref().is_some_and(|s| s.gate) {
                    SessionStage::OpenFirst
                } else {
                    SessionStage::LastAnswer
                };
                set_stage(session, next, link, sink);
            } else {
                session.data.granted = Some(false);
                session.data.message = match session.data.cam.result {
                    CamResult::Nf => cfg.cam_service_result_msg_nf.clone(),
                    CamResult::Fail => cfg.cam_service_result_msg_fail.clone(),
                    _ => cfg.cam_service_result_msg_no.clone(),
                };
                set_stage(session, SessionStage::LastAnswer, link, sink);
            }
        }

        SessionStage::OpenFirst => {
            session.data.granted = Some(true);
            if session.data.message.is_empty() {
                session.data.message = final_message(&session.data.kpo.message, true, cfg);
            }
            emit_allow(session, cfg, link);
            install_pass_wait(session, cfg, clock, "first");
            set_stage(session, SessionStage::FirstPassed, link, sink);
        }

        SessionStage::FirstPassed => {
            let passed = session
                .data
                .passed_first
                .map(|p| p.passed)
                .unwrap_or(false);
            if !passed {
                session.data.granted = Some(false);
                session.data.message = constants::MSG_NOT_PASSED.to_string();
                set_stage(session, SessionStage::LastAnswer, link, sink);
                return;
            }

            let needs_cam = cfg.cam_service_active
                && session.cid.is_some()
                && settings.as_ref().is_some_and(|s| s.cam_pid.is_some())
                && session.data.cam.result == CamResult::Undef;
            if needs_cam {
                start_cam_verify(session, cfg, clock, settings.as_ref(), out);
                set_stage(session, SessionStage::CamResult, link, sink);
            } else {
                set_stage(session, SessionStage::OpenSecond, link, sink);
            }
        }

        SessionStage::OpenSecond => {
            emit_allow(session, cfg, link);
            install_pass_wait(session, cfg, clock, "second");
            set_stage(session, SessionStage::SecondPassed, link, sink);
        }

        SessionStage::SecondPassed => {
            set_stage(session, SessionStage::Passed, link, sink);
        }

        SessionStage::Passed => {
            if !session.report_sent && !session.data.no_report {
                out.push(SideRequest::Report {
                    uid: session.uid.clone(),
                    terminal_id: terminal_id(&session.terminal_key, settings.as_ref()),
                    granted: session.data.granted.unwrap_or(false),
                    tag_type: session.tag_type,
                    role: settings.as_ref().and_then(|s| s.role.clone()),
                });
                session.report_sent = true;
            }
            if let Some(faceid) = &session.data.faceid {
                out.push(SideRequest::BanAfterPass {
                    cam_id: faceid.cam_id.clone(),
                    pid: faceid.pid.clone(),
                });
            }
            set_stage(session, SessionStage::Done, link, sink);
        }

        SessionStage::LastAnswer => {
            if session.data.granted.unwrap_or(false) {
                emit_allow(session, cfg, link);
                set_stage(session, SessionStage::Passed, link, sink);
            } else {
                emit_deny(session, cfg, link);
                set_stage(session, SessionStage::Done, link, sink);
            }
        }

        SessionStage::Done => {
            finish(session, link, sink);
        }
    }
}

/// Transition with validation. Regressions are invariant violations:
/// the session is terminated defensively and the daemon keeps running.
fn set_stage(
    session: &mut Session,
    next: SessionStage,
    link: &mut dyn TerminalLink,
    sink: &mut dyn SessionSink,
) {
    if !session.stage.can_transition_to(next) {
        error!(
            session = %session.id,
            from = %session.stage,
            to = %next,
            "invalid stage transition"
        );
        terminate(session, link, sink);
        return;
    }
    debug!(session = %session.id, from = %session.stage, to = %next, "stage");
    session.stage = next;
}

/// Close out a session: one log row, lock released, marked completed.
fn finish(session: &mut Session, link: &mut dyn TerminalLink, sink: &mut dyn SessionSink) {
    if !session.logged {
        let row = SessionRow::build(session, link.terminal_settings(&session.terminal_key).as_ref());
        if let Err(e) = sink.log_session(&row) {
            warn!(session = %session.id, error = %e, "session log failed");
        }
        session.logged = true;
    }
    let _ = link.unlock_terminal(&session.terminal_key, &session.id);
    session.processed = true;
    session.completed = true;
    info!(
        session = %session.id,
        granted = session.data.granted.unwrap_or(false),
        "session done"
    );
}

/// Defensive termination after an invariant violation.
fn terminate(session: &mut Session, link: &mut dyn TerminalLink, sink: &mut dyn SessionSink) {
    if session.data.granted.is_none() {
        session.data.granted = Some(false);
    }
    session.stage = SessionStage::Done;
    finish(session, link, sink);
}

fn start_cam_verify(
    session: &mut Session,
    cfg: &Config,
    clock: &dyn Clock,
    settings: Option<&TerminalSettings>,
    out: &mut Vec<SideRequest>,
) {
    let cam_pid = settings
        .and_then(|s| s.cam_pid.clone())
        .unwrap_or_default();
    let person_id = session.cid.clone().unwrap_or_default();
    out.push(SideRequest::CamVerify {
        session_id: session.id.clone(),
        cam_pid,
        person_id,
    });
    session.wait = Some(Wait {
        kind: WaitKind::Cam,
        expires_at: clock.now() + Duration::from_secs_f64(cfg.service_request_expire_time),
        gate: None,
    });
}

fn install_pass_wait(session: &mut Session, cfg: &Config, clock: &dyn Clock, gate: &'static str) {
    let open = Duration::from_millis(u64::from(cfg.pass_time_ms));
    let grace = Duration::from_secs_f64(cfg.term_pass_add_expire_time.max(0.0));
    session.wait = Some(Wait {
        kind: WaitKind::Pass,
        expires_at: clock.now() + open + grace,
        gate: Some(gate),
    });
}

fn final_message(message: &str, granted: bool, cfg: &Config) -> String {
    if !message.is_empty() {
        message.to_string()
    } else if granted {
        cfg.service_fixed_msg.clone()
    } else {
        cfg.service_denied_msg.clone()
    }
}

/// Send the protocol-specific allow primitive.
fn emit_allow(session: &Session, cfg: &Config, link: &mut dyn TerminalLink) {
    let key = &session.terminal_key;
    let Some(settings) = link.terminal_settings(key) else {
        warn!(session = %session.id, terminal = %key, "allow without connection");
        return;
    };
    let text = cfg.fix_phrase(&session.data.message).to_string();
    let uid = session.uid.to_string();

    let sent = match settings.ttype {
        TerminalType::Jsp => {
            let cid = session.cid.as_deref().unwrap_or(&uid).to_string();
            link.send_jsp_relay_open(key, &uid, &text, cfg.pass_time_ms, Some(&cid))
        }
        TerminalType::Pocket => {
            let mut flags = 0u8;
            if settings.ctrole.as_deref() == Some("card_taker") {
                flags |= pocket::RELAY_FLAG_TAKE_CARD;
            }
            link.send(key, pocket::relay_packet(cfg.pass_time_ms, flags, &uid, &text))
        }
        TerminalType::Gat => link.send(key, passgate_protocol::gat::host_control_packet(0, 1)),
        TerminalType::Sphinx => match &session.data.sphinx_ticket {
            Some((ticket, access_type)) => {
                link.send(key, sphinx::delegation_reply(ticket, access_type, 1, &[]))
            }
            None => Ok(()),
        },
    };
    if let Err(e) = sent {
        warn!(session = %session.id, error = %e, "allow frame send failed");
    }
}

/// Send the protocol-specific deny primitive. Deny always also closes
/// the relay.
fn emit_deny(session: &Session, cfg: &Config, link: &mut dyn TerminalLink) {
    let key = &session.terminal_key;
    let Some(settings) = link.terminal_settings(key) else {
        warn!(session = %session.id, terminal = %key, "deny without connection");
        return;
    };
    let text = cfg.fix_phrase(&session.data.message).to_string();

    let sent = match settings.ttype {
        TerminalType::Jsp => link
            .send_jsp_relay_close(key)
            .and_then(|()| link.send_jsp_message(key, &text, constants::DENY_DISPLAY_MS)),
        TerminalType::Pocket => link.send(key, pocket::relay_close_packet()).and_then(|()| {
            link.send(
                key,
                pocket::interactive_packet(
                    &text,
                    constants::INFO_DISPLAY_MS as u16,
                    pocket::SoundPattern::QuackQuack,
                    true,
                    0x00,
                ),
            )
        }),
        TerminalType::Gat => link.send(key, passgate_protocol::gat::host_control_packet(0, 0)),
        TerminalType::Sphinx => match &session.data.sphinx_ticket {
            Some((ticket, access_type)) => {
                link.send(key, sphinx::delegation_reply(ticket, access_type, 0, &[]))
            }
            None => Ok(()),
        },
    };
    if let Err(e) = sent {
        warn!(session = %session.id, error = %e, "deny frame send failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RfidInput;
    use chrono::{DateTime, Local};
    use passgate_core::Result;
    use std::sync::Mutex;
    use std::time::Instant;

    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            ManualClock {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, d: Duration) {
            *self.offset.lock().unwrap() += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }

        fn wall(&self) -> DateTime<Local> {
            Local::now()
        }
    }

    #[derive(Debug, PartialEq)]
    enum Call {
        Send(String, Vec<u8>),
        Lock(String, String),
        Unlock(String, String),
        JspRelayOpen(String, String, String, u32),
        JspRelayClose(String),
        JspMessage(String, String, u32),
    }

    struct MockLink {
        settings: TerminalSettings,
        calls: Vec<Call>,
    }

    impl MockLink {
        fn new(settings: TerminalSettings) -> Self {
            MockLink {
                settings,
                calls: Vec::new(),
            }
        }

        fn jsp(key_ip: &str) -> Self {
            let mut s = TerminalSettings::adhoc(key_ip, 8902, TerminalType::Jsp);
            s.id = "T1".to_string();
            MockLink::new(s)
        }
    }

    impl TerminalLink for MockLink {
        fn send(&mut self, key: &str, bytes: Vec<u8>) -> Result<()> {
            self.calls.push(Call::Send(key.to_string(), bytes));
            Ok(())
        }

        fn lock_terminal(&mut self, key: &str, session_id: &str, _text: &str) -> Result<()> {
            self.calls
                .push(Call::Lock(key.to_string(), session_id.to_string()));
            Ok(())
        }

        fn unlock_terminal(&mut self, key: &str, session_id: &str) -> Result<()> {
            self.calls
                .push(Call::Unlock(key.to_string(), session_id.to_string()));
            Ok(())
        }

        fn terminal_settings(&self, _key: &str) -> Option<TerminalSettings> {
            Some(self.settings.clone())
        }

        fn send_jsp_relay_open(
            &mut self,
            key: &str,
            uid: &str,
            caption: &str,
            time_ms: u32,
            _cid: Option<&str>,
        ) -> Result<()> {
            self.calls.push(Call::JspRelayOpen(
                key.to_string(),
                uid.to_string(),
                caption.to_string(),
                time_ms,
            ));
            Ok(())
        }

        fn send_jsp_relay_close(&mut self, key: &str) -> Result<()> {
            self.calls.push(Call::JspRelayClose(key.to_string()));
            Ok(())
        }

        fn send_jsp_message(&mut self, key: &str, text: &str, time_ms: u32) -> Result<()> {
            self.calls
                .push(Call::JspMessage(key.to_string(), text.to_string(), time_ms));
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecSink(Vec<SessionRow>);

    impl SessionSink for VecSink {
        fn log_session(&mut self, row: &SessionRow) -> Result<()> {
            self.0.push(row.clone());
            Ok(())
        }
    }

    fn rfid(uid: &str) -> SessionInput {
        SessionInput::Rfid(RfidInput {
            uid: Uid::new(uid).unwrap(),
            reader_type: 1,
            auth: true,
            lockers: Vec::new(),
            temp_card: false,
        })
    }

    fn harness() -> (SessionManager, Arc<ManualClock>, Arc<Config>) {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        let cfg = Arc::new(cfg);
        let mgr = SessionManager::new(cfg.clone(), clock.clone());
        (mgr, clock, cfg)
    }

    fn run_ticks(
        mgr: &mut SessionManager,
        link: &mut MockLink,
        sink: &mut VecSink,
        n: usize,
    ) -> Vec<SideRequest> {
        let mut all = Vec::new();
        for _ in 0..n {
            all.extend(mgr.tick(link, sink));
        }
        all
    }

    #[test]
    fn test_happy_path_jsp_grant() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();

        let (sid, reqs) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        assert!(matches!(reqs.as_slice(), [SideRequest::Kpo { .. }]));
        assert!(matches!(link.calls[0], Call::Lock(..)));

        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::Yes,
                message: "Проходите".to_string(),
            },
            None,
        );

        let reqs = run_ticks(&mut mgr, &mut link, &mut sink, 6);

        // allow frame went out as a relay open with the backend message
        assert!(link.calls.iter().any(|c| matches!(
            c,
            Call::JspRelayOpen(_, uid, caption, 3000)
                if uid.as_str() == "04AEECFA9B" && caption.as_str() == "Проходите"
        )));
        // a pass report was requested, the lock released, one row logged
        assert!(
            reqs.iter()
                .any(|r| matches!(r, SideRequest::Report { granted: true, .. }))
        );
        assert!(link.calls.iter().any(|c| matches!(c, Call::Unlock(..))));
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].kpo_result, "YES");
        assert_eq!(sink.0[0].final_result, "YES");
        assert_eq!(sink.0[0].uid, "04AEECFA9B");
    }

    #[test]
    fn test_deny_closes_relay_and_messages() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::No,
                message: "Абонемент истёк".to_string(),
            },
            None,
        );

        run_ticks(&mut mgr, &mut link, &mut sink, 6);

        let close_at = link
            .calls
            .iter()
            .position(|c| matches!(c, Call::JspRelayClose(_)));
        let msg_at = link.calls.iter().position(
            |c| matches!(c, Call::JspMessage(_, text, 1500) if text.as_str() == "Абонемент истёк"),
        );
        assert!(close_at.is_some() && msg_at.is_some());
        assert!(close_at < msg_at);
        assert_eq!(sink.0[0].final_result, "NO");
    }

    #[test]
    fn test_terminal_busy_rejects_second_read() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");

        mgr.start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        let second = mgr.start_session(&mut link, "10.0.0.1:8902", rfid("AABBCCDD"));
        assert!(second.is_err());
        assert_eq!(mgr.sessions().len(), 1);
    }

    #[test]
    fn test_kpo_timeout_autofix_grants() {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.service_autofix_expired = true;
        cfg.service_request_expire_time = 0.5;
        let mut mgr = SessionManager::new(Arc::new(cfg), clock.clone());

        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();
        mgr.start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();

        // no backend answer: the deadline fires on the next tick
        clock.advance(Duration::from_millis(600));
        run_ticks(&mut mgr, &mut link, &mut sink, 6);

        assert!(link.calls.iter().any(
            |c| matches!(c, Call::JspRelayOpen(_, _, caption, _) if caption.as_str() == "Проходите")
        ));
        assert_eq!(sink.0[0].kpo_result, "YES");
        assert_eq!(sink.0[0].final_result, "YES");
    }

    #[test]
    fn test_kpo_timeout_without_autofix_denies() {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.service_request_expire_time = 0.5;
        let link_err = cfg.service_link_err_msg.clone();
        let mut mgr = SessionManager::new(Arc::new(cfg), clock.clone());

        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();
        mgr.start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();

        clock.advance(Duration::from_millis(600));
        run_ticks(&mut mgr, &mut link, &mut sink, 6);

        assert!(
            link.calls
                .iter()
                .any(|c| matches!(c, Call::JspMessage(_, text, _) if *text == link_err))
        );
        assert_eq!(sink.0[0].kpo_result, "NO");
    }

    #[test]
    fn test_deny_lockers_refuses_before_backend() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut settings = TerminalSettings::adhoc("10.0.0.1", 8902, TerminalType::Jsp);
        settings.deny_lockers = true;
        let mut link = MockLink::new(settings);
        let mut sink = VecSink::default();

        let input = SessionInput::Rfid(RfidInput {
            uid: Uid::new("04AEECFA9B").unwrap(),
            reader_type: 1,
            auth: true,
            lockers: passgate_core::lockers::parse_list("A:27,62:180"),
            temp_card: false,
        });
        let (_, reqs) = mgr.start_session(&mut link, "10.0.0.1:8902", input).unwrap();

        // no backend request, no lock; deny message names the lockers
        assert!(reqs.is_empty());
        assert!(!link.calls.iter().any(|c| matches!(c, Call::Lock(..))));

        run_ticks(&mut mgr, &mut link, &mut sink, 3);
        assert!(link.calls.iter().any(
            |c| matches!(c, Call::JspMessage(_, text, _) if text.contains("A27") && text.contains("180"))
        ));
    }

    #[test]
    fn test_temp_card_refused() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut settings = TerminalSettings::adhoc("10.0.0.1", 8902, TerminalType::Jsp);
        settings.deny_ct = true;
        let mut link = MockLink::new(settings);
        let mut sink = VecSink::default();

        let input = SessionInput::Rfid(RfidInput {
            uid: Uid::new("04AEECFA9B").unwrap(),
            reader_type: 1,
            auth: true,
            lockers: Vec::new(),
            temp_card: true,
        });
        let (_, reqs) = mgr.start_session(&mut link, "10.0.0.1:8902", input).unwrap();
        assert!(reqs.is_empty());

        run_ticks(&mut mgr, &mut link, &mut sink, 3);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].final_result, "NO");
    }

    #[test]
    fn test_gate_path_waits_for_both_passes() {
        let (mut mgr, clock, _cfg) = harness();
        let mut settings = TerminalSettings::adhoc("10.0.0.1", 8080, TerminalType::Pocket);
        settings.gate = true;
        let mut link = MockLink::new(settings);
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8080", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::Yes,
                message: String::new(),
            },
            None,
        );

        // KPO_RESULT -> OPEN_FIRST -> FIRST_PASSED (waiting)
        run_ticks(&mut mgr, &mut link, &mut sink, 3);
        assert_eq!(mgr.session(&sid).unwrap().stage, SessionStage::FirstPassed);
        let opens = link
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Send(..)))
            .count();
        assert_eq!(opens, 1);

        mgr.pass_event("10.0.0.1:8080", true);
        run_ticks(&mut mgr, &mut link, &mut sink, 2);
        assert_eq!(mgr.session(&sid).unwrap().stage, SessionStage::SecondPassed);

        mgr.pass_event("10.0.0.1:8080", true);
        let reqs = run_ticks(&mut mgr, &mut link, &mut sink, 3);
        assert!(
            reqs.iter()
                .any(|r| matches!(r, SideRequest::Report { granted: true, .. }))
        );
        assert_eq!(sink.0.len(), 1);
        let _ = clock;
    }

    #[test]
    fn test_pass_timeout_denies() {
        let (mut mgr, clock, _cfg) = harness();
        let mut settings = TerminalSettings::adhoc("10.0.0.1", 8080, TerminalType::Pocket);
        settings.gate = true;
        let mut link = MockLink::new(settings);
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8080", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::Yes,
                message: String::new(),
            },
            None,
        );
        run_ticks(&mut mgr, &mut link, &mut sink, 3);

        // nobody walks through; the pass wait expires
        clock.advance(Duration::from_secs(10));
        run_ticks(&mut mgr, &mut link, &mut sink, 4);

        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].final_result, "NO");
        assert_eq!(sink.0[0].final_msg, constants::MSG_NOT_PASSED);
    }

    #[test]
    fn test_cam_timeout_denies_even_with_autofix() {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.service_autofix_expired = true; // applies to KPO only
        cfg.cam_service_active = true;
        cfg.cam_host = "cam.local".to_string();
        cfg.service_request_expire_time = 0.5;
        let msg_no = cfg.cam_service_result_msg_no.clone();
        let mut mgr = SessionManager::new(Arc::new(cfg), clock.clone());

        let mut settings = TerminalSettings::adhoc("10.0.0.1", 8902, TerminalType::Jsp);
        settings.cam_pid = Some("cam7".to_string());
        let mut link = MockLink::new(settings);
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::Yes,
                message: String::new(),
            },
            Some("CID42".to_string()),
        );

        let reqs = run_ticks(&mut mgr, &mut link, &mut sink, 2);
        assert!(
            reqs.iter()
                .any(|r| matches!(r, SideRequest::CamVerify { person_id, .. } if person_id.as_str() == "CID42"))
        );
        assert_eq!(mgr.session(&sid).unwrap().stage, SessionStage::CamResult);

        clock.advance(Duration::from_millis(600));
        run_ticks(&mut mgr, &mut link, &mut sink, 4);

        assert_eq!(sink.0[0].final_result, "NO");
        assert_eq!(sink.0[0].final_msg, msg_no);
        assert_eq!(sink.0[0].cam_result, "NO");
    }

    #[test]
    fn test_cam_verdict_grants() {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.cam_service_active = true;
        cfg.cam_host = "cam.local".to_string();
        let mut mgr = SessionManager::new(Arc::new(cfg), clock);

        let mut settings = TerminalSettings::adhoc("10.0.0.1", 8902, TerminalType::Jsp);
        settings.cam_pid = Some("cam7".to_string());
        let mut link = MockLink::new(settings);
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::Yes,
                message: "Проходите".to_string(),
            },
            Some("CID42".to_string()),
        );
        run_ticks(&mut mgr, &mut link, &mut sink, 2);

        mgr.set_cam_request(&sid, "vrq1");
        mgr.set_cam_outcome(&sid, "vrq1", CamResult::Yes, String::new());
        run_ticks(&mut mgr, &mut link, &mut sink, 6);

        assert_eq!(sink.0[0].final_result, "YES");
        assert_eq!(sink.0[0].cam_result, "YES");
        assert_eq!(sink.0[0].cam_cid, "CID42");
    }

    #[test]
    fn test_stale_cam_event_ignored() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_cam_request(&sid, "vrq2");
        mgr.set_cam_outcome(&sid, "vrq1", CamResult::Yes, String::new());
        assert_eq!(mgr.session(&sid).unwrap().data.cam.result, CamResult::Undef);
    }

    #[test]
    fn test_prefilled_kpo_skips_backend() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();

        let input = SessionInput::FaceId {
            input: crate::data::FaceIdInput {
                pid: "123456".to_string(),
                fio: "Иванов И.И.".to_string(),
                cam_id: "C1".to_string(),
                score: 0.87,
                raw: serde_json::Value::Null,
            },
            prefilled_kpo: Some(KpoOutcome {
                result: KpoResult::Yes,
                message: "Иванов И.И., 87%".to_string(),
            }),
        };
        let (sid, reqs) = mgr.start_session(&mut link, "10.0.0.1:8902", input).unwrap();

        assert!(reqs.is_empty()); // no backend check
        assert_eq!(mgr.session(&sid).unwrap().stage, SessionStage::KpoResult);

        let reqs = run_ticks(&mut mgr, &mut link, &mut sink, 6);
        // auto-pass sessions report nothing, but do request the pass ban
        assert!(!reqs.iter().any(|r| matches!(r, SideRequest::Report { .. })));
        assert!(reqs.iter().any(
            |r| matches!(r, SideRequest::BanAfterPass { cam_id, pid } if cam_id.as_str() == "C1" && pid.as_str() == "123456")
        ));
        assert!(link.calls.iter().any(
            |c| matches!(c, Call::JspRelayOpen(_, _, caption, _) if caption.as_str() == "Иванов И.И., 87%")
        ));
    }

    #[test]
    fn test_session_logged_exactly_once() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::No,
                message: "нет".to_string(),
            },
            None,
        );

        run_ticks(&mut mgr, &mut link, &mut sink, 20);
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn test_phrase_fix_applied_to_display() {
        let clock = Arc::new(ManualClock::new());
        let mut cfg = Config::default();
        cfg.service_name = "backend.local".to_string();
        cfg.phrases_fixes.insert(
            "Извините;клиент не идентифицирован;".to_string(),
            "Извините;Клиент не;идентифицирован".to_string(),
        );
        let mut mgr = SessionManager::new(Arc::new(cfg), clock);
        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::No,
                message: "Извините;клиент не идентифицирован;".to_string(),
            },
            None,
        );
        run_ticks(&mut mgr, &mut link, &mut sink, 6);

        assert!(link.calls.iter().any(|c| matches!(
            c,
            Call::JspMessage(_, text, _) if text.as_str() == "Извините;Клиент не;идентифицирован"
        )));
    }

    #[test]
    fn test_completed_sessions_swept() {
        let (mut mgr, _clock, _cfg) = harness();
        let mut link = MockLink::jsp("10.0.0.1");
        let mut sink = VecSink::default();

        let (sid, _) = mgr
            .start_session(&mut link, "10.0.0.1:8902", rfid("04AEECFA9B"))
            .unwrap();
        mgr.set_kpo_outcome(
            &sid,
            KpoOutcome {
                result: KpoResult::No,
                message: String::new(),
            },
            None,
        );
        run_ticks(&mut mgr, &mut link, &mut sink, 20);
        assert!(mgr.sessions().is_empty());

        // the terminal accepts the next read again
        assert!(
            mgr.start_session(&mut link, "10.0.0.1:8902", rfid("AABBCCDD"))
                .is_ok()
        );
    }
}
