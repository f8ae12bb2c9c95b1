//! Protocol-to-access-action dispatch.
//!
//! Every credential read walks the same precedence chain before a
//! session may exist:
//!
//! 1. terminal already busy with a session -> ignore
//! 2. MEMREG device terminal -> usage registration, never a session
//! 3. global deny list -> denial message, stop
//! 4. `memreg_deny` storage mark -> denial (+ card capture), stop
//! 5. secondary deny list -> denial message, stop
//! 6. start an access session

use crate::daemon::Daemon;
use passgate_core::{GatSolar, TagType, TerminalSettings, TerminalType, Uid, constants};
use passgate_face::ident::format_score;
use passgate_net::GatewayEvent;
use passgate_protocol::{pocket, sphinx};
use passgate_session::{
    BarcodeInput, FaceIdInput, GTimeRecord, RfidInput, SessionInput, TerminalLink,
};
use passgate_store::{MemRegKey, deny_message, device_message};
use serde_json::Value;
use tracing::{debug, info, warn};

impl Daemon {
    /// Route one decoded gateway event.
    pub(crate) fn dispatch(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::TagRead {
                key,
                uid,
                reader_type,
                auth,
                lockers,
                temp_card,
                tag_type,
                gat_solar,
            } => self.dispatch_tag_read(
                &key,
                uid,
                reader_type,
                auth,
                lockers,
                temp_card,
                tag_type,
                gat_solar,
            ),
            GatewayEvent::PassReport { key, passed } => {
                debug!(terminal = %key, passed, "pass report");
                self.sessions.pass_event(&key, passed);
            }
            GatewayEvent::Delegation { key, request } => self.dispatch_delegation(&key, request),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_tag_read(
        &mut self,
        key: &str,
        uid: Uid,
        reader_type: u8,
        auth: bool,
        lockers: Vec<passgate_core::LockerInfo>,
        temp_card: bool,
        tag_type: TagType,
        gat_solar: Option<GatSolar>,
    ) {
        let Some(settings) = self.pool.terminal_settings(key) else {
            warn!(terminal = key, "tag read from connection without settings");
            return;
        };
        info!(terminal = key, uid = %uid, reader_type, auth, "tag read");

        if self.sessions.active_session_for(key).is_some() {
            debug!(terminal = key, "tag read ignored: session active");
            return;
        }

        if settings.memreg_dev.is_some() {
            self.handle_memreg_device(key, &settings, &uid, reader_type);
            return;
        }

        if let Some(message) = self.cards.check_global(uid.as_str()) {
            info!(uid = %uid, message = %message, "denied by global card list");
            self.send_deny_notice(key, &settings, &message);
            return;
        }

        if let Some(storage) = settings.memreg_deny.clone() {
            if self.memreg.has(&storage, uid.as_str()).unwrap_or(false) {
                let message = deny_message(&storage);
                warn!(storage = %storage, uid = %uid, "denied by usage mark");
                self.send_deny_notice(key, &settings, message);

                if settings.memreg_role.as_deref() == Some("checkout")
                    && settings.ctrole.as_deref() == Some("card_taker")
                {
                    info!(uid = %uid, "capturing card at checkout");
                    let signal = pocket::signal_packet(
                        pocket::SIGNAL_LOCKED,
                        constants::CARD_CAPTURE_TIMEOUT_MS,
                    );
                    let _ = self.pool.send(key, signal);
                }
                return;
            }
        }

        if let Some(message) = self.cards.check_secondary(uid.as_str()) {
            info!(uid = %uid, message = %message, "denied by secondary card list");
            self.send_deny_notice(key, &settings, &message);
            return;
        }

        if let Some(solar) = &gat_solar {
            let record = GTimeRecord {
                timestamp: self.clock.wall(),
                term_id: settings.id.clone(),
                term_addr: settings.key(),
                uid: uid.to_string(),
                time: solar.time,
                price: solar.price,
            };
            if let Err(e) = self.gtime_sink.register_gtime_event(&record) {
                warn!(error = %e, "gtime record failed");
            }
        }

        let input = SessionInput::Rfid(RfidInput {
            uid,
            reader_type,
            auth,
            lockers,
            temp_card,
        });
        match self.sessions.start_session(&mut self.pool, key, input) {
            Ok((session_id, requests)) => {
                if let Some(solar) = gat_solar {
                    self.sessions.set_gat_solar(&session_id, solar);
                }
                let _ = tag_type;
                self.execute_side_requests(requests);
            }
            Err(e) => debug!(terminal = key, error = %e, "session not started"),
        }
    }

    /// Barcode/QR reads arrive through the operator surface rather than a
    /// framed protocol; data is 1-32 characters.
    pub fn dispatch_barcode_read(&mut self, key: &str, data: &str) {
        let Some(settings) = self.pool.terminal_settings(key) else {
            warn!(terminal = key, "barcode read from connection without settings");
            return;
        };
        if data.is_empty() || data.len() > 32 {
            warn!(terminal = key, len = data.len(), "barcode length out of range");
            return;
        }
        if self.sessions.active_session_for(key).is_some() {
            return;
        }

        let input = SessionInput::Barcode(BarcodeInput {
            data: data.to_string(),
        });
        match self.sessions.start_session(&mut self.pool, key, input) {
            Ok((_, requests)) => {
                if settings.ttype == TerminalType::Pocket {
                    let wait = pocket::interactive_packet(
                        self.cfg.fix_phrase("Подождите..."),
                        7000,
                        pocket::SoundPattern::None,
                        true,
                        0x00,
                    );
                    let _ = self.pool.send(key, wait);
                }
                self.execute_side_requests(requests);
            }
            Err(e) => debug!(terminal = key, error = %e, "barcode session not started"),
        }
    }

    /// MEMREG device terminals register usage instead of opening doors.
    fn handle_memreg_device(
        &mut self,
        key: &str,
        settings: &TerminalSettings,
        uid: &Uid,
        reader_type: u8,
    ) {
        let Some(dev) = settings.memreg_dev.as_deref() else {
            return;
        };
        let mkey = match MemRegKey::parse(dev) {
            Ok(mkey) => mkey,
            Err(e) => {
                warn!(terminal = key, dev, error = %e, "bad memreg device key");
                return;
            }
        };

        let action = match self.memreg.apply_device_mode(&mkey, uid.as_str()) {
            Ok(action) => action,
            Err(e) => {
                warn!(terminal = key, uid = %uid, error = %e, "memreg apply failed");
                return;
            }
        };

        let message = device_message(&mkey.storage, action.selector);
        info!(
            terminal = key,
            storage = %mkey.storage,
            uid = %uid,
            changed = action.changed,
            selector = action.selector,
            "memreg device read"
        );

        let sound = if action.changed {
            pocket::SoundPattern::Beep
        } else {
            pocket::SoundPattern::BeepBeep
        };
        match settings.ttype {
            TerminalType::Pocket => {
                let flags = if reader_type != 0 { reader_type } else { 0x00 };
                let packet = pocket::interactive_packet(
                    self.cfg.fix_phrase(message),
                    constants::INFO_DISPLAY_MS as u16,
                    sound,
                    true,
                    flags,
                );
                let _ = self.pool.send(key, packet);
            }
            TerminalType::Jsp => {
                let _ = self.pool.send_jsp_message(
                    key,
                    self.cfg.fix_phrase(message),
                    constants::INFO_DISPLAY_MS,
                );
            }
            _ => {}
        }
    }

    /// Denial notice outside any session (deny lists, usage marks).
    fn send_deny_notice(&mut self, key: &str, settings: &TerminalSettings, message: &str) {
        let text = self.cfg.fix_phrase(message).to_string();
        match settings.ttype {
            TerminalType::Pocket => {
                let packet = pocket::interactive_packet(
                    &text,
                    constants::INFO_DISPLAY_MS as u16,
                    pocket::SoundPattern::QuackQuack,
                    true,
                    0x00,
                );
                let _ = self.pool.send(key, packet);
            }
            TerminalType::Jsp => {
                let _ = self
                    .pool
                    .send_jsp_message(key, &text, constants::INFO_DISPLAY_MS);
            }
            other => debug!(terminal = key, ttype = %other, "deny notice has no display"),
        }
    }

    /// SPHINX delegated an access decision: same deny precedence, then a
    /// session whose final answer becomes the DELEGATION_REPLY.
    fn dispatch_delegation(&mut self, key: &str, request: sphinx::DelegationRequest) {
        let Some(descriptor) = &request.key else {
            debug!(terminal = key, ticket = %request.ticket, "delegation without key data");
            let reply = sphinx::delegation_reply(&request.ticket, &request.access_type, 0, &[]);
            let _ = self.pool.send(key, reply);
            return;
        };
        let Ok(uid) = Uid::new(&descriptor.uid_hex()) else {
            let reply = sphinx::delegation_reply(&request.ticket, &request.access_type, 0, &[]);
            let _ = self.pool.send(key, reply);
            return;
        };

        if self.sessions.active_session_for(key).is_some() {
            debug!(terminal = key, "delegation ignored: session active");
            return;
        }

        let denial = self
            .cards
            .check_global(uid.as_str())
            .or_else(|| self.cards.check_secondary(uid.as_str()));
        if let Some(message) = denial {
            info!(uid = %uid, message = %message, "delegation denied by card list");
            let reply = sphinx::delegation_reply(&request.ticket, &request.access_type, 0, &[]);
            let _ = self.pool.send(key, reply);
            return;
        }

        let input = SessionInput::SphinxDelegation {
            uid,
            ticket: request.ticket.clone(),
            access_type: request.access_type.clone(),
        };
        match self.sessions.start_session(&mut self.pool, key, input) {
            Ok((_, requests)) => self.execute_side_requests(requests),
            Err(e) => debug!(terminal = key, error = %e, "delegation session not started"),
        }
    }

    /// A camera identified a person; synthesise a faceid session on the
    /// linked terminal.
    pub(crate) fn dispatch_identification(
        &mut self,
        terminal_id: &str,
        pid: &str,
        fio: &str,
        cam_id: &str,
        score: f64,
        raw: Value,
    ) {
        info!(terminal_id, pid, fio, cam_id, score, "identification");

        let Some(key) = self
            .pool
            .connections()
            .into_iter()
            .find(|c| c.terminal_id == terminal_id)
            .map(|c| c.key)
        else {
            warn!(terminal_id, "identification for unconnected terminal");
            return;
        };

        if self.sessions.active_session_for(&key).is_some() {
            debug!(terminal = %key, "identification ignored: session active");
            return;
        }

        let prefilled_kpo = self.cfg.crt.no_kpo_pass.then(|| {
            let mut message = format!("{}, {}", fio.trim(), format_score(score));
            if message.trim().len() < 3 {
                message = self.cfg.service_fixed_msg.clone();
            }
            passgate_session::KpoOutcome {
                result: passgate_core::KpoResult::Yes,
                message,
            }
        });

        let input = SessionInput::FaceId {
            input: FaceIdInput {
                pid: pid.to_string(),
                fio: fio.to_string(),
                cam_id: cam_id.to_string(),
                score,
                raw,
            },
            prefilled_kpo,
        };
        match self.sessions.start_session(&mut self.pool, &key, input) {
            Ok((_, requests)) => self.execute_side_requests(requests),
            Err(e) => debug!(terminal = %key, error = %e, "faceid session not started"),
        }
    }
}
