//! Identification poller.
//!
//! Three REST stages against the camera server, driven by a background
//! task:
//!
//! 1. `CameraEvent/GetItems`: newest events per camera since the last
//!    fetched time (the very first poll only establishes the baseline).
//! 2. `MatchDetailMessage/GetItems`: best-scoring match for a new face
//!    card, score within (0, 1].
//! 3. `PersonCard/GetItems`: person id (`Information`) and display name
//!    (the `_fio` property).
//!
//! Fresh identifications are emitted as [`IdentEvent`]s; a per-(camera,
//! person) ban cache and seen ledgers keep one walk past a camera from
//! producing a stream of sessions.

use chrono::{DateTime, Utc};
use passgate_core::{Config, constants};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Events delivered to the orchestrator.
#[derive(Debug, Clone)]
pub enum IdentEvent {
    /// A camera identified a person linked to a terminal.
    Identified {
        terminal_id: String,
        pid: String,
        fio: String,
        cam_id: String,
        score: f64,
        raw: Value,
    },
}

/// Commands into the poller task.
#[derive(Debug, Clone)]
pub enum IdentCommand {
    /// Ban a (camera, person) pair after a successful pass
    /// (`ban_pass_only` mode).
    BanAfterPass { cam_id: String, pid: String },
    /// Verification mode: resolve this request when the person shows up
    /// at the camera.
    AddSessionRequest {
        session_id: String,
        cam_id: String,
        pid: String,
    },
}

/// Handle to a running poller.
pub struct PollerHandle {
    pub task: JoinHandle<()>,
    pub commands: mpsc::Sender<IdentCommand>,
    stop_tx: watch::Sender<bool>,
}

impl PollerHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Start the poller. The caller only spawns it when the service is
/// active and `check_time` is positive.
#[must_use]
pub fn spawn_poller(cfg: Arc<Config>, events: mpsc::Sender<IdentEvent>) -> PollerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);

    let poller = Poller::new(cfg, events, cmd_rx, stop_rx);
    let task = tokio::spawn(poller.run());

    PollerHandle {
        task,
        commands: cmd_tx,
        stop_tx,
    }
}

#[derive(Debug, Clone)]
struct SeenEntry {
    terminal_id: String,
    fio: String,
    score: f64,
    at: Instant,
    raw: Value,
}

#[derive(Debug)]
struct SessionRequest {
    #[allow(dead_code)]
    session_id: String,
    expires_at: Instant,
}

struct Poller {
    cfg: Arc<Config>,
    events: mpsc::Sender<IdentEvent>,
    commands: mpsc::Receiver<IdentCommand>,
    stop: watch::Receiver<bool>,
    http: reqwest::Client,

    fetched: Option<DateTime<Utc>>,
    /// Last FaceCardId per camera, for dedup
    cam_events: HashMap<String, i64>,
    cam_seen: HashMap<String, HashMap<String, SeenEntry>>,
    person_seen: HashMap<String, HashMap<String, SeenEntry>>,
    /// `cam_id_pid` -> ban expiry
    ban: HashMap<String, Instant>,
    /// `cam_id_pid` -> pending verification-mode request
    session_requests: HashMap<String, SessionRequest>,
    next_sweep: Instant,
}

impl Poller {
    fn new(
        cfg: Arc<Config>,
        events: mpsc::Sender<IdentEvent>,
        commands: mpsc::Receiver<IdentCommand>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let http = reqwest::Client::new();
        Poller {
            cfg,
            events,
            commands,
            stop,
            http,
            fetched: None,
            cam_events: HashMap::new(),
            cam_seen: HashMap::new(),
            person_seen: HashMap::new(),
            ban: HashMap::new(),
            session_requests: HashMap::new(),
            next_sweep: Instant::now(),
        }
    }

    async fn run(mut self) {
        let period = Duration::from_secs_f64(self.cfg.crt.check_time.max(0.1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(period_s = period.as_secs_f64(), "identification poller running");

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    info!("identification poller stopped");
                    return;
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    self.sweep();
                    self.poll().await;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: IdentCommand) {
        let now = Instant::now();
        match cmd {
            IdentCommand::BanAfterPass { cam_id, pid } => {
                let ban_time = self.cfg.crt.ban_cam_pid_time;
                if ban_time > 0.0 && self.cfg.crt.ban_pass_only {
                    self.ban.insert(
                        format!("{cam_id}_{pid}"),
                        now + Duration::from_secs_f64(ban_time),
                    );
                }
            }
            IdentCommand::AddSessionRequest {
                session_id,
                cam_id,
                pid,
            } => {
                let timeout = self.cfg.crt.seen_timeout;
                if timeout <= 0.0 {
                    return;
                }
                self.session_requests.insert(
                    format!("{cam_id}_{pid}"),
                    SessionRequest {
                        session_id,
                        expires_at: now + Duration::from_secs_f64(timeout),
                    },
                );
                // fire immediately when the person was already seen
                self.try_session_request(&cam_id, &pid);
            }
        }
    }

    /// Expire seen entries, bans and pending requests. Runs at most once
    /// per sweep interval.
    fn sweep(&mut self) {
        let now = Instant::now();
        if now < self.next_sweep {
            return;
        }
        self.next_sweep = now + SWEEP_INTERVAL;

        let seen_timeout = self.cfg.crt.seen_timeout;
        if seen_timeout > 0.0 {
            let horizon = Duration::from_secs_f64(seen_timeout);
            for ledger in [&mut self.cam_seen, &mut self.person_seen] {
                for entries in ledger.values_mut() {
                    entries.retain(|_, e| now.duration_since(e.at) < horizon);
                }
                ledger.retain(|_, entries| !entries.is_empty());
            }
        }

        self.ban.retain(|_, expiry| *expiry > now);
        self.session_requests.retain(|_, r| r.expires_at > now);
    }

    fn base_url(&self, path: &str) -> String {
        format!(
            "http://{}:{}{}{}",
            self.cfg.crt.host, self.cfg.crt.port, self.cfg.crt.url, path
        )
    }

    async fn get_json(&self, url: &str, stage_timeout: f64) -> Option<Value> {
        let timeout = if stage_timeout > 0.0 {
            Duration::from_secs_f64(stage_timeout)
        } else {
            Duration::from_secs_f64(self.cfg.crt.expire_time.max(1.0))
        };

        let mut request = self.http.get(url).timeout(timeout);
        if !self.cfg.crt.name.is_empty() {
            request = request.header(reqwest::header::HOST, &self.cfg.crt.name);
        }
        request = request.header(reqwest::header::ACCEPT, "application/json");
        for header in &self.cfg.crt.extra_headers {
            if let Some((name, value)) = header.split_once(':') {
                request = request.header(name.trim(), value.trim());
            }
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                debug!(url, status = %response.status(), "camera server error");
                None
            }
            Err(e) => {
                debug!(url, error = %e, "camera server unreachable");
                None
            }
        }
    }

    /// Stage 1: pull fresh camera events and advance the fetched time.
    async fn poll(&mut self) {
        let take = if self.fetched.is_some() { 20 } else { 1 };
        let mut url = format!(
            "{}?criteria.matchDateSortType=2&criteria.ignoreMatchcesOnSameCameras=true\
             &criteria.includeAllFaceCards=true&criteria.take={take}",
            self.base_url("CameraEvent/GetItems")
        );
        if let Some(fetched) = self.fetched {
            url.push_str(&format!(
                "&criteria.matchDateFrom={}",
                format_crt_time(fetched)
            ));
        }

        let Some(body) = self.get_json(&url, self.cfg.crt.connect_time1).await else {
            return;
        };
        let Some(items) = body.as_array() else {
            return;
        };
        if items.is_empty() {
            return;
        }

        // newest first: the first item carries the max DateCreated
        let Some(max_date) = items
            .first()
            .and_then(|i| get_ci(i, "DateCreated"))
            .and_then(Value::as_str)
            .and_then(parse_crt_time)
        else {
            return;
        };

        let first_poll = self.fetched.is_none();
        self.fetched = Some(max_date + chrono::Duration::microseconds(1));
        if first_poll {
            debug!(baseline = %max_date, "identification baseline established");
            return;
        }

        // one event per camera, first occurrence wins
        let mut per_camera: Vec<(String, &Value)> = Vec::new();
        for item in items {
            let Some(cam_id) = get_ci(item, "CameraId").map(value_to_string) else {
                continue;
            };
            let cam_id = cam_id.trim().to_string();
            if cam_id.is_empty() || per_camera.iter().any(|(c, _)| *c == cam_id) {
                continue;
            }
            per_camera.push((cam_id, item));
        }

        for (cam_id, item) in per_camera {
            let fcid = get_ci(item, "FaceCardId")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if fcid <= 0 || self.cam_events.get(&cam_id) == Some(&fcid) {
                continue;
            }
            self.cam_events.insert(cam_id.clone(), fcid);

            let Some(terminal_id) = self.cfg.crt.cam_links.get(&cam_id).cloned() else {
                continue;
            };

            if let Some((pid, fio, score, raw)) = self.resolve_person(fcid).await {
                self.process_identification(&cam_id, &terminal_id, pid, fio, score, raw)
                    .await;
            }
        }
    }

    /// Stages 2 and 3: match details, then the person card.
    async fn resolve_person(&self, fcid: i64) -> Option<(String, String, f64, Value)> {
        let match_url = format!(
            "{}?criteria.parentFaceCardId={fcid}&criteria.orderType=1&criteria.take=1",
            self.base_url("MatchDetailMessage/GetItems")
        );
        let matches = self.get_json(&match_url, self.cfg.crt.connect_time2).await?;
        let (cfcid, score) = best_match(matches.as_array()?)?;

        let person_url = format!(
            "{}?criteria.faceCardId={cfcid}&criteria.includePersonCardPropertyValues=true&criteria.take=1",
            self.base_url("PersonCard/GetItems")
        );
        let cards = self.get_json(&person_url, self.cfg.crt.connect_time3).await?;
        let (pid, fio, raw) = person_card(cards.as_array()?)?;

        if !valid_pid(&pid) {
            warn!(pid = %pid, "identification with invalid person id dropped");
            return None;
        }
        Some((pid, fio, score, raw))
    }

    async fn process_identification(
        &mut self,
        cam_id: &str,
        terminal_id: &str,
        pid: String,
        fio: String,
        score: f64,
        raw: Value,
    ) {
        let now = Instant::now();
        let entry = SeenEntry {
            terminal_id: terminal_id.to_string(),
            fio: fio.clone(),
            score,
            at: now,
            raw: raw.clone(),
        };
        self.cam_seen
            .entry(cam_id.to_string())
            .or_default()
            .insert(pid.clone(), entry.clone());
        self.person_seen
            .entry(pid.clone())
            .or_default()
            .insert(cam_id.to_string(), entry);

        if !self.cfg.crt.identification_mode {
            // verification mode: only resolve a pending session request
            self.try_session_request(cam_id, &pid);
            return;
        }

        let cpid = format!("{cam_id}_{pid}");
        if self.ban.get(&cpid).is_some_and(|expiry| *expiry > now) {
            debug!(cam = cam_id, pid = %pid, "identification suppressed by ban");
            return;
        }

        let ban_time = self.cfg.crt.ban_cam_pid_time;
        if ban_time > 0.0 && !self.cfg.crt.ban_pass_only {
            // ban_from_catch starts the window at the catch; with a live
            // poll the catch is "now"
            self.ban
                .insert(cpid, now + Duration::from_secs_f64(ban_time));
        }

        let _ = self
            .events
            .send(IdentEvent::Identified {
                terminal_id: terminal_id.to_string(),
                pid,
                fio,
                cam_id: cam_id.to_string(),
                score,
                raw,
            })
            .await;
    }

    /// Fire a pending verification-mode request if the person is in the
    /// seen ledger.
    fn try_session_request(&mut self, cam_id: &str, pid: &str) {
        let rid = format!("{cam_id}_{pid}");
        if !self.session_requests.contains_key(&rid) {
            return;
        }
        let Some(entry) = self.cam_seen.get(cam_id).and_then(|m| m.get(pid)) else {
            return;
        };
        let event = IdentEvent::Identified {
            terminal_id: entry.terminal_id.clone(),
            pid: pid.to_string(),
            fio: entry.fio.clone(),
            cam_id: cam_id.to_string(),
            score: entry.score,
            raw: entry.raw.clone(),
        };
        self.session_requests.remove(&rid);
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(event).await;
        });
    }
}

/// A PID is a trimmed string of 3-15 decimal digits.
#[must_use]
pub fn valid_pid(pid: &str) -> bool {
    let pid = pid.trim();
    (constants::MIN_PID_LENGTH..=constants::MAX_PID_LENGTH).contains(&pid.len())
        && pid.bytes().all(|b| b.is_ascii_digit())
}

/// Format a score in (0, 1] as `NN%`.
#[must_use]
pub fn format_score(score: f64) -> String {
    if score > 0.0 && score <= 1.0 {
        format!("{}%", (score * 100.0).round() as u32)
    } else {
        String::new()
    }
}

/// Case-insensitive object field lookup (the camera server is not
/// consistent about key casing).
fn get_ci<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `2019-04-25T13:59:46.9470000Z`, with the fraction optional.
fn parse_crt_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// The server expects seven fractional digits.
fn format_crt_time(dt: DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        dt.format("%Y-%m-%dT%H:%M:%S"),
        dt.timestamp_subsec_nanos() / 100
    )
}

/// Best match within (0, 1] from a MatchDetailMessage response.
fn best_match(items: &[Value]) -> Option<(i64, f64)> {
    let mut best: Option<(i64, f64)> = None;
    for item in items {
        let cfcid = get_ci(item, "ChildFaceCardId")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let score = get_ci(item, "Score").and_then(Value::as_f64).unwrap_or(0.0);
        if cfcid <= 0 || score <= 0.0 || score > 1.0 {
            continue;
        }
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((cfcid, score));
        }
    }
    best
}

/// Extract `(pid, fio, raw)` from a PersonCard response: the pid is the
/// `Information` field, the fio the `_fio` property value.
fn person_card(items: &[Value]) -> Option<(String, String, Value)> {
    for item in items {
        let Some(pid) = get_ci(item, "Information")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
        else {
            continue;
        };

        let fio = get_ci(item, "PersonCardPropertyValues")
            .and_then(Value::as_array)
            .and_then(|values| {
                values.iter().find_map(|v| {
                    let name = get_ci(v, "PropertyTemplateEntry")
                        .and_then(|p| get_ci(p, "Name"))
                        .and_then(Value::as_str)?;
                    if name == "_fio" {
                        get_ci(v, "Value").and_then(Value::as_str).map(str::to_string)
                    } else {
                        None
                    }
                })
            })
            .unwrap_or_default();

        return Some((pid.to_string(), fio, item.clone()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("123456", true)]
    #[case(" 123 ", true)]
    #[case("12", false)] // too short
    #[case("1234567890123456", false)] // too long
    #[case("12a456", false)]
    #[case("", false)]
    fn test_valid_pid(#[case] pid: &str, #[case] ok: bool) {
        assert_eq!(valid_pid(pid), ok);
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(0.87), "87%");
        assert_eq!(format_score(1.0), "100%");
        assert_eq!(format_score(0.004), "0%");
        assert_eq!(format_score(0.0), "");
        assert_eq!(format_score(1.5), "");
    }

    #[test]
    fn test_parse_crt_time_with_seven_digit_fraction() {
        let dt = parse_crt_time("2019-04-25T13:59:46.9470000Z").unwrap();
        assert_eq!(dt.timestamp_subsec_millis(), 947);

        let dt = parse_crt_time("2019-04-25T13:59:46Z").unwrap();
        assert_eq!(dt.timestamp_subsec_nanos(), 0);

        assert!(parse_crt_time("yesterday").is_none());
    }

    #[test]
    fn test_format_crt_time_roundtrip() {
        let dt = parse_crt_time("2019-04-25T13:59:46.9470000Z").unwrap();
        assert_eq!(format_crt_time(dt), "2019-04-25T13:59:46.9470000Z");
    }

    #[test]
    fn test_best_match_rules() {
        let items = vec![
            json!({"ChildFaceCardId": 11, "Score": 0.5}),
            json!({"ChildFaceCardId": 12, "Score": 0.9}),
            json!({"ChildFaceCardId": 13, "Score": 1.2}), // out of range
            json!({"ChildFaceCardId": 0, "Score": 0.95}), // bad card id
        ];
        assert_eq!(best_match(&items), Some((12, 0.9)));
        assert_eq!(best_match(&[]), None);
    }

    #[test]
    fn test_person_card_extraction() {
        let items = vec![json!({
            "Information": " 123456 ",
            "PersonCardPropertyValues": [
                {"PropertyTemplateEntry": {"Name": "_phone"}, "Value": "555"},
                {"PropertyTemplateEntry": {"Name": "_fio"}, "Value": "Иванов И.И."}
            ]
        })];
        let (pid, fio, _raw) = person_card(&items).unwrap();
        assert_eq!(pid, "123456");
        assert_eq!(fio, "Иванов И.И.");
    }

    #[test]
    fn test_person_card_case_insensitive_keys() {
        let items = vec![json!({
            "information": "654321",
            "personCardPropertyValues": []
        })];
        let (pid, fio, _) = person_card(&items).unwrap();
        assert_eq!(pid, "654321");
        assert_eq!(fio, "");
    }

    #[test]
    fn test_get_ci() {
        let v = json!({"CameraId": "C1"});
        assert!(get_ci(&v, "cameraid").is_some());
        assert!(get_ci(&v, "CameraId").is_some());
        assert!(get_ci(&v, "missing").is_none());
    }
}
