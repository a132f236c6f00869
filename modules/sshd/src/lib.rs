//! Correlates OpenSSH server login activity: successful password/publickey
//! logins, failed attempts, invalid users, and per-host lockouts once a
//! configurable failure count is reached inside a sliding window.
//!
//! Each `(hostname, proc_id)` pair identifies one sshd child process's
//! transcript. A transaction starts when that identifier is first seen
//! (accepted, auth-failed, or invalid-user) and ends when a later record
//! closes the session or the connection.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use correlator_config::ConfigStore;
use correlator_event::{Event, EventKind, EventKindRegistration, EventSeverity, RawFieldValue};
use correlator_module::{
    dispatch_event, CountOverTime, EventSink, Module, ModuleError, ModuleRegistration, TimerKind,
};
use correlator_syslog::SyslogRecord;
use serde::{Deserialize, Serialize};

mod detect;

const MODULE_ID: &str = "sshd_logins";

const FAILURE_WINDOW_PARAM: &str = "module.sshd.login_failure_window";
const DEFAULT_FAILURE_WINDOW: i64 = 300;

const FAILURE_LIMIT_PARAM: &str = "module.sshd.login_failure_limit";
const DEFAULT_FAILURE_LIMIT: usize = 5;

static SSHD_LOGIN_KIND: EventKind = EventKind {
    name: "sshd_login",
    schema: &[
        ("auth", "authentication method, password or rsa"),
        ("user", "the authenticated user"),
        ("addr", "the remote address"),
        ("port", "the remote port"),
        ("key", "key fingerprint, when auth was publickey"),
        ("failures", "failed attempts before this session succeeded"),
        ("start", "session open time"),
        ("finish", "session close time"),
        ("duration", "session duration"),
    ],
    summary_template: "${user}@${addr} logged in via ${auth} (${failures} prior failures)",
    templates: &[],
    severity_override: None,
};
inventory::submit! { EventKindRegistration(&SSHD_LOGIN_KIND) }

static SSHD_LOGIN_FAILED_KIND: EventKind = EventKind {
    name: "sshd_login_failed",
    schema: &[
        ("user", "the user that failed to authenticate"),
        ("addr", "the remote address"),
        ("port", "the remote port"),
        ("failures", "failed attempts recorded for this transaction"),
    ],
    summary_template: "${user}@${addr} was denied after ${failures} failed attempts",
    templates: &[],
    severity_override: Some(EventSeverity::Warning),
};
inventory::submit! { EventKindRegistration(&SSHD_LOGIN_FAILED_KIND) }

static SSHD_LOGIN_RETRY_KIND: EventKind = EventKind {
    name: "sshd_login_retry",
    schema: &[("host", "the remote host exceeding the failure limit")],
    summary_template: "${host} exceeded the login failure limit and is locked out",
    templates: &[],
    severity_override: Some(EventSeverity::Error),
};
inventory::submit! { EventKindRegistration(&SSHD_LOGIN_RETRY_KIND) }

static SSHD_STATS_KIND: EventKind = EventKind {
    name: "module-stats",
    schema: &[
        ("login_sessions", "successful logins since the last reset"),
        ("denied", "unsuccessful logins since the last reset"),
        ("lockouts", "lockouts triggered since the last reset"),
    ],
    summary_template:
        "${login_sessions} total successful logins, ${denied} unsuccessful logins, ${lockouts} lockouts.",
    templates: &[],
    severity_override: None,
};
inventory::submit! { EventKindRegistration(&SSHD_STATS_KIND) }

inventory::submit! {
    ModuleRegistration {
        id: MODULE_ID,
        constructor: |module_name| Box::new(Sshd::new(module_name)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Transaction {
    auth: Option<String>,
    user: Option<String>,
    addr: Option<String>,
    port: Option<String>,
    key: Option<String>,
    failures: i64,
    start: Option<NaiveDateTime>,
    finish: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum TransactionState {
    AwaitingOpenOrFailure,
    SessionOpen,
}

#[derive(Default, Serialize, Deserialize)]
struct Store {
    states: HashMap<String, TransactionState>,
    transactions: HashMap<String, Transaction>,
    address_store: CountOverTime,
    login_sessions: u64,
    denied: u64,
    lockouts: u64,
}

pub struct Sshd {
    module_name: String,
    expiry_seconds: i64,
    failure_limit: usize,
    store: Store,
}

impl Sshd {
    pub fn new(module_name: String) -> Self {
        Sshd {
            module_name,
            expiry_seconds: DEFAULT_FAILURE_WINDOW,
            failure_limit: DEFAULT_FAILURE_LIMIT,
            store: Store::default(),
        }
    }

    fn identifier(record: &SyslogRecord) -> Option<String> {
        let hostname = record.hostname.as_deref()?;
        let proc_id = record.proc_id.as_deref()?;
        Some(format!("{hostname}.{proc_id}"))
    }

    fn handle_unseen(&mut self, identifier: &str, record: &SyslogRecord, sink: &mut dyn EventSink) {
        let detail = record.detail.as_deref().unwrap_or("");

        if let Some(props) = detect::detect_accepted(detail) {
            let addr = props.addr.clone();
            self.store.states.insert(identifier.to_string(), TransactionState::AwaitingOpenOrFailure);
            self.store.transactions.insert(
                identifier.to_string(),
                Transaction {
                    auth: Some(props.auth),
                    user: Some(props.user),
                    addr: Some(addr.clone()),
                    port: Some(props.port),
                    key: props.key,
                    failures: 0,
                    start: None,
                    finish: None,
                },
            );
            self.store.address_store.clear(&addr);
            return;
        }

        if let Some(props) = detect::detect_authfailure(detail) {
            self.store.states.insert(identifier.to_string(), TransactionState::AwaitingOpenOrFailure);
            self.store.transactions.insert(
                identifier.to_string(),
                Transaction {
                    auth: None,
                    user: props.get("user").cloned(),
                    addr: props.get("rhost").cloned(),
                    port: None,
                    key: None,
                    failures: 0,
                    start: None,
                    finish: None,
                },
            );
            return;
        }

        if let Some(props) = detect::detect_invalid_user(detail) {
            self.store.states.insert(identifier.to_string(), TransactionState::AwaitingOpenOrFailure);
            self.store.transactions.insert(
                identifier.to_string(),
                Transaction {
                    auth: None,
                    user: Some(props.user),
                    addr: Some(props.addr.clone()),
                    port: Some(props.addr),
                    key: None,
                    failures: 0,
                    start: None,
                    finish: None,
                },
            );
        }
        let _ = sink;
    }

    fn handle_awaiting(&mut self, identifier: &str, record: &SyslogRecord, sink: &mut dyn EventSink) {
        let detail = record.detail.as_deref().unwrap_or("");
        let now = record.timestamp.unwrap_or_default();

        if let Some(props) = detect::detect_passwordfailure(detail) {
            let trans = self.store.transactions.get_mut(identifier).expect("state implies transaction");
            trans.failures += 1;
            let failures = self.store.address_store.record(&props.addr, now);
            if failures >= self.failure_limit {
                self.store.lockouts += 1;
                let evt = retry_event(&props.addr, now);
                dispatch_event(&self.module_name, evt, sink);
            }
            return;
        }

        if detect::detect_open(detail).is_some() {
            if let Some(trans) = self.store.transactions.get_mut(identifier) {
                trans.start = Some(now);
            }
            self.store.states.insert(identifier.to_string(), TransactionState::SessionOpen);
            return;
        }

        if let Some(props) = detect::detect_accepted(detail) {
            debug_assert!(
                detect::detect_close(detail).is_none(),
                "a single syslog line is never both an accepted-auth line and a close line"
            );
            self.store.address_store.clear(&props.addr);
            if let Some(trans) = self.store.transactions.get_mut(identifier) {
                trans.auth = Some(props.auth);
                trans.user = Some(props.user);
                trans.addr = Some(props.addr);
                trans.port = Some(props.port);
                trans.key = props.key;
            }
            return;
        }

        if detect::detect_close(detail).is_some() {
            self.store.denied += 1;
            if let Some(trans) = self.store.transactions.remove(identifier) {
                self.store.states.remove(identifier);
                let evt = login_failed_event(&trans, now);
                dispatch_event(&self.module_name, evt, sink);
            }
        }
    }

    fn handle_session_open(&mut self, identifier: &str, record: &SyslogRecord, sink: &mut dyn EventSink) {
        let detail = record.detail.as_deref().unwrap_or("");
        let now = record.timestamp.unwrap_or_default();

        if detect::detect_close(detail).is_some() {
            if let Some(mut trans) = self.store.transactions.remove(identifier) {
                self.store.states.remove(identifier);
                trans.finish = Some(now);
                self.store.login_sessions += 1;
                let evt = login_event(&trans);
                dispatch_event(&self.module_name, evt, sink);
            }
        }
    }
}

fn login_event(trans: &Transaction) -> Event {
    let start = trans.start.unwrap_or_default();
    let finish = trans.finish.unwrap_or_default();
    let duration = finish.signed_duration_since(start);
    let mut payload = indexmap::IndexMap::new();
    payload.insert("auth".to_string(), opt_field(&trans.auth));
    payload.insert("user".to_string(), opt_field(&trans.user));
    payload.insert("addr".to_string(), opt_field(&trans.addr));
    payload.insert("port".to_string(), opt_field(&trans.port));
    payload.insert("key".to_string(), opt_field(&trans.key));
    payload.insert("failures".to_string(), RawFieldValue::from(trans.failures));
    payload.insert("start".to_string(), RawFieldValue::from(start));
    payload.insert("finish".to_string(), RawFieldValue::from(finish));
    payload.insert("duration".to_string(), RawFieldValue::from(duration.to_string()));
    Event::new(&SSHD_LOGIN_KIND, finish, payload, None, EventSeverity::Informational)
        .expect("sshd_login payload matches its own schema")
}

fn login_failed_event(trans: &Transaction, now: NaiveDateTime) -> Event {
    let mut payload = indexmap::IndexMap::new();
    payload.insert("user".to_string(), opt_field(&trans.user));
    payload.insert("addr".to_string(), opt_field(&trans.addr));
    payload.insert("port".to_string(), opt_field(&trans.port));
    payload.insert("failures".to_string(), RawFieldValue::from(trans.failures));
    Event::new(&SSHD_LOGIN_FAILED_KIND, now, payload, None, EventSeverity::Warning)
        .expect("sshd_login_failed payload matches its own schema")
}

fn retry_event(host: &str, now: NaiveDateTime) -> Event {
    let mut payload = indexmap::IndexMap::new();
    payload.insert("host".to_string(), RawFieldValue::from(host));
    Event::new(&SSHD_LOGIN_RETRY_KIND, now, payload, None, EventSeverity::Error)
        .expect("sshd_login_retry payload matches its own schema")
}

fn opt_field(value: &Option<String>) -> RawFieldValue {
    match value {
        Some(v) => RawFieldValue::from(v.as_str()),
        None => RawFieldValue::Null,
    }
}

fn failure_limit_from(config: &ConfigStore) -> usize {
    config
        .get(FAILURE_LIMIT_PARAM)
        .ok()
        .and_then(|v| v.as_i64())
        .map(|v| v.max(0) as usize)
        .unwrap_or(DEFAULT_FAILURE_LIMIT)
}

fn failure_window_from(config: &ConfigStore) -> i64 {
    config
        .get(FAILURE_WINDOW_PARAM)
        .ok()
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_FAILURE_WINDOW)
}

impl Module for Sshd {
    fn module_name(&self) -> &str {
        &self.module_name
    }

    fn description(&self) -> &str {
        "OpenSSH Server SSH Logins"
    }

    fn initialize(&mut self, config: &ConfigStore) -> Result<(), ModuleError> {
        self.expiry_seconds = failure_window_from(config);
        self.failure_limit = failure_limit_from(config);
        self.store.address_store = CountOverTime::new(self.expiry_seconds);
        Ok(())
    }

    fn handle_record(&mut self, record: &SyslogRecord, sink: &mut dyn EventSink) {
        let Some(appname) = record.appname.as_deref() else {
            return;
        };
        if !appname.eq_ignore_ascii_case("sshd") {
            return;
        }
        let Some(identifier) = Self::identifier(record) else {
            return;
        };

        match self.store.states.get(&identifier).copied() {
            None => self.handle_unseen(&identifier, record, sink),
            Some(TransactionState::AwaitingOpenOrFailure) => {
                self.handle_awaiting(&identifier, record, sink)
            }
            Some(TransactionState::SessionOpen) => {
                self.handle_session_open(&identifier, record, sink)
            }
        }
    }

    fn statistics(&mut self, reset: bool, sink: &mut dyn EventSink) {
        let mut payload = indexmap::IndexMap::new();
        payload.insert(
            "login_sessions".to_string(),
            RawFieldValue::from(self.store.login_sessions as i64),
        );
        payload.insert("denied".to_string(), RawFieldValue::from(self.store.denied as i64));
        payload.insert("lockouts".to_string(), RawFieldValue::from(self.store.lockouts as i64));
        let evt = Event::new(
            &SSHD_STATS_KIND,
            chrono::Utc::now().naive_utc(),
            payload,
            None,
            EventSeverity::Informational,
        )
        .expect("module-stats payload matches its own schema");
        dispatch_event(&self.module_name, evt, sink);

        if reset {
            self.store.login_sessions = 0;
            self.store.denied = 0;
            self.store.lockouts = 0;
        }
    }

    fn timer_tick(&mut self, kinds: &[TimerKind], now: NaiveDateTime, _sink: &mut dyn EventSink) {
        if kinds.contains(&TimerKind::Hour) {
            let expired = self.store.address_store.expire(now);
            if expired > 0 {
                tracing::debug!(expired, "swept stale sshd failure-tracking entries");
            }
        }
    }

    fn save_store(&self) -> Vec<u8> {
        serde_json::to_vec(&self.store).unwrap_or_default()
    }

    fn load_store(&mut self, bytes: &[u8]) -> Result<(), ModuleError> {
        self.store = serde_json::from_slice(bytes).map_err(|e| ModuleError::StoreDecode {
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn fresh_store(&mut self) {
        self.store = Store {
            address_store: CountOverTime::new(self.expiry_seconds),
            ..Store::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use correlator_module::EventQueue;

    fn record(hostname: &str, proc_id: &str, appname: &str, detail: &str, ts: &str) -> SyslogRecord {
        SyslogRecord {
            raw: Bytes::from_static(b""),
            timestamp: Some(NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap()),
            priority: None,
            hostname: Some(hostname.to_string()),
            appname: Some(appname.to_string()),
            proc_id: Some(proc_id.to_string()),
            msg_id: None,
            detail: Some(detail.to_string()),
            structured_data: Default::default(),
            parse_error: None,
        }
    }

    fn new_module() -> Sshd {
        let mut module = Sshd::new("sshd".to_string());
        module.initialize(&ConfigStore::new()).unwrap();
        module
    }

    #[test]
    fn happy_login_emits_a_single_login_event() {
        let mut module = new_module();
        let mut sink = EventQueue::new();

        module.handle_record(
            &record("host1", "123", "sshd", "Accepted password for alice from 10.0.0.5 port 50759", "2024-01-01 00:00:00"),
            &mut sink,
        );
        module.handle_record(
            &record("host1", "123", "sshd", "pam_unix(sshd:session): session opened for user alice by (uid=0)", "2024-01-01 00:00:01"),
            &mut sink,
        );
        module.handle_record(
            &record("host1", "123", "sshd", "pam_unix(sshd:session): session closed for user alice", "2024-01-01 00:00:05"),
            &mut sink,
        );

        let events = sink.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind.name, "sshd_login");
        assert_eq!(module.store.login_sessions, 1);
    }

    #[test]
    fn repeated_failures_trigger_lockout() {
        let mut module = new_module();
        module.failure_limit = 3;
        let mut sink = EventQueue::new();

        module.handle_record(
            &record("host1", "200", "sshd", "authentication failure; logname= uid=0 euid=0 tty=ssh ruser= rhost=10.0.0.9  user=bob", "2024-01-01 00:00:00"),
            &mut sink,
        );
        for i in 0..3 {
            module.handle_record(
                &record(
                    "host1",
                    "200",
                    "sshd",
                    "Failed password for bob from 10.0.0.9 port 4000",
                    &format!("2024-01-01 00:00:0{i}"),
                ),
                &mut sink,
            );
        }

        let events = sink.drain();
        assert!(events.iter().any(|e| e.kind.name == "sshd_login_retry"));
        assert_eq!(module.store.lockouts, 1);
    }

    #[test]
    fn expiry_sweep_drops_stale_failure_tracking() {
        let mut module = new_module();
        module.store.address_store.record("10.0.0.9", NaiveDateTime::parse_from_str("2024-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap());
        let mut sink = EventQueue::new();
        let far_future = NaiveDateTime::parse_from_str("2024-01-02 01:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        module.timer_tick(&[TimerKind::Hour], far_future, &mut sink);
        assert_eq!(module.store.address_store.count("10.0.0.9"), 0);
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let mut module = new_module();
        module.store.login_sessions = 4;
        let bytes = module.save_store();

        let mut restored = Sshd::new("sshd".to_string());
        restored.load_store(&bytes).unwrap();
        assert_eq!(restored.store.login_sessions, 4);
    }
}
