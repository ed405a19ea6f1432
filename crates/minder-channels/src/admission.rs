//! Admission control: allow-list check plus the invite-code flow used
//! while a channel has no admitted users yet.
//!
//! Deny-by-default once anyone is admitted; before that, a sender may
//! redeem an invite code. Repeated failures inside the window start a
//! cooldown, and the cooldown notice reports the exact seconds remaining.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use minder_core::{Clock, SettingsStore};

pub const INVITE_MAX_FAILED_ATTEMPTS: u32 = 3;
pub const INVITE_COOLDOWN_SECS: i64 = 30;
/// Window inside which failed attempts accumulate.
const FAILURE_WINDOW_SECS: i64 = 60;

/// Outcome of admitting one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Sender is on the allow-list: process the message.
    Authorized,
    /// Allow-list is non-empty and the sender is not on it.
    Denied { notice: String },
    /// Invite flow consumed the message; reply with the notice and stop.
    InviteReply { notice: String, admitted: bool },
}

#[derive(Debug, Clone, Default)]
struct InviteState {
    failures: u32,
    window_start: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

/// Per-`(channel, sender)` invite bookkeeping over the settings-backed
/// allow-list.
pub struct AdmissionService {
    settings: Arc<SettingsStore>,
    clock: Arc<dyn Clock>,
    states: DashMap<(String, String), InviteState>,
}

impl AdmissionService {
    pub fn new(settings: Arc<SettingsStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            states: DashMap::new(),
        }
    }

    /// Pure allow-list check, used by `Channel::is_authorized`.
    pub fn is_authorized(&self, channel: &str, sender_id: &str, username: &str) -> bool {
        let allow = self.allow_list(channel);
        is_allowed(&allow, username, sender_id)
    }

    /// Full admission decision for an inbound event.
    pub fn admit(
        &self,
        channel: &str,
        sender_id: &str,
        username: &str,
        text: &str,
    ) -> Admission {
        let snapshot = self.settings.snapshot();
        let allow = self.allow_list(channel);

        if is_allowed(&allow, username, sender_id) {
            return Admission::Authorized;
        }
        if !allow.is_empty() {
            return Admission::Denied {
                notice: snapshot.notices.unauthorized.clone(),
            };
        }

        // Nobody admitted yet: invite flow.
        let key = (channel.to_string(), sender_id.to_string());
        let now = self.clock.now();
        let mut state = self.states.entry(key).or_default();

        if let Some(until) = state.cooldown_until {
            if now < until {
                let remaining = (until - now).num_seconds().max(0) as u64
                    + u64::from((until - now).subsec_nanos() > 0);
                return Admission::InviteReply {
                    notice: snapshot
                        .notices
                        .invite_cooldown
                        .replace("{seconds}", &remaining.to_string()),
                    admitted: false,
                };
            }
            state.cooldown_until = None;
        }

        let code = text.trim();
        let valid = snapshot
            .security
            .invite_codes
            .iter()
            .any(|c| !c.is_empty() && c.expose() == code);

        if valid {
            *state = InviteState::default();
            drop(state);
            if let Err(e) = self.settings.update(|s| {
                if let Some(tg) = channel_allow_list_mut(s, channel) {
                    if !tg.contains(&sender_id.to_string()) {
                        tg.push(sender_id.to_string());
                    }
                }
            }) {
                warn!(channel, sender = sender_id, error = %e, "failed to persist admission");
            }
            info!(channel, sender = sender_id, "invite code redeemed, user admitted");
            return Admission::InviteReply {
                notice: snapshot.notices.invite_success.clone(),
                admitted: true,
            };
        }

        // Failed attempt. Reset the window if the previous one expired.
        match state.window_start {
            Some(start) if now - start <= Duration::seconds(FAILURE_WINDOW_SECS) => {}
            _ => {
                state.window_start = Some(now);
                state.failures = 0;
            }
        }
        state.failures += 1;

        if state.failures >= INVITE_MAX_FAILED_ATTEMPTS {
            state.failures = 0;
            state.window_start = None;
            state.cooldown_until = Some(now + Duration::seconds(INVITE_COOLDOWN_SECS));
            return Admission::InviteReply {
                notice: snapshot
                    .notices
                    .invite_cooldown
                    .replace("{seconds}", &INVITE_COOLDOWN_SECS.to_string()),
                admitted: false,
            };
        }

        Admission::InviteReply {
            notice: snapshot.notices.invite_failure.clone(),
            admitted: false,
        }
    }

    fn allow_list(&self, channel: &str) -> Vec<String> {
        let snapshot = self.settings.snapshot();
        match channel {
            "telegram" => snapshot
                .channels
                .telegram
                .as_ref()
                .map(|t| t.allow_list.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

fn channel_allow_list_mut<'a>(
    settings: &'a mut minder_core::Settings,
    channel: &str,
) -> Option<&'a mut Vec<String>> {
    match channel {
        "telegram" => settings.channels.telegram.as_mut().map(|t| &mut t.allow_list),
        _ => None,
    }
}

/// Allow-list matching: `"*"` allows everyone, entries match the username
/// (with or without a leading `@`) or the platform sender id. Empty list
/// matches nobody.
fn is_allowed(allow: &[String], username: &str, sender_id: &str) -> bool {
    allow.iter().any(|entry| {
        let entry = entry.trim_start_matches('@');
        entry == "*" || (!username.is_empty() && entry == username) || entry == sender_id
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use minder_core::settings::{SecretString, Settings, TelegramSettings};
    use minder_core::ManualClock;

    fn telegram_settings(allow: Vec<&str>, codes: Vec<&str>) -> Settings {
        let mut settings = Settings::default();
        settings.channels.telegram = Some(TelegramSettings {
            bot_token: SecretString::new("t"),
            allow_list: allow.into_iter().map(String::from).collect(),
            chunk_limit: 3800,
            transport_max: 4096,
            poll_timeout_secs: 25,
        });
        settings.security.invite_codes =
            codes.into_iter().map(SecretString::new).collect();
        settings
    }

    fn service(settings: Settings, clock: ManualClock) -> AdmissionService {
        AdmissionService::new(
            Arc::new(SettingsStore::new(settings, None)),
            Arc::new(clock),
        )
    }

    #[test]
    fn allow_list_matching_rules() {
        assert!(!is_allowed(&[], "alice", "1"));
        assert!(is_allowed(&["*".into()], "anyone", "9"));
        assert!(is_allowed(&["@alice".into()], "alice", "1"));
        assert!(is_allowed(&["12345".into()], "", "12345"));
        assert!(!is_allowed(&["alice".into()], "bob", "2"));
    }

    #[test]
    fn allowed_sender_is_authorized() {
        let svc = service(
            telegram_settings(vec!["alice"], vec!["CODE"]),
            ManualClock::new(Utc::now()),
        );
        assert_eq!(svc.admit("telegram", "1", "alice", "hi"), Admission::Authorized);
    }

    #[test]
    fn nonempty_allow_list_denies_strangers() {
        let svc = service(
            telegram_settings(vec!["alice"], vec!["CODE"]),
            ManualClock::new(Utc::now()),
        );
        assert!(matches!(
            svc.admit("telegram", "2", "bob", "CODE"),
            Admission::Denied { .. }
        ));
    }

    #[test]
    fn valid_code_admits_and_persists() {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(SettingsStore::new(
            telegram_settings(vec![], vec!["CODE"]),
            None,
        ));
        let svc = AdmissionService::new(store.clone(), Arc::new(clock));

        let result = svc.admit("telegram", "7", "carol", "CODE");
        assert!(matches!(result, Admission::InviteReply { admitted: true, .. }));

        // Admission is persisted: the next message is authorized.
        assert_eq!(svc.admit("telegram", "7", "carol", "hi"), Admission::Authorized);
        assert!(store
            .snapshot()
            .channels
            .telegram
            .as_ref()
            .unwrap()
            .allow_list
            .contains(&"7".to_string()));
    }

    #[test]
    fn three_failures_start_cooldown_with_exact_remaining_seconds() {
        let clock = ManualClock::new(Utc::now());
        let svc = service(telegram_settings(vec![], vec!["CODE"]), clock.clone());

        for _ in 0..2 {
            assert!(matches!(
                svc.admit("telegram", "9", "dave", "wrong"),
                Admission::InviteReply { admitted: false, .. }
            ));
        }
        // Third failure triggers the cooldown notice.
        let third = svc.admit("telegram", "9", "dave", "wrong");
        match third {
            Admission::InviteReply { notice, admitted } => {
                assert!(!admitted);
                assert!(notice.contains("30s"), "notice was: {notice}");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Fourth attempt 12s later reports the remaining 18s.
        clock.advance(Duration::seconds(12));
        let fourth = svc.admit("telegram", "9", "dave", "wrong");
        match fourth {
            Admission::InviteReply { notice, .. } => {
                assert!(notice.contains("18s"), "notice was: {notice}");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // A valid code during cooldown is still rejected.
        let during = svc.admit("telegram", "9", "dave", "CODE");
        match during {
            Admission::InviteReply { admitted, notice } => {
                assert!(!admitted);
                assert!(notice.contains("18s"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // After the cooldown lapses the code works.
        clock.advance(Duration::seconds(30));
        let after = svc.admit("telegram", "9", "dave", "CODE");
        assert!(matches!(after, Admission::InviteReply { admitted: true, .. }));
    }

    #[test]
    fn cooldown_is_scoped_to_the_failing_user() {
        let clock = ManualClock::new(Utc::now());
        let svc = service(telegram_settings(vec![], vec!["CODE"]), clock);

        for _ in 0..3 {
            svc.admit("telegram", "9", "dave", "wrong");
        }
        // Another sender is unaffected by dave's cooldown.
        let other = svc.admit("telegram", "10", "erin", "CODE");
        assert!(matches!(other, Admission::InviteReply { admitted: true, .. }));
    }

    #[test]
    fn failure_window_expiry_resets_counter() {
        let clock = ManualClock::new(Utc::now());
        let svc = service(telegram_settings(vec![], vec!["CODE"]), clock.clone());

        svc.admit("telegram", "9", "dave", "wrong");
        svc.admit("telegram", "9", "dave", "wrong");
        // Window lapses; the next two failures should not trigger cooldown.
        clock.advance(Duration::seconds(90));
        svc.admit("telegram", "9", "dave", "wrong");
        let result = svc.admit("telegram", "9", "dave", "wrong");
        assert!(matches!(
            result,
            Admission::InviteReply { admitted: false, .. }
        ));
        // Still no cooldown: a valid code goes straight through.
        let redeem = svc.admit("telegram", "9", "dave", "CODE");
        assert!(matches!(redeem, Admission::InviteReply { admitted: true, .. }));
    }
}
