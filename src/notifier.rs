use crate::email_client::EmailClient;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

static NOTIFIER: Lazy<OperatorNotifier> = Lazy::new(OperatorNotifier::new);

const NOTIFY_COOLDOWN: Duration = Duration::from_secs(900);

pub fn notify_rate_limit(context: &str, detail: &str) {
    NOTIFIER.notify(
        &format!("rate-limit:{}", context),
        &format!("[RateLimit] {}", context),
        &format!(
            "HTTP 429 Too Many Requests detected while {}.\nDetail: {}",
            context, detail
        ),
    );
}

pub fn notify_open_exposure(symbol: &str, detail: &str) {
    NOTIFIER.notify(
        &format!("exposure:{}", symbol),
        &format!("[Exposure] {} entry without brackets", symbol),
        &format!(
            "Bracket placement failed after a market entry on {}.\n\
             The position may still be open on the exchange and is NOT tracked as active.\n\
             Detail: {}",
            symbol, detail
        ),
    );
}

pub fn notify_monitor_error(detail: &str) {
    NOTIFIER.notify(
        "monitor",
        "[Monitor] reconciliation loop error",
        &format!("The reconciliation loop hit an error and will retry.\nDetail: {}", detail),
    );
}

struct OperatorNotifier {
    bot_name: String,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl OperatorNotifier {
    fn new() -> Self {
        let bot_name = std::env::var("BOT_NAME").unwrap_or_default();
        Self {
            bot_name,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    // One mail per key per cooldown window; everything else only logs.
    fn notify(&self, key: &str, subject: &str, body: &str) {
        let now = Instant::now();
        let suppressed = {
            let mut last_sent = self.last_sent.lock().unwrap();
            match last_sent.get(key) {
                Some(prev) if now.duration_since(*prev) < NOTIFY_COOLDOWN => true,
                _ => {
                    last_sent.insert(key.to_string(), now);
                    false
                }
            }
        };

        if suppressed {
            log::debug!("notification '{}' suppressed by cooldown", subject);
            return;
        }

        let subject = if self.bot_name.is_empty() {
            subject.to_string()
        } else {
            format!("[{}] {}", self.bot_name, subject)
        };

        EmailClient::new().send(&subject, body);
        log::warn!("📧 operator notified: {}", subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_suppresses_repeats() {
        let notifier = OperatorNotifier {
            bot_name: String::new(),
            last_sent: Mutex::new(HashMap::new()),
        };

        // first notification registers the key
        notifier.notify("k", "subject", "body");
        assert!(notifier.last_sent.lock().unwrap().contains_key("k"));
        let first = *notifier.last_sent.lock().unwrap().get("k").unwrap();

        // second within the window leaves the timestamp untouched
        notifier.notify("k", "subject", "body");
        let second = *notifier.last_sent.lock().unwrap().get("k").unwrap();
        assert_eq!(first, second);

        // a different key is independent
        notifier.notify("other", "subject", "body");
        assert!(notifier.last_sent.lock().unwrap().contains_key("other"));
    }
}
