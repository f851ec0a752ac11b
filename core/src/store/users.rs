//! User profile read model.
//!
//! The identity service owns users; the pipeline only needs the statement
//! timezone per user. Unknown users bill in UTC.

use parking_lot::RwLock;
use std::collections::HashMap;

use chrono_tz::Tz;

pub trait UserDirectory: Send + Sync {
    fn timezone(&self, user_id: &str) -> Option<Tz>;

    fn set_timezone(&self, user_id: &str, timezone: Tz);
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    timezones: RwLock<HashMap<String, Tz>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn timezone(&self, user_id: &str) -> Option<Tz> {
        self.timezones.read().get(user_id).copied()
    }

    fn set_timezone(&self, user_id: &str, timezone: Tz) {
        self.timezones.write().insert(user_id.to_string(), timezone);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_has_no_timezone() {
        let directory = InMemoryUserDirectory::new();
        assert!(directory.timezone("u7").is_none());
        directory.set_timezone("u7", chrono_tz::America::Los_Angeles);
        assert_eq!(directory.timezone("u7"), Some(chrono_tz::America::Los_Angeles));
    }
}
